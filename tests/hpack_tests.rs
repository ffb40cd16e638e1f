//! HPACK header blocks across a shared dynamic table, cross-checked
//! against an independent implementation

use netbare::http2::hpack::{HpackReader, HpackWriter};
use netbare::http2::huffman;
use netbare::http2::HeaderField;

fn fields(pairs: &[(&str, &str)]) -> Vec<HeaderField> {
    pairs.iter().map(|(n, v)| HeaderField::new(*n, *v)).collect()
}

fn blocks() -> Vec<Vec<(&'static str, &'static str)>> {
    vec![
        vec![
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            (":authority", "www.example.com"),
        ],
        vec![
            (":method", "GET"),
            (":scheme", "http"),
            (":path", "/"),
            (":authority", "www.example.com"),
            ("cache-control", "no-cache"),
        ],
        vec![
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/index.html"),
            (":authority", "www.example.com"),
            ("custom-key", "custom-value"),
        ],
    ]
}

// ============================================================================
// Shared dynamic table
// ============================================================================

#[test]
fn test_three_blocks_share_one_table() {
    let mut writer = HpackWriter::new();
    let mut reader = HpackReader::default();

    let mut sizes = Vec::new();
    for block in blocks() {
        let mut encoded = Vec::new();
        writer.write_headers(&block, &mut encoded);
        sizes.push(encoded.len());
        assert_eq!(reader.read_headers(&encoded).unwrap(), fields(&block));
        assert_eq!(reader.dynamic_table().len(), writer.dynamic_table().len());
        assert_eq!(reader.dynamic_table().size(), writer.dynamic_table().size());
    }
    // The repeated authority is indexed after the first block
    assert!(sizes[1] < sizes[0] + 10);
}

#[test]
fn test_table_size_update_reaches_reader() {
    let mut writer = HpackWriter::new();
    let mut reader = HpackReader::default();
    let all = blocks();
    let first = &all[0];

    let mut encoded = Vec::new();
    writer.write_headers(first, &mut encoded);
    reader.read_headers(&encoded).unwrap();
    assert!(!reader.dynamic_table().is_empty());

    writer.set_header_table_size(0);
    reader.set_header_table_size(0);
    let mut encoded = Vec::new();
    writer.write_headers(first, &mut encoded);
    assert_eq!(reader.read_headers(&encoded).unwrap(), fields(first));
    assert!(reader.dynamic_table().is_empty());
}

#[test]
fn test_uppercase_names_are_lowered() {
    let mut writer = HpackWriter::new();
    let mut reader = HpackReader::default();
    let mut encoded = Vec::new();
    writer.write_headers(&[("Content-Type", "text/html")], &mut encoded);
    assert_eq!(
        reader.read_headers(&encoded).unwrap(),
        fields(&[("content-type", "text/html")])
    );
}

#[test]
fn test_truncated_block_is_rejected() {
    let mut writer = HpackWriter::new().without_huffman();
    let mut encoded = Vec::new();
    writer.write_headers(&[("x-long-header", "some value here")], &mut encoded);
    encoded.truncate(encoded.len() - 3);
    assert!(HpackReader::default().read_headers(&encoded).is_err());
}

// ============================================================================
// Interop with the `hpack` crate
// ============================================================================

#[test]
fn test_reference_decoder_reads_our_blocks() {
    let mut writer = HpackWriter::new();
    let mut decoder = hpack::Decoder::new();
    for block in blocks() {
        let mut encoded = Vec::new();
        writer.write_headers(&block, &mut encoded);
        let decoded = decoder.decode(&encoded).unwrap();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = block
            .iter()
            .map(|(n, v)| (n.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect();
        assert_eq!(decoded, expected);
    }
}

#[test]
fn test_we_read_reference_encoder_blocks() {
    let mut encoder = hpack::Encoder::new();
    let mut reader = HpackReader::default();
    for block in blocks() {
        let encoded = encoder.encode(block.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())));
        assert_eq!(reader.read_headers(&encoded).unwrap(), fields(&block));
    }
}

// ============================================================================
// Huffman
// ============================================================================

#[test]
fn test_huffman_known_vector() {
    // RFC 7541 C.4.1
    let mut out = Vec::new();
    huffman::encode(b"www.example.com", &mut out);
    assert_eq!(
        out,
        vec![0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff]
    );
    assert_eq!(huffman::encoded_len(b"www.example.com"), out.len());
    assert_eq!(huffman::decode(&out).unwrap(), b"www.example.com".to_vec());
}
