//! Canonical Huffman code used by HPACK string literals (RFC 7541 Appendix B)

use crate::http2::hpack::HpackError;
use lazy_static::lazy_static;

/// Huffman codes for each octet (RFC 7541 Appendix B).
const CODES: [u32; 256] = [
    0x1ff8, 0x7fffd8, 0xfffffe2, 0xfffffe3, 0xfffffe4, 0xfffffe5,
    0xfffffe6, 0xfffffe7, 0xfffffe8, 0xffffea, 0x3ffffffc, 0xfffffe9,
    0xfffffea, 0x3ffffffd, 0xfffffeb, 0xfffffec, 0xfffffed, 0xfffffee,
    0xfffffef, 0xffffff0, 0xffffff1, 0xffffff2, 0x3ffffffe, 0xffffff3,
    0xffffff4, 0xffffff5, 0xffffff6, 0xffffff7, 0xffffff8, 0xffffff9,
    0xffffffa, 0xffffffb, 0x14, 0x3f8, 0x3f9, 0xffa,
    0x1ff9, 0x15, 0xf8, 0x7fa, 0x3fa, 0x3fb,
    0xf9, 0x7fb, 0xfa, 0x16, 0x17, 0x18,
    0x0, 0x1, 0x2, 0x19, 0x1a, 0x1b,
    0x1c, 0x1d, 0x1e, 0x1f, 0x5c, 0xfb,
    0x7ffc, 0x20, 0xffb, 0x3fc, 0x1ffa, 0x21,
    0x5d, 0x5e, 0x5f, 0x60, 0x61, 0x62,
    0x63, 0x64, 0x65, 0x66, 0x67, 0x68,
    0x69, 0x6a, 0x6b, 0x6c, 0x6d, 0x6e,
    0x6f, 0x70, 0x71, 0x72, 0xfc, 0x73,
    0xfd, 0x1ffb, 0x7fff0, 0x1ffc, 0x3ffc, 0x22,
    0x7ffd, 0x3, 0x23, 0x4, 0x24, 0x5,
    0x25, 0x26, 0x27, 0x6, 0x74, 0x75,
    0x28, 0x29, 0x2a, 0x7, 0x2b, 0x76,
    0x2c, 0x8, 0x9, 0x2d, 0x77, 0x78,
    0x79, 0x7a, 0x7b, 0x7ffe, 0x7fc, 0x3ffd,
    0x1ffd, 0xffffffc, 0xfffe6, 0x3fffd2, 0xfffe7, 0xfffe8,
    0x3fffd3, 0x3fffd4, 0x3fffd5, 0x7fffd9, 0x3fffd6, 0x7fffda,
    0x7fffdb, 0x7fffdc, 0x7fffdd, 0x7fffde, 0xffffeb, 0x7fffdf,
    0xffffec, 0xffffed, 0x3fffd7, 0x7fffe0, 0xffffee, 0x7fffe1,
    0x7fffe2, 0x7fffe3, 0x7fffe4, 0x1fffdc, 0x3fffd8, 0x7fffe5,
    0x3fffd9, 0x7fffe6, 0x7fffe7, 0xffffef, 0x3fffda, 0x1fffdd,
    0xfffe9, 0x3fffdb, 0x3fffdc, 0x7fffe8, 0x7fffe9, 0x1fffde,
    0x7fffea, 0x3fffdd, 0x3fffde, 0xfffff0, 0x1fffdf, 0x3fffdf,
    0x7fffeb, 0x7fffec, 0x1fffe0, 0x1fffe1, 0x3fffe0, 0x1fffe2,
    0x7fffed, 0x3fffe1, 0x7fffee, 0x7fffef, 0xfffea, 0x3fffe2,
    0x3fffe3, 0x3fffe4, 0x7ffff0, 0x3fffe5, 0x3fffe6, 0x7ffff1,
    0x3ffffe0, 0x3ffffe1, 0xfffeb, 0x7fff1, 0x3fffe7, 0x7ffff2,
    0x3fffe8, 0x1ffffec, 0x3ffffe2, 0x3ffffe3, 0x3ffffe4, 0x7ffffde,
    0x7ffffdf, 0x3ffffe5, 0xfffff1, 0x1ffffed, 0x7fff2, 0x1fffe3,
    0x3ffffe6, 0x7ffffe0, 0x7ffffe1, 0x3ffffe7, 0x7ffffe2, 0xfffff2,
    0x1fffe4, 0x1fffe5, 0x3ffffe8, 0x3ffffe9, 0xffffffd, 0x7ffffe3,
    0x7ffffe4, 0x7ffffe5, 0xfffec, 0xfffff3, 0xfffed, 0x1fffe6,
    0x3fffe9, 0x1fffe7, 0x1fffe8, 0x7ffff3, 0x3fffea, 0x3fffeb,
    0x1ffffee, 0x1ffffef, 0xfffff4, 0xfffff5, 0x3ffffea, 0x7ffff4,
    0x3ffffeb, 0x7ffffe6, 0x3ffffec, 0x3ffffed, 0x7ffffe7, 0x7ffffe8,
    0x7ffffe9, 0x7ffffea, 0x7ffffeb, 0xffffffe, 0x7ffffec, 0x7ffffed,
    0x7ffffee, 0x7ffffef, 0x7fffff0, 0x3ffffee,
];

/// Bit lengths of the codes in [`CODES`].
const CODE_LENGTHS: [u8; 256] = [
    13, 23, 28, 28, 28, 28, 28, 28, 28, 24, 30, 28, 28, 30, 28, 28,
    28, 28, 28, 28, 28, 28, 30, 28, 28, 28, 28, 28, 28, 28, 28, 28,
    6, 10, 10, 12, 13, 6, 8, 11, 10, 10, 8, 11, 8, 6, 6, 6,
    5, 5, 5, 6, 6, 6, 6, 6, 6, 6, 7, 8, 15, 6, 12, 10,
    13, 6, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7,
    7, 7, 7, 7, 7, 7, 7, 7, 8, 7, 8, 13, 19, 13, 14, 6,
    15, 5, 6, 5, 6, 5, 6, 6, 6, 5, 7, 7, 6, 6, 6, 5,
    6, 7, 6, 5, 5, 6, 7, 7, 7, 7, 7, 15, 11, 14, 13, 28,
    20, 22, 20, 20, 22, 22, 22, 23, 22, 23, 23, 23, 23, 23, 24, 23,
    24, 24, 22, 23, 24, 23, 23, 23, 23, 21, 22, 23, 22, 23, 23, 24,
    22, 21, 20, 22, 22, 23, 23, 21, 23, 22, 22, 24, 21, 22, 23, 23,
    21, 21, 22, 21, 23, 22, 23, 23, 20, 22, 22, 22, 23, 22, 22, 23,
    26, 26, 20, 19, 22, 23, 22, 25, 26, 26, 26, 27, 27, 26, 24, 25,
    19, 21, 26, 27, 27, 26, 27, 24, 21, 21, 26, 26, 28, 27, 27, 27,
    20, 24, 20, 21, 22, 21, 21, 23, 22, 22, 25, 25, 24, 24, 26, 23,
    26, 27, 26, 26, 27, 27, 27, 27, 27, 28, 27, 27, 27, 27, 27, 26,
];

lazy_static! {
    /// Binary decoding tree. Each node holds its two children: `0` for a missing
    /// branch, a positive node index, or `-(symbol + 1)` for a leaf.
    static ref DECODE_TREE: Vec<[i32; 2]> = build_tree();
}

fn build_tree() -> Vec<[i32; 2]> {
    let mut nodes: Vec<[i32; 2]> = vec![[0, 0]];
    for (symbol, (&code, &len)) in CODES.iter().zip(CODE_LENGTHS.iter()).enumerate() {
        let mut current = 0usize;
        for shift in (0..len).rev() {
            let bit = ((code >> shift) & 1) as usize;
            if shift == 0 {
                nodes[current][bit] = -(symbol as i32 + 1);
                break;
            }
            let next = nodes[current][bit];
            if next > 0 {
                current = next as usize;
            } else {
                nodes.push([0, 0]);
                let index = nodes.len() - 1;
                nodes[current][bit] = index as i32;
                current = index;
            }
        }
    }
    nodes
}

/// Number of bytes `data` occupies once Huffman encoded.
pub fn encoded_len(data: &[u8]) -> usize {
    let bits: usize = data
        .iter()
        .map(|&b| CODE_LENGTHS[b as usize] as usize)
        .sum();
    (bits + 7) / 8
}

/// Huffman encode `data` into `out`, padding the last octet with 1 bits.
pub fn encode(data: &[u8], out: &mut Vec<u8>) {
    let mut current: u64 = 0;
    let mut bits: u32 = 0;

    for &b in data {
        let len = CODE_LENGTHS[b as usize] as u32;
        current = (current << len) | CODES[b as usize] as u64;
        bits += len;

        while bits >= 8 {
            bits -= 8;
            out.push((current >> bits) as u8);
        }
        current &= (1u64 << bits) - 1;
    }

    if bits > 0 {
        let pad = 8 - bits;
        current = (current << pad) | ((1u64 << pad) - 1);
        out.push(current as u8);
    }
}

/// Decode a Huffman encoded string literal.
///
/// Trailing bits must be a strict prefix of EOS (at most 7 one bits); a
/// complete EOS symbol or zero padding is rejected.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, HpackError> {
    let tree = &*DECODE_TREE;
    let mut out = Vec::with_capacity(input.len() * 8 / 5);
    let mut node = 0usize;
    let mut depth = 0u8;
    let mut all_ones = true;

    for &byte in input {
        for shift in (0..8).rev() {
            let bit = ((byte >> shift) & 1) as usize;
            depth += 1;
            all_ones &= bit == 1;
            match tree[node][bit] {
                0 => return Err(HpackError::InvalidHuffman),
                next if next < 0 => {
                    out.push((-next - 1) as u8);
                    node = 0;
                    depth = 0;
                    all_ones = true;
                }
                next => node = next as usize,
            }
        }
    }

    if depth > 7 || !all_ones {
        return Err(HpackError::InvalidHuffman);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: RFC 7541 C.4.1 literal "www.example.com"
    #[test]
    fn test_encode_rfc_example() {
        let mut out = Vec::new();
        encode(b"www.example.com", &mut out);
        assert_eq!(
            out,
            [0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff]
        );
        assert_eq!(encoded_len(b"www.example.com"), 12);
    }

    /// Test: RFC 7541 C.4.2 literal "no-cache"
    #[test]
    fn test_decode_rfc_example() {
        let decoded = decode(&[0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf]).unwrap();
        assert_eq!(decoded, b"no-cache");
    }

    /// Test: every octet value survives encode/decode
    #[test]
    fn test_all_octets() {
        let data: Vec<u8> = (0..=255u8).collect();
        let mut out = Vec::new();
        encode(&data, &mut out);
        assert_eq!(out.len(), encoded_len(&data));
        assert_eq!(decode(&out).unwrap(), data);
    }

    /// Test: zero padding is not a valid EOS prefix
    #[test]
    fn test_rejects_zero_padding() {
        // '0' is 00000, followed by three 0 bits instead of 1s
        assert_eq!(decode(&[0x00]), Err(HpackError::InvalidHuffman));
        // Same symbol with proper padding
        assert_eq!(decode(&[0x07]).unwrap(), b"0");
    }

    /// Test: a full EOS sequence is rejected
    #[test]
    fn test_rejects_eos() {
        assert_eq!(
            decode(&[0xff, 0xff, 0xff, 0xff]),
            Err(HpackError::InvalidHuffman)
        );
    }

    #[test]
    fn test_empty() {
        assert!(decode(&[]).unwrap().is_empty());
        let mut out = Vec::new();
        encode(b"", &mut out);
        assert!(out.is_empty());
    }
}
