//! TLS record sniffing and ClientHello inspection

use tracing::warn;

pub const CONTENT_TYPE_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_TYPE_ALERT: u8 = 21;
pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;
pub const CONTENT_TYPE_APPLICATION_DATA: u8 = 23;
pub const CONTENT_TYPE_HEARTBEAT: u8 = 24;

const RECORD_HEADER_LENGTH: usize = 5;

/// Fixed ClientHello prefix: record header (5), handshake header (4),
/// client version (2) and random (32)
const CLIENT_HELLO_FIXED_LENGTH: usize = 43;

const EXTENSION_SERVER_NAME: u16 = 0x0000;
const EXTENSION_ALPN: u16 = 0x0010;

/// Result of `verify_packet`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Too short to decide, or the first record is incomplete
    NotEnough,
    /// Not a TLS/SSL record
    NotEncrypted,
    /// A complete record of the given length is available
    Ssl(usize),
}

/// Is `byte` one of the TLS record content types
pub fn is_tls_content_type(byte: u8) -> bool {
    (CONTENT_TYPE_CHANGE_CIPHER_SPEC..=CONTENT_TYPE_HEARTBEAT).contains(&byte)
}

/// Classify the start of `data` as TLS (SSLv3+), SSLv2 or plaintext
pub fn verify_packet(data: &[u8]) -> PacketStatus {
    if data.len() < RECORD_HEADER_LENGTH {
        return PacketStatus::NotEnough;
    }

    let mut packet_length = 0;
    let mut tls = is_tls_content_type(data[0]);
    if tls {
        if data[1] == 3 {
            packet_length =
                u16::from_be_bytes([data[3], data[4]]) as usize + RECORD_HEADER_LENGTH;
            if packet_length <= RECORD_HEADER_LENGTH {
                tls = false;
            }
        } else {
            tls = false;
        }
    }

    if !tls {
        // SSLv2 or bad data
        let header_length = if data[0] & 0x80 != 0 { 2 } else { 3 };
        let major = data[header_length + 1];
        if major != 2 && major != 3 {
            return PacketStatus::NotEncrypted;
        }
        let raw = u16::from_be_bytes([data[0], data[1]]) as usize;
        packet_length = if header_length == 2 {
            (raw & 0x7fff) + 2
        } else {
            (raw & 0x3fff) + 3
        };
        if packet_length <= header_length {
            return PacketStatus::NotEnough;
        }
    }

    if packet_length > data.len() {
        return PacketStatus::NotEnough;
    }
    PacketStatus::Ssl(packet_length)
}

/// Fields of interest in a ClientHello record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub server_name: Option<String>,
    pub alpn: Vec<Vec<u8>>,
}

/// Parse SNI and ALPN out of the first record of `data`.
///
/// Returns `None` when `data` does not start with a handshake record or the
/// record is truncated before the extensions.
pub fn parse_client_hello(data: &[u8]) -> Option<ClientHello> {
    if data.len() <= CLIENT_HELLO_FIXED_LENGTH || data[0] != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let limit = data.len();
    let mut offset = CLIENT_HELLO_FIXED_LENGTH;

    let session_id_length = *data.get(offset)? as usize;
    offset += 1 + session_id_length;

    let cipher_suites_length = read_u16(data, offset)? as usize;
    offset += 2 + cipher_suites_length;

    let compression_length = *data.get(offset)? as usize;
    offset += 1 + compression_length;

    let extensions_length = read_u16(data, offset)? as usize;
    offset += 2;
    if offset + extensions_length > limit {
        warn!("ClientHello extensions truncated");
        return None;
    }

    let mut hello = ClientHello::default();
    let end = offset + extensions_length;
    while offset + 4 <= end {
        let kind = read_u16(data, offset)?;
        let length = read_u16(data, offset + 2)? as usize;
        offset += 4;
        let body = data.get(offset..offset + length)?;
        match kind {
            EXTENSION_SERVER_NAME => hello.server_name = parse_server_name(body),
            EXTENSION_ALPN => hello.alpn = parse_alpn(body),
            _ => {}
        }
        offset += length;
    }
    Some(hello)
}

/// SNI of a ClientHello record, if any
pub fn parse_sni(data: &[u8]) -> Option<String> {
    parse_client_hello(data)?.server_name
}

fn parse_server_name(body: &[u8]) -> Option<String> {
    // list length (2), name type (1), name length (2)
    if body.len() <= 5 || body[2] != 0 {
        return None;
    }
    let length = read_u16(body, 3)? as usize;
    let name = body.get(5..5 + length)?;
    String::from_utf8(name.to_vec()).ok()
}

fn parse_alpn(body: &[u8]) -> Vec<Vec<u8>> {
    let mut protocols = Vec::new();
    let list_length = match read_u16(body, 0) {
        Some(length) => length as usize,
        None => return protocols,
    };
    let end = (2 + list_length).min(body.len());
    let mut offset = 2;
    while offset < end {
        let length = body[offset] as usize;
        offset += 1;
        match body.get(offset..offset + length) {
            Some(protocol) if offset + length <= end => protocols.push(protocol.to_vec()),
            _ => break,
        }
        offset += length;
    }
    protocols
}

fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
