//! HPACK header compression (RFC 7541)
//!
//! - [`HpackReader`] decodes header blocks against a per-direction dynamic table
//! - [`HpackWriter`] encodes header lists, indexing what it can and inserting
//!   literals into its own dynamic table
//!
//! Both sides evict from the oldest end of a byte-bounded [`DynamicTable`].

use crate::http2::huffman;
use lazy_static::lazy_static;
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Default SETTINGS_HEADER_TABLE_SIZE
pub const DEFAULT_HEADER_TABLE_SIZE: usize = 4096;

/// The writer never grows its table beyond this, whatever the peer allows
pub const SETTINGS_HEADER_TABLE_SIZE_LIMIT: usize = 16384;

/// Per-entry overhead used for table size accounting
pub const ENTRY_OVERHEAD: usize = 32;

/// RFC 7541 Appendix A
pub const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

lazy_static! {
    /// Name to the zero-based position of its first static table entry
    static ref NAME_TO_FIRST_INDEX: HashMap<&'static str, usize> = {
        let mut map = HashMap::with_capacity(STATIC_TABLE.len());
        for (i, (name, _)) in STATIC_TABLE.iter().enumerate() {
            map.entry(*name).or_insert(i);
        }
        map
    };
}

/// HPACK decoding errors. All of them are protocol violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HpackError {
    /// Index 0 is never valid
    #[error("Illegal header index 0")]
    ZeroIndex,

    /// Index points past the static and dynamic tables
    #[error("Header index too large: {0}")]
    IndexOutOfRange(usize),

    /// A literal header name contained uppercase characters
    #[error("Mixed case header name: {0}")]
    UppercaseName(String),

    /// Dynamic table size update above the agreed setting
    #[error("Dynamic table size update {0} exceeds the limit {1}")]
    TableSizeExceeded(usize, usize),

    /// String literal length runs past the block
    #[error("String length {0} exceeds remaining {1} bytes")]
    StringTooLong(usize, usize),

    /// Variable-length integer does not fit
    #[error("Integer overflow")]
    IntegerOverflow,

    /// Block ended in the middle of an instruction
    #[error("Truncated header block")]
    Truncated,

    /// Huffman string with a bad code or padding
    #[error("Invalid Huffman code")]
    InvalidHuffman,
}

/// A name/value pair as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Size counted against the dynamic table
    pub fn size(&self) -> usize {
        ENTRY_OVERHEAD + self.name.len() + self.value.len()
    }
}

/// Byte-bounded dynamic table, newest entry at the front
#[derive(Debug)]
pub struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current accounted size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Entry by position, 0 being the most recently inserted
    pub fn get(&self, position: usize) -> Option<&HeaderField> {
        self.entries.get(position)
    }

    /// Insert an entry, evicting the oldest ones until it fits.
    ///
    /// An entry larger than the whole table empties it and is not stored.
    pub fn insert(&mut self, field: HeaderField) {
        let cost = field.size();
        if cost > self.max_size {
            self.clear();
            return;
        }
        self.evict_to(self.max_size - cost);
        self.size += cost;
        self.entries.push_front(field);
    }

    /// Change the maximum size, evicting as needed
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        if max_size == 0 {
            self.clear();
        } else {
            self.evict_to(max_size);
        }
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            match self.entries.pop_back() {
                Some(evicted) => self.size -= evicted.size(),
                None => {
                    self.size = 0;
                    break;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.size = 0;
    }

    fn iter(&self) -> impl Iterator<Item = &HeaderField> {
        self.entries.iter()
    }
}

/// Header block decoder
#[derive(Debug)]
pub struct HpackReader {
    table: DynamicTable,
    header_table_size_setting: usize,
}

impl Default for HpackReader {
    fn default() -> Self {
        Self::new(DEFAULT_HEADER_TABLE_SIZE)
    }
}

impl HpackReader {
    pub fn new(header_table_size_setting: usize) -> Self {
        Self {
            table: DynamicTable::new(header_table_size_setting),
            header_table_size_setting,
        }
    }

    /// Apply a SETTINGS_HEADER_TABLE_SIZE advertised by the decoding side,
    /// capped at [`SETTINGS_HEADER_TABLE_SIZE_LIMIT`]
    pub fn set_header_table_size(&mut self, size: usize) {
        let size = size.min(SETTINGS_HEADER_TABLE_SIZE_LIMIT);
        self.header_table_size_setting = size;
        self.table.set_max_size(size);
    }

    pub fn header_table_size(&self) -> usize {
        self.header_table_size_setting
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.table
    }

    /// Decode one complete header block
    pub fn read_headers(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut cursor = Cursor { data: block, pos: 0 };
        let mut headers = Vec::new();

        while let Some(b) = cursor.peek() {
            if b == 0x80 {
                return Err(HpackError::ZeroIndex);
            } else if b & 0x80 == 0x80 {
                // Indexed header field
                let index = cursor.read_int(7)?;
                headers.push(self.field_at(index)?);
            } else if b == 0x40 {
                // Literal with incremental indexing, new name
                cursor.advance();
                let name = check_lowercase(cursor.read_string()?)?;
                let value = cursor.read_string()?;
                let field = HeaderField { name, value };
                self.table.insert(field.clone());
                headers.push(field);
            } else if b & 0x40 == 0x40 {
                // Literal with incremental indexing, indexed name
                let index = cursor.read_int(6)?;
                let name = self.field_at(index)?.name;
                let value = cursor.read_string()?;
                let field = HeaderField { name, value };
                self.table.insert(field.clone());
                headers.push(field);
            } else if b & 0x20 == 0x20 {
                let size = cursor.read_int(5)?;
                if size > self.header_table_size_setting {
                    return Err(HpackError::TableSizeExceeded(
                        size,
                        self.header_table_size_setting,
                    ));
                }
                self.table.set_max_size(size);
            } else if b == 0x10 || b == 0x00 {
                // Literal without indexing or never indexed, new name
                cursor.advance();
                let name = check_lowercase(cursor.read_string()?)?;
                let value = cursor.read_string()?;
                headers.push(HeaderField { name, value });
            } else {
                // Literal without indexing or never indexed, indexed name
                let index = cursor.read_int(4)?;
                let name = self.field_at(index)?.name;
                let value = cursor.read_string()?;
                headers.push(HeaderField { name, value });
            }
        }

        Ok(headers)
    }

    fn field_at(&self, index: usize) -> Result<HeaderField, HpackError> {
        if index == 0 {
            return Err(HpackError::ZeroIndex);
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok(HeaderField::new(name, value));
        }
        self.table
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or(HpackError::IndexOutOfRange(index))
    }
}

fn check_lowercase(name: Vec<u8>) -> Result<Vec<u8>, HpackError> {
    if name.iter().any(|b| b.is_ascii_uppercase()) {
        return Err(HpackError::UppercaseName(
            String::from_utf8_lossy(&name).into_owned(),
        ));
    }
    Ok(name)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn next_byte(&mut self) -> Result<u8, HpackError> {
        let b = self.peek().ok_or(HpackError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn read_int(&mut self, prefix_bits: u8) -> Result<usize, HpackError> {
        let mask = (1usize << prefix_bits) - 1;
        let first = self.next_byte()? as usize & mask;
        if first < mask {
            return Ok(first);
        }

        let mut value = mask;
        let mut shift = 0u32;
        loop {
            let b = self.next_byte()?;
            if shift > 28 {
                return Err(HpackError::IntegerOverflow);
            }
            value = value
                .checked_add(((b & 0x7f) as usize) << shift)
                .ok_or(HpackError::IntegerOverflow)?;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn read_string(&mut self) -> Result<Vec<u8>, HpackError> {
        let huffman_coded = self.peek().ok_or(HpackError::Truncated)? & 0x80 == 0x80;
        let len = self.read_int(7)?;
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(HpackError::StringTooLong(len, remaining));
        }
        let raw = &self.data[self.pos..self.pos + len];
        self.pos += len;
        if huffman_coded {
            huffman::decode(raw)
        } else {
            Ok(raw.to_vec())
        }
    }
}

/// Headers the writer never forwards to an HTTP/2 peer
const CONNECTION_SPECIFIC_HEADERS: [&str; 8] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "encoding",
    "upgrade",
];

/// Header list encoder
#[derive(Debug)]
pub struct HpackWriter {
    table: DynamicTable,
    header_table_size_setting: usize,
    smallest_size_pending: usize,
    emit_size_update: bool,
    use_huffman: bool,
}

impl Default for HpackWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackWriter {
    pub fn new() -> Self {
        Self {
            table: DynamicTable::new(DEFAULT_HEADER_TABLE_SIZE),
            header_table_size_setting: DEFAULT_HEADER_TABLE_SIZE,
            smallest_size_pending: usize::MAX,
            emit_size_update: false,
            use_huffman: true,
        }
    }

    /// Disable Huffman coding of string literals
    pub fn without_huffman(mut self) -> Self {
        self.use_huffman = false;
        self
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE.
    ///
    /// The change is announced with a size update at the start of the next block.
    pub fn set_header_table_size(&mut self, setting: usize) {
        let effective = setting.min(SETTINGS_HEADER_TABLE_SIZE_LIMIT);
        if self.header_table_size_setting == effective {
            return;
        }
        if effective < self.header_table_size_setting {
            self.smallest_size_pending = self.smallest_size_pending.min(effective);
        }
        self.emit_size_update = true;
        self.header_table_size_setting = effective;
        self.table.set_max_size(effective);
    }

    pub fn dynamic_table(&self) -> &DynamicTable {
        &self.table
    }

    /// Encode a header list into one block
    pub fn write_headers<N, V>(&mut self, headers: &[(N, V)], out: &mut Vec<u8>)
    where
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        if self.emit_size_update {
            if self.smallest_size_pending < self.table.max_size() {
                write_int(self.smallest_size_pending, 0x1f, 0x20, out);
            }
            self.emit_size_update = false;
            self.smallest_size_pending = usize::MAX;
            write_int(self.table.max_size(), 0x1f, 0x20, out);
        }

        for (name, value) in headers {
            let name = name.as_ref().to_ascii_lowercase();
            let value = value.as_ref();
            self.write_header(name, value, out);
        }
    }

    /// Encode request pseudo-headers followed by the regular headers
    pub fn write_request_headers<N, V>(
        &mut self,
        method: &str,
        path: &str,
        authority: Option<&str>,
        scheme: &str,
        headers: &[(N, V)],
        out: &mut Vec<u8>,
    ) where
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut list: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 4);
        list.push((b":method".to_vec(), method.as_bytes().to_vec()));
        list.push((b":path".to_vec(), path.as_bytes().to_vec()));
        if let Some(authority) = authority {
            list.push((b":authority".to_vec(), authority.as_bytes().to_vec()));
        }
        list.push((b":scheme".to_vec(), scheme.as_bytes().to_vec()));
        list.extend(regular_headers(headers));
        self.write_headers(&list, out);
    }

    /// Encode the `:status` pseudo-header followed by the regular headers
    pub fn write_response_headers<N, V>(
        &mut self,
        code: u16,
        headers: &[(N, V)],
        out: &mut Vec<u8>,
    ) where
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut list: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(headers.len() + 1);
        list.push((b":status".to_vec(), code.to_string().into_bytes()));
        list.extend(regular_headers(headers));
        self.write_headers(&list, out);
    }

    fn write_header(&mut self, name: Vec<u8>, value: &[u8], out: &mut Vec<u8>) {
        let mut header_index = None;
        let mut name_index = None;

        if let Some(&first) = std::str::from_utf8(&name)
            .ok()
            .and_then(|n| NAME_TO_FIRST_INDEX.get(n))
        {
            name_index = Some(first + 1);
            // :method, :path and :scheme have two static values each
            if (2..=7).contains(&(first + 1)) {
                if STATIC_TABLE[first].1.as_bytes() == value {
                    header_index = Some(first + 1);
                } else if STATIC_TABLE[first + 1].1.as_bytes() == value {
                    header_index = Some(first + 2);
                }
            }
        }

        if header_index.is_none() {
            for (position, entry) in self.table.iter().enumerate() {
                if entry.name == name {
                    let index = STATIC_TABLE.len() + 1 + position;
                    if entry.value == value {
                        header_index = Some(index);
                        break;
                    } else if name_index.is_none() {
                        name_index = Some(index);
                    }
                }
            }
        }

        match (header_index, name_index) {
            (Some(index), _) => write_int(index, 0x7f, 0x80, out),
            (None, None) => {
                out.push(0x40);
                self.write_string(&name, out);
                self.write_string(value, out);
                self.table.insert(HeaderField::new(name, value));
            }
            (None, Some(index)) if name.starts_with(b":") && name != b":authority" => {
                // Pseudo-headers other than :authority are not worth indexing
                write_int(index, 0x0f, 0x00, out);
                self.write_string(value, out);
            }
            (None, Some(index)) => {
                write_int(index, 0x3f, 0x40, out);
                self.write_string(value, out);
                self.table.insert(HeaderField::new(name, value));
            }
        }
    }

    fn write_string(&self, data: &[u8], out: &mut Vec<u8>) {
        if self.use_huffman {
            let huffman_len = huffman::encoded_len(data);
            if huffman_len < data.len() {
                write_int(huffman_len, 0x7f, 0x80, out);
                huffman::encode(data, out);
                return;
            }
        }
        write_int(data.len(), 0x7f, 0x00, out);
        out.extend_from_slice(data);
    }
}

fn regular_headers<N, V>(headers: &[(N, V)]) -> impl Iterator<Item = (Vec<u8>, Vec<u8>)> + '_
where
    N: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    headers.iter().filter_map(|(name, value)| {
        let name = name.as_ref().to_ascii_lowercase();
        let skipped = CONNECTION_SPECIFIC_HEADERS
            .iter()
            .any(|h| h.as_bytes() == name.as_slice());
        if skipped || name.starts_with(b":") {
            None
        } else {
            Some((name, value.as_ref().to_vec()))
        }
    })
}

/// Write an HPACK integer with the given prefix mask and leading bits
fn write_int(mut value: usize, prefix_mask: usize, bits: u8, out: &mut Vec<u8>) {
    if value < prefix_mask {
        out.push(bits | value as u8);
        return;
    }
    out.push(bits | prefix_mask as u8);
    value -= prefix_mask;
    while value >= 0x80 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}
