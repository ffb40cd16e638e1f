//! HTTP/2 SETTINGS table

use crate::http2::frame::FrameError;
use crate::http2::INITIAL_MAX_FRAME_SIZE;

/// SETTINGS identifiers (RFC 9113 Section 6.5.2)
pub mod id {
    pub const HEADER_TABLE_SIZE: u16 = 0x1;
    pub const ENABLE_PUSH: u16 = 0x2;
    pub const MAX_CONCURRENT_STREAMS: u16 = 0x3;
    pub const INITIAL_WINDOW_SIZE: u16 = 0x4;
    pub const MAX_FRAME_SIZE: u16 = 0x5;
    pub const MAX_HEADER_LIST_SIZE: u16 = 0x6;
}

/// Number of setting slots; identifiers at or above this are ignored
pub const COUNT: usize = 10;

pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

const MAX_FRAME_SIZE_UPPER: u32 = 16_777_215;

/// Sparse settings table with a per-key "is set" bit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Http2Settings {
    set: u16,
    values: [u32; COUNT],
}

impl Http2Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value. Unknown identifiers are discarded.
    pub fn set(&mut self, id: u16, value: u32) -> &mut Self {
        let slot = id as usize;
        if slot < COUNT {
            self.set |= 1 << slot;
            self.values[slot] = value;
        }
        self
    }

    pub fn is_set(&self, id: u16) -> bool {
        (id as usize) < COUNT && self.set & (1 << id) != 0
    }

    pub fn get(&self, id: u16) -> Option<u32> {
        if self.is_set(id) {
            Some(self.values[id as usize])
        } else {
            None
        }
    }

    /// Number of settings present
    pub fn len(&self) -> usize {
        self.set.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.set == 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn header_table_size(&self) -> Option<u32> {
        self.get(id::HEADER_TABLE_SIZE)
    }

    pub fn enable_push(&self, default: bool) -> bool {
        self.get(id::ENABLE_PUSH).map(|v| v == 1).unwrap_or(default)
    }

    pub fn max_concurrent_streams(&self, default: u32) -> u32 {
        self.get(id::MAX_CONCURRENT_STREAMS).unwrap_or(default)
    }

    pub fn max_frame_size(&self, default: u32) -> u32 {
        self.get(id::MAX_FRAME_SIZE).unwrap_or(default)
    }

    pub fn max_header_list_size(&self, default: u32) -> u32 {
        self.get(id::MAX_HEADER_LIST_SIZE).unwrap_or(default)
    }

    pub fn initial_window_size(&self) -> u32 {
        self.get(id::INITIAL_WINDOW_SIZE)
            .unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Copy every setting present in `other` over this table
    pub fn merge(&mut self, other: &Http2Settings) {
        for (id, value) in other.iter() {
            self.set(id, value);
        }
    }

    /// Present settings in identifier order
    pub fn iter(&self) -> impl Iterator<Item = (u16, u32)> + '_ {
        (0..COUNT as u16).filter_map(move |id| self.get(id).map(|v| (id, v)))
    }

    /// Parse a non-ACK SETTINGS payload, validating each known value
    pub fn parse(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() % 6 != 0 {
            return Err(FrameError::SettingsLength(payload.len()));
        }

        let mut settings = Self::default();
        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match id {
                id::ENABLE_PUSH if value > 1 => {
                    return Err(FrameError::InvalidSetting(format!(
                        "SETTINGS_ENABLE_PUSH must be 0 or 1, got {}",
                        value
                    )));
                }
                id::INITIAL_WINDOW_SIZE if value > i32::MAX as u32 => {
                    return Err(FrameError::InvalidSetting(format!(
                        "SETTINGS_INITIAL_WINDOW_SIZE too large: {}",
                        value
                    )));
                }
                id::MAX_FRAME_SIZE
                    if !(INITIAL_MAX_FRAME_SIZE..=MAX_FRAME_SIZE_UPPER).contains(&value) =>
                {
                    return Err(FrameError::InvalidSetting(format!(
                        "SETTINGS_MAX_FRAME_SIZE out of range: {}",
                        value
                    )));
                }
                _ => {}
            }
            settings.set(id, value);
        }
        Ok(settings)
    }

    /// Serialize as a SETTINGS payload
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * 6);
        for (id, value) in self.iter() {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
        }
        out
    }
}
