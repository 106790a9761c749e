use crate::error::Result;
use crate::Error;

// "$V00.00 aaaaaaaa mmmmmmmm cccccccc\n"
pub const HEADER_LEN: usize = 35;

pub const VERSION: [u8; 5] = *b"00.00";

/// Offset of the append sequence field.
pub const APPEND_OFF: usize = 8;
/// Offset of the last-modify timestamp field.
pub const MTIME_OFF: usize = 17;
/// Offset of the appends-since-sort field.
pub const SORT_COUNT_OFF: usize = 26;

/// Appends-since-sort written into a brand new store so the first open sorts it.
pub const FRESH_SORT_COUNT: u32 = 0x0FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: [u8; 5],
    pub append_seq: u32,
    pub modified: u32,
    pub since_sort: u32,
}

impl Header {
    pub fn new() -> Self {
        Header {
            version: VERSION,
            append_seq: 0,
            modified: 0,
            since_sort: FRESH_SORT_COUNT,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(b"$V");
        buf.extend_from_slice(&self.version);
        buf.push(b' ');
        buf.extend_from_slice(&hex8(self.append_seq));
        buf.push(b' ');
        buf.extend_from_slice(&hex8(self.modified));
        buf.push(b' ');
        buf.extend_from_slice(&hex8(self.since_sort));
        buf.push(b'\n');
        buf
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..2] != b"$V" || bytes[HEADER_LEN - 1] != b'\n' {
            return Err(Error::InvalidHeader);
        }
        if [APPEND_OFF - 1, MTIME_OFF - 1, SORT_COUNT_OFF - 1]
            .iter()
            .any(|&i| bytes[i] != b' ')
        {
            return Err(Error::InvalidHeader);
        }

        let mut version = [0u8; 5];
        version.copy_from_slice(&bytes[2..7]);

        Ok(Header {
            version,
            append_seq: field(bytes, APPEND_OFF)?,
            modified: field(bytes, MTIME_OFF)?,
            since_sort: field(bytes, SORT_COUNT_OFF)?,
        })
    }
}

/// Reads one 8-digit counter out of a header image.
pub fn field(bytes: &[u8], offset: usize) -> Result<u32> {
    bytes
        .get(offset..offset + 8)
        .and_then(parse_hex)
        .ok_or(Error::InvalidHeader)
}

/// Formats `value` as eight lowercase hex digits.
pub fn hex8(value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(format!("{:08x}", value).as_bytes());
    out
}

/// Parses a fixed-width hex field. Every byte must be a hex digit.
pub fn parse_hex(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    let text = std::str::from_utf8(bytes).ok()?;
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(text, 16).ok()
}
