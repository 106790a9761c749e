//! Record lines: `+ssssssss.mmmm:key name=value name=value\n`.
//!
//! Byte 0 is the liveness flag, followed by the sort slot in hex, a
//! separator, the modification counter in hex and a `:`. The key starts at
//! [`KEY_OFF`] and runs to the first space, tab or newline. Values are stored
//! as-is; escaping is left to callers.

use std::ops::Range;

use super::header::{hex8, parse_hex};
use crate::encoding::{is_delimiter, percent};
use crate::error::Result;
use crate::Error;

pub const LIVE: u8 = b'+';
pub const DEAD: u8 = b'-';

pub const SLOT_OFF: usize = 1;
pub const SLOT_LEN: usize = 8;
pub const MOD_OFF: usize = 10;
pub const KEY_OFF: usize = 15;

/// Sort slot carried by records appended since the last resort.
pub const UNSORTED: u32 = 0;

/// A record borrowed from the current mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    offset: usize,
    line: &'a [u8],
}

impl<'a> Record<'a> {
    /// Decodes the record starting at `offset` in `data`.
    pub fn decode(data: &'a [u8], offset: usize) -> Result<Self> {
        if offset >= data.len() {
            return Err(Error::Format {
                offset,
                reason: "offset past end of store",
            });
        }
        let end = line_end(data, offset);
        Self::from_line(&data[offset..end], offset)
    }

    pub(crate) fn from_line(line: &'a [u8], offset: usize) -> Result<Self> {
        let reason = if line.len() <= KEY_OFF {
            Some("record shorter than its header")
        } else if line[0] != LIVE && line[0] != DEAD {
            Some("bad liveness flag")
        } else if parse_hex(&line[SLOT_OFF..SLOT_OFF + SLOT_LEN]).is_none() {
            Some("sort slot is not hex")
        } else if parse_hex(&line[MOD_OFF..MOD_OFF + 4]).is_none() {
            Some("modification counter is not hex")
        } else if line[KEY_OFF - 1] != b':' {
            Some("missing ':' before key")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::Format { offset, reason }),
            None => Ok(Record { offset, line }),
        }
    }

    /// File offset of the record's first byte.
    pub fn offset(&self) -> u64 {
        self.offset as u64
    }

    /// Length in bytes, including the trailing newline.
    pub fn byte_len(&self) -> usize {
        self.line.len()
    }

    pub fn is_live(&self) -> bool {
        self.line[0] == LIVE
    }

    pub fn sort_slot(&self) -> u32 {
        parse_hex(&self.line[SLOT_OFF..SLOT_OFF + SLOT_LEN]).unwrap_or(UNSORTED)
    }

    pub fn mod_count(&self) -> u16 {
        parse_hex(&self.line[MOD_OFF..MOD_OFF + 4]).unwrap_or(0) as u16
    }

    pub fn key(&self) -> &'a [u8] {
        key_of(self.line)
    }

    /// Value of field `name`, without copying.
    pub fn field(&self, name: &[u8]) -> Option<&'a [u8]> {
        self.field_range(name).map(|range| &self.line[range])
    }

    /// Value of field `name` with percent escapes undone.
    pub fn field_decoded(&self, name: &[u8]) -> Option<Vec<u8>> {
        self.field(name).map(percent::decode)
    }

    pub fn fields(&self) -> Fields<'a> {
        Fields {
            line: self.line,
            pos: KEY_OFF + self.key().len(),
        }
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.line
    }

    /// Position of the value of `name` within the line. Scans tokens once and
    /// stops at the first match.
    pub(crate) fn field_range(&self, name: &[u8]) -> Option<Range<usize>> {
        let line = self.line;
        let mut pos = KEY_OFF + self.key().len();
        while pos < line.len() {
            if is_delimiter(line[pos]) {
                pos += 1;
                continue;
            }
            let start = pos;
            while pos < line.len() && !is_delimiter(line[pos]) {
                pos += 1;
            }
            let token = &line[start..pos];
            if token.len() > name.len() && token.starts_with(name) && token[name.len()] == b'=' {
                return Some(start + name.len() + 1..pos);
            }
        }
        None
    }
}

/// Iterator over the `name=value` tokens of a record. Tokens without `=` are
/// skipped.
pub struct Fields<'a> {
    line: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Fields<'a> {
    type Item = (&'a [u8], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.line;
        loop {
            while self.pos < line.len() && is_delimiter(line[self.pos]) {
                self.pos += 1;
            }
            if self.pos >= line.len() {
                return None;
            }
            let start = self.pos;
            while self.pos < line.len() && !is_delimiter(line[self.pos]) {
                self.pos += 1;
            }
            let token = &line[start..self.pos];
            if let Some(eq) = token.iter().position(|&b| b == b'=') {
                return Some((&token[..eq], &token[eq + 1..]));
            }
        }
    }
}

/// Whether `line` is complete and carries a parseable sort slot, whatever
/// the rest of it holds.
pub fn has_slot(line: &[u8]) -> bool {
    line.len() > KEY_OFF
        && line.ends_with(b"\n")
        && parse_hex(&line[SLOT_OFF..SLOT_OFF + SLOT_LEN]).is_some()
}

/// End (exclusive) of the line starting at `offset`, newline included.
pub fn line_end(data: &[u8], offset: usize) -> usize {
    match data[offset..].iter().position(|&b| b == b'\n') {
        Some(i) => offset + i + 1,
        None => data.len(),
    }
}

/// Key bytes of a raw record line; empty for lines too short to carry one.
pub fn key_of(line: &[u8]) -> &[u8] {
    if line.len() <= KEY_OFF {
        return &[];
    }
    let rest = &line[KEY_OFF..];
    let len = rest
        .iter()
        .position(|&b| is_delimiter(b))
        .unwrap_or(rest.len());
    &rest[..len]
}

/// Builds a new, unsorted record line.
pub fn encode(key: &[u8], fields: &[(&[u8], &[u8])]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KEY_OFF + key.len() + 1);
    buf.push(LIVE);
    buf.extend_from_slice(&hex8(UNSORTED));
    buf.extend_from_slice(b".0000:");
    buf.extend_from_slice(key);
    for (name, value) in fields {
        buf.push(b' ');
        buf.extend_from_slice(name);
        buf.push(b'=');
        buf.extend_from_slice(value);
    }
    buf.push(b'\n');
    buf
}

/// Copies `old` into a new unsorted record with `name` set to `value`,
/// keeping every other field and the modification counter.
pub fn rewrite(old: &Record<'_>, name: &[u8], value: &[u8]) -> Vec<u8> {
    let line = old.line;
    let body_end = if line.ends_with(b"\n") {
        line.len() - 1
    } else {
        line.len()
    };
    let body_start = SLOT_OFF + SLOT_LEN;

    let mut buf = Vec::with_capacity(line.len() + name.len() + value.len() + 2);
    buf.push(LIVE);
    buf.extend_from_slice(&hex8(UNSORTED));
    match old.field_range(name) {
        Some(range) => {
            buf.extend_from_slice(&line[body_start..range.start]);
            buf.extend_from_slice(value);
            buf.extend_from_slice(&line[range.end..body_end]);
        }
        None => {
            buf.extend_from_slice(&line[body_start..body_end]);
            buf.push(b' ');
            buf.extend_from_slice(name);
            buf.push(b'=');
            buf.extend_from_slice(value);
        }
    }
    buf.push(b'\n');
    buf
}
