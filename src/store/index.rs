//! Sort index embedded in the records themselves.
//!
//! Records never move. After a resort the record at physical position `i`
//! carries, in its sort slot, the offset of the record holding the `i`-th
//! smallest key. A binary search over physical positions can then compare
//! against sorted ranks. Records appended since carry [`UNSORTED`] and are
//! found by [`scan_tail`].
//!
//! Everything here is a pure function of the mapped bytes.

use std::cmp::Ordering;

use super::header::parse_hex;
use super::record::{has_slot, key_of, line_end, Record, SLOT_LEN, SLOT_OFF, UNSORTED};

/// Location of a record within the mapping, trailing newline included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub offset: usize,
    pub len: usize,
}

/// Binary search over `[head_len, data.len())` using the embedded slots.
pub fn search(data: &[u8], head_len: usize, key: &[u8]) -> Option<Span> {
    if head_len == 0 || head_len >= data.len() {
        return None;
    }
    search_range(data, head_len, key, head_len, data.len())
}

fn search_range(data: &[u8], head_len: usize, key: &[u8], b: usize, e: usize) -> Option<Span> {
    if b >= e {
        return None;
    }

    // Physical pivot: the record containing the midpoint byte.
    let mid = (b + e) / 2;
    let c = data[b..mid]
        .iter()
        .rposition(|&x| x == b'\n')
        .map_or(b, |i| b + i + 1);
    let end = data[c..e]
        .iter()
        .position(|&x| x == b'\n')
        .map_or(e, |i| c + i + 1);

    let (left, right) = match slot_target(data, head_len, &data[c..end]) {
        // Slot unusable for this sub-range, both halves may hold the key.
        None => (true, true),
        Some(target) => match key.cmp(target.key()) {
            Ordering::Less => (true, false),
            Ordering::Greater => (false, true),
            // A tombstone's neighbours may hold the live copy on either side.
            Ordering::Equal if !target.is_live() => (true, true),
            Ordering::Equal => {
                return Some(Span {
                    offset: target.offset() as usize,
                    len: target.byte_len(),
                })
            }
        },
    };

    if left {
        if let Some(hit) = search_range(data, head_len, key, b, c) {
            return Some(hit);
        }
    }
    if right {
        return search_range(data, head_len, key, end, e);
    }
    None
}

/// Dereferences the sort slot of `pivot`, if it names a complete record.
fn slot_target<'a>(data: &'a [u8], head_len: usize, pivot: &[u8]) -> Option<Record<'a>> {
    if !has_slot(pivot) {
        return None;
    }
    let slot = parse_hex(&pivot[SLOT_OFF..SLOT_OFF + SLOT_LEN])? as usize;
    if slot < head_len || slot >= data.len() || data[slot - 1] != b'\n' {
        return None;
    }
    let target = Record::decode(data, slot).ok()?;
    if !target.as_bytes().ends_with(b"\n") {
        return None;
    }
    Some(target)
}

/// Scans backward from the end over records appended since the last resort.
/// Stops at the first record carrying a real sort slot.
pub fn scan_tail(data: &[u8], head_len: usize, key: &[u8]) -> Option<Span> {
    let mut end = data.len();
    while end > head_len {
        if data[end - 1] != b'\n' {
            break;
        }
        let start = data[head_len..end - 1]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(head_len, |i| head_len + i + 1);

        match Record::from_line(&data[start..end], start) {
            Ok(record) => {
                if record.sort_slot() != UNSORTED {
                    break;
                }
                if record.is_live() && record.key() == key {
                    return Some(Span {
                        offset: start,
                        len: end - start,
                    });
                }
            }
            Err(e) => tracing::warn!(offset = start, error = %e, "skipping malformed record"),
        }
        end = start;
    }
    None
}

/// Raw lines from `head_len` on, with their offsets. The last one may lack
/// its newline.
pub fn lines(data: &[u8], head_len: usize) -> Lines<'_> {
    Lines {
        data,
        pos: head_len.min(data.len()),
    }
}

pub struct Lines<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Lines<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        self.pos = line_end(self.data, start);
        Some((start, &self.data[start..self.pos]))
    }
}

/// Offsets of every complete line carrying a sort slot, in append order.
/// Damaged lines keep their place so that no stale slot outlives a resort.
pub fn physical_records(data: &[u8], head_len: usize) -> Vec<usize> {
    lines(data, head_len)
        .filter(|(offset, line)| {
            let ok = has_slot(line);
            if !ok {
                tracing::warn!(offset, "excluding line without a sort slot");
            }
            ok
        })
        .map(|(offset, _)| offset)
        .collect()
}

/// Pairs of (physical record, offset its slot must carry) for a full resort.
/// The sort is stable, so equal keys keep their append order.
pub fn sort_plan(data: &[u8], head_len: usize) -> Vec<(usize, usize)> {
    let physical = physical_records(data, head_len);
    let mut sorted = physical.clone();
    sorted.sort_by(|&a, &b| key_of(&data[a..]).cmp(key_of(&data[b..])));
    physical.into_iter().zip(sorted).collect()
}
