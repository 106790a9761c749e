//! Percent escaping for field values that must carry arbitrary bytes.
//!
//! Only ASCII letters, digits and `.` pass through; everything else becomes
//! `%` followed by two lowercase hex digits. The store itself never applies
//! this transform, callers opt in through the `*_encoded` operations.

const HEX: &[u8; 16] = b"0123456789abcdef";

fn is_plain(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.'
}

/// Escapes `data` so it contains no delimiters.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        if is_plain(b) {
            out.push(b);
        } else {
            out.push(b'%');
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0x0f) as usize]);
        }
    }
    out
}

/// Reverses [`encode`]. Escapes that decode to NUL or are not valid hex
/// come back as `?`; a truncated escape at the end also yields `?`.
pub fn decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        if b != b'%' {
            out.push(b);
            i += 1;
            continue;
        }
        let escaped = match data.get(i + 1..i + 3) {
            Some(&[hi, lo]) => match (hex_value(hi), hex_value(lo)) {
                (Some(hi), Some(lo)) => hi << 4 | lo,
                _ => 0,
            },
            _ => 0,
        };
        out.push(if escaped == 0 { b'?' } else { escaped });
        i += 3;
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
