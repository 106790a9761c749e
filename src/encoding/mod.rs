pub mod percent;

/// Bytes that separate tokens within a record.
pub fn is_delimiter(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\n'
}

/// Error type for tokens that cannot be stored verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    Empty(&'static str),
    Delimiter(&'static str),
    Separator,
}

impl std::fmt::Display for EncodingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodingError::Empty(what) => write!(f, "{} must not be empty", what),
            EncodingError::Delimiter(what) => {
                write!(f, "{} contains a space, tab or newline", what)
            }
            EncodingError::Separator => write!(f, "field name contains '='"),
        }
    }
}

impl std::error::Error for EncodingError {}

/// Checks that a key can be stored without escaping.
pub fn check_key(key: &[u8]) -> Result<(), EncodingError> {
    if key.is_empty() {
        return Err(EncodingError::Empty("key"));
    }
    if key.iter().copied().any(is_delimiter) {
        return Err(EncodingError::Delimiter("key"));
    }
    Ok(())
}

/// Checks a field name. Names may not contain `=`, values may.
pub fn check_field(name: &[u8]) -> Result<(), EncodingError> {
    if name.is_empty() {
        return Err(EncodingError::Empty("field name"));
    }
    if name.iter().copied().any(is_delimiter) {
        return Err(EncodingError::Delimiter("field name"));
    }
    if name.contains(&b'=') {
        return Err(EncodingError::Separator);
    }
    Ok(())
}

pub fn check_value(value: &[u8]) -> Result<(), EncodingError> {
    if value.iter().copied().any(is_delimiter) {
        return Err(EncodingError::Delimiter("value"));
    }
    Ok(())
}
