use std::io;

use crate::encoding::EncodingError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    MapError(io::Error),
    InvalidHeader,
    Format { offset: usize, reason: &'static str },
    LockError(io::Error),
    LockContention(u64),
    InvalidData(EncodingError),
}

impl Error {
    /// Errors after which the handle should not be trusted any further.
    /// Format errors and lock contention are recoverable, as is bad input.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::IoError(_) | Error::MapError(_) | Error::InvalidHeader | Error::LockError(_)
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl From<EncodingError> for Error {
    fn from(err: EncodingError) -> Self {
        Error::InvalidData(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::MapError(err) => write!(f, "Failed to map store: {}", err),
            Error::InvalidHeader => write!(f, "Invalid header"),
            Error::Format { offset, reason } => {
                write!(f, "Malformed record at offset {}: {}", offset, reason)
            }
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::LockContention(offset) => write!(f, "Offset {} is locked", offset),
            Error::InvalidData(err) => write!(f, "Invalid data: {}", err),
        }
    }
}

impl std::error::Error for Error {}
