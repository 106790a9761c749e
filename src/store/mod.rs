//! The store file: a header line followed by append-only record lines whose
//! sort slots form an in-place index over the keys.

pub mod header;
pub mod index;
mod kpdb;
pub mod map;
pub mod record;

pub use kpdb::{KpDb, LockMode};
pub use record::{Fields, Record};
