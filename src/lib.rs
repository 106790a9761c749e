pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod store;
pub mod trim;

pub use config::KpConfig;
pub use error::{Error, Result};
pub use store::{KpDb, LockMode, Record};
pub use trim::{trim, TrimStats};
