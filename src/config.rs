use std::path::PathBuf;

/// Appends tolerated since the last resort before the next one is forced.
pub const RESORT_LIMIT: u32 = 128;

/// Configuration for a store handle
#[derive(Debug, Clone)]
pub struct KpConfig {
    /// Path of the store file
    pub path: PathBuf,

    /// Appends since the last sort before a resort is triggered (default: 128)
    pub resort_limit: u32,

    /// Create the file if it does not exist (default: true)
    pub create: bool,

    /// Fail with `LockContention` instead of waiting for a record lock (default: false)
    pub nonblocking: bool,

    /// Sync an appended record before its predecessor is tombstoned (default: false)
    pub sync_appends: bool,
}

impl Default for KpConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store.kp"),
            resort_limit: RESORT_LIMIT,
            create: true,
            nonblocking: false,
            sync_appends: false,
        }
    }
}

impl KpConfig {
    /// Create a new config for the given store file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the resort limit
    pub fn resort_limit(mut self, limit: u32) -> Self {
        self.resort_limit = limit;
        self
    }

    /// Create the store file if missing
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    /// Use non-blocking record locks
    pub fn nonblocking(mut self, enabled: bool) -> Self {
        self.nonblocking = enabled;
        self
    }

    /// Sync appends before tombstoning the record they replace
    pub fn sync_appends(mut self, enabled: bool) -> Self {
        self.sync_appends = enabled;
        self
    }
}
