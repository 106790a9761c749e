use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use super::header::{self, hex8, Header, APPEND_OFF, MTIME_OFF, SORT_COUNT_OFF};
use super::index::{self, Span};
use super::map::MapView;
use super::record::{self, Record, DEAD, LIVE, SLOT_OFF};
use crate::config::KpConfig;
use crate::encoding::{self, percent};
use crate::error::Result;
use crate::flock::{LockKind, RangeLocks, OPEN_LOCK, STRUCTURAL_LOCK};
use crate::Error;

/// How a write treats the record lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Take the lock for the duration of the write only.
    Transient,
    /// Take the lock and keep holding it afterwards.
    Lock,
    /// The caller already holds the lock and keeps it.
    Continue,
    /// The caller already holds the lock; release it after the write.
    Unlock,
}

impl LockMode {
    fn acquires(self) -> bool {
        matches!(self, LockMode::Transient | LockMode::Lock)
    }

    fn releases(self) -> bool {
        matches!(self, LockMode::Transient | LockMode::Unlock)
    }
}

/// When a lookup compares the append sequence against the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    Never,
    IfMissing,
    Always,
}

/// Last record matched, valid only for the mapping generation it came from.
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    generation: u64,
    span: Span,
}

/// An open key/field store.
///
/// Reads go through a shared mapping of the file; every mutation is a
/// positional write. Records are appended or patched in place, never moved.
#[derive(Debug)]
pub struct KpDb {
    config: KpConfig,
    file: File,
    locks: RangeLocks,
    view: MapView,
    head_len: usize,
    append_seq: u32,
    cache: Option<CacheEntry>,
    modified: bool,
    closed: bool,
}

impl KpDb {
    /// Open store with default configuration
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(KpConfig::new(path.as_ref()))
    }

    /// Open store with custom configuration
    pub fn open_with_config(config: KpConfig) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(config.create)
            .open(&config.path)?;
        let locks = RangeLocks::new(file.try_clone()?);

        locks
            .lock(STRUCTURAL_LOCK, LockKind::Exclusive)
            .map_err(Error::LockError)?;

        // Nobody else holds the shared open lock if we can take it exclusively.
        let first = locks
            .try_lock(OPEN_LOCK, LockKind::Exclusive)
            .map_err(Error::LockError)?;
        locks
            .lock(OPEN_LOCK, LockKind::Shared)
            .map_err(Error::LockError)?;

        let mut modified = false;
        if file.metadata()?.len() == 0 {
            file.write_all_at(&Header::new().encode(), 0)?;
            modified = true;
        }

        let view = MapView::new(&file)?;
        let header = Header::try_from(view.bytes())?;
        let head_len = view
            .bytes()
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| i + 1)
            .ok_or(Error::InvalidHeader)?;

        let mut db = KpDb {
            config,
            file,
            locks,
            view,
            head_len,
            append_seq: header.append_seq,
            cache: None,
            modified,
            closed: false,
        };

        if first {
            let mtime = file_mtime(&db.file)?;
            let drift = (header.modified as i32).wrapping_sub(mtime as i32);
            let edited = drift < -1;
            let overdue = header.since_sort > db.config.resort_limit;
            if edited || overdue {
                tracing::info!(
                    path = %db.config.path.display(),
                    edited,
                    since_sort = header.since_sort,
                    "store needs a resort"
                );
                db.sort()?;
            }
        }

        db.locks
            .unlock(STRUCTURAL_LOCK)
            .map_err(Error::LockError)?;

        tracing::debug!(
            path = %db.config.path.display(),
            first,
            size = db.view.len(),
            append_seq = db.append_seq,
            "opened store"
        );
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &KpConfig {
        &self.config
    }

    /// Closes the store, stamping the modify time if anything changed.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.modified {
            self.file
                .write_all_at(&hex8(unix_now()), MTIME_OFF as u64)?;
        }
        self.locks.unlock(OPEN_LOCK).map_err(Error::LockError)
    }
}

// Lookups
impl KpDb {
    /// Returns field `field` of `key`, or the key itself when no field is
    /// named. With `lock` the record stays exclusively locked on return.
    pub fn read(&mut self, key: &[u8], field: Option<&[u8]>, lock: bool) -> Result<Option<&[u8]>> {
        let Some(record) = self.read_record(key, lock)? else {
            return Ok(None);
        };
        Ok(match field {
            Some(name) => record.field(name),
            None => Some(record.key()),
        })
    }

    /// Like [`KpDb::read`] with percent escapes undone.
    pub fn read_decoded(&mut self, key: &[u8], field: &[u8], lock: bool) -> Result<Option<Vec<u8>>> {
        Ok(self
            .read_record(key, lock)?
            .and_then(|record| record.field_decoded(field)))
    }

    /// Returns the live record for `key`.
    pub fn read_record(&mut self, key: &[u8], lock: bool) -> Result<Option<Record<'_>>> {
        match self.locate(key, lock, Refresh::IfMissing)? {
            Some(span) => Record::decode(self.view.bytes(), span.offset).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the record starting at `offset`, live or not.
    pub fn read_record_at(&mut self, offset: u64, lock: bool) -> Result<Option<Record<'_>>> {
        let at = offset as usize;
        if at >= self.view.len() {
            self.refresh()?;
        }
        if at < self.head_len || at >= self.view.len() {
            return Ok(None);
        }
        if lock {
            self.lock_record(offset)?;
        }
        match Record::decode(self.view.bytes(), at) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::debug!(offset, error = %e, "no record at offset");
                if lock {
                    self.unlock(offset)?;
                }
                Ok(None)
            }
        }
    }

    /// Live records in append order, including appends made since the
    /// handle last looked.
    pub fn records(&mut self) -> Result<impl Iterator<Item = Record<'_>>> {
        self.refresh()?;
        Ok(index::lines(self.view.bytes(), self.head_len)
            .filter(|(_, line)| line.ends_with(b"\n"))
            .filter_map(|(offset, line)| Record::from_line(line, offset).ok())
            .filter(|record| record.is_live()))
    }

    /// Global append sequence, bumped by every append from any handle.
    pub fn append_count(&self) -> Result<u32> {
        header::field(self.view.bytes(), APPEND_OFF)
    }

    /// Appends since the last resort.
    pub fn appends_since_sort(&self) -> Result<u32> {
        header::field(self.view.bytes(), SORT_COUNT_OFF)
    }

    /// Remaps the file if anyone appended since this handle last looked.
    pub fn refresh(&mut self) -> Result<bool> {
        let seq = self.append_count()?;
        if seq == self.append_seq {
            return Ok(false);
        }
        self.append_seq = seq;
        self.cache = None;
        self.view.remap(&self.file)?;
        Ok(true)
    }

    pub fn lock(&self, offset: u64) -> Result<()> {
        self.lock_record(offset)
    }

    pub fn unlock(&self, offset: u64) -> Result<()> {
        self.locks.unlock(offset).map_err(Error::LockError)
    }

    fn lock_record(&self, offset: u64) -> Result<()> {
        if !self.config.nonblocking {
            return self
                .locks
                .lock(offset, LockKind::Exclusive)
                .map_err(Error::LockError);
        }
        if self
            .locks
            .try_lock(offset, LockKind::Exclusive)
            .map_err(Error::LockError)?
        {
            Ok(())
        } else {
            Err(Error::LockContention(offset))
        }
    }

    fn cached(&self, key: &[u8]) -> Option<Span> {
        let entry = self.cache?;
        if entry.generation != self.view.generation() {
            return None;
        }
        let line = self
            .view
            .bytes()
            .get(entry.span.offset..entry.span.offset + entry.span.len)?;
        (line[0] == LIVE && record::key_of(line) == key).then_some(entry.span)
    }

    fn locate(&mut self, key: &[u8], lock: bool, refresh: Refresh) -> Result<Option<Span>> {
        let found = self
            .cached(key)
            .or_else(|| index::search(self.view.bytes(), self.head_len, key))
            .or_else(|| index::scan_tail(self.view.bytes(), self.head_len, key));

        let check = match refresh {
            Refresh::Never => false,
            Refresh::IfMissing => found.is_none(),
            Refresh::Always => true,
        };
        if check && self.refresh()? {
            return self.locate(key, lock, Refresh::Never);
        }

        let Some(span) = found else {
            return Ok(None);
        };
        self.cache = Some(CacheEntry {
            generation: self.view.generation(),
            span,
        });

        if lock {
            self.lock_record(span.offset as u64)?;
            // Superseded or deleted while we waited for the lock.
            if self.view.bytes()[span.offset] != LIVE {
                self.unlock(span.offset as u64)?;
                self.cache = None;
                return self.locate(key, lock, Refresh::Always);
            }
        }
        Ok(Some(span))
    }
}

// Mutations
impl KpDb {
    /// Sets `field` of `key` to `value`, creating the record if needed.
    ///
    /// Values of the same length are patched in place. Anything else appends
    /// a full copy of the record and tombstones the old one. Without a field
    /// the call only releases the lock per `mode`, or creates an empty record
    /// when the key is absent.
    pub fn write(
        &mut self,
        key: &[u8],
        field: Option<&[u8]>,
        value: &[u8],
        mode: LockMode,
    ) -> Result<()> {
        encoding::check_key(key)?;
        if let Some(name) = field {
            encoding::check_field(name)?;
            encoding::check_value(value)?;
        }

        let mut held = None;
        if let Some(span) = self.locate(key, mode.acquires(), Refresh::IfMissing)? {
            let offset = span.offset as u64;
            held = Some(offset);

            let Some(name) = field else {
                if mode.releases() {
                    self.unlock(offset)?;
                }
                return Ok(());
            };

            let range = Record::decode(self.view.bytes(), span.offset)?.field_range(name);
            if let Some(range) = range.filter(|range| range.len() == value.len()) {
                self.file
                    .write_all_at(value, (span.offset + range.start) as u64)?;
                self.modified = true;
                if mode.releases() {
                    self.unlock(offset)?;
                }
                return Ok(());
            }
        }

        self.locks
            .lock(STRUCTURAL_LOCK, LockKind::Exclusive)
            .map_err(Error::LockError)?;
        let appended = self.append_locked(key, field, value);
        let unlocked = self
            .locks
            .unlock(STRUCTURAL_LOCK)
            .map_err(Error::LockError);
        let appended = match appended {
            Ok(appended) => appended,
            Err(e) => {
                // A caller continuing under its own lock keeps it.
                if let Some(old) = held.filter(|_| mode != LockMode::Continue) {
                    self.unlock(old)?;
                }
                return Err(e);
            }
        };
        unlocked?;

        if let Some(old) = held {
            self.unlock(old)?;
        }
        if let Some(new) = appended {
            if mode.releases() {
                self.unlock(new)?;
            }
        }
        Ok(())
    }

    /// Percent-encodes `raw` and writes it to `field`.
    pub fn write_encoded(&mut self, key: &[u8], field: &[u8], raw: &[u8], mode: LockMode) -> Result<()> {
        let value = percent::encode(raw);
        self.write(key, Some(field), &value, mode)
    }

    /// Appends the new version of `key`. Runs under the structural lock and
    /// returns the new record's offset, locked.
    fn append_locked(&mut self, key: &[u8], field: Option<&[u8]>, value: &[u8]) -> Result<Option<u64>> {
        let since_sort = self.appends_since_sort()?;
        let overdue = since_sort > self.config.resort_limit;

        // A resort has to see every record, so make sure the mapping is whole.
        let refresh = if overdue {
            Refresh::Always
        } else {
            Refresh::IfMissing
        };
        let old = self.locate(key, false, refresh)?;
        let since_sort = if overdue {
            self.sort()?;
            0
        } else {
            since_sort
        };

        let line = match (old, field) {
            (Some(_), None) => return Ok(None),
            (Some(span), Some(name)) => {
                let record = Record::decode(self.view.bytes(), span.offset)?;
                record::rewrite(&record, name, value)
            }
            (None, Some(name)) => record::encode(key, &[(name, value)]),
            (None, None) => record::encode(key, &[]),
        };

        let offset = self.seal_tail()?;
        if !self
            .locks
            .try_lock(offset, LockKind::Exclusive)
            .map_err(Error::LockError)?
        {
            tracing::error!(
                path = %self.config.path.display(),
                offset,
                "unable to lock new record"
            );
        }

        let append_seq = match self.commit_append(&line, offset, since_sort, old) {
            Ok(append_seq) => append_seq,
            Err(e) => {
                self.unlock(offset)?;
                return Err(e);
            }
        };

        tracing::trace!(offset, append_seq, replaced = old.is_some(), "appended record");
        Ok(Some(offset))
    }

    /// Writes `line` at `offset`, publishes it through the header counters
    /// and retires the copy it replaces.
    fn commit_append(&mut self, line: &[u8], offset: u64, since_sort: u32, old: Option<Span>) -> Result<u32> {
        self.file.write_all_at(line, offset)?;
        if self.config.sync_appends {
            self.file.sync_data()?;
        }

        let append_seq = self.append_count()?.wrapping_add(1);
        self.file
            .write_all_at(&hex8(append_seq), APPEND_OFF as u64)?;
        self.file
            .write_all_at(&hex8(since_sort.saturating_add(1)), SORT_COUNT_OFF as u64)?;
        self.modified = true;

        // Only once the new copy is on disk may the old one go.
        if let Some(span) = old {
            self.file.write_all_at(&[DEAD], span.offset as u64)?;
        }
        Ok(append_seq)
    }

    /// Returns the offset the next record goes to. A line left unterminated
    /// by an interrupted append is closed off and, if it claims to be live,
    /// tombstoned so the fragment never shadows a real record.
    fn seal_tail(&mut self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        let mut last = [0u8; 1];
        self.file.read_exact_at(&mut last, len - 1)?;
        if last[0] == b'\n' {
            return Ok(len);
        }

        self.file.write_all_at(b"\n", len)?;
        self.view.remap(&self.file)?;
        self.cache = None;
        let data = self.view.bytes();
        let start = data[..len as usize]
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |i| i + 1);
        if start >= self.head_len && data[start] == LIVE {
            self.file.write_all_at(&[DEAD], start as u64)?;
        }
        tracing::warn!(
            path = %self.config.path.display(),
            offset = start,
            "sealed torn line at end of store"
        );
        Ok(len + 1)
    }

    /// Tombstones `key`. Returns false if there was no live record.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let Some(span) = self.locate(key, true, Refresh::IfMissing)? else {
            return Ok(false);
        };
        let offset = span.offset as u64;
        let written = self.file.write_all_at(&[DEAD], offset);
        self.cache = None;
        self.unlock(offset)?;
        written?;
        self.modified = true;
        Ok(true)
    }

    /// Takes the structural lock and rebuilds the sort index now.
    pub fn force_resort(&mut self) -> Result<()> {
        self.locks
            .lock(STRUCTURAL_LOCK, LockKind::Exclusive)
            .map_err(Error::LockError)?;
        let result = self.refresh().and_then(|_| self.sort());
        let unlocked = self
            .locks
            .unlock(STRUCTURAL_LOCK)
            .map_err(Error::LockError);
        result?;
        unlocked
    }

    /// Rewrites every sort slot. Requires the structural lock and a mapping
    /// that covers the whole file.
    fn sort(&mut self) -> Result<()> {
        let plan = index::sort_plan(self.view.bytes(), self.head_len);
        for &(physical, sorted) in &plan {
            self.file
                .write_all_at(&hex8(sorted as u32), (physical + SLOT_OFF) as u64)?;
        }
        self.file.write_all_at(&hex8(0), SORT_COUNT_OFF as u64)?;
        self.file
            .write_all_at(&hex8(unix_now()), MTIME_OFF as u64)?;
        self.modified = true;

        tracing::info!(
            path = %self.config.path.display(),
            records = plan.len(),
            "resorted store"
        );
        Ok(())
    }
}

impl Drop for KpDb {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(path = %self.config.path.display(), error = %e, "failed to close store");
        }
    }
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

fn file_mtime(file: &File) -> Result<u32> {
    let modified = file.metadata()?.modified()?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::store::header::HEADER_LEN;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn store_path(dir: &TempDir) -> PathBuf {
        dir.path().join("active")
    }

    /// Offset of the live record for `key` found by walking every line.
    fn naive_lookup(path: &Path, key: &[u8]) -> Option<u64> {
        let data = fs::read(path).expect("Failed to read store");
        index::lines(&data, HEADER_LEN)
            .filter(|(_, line)| line.ends_with(b"\n"))
            .filter_map(|(offset, line)| Record::from_line(line, offset).ok())
            .filter(|record| record.is_live() && record.key() == key)
            .map(|record| record.offset())
            .last()
    }

    #[test]
    fn test_open_creates_sorted_empty_store() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = store_path(&dir);

        let mut db = KpDb::open(&path).expect("Failed to open store");
        assert_eq!(db.append_count().unwrap(), 0);
        // A fresh header asks for a resort, which the first open performs.
        assert_eq!(db.appends_since_sort().unwrap(), 0);
        assert_eq!(db.records().unwrap().count(), 0);
        db.close().expect("Failed to close store");

        let data = fs::read(&path).unwrap();
        assert_eq!(data.len(), HEADER_LEN);
        assert!(data.starts_with(b"$V00.00 00000000 "));
    }

    #[test]
    fn test_open_without_create_fails() {
        let dir = TempDir::new().unwrap();
        let config = KpConfig::new(store_path(&dir)).create(false);
        match KpDb::open_with_config(config) {
            Err(e) => {
                assert!(matches!(e, Error::IoError(_)));
                assert!(e.is_fatal());
            }
            Ok(_) => panic!("opened a missing store"),
        }
    }

    #[test]
    fn test_open_rejects_bad_header() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        fs::write(&path, b"not a store\n").unwrap();

        assert!(matches!(KpDb::open(&path), Err(Error::InvalidHeader)));
    }

    #[test]
    fn test_lock_mode_scenario() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut db = KpDb::open(&path).expect("Failed to open store");

        db.write(b"alt.test", Some(b"NB"), b"1", LockMode::Lock).unwrap();
        db.write(b"alt.test", Some(b"NE"), b"0", LockMode::Continue).unwrap();
        db.write(b"alt.test", Some(b"S"), b"y", LockMode::Unlock).unwrap();
        assert_eq!(db.read(b"alt.test", Some(b"S"), false).unwrap(), Some(&b"y"[..]));
        assert_eq!(db.read(b"alt.test", Some(b"NE"), false).unwrap(), Some(&b"0"[..]));

        // Same length: patched in place.
        let size = fs::metadata(&path).unwrap().len();
        let seq = db.append_count().unwrap();
        let offset = db.read_record(b"alt.test", false).unwrap().unwrap().offset();
        db.write(b"alt.test", Some(b"NB"), b"2", LockMode::Transient).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), size);
        assert_eq!(db.append_count().unwrap(), seq);
        assert_eq!(db.read(b"alt.test", Some(b"NB"), false).unwrap(), Some(&b"2"[..]));
        assert_eq!(db.read_record(b"alt.test", false).unwrap().unwrap().offset(), offset);

        // Longer: appended at the old end of file, predecessor tombstoned.
        db.write(b"alt.test", Some(b"NB"), b"100", LockMode::Transient).unwrap();
        assert_eq!(db.append_count().unwrap(), seq + 1);
        assert_eq!(db.read(b"alt.test", Some(b"NB"), false).unwrap(), Some(&b"100"[..]));

        let record = db.read_record(b"alt.test", false).unwrap().unwrap();
        assert_eq!(record.offset(), size);
        assert_eq!(record.field(b"NE"), Some(&b"0"[..]));
        assert_eq!(record.field(b"S"), Some(&b"y"[..]));

        let data = fs::read(&path).unwrap();
        assert_eq!(data[offset as usize], b'-');
        assert_eq!(data[size as usize], b'+');
    }

    #[test]
    fn test_tombstone_and_append_keeps_other_fields() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut db = KpDb::open(&path).unwrap();

        db.write(b"comp.lang.rust", Some(b"NB"), b"10", LockMode::Transient).unwrap();
        db.write(b"comp.lang.rust", Some(b"NE"), b"42", LockMode::Transient).unwrap();
        let old = db.read_record(b"comp.lang.rust", false).unwrap().unwrap().offset();
        let size = fs::metadata(&path).unwrap().len();

        db.write(b"comp.lang.rust", Some(b"NB"), b"9", LockMode::Transient).unwrap();

        let old_record = db.read_record_at(old, false).unwrap().expect("old record vanished");
        assert!(!old_record.is_live());
        assert_eq!(old_record.field(b"NB"), Some(&b"10"[..]));

        let new_record = db.read_record_at(size, false).unwrap().expect("no appended record");
        assert!(new_record.is_live());
        assert_eq!(new_record.as_bytes(), b"+00000000.0000:comp.lang.rust NB=9 NE=42\n");
    }

    #[test]
    fn test_write_without_field() {
        let dir = TempDir::new().unwrap();
        let mut db = KpDb::open(store_path(&dir)).unwrap();

        db.write(b"misc.test", None, b"", LockMode::Transient).unwrap();
        assert_eq!(db.read(b"misc.test", None, false).unwrap(), Some(&b"misc.test"[..]));
        assert_eq!(db.read(b"misc.test", Some(b"NB"), false).unwrap(), None);

        // Existing key: nothing to append.
        let seq = db.append_count().unwrap();
        db.write(b"misc.test", None, b"", LockMode::Transient).unwrap();
        assert_eq!(db.append_count().unwrap(), seq);
    }

    #[test]
    fn test_write_rejects_delimiters() {
        let dir = TempDir::new().unwrap();
        let mut db = KpDb::open(store_path(&dir)).unwrap();

        let bad = [
            db.write(b"alt test", Some(b"NB"), b"1", LockMode::Transient),
            db.write(b"alt.test", Some(b"N=B"), b"1", LockMode::Transient),
            db.write(b"alt.test", Some(b"NB"), b"1 2", LockMode::Transient),
            db.write(b"", Some(b"NB"), b"1", LockMode::Transient),
        ];
        for result in bad {
            match result {
                Err(e @ Error::InvalidData(_)) => assert!(!e.is_fatal()),
                other => panic!("expected invalid data, got {:?}", other),
            }
        }
        assert_eq!(db.append_count().unwrap(), 0);
    }

    #[test]
    fn test_write_encoded_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut db = KpDb::open(store_path(&dir)).unwrap();

        db.write_encoded(b"alt.test", b"D", b"Rust news & views", LockMode::Transient)
            .unwrap();
        assert_eq!(
            db.read(b"alt.test", Some(b"D"), false).unwrap(),
            Some(&b"Rust%20news%20%26%20views"[..])
        );
        assert_eq!(
            db.read_decoded(b"alt.test", b"D", false).unwrap(),
            Some(b"Rust news & views".to_vec())
        );
    }

    #[test]
    fn test_delete_hides_record() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut db = KpDb::open(&path).unwrap();

        db.write(b"alt.test", Some(b"NB"), b"1", LockMode::Transient).unwrap();
        db.write(b"alt.other", Some(b"NB"), b"1", LockMode::Transient).unwrap();
        let offset = db.read_record(b"alt.test", false).unwrap().unwrap().offset();

        assert!(db.delete(b"alt.test").expect("Failed to delete"));
        assert_eq!(db.read(b"alt.test", Some(b"NB"), false).unwrap(), None);
        assert!(db.read_record(b"alt.test", false).unwrap().is_none());
        assert!(!db.delete(b"alt.test").unwrap());
        assert!(db.read(b"alt.other", Some(b"NB"), false).unwrap().is_some());

        // The bytes stay on disk.
        let data = fs::read(&path).unwrap();
        assert_eq!(data[offset as usize], b'-');
        let line = &data[offset as usize..];
        assert!(line.starts_with(b"-00000000.0000:alt.test NB=1\n"));

        // Deleted keys can be written again.
        db.write(b"alt.test", Some(b"NE"), b"5", LockMode::Transient).unwrap();
        let record = db.read_record(b"alt.test", false).unwrap().unwrap();
        assert_eq!(record.field(b"NE"), Some(&b"5"[..]));
        assert_eq!(record.field(b"NB"), None);
    }

    #[test]
    fn test_force_resort_scenario() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut db = KpDb::open(&path).unwrap();

        for key in [&b"b.test"[..], b"a.test", b"c.test"] {
            db.write(key, Some(b"NB"), b"1", LockMode::Transient).unwrap();
        }
        assert_eq!(db.appends_since_sort().unwrap(), 3);

        db.force_resort().expect("Failed to resort");
        assert_eq!(db.appends_since_sort().unwrap(), 0);

        // Every key is now reachable through the sort slots alone.
        let data = fs::read(&path).unwrap();
        for key in [&b"a.test"[..], b"b.test", b"c.test"] {
            let span = index::search(&data, HEADER_LEN, key).expect("not found by search");
            assert_eq!(Some(span.offset as u64), naive_lookup(&path, key));
            assert!(db.read(key, Some(b"NB"), false).unwrap().is_some());
        }
        assert_eq!(index::search(&data, HEADER_LEN, b"d.test"), None);
        assert_eq!(db.read(b"d.test", None, false).unwrap(), None);
    }

    #[test]
    fn test_write_past_limit_resorts() {
        let dir = TempDir::new().unwrap();
        let config = KpConfig::new(store_path(&dir)).resort_limit(2);
        let mut db = KpDb::open_with_config(config).unwrap();

        for key in [&b"k3"[..], b"k1", b"k2"] {
            db.write(key, Some(b"x"), b"1", LockMode::Transient).unwrap();
        }
        assert_eq!(db.appends_since_sort().unwrap(), 3);
        assert_eq!(db.read_record(b"k1", false).unwrap().unwrap().sort_slot(), 0);

        // The next append resorts first, then counts itself.
        db.write(b"k4", Some(b"x"), b"1", LockMode::Transient).unwrap();
        assert_eq!(db.appends_since_sort().unwrap(), 1);
        for key in [&b"k1"[..], b"k2", b"k3"] {
            assert_ne!(db.read_record(key, false).unwrap().unwrap().sort_slot(), 0);
        }
        assert_eq!(db.read_record(b"k4", false).unwrap().unwrap().sort_slot(), 0);
        assert_eq!(db.records().unwrap().count(), 4);
    }

    #[test]
    fn test_open_past_limit_resorts() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let config = KpConfig::new(&path).resort_limit(2);

        let mut db = KpDb::open_with_config(config.clone()).unwrap();
        for key in [&b"k3"[..], b"k1", b"k2"] {
            db.write(key, Some(b"x"), b"1", LockMode::Transient).unwrap();
        }
        db.close().unwrap();

        let db = KpDb::open_with_config(config).unwrap();
        assert_eq!(db.appends_since_sort().unwrap(), 0);
        let data = fs::read(&path).unwrap();
        assert!(index::search(&data, HEADER_LEN, b"k1").is_some());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut db = KpDb::open(&path).unwrap();
        db.write(b"alt.test", Some(b"NB"), b"1", LockMode::Transient).unwrap();
        db.write(b"alt.test", Some(b"NE"), b"77", LockMode::Transient).unwrap();
        drop(db);

        let mut db = KpDb::open(&path).unwrap();
        assert_eq!(db.append_count().unwrap(), 2);
        // Below the limit and untouched, so no resort on open.
        assert_eq!(db.appends_since_sort().unwrap(), 2);
        assert_eq!(db.read(b"alt.test", Some(b"NE"), false).unwrap(), Some(&b"77"[..]));
    }

    #[test]
    fn test_outside_edit_triggers_resort() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut db = KpDb::open(&path).unwrap();
        db.write(b"b.test", Some(b"NB"), b"1", LockMode::Transient).unwrap();
        db.close().unwrap();

        // A hand edit: garbage plus a record typed in by an operator.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"stray garbage line\n").unwrap();
        file.write_all(b"+00000000.0000:a.test NB=7\n").unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(600))
            .unwrap();
        drop(file);

        let mut db = KpDb::open(&path).unwrap();
        assert_eq!(db.appends_since_sort().unwrap(), 0);
        assert_eq!(db.read(b"a.test", Some(b"NB"), false).unwrap(), Some(&b"7"[..]));
        assert_eq!(db.read(b"b.test", Some(b"NB"), false).unwrap(), Some(&b"1"[..]));
        assert_eq!(db.records().unwrap().count(), 2);

        let data = fs::read(&path).unwrap();
        assert!(index::search(&data, HEADER_LEN, b"a.test").is_some());
    }

    #[test]
    fn test_garbage_tail_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut db = KpDb::open(&path).unwrap();
        db.write(b"a.test", Some(b"NB"), b"1", LockMode::Transient).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"+zzzz\n").unwrap();
        drop(file);

        db.write(b"b.test", Some(b"NB"), b"2", LockMode::Transient).unwrap();
        assert_eq!(db.read(b"a.test", Some(b"NB"), false).unwrap(), Some(&b"1"[..]));
        assert_eq!(db.read(b"b.test", Some(b"NB"), false).unwrap(), Some(&b"2"[..]));
        assert_eq!(db.records().unwrap().count(), 2);
    }

    #[test]
    fn test_second_handle_sees_appends() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut writer = KpDb::open(&path).unwrap();
        let mut reader = KpDb::open(&path).unwrap();
        assert_eq!(reader.read(b"alt.test", None, false).unwrap(), None);

        writer.write(b"alt.test", Some(b"NB"), b"1", LockMode::Transient).unwrap();
        assert_eq!(reader.read(b"alt.test", Some(b"NB"), false).unwrap(), Some(&b"1"[..]));

        writer.write(b"alt.test", Some(b"NB"), b"22", LockMode::Transient).unwrap();
        assert_eq!(reader.read(b"alt.test", Some(b"NB"), false).unwrap(), Some(&b"22"[..]));
        assert_eq!(reader.append_count().unwrap(), 2);
        assert!(!reader.refresh().unwrap());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_nonblocking_lock_contention() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut holder = KpDb::open(&path).unwrap();
        holder.write(b"alt.test", Some(b"NB"), b"1", LockMode::Lock).unwrap();
        let offset = holder.read_record(b"alt.test", false).unwrap().unwrap().offset();

        let config = KpConfig::new(&path).nonblocking(true);
        let mut other = KpDb::open_with_config(config).unwrap();
        match other.read(b"alt.test", Some(b"NB"), true) {
            Err(Error::LockContention(at)) => assert_eq!(at, offset),
            result => panic!("expected contention, got {:?}", result),
        }
        let err = other
            .write(b"alt.test", Some(b"NB"), b"2", LockMode::Transient)
            .unwrap_err();
        assert!(!err.is_fatal());
        // Unlocked reads are never refused.
        assert_eq!(other.read(b"alt.test", Some(b"NB"), false).unwrap(), Some(&b"1"[..]));

        // Ending the lock through a write hands the record over.
        holder.write(b"alt.test", Some(b"NB"), b"3", LockMode::Unlock).unwrap();
        other.write(b"alt.test", Some(b"NB"), b"4", LockMode::Transient).unwrap();
        assert_eq!(holder.read(b"alt.test", Some(b"NB"), false).unwrap(), Some(&b"4"[..]));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_locked_read_and_unlock() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);

        let mut holder = KpDb::open(&path).unwrap();
        holder.write(b"alt.test", Some(b"NB"), b"1", LockMode::Transient).unwrap();
        let offset = holder.read_record(b"alt.test", true).unwrap().unwrap().offset();

        let mut other = KpDb::open_with_config(KpConfig::new(&path).nonblocking(true)).unwrap();
        assert!(matches!(other.delete(b"alt.test"), Err(Error::LockContention(_))));

        holder.unlock(offset).unwrap();
        assert!(other.delete(b"alt.test").unwrap());
        assert_eq!(holder.read(b"alt.test", None, false).unwrap(), None);
    }

    #[test]
    fn test_records_iterates_live_records() {
        let dir = TempDir::new().unwrap();
        let mut db = KpDb::open(store_path(&dir)).unwrap();

        for key in [&b"c"[..], b"a", b"b"] {
            db.write(key, Some(b"n"), b"1", LockMode::Transient).unwrap();
        }
        db.write(b"a", Some(b"n"), b"11", LockMode::Transient).unwrap();
        db.delete(b"b").unwrap();

        // The handle's own appends show up without an explicit refresh.
        let keys: Vec<&[u8]> = db.records().unwrap().map(|record| record.key()).collect();
        assert_eq!(keys, vec![&b"c"[..], b"a"]);
    }

    #[test]
    fn test_append_after_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut db = KpDb::open(&path).unwrap();
        db.write(b"a.test", Some(b"NB"), b"1", LockMode::Transient).unwrap();

        // A writer that died halfway through its append.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"+00000000.0000:b.test NB=").unwrap();
        drop(file);

        db.write(b"c.test", Some(b"NB"), b"3", LockMode::Transient).unwrap();
        assert_eq!(db.read(b"c.test", Some(b"NB"), false).unwrap(), Some(&b"3"[..]));
        assert_eq!(db.read(b"b.test", Some(b"NB"), false).unwrap(), None);
        assert_eq!(db.read(b"a.test", Some(b"NB"), false).unwrap(), Some(&b"1"[..]));
        assert_eq!(db.records().unwrap().count(), 2);

        let data = fs::read(&path).unwrap();
        assert!(data.ends_with(b"-00000000.0000:b.test NB=\n+00000000.0000:c.test NB=3\n"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_append_releases_locks() {
        let dir = TempDir::new().unwrap();
        let path = store_path(&dir);
        let mut db = KpDb::open(&path).unwrap();
        db.write(b"a.test", Some(b"NB"), b"1", LockMode::Transient).unwrap();
        let old = db.read_record(b"a.test", false).unwrap().unwrap().offset();
        let new = fs::metadata(&path).unwrap().len();

        // Clobber the append sequence so the append fails after its line is written.
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.write_all_at(b"zzzzzzzz", APPEND_OFF as u64).unwrap();

        let err = db
            .write(b"a.test", Some(b"NB"), b"22", LockMode::Transient)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidHeader));

        let locks = RangeLocks::new(file);
        for offset in [old, new, STRUCTURAL_LOCK] {
            assert!(
                locks.try_lock(offset, LockKind::Exclusive).unwrap(),
                "offset {} still locked",
                offset
            );
        }
    }

    #[test]
    fn test_read_record_at_bounds() {
        let dir = TempDir::new().unwrap();
        let mut db = KpDb::open(store_path(&dir)).unwrap();
        db.write(b"a", Some(b"n"), b"1", LockMode::Transient).unwrap();
        db.refresh().unwrap();

        assert!(db.read_record_at(0, false).unwrap().is_none());
        assert!(db.read_record_at(HEADER_LEN as u64 + 3, false).unwrap().is_none());
        assert!(db.read_record_at(1 << 20, false).unwrap().is_none());
        let record = db.read_record_at(HEADER_LEN as u64, false).unwrap().unwrap();
        assert_eq!(record.key(), b"a");
    }

    #[test]
    fn test_lookup_agrees_with_linear_scan() {
        let keys: Vec<Vec<u8>> = (0..16).map(|i| format!("grp.{}", i).into_bytes()).collect();
        let fields = [&b"a"[..], b"b"];

        for seed in [7u64, 42, 1999] {
            let dir = TempDir::new().unwrap();
            let path = store_path(&dir);
            let config = KpConfig::new(&path).resort_limit(8);
            let mut db = KpDb::open_with_config(config.clone()).unwrap();
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut model: HashMap<Vec<u8>, HashMap<Vec<u8>, Vec<u8>>> = HashMap::new();

            for step in 0..250 {
                let key = &keys[rng.random_range(0..keys.len())];
                match rng.random_range(0..100) {
                    0..=69 => {
                        let field = fields[rng.random_range(0..fields.len())];
                        let len = rng.random_range(1..5);
                        let value: Vec<u8> = (0..len).map(|_| b'0' + rng.random_range(0..10)).collect();
                        db.write(key, Some(field), &value, LockMode::Transient).unwrap();
                        model
                            .entry(key.clone())
                            .or_default()
                            .insert(field.to_vec(), value);
                    }
                    70..=89 => {
                        let deleted = db.delete(key).unwrap();
                        assert_eq!(deleted, model.remove(key).is_some(), "seed {} step {}", seed, step);
                    }
                    90..=94 => db.force_resort().unwrap(),
                    _ => {
                        db.close().unwrap();
                        db = KpDb::open_with_config(config.clone()).unwrap();
                    }
                }

                for key in &keys {
                    let expected = model.get(key);
                    for field in fields {
                        let want = expected.and_then(|fields| fields.get(field)).map(|v| v.as_slice());
                        assert_eq!(
                            db.read(key, Some(field), false).unwrap(),
                            want,
                            "seed {} step {} key {:?}",
                            seed,
                            step,
                            String::from_utf8_lossy(key)
                        );
                    }
                    let found = db.read_record(key, false).unwrap().map(|r| r.offset());
                    assert_eq!(found, naive_lookup(&path, key), "seed {} step {}", seed, step);
                }
            }
        }
    }
}
