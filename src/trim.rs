//! Offline reclamation of tombstoned records.
//!
//! Records never move while a store is open, so dead bytes can only be
//! dropped when nobody has it open. The store is copied without its
//! tombstones, renamed over the store file and resorted.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::KpConfig;
use crate::error::Result;
use crate::flock::{LockKind, RangeLocks, OPEN_LOCK};
use crate::store::header::{hex8, Header, FRESH_SORT_COUNT, HEADER_LEN};
use crate::store::record::{has_slot, Record, DEAD, SLOT_LEN, SLOT_OFF, UNSORTED};
use crate::store::KpDb;
use crate::Error;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrimStats {
    pub kept: usize,
    pub dropped: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// Rewrites the store at `path` without tombstones. Fails with
/// `LockContention(0)` if any handle has it open.
pub fn trim(path: impl AsRef<Path>) -> Result<TrimStats> {
    let path = path.as_ref();
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let locks = RangeLocks::new(file.try_clone()?);
    if !locks
        .try_lock(OPEN_LOCK, LockKind::Exclusive)
        .map_err(Error::LockError)?
    {
        return Err(Error::LockContention(OPEN_LOCK));
    }

    let tmp = tmp_path(path);
    let stats = match copy_live(&file, &tmp) {
        Ok(stats) => stats,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };
    fs::rename(&tmp, path)?;
    locks.unlock(OPEN_LOCK).map_err(Error::LockError)?;
    drop(locks);
    drop(file);

    let mut db = KpDb::open_with_config(KpConfig::new(path).create(false))?;
    db.force_resort()?;
    db.close()?;

    tracing::info!(
        path = %path.display(),
        kept = stats.kept,
        dropped = stats.dropped,
        bytes_before = stats.bytes_before,
        bytes_after = stats.bytes_after,
        "trimmed store"
    );
    Ok(stats)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".tmp{}", std::process::id()));
    PathBuf::from(name)
}

/// Copies every line but tombstones. Kept records lose their sort slots and
/// the header asks for a resort, so the copy is searchable by tail scan alone.
fn copy_live(src: &File, dst: &Path) -> Result<TrimStats> {
    let mut reader = BufReader::new(src);
    let out = File::create(dst)?;
    let mut writer = BufWriter::new(&out);
    let mut stats = TrimStats::default();

    let mut line = Vec::new();
    reader.read_until(b'\n', &mut line)?;
    let mut header = Header::try_from(line.as_slice())?;
    header.since_sort = FRESH_SORT_COUNT;
    writer.write_all(&header.encode())?;
    stats.bytes_before += line.len() as u64;
    stats.bytes_after += HEADER_LEN as u64;

    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        stats.bytes_before += n as u64;
        if line[0] == DEAD {
            stats.dropped += 1;
            continue;
        }
        if Record::from_line(&line, 0).is_ok() {
            stats.kept += 1;
        }
        if has_slot(&line) {
            line[SLOT_OFF..SLOT_OFF + SLOT_LEN].copy_from_slice(&hex8(UNSORTED));
        }
        writer.write_all(&line)?;
        stats.bytes_after += n as u64;
    }

    writer.flush()?;
    drop(writer);
    out.sync_all()?;
    Ok(stats)
}
