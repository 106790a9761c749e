use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

/// Every lock covers this many bytes starting at its offset.
pub const LOCK_LEN: u64 = 4;

/// Lock held shared by every open handle, probed to find the first opener.
pub const OPEN_LOCK: u64 = 0;

/// Lock serializing open-time checks, appends and resorts.
pub const STRUCTURAL_LOCK: u64 = 4;

// Open file description locks belong to the descriptor rather than the
// process, so two handles in one process exclude each other and closing an
// unrelated descriptor does not drop them.
#[cfg(target_os = "linux")]
const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const SET_LOCK_WAIT: libc::c_int = libc::F_OFD_SETLKW;

#[cfg(not(target_os = "linux"))]
const SET_LOCK: libc::c_int = libc::F_SETLK;
#[cfg(not(target_os = "linux"))]
const SET_LOCK_WAIT: libc::c_int = libc::F_SETLKW;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// Advisory byte-range locks on a single open file, keyed by offset.
#[derive(Debug)]
pub struct RangeLocks {
    file: File,
}

impl RangeLocks {
    pub fn new(file: File) -> Self {
        Self { file }
    }

    /// Acquires a lock at `offset`, waiting for conflicting holders.
    pub fn lock(&self, offset: u64, kind: LockKind) -> io::Result<()> {
        loop {
            match self.set(offset, lock_type(kind), true) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    /// Attempts a lock at `offset` without waiting. Returns `Ok(false)` when
    /// another holder conflicts.
    pub fn try_lock(&self, offset: u64, kind: LockKind) -> io::Result<bool> {
        match self.set(offset, lock_type(kind), false) {
            Ok(()) => Ok(true),
            Err(e) if is_contention(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn unlock(&self, offset: u64) -> io::Result<()> {
        self.set(offset, libc::F_UNLCK as libc::c_short, false)
    }

    fn set(&self, offset: u64, l_type: libc::c_short, wait: bool) -> io::Result<()> {
        // l_pid must stay zero for open file description locks.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = l_type;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = offset as libc::off_t;
        fl.l_len = LOCK_LEN as libc::off_t;

        let cmd = if wait { SET_LOCK_WAIT } else { SET_LOCK };
        let result = unsafe { libc::fcntl(self.file.as_raw_fd(), cmd, &fl) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::trace!(offset, l_type, wait, "byte-range lock");
        Ok(())
    }
}

fn lock_type(kind: LockKind) -> libc::c_short {
    match kind {
        LockKind::Shared => libc::F_RDLCK as libc::c_short,
        LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
    }
}

fn is_contention(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EACCES)
}
