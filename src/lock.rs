//! Advisory writer lock for a corpus directory.
//!
//! Ingest holds the lock across reload -> append -> commit; search never
//! takes it and reads whatever generation is committed.
//!
//! flock locks belong to the open file description, so two handles opened in
//! the same process exclude each other just like two processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Lock file name placed in the corpus directory
const LOCK_FILE_NAME: &str = ".lock";

/// Exclusive lock on a corpus directory, released on drop.
pub struct CorpusLock {
    // held only for its descriptor
    #[allow(dead_code)]
    file: File,
}

impl CorpusLock {
    /// Take the lock if it is free, `WouldBlock` otherwise.
    pub fn try_acquire(dir: &Path) -> io::Result<Self> {
        Self::acquire(dir, false)
    }

    /// Take the lock, waiting for the current holder to release it.
    pub fn acquire_blocking(dir: &Path) -> io::Result<Self> {
        Self::acquire(dir, true)
    }

    fn acquire(dir: &Path, wait: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE_NAME))?;

        sys::lock(&file, wait)?;
        Ok(CorpusLock { file })
    }
}

impl Drop for CorpusLock {
    fn drop(&mut self) {
        sys::unlock(&self.file);
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn lock(file: &File, wait: bool) -> io::Result<()> {
        let operation = if wait {
            libc::LOCK_EX
        } else {
            libc::LOCK_EX | libc::LOCK_NB
        };

        loop {
            if unsafe { libc::flock(file.as_raw_fd(), operation) } == 0 {
                return Ok(());
            }

            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
                    return Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "Corpus is locked by another writer",
                    ));
                }
                _ => return Err(err),
            }
        }
    }

    pub fn unlock(file: &File) {
        // errors on release are not actionable
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    }
}

#[cfg(not(unix))]
mod sys {
    use std::fs::File;
    use std::io;

    // no advisory locking here; writers of one process are still ordered
    // by the service
    pub fn lock(_file: &File, _wait: bool) -> io::Result<()> {
        Ok(())
    }

    pub fn unlock(_file: &File) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_second_holder_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let first = CorpusLock::try_acquire(dir.path()).unwrap();

        match CorpusLock::try_acquire(dir.path()) {
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::WouldBlock),
            Ok(_) => panic!("lock acquired twice"),
        }

        drop(first);
        assert!(CorpusLock::try_acquire(dir.path()).is_ok());
        assert!(dir.path().join(LOCK_FILE_NAME).is_file());
    }

    #[test]
    fn test_blocking_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let held = CorpusLock::try_acquire(dir.path()).unwrap();

        let (tx, rx) = mpsc::channel();
        let path = dir.path().to_path_buf();
        let waiter = std::thread::spawn(move || {
            let _lock = CorpusLock::acquire_blocking(&path).unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        waiter.join().unwrap();
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CorpusLock::try_acquire(&dir.path().join("nope")).is_err());
    }
}
