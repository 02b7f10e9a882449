//! File locking for mutual exclusion between catalog processes.
//!
//! Uses flock() for advisory locking on the catalog directory. Every
//! mutation holds the lock from reading `CURRENT` until the new generation
//! is committed.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed in the base directory
const LOCK_FILE_NAME: &str = "catalog.lock";

/// A held file lock that releases on drop
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    /// Acquire the lock, waiting for another process to release it.
    pub fn acquire(base_path: &Path) -> io::Result<Self> {
        match Self::try_acquire(base_path) {
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                log::info!("catalog is locked by another process, waiting");
                Self::acquire_blocking(base_path)
            }
            result => result,
        }
    }

    /// Attempt to acquire an exclusive lock on the catalog directory.
    /// Returns `Ok(FileLock)` if acquired, or an error if locked by another process.
    pub fn try_acquire(base_path: &Path) -> io::Result<Self> {
        let file = Self::open(base_path)?;
        Self::try_lock_exclusive(&file)?;
        Ok(FileLock { file })
    }

    /// Acquire an exclusive lock, blocking until available.
    pub fn acquire_blocking(base_path: &Path) -> io::Result<Self> {
        let file = Self::open(base_path)?;
        Self::lock_exclusive(&file)?;
        Ok(FileLock { file })
    }

    fn open(base_path: &Path) -> io::Result<File> {
        std::fs::create_dir_all(base_path)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(base_path.join(LOCK_FILE_NAME))
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "Catalog is locked by another process",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // no advisory locking outside unix
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // Release the lock - ignore errors on drop
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();

        // First lock should succeed
        let lock1 = FileLock::try_acquire(tmp.path());
        assert!(lock1.is_ok(), "First lock should succeed");

        // Second lock should fail (non-blocking)
        let lock2 = FileLock::try_acquire(tmp.path());
        assert!(lock2.is_err(), "Second lock should fail");

        drop(lock1);

        // Now third lock should succeed
        let lock3 = FileLock::acquire(tmp.path());
        assert!(lock3.is_ok(), "Third lock should succeed after release");
        assert!(tmp.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let tmp = tempfile::tempdir().unwrap();
        let held = FileLock::try_acquire(tmp.path()).unwrap();

        let path = tmp.path().to_path_buf();
        let waiter = std::thread::spawn(move || FileLock::acquire(&path).is_ok());

        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(held);

        assert!(waiter.join().unwrap());
    }
}
