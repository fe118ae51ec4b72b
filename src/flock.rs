use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive lock on a store directory. The engine does not support
/// cross-process sharing of one store, so opening takes this lock and
/// holds it until the database is dropped.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file (if needed) and acquires the lock. The file
    /// contains the owning process ID for debugging.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        Self::try_lock(&file)?;

        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock(_file: &File) -> io::Result<()> {
        // No advisory locking on this platform; single-process use is
        // the caller's responsibility.
        Ok(())
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // The OS releases the lock when the file handle closes. The lock
        // file itself is left in place to avoid unlink races.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_lock_contains_pid() {
        let dir = TempDir::new().expect("temp dir");
        let lock_path = dir.path().join("store.lock");

        let _lock = FileLock::lock(&lock_path).expect("acquire lock");

        assert!(lock_path.exists());
        let content = std::fs::read_to_string(&lock_path).expect("read lock file");
        assert!(content.contains(&std::process::id().to_string()));
    }

    #[cfg(unix)]
    #[test]
    fn test_double_lock_fails() {
        let dir = TempDir::new().expect("temp dir");
        let lock_path = dir.path().join("store.lock");

        let _lock1 = FileLock::lock(&lock_path).expect("first lock");
        assert!(FileLock::lock(&lock_path).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_relock_after_drop() {
        let dir = TempDir::new().expect("temp dir");
        let lock_path = dir.path().join("store.lock");

        {
            let _lock = FileLock::lock(&lock_path).expect("first lock");
        }
        let _lock2 = FileLock::lock(&lock_path).expect("relock after drop");
    }
}
