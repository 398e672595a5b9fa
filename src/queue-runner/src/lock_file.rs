/// Exclusive advisory lock guaranteeing at most one active scheduler. Held
/// for the process lifetime; releasing is handled by Drop.
pub(crate) struct LockFile {
    path: std::path::PathBuf,
    file: fs_err::File,
}

impl LockFile {
    pub(crate) fn acquire(path: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let file = fs_err::File::create(&path)?;
        file.file().try_lock().map_err(|e| match e {
            std::fs::TryLockError::Error(e) => e,
            std::fs::TryLockError::WouldBlock => {
                std::io::Error::new(std::io::ErrorKind::WouldBlock, "lock is held")
            }
        })?;
        Ok(Self { path, file })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.file.file().unlock();
        let _ = fs_err::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue-runner/lock");

        let lock = LockFile::acquire(&path).unwrap();
        assert!(LockFile::acquire(&path).is_err());

        drop(lock);
        let _relock = LockFile::acquire(&path).unwrap();
    }
}
