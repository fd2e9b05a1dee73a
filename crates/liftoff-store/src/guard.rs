use crate::StoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Cross-process exclusive file lock, held until dropped.
///
/// Serializes read-check-write sequences on one file tree so that lock
/// acquisition and token checks are atomic with the write they protect.
pub struct FileGuard {
    file: File,
}

impl FileGuard {
    fn open(path: &Path) -> Result<File, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?)
    }

    pub fn acquire(path: &Path) -> Result<Self, StoreError> {
        let file = Self::open(path)?;
        file.lock_exclusive().map_err(|e| {
            StoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e))
        })?;
        Ok(Self { file })
    }

    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StoreError> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/.guard");

        let _guard = FileGuard::acquire(&path).unwrap();
        assert!(path.exists());
        assert!(FileGuard::try_acquire(&path).unwrap().is_none());
    }

    #[test]
    fn guard_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".guard");

        {
            let _guard = FileGuard::acquire(&path).unwrap();
        }
        assert!(FileGuard::try_acquire(&path).unwrap().is_some());
    }
}
