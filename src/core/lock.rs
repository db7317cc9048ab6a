//! Advisory lock guarding the state directory.
//!
//! The ledger and ticket logs assume a single writing process; the lock turns
//! a second concurrent process into a clean startup error instead of
//! interleaved writes.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

/// Held for the lifetime of the process; released on drop
#[derive(Debug)]
pub struct StateLock {
    file: File,
    path: PathBuf,
}

impl StateLock {
    /// Acquire the lock, failing fast if another process holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        file.try_lock_exclusive().with_context(|| {
            format!(
                "Another filament process holds the state directory ({})",
                path.display()
            )
        })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.lock");

        let held = StateLock::acquire(&path).unwrap();
        assert!(StateLock::acquire(&path).is_err());

        drop(held);
        assert!(StateLock::acquire(&path).is_ok());
    }
}
