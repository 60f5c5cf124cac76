//! Scoped scratch directories for patch steps

use std::path::{Path, PathBuf};

use ltbox_core::prelude::*;

/// A working directory removed when dropped
///
/// Removal happens on every exit path, including early `?` returns and
/// unwinding panics.
#[derive(Debug)]
pub struct ScratchDir {
    dir: tempfile::TempDir,
}

impl ScratchDir {
    /// Create a fresh directory named `<prefix>*` inside `parent`
    pub fn create_in(parent: &Path, prefix: &str) -> Result<Self> {
        std::fs::create_dir_all(parent).map_err(|e| Error::file(parent, e))?;
        let dir = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(parent)
            .map_err(|e| Error::file(parent, e))?;
        debug!("Created scratch directory {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        debug!("Removing scratch directory {}", self.dir.path().display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_removed_on_drop() {
        let root = tempdir().unwrap();
        let path = {
            let scratch = ScratchDir::create_in(root.path(), "vendor_boot-").unwrap();
            std::fs::write(scratch.join("vendor_boot.img"), b"data").unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_removed_on_error_path() {
        fn failing_step(root: &Path) -> Result<PathBuf> {
            let scratch = ScratchDir::create_in(root, "boot-")?;
            let path = scratch.path().to_path_buf();
            std::fs::read(scratch.join("missing.img")).map_err(|e| Error::file(&path, e))?;
            Ok(path)
        }

        let root = tempdir().unwrap();
        assert!(failing_step(root.path()).is_err());
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_creates_missing_parent() {
        let root = tempdir().unwrap();
        let parent = root.path().join("nested/tmp");
        let scratch = ScratchDir::create_in(&parent, "x-").unwrap();
        assert!(scratch.path().starts_with(&parent));
    }
}
