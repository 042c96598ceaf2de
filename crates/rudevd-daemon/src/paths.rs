//! Runtime directory layout.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Locations of the daemon's runtime state under `/run/udev`.
///
/// Tests point the root at a temporary directory; the layout below it is
/// fixed.
#[derive(Debug, Clone)]
pub struct RuntimeDirs {
    root: PathBuf,
}

impl RuntimeDirs {
    /// The system location.
    #[must_use]
    pub fn system() -> Self {
        Self::at("/run/udev")
    }

    /// A layout rooted elsewhere, for tests.
    #[must_use]
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and subdirectories.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when a directory cannot be
    /// created.
    pub fn ensure(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.watch_dir())?;
        fs::create_dir_all(self.tags_dir())?;
        Ok(())
    }

    /// The root runtime directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Marker file whose presence means "events pending or workers busy";
    /// external settle tooling polls it.
    #[must_use]
    pub fn queue_marker(&self) -> PathBuf {
        self.root.join("queue")
    }

    /// Administrative control socket.
    #[must_use]
    pub fn control_socket(&self) -> PathBuf {
        self.root.join("control")
    }

    /// Per-device persistent records.
    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Tag indices.
    #[must_use]
    pub fn tags_dir(&self) -> PathBuf {
        self.root.join("tags")
    }

    /// Watch records mapping inotify descriptors to devices.
    #[must_use]
    pub fn watch_dir(&self) -> PathBuf {
        self.root.join("watch")
    }
}

impl Default for RuntimeDirs {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let dirs = RuntimeDirs::at("/tmp/x");
        assert_eq!(dirs.queue_marker(), PathBuf::from("/tmp/x/queue"));
        assert_eq!(dirs.control_socket(), PathBuf::from("/tmp/x/control"));
        assert_eq!(dirs.data_dir(), PathBuf::from("/tmp/x/data"));
        assert_eq!(dirs.watch_dir(), PathBuf::from("/tmp/x/watch"));
    }

    #[test]
    fn test_ensure_creates_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = RuntimeDirs::at(tmp.path().join("udev"));
        dirs.ensure().unwrap();
        assert!(dirs.data_dir().is_dir());
        assert!(dirs.watch_dir().is_dir());
        assert!(dirs.tags_dir().is_dir());
    }
}
