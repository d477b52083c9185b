//! Change detection for the reference files pushed to every gateway.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Remembers the last seen modification time of one file.
#[derive(Debug)]
pub struct FileWatch {
    path: PathBuf,
    modified: Option<SystemTime>,
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl FileWatch {
    /// Start watching, taking the current state as the baseline.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let modified = modified(&path);
        Self { path, modified }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file changed since the previous call. A file that
    /// disappears is not a change worth pushing.
    pub fn changed(&mut self) -> bool {
        let current = modified(&self.path);
        if current.is_none() || current == self.modified {
            return false;
        }
        self.modified = current;
        true
    }
}
