// remotebackup/src/backup/sources.rs
use std::path::{Path, PathBuf};

use crate::utils::{is_readable_dir, is_readable_file};

/// One registered file or directory and where it lands inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub source: PathBuf,
    pub target_dir: String,
}

/// Registry of files and directories to include in a backup.
///
/// Identity is the absolute source path, so registering the same path twice
/// keeps the first registration and ignores the rest. Only sources that exist
/// and are readable at registration time are accepted.
#[derive(Debug, Clone, Default)]
pub struct SourceCollector {
    files: Vec<SourceEntry>,
    dirs: Vec<SourceEntry>,
}

fn identity(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

fn register(entries: &mut Vec<SourceEntry>, path: &Path, target_dir: &str) -> bool {
    let source = identity(path);
    if entries.iter().any(|e| e.source == source) {
        return false;
    }
    entries.push(SourceEntry {
        source,
        target_dir: target_dir.to_string(),
    });
    true
}

impl SourceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the file was newly registered.
    pub fn register_file(&mut self, path: impl AsRef<Path>, target_dir: &str) -> bool {
        let path = path.as_ref();
        if !is_readable_file(path) {
            return false;
        }
        register(&mut self.files, path, target_dir)
    }

    /// Returns whether the directory was newly registered.
    pub fn register_dir(&mut self, path: impl AsRef<Path>, target_dir: &str) -> bool {
        let path = path.as_ref();
        if !is_readable_dir(path) {
            return false;
        }
        register(&mut self.dirs, path, target_dir)
    }

    pub fn files(&self) -> &[SourceEntry] {
        &self.files
    }

    pub fn dirs(&self) -> &[SourceEntry] {
        &self.dirs
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.dirs.is_empty()
    }
}
