pub mod logger;
pub mod report;

use std::fs::{self, File, FileTimes};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use which::which;

use crate::errors::{BackupError, Result};

/// Finds a required executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).map_err(|_| {
        BackupError::Config(format!(
            "{} executable not found in PATH. Please ensure it is installed and in your PATH.",
            name
        ))
    })
}

/// Finds the first available executable out of several candidate names.
pub fn find_any_executable(names: &[&str]) -> Result<PathBuf> {
    names
        .iter()
        .find_map(|name| which(name).ok())
        .ok_or_else(|| {
            BackupError::Config(format!(
                "None of {:?} found in PATH. Please ensure one of them is installed.",
                names
            ))
        })
}

/// Looks up an optional helper binary; absence is not an error.
pub fn optional_executable(name: &str) -> Option<PathBuf> {
    which(name).ok()
}

/// Strips leading and trailing slashes from a target subdirectory.
/// An empty result means "the staging root itself".
pub fn normalize_target_subdir(target_dir: &str) -> PathBuf {
    PathBuf::from(target_dir.trim().trim_matches('/'))
}

pub fn is_readable_file(path: &Path) -> bool {
    path.is_file() && File::open(path).is_ok()
}

pub fn is_readable_dir(path: &Path) -> bool {
    path.is_dir() && fs::read_dir(path).is_ok()
}

/// Checks that a directory exists and that a file can actually be created in it.
pub fn is_writable_dir(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    let marker = path.join(format!(".write_check_{}", std::process::id()));
    match File::create(&marker) {
        Ok(_) => {
            let _ = fs::remove_file(&marker);
            true
        }
        Err(_) => false,
    }
}

/// Copies timestamps from `src` metadata onto `dst`; best effort.
fn preserve_times(src_meta: &fs::Metadata, dst: &Path) {
    let mut times = FileTimes::new();
    if let Ok(modified) = src_meta.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = src_meta.accessed() {
        times = times.set_accessed(accessed);
    }
    let handle = if src_meta.is_dir() {
        File::open(dst)
    } else {
        File::options().write(true).open(dst)
    };
    if let Ok(handle) = handle {
        let _ = handle.set_times(times);
    }
}

/// Copies a single file, keeping permissions and timestamps. Returns bytes copied.
pub fn copy_file_preserving(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let meta = fs::metadata(src)?;
    let bytes = fs::copy(src, dst)?;
    fs::set_permissions(dst, meta.permissions())?;
    preserve_times(&meta, dst);
    Ok(bytes)
}

/// Recursively copies `src` to `dst` (`dst` becomes the copy of `src`).
/// Permissions and timestamps are preserved, like `cp -pr`.
///
/// Anything at a path listed in `exclude` is skipped together with its
/// contents. The walk never enters `dst` itself, so copying a directory
/// into one of its own descendants terminates.
pub fn copy_dir_recursive(src: &Path, dst: &Path, exclude: &[PathBuf]) -> std::io::Result<u64> {
    let mut total = 0;
    let mut dirs = Vec::new();

    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.path() != dst && !exclude.iter().any(|x| e.path() == x.as_path()));
    for entry in walker {
        let entry = entry.map_err(std::io::Error::other)?;
        let path = entry.path();
        let rel = path.strip_prefix(src).map_err(std::io::Error::other)?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            dirs.push((path.to_path_buf(), target));
        } else if file_type.is_symlink() {
            copy_symlink(path, &target)?;
        } else {
            total += copy_file_preserving(path, &target)?;
        }
    }

    // Directory metadata last, deepest first, so file writes do not bump mtimes again.
    for (src_dir, dst_dir) in dirs.into_iter().rev() {
        let meta = fs::metadata(&src_dir)?;
        fs::set_permissions(&dst_dir, meta.permissions())?;
        preserve_times(&meta, &dst_dir);
    }

    Ok(total)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    let link = fs::read_link(src)?;
    std::os::unix::fs::symlink(link, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> std::io::Result<()> {
    copy_file_preserving(src, dst).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    #[test]
    fn test_normalize_target_subdir() {
        assert_eq!(normalize_target_subdir("/sub/"), PathBuf::from("sub"));
        assert_eq!(normalize_target_subdir("a/b/"), PathBuf::from("a/b"));
        assert_eq!(normalize_target_subdir(""), PathBuf::from(""));
        assert_eq!(normalize_target_subdir("/"), PathBuf::from(""));
    }

    #[test]
    fn test_copy_dir_recursive_keeps_tree_and_mtime() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested"))?;
        fs::write(src.join("a.txt"), "alpha")?;
        fs::write(src.join("nested/b.txt"), "beta")?;

        let old = SystemTime::now() - Duration::from_secs(3 * 86_400);
        File::options()
            .write(true)
            .open(src.join("a.txt"))?
            .set_modified(old)?;

        let dst = tmp.path().join("out/src");
        fs::create_dir_all(tmp.path().join("out"))?;
        let bytes = copy_dir_recursive(&src, &dst, &[])?;

        assert_eq!(bytes, 9);
        assert_eq!(fs::read_to_string(dst.join("nested/b.txt"))?, "beta");
        let copied = fs::metadata(dst.join("a.txt"))?.modified()?;
        let drift = copied
            .duration_since(old)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn test_copy_into_own_subtree_skips_excluded() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        let var = tmp.path().join("var");
        fs::create_dir_all(var.join("tmp/Backup_debug"))?;
        fs::write(var.join("log.txt"), "log")?;
        fs::write(var.join("tmp/Backup_debug.7z"), "half written")?;
        let work = var.join("tmp/Backup_debug");
        let archive = var.join("tmp/Backup_debug.7z");

        let dst = work.join("var");
        let bytes = copy_dir_recursive(&var, &dst, &[work.clone(), archive])?;

        assert_eq!(bytes, 3);
        assert_eq!(fs::read_to_string(dst.join("log.txt"))?, "log");
        assert!(dst.join("tmp").is_dir());
        assert!(!dst.join("tmp/Backup_debug").exists());
        assert!(!dst.join("tmp/Backup_debug.7z").exists());
        Ok(())
    }

    #[test]
    fn test_writable_dir_detection() -> anyhow::Result<()> {
        let tmp = tempdir()?;
        assert!(is_writable_dir(tmp.path()));
        assert!(!is_writable_dir(&tmp.path().join("missing")));
        assert_eq!(fs::read_dir(tmp.path())?.count(), 0);
        Ok(())
    }
}
