// remotebackup/src/backup/archive.rs
use serde::Deserialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::errors::{BackupError, Result};
use crate::utils::{find_any_executable, is_readable_dir, is_readable_file, optional_executable};

/// What goes into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSources {
    /// Archive the full contents of one staging directory.
    StagingDir(PathBuf),
    /// Archive these files and directories by reference, without staging.
    Paths(Vec<PathBuf>),
}

/// Tuning knobs for the archive mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ArchiveOptions {
    /// 7z `-mx` level, 0..=9.
    pub compression_level: u8,
    /// Overrides the derived thread count.
    pub threads: Option<usize>,
    /// CPU niceness passed to `nice -n`, when `nice` exists.
    pub nice: Option<i32>,
    /// Run under the idle IO scheduling class, when `ionice` exists.
    pub ionice: bool,
    /// Explicit path to the 7z binary; looked up in PATH otherwise.
    pub program: Option<PathBuf>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression_level: 9,
            threads: None,
            nice: Some(19),
            ionice: true,
            program: None,
        }
    }
}

/// Builds one password protected archive.
pub trait Archiver: Send + Sync {
    fn build_archive(
        &self,
        sources: &ArchiveSources,
        password: &str,
        output: &Path,
        options: &ArchiveOptions,
    ) -> Result<PathBuf>;
}

/// Thread count for the compressor: keep one core free on hosts with more
/// than two, so a co-located database server stays responsive.
pub fn derive_thread_count(cores: usize) -> usize {
    if cores > 2 { cores - 1 } else { cores.max(1) }
}

pub fn detected_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Validates the password and sources, and returns the absolute paths to hand
/// to the archive mechanism. A staging directory expands to its children so
/// member names are relative to the staging root.
pub fn resolve_sources(sources: &ArchiveSources, password: &str) -> Result<Vec<PathBuf>> {
    if password.is_empty() {
        return Err(BackupError::Config("Password is required".into()));
    }

    let inputs = match sources {
        ArchiveSources::StagingDir(dir) => {
            if !is_readable_dir(dir) {
                return Err(BackupError::Config(format!(
                    "Directory is not readable: {}",
                    dir.display()
                )));
            }
            let dir = std::path::absolute(dir)?;
            let mut children = fs::read_dir(&dir)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<Vec<_>>>()?;
            children.sort();
            children
        }
        ArchiveSources::Paths(paths) => {
            let mut resolved = Vec::with_capacity(paths.len());
            for path in paths {
                if !is_readable_file(path) && !is_readable_dir(path) {
                    return Err(BackupError::Config(format!(
                        "Source is not readable: {}",
                        path.display()
                    )));
                }
                resolved.push(std::path::absolute(path)?);
            }
            resolved
        }
    };

    if inputs.is_empty() {
        return Err(BackupError::Archive("Nothing to archive".into()));
    }
    Ok(inputs)
}

/// Optional scheduling wrappers available on this host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityHints {
    pub ionice: Option<PathBuf>,
    pub nice: Option<(PathBuf, i32)>,
}

impl PriorityHints {
    pub fn detect(options: &ArchiveOptions) -> Self {
        Self {
            ionice: options
                .ionice
                .then(|| optional_executable("ionice"))
                .flatten(),
            nice: options
                .nice
                .and_then(|n| optional_executable("nice").map(|p| (p, n))),
        }
    }
}

/// 7-Zip backed archiver: LZMA2, AES-256 with encrypted headers.
///
/// 7z only accepts a non-interactive password as `-p<password>`, so the
/// archive password is visible in the process list (`ps`) of this host for
/// as long as compression runs. Run backups on hosts without untrusted local
/// users, or with `hidepid` set on `/proc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SevenZipArchiver;

impl SevenZipArchiver {
    fn locate(options: &ArchiveOptions) -> Result<PathBuf> {
        match &options.program {
            Some(p) => Ok(p.clone()),
            None => find_any_executable(&["7z", "7za", "7zz"]),
        }
    }
}

/// Full argv, including the optional `ionice`/`nice` wrappers.
pub(crate) fn seven_zip_argv(
    program: &Path,
    inputs: &[PathBuf],
    password: &str,
    output: &Path,
    options: &ArchiveOptions,
    threads: usize,
    hints: &PriorityHints,
) -> Vec<OsString> {
    let mut argv: Vec<OsString> = Vec::new();
    if let Some(ionice) = &hints.ionice {
        argv.push(ionice.into());
        argv.extend(["-c".into(), "3".into()]);
    }
    if let Some((nice, level)) = &hints.nice {
        argv.push(nice.into());
        argv.extend(["-n".into(), level.to_string().into()]);
    }
    argv.push(program.into());
    argv.extend(
        [
            "a".to_string(),
            "-t7z".to_string(),
            "-m0=lzma2".to_string(),
            format!("-mx={}", options.compression_level.min(9)),
            "-mfb=64".to_string(),
            "-md=32m".to_string(),
            "-ms=on".to_string(),
            "-mhe=on".to_string(),
            format!("-mmt={}", threads),
            "-y".to_string(),
            format!("-p{}", password),
        ]
        .map(OsString::from),
    );
    argv.push(output.into());
    argv.extend(inputs.iter().map(OsString::from));
    argv
}

impl Archiver for SevenZipArchiver {
    fn build_archive(
        &self,
        sources: &ArchiveSources,
        password: &str,
        output: &Path,
        options: &ArchiveOptions,
    ) -> Result<PathBuf> {
        let inputs = resolve_sources(sources, password)?;
        let program = Self::locate(options)?;
        let threads = options
            .threads
            .unwrap_or_else(|| derive_thread_count(detected_cores()));
        let hints = PriorityHints::detect(options);

        // `7z a` appends to an existing archive.
        if output.exists() {
            fs::remove_file(output)?;
        }

        let argv = seven_zip_argv(&program, &inputs, password, output, options, threads, &hints);
        let result = Command::new(&argv[0]).args(&argv[1..]).output().map_err(|e| {
            BackupError::Archive(format!("Failed to execute {}: {}", program.display(), e))
        })?;

        if !result.status.success() {
            return Err(BackupError::Archive(format!(
                "7z exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }
        if !output.is_file() {
            return Err(BackupError::Archive(format!(
                "7z reported success but {} was not created",
                output.display()
            )));
        }
        Ok(output.to_path_buf())
    }
}
