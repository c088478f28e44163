// remotebackup/src/backup/logic.rs
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::archive::{ArchiveOptions, ArchiveSources, Archiver, SevenZipArchiver};
use super::db_dump::{DatabaseExporter, DumpOutcome};
use super::sources::SourceCollector;
use super::spec::BackupSpec;
use crate::errors::{BackupError, Result};
use crate::remote::{self, TargetOutcome};
use crate::utils::report::Reporter;
use crate::utils::{
    copy_dir_recursive, copy_file_preserving, is_readable_dir, is_readable_file,
    is_writable_dir, normalize_target_subdir,
};

const SQL_DUMP_DIR: &str = "SQLDump";
const DEBUG_RUN_ID: &str = "Backup_debug";

/// A registered source that could not be staged or referenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingFailure {
    pub source: PathBuf,
    pub reason: String,
}

/// What a completed run did. Only returned when archival succeeded; remote
/// failures are listed in `targets`.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub archive_bytes: u64,
    pub database_outcomes: Vec<DumpOutcome>,
    pub staging_failures: Vec<StagingFailure>,
    pub targets: Vec<TargetOutcome>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn failed_targets(&self) -> usize {
        self.targets.iter().filter(|t| !t.success()).count()
    }
}

/// `Backup_<yyMMdd_HHmm>`, or a fixed name in debug mode.
pub fn run_identifier(debug: bool, now: DateTime<Local>) -> String {
    if debug {
        DEBUG_RUN_ID.to_string()
    } else {
        format!("Backup_{}", now.format("%y%m%d_%H%M"))
    }
}

/// Removes the working directory and the archive on every exit path,
/// including unwinding.
struct CleanupGuard {
    work_dir: PathBuf,
    archive: PathBuf,
    armed: bool,
}

impl CleanupGuard {
    fn remove_all(&mut self) -> Vec<(PathBuf, std::io::Error)> {
        self.armed = false;
        let mut errors = Vec::new();
        if self.work_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.work_dir) {
                errors.push((self.work_dir.clone(), e));
            }
        }
        if self.archive.exists() {
            if let Err(e) = fs::remove_file(&self.archive) {
                errors.push((self.archive.clone(), e));
            }
        }
        errors
    }

    fn finish(&mut self, reporter: &mut Reporter) {
        reporter.step("Cleanup");
        let errors = self.remove_all();
        if errors.is_empty() {
            reporter.success("Staging directory and archive removed");
        }
        for (path, e) in errors {
            reporter.warn(format!("Could not remove {}: {}", path.display(), e));
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.remove_all();
        }
    }
}

/// Drives one backup: export, stage or reference, archive, transfer, clean up.
///
/// Dumps, copies and compression run on tokio's blocking pool, one at a time.
pub struct BackupOrchestrator {
    spec: BackupSpec,
    archiver: Arc<dyn Archiver>,
    reporter: Reporter,
}

impl BackupOrchestrator {
    pub fn new(spec: BackupSpec) -> Self {
        Self {
            spec,
            archiver: Arc::new(SevenZipArchiver),
            reporter: Reporter::new(),
        }
    }

    pub fn with_archiver<A: Archiver + 'static>(mut self, archiver: A) -> Self {
        self.archiver = Arc::new(archiver);
        self
    }

    /// Runs the pipeline once and consumes the orchestrator.
    ///
    /// Errors are hard failures (configuration, database export setup,
    /// archival); the staging directory and archive are removed either way.
    pub async fn process(mut self) -> Result<RunSummary> {
        let started = Instant::now();

        self.reporter.step("Initialising backup run");
        let run_id = run_identifier(self.spec.debug, Local::now());
        let work_dir = self.spec.staging_root.join(&run_id);
        let archive = self.spec.staging_root.join(format!("{}.7z", run_id));
        let mut guard = CleanupGuard {
            work_dir: work_dir.clone(),
            archive: archive.clone(),
            armed: true,
        };

        let result = self.run_stages(&run_id, &work_dir, &archive).await;
        guard.finish(&mut self.reporter);

        let elapsed = started.elapsed();
        match result {
            Ok(mut summary) => {
                summary.elapsed = elapsed;
                let failed = summary.failed_targets();
                let tail = if failed > 0 {
                    format!(" ({} of {} remote target(s) failed)", failed, summary.targets.len())
                } else {
                    String::new()
                };
                self.reporter.finish(
                    true,
                    format!("Backup {} completed successfully in {:.1}s{}", run_id, elapsed.as_secs_f64(), tail),
                );
                Ok(summary)
            }
            Err(e) => {
                self.reporter.finish(
                    false,
                    format!("Backup {} failed after {:.1}s: {}", run_id, elapsed.as_secs_f64(), e),
                );
                Err(e)
            }
        }
    }

    async fn run_stages(&mut self, run_id: &str, work_dir: &Path, archive: &Path) -> Result<RunSummary> {
        self.initialise(run_id)?;
        // never copied or archived into itself
        let staging_area = vec![std::path::absolute(work_dir)?, std::path::absolute(archive)?];

        let jobs = self.spec.database_jobs.clone();
        let sql_dir = work_dir.join(SQL_DUMP_DIR);
        let database_outcomes = self
            .blocking(move |reporter| export_databases(&jobs, &sql_dir, reporter))
            .await?;

        let sources = self.spec.sources.clone();
        let direct = self.spec.direct_compression;
        let dir = work_dir.to_path_buf();
        let (archive_sources, staging_failures) = self
            .blocking(move |reporter| {
                if direct {
                    reference_sources(&sources, &dir, &staging_area, reporter)
                } else {
                    stage_sources(&sources, &dir, &staging_area, reporter)
                }
            })
            .await?;

        let archiver = Arc::clone(&self.archiver);
        let password = self.spec.password.clone();
        let options = self.spec.archive_options.clone();
        let output = archive.to_path_buf();
        let archive_bytes = self
            .blocking(move |reporter| {
                build_archive(archiver.as_ref(), &archive_sources, &password, &output, &options, reporter)
            })
            .await?;

        let targets = self.transfer(archive).await;

        Ok(RunSummary {
            run_id: run_id.to_string(),
            archive_bytes,
            database_outcomes,
            staging_failures,
            targets,
            elapsed: Duration::ZERO,
        })
    }

    /// Runs `f` on the blocking pool, lending it the reporter.
    async fn blocking<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Reporter) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut reporter = std::mem::take(&mut self.reporter);
        let (reporter, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut reporter);
            (reporter, result)
        })
        .await?;
        self.reporter = reporter;
        result
    }

    fn initialise(&mut self, run_id: &str) -> Result<()> {
        if self.spec.password.is_empty() {
            return Err(BackupError::Config("Password is required".into()));
        }
        let root = &self.spec.staging_root;
        fs::create_dir_all(root).map_err(|e| {
            BackupError::Config(format!("Failed to create staging root {}: {}", root.display(), e))
        })?;
        if !is_writable_dir(root) {
            return Err(BackupError::Config(format!(
                "Staging root is not writable: {}",
                root.display()
            )));
        }
        if self.spec.sources.is_empty() && self.spec.database_jobs.is_empty() {
            self.reporter.warn("No files, directories or databases registered");
        }
        self.reporter.info(format!("Run {} in {}", run_id, root.display()));
        self.reporter.info(format!(
            "Mode: {}, retention: {}",
            if self.spec.direct_compression { "direct compression" } else { "staged copy" },
            match self.spec.retention_days {
                0 => "disabled".to_string(),
                n => format!("{} day(s)", n),
            }
        ));
        Ok(())
    }

    async fn transfer(&mut self, archive: &Path) -> Vec<TargetOutcome> {
        if self.spec.remote_targets.is_empty() {
            self.reporter.warn("No remote targets configured, archive will not be shipped");
            return Vec::new();
        }
        self.reporter.step("Transferring to remote targets");
        let mut outcomes = Vec::with_capacity(self.spec.remote_targets.len());
        for target in &self.spec.remote_targets {
            let outcome =
                remote::transfer(target, archive, self.spec.retention_days, &mut self.reporter).await;
            outcomes.push(outcome);
        }
        outcomes
    }
}

fn export_databases(
    jobs: &[DatabaseExporter],
    sql_dir: &Path,
    reporter: &mut Reporter,
) -> Result<Vec<DumpOutcome>> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    reporter.step("Exporting databases");
    fs::create_dir_all(sql_dir)?;

    let mut outcomes = Vec::new();
    for job in jobs {
        outcomes.extend(job.export_all(sql_dir, reporter)?);
    }
    Ok(outcomes)
}

/// Direct mode: nothing is copied, archive the registered paths in place.
///
/// 7z stores each path under its basename, so a second source with a name
/// already taken is refused, as is a directory holding the staging area.
fn reference_sources(
    sources: &SourceCollector,
    work_dir: &Path,
    staging_area: &[PathBuf],
    reporter: &mut Reporter,
) -> Result<(ArchiveSources, Vec<StagingFailure>)> {
    reporter.step("Collecting sources (direct compression)");
    let mut paths = Vec::new();
    let mut failures = Vec::new();

    let sql_dir = work_dir.join(SQL_DUMP_DIR);
    let mut names: HashSet<OsString> = HashSet::new();
    if sql_dir.is_dir() {
        names.insert(SQL_DUMP_DIR.into());
    }

    let files = sources.files().iter().map(|e| (e, true));
    let dirs = sources.dirs().iter().map(|e| (e, false));
    for (entry, is_file) in files.chain(dirs) {
        let source = &entry.source;
        let readable = if is_file {
            is_readable_file(source)
        } else {
            is_readable_dir(source)
        };

        let problem = if !readable {
            Some(BackupError::SourceUnavailable(source.display().to_string()))
        } else if !is_file && staging_area.iter().any(|p| p.starts_with(source)) {
            Some(BackupError::SourceUnavailable(format!(
                "{} contains the staging area",
                source.display()
            )))
        } else {
            match source.file_name() {
                Some(name) if names.insert(name.to_os_string()) => None,
                _ => Some(BackupError::SourceUnavailable(format!(
                    "{}: another source is already archived under this name",
                    source.display()
                ))),
            }
        };

        match problem {
            None => {
                reporter.info(source.display().to_string());
                paths.push(source.clone());
            }
            Some(err) => {
                reporter.error(err.to_string());
                failures.push(StagingFailure {
                    source: source.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }

    if sql_dir.is_dir() {
        paths.push(sql_dir);
    }
    Ok((ArchiveSources::Paths(paths), failures))
}

/// Staged mode: copy every source under the working directory.
fn stage_sources(
    sources: &SourceCollector,
    work_dir: &Path,
    staging_area: &[PathBuf],
    reporter: &mut Reporter,
) -> Result<(ArchiveSources, Vec<StagingFailure>)> {
    reporter.step("Staging files and directories");
    fs::create_dir_all(work_dir)?;
    let mut failures = Vec::new();

    for entry in sources.files() {
        let result = stage_entry(work_dir, &entry.source, &entry.target_dir, |src, dst| {
            if !is_readable_file(src) {
                return Err(BackupError::SourceUnavailable(src.display().to_string()));
            }
            copy_file_preserving(src, dst).map_err(BackupError::from)
        });
        report_staging(reporter, &entry.source, result, &mut failures);
    }

    for entry in sources.dirs() {
        let result = stage_entry(work_dir, &entry.source, &entry.target_dir, |src, dst| {
            if !is_readable_dir(src) {
                return Err(BackupError::SourceUnavailable(src.display().to_string()));
            }
            copy_dir_recursive(src, dst, staging_area).map_err(BackupError::from)
        });
        report_staging(reporter, &entry.source, result, &mut failures);
    }

    Ok((ArchiveSources::StagingDir(work_dir.to_path_buf()), failures))
}

fn build_archive(
    archiver: &dyn Archiver,
    sources: &ArchiveSources,
    password: &str,
    archive: &Path,
    options: &ArchiveOptions,
    reporter: &mut Reporter,
) -> Result<u64> {
    reporter.step("Creating encrypted archive");
    reporter.info(format!("🗜 Compressing to {}", archive.display()));
    let output = archiver.build_archive(sources, password, archive, options)?;
    if !output.is_file() {
        return Err(BackupError::Archive(format!(
            "Archive {} was not created",
            output.display()
        )));
    }
    let bytes = fs::metadata(&output)?.len();
    reporter.success(format!("Archive created ({} bytes)", bytes));
    Ok(bytes)
}

/// Creates `<work_dir>/<target_dir>/` and copies `source` into it under its
/// own name. An occupied destination is refused rather than overwritten.
fn stage_entry<F>(work_dir: &Path, source: &Path, target_dir: &str, copy: F) -> Result<u64>
where
    F: FnOnce(&Path, &Path) -> Result<u64>,
{
    let dest_dir = work_dir.join(normalize_target_subdir(target_dir));
    fs::create_dir_all(&dest_dir)?;
    let name = source
        .file_name()
        .ok_or_else(|| BackupError::SourceUnavailable(format!("{} has no file name", source.display())))?;
    let dest = dest_dir.join(name);
    if fs::symlink_metadata(&dest).is_ok() {
        return Err(BackupError::SourceUnavailable(format!(
            "{} is already taken by another source",
            dest.display()
        )));
    }
    copy(source, &dest)
}

fn report_staging(
    reporter: &mut Reporter,
    source: &Path,
    result: Result<u64>,
    failures: &mut Vec<StagingFailure>,
) {
    match result {
        Ok(bytes) => reporter.success(format!("{} ({} bytes)", source.display(), bytes)),
        Err(e) => {
            reporter.error(format!("{}: {}", source.display(), e));
            failures.push(StagingFailure {
                source: source.to_path_buf(),
                reason: e.to_string(),
            });
        }
    }
}
