// remotebackup/src/backup/db_dump.rs
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock};

use crate::errors::{BackupError, Result};
use crate::utils::report::Reporter;
use crate::utils::{find_executable, is_writable_dir};

static DATABASE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_$\-]+$").expect("static regex"));

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    #[default]
    Mysql,
    Postgres,
}

/// Credentials for one database server. Two jobs with equal connections are
/// merged into one.
#[derive(Clone, PartialEq, Eq)]
pub struct DbConnection {
    pub engine: DbEngine,
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConnection")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Produces one dump file for one database.
pub trait SqlDumper: Send + Sync {
    fn dump(&self, connection: &DbConnection, database: &str, output: &Path) -> Result<()>;
}

/// Shells out to `mysqldump` or `pg_dump` depending on the engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandDumper;

impl CommandDumper {
    fn program(engine: DbEngine) -> &'static str {
        match engine {
            DbEngine::Mysql => "mysqldump",
            DbEngine::Postgres => "pg_dump",
        }
    }
}

/// Builds the dump command. The password travels through the environment
/// (`MYSQL_PWD` / `PGPASSWORD`) and never appears in the argument list.
pub(crate) fn dump_command(
    program: &Path,
    connection: &DbConnection,
    database: &str,
    output: &Path,
) -> Command {
    let mut cmd = Command::new(program);
    match connection.engine {
        DbEngine::Mysql => {
            cmd.arg("-h").arg(&connection.host);
            if let Some(port) = connection.port {
                cmd.arg("-P").arg(port.to_string());
            }
            cmd.arg("-u")
                .arg(&connection.user)
                .args([
                    "-c",
                    "--add-drop-table",
                    "--add-locks",
                    "--quick",
                    "--lock-tables",
                ])
                .arg(format!("--result-file={}", output.display()))
                .arg(database)
                .env("MYSQL_PWD", &connection.password);
        }
        DbEngine::Postgres => {
            cmd.arg("-h").arg(&connection.host);
            if let Some(port) = connection.port {
                cmd.arg("-p").arg(port.to_string());
            }
            cmd.arg("-U")
                .arg(&connection.user)
                .arg("--no-password")
                .arg("-f")
                .arg(output)
                .arg(database)
                .env("PGPASSWORD", &connection.password);
        }
    }
    cmd
}

impl SqlDumper for CommandDumper {
    fn dump(&self, connection: &DbConnection, database: &str, output: &Path) -> Result<()> {
        let program = find_executable(Self::program(connection.engine))?;
        let result = dump_command(&program, connection, database, output)
            .output()
            .map_err(|e| {
                BackupError::Dump(format!(
                    "Failed to execute {} for database {}: {}",
                    program.display(),
                    database,
                    e
                ))
            })?;

        if !result.status.success() {
            return Err(BackupError::Command {
                program: program.display().to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Result of dumping one database.
#[derive(Debug, Clone, PartialEq)]
pub struct DumpOutcome {
    pub database: String,
    pub file: PathBuf,
    pub success: bool,
    pub bytes: u64,
    pub error: Option<String>,
}

/// One database server and the databases to export from it.
#[derive(Clone)]
pub struct DatabaseExporter {
    connection: DbConnection,
    databases: Vec<String>,
    dumper: Arc<dyn SqlDumper>,
}

impl fmt::Debug for DatabaseExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseExporter")
            .field("connection", &self.connection)
            .field("databases", &self.databases)
            .finish()
    }
}

impl DatabaseExporter {
    /// Fails fast when host, user or password is empty.
    pub fn new(connection: DbConnection) -> Result<Self> {
        if connection.host.trim().is_empty() {
            return Err(BackupError::Config("Database host is empty".into()));
        }
        if connection.user.trim().is_empty() {
            return Err(BackupError::Config("Database user is empty".into()));
        }
        if connection.password.is_empty() {
            return Err(BackupError::Config("Database password is empty".into()));
        }
        Ok(Self {
            connection,
            databases: Vec::new(),
            dumper: Arc::new(CommandDumper),
        })
    }

    pub fn with_dumper(mut self, dumper: Arc<dyn SqlDumper>) -> Self {
        self.dumper = dumper;
        self
    }

    /// Appends names not yet present, keeping first-seen order. Empty names are ignored.
    pub fn add_databases<I, S>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for name in names {
            let name = name.as_ref().trim();
            if !name.is_empty() && !self.databases.iter().any(|d| d == name) {
                self.databases.push(name.to_string());
            }
        }
        self
    }

    pub fn with_databases<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.add_databases(names);
        self
    }

    pub fn connection(&self) -> &DbConnection {
        &self.connection
    }

    pub fn database_names(&self) -> &[String] {
        &self.databases
    }

    /// Dumps every registered database to `<target_dir>/<name>.sql`.
    ///
    /// A database that fails to dump is reported in its outcome; only an
    /// unusable target directory or a missing dump tool is an error.
    pub fn export_all(&self, target_dir: &Path, reporter: &mut Reporter) -> Result<Vec<DumpOutcome>> {
        if self.databases.is_empty() {
            return Ok(Vec::new());
        }
        if !is_writable_dir(target_dir) {
            return Err(BackupError::Config(format!(
                "SQL export target dir is not writable: {}",
                target_dir.display()
            )));
        }

        reporter.info(format!(
            "Exporting {} database(s) from {}@{}",
            self.databases.len(),
            self.connection.user,
            self.connection.host
        ));
        reporter.nest();

        let mut outcomes = Vec::with_capacity(self.databases.len());
        for database in &self.databases {
            let file = target_dir.join(format!("{}.sql", database));
            let outcome = self.export_one(database, file)?;
            if outcome.success {
                reporter.success(format!("{} ({} bytes)", database, outcome.bytes));
            } else {
                reporter.error(format!(
                    "{}: {}",
                    database,
                    outcome.error.as_deref().unwrap_or("dump failed")
                ));
            }
            outcomes.push(outcome);
        }

        reporter.unnest();
        Ok(outcomes)
    }

    fn export_one(&self, database: &str, file: PathBuf) -> Result<DumpOutcome> {
        let mut outcome = DumpOutcome {
            database: database.to_string(),
            file,
            success: false,
            bytes: 0,
            error: None,
        };

        if !DATABASE_NAME.is_match(database) {
            outcome.error = Some("invalid database name".into());
            return Ok(outcome);
        }

        match self.dumper.dump(&self.connection, database, &outcome.file) {
            Ok(()) => {
                outcome.bytes = fs::metadata(&outcome.file).map(|m| m.len()).unwrap_or(0);
                outcome.success = outcome.bytes > 0;
                if !outcome.success {
                    outcome.error = Some("dump file missing or empty".into());
                }
            }
            Err(e) if e.is_hard() => return Err(e),
            Err(e) => outcome.error = Some(e.to_string()),
        }
        Ok(outcome)
    }
}
