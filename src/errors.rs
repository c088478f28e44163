use thiserror::Error;

/// Failures raised while running a backup.
///
/// `Config`, `Archive` and `Io` abort the run (after cleanup). The remaining
/// variants are reported against a single source, database or remote target
/// and never flip the overall result.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Archive operation failed: {0}")]
    Archive(String),

    #[error("Database dump failed: {0}")]
    Dump(String),

    #[error("Transfer to {target} failed: {reason}")]
    Transfer { target: String, reason: String },

    #[error("Purge on {target} failed: {reason}")]
    Purge { target: String, reason: String },

    #[error("Command execution failed ({program}): {stderr}")]
    Command { program: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("FTP error: {0}")]
    Ftp(#[from] suppaftp::FtpError),

    #[error("AWS SDK S3 error: {0}")]
    S3Sdk(String),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BackupError {
    /// Hard failures abort the pipeline; everything else is reported and skipped.
    pub fn is_hard(&self) -> bool {
        matches!(
            self,
            BackupError::Config(_) | BackupError::Archive(_) | BackupError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_and_soft_classification() {
        assert!(BackupError::Config("missing password".into()).is_hard());
        assert!(BackupError::Archive("no output".into()).is_hard());
        assert!(!BackupError::SourceUnavailable("/gone".into()).is_hard());
        assert!(
            !BackupError::Transfer {
                target: "ftp://host".into(),
                reason: "refused".into()
            }
            .is_hard()
        );
        assert!(
            !BackupError::Purge {
                target: "dir:/x".into(),
                reason: "listing".into()
            }
            .is_hard()
        );
    }
}
