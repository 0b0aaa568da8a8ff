//! Error kinds raised by the harvest pipeline.
//!
//! Outcomes that are expected during a harvest (a title with no series
//! pattern, a rejected candidate, a duplicate series at merge time) are not
//! errors; they are carried as data in [`crate::models`] and
//! [`crate::validator`].

use std::path::PathBuf;

/// Errors surfaced by the library. The binary wraps these in `anyhow`.
#[derive(Debug, thiserror::Error)]
pub enum HarvestError {
    /// 5xx, timeout, network failure, unparseable body, or 429 after the
    /// retry budget is spent.
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// 4xx other than 429. Never retried.
    #[error("permanent remote error (HTTP {status}): {message}")]
    PermanentRemote { status: u16, message: String },

    #[error("malformed catalog document: {0}")]
    Parse(String),

    #[error("ledger write failed: {0}")]
    LedgerWrite(#[source] sqlx::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("failed to write canonical file {}: {source} (backup: {})", .path.display(), backup_display(.backup))]
    CanonicalWrite {
        path: PathBuf,
        backup: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read canonical file {}: {message}", .path.display())]
    CanonicalRead { path: PathBuf, message: String },

    #[error("canonical file {} is locked by another merge", .0.display())]
    MergeLocked(PathBuf),

    #[error("failed to write checkpoint {}: {source}", .path.display())]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn backup_display(backup: &Option<PathBuf>) -> String {
    backup
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".to_string())
}

impl HarvestError {
    /// Kind name used in logs, reports and console output.
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::TransientRemote(_) => "TransientRemoteError",
            HarvestError::PermanentRemote { .. } => "PermanentRemoteError",
            HarvestError::Parse(_) => "ParseError",
            HarvestError::LedgerWrite(_) => "LedgerWriteError",
            HarvestError::Ledger(_) => "LedgerError",
            HarvestError::CanonicalWrite { .. } => "CanonicalWriteError",
            HarvestError::CanonicalRead { .. } => "CanonicalReadError",
            HarvestError::MergeLocked(_) => "MergeLocked",
            HarvestError::CheckpointWrite { .. } => "CheckpointWriteError",
            HarvestError::Io(_) => "IoError",
            HarvestError::Json(_) => "JsonError",
        }
    }

    /// Whether the catalog client should retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HarvestError::TransientRemote(_))
    }

    /// Whether the session must abort.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarvestError::LedgerWrite(_)
                | HarvestError::Ledger(_)
                | HarvestError::CanonicalWrite { .. }
                | HarvestError::CanonicalRead { .. }
                | HarvestError::MergeLocked(_)
        )
    }

    /// Backup path to point the operator at after a failed merge.
    pub fn backup_path(&self) -> Option<&PathBuf> {
        match self {
            HarvestError::CanonicalWrite { backup, .. } => backup.as_ref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_match_error_names() {
        assert_eq!(
            HarvestError::TransientRemote("timeout".into()).kind(),
            "TransientRemoteError"
        );
        let permanent = HarvestError::PermanentRemote {
            status: 404,
            message: "not found".into(),
        };
        assert_eq!(permanent.kind(), "PermanentRemoteError");
        assert!(!permanent.is_retryable());
        assert!(!permanent.is_fatal());
    }

    #[test]
    fn canonical_write_reports_backup() {
        let err = HarvestError::CanonicalWrite {
            path: PathBuf::from("data/series.json"),
            backup: Some(PathBuf::from("data/backup_20240101_000000.json")),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("backup_20240101_000000.json"));
        assert_eq!(
            err.backup_path(),
            Some(&PathBuf::from("data/backup_20240101_000000.json"))
        );
    }
}
