//! Session checkpoints.
//!
//! A checkpoint names the next query to run (`strategy_tag`, `query_index`)
//! and the next offset within it, plus the running counters. It belongs to
//! the strategy selection that wrote it; a session over a different
//! selection does not resume from it. It is written after every completed
//! batch by writing a temporary file in the same directory and renaming it
//! over the old one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::error::{HarvestError, Result};

/// Running totals carried across resumed sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub books_analysed: u64,
    pub books_skipped: u64,
    pub series_detected: u64,
    pub api_calls: u64,
    pub failed_queries: u64,
    pub parse_errors: u64,
}

impl Counters {
    pub fn add(&mut self, other: &Counters) {
        self.books_analysed += other.books_analysed;
        self.books_skipped += other.books_skipped;
        self.series_detected += other.series_detected;
        self.api_calls += other.api_calls;
        self.failed_queries += other.failed_queries;
        self.parse_errors += other.parse_errors;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    /// Tags of the selected strategies, in planning order.
    pub strategies: Vec<String>,
    pub strategy_tag: String,
    pub query_index: usize,
    pub offset: u32,
    /// Planner seed in effect when the checkpoint was written.
    pub seed: Option<u64>,
    /// Every planned query has been processed.
    pub completed: bool,
    pub counters: Counters,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Read a checkpoint. A missing file yields `None`; an unreadable or
    /// corrupt one is logged and also yields `None` so the session starts
    /// fresh instead of failing.
    pub fn load(path: &Path) -> Option<Checkpoint> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!("ignoring unreadable checkpoint {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(cp) => Some(cp),
            Err(e) => {
                tracing::warn!("ignoring corrupt checkpoint {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Atomically replace the checkpoint file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let wrap = |source: std::io::Error| HarvestError::CheckpointWrite {
            path: path.to_path_buf(),
            source,
        };

        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir).map_err(wrap)?;

        let mut stamped = self.clone();
        stamped.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(&stamped)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(wrap)?;
        tmp.write_all(json.as_bytes()).map_err(wrap)?;
        tmp.as_file().sync_all().map_err(wrap)?;
        tmp.persist(path).map_err(|e| wrap(e.error))?;
        Ok(())
    }

    /// Whether this checkpoint was written for exactly `selection`.
    pub fn covers(&self, selection: &[String]) -> bool {
        self.strategies == selection
    }

    pub fn remove(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
