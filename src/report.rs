//! Session reports.
//!
//! Every session (including `harvest merge`) leaves two files in the
//! reports directory, named after the session start time:
//!
//! - `report_YYYYMMDD_HHMMSS.json`: the [`SessionReport`] as JSON
//! - `report_YYYYMMDD_HHMMSS.txt`: a plain-text summary for humans

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::checkpoint::Counters;
use crate::error::Result;
use crate::merger::DuplicateEvent;
use crate::validator::{Rejection, Tier};

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every planned query was processed.
    Completed,
    BookBudget,
    TimeBudget,
    ApiCallBudget,
    /// External stop signal.
    Cancelled,
    /// Only the aggregate/validate/merge pass ran.
    MergeOnly,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::BookBudget => "book_budget",
            StopReason::TimeBudget => "time_budget",
            StopReason::ApiCallBudget => "api_call_budget",
            StopReason::Cancelled => "cancelled",
            StopReason::MergeOnly => "merge_only",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StrategyStats {
    pub queries: u64,
    pub pages: u64,
    pub books_analysed: u64,
    pub books_skipped: u64,
    pub series_detected: u64,
    pub failed_queries: u64,
}

/// A query abandoned after a remote failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedQuery {
    pub strategy: String,
    pub query: String,
    pub offset: u32,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stop_reason: StopReason,
    pub tier: Tier,
    pub dry_run: bool,
    /// Counters for this session only.
    pub counters: Counters,
    /// Counters accumulated across resumed sessions.
    pub cumulative: Counters,
    pub checkpoint_failures: u64,
    pub strategies: BTreeMap<String, StrategyStats>,
    pub candidates: usize,
    pub accepted_by_category: BTreeMap<String, u64>,
    pub rejected_by_reason: BTreeMap<String, u64>,
    pub rejected: Vec<Rejection>,
    pub added: Vec<String>,
    pub duplicates: Vec<DuplicateEvent>,
    pub failed_queries: Vec<FailedQuery>,
    pub canonical_path: PathBuf,
    pub backup_path: Option<PathBuf>,
}

impl SessionReport {
    pub fn new(started_at: DateTime<Utc>, tier: Tier, dry_run: bool, canonical_path: PathBuf) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at,
            stop_reason: StopReason::Completed,
            tier,
            dry_run,
            counters: Counters::default(),
            cumulative: Counters::default(),
            checkpoint_failures: 0,
            strategies: BTreeMap::new(),
            candidates: 0,
            accepted_by_category: BTreeMap::new(),
            rejected_by_reason: BTreeMap::new(),
            rejected: Vec::new(),
            added: Vec::new(),
            duplicates: Vec::new(),
            failed_queries: Vec::new(),
            canonical_path,
            backup_path: None,
        }
    }

    /// Plain-text summary.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Series Harvester: Session Report");
        let _ = writeln!(out, "=================================");
        let _ = writeln!(out);
        let _ = writeln!(out, "  Session:     {}", self.session_id);
        let _ = writeln!(out, "  Started:     {}", self.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out, "  Finished:    {}", self.finished_at.format("%Y-%m-%d %H:%M:%S UTC"));
        let _ = writeln!(out, "  Stop reason: {}", self.stop_reason.as_str());
        let _ = writeln!(out, "  Tier:        {}", self.tier);
        if self.dry_run {
            let _ = writeln!(out, "  Dry run:     canonical file not modified");
        }
        let _ = writeln!(out);

        let c = &self.counters;
        let _ = writeln!(out, "  Books analysed:   {} (total {})", c.books_analysed, self.cumulative.books_analysed);
        let _ = writeln!(out, "  Books skipped:    {}", c.books_skipped);
        let _ = writeln!(out, "  Series detected:  {}", c.series_detected);
        let _ = writeln!(out, "  API calls:        {}", c.api_calls);
        let _ = writeln!(out, "  Failed queries:   {}", c.failed_queries);
        let _ = writeln!(out, "  Parse errors:     {}", c.parse_errors);
        if self.checkpoint_failures > 0 {
            let _ = writeln!(out, "  Checkpoint write failures: {}", self.checkpoint_failures);
        }

        if !self.strategies.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "  By strategy:");
            let _ = writeln!(
                out,
                "  {:<16} {:>8} {:>8} {:>10} {:>8} {:>8}",
                "STRATEGY", "QUERIES", "PAGES", "ANALYSED", "SERIES", "FAILED"
            );
            let _ = writeln!(out, "  {}", "-".repeat(64));
            for (tag, s) in &self.strategies {
                let _ = writeln!(
                    out,
                    "  {:<16} {:>8} {:>8} {:>10} {:>8} {:>8}",
                    tag, s.queries, s.pages, s.books_analysed, s.series_detected, s.failed_queries
                );
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "  Candidates: {}  accepted: {}  rejected: {}",
            self.candidates,
            self.accepted_by_category.values().sum::<u64>(),
            self.rejected.len()
        );
        for (category, n) in &self.accepted_by_category {
            let _ = writeln!(out, "    {:<28} {}", category, n);
        }
        for (reason, n) in &self.rejected_by_reason {
            let _ = writeln!(out, "    rejected {:<19} {}", reason, n);
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "  Added ({}):", self.added.len());
        for name in &self.added {
            let _ = writeln!(out, "    + {}", name);
        }
        if !self.duplicates.is_empty() {
            let _ = writeln!(out, "  Duplicates ({}):", self.duplicates.len());
            for d in &self.duplicates {
                let _ = writeln!(out, "    = {} (existing: {})", d.name, d.existing_name);
            }
        }
        if !self.failed_queries.is_empty() {
            let _ = writeln!(out, "  Failed queries ({}):", self.failed_queries.len());
            for f in &self.failed_queries {
                let _ = writeln!(
                    out,
                    "    ! [{}] {} @ {}: {} {}",
                    f.strategy, f.query, f.offset, f.kind, f.message
                );
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "  Canonical:   {}", self.canonical_path.display());
        if let Some(backup) = &self.backup_path {
            let _ = writeln!(out, "  Backup:      {}", backup.display());
        }
        out
    }

    /// Write the JSON and text reports into `dir`. Returns their paths.
    pub fn write(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let stem = report_stem(dir, self.started_at);
        let json_path = dir.join(format!("{}.json", stem));
        let text_path = dir.join(format!("{}.txt", stem));

        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        std::fs::write(&json_path, json)?;
        std::fs::write(&text_path, self.render_text())?;
        Ok((json_path, text_path))
    }
}

fn report_stem(dir: &Path, started_at: DateTime<Utc>) -> String {
    let base = format!("report_{}", started_at.format("%Y%m%d_%H%M%S"));
    if !dir.join(format!("{}.json", base)).exists() {
        return base;
    }
    (1u32..)
        .map(|n| format!("{}_{}", base, n))
        .find(|stem| !dir.join(format!("{}.json", stem)).exists())
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn report() -> SessionReport {
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let mut r = SessionReport::new(started, Tier::Permissive, false, PathBuf::from("data/series.json"));
        r.stop_reason = StopReason::Cancelled;
        r.counters.books_analysed = 1200;
        r.added.push("Harry Potter".to_string());
        r.accepted_by_category.insert("novel".to_string(), 1);
        r.strategies.insert(
            "franchises".to_string(),
            StrategyStats {
                queries: 2,
                books_analysed: 1200,
                ..StrategyStats::default()
            },
        );
        r
    }

    #[test]
    fn writes_json_and_text_named_by_start_time() {
        let tmp = TempDir::new().unwrap();
        let (json, text) = report().write(tmp.path()).unwrap();
        assert_eq!(json.file_name().unwrap(), "report_20240309_140507.json");
        assert_eq!(text.file_name().unwrap(), "report_20240309_140507.txt");

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&json).unwrap()).unwrap();
        assert_eq!(value["stop_reason"], "cancelled");
        assert_eq!(value["tier"], "permissive");
        assert_eq!(value["counters"]["books_analysed"], 1200);
        assert_eq!(value["strategies"]["franchises"]["queries"], 2);

        let text = std::fs::read_to_string(&text).unwrap();
        assert!(text.contains("Stop reason: cancelled"));
        assert!(text.contains("+ Harry Potter"));
    }

    #[test]
    fn second_report_in_same_second_gets_suffix() {
        let tmp = TempDir::new().unwrap();
        let r = report();
        r.write(tmp.path()).unwrap();
        let (json, _) = r.write(tmp.path()).unwrap();
        assert_eq!(json.file_name().unwrap(), "report_20240309_140507_1.json");
    }
}
