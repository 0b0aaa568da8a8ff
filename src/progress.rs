//! Harvest progress reporting.
//!
//! Reports observable progress during `harvest run` so operators see which
//! query is running, how many books have been analysed, the throughput and
//! an ETA against the book budget. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::collections::VecDeque;
use std::io::Write;
use std::time::Duration;

/// A single progress event for a harvest session.
#[derive(Clone, Debug, PartialEq)]
pub enum HarvestProgressEvent {
    /// A query is starting.
    Query {
        strategy: String,
        query: String,
        /// 1-based position among the queries this session will run.
        n: u64,
        total: u64,
    },
    /// Periodic counters, every `progress_every` analysed books.
    Books {
        analysed: u64,
        series: u64,
        books_per_min: f64,
        eta_secs: Option<u64>,
    },
    /// A query was abandoned after a remote failure.
    Skipped {
        strategy: String,
        query: String,
        offset: u32,
        kind: String,
    },
}

/// Reports harvest progress. Implementations write to stderr (human or JSON).
pub trait HarvestProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the orchestrator.
    fn report(&self, event: HarvestProgressEvent);
}

/// Human-friendly progress on stderr: "harvest  1,200 books  37 series  412.5 books/min  eta 3m 10s".
pub struct StderrProgress;

impl HarvestProgressReporter for StderrProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let line = match &event {
            HarvestProgressEvent::Query {
                strategy,
                query,
                n,
                total,
            } => format!(
                "harvest {}  query {} / {}  {}\n",
                strategy,
                format_number(*n),
                format_number(*total),
                query
            ),
            HarvestProgressEvent::Books {
                analysed,
                series,
                books_per_min,
                eta_secs,
            } => {
                let eta = eta_secs
                    .map(|s| format!("  eta {}", format_duration(s)))
                    .unwrap_or_default();
                format!(
                    "harvest  {} books  {} series  {:.1} books/min{}\n",
                    format_number(*analysed),
                    format_number(*series),
                    books_per_min,
                    eta
                )
            }
            HarvestProgressEvent::Skipped {
                strategy,
                query,
                offset,
                kind,
            } => format!(
                "harvest {}  skipped {} at offset {} ({})\n",
                strategy, query, offset, kind
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl HarvestProgressReporter for JsonProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let obj = match &event {
            HarvestProgressEvent::Query {
                strategy,
                query,
                n,
                total,
            } => serde_json::json!({
                "event": "query",
                "strategy": strategy,
                "query": query,
                "n": n,
                "total": total
            }),
            HarvestProgressEvent::Books {
                analysed,
                series,
                books_per_min,
                eta_secs,
            } => serde_json::json!({
                "event": "progress",
                "analysed": analysed,
                "series": series,
                "books_per_min": books_per_min,
                "eta_secs": eta_secs
            }),
            HarvestProgressEvent::Skipped {
                strategy,
                query,
                offset,
                kind,
            } => serde_json::json!({
                "event": "skipped",
                "strategy": strategy,
                "query": query,
                "offset": offset,
                "kind": kind
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl HarvestProgressReporter for NoProgress {
    fn report(&self, _event: HarvestProgressEvent) {}
}

/// Moving-average throughput over the most recent samples.
#[derive(Debug)]
pub struct Throughput {
    window: usize,
    samples: VecDeque<(Duration, u64)>,
}

impl Default for Throughput {
    fn default() -> Self {
        Self::new(10)
    }
}

impl Throughput {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(2),
            samples: VecDeque::new(),
        }
    }

    /// Record `analysed` books at `elapsed` since session start and return
    /// books/min across the window.
    pub fn record(&mut self, elapsed: Duration, analysed: u64) -> f64 {
        if self.samples.is_empty() {
            self.samples.push_back((Duration::ZERO, 0));
        }
        self.samples.push_back((elapsed, analysed));
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
        self.books_per_min()
    }

    pub fn books_per_min(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let minutes = last.0.saturating_sub(first.0).as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        last.1.saturating_sub(first.1) as f64 / minutes
    }

    /// Seconds until `budget` books at the current rate.
    pub fn eta_secs(&self, analysed: u64, budget: Option<u64>) -> Option<u64> {
        let budget = budget?;
        let rate = self.books_per_min();
        if rate <= 0.0 {
            return None;
        }
        let remaining = budget.saturating_sub(analysed) as f64;
        Some((remaining / rate * 60.0).round() as u64)
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

fn format_duration(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{}s", s),
        s if s < 3600 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}h {}m", s / 3600, (s % 3600) / 60),
    }
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn HarvestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn format_duration_units() {
        assert_eq!(format_duration(42), "42s");
        assert_eq!(format_duration(190), "3m 10s");
        assert_eq!(format_duration(7260), "2h 1m");
    }

    #[test]
    fn throughput_uses_recent_window() {
        let mut t = Throughput::new(3);
        // 100 books per minute for the first two minutes...
        t.record(Duration::from_secs(60), 100);
        t.record(Duration::from_secs(120), 200);
        // ...then 400 per minute.
        t.record(Duration::from_secs(180), 600);
        let rate = t.record(Duration::from_secs(240), 1000);
        // Window holds the samples at 120s, 180s, 240s.
        assert!((rate - 400.0).abs() < 1e-9);
    }

    #[test]
    fn eta_against_budget() {
        let mut t = Throughput::default();
        t.record(Duration::from_secs(60), 100);
        assert_eq!(t.eta_secs(100, Some(400)), Some(180));
        assert_eq!(t.eta_secs(100, None), None);
        assert_eq!(Throughput::default().eta_secs(0, Some(10)), None);
    }
}
