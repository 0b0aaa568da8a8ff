//! Harvest session orchestration.
//!
//! A session walks the planned queries from the checkpoint position, pages
//! through each one in batches of up to `concurrency` concurrent requests,
//! analyses every book it has not seen before, and finally runs the
//! aggregate → validate → merge pass over the whole ledger.
//!
//! # Pipeline
//!
//! ```text
//! planner ─▶ catalog (K pages) ─▶ hash ─▶ ledger.seen? ─▶ detector ─▶ ledger.record
//!                                                                        │
//!                            report ◀─ merger ◀─ validator ◀─ aggregator ◀┘
//! ```
//!
//! # Stopping
//!
//! The session ends when the plan is exhausted, a budget (books, minutes,
//! API calls) is reached, or the [`CancellationToken`] fires. In every case
//! the checkpoint is current and the merge pass still runs.
//!
//! `LedgerWriteError` is the only error that aborts a session; the
//! checkpoint is saved first. Remote failures skip the rest of the query.

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::aggregator::aggregate;
use crate::catalog::{Catalog, SearchPage};
use crate::checkpoint::{Checkpoint, Counters};
use crate::config::Config;
use crate::detector::SeriesDetector;
use crate::error::{HarvestError, Result};
use crate::ledger::Ledger;
use crate::merger::Merger;
use crate::models::AnalysisRecord;
use crate::normalize::content_hash;
use crate::planner::{PlannedQuery, QueryPlanner, Strategy};
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter, NoProgress, Throughput};
use crate::report::{FailedQuery, SessionReport, StopReason, StrategyStats};
use crate::validator::{Tier, Validator};

/// Per-invocation overrides of the configured session.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Empty means every strategy.
    pub strategies: Vec<Strategy>,
    pub max_books: Option<u64>,
    pub max_minutes: Option<u64>,
    pub max_api_calls: Option<u64>,
    pub tier: Option<Tier>,
    pub dry_run: bool,
    /// Ignore any existing checkpoint.
    pub fresh: bool,
}

/// Result of a finished session.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub report: SessionReport,
    pub report_json: PathBuf,
    pub report_text: PathBuf,
}

static NO_PROGRESS: NoProgress = NoProgress;

pub struct Harvester<'a> {
    config: &'a Config,
    catalog: &'a dyn Catalog,
    progress: &'a dyn HarvestProgressReporter,
    cancel: CancellationToken,
}

struct Budget {
    max_books: Option<u64>,
    deadline: Option<Instant>,
    max_api_calls: Option<u64>,
}

impl Budget {
    fn exhausted(&self, counters: &Counters) -> Option<StopReason> {
        if self.max_books.is_some_and(|max| counters.books_analysed >= max) {
            return Some(StopReason::BookBudget);
        }
        if self.max_api_calls.is_some_and(|max| counters.api_calls >= max) {
            return Some(StopReason::ApiCallBudget);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(StopReason::TimeBudget);
        }
        None
    }

    fn remaining_calls(&self, counters: &Counters) -> Option<u64> {
        self.max_api_calls
            .map(|max| max.saturating_sub(counters.api_calls))
    }
}

/// `None` when `minutes` is too far out to represent, which means no
/// deadline.
fn deadline_after(start: Instant, minutes: u64) -> Option<Instant> {
    start.checked_add(Duration::from_secs(minutes.saturating_mul(60)))
}

/// Mutable state of one running session.
struct Session {
    base: Counters,
    counters: Counters,
    seed: Option<u64>,
    selection: Vec<String>,
    strategies: BTreeMap<String, StrategyStats>,
    strategy_books: HashMap<Strategy, u64>,
    failed: Vec<FailedQuery>,
    checkpoint_failures: u64,
    started: Instant,
    throughput: Throughput,
    next_progress: u64,
}

enum PageOutcome {
    /// Page processed; the query has more pages.
    More,
    /// Page processed and it was the last one.
    Done,
    /// The book budget ran out inside the page.
    Budget,
}

impl<'a> Harvester<'a> {
    pub fn new(config: &'a Config, catalog: &'a dyn Catalog) -> Self {
        Self {
            config,
            catalog,
            progress: &NO_PROGRESS,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn HarvestProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run a full session: harvest, then aggregate, validate, merge and
    /// report.
    pub async fn run(&self, options: &RunOptions) -> Result<SessionOutcome> {
        let config = self.config;
        let started_at = Utc::now();
        let tier = options.tier.unwrap_or(config.validator.tier);
        let mut report = SessionReport::new(
            started_at,
            tier,
            options.dry_run,
            config.paths.canonical.clone(),
        );

        let ledger = Ledger::open(&config.paths.ledger).await?;
        let checkpoint_path = &config.paths.checkpoint;

        let planner = QueryPlanner::new(&config.planner, &config.detector)
            .with_strategies(&options.strategies);
        let selection = planner.selection();

        let previous = if options.fresh {
            if let Err(e) = Checkpoint::remove(checkpoint_path) {
                tracing::warn!("could not remove checkpoint {}: {}", checkpoint_path.display(), e);
            }
            None
        } else {
            match Checkpoint::load(checkpoint_path) {
                Some(cp) if !cp.covers(&selection) => {
                    tracing::info!(
                        "checkpoint belongs to strategies [{}], not [{}]; starting this selection from the beginning",
                        cp.strategies.join(", "),
                        selection.join(", ")
                    );
                    None
                }
                other => other,
            }
        };
        let planner = match &previous {
            Some(cp) if !cp.completed => planner.with_seed(cp.seed),
            _ => planner,
        };

        let queries: Vec<PlannedQuery> = match &previous {
            Some(cp) if cp.completed => {
                tracing::info!("checkpoint says the plan is complete; use --fresh to start over");
                Vec::new()
            }
            Some(cp) => {
                tracing::info!(
                    "resuming at {} query {} offset {}",
                    cp.strategy_tag,
                    cp.query_index,
                    cp.offset
                );
                planner.resume_from(cp).collect()
            }
            None => planner.iter().collect(),
        };

        let mut session = Session {
            base: previous.as_ref().map(|cp| cp.counters.clone()).unwrap_or_default(),
            counters: Counters::default(),
            seed: planner.seed(),
            selection,
            strategies: BTreeMap::new(),
            strategy_books: HashMap::new(),
            failed: Vec::new(),
            checkpoint_failures: 0,
            started: Instant::now(),
            throughput: Throughput::default(),
            next_progress: config.session.progress_every.max(1),
        };

        let budget = Budget {
            max_books: options.max_books.or(config.session.max_books),
            deadline: options
                .max_minutes
                .or(config.session.max_minutes)
                .and_then(|m| deadline_after(session.started, m)),
            max_api_calls: options.max_api_calls.or(config.session.max_api_calls),
        };

        let detector = SeriesDetector::new(&config.detector);
        let resume_point = previous
            .as_ref()
            .filter(|cp| !cp.completed)
            .map(|cp| (cp.strategy_tag.clone(), cp.query_index, cp.offset));

        tracing::info!(
            "session {} starting: {} queries planned, tier {}",
            report.session_id,
            queries.len(),
            tier
        );

        let total = queries.len() as u64;
        let mut stop = StopReason::Completed;
        for (n, planned) in queries.iter().enumerate() {
            let start_offset = match &resume_point {
                Some((tag, index, offset)) if tag == planned.tag() && *index == planned.index => *offset,
                _ => 0,
            };
            let per_strategy = session.strategy_books.get(&planned.strategy).copied().unwrap_or(0);
            if per_strategy >= config.session.per_strategy_book_budget {
                tracing::debug!("strategy {} budget reached, skipping '{}'", planned.tag(), planned.query);
                continue;
            }

            self.progress.report(HarvestProgressEvent::Query {
                strategy: planned.tag().to_string(),
                query: planned.query.clone(),
                n: n as u64 + 1,
                total,
            });
            session.stats(planned.tag()).queries += 1;

            if let Some(reason) = self
                .run_query(planned, start_offset, &ledger, &detector, &budget, &mut session)
                .await?
            {
                stop = reason;
                break;
            }
        }

        if stop == StopReason::Completed {
            let done = Checkpoint {
                strategies: session.selection.clone(),
                completed: true,
                seed: session.seed,
                counters: session.cumulative(),
                ..Checkpoint::default()
            };
            session.save_checkpoint(&done, checkpoint_path);
        }

        tracing::info!(
            "harvest stopped ({}): {} analysed, {} skipped, {} series, {} API calls",
            stop.as_str(),
            session.counters.books_analysed,
            session.counters.books_skipped,
            session.counters.series_detected,
            session.counters.api_calls
        );

        report.stop_reason = stop;
        report.counters = session.counters.clone();
        report.cumulative = session.cumulative();
        report.checkpoint_failures = session.checkpoint_failures;
        report.strategies = std::mem::take(&mut session.strategies);
        report.failed_queries = std::mem::take(&mut session.failed);

        finish(config, ledger, report, tier, options.dry_run).await
    }

    /// Returns `Some(reason)` when the session must stop.
    async fn run_query(
        &self,
        planned: &PlannedQuery,
        start_offset: u32,
        ledger: &Ledger,
        detector: &SeriesDetector,
        budget: &Budget,
        session: &mut Session,
    ) -> Result<Option<StopReason>> {
        let config = self.config;
        let limit = config.catalog.page_size;
        let concurrency = config.catalog.concurrency.max(1) as u64;
        let checkpoint_path = &config.paths.checkpoint;
        let mut offset = start_offset;

        loop {
            if let Some(reason) = budget.exhausted(&session.counters) {
                return Ok(Some(reason));
            }
            let per_strategy = session.strategy_books.get(&planned.strategy).copied().unwrap_or(0);
            if per_strategy >= config.session.per_strategy_book_budget {
                return Ok(None);
            }

            let batch = budget
                .remaining_calls(&session.counters)
                .map_or(concurrency, |left| left.min(concurrency));
            let offsets: Vec<u32> = (0..batch as u32).map(|i| offset + i * limit).collect();
            session.counters.api_calls += batch;

            let fetches = offsets
                .iter()
                .map(|&o| self.catalog.search(&planned.query, o, limit));
            let results = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("stop requested, abandoning in-flight requests");
                    return Ok(Some(StopReason::Cancelled));
                }
                results = join_all(fetches) => results,
            };

            let mut query_done = false;
            let mut analysed_in_batch = 0u64;
            for (&page_offset, result) in offsets.iter().zip(results) {
                let page = match result {
                    Ok(page) => page,
                    Err(e) => {
                        self.skip_query(planned, page_offset, &e, session);
                        query_done = true;
                        break;
                    }
                };
                session.stats(planned.tag()).pages += 1;

                let before = session.counters.books_analysed;
                let outcome = match self
                    .process_page(planned, page_offset, &page, ledger, detector, budget, session)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // Resume refetches this page; rows already written are skipped.
                        let cp = session.checkpoint_at(planned, page_offset);
                        session.save_checkpoint(&cp, checkpoint_path);
                        tracing::error!("{} on '{}' at offset {}: {}", e.kind(), planned.query, page_offset, e);
                        return Err(e);
                    }
                };
                analysed_in_batch += session.counters.books_analysed - before;

                match outcome {
                    PageOutcome::More => {}
                    PageOutcome::Done => {
                        query_done = true;
                        break;
                    }
                    PageOutcome::Budget => {
                        let cp = session.checkpoint_at(planned, page_offset);
                        session.save_checkpoint(&cp, checkpoint_path);
                        return Ok(Some(StopReason::BookBudget));
                    }
                }
            }

            tracing::info!(
                "[{}] '{}' offset {}: {} page(s), {} new book(s)",
                planned.tag(),
                planned.query,
                offset,
                offsets.len(),
                analysed_in_batch
            );

            if query_done {
                let mut cp = session.checkpoint_at(planned, 0);
                cp.query_index = planned.index + 1;
                session.save_checkpoint(&cp, checkpoint_path);
                return Ok(None);
            }

            offset += batch as u32 * limit;
            let cp = session.checkpoint_at(planned, offset);
            session.save_checkpoint(&cp, checkpoint_path);
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_page(
        &self,
        planned: &PlannedQuery,
        page_offset: u32,
        page: &SearchPage,
        ledger: &Ledger,
        detector: &SeriesDetector,
        budget: &Budget,
        session: &mut Session,
    ) -> Result<PageOutcome> {
        let tag = planned.tag();
        session.counters.parse_errors += page.parse_errors;

        for book in &page.books {
            if budget
                .max_books
                .is_some_and(|max| session.counters.books_analysed >= max)
            {
                return Ok(PageOutcome::Budget);
            }

            let started = Instant::now();
            let hash = content_hash(&book.title, book.primary_author());
            if ledger.seen(&hash).await? {
                session.counters.books_skipped += 1;
                session.stats(tag).books_skipped += 1;
                continue;
            }

            let detection = detector.detect(book);
            let elapsed = started.elapsed().as_millis() as u64;
            let record = AnalysisRecord::from_detection(hash, book, &detection, tag, elapsed);
            if !ledger.record(&record).await? {
                session.counters.books_skipped += 1;
                session.stats(tag).books_skipped += 1;
                continue;
            }

            tracing::debug!(
                "analysed '{}' by '{}': {:?} vol {:?} conf {}",
                book.title,
                book.primary_author(),
                detection.series_name,
                detection.volume,
                detection.confidence
            );

            session.counters.books_analysed += 1;
            *session.strategy_books.entry(planned.strategy).or_default() += 1;
            session.stats(tag).books_analysed += 1;
            if detection.is_series() {
                session.counters.series_detected += 1;
                session.stats(tag).series_detected += 1;
            }
            self.maybe_report_progress(budget, session);
        }

        let seen = page.books.len() as u64 + page.parse_errors + page.untitled;
        let next = u64::from(page_offset) + u64::from(self.config.catalog.page_size);
        if seen == 0 || seen < u64::from(self.config.catalog.page_size) || next >= page.total_estimate {
            Ok(PageOutcome::Done)
        } else {
            Ok(PageOutcome::More)
        }
    }

    fn skip_query(&self, planned: &PlannedQuery, offset: u32, error: &HarvestError, session: &mut Session) {
        tracing::warn!(
            "{} for [{}] '{}' at offset {}: {}; skipping query",
            error.kind(),
            planned.tag(),
            planned.query,
            offset,
            error
        );
        self.progress.report(HarvestProgressEvent::Skipped {
            strategy: planned.tag().to_string(),
            query: planned.query.clone(),
            offset,
            kind: error.kind().to_string(),
        });
        session.counters.failed_queries += 1;
        session.stats(planned.tag()).failed_queries += 1;
        session.failed.push(FailedQuery {
            strategy: planned.tag().to_string(),
            query: planned.query.clone(),
            offset,
            kind: error.kind().to_string(),
            message: error.to_string(),
        });
    }

    fn maybe_report_progress(&self, budget: &Budget, session: &mut Session) {
        let analysed = session.counters.books_analysed;
        if analysed < session.next_progress {
            return;
        }
        session.next_progress = analysed + self.config.session.progress_every.max(1);
        let books_per_min = session.throughput.record(session.started.elapsed(), analysed);
        let eta_secs = session.throughput.eta_secs(analysed, budget.max_books);
        self.progress.report(HarvestProgressEvent::Books {
            analysed,
            series: session.counters.series_detected,
            books_per_min,
            eta_secs,
        });
    }
}

/// Aggregate, validate and merge whatever the ledger holds, without
/// querying the catalog.
pub async fn merge_only(config: &Config, tier: Option<Tier>, dry_run: bool) -> Result<SessionOutcome> {
    let tier = tier.unwrap_or(config.validator.tier);
    let mut report = SessionReport::new(Utc::now(), tier, dry_run, config.paths.canonical.clone());
    report.stop_reason = StopReason::MergeOnly;
    let ledger = Ledger::open(&config.paths.ledger).await?;
    report.cumulative.books_analysed = ledger.count().await?;
    finish(config, ledger, report, tier, dry_run).await
}

async fn finish(
    config: &Config,
    ledger: Ledger,
    mut report: SessionReport,
    tier: Tier,
    dry_run: bool,
) -> Result<SessionOutcome> {
    let records = ledger.iter_series().await?;
    ledger.close().await;

    let candidates = aggregate(records);
    let validator = Validator::new(&config.validator, tier, &config.detector.stop_phrases);
    let validation = validator.run(&candidates, Utc::now());
    tracing::info!(
        "validation ({} tier): {} candidate(s), {} accepted, {} rejected",
        validator.tier(),
        candidates.len(),
        validation.accepted.len(),
        validation.rejected.len()
    );

    report.candidates = candidates.len();
    for entry in &validation.accepted {
        *report
            .accepted_by_category
            .entry(entry.category.as_str().to_string())
            .or_default() += 1;
    }
    for rejection in &validation.rejected {
        *report
            .rejected_by_reason
            .entry(rejection.reason.code().to_string())
            .or_default() += 1;
    }
    report.rejected = validation.rejected;

    let merged = Merger::new(&config.paths.canonical).merge(validation.accepted, dry_run)?;
    tracing::info!(
        "merge: {} added, {} duplicate(s), {} total entries{}",
        merged.added.len(),
        merged.duplicates.len(),
        merged.total_entries,
        if dry_run { " (dry run)" } else { "" }
    );
    report.added = merged.added;
    report.duplicates = merged.duplicates;
    report.backup_path = merged.backup_path;
    report.finished_at = Utc::now();

    let (report_json, report_text) = report.write(&config.paths.reports)?;
    Ok(SessionOutcome {
        report,
        report_json,
        report_text,
    })
}

impl Session {
    fn stats(&mut self, tag: &str) -> &mut StrategyStats {
        self.strategies.entry(tag.to_string()).or_default()
    }

    fn cumulative(&self) -> Counters {
        let mut total = self.base.clone();
        total.add(&self.counters);
        total
    }

    fn checkpoint_at(&self, planned: &PlannedQuery, offset: u32) -> Checkpoint {
        Checkpoint {
            strategies: self.selection.clone(),
            strategy_tag: planned.tag().to_string(),
            query_index: planned.index,
            offset,
            seed: self.seed,
            completed: false,
            counters: self.cumulative(),
            updated_at: None,
        }
    }

    /// Checkpoint failures only cost resumability, so they are logged and
    /// counted rather than propagated.
    fn save_checkpoint(&mut self, checkpoint: &Checkpoint, path: &std::path::Path) {
        if let Err(e) = checkpoint.save(path) {
            tracing::warn!("{}: {}", e.kind(), e);
            self.checkpoint_failures += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_is_minutes_after_start() {
        let start = Instant::now();
        assert_eq!(deadline_after(start, 0), Some(start));
        assert_eq!(deadline_after(start, 2), Some(start + Duration::from_secs(120)));
    }

    #[test]
    fn unrepresentable_deadline_means_none() {
        assert_eq!(deadline_after(Instant::now(), u64::MAX), None);
    }
}
