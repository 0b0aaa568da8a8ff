//! Dedup ledger: the persistent record of every analysed book.
//!
//! Keyed by content hash. Rows are append-only; a second `record` for a
//! hash that is already present is a no-op. Writes go through a single
//! writer guard, reads go straight to the pool (WAL mode keeps them from
//! blocking on the writer).

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tokio::sync::Mutex;

use crate::db;
use crate::error::{HarvestError, Result};
use crate::migrate;
use crate::models::AnalysisRecord;

const SELECT_COLUMNS: &str = "hash, remote_key, title, primary_author, detected_series_name, \
     volume_number, confidence, strategy_tag, processing_ms, analysis_timestamp, \
     subjects_json, language, first_publish_year, publisher";

/// Per-strategy ledger totals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyCount {
    pub strategy_tag: String,
    pub analysed: u64,
    pub with_series: u64,
}

pub struct Ledger {
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl Ledger {
    /// Open the ledger at `path`, creating the file and schema if needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            writer: Mutex::new(()),
        })
    }

    /// True iff a record with this hash has been committed.
    pub async fn seen(&self, hash: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM analyses WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Append a record. Returns `false` when the hash was already present.
    ///
    /// The row is durable when this returns. Failures are
    /// [`HarvestError::LedgerWrite`].
    pub async fn record(&self, record: &AnalysisRecord) -> Result<bool> {
        let subjects_json = serde_json::to_string(&record.subjects)?;
        let _guard = self.writer.lock().await;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO analyses (
                hash, remote_key, title, primary_author, detected_series_name,
                volume_number, confidence, strategy_tag, processing_ms, analysis_timestamp,
                subjects_json, language, first_publish_year, publisher
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.hash)
        .bind(&record.remote_key)
        .bind(&record.title)
        .bind(&record.primary_author)
        .bind(&record.detected_series_name)
        .bind(record.volume_number.map(i64::from))
        .bind(i64::from(record.confidence))
        .bind(&record.strategy_tag)
        .bind(i64::try_from(record.processing_ms).unwrap_or(i64::MAX))
        .bind(record.analysis_timestamp.timestamp_millis())
        .bind(&subjects_json)
        .bind(&record.language)
        .bind(record.first_publish_year)
        .bind(&record.publisher)
        .execute(&self.pool)
        .await
        .map_err(HarvestError::LedgerWrite)?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analyses")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Every record with a detected series, ordered by series name then hash.
    pub async fn iter_series(&self) -> Result<Vec<AnalysisRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM analyses WHERE detected_series_name IS NOT NULL \
             ORDER BY detected_series_name, hash",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Look up a single record by hash.
    pub async fn get(&self, hash: &str) -> Result<Option<AnalysisRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM analyses WHERE hash = ?", SELECT_COLUMNS))
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_record).transpose()
    }

    pub async fn strategy_counts(&self) -> Result<Vec<StrategyCount>> {
        let rows = sqlx::query(
            r#"
            SELECT strategy_tag,
                   COUNT(*) AS analysed,
                   SUM(CASE WHEN detected_series_name IS NULL THEN 0 ELSE 1 END) AS with_series
            FROM analyses
            GROUP BY strategy_tag
            ORDER BY analysed DESC, strategy_tag
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| StrategyCount {
                strategy_tag: row.get("strategy_tag"),
                analysed: row.get::<i64, _>("analysed") as u64,
                with_series: row.get::<i64, _>("with_series") as u64,
            })
            .collect())
    }

    /// Most frequently detected series names.
    pub async fn series_counts(&self, limit: i64) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT detected_series_name AS name, COUNT(*) AS books
            FROM analyses
            WHERE detected_series_name IS NOT NULL
            GROUP BY detected_series_name
            ORDER BY books DESC, name
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get("name"), row.get::<i64, _>("books") as u64))
            .collect())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

fn row_to_record(row: &SqliteRow) -> Result<AnalysisRecord> {
    let subjects_json: String = row.try_get("subjects_json")?;
    let timestamp_ms: i64 = row.try_get("analysis_timestamp")?;
    let volume: Option<i64> = row.try_get("volume_number")?;
    let confidence: i64 = row.try_get("confidence")?;
    let processing_ms: i64 = row.try_get("processing_ms")?;

    Ok(AnalysisRecord {
        hash: row.try_get("hash")?,
        remote_key: row.try_get("remote_key")?,
        title: row.try_get("title")?,
        primary_author: row.try_get("primary_author")?,
        detected_series_name: row.try_get("detected_series_name")?,
        volume_number: volume.and_then(|v| u32::try_from(v).ok()),
        confidence: confidence.clamp(0, 100) as u8,
        strategy_tag: row.try_get("strategy_tag")?,
        processing_ms: processing_ms.max(0) as u64,
        analysis_timestamp: DateTime::<Utc>::from_timestamp_millis(timestamp_ms)
            .unwrap_or_default(),
        subjects: serde_json::from_str(&subjects_json).unwrap_or_default(),
        language: row.try_get("language")?,
        first_publish_year: row.try_get("first_publish_year")?,
        publisher: row.try_get("publisher")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(hash: &str, series: Option<&str>) -> AnalysisRecord {
        AnalysisRecord {
            hash: hash.to_string(),
            remote_key: format!("/works/{}", hash),
            title: "One Piece, Vol. 42".to_string(),
            primary_author: "Eiichiro Oda".to_string(),
            detected_series_name: series.map(str::to_string),
            volume_number: series.map(|_| 42),
            confidence: if series.is_some() { 90 } else { 0 },
            strategy_tag: "subjects".to_string(),
            processing_ms: 3,
            analysis_timestamp: Utc::now(),
            subjects: vec!["manga".to_string(), "shonen".to_string()],
            language: Some("eng".to_string()),
            first_publish_year: Some(2006),
            publisher: Some("Viz Media".to_string()),
        }
    }

    async fn open_tmp() -> (TempDir, Ledger) {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(&tmp.path().join("ledger.sqlite")).await.unwrap();
        (tmp, ledger)
    }

    #[tokio::test]
    async fn record_then_seen() {
        let (_tmp, ledger) = open_tmp().await;
        assert!(!ledger.seen("aa").await.unwrap());
        assert!(ledger.record(&sample("aa", Some("One Piece"))).await.unwrap());
        assert!(ledger.seen("aa").await.unwrap());
        assert_eq!(ledger.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_record_is_a_noop() {
        let (_tmp, ledger) = open_tmp().await;
        let first = sample("bb", Some("One Piece"));
        assert!(ledger.record(&first).await.unwrap());

        let mut second = first.clone();
        second.title = "Something else".to_string();
        assert!(!ledger.record(&second).await.unwrap());

        assert_eq!(ledger.count().await.unwrap(), 1);
        let stored = ledger.get("bb").await.unwrap().unwrap();
        assert_eq!(stored.title, "One Piece, Vol. 42");
    }

    #[tokio::test]
    async fn iter_series_skips_unmatched_books() {
        let (_tmp, ledger) = open_tmp().await;
        ledger.record(&sample("c1", Some("One Piece"))).await.unwrap();
        ledger.record(&sample("c2", None)).await.unwrap();

        let series = ledger.iter_series().await.unwrap();
        assert_eq!(series.len(), 1);
        let rec = &series[0];
        assert_eq!(rec.detected_series_name.as_deref(), Some("One Piece"));
        assert_eq!(rec.volume_number, Some(42));
        assert_eq!(rec.subjects, vec!["manga".to_string(), "shonen".to_string()]);

        let counts = ledger.strategy_counts().await.unwrap();
        assert_eq!(
            counts,
            vec![StrategyCount {
                strategy_tag: "subjects".to_string(),
                analysed: 2,
                with_series: 1,
            }]
        );
    }

    #[tokio::test]
    async fn survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("ledger.sqlite");
        {
            let ledger = Ledger::open(&path).await.unwrap();
            ledger.record(&sample("dd", None)).await.unwrap();
            ledger.close().await;
        }
        let ledger = Ledger::open(&path).await.unwrap();
        assert!(ledger.seen("dd").await.unwrap());
    }
}
