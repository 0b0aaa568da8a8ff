//! Ledger schema.
//!
//! Schema version 1. Every statement is idempotent so `harvest init` and
//! every session start can run it unconditionally. A ledger written by a
//! newer version is still readable: later versions only add columns.

use sqlx::SqlitePool;

use crate::error::Result;

pub const SCHEMA_VERSION: i64 = 1;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analyses (
            hash TEXT PRIMARY KEY,
            remote_key TEXT NOT NULL,
            title TEXT NOT NULL,
            primary_author TEXT NOT NULL,
            detected_series_name TEXT,
            volume_number INTEGER,
            confidence INTEGER NOT NULL,
            strategy_tag TEXT NOT NULL,
            processing_ms INTEGER NOT NULL,
            analysis_timestamp INTEGER NOT NULL,
            subjects_json TEXT NOT NULL DEFAULT '[]',
            language TEXT,
            first_publish_year INTEGER,
            publisher TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analyses_series ON analyses(detected_series_name)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_analyses_strategy ON analyses(strategy_tag)")
        .execute(pool)
        .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_meta (id, version) VALUES (1, ?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    let version: i64 = sqlx::query_scalar("SELECT version FROM schema_meta WHERE id = 1")
        .fetch_one(pool)
        .await?;
    if version > SCHEMA_VERSION {
        tracing::warn!(
            version,
            supported = SCHEMA_VERSION,
            "ledger was written by a newer version; reading known columns only"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = db::connect(&tmp.path().join("ledger.sqlite")).await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_meta")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        pool.close().await;
    }
}
