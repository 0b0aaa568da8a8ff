//! Catalog access.
//!
//! Defines the [`Catalog`] trait consumed by the orchestrator and the
//! [`OpenLibraryClient`] implementation that talks to the Open Library
//! search endpoint.
//!
//! # Retry Strategy
//!
//! - HTTP 429, 5xx, network errors, timeouts and non-JSON bodies → retry
//! - HTTP 4xx (not 429) → fail immediately
//! - Backoff: `retry_base * 2^(attempt-1)`, ±25% jitter, up to
//!   `max_attempts` attempts in total
//!
//! # Rate Limiting
//!
//! A single token bucket caps requests per second across every in-flight
//! call; a semaphore caps how many requests are outstanding at once.

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::CatalogConfig;
use crate::error::{HarvestError, Result};
use crate::models::Book;

/// Fields requested from the search endpoint.
pub const SEARCH_FIELDS: &str =
    "key,title,author_name,first_publish_year,subject,publisher,language,isbn";

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub books: Vec<Book>,
    /// `numFound` as reported by the catalog.
    pub total_estimate: u64,
    /// Docs that could not be parsed into a [`Book`].
    pub parse_errors: u64,
    /// Docs dropped because their title was empty.
    pub untitled: u64,
}

/// A searchable book catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Fetch up to `limit` books matching `query`, starting at `offset`.
    async fn search(&self, query: &str, offset: u32, limit: u32) -> Result<SearchPage>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "numFound", alias = "num_found", default)]
    num_found: u64,
    #[serde(default)]
    docs: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawDoc {
    key: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    author_name: Vec<String>,
    #[serde(default)]
    first_publish_year: Option<i32>,
    #[serde(default)]
    subject: Vec<String>,
    #[serde(default)]
    publisher: Vec<String>,
    #[serde(default)]
    language: Vec<String>,
    #[serde(default)]
    isbn: Vec<String>,
}

enum DocOutcome {
    Book(Book),
    Untitled,
    Malformed(String),
}

fn parse_doc(value: serde_json::Value) -> DocOutcome {
    let raw: RawDoc = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => return DocOutcome::Malformed(e.to_string()),
    };

    let title = raw.title.as_deref().map(str::trim).unwrap_or_default();
    if title.is_empty() {
        return DocOutcome::Untitled;
    }

    DocOutcome::Book(Book {
        remote_key: raw.key,
        title: title.to_string(),
        authors: raw
            .author_name
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
        first_publish_year: raw.first_publish_year,
        subjects: raw
            .subject
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<BTreeSet<_>>(),
        publisher: raw.publisher.into_iter().next(),
        language: raw.language.into_iter().next(),
        isbn: raw.isbn.into_iter().next(),
    })
}

/// Parse a search response body into a [`SearchPage`].
///
/// A body that is not a JSON search response is a transient error (the
/// catalog occasionally serves HTML error pages with status 200).
/// Individual docs that fail to parse are dropped and counted.
pub fn parse_search_response(body: &str) -> Result<SearchPage> {
    let response: SearchResponse = serde_json::from_str(body)
        .map_err(|e| HarvestError::TransientRemote(format!("malformed JSON response: {}", e)))?;

    let mut page = SearchPage {
        total_estimate: response.num_found,
        ..SearchPage::default()
    };

    for doc in response.docs {
        match parse_doc(doc) {
            DocOutcome::Book(book) => page.books.push(book),
            DocOutcome::Untitled => page.untitled += 1,
            DocOutcome::Malformed(reason) => {
                tracing::debug!("dropping malformed doc: {}", HarvestError::Parse(reason));
                page.parse_errors += 1;
            }
        }
    }

    Ok(page)
}

/// Delay before retry number `attempt` (1-based), with ±25% jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(10));
    let jitter: f64 = rand::thread_rng().gen_range(0.75..=1.25);
    exp.mul_f64(jitter)
}

/// Open Library search client with rate limiting, bounded concurrency and
/// retry.
pub struct OpenLibraryClient {
    client: Client,
    base_url: String,
    user_agent: String,
    max_attempts: u32,
    retry_base: Duration,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    permits: Semaphore,
    /// HTTP attempts made, retries included.
    attempts: AtomicU64,
}

impl OpenLibraryClient {
    pub fn new(config: &CatalogConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HarvestError::TransientRemote(format!("failed to build HTTP client: {}", e)))?;

        let per_second = NonZeroU32::new(config.rate_limit).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(Quota::per_second(per_second));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
            max_attempts: config.max_attempts.max(1),
            retry_base: Duration::from_millis(config.retry_base_ms),
            rate_limiter,
            permits: Semaphore::new(config.concurrency.max(1)),
            attempts: AtomicU64::new(0),
        })
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    async fn attempt(&self, query: &str, offset: u32, limit: u32) -> Result<SearchPage> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| HarvestError::TransientRemote("request gate closed".to_string()))?;
        self.rate_limiter.until_ready().await;
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let url = format!("{}/search.json", self.base_url);
        let offset = offset.to_string();
        let limit = limit.to_string();

        let response = self
            .client
            .get(&url)
            .header("User-Agent", &self.user_agent)
            .query(&[
                ("q", query),
                ("offset", offset.as_str()),
                ("limit", limit.as_str()),
                ("fields", SEARCH_FIELDS),
            ])
            .send()
            .await
            .map_err(|e| HarvestError::TransientRemote(format!("request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HarvestError::TransientRemote(format!("failed to read body: {}", e)))?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(HarvestError::TransientRemote(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(HarvestError::PermanentRemote {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        parse_search_response(&body)
    }
}

#[async_trait]
impl Catalog for OpenLibraryClient {
    async fn search(&self, query: &str, offset: u32, limit: u32) -> Result<SearchPage> {
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            match self.attempt(query, offset, limit).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(
                        query,
                        offset,
                        attempt,
                        "catalog request failed, will retry: {}",
                        e
                    );
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(backoff_delay(self.retry_base, attempt)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            HarvestError::TransientRemote("catalog search failed after retries".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declared_fields_only() {
        let body = r#"{
            "numFound": 2,
            "start": 0,
            "docs": [
                {
                    "key": "/works/OL82563W",
                    "title": "Harry Potter and the Chamber of Secrets",
                    "author_name": ["J. K. Rowling"],
                    "first_publish_year": 1998,
                    "subject": ["fantasy", "Magic"],
                    "publisher": ["Bloomsbury", "Scholastic"],
                    "language": ["eng"],
                    "isbn": ["0747538492"],
                    "ebook_access": "borrowable"
                },
                { "key": "/works/OL2W", "title": "   " }
            ]
        }"#;
        let page = parse_search_response(body).unwrap();
        assert_eq!(page.total_estimate, 2);
        assert_eq!(page.books.len(), 1);
        assert_eq!(page.untitled, 1);
        let book = &page.books[0];
        assert_eq!(book.authors, vec!["J. K. Rowling".to_string()]);
        assert_eq!(book.publisher.as_deref(), Some("Bloomsbury"));
        assert_eq!(book.language.as_deref(), Some("eng"));
        assert_eq!(book.first_publish_year, Some(1998));
        assert!(book.subjects.contains("Magic"));
    }

    #[test]
    fn malformed_docs_are_counted() {
        let body = r#"{"numFound": 3, "docs": [
            {"title": "No key"},
            {"key": "/works/OL3W", "title": "Fine"},
            {"key": "/works/OL4W", "title": "Bad year", "first_publish_year": "soon"}
        ]}"#;
        let page = parse_search_response(body).unwrap();
        assert_eq!(page.books.len(), 1);
        assert_eq!(page.parse_errors, 2);
    }

    #[test]
    fn non_json_body_is_transient() {
        let err = parse_search_response("<html>oops</html>").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn backoff_grows_with_jitter_bounds() {
        let base = Duration::from_millis(1000);
        for attempt in 1..=4u32 {
            let nominal = 1000.0 * f64::from(1u32 << (attempt - 1));
            let delay = backoff_delay(base, attempt).as_secs_f64() * 1000.0;
            assert!(delay >= nominal * 0.75 - 1.0, "attempt {} delay {}", attempt, delay);
            assert!(delay <= nominal * 1.25 + 1.0, "attempt {} delay {}", attempt, delay);
        }
    }
}
