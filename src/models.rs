//! Core data models used throughout the harvester.
//!
//! These types represent the books, analysis rows, series candidates and
//! canonical entries that flow through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A book as parsed from a catalog response. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    /// Stable catalog identifier, e.g. `/works/OL82563W`.
    pub remote_key: String,
    pub title: String,
    pub authors: Vec<String>,
    pub first_publish_year: Option<i32>,
    pub subjects: BTreeSet<String>,
    pub publisher: Option<String>,
    pub language: Option<String>,
    pub isbn: Option<String>,
}

impl Book {
    /// First listed author, or an empty string.
    pub fn primary_author(&self) -> &str {
        self.authors.first().map(String::as_str).unwrap_or("")
    }
}

/// Detector verdict for a single book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub series_name: Option<String>,
    pub volume: Option<u32>,
    /// 0..=100
    pub confidence: u8,
}

impl Detection {
    pub fn none() -> Self {
        Self {
            series_name: None,
            volume: None,
            confidence: 0,
        }
    }

    pub fn is_series(&self) -> bool {
        self.series_name.is_some()
    }
}

/// One ledger row. Written once, never updated.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRecord {
    pub hash: String,
    pub remote_key: String,
    pub title: String,
    pub primary_author: String,
    pub detected_series_name: Option<String>,
    pub volume_number: Option<u32>,
    pub confidence: u8,
    pub strategy_tag: String,
    pub processing_ms: u64,
    pub analysis_timestamp: DateTime<Utc>,
    pub subjects: Vec<String>,
    pub language: Option<String>,
    pub first_publish_year: Option<i32>,
    pub publisher: Option<String>,
}

impl AnalysisRecord {
    pub fn from_detection(
        hash: String,
        book: &Book,
        detection: &Detection,
        strategy_tag: &str,
        processing_ms: u64,
    ) -> Self {
        Self {
            hash,
            remote_key: book.remote_key.clone(),
            title: book.title.clone(),
            primary_author: book.primary_author().to_string(),
            detected_series_name: detection.series_name.clone(),
            volume_number: detection.volume,
            confidence: detection.confidence,
            strategy_tag: strategy_tag.to_string(),
            processing_ms,
            analysis_timestamp: Utc::now(),
            subjects: book.subjects.iter().cloned().collect(),
            language: book.language.clone(),
            first_publish_year: book.first_publish_year,
            publisher: book.publisher.clone(),
        }
    }
}

/// Series category of a canonical entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Novel,
    Comic,
    Manga,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Novel => "novel",
            Category::Comic => "comic",
            Category::Manga => "manga",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "novel" => Ok(Category::Novel),
            "comic" => Ok(Category::Comic),
            "manga" => Ok(Category::Manga),
            other => Err(format!("unknown category: '{}'", other)),
        }
    }
}

/// A group of analysis records sharing a normalized series name and author.
#[derive(Debug, Clone)]
pub struct SeriesCandidate {
    pub normalized_name: String,
    pub normalized_author: String,
    /// Most frequent raw series name among contributors.
    pub display_name: String,
    /// Primary author as written on the first contributing record.
    pub author: String,
    pub books: Vec<AnalysisRecord>,
    pub volumes: BTreeSet<u32>,
    pub confidences: Vec<u8>,
    pub strategy_tags: BTreeSet<String>,
    pub subjects: BTreeSet<String>,
    pub languages: BTreeSet<String>,
    pub earliest_year: Option<i32>,
    pub latest_year: Option<i32>,
}

impl SeriesCandidate {
    pub fn book_count(&self) -> usize {
        self.books.len()
    }

    pub fn max_confidence(&self) -> u8 {
        self.confidences.iter().copied().max().unwrap_or(0)
    }

    pub fn max_volume(&self) -> Option<u32> {
        self.volumes.iter().next_back().copied()
    }
}

/// A merge-ready series entry as stored in the canonical file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEntry {
    pub name: String,
    pub authors: Vec<String>,
    pub category: Category,
    pub volumes: u32,
    pub keywords: Vec<String>,
    pub title_variations: Vec<String>,
    pub exclusions: Vec<String>,
    pub source: String,
    pub confidence: u8,
    pub first_detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_serializes_lowercase() {
        let json = serde_json::to_string(&Category::Manga).unwrap();
        assert_eq!(json, "\"manga\"");
        assert_eq!("comic".parse::<Category>().unwrap(), Category::Comic);
        assert!("poetry".parse::<Category>().is_err());
    }

    #[test]
    fn primary_author_defaults_to_empty() {
        let book = Book {
            remote_key: "/works/OL1W".into(),
            title: "Untitled".into(),
            authors: vec![],
            first_publish_year: None,
            subjects: BTreeSet::new(),
            publisher: None,
            language: None,
            isbn: None,
        };
        assert_eq!(book.primary_author(), "");
    }
}
