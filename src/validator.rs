//! Candidate validation and canonical-entry synthesis.
//!
//! A candidate is accepted when its name is meaningful, it has a primary
//! author, and its confidence clears the tier threshold for its size:
//!
//! | Tier | ≥ 2 books | 1 book |
//! |------|-----------|--------|
//! | permissive | max confidence ≥ 50 | max confidence ≥ 80 |
//! | strict | max confidence ≥ 70 | max confidence ≥ 85 |
//!
//! Accepted candidates are turned into [`CanonicalEntry`] values: category
//! (manga → comic → novel, first match wins), keywords, title variations
//! and exclusions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::ValidatorConfig;
use crate::models::{CanonicalEntry, Category, SeriesCandidate};
use crate::normalize::{collapse_whitespace, fold};

/// Acceptance threshold preset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Permissive,
    Strict,
}

impl Tier {
    /// Minimum max-confidence for groups of two or more books.
    pub fn group_threshold(&self) -> u8 {
        match self {
            Tier::Permissive => 50,
            Tier::Strict => 70,
        }
    }

    /// Minimum confidence for a single-book candidate.
    pub fn single_threshold(&self) -> u8 {
        match self {
            Tier::Permissive => 80,
            Tier::Strict => 85,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Permissive => "permissive",
            Tier::Strict => "strict",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permissive" => Ok(Tier::Permissive),
            "strict" => Ok(Tier::Strict),
            other => Err(format!("unknown tier '{}'. Must be permissive or strict.", other)),
        }
    }
}

/// Why a candidate was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NameNotMeaningful,
    MissingAuthor,
    LowConfidenceSingle,
    LowConfidenceGroup,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::NameNotMeaningful => "name_not_meaningful",
            RejectReason::MissingAuthor => "missing_author",
            RejectReason::LowConfidenceSingle => "low_confidence_single",
            RejectReason::LowConfidenceGroup => "low_confidence_group",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Rejection {
    pub name: String,
    pub author: String,
    pub book_count: usize,
    pub max_confidence: u8,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub accepted: Vec<CanonicalEntry>,
    pub rejected: Vec<Rejection>,
}

pub struct Validator {
    tier: Tier,
    config: ValidatorConfig,
    stop_phrases: Vec<String>,
    manga: Vec<String>,
    comic: Vec<String>,
    stop_words: Vec<String>,
}

const LEADING_ARTICLES: [&str; 4] = ["the ", "le ", "la ", "les "];

impl Validator {
    /// `stop_phrases` are the detector's stop-phrases; names made only of
    /// them are not meaningful.
    pub fn new(config: &ValidatorConfig, tier: Tier, stop_phrases: &[String]) -> Self {
        let folded = |items: &[String]| items.iter().map(|s| fold(s)).collect::<Vec<_>>();
        Self {
            tier,
            config: config.clone(),
            stop_phrases: folded(stop_phrases),
            manga: folded(&config.manga_indicators),
            comic: folded(&config.comic_indicators),
            stop_words: folded(&config.stop_words),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn run(&self, candidates: &[SeriesCandidate], now: DateTime<Utc>) -> ValidationOutcome {
        let mut outcome = ValidationOutcome::default();
        for candidate in candidates {
            match self.evaluate(candidate) {
                Ok(()) => outcome.accepted.push(self.build_entry(candidate, now)),
                Err(reason) => outcome.rejected.push(Rejection {
                    name: candidate.display_name.clone(),
                    author: candidate.author.clone(),
                    book_count: candidate.book_count(),
                    max_confidence: candidate.max_confidence(),
                    reason,
                }),
            }
        }
        outcome
    }

    pub fn evaluate(&self, candidate: &SeriesCandidate) -> Result<(), RejectReason> {
        if !self.meaningful_name(&candidate.display_name) {
            return Err(RejectReason::NameNotMeaningful);
        }
        if candidate.author.trim().is_empty() {
            return Err(RejectReason::MissingAuthor);
        }
        let confidence = candidate.max_confidence();
        match candidate.book_count() {
            0 => Err(RejectReason::LowConfidenceSingle),
            1 if confidence < self.tier.single_threshold() => Err(RejectReason::LowConfidenceSingle),
            1 => Ok(()),
            _ if confidence < self.tier.group_threshold() => Err(RejectReason::LowConfidenceGroup),
            _ => Ok(()),
        }
    }

    /// Rejects names shorter than 3 characters, purely numeric names, and
    /// names made only of stop-phrases.
    pub fn meaningful_name(&self, name: &str) -> bool {
        let name = name.trim();
        if name.chars().count() < 3 {
            return false;
        }
        let folded = fold(name);
        if folded.is_empty() || folded.chars().all(|c| c.is_ascii_digit() || c == ' ') {
            return false;
        }

        let mut rest = format!(" {} ", folded);
        loop {
            let before = rest.len();
            for phrase in &self.stop_phrases {
                rest = rest.replace(&format!(" {} ", phrase), " ");
            }
            if rest.len() == before {
                break;
            }
        }
        !rest.trim().is_empty()
    }

    pub fn categorize(&self, candidate: &SeriesCandidate) -> Category {
        let haystack: Vec<String> = std::iter::once(candidate.display_name.as_str())
            .chain(candidate.subjects.iter().map(String::as_str))
            .chain(candidate.books.iter().map(|b| b.title.as_str()))
            .map(fold)
            .collect();
        let any = |indicators: &[String]| {
            indicators
                .iter()
                .any(|ind| haystack.iter().any(|h| h.contains(ind.as_str())))
        };

        if any(&self.manga) {
            Category::Manga
        } else if any(&self.comic) {
            Category::Comic
        } else {
            Category::Novel
        }
    }

    /// Alphabetic tokens of at least 3 characters from the series name,
    /// the author and the titles, minus stop-words, deduplicated and capped.
    pub fn keywords(&self, candidate: &SeriesCandidate) -> Vec<String> {
        let sources = std::iter::once(candidate.display_name.as_str())
            .chain(std::iter::once(candidate.author.as_str()))
            .chain(candidate.books.iter().map(|b| b.title.as_str()));

        let mut keywords: Vec<String> = Vec::new();
        for source in sources {
            for token in fold(source).split_whitespace() {
                if keywords.len() >= self.config.max_keywords {
                    return keywords;
                }
                if token.chars().count() < 3 || !token.chars().all(char::is_alphabetic) {
                    continue;
                }
                if self.stop_words.iter().any(|w| w == token) {
                    continue;
                }
                if !keywords.iter().any(|k| k == token) {
                    keywords.push(token.to_string());
                }
            }
        }
        keywords
    }

    /// Alternative spellings of `name`.
    pub fn variations(&self, name: &str) -> Vec<String> {
        let name = name.trim();
        let lower = name.to_lowercase();
        let mut forms = vec![
            name.replace(':', ""),
            name.replace(" — ", " "),
            name.chars()
                .map(|c| match c {
                    ' ' => '-',
                    '-' => ' ',
                    other => other,
                })
                .collect(),
            fold(name),
        ];
        for article in LEADING_ARTICLES {
            if lower.starts_with(article) {
                if let Some(rest) = name.get(article.len()..) {
                    forms.push(rest.to_string());
                }
            }
        }

        let mut out: Vec<String> = Vec::new();
        for form in forms {
            let form = collapse_whitespace(&form);
            if form.chars().count() < 3 || form == name || out.contains(&form) {
                continue;
            }
            out.push(form);
        }
        out
    }

    /// Configured exclusion tokens that do not occur in the series name.
    pub fn exclusions(&self, name: &str) -> Vec<String> {
        let folded = fold(name);
        let mut out: Vec<String> = Vec::new();
        for exclusion in &self.config.exclusions {
            let ex = fold(exclusion);
            if ex.is_empty() || folded.contains(ex.as_str()) || out.contains(&ex) {
                continue;
            }
            out.push(ex);
        }
        out
    }

    pub fn build_entry(&self, candidate: &SeriesCandidate, now: DateTime<Utc>) -> CanonicalEntry {
        let book_count = u32::try_from(candidate.book_count()).unwrap_or(u32::MAX);
        let volumes = candidate.max_volume().unwrap_or(0).max(book_count).max(1);
        let tags: Vec<&str> = candidate.strategy_tags.iter().map(String::as_str).collect();

        CanonicalEntry {
            name: candidate.display_name.clone(),
            authors: vec![candidate.author.clone()],
            category: self.categorize(candidate),
            volumes,
            keywords: self.keywords(candidate),
            title_variations: self.variations(&candidate.display_name),
            exclusions: self.exclusions(&candidate.display_name),
            source: format!("harvest:{}", tags.join("+")),
            confidence: candidate.max_confidence(),
            first_detected_at: now,
        }
    }
}
