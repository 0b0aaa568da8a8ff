//! Series detection.
//!
//! A pure function from a [`Book`] to a [`Detection`]. The title is tested
//! against one ordered battery of patterns, each capturing a series name and
//! a volume number:
//!
//! | Group | Examples | Base confidence |
//! |-------|----------|-----------------|
//! | Explicit markers | `Name, Volume 3`, `Name Book 2`, `Name Vol. 4`, `Name #5`, `Name Part 2`, `Name — Tome 6` | 85–90 |
//! | Punctuation numbering | `Name: 3`, `Name (3)`, `Name - 3` | 75–80 |
//! | Trailing numerals | `Name 3`, `Name III` | 60–65 |
//! | Localized markers | `Name Tome 3`, `Name Band 2`, `Name Tomo 4` | 80 |
//! | Franchise prefix | `Harry Potter and the Chamber of Secrets` | 80 |
//!
//! Adjustments: +5 when a series keyword appears in the subjects, +5 when the
//! name is a known franchise, −10 for names under 4 characters, −15 for names
//! that are a stop-phrase. The highest adjusted confidence wins; ties go to
//! the earlier pattern.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{DetectorConfig, Franchise};
use crate::models::{Book, Detection};
use crate::normalize::fold;

struct Pattern {
    name: &'static str,
    regex: Regex,
    base: i32,
}

impl Pattern {
    fn new(name: &'static str, regex: &str, base: i32) -> Self {
        Self {
            name,
            regex: Regex::new(regex).expect("valid regex"),
            base,
        }
    }
}

const SEP: &str = r"[\s,:;.\-–—(\[]+";
const NUM: &str = r"(?P<num>\d{1,3})\b";
const TAIL: &str = r"(?:\s*[:\-–—].*)?$";

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        Pattern::new("volume", &format!(r"(?i)^(?P<name>.+?){}volume\s*{}", SEP, NUM), 90),
        Pattern::new("book", &format!(r"(?i)^(?P<name>.+?){}book\s*#?\s*{}", SEP, NUM), 90),
        Pattern::new("vol", &format!(r"(?i)^(?P<name>.+?){}vol\.?\s*{}", SEP, NUM), 85),
        Pattern::new("hash", &format!(r"(?i)^(?P<name>.+?)\s*[,:;(\[]?\s*#\s*{}", NUM), 85),
        Pattern::new("part", &format!(r"(?i)^(?P<name>.+?){}part\s*{}", SEP, NUM), 85),
        Pattern::new("dashed_tome", &format!(r"(?i)^(?P<name>.+?)\s*[\-–—]\s*tome\s*{}", NUM), 85),
        Pattern::new("colon_number", &format!(r"(?i)^(?P<name>.+?)\s*:\s*{}{}", NUM, TAIL), 80),
        Pattern::new("paren_number", r"(?i)^(?P<name>.+?)\s*\(\s*(?P<num>\d{1,3})\s*\)\s*$", 80),
        Pattern::new("dash_number", &format!(r"(?i)^(?P<name>.+?)\s+[\-–—]\s+{}{}", NUM, TAIL), 75),
        Pattern::new("trailing_number", r"(?i)^(?P<name>.+?)\s+(?P<num>\d{1,3})$", 65),
        Pattern::new(
            "trailing_roman",
            r"^(?P<name>.+?)\s+(?P<roman>XX|XIX|XVIII|XVII|XVI|XV|XIV|XIII|XII|XI|X|IX|VIII|VII|VI|V|IV|III|II)$",
            60,
        ),
        Pattern::new(
            "localized",
            &format!(
                r"(?i)^(?P<name>.+?){}(?:tome|band|bd\.?|tomo|volumen|livre|libro|teil)\s*{}",
                SEP, NUM
            ),
            80,
        ),
    ]
});

const FRANCHISE_BASE: i32 = 80;
const SERIES_KEYWORD_BONUS: i32 = 5;
const KNOWN_FRANCHISE_BONUS: i32 = 5;
const SHORT_NAME_PENALTY: i32 = 10;
const STOP_PHRASE_PENALTY: i32 = 15;

/// A single pattern hit, before tie-breaking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern: &'static str,
    pub series_name: String,
    pub volume: Option<u32>,
    pub base: u8,
    pub confidence: u8,
}

fn roman_value(s: &str) -> Option<u32> {
    let value = |c| match c {
        'I' => Some(1),
        'V' => Some(5),
        'X' => Some(10),
        _ => None,
    };
    let digits: Option<Vec<u32>> = s.chars().map(value).collect();
    let digits = digits?;
    let mut total = 0;
    for (i, d) in digits.iter().enumerate() {
        match digits.get(i + 1) {
            Some(next) if next > d => total -= *d as i32,
            _ => total += *d as i32,
        }
    }
    u32::try_from(total).ok().filter(|v| *v > 0)
}

fn clean_name(raw: &str) -> String {
    raw.trim()
        .trim_end_matches(|c: char| c.is_whitespace() || ",:;.-–—([#".contains(c))
        .trim()
        .to_string()
}

struct FranchiseMatcher {
    folded: String,
    /// Folded volume titles; `|` separates alternative titles of one volume.
    volumes: Vec<Vec<String>>,
}

impl FranchiseMatcher {
    fn new(franchise: &Franchise) -> Self {
        Self {
            folded: fold(&franchise.name),
            volumes: franchise
                .volumes
                .iter()
                .map(|v| v.split('|').map(fold).filter(|s| !s.is_empty()).collect())
                .collect(),
        }
    }

    /// Display-form prefix of `title` naming this franchise, plus the
    /// remainder of the title.
    fn split_title<'t>(&self, title: &'t str) -> Option<(&'t str, &'t str)> {
        if self.folded.is_empty() {
            return None;
        }
        let word_ends = title
            .char_indices()
            .filter(|&(i, c)| c.is_whitespace() && i > 0 && !title[..i].ends_with(char::is_whitespace))
            .map(|(i, _)| i)
            .chain(std::iter::once(title.len()));

        for end in word_ends {
            let folded = fold(&title[..end]);
            if folded == self.folded {
                return Some((&title[..end], &title[end..]));
            }
            if !self.folded.starts_with(&folded) {
                return None;
            }
        }
        None
    }

    fn volume_in(&self, remainder: &str) -> Option<u32> {
        let rest = fold(remainder);
        if rest.is_empty() {
            return None;
        }
        self.volumes
            .iter()
            .position(|alts| alts.iter().any(|alt| rest.contains(alt.as_str())))
            .and_then(|i| u32::try_from(i + 1).ok())
    }
}

pub struct SeriesDetector {
    franchises: Vec<FranchiseMatcher>,
    series_keywords: Vec<String>,
    stop_phrases: Vec<String>,
}

impl SeriesDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            franchises: config.franchises.iter().map(FranchiseMatcher::new).collect(),
            series_keywords: config.series_keywords.iter().map(|k| fold(k)).collect(),
            stop_phrases: config.stop_phrases.iter().map(|p| fold(p)).collect(),
        }
    }

    /// Detect the series of a book. Returns [`Detection::none`] when no
    /// pattern matches.
    pub fn detect(&self, book: &Book) -> Detection {
        self.detect_title(&book.title, book.subjects.iter().map(String::as_str))
    }

    pub fn detect_title<'a>(
        &self,
        title: &str,
        subjects: impl IntoIterator<Item = &'a str>,
    ) -> Detection {
        let matches = self.matches(title, subjects);
        // max_by_key keeps the last maximum, so walk in reverse to keep the
        // earliest pattern on ties.
        match matches.iter().rev().max_by_key(|m| m.confidence) {
            Some(best) => Detection {
                series_name: Some(best.series_name.clone()),
                volume: best.volume,
                confidence: best.confidence,
            },
            None => Detection::none(),
        }
    }

    /// Every pattern that matches `title`, in battery order, with adjusted
    /// confidences.
    pub fn matches<'a>(
        &self,
        title: &str,
        subjects: impl IntoIterator<Item = &'a str>,
    ) -> Vec<PatternMatch> {
        let title = title.trim();
        let keyword_bonus = self.has_series_keyword(subjects);
        let mut hits = Vec::new();

        for pattern in PATTERNS.iter() {
            let Some(caps) = pattern.regex.captures(title) else {
                continue;
            };
            let name = clean_name(caps.name("name").map(|m| m.as_str()).unwrap_or_default());
            let volume = if let Some(num) = caps.name("num") {
                num.as_str().parse::<u32>().ok()
            } else {
                caps.name("roman").and_then(|r| roman_value(r.as_str()))
            };
            let Some(volume) = volume.filter(|v| *v >= 1) else {
                continue;
            };
            if name.is_empty() || !name.chars().any(char::is_alphabetic) {
                continue;
            }
            hits.push(self.scored(pattern.name, name, Some(volume), pattern.base, keyword_bonus));
        }

        for franchise in &self.franchises {
            if let Some((prefix, remainder)) = franchise.split_title(title) {
                let name = clean_name(prefix);
                if name.is_empty() {
                    continue;
                }
                let volume = franchise.volume_in(remainder);
                hits.push(self.scored("franchise", name, volume, FRANCHISE_BASE, keyword_bonus));
            }
        }

        hits
    }

    fn scored(
        &self,
        pattern: &'static str,
        name: String,
        volume: Option<u32>,
        base: i32,
        keyword_bonus: bool,
    ) -> PatternMatch {
        let folded = fold(&name);
        let mut confidence = base;
        if keyword_bonus {
            confidence += SERIES_KEYWORD_BONUS;
        }
        if self.is_known_franchise(&folded) {
            confidence += KNOWN_FRANCHISE_BONUS;
        }
        if name.chars().count() < 4 {
            confidence -= SHORT_NAME_PENALTY;
        }
        if self.stop_phrases.iter().any(|p| *p == folded) {
            confidence -= STOP_PHRASE_PENALTY;
        }

        PatternMatch {
            pattern,
            series_name: name,
            volume,
            base: base.clamp(0, 100) as u8,
            confidence: confidence.clamp(0, 100) as u8,
        }
    }

    fn has_series_keyword<'a>(&self, subjects: impl IntoIterator<Item = &'a str>) -> bool {
        subjects.into_iter().any(|s| {
            let s = fold(s);
            self.series_keywords.iter().any(|k| s.contains(k.as_str()))
        })
    }

    fn is_known_franchise(&self, folded_name: &str) -> bool {
        self.franchises.iter().any(|f| f.folded == folded_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> SeriesDetector {
        SeriesDetector::new(&DetectorConfig::default())
    }

    fn detect(title: &str, subjects: &[&str]) -> Detection {
        detector().detect_title(title, subjects.iter().copied())
    }

    #[test]
    fn explicit_volume_marker_with_manga_subject() {
        let d = detect("One Piece, Vol. 42", &["manga", "shonen"]);
        assert_eq!(d.series_name.as_deref(), Some("One Piece"));
        assert_eq!(d.volume, Some(42));
        assert_eq!(d.confidence, 90);
    }

    #[test]
    fn full_volume_word_scores_highest() {
        let d = detect("The Wandering Inn, Volume 3", &[]);
        assert_eq!(d.series_name.as_deref(), Some("The Wandering Inn"));
        assert_eq!(d.volume, Some(3));
        assert_eq!(d.confidence, 90);
    }

    #[test]
    fn book_and_hash_markers() {
        let d = detect("Wings of Fire Book 5", &[]);
        assert_eq!(d.series_name.as_deref(), Some("Wings of Fire"));
        assert_eq!(d.volume, Some(5));
        assert_eq!(d.confidence, 90);

        let d = detect("Saga #7", &[]);
        assert_eq!(d.series_name.as_deref(), Some("Saga"));
        assert_eq!(d.volume, Some(7));
        assert_eq!(d.confidence, 85);
    }

    #[test]
    fn franchise_prefix_with_volume_title() {
        let d = detect("Harry Potter and the Chamber of Secrets", &["fantasy"]);
        assert_eq!(d.series_name.as_deref(), Some("Harry Potter"));
        assert_eq!(d.volume, Some(2));
        assert_eq!(d.confidence, 85);
    }

    #[test]
    fn franchise_prefix_keeps_display_accents() {
        let d = detect("Astérix: Mission Cléopâtre", &[]);
        assert_eq!(d.series_name.as_deref(), Some("Astérix"));
        assert_eq!(d.volume, None);
        assert_eq!(d.confidence, 85);

        let d = detect("Asterix chez les Bretons", &[]);
        assert_eq!(d.series_name.as_deref(), Some("Asterix"));
    }

    #[test]
    fn punctuation_and_trailing_numbers() {
        let d = detect("Dune Chronicles: 2", &[]);
        assert_eq!(d.volume, Some(2));
        assert_eq!(d.confidence, 80);

        let d = detect("Shadow Academy - 4", &[]);
        assert_eq!(d.series_name.as_deref(), Some("Shadow Academy"));
        assert_eq!(d.confidence, 75);

        let d = detect("Warrior Cats 3", &[]);
        assert_eq!(d.series_name.as_deref(), Some("Warrior Cats"));
        assert_eq!(d.confidence, 65);

        let d = detect("Rocky III", &[]);
        assert_eq!(d.volume, Some(3));
        assert_eq!(d.confidence, 60);
    }

    #[test]
    fn localized_markers() {
        let d = detect("Les Légendaires Tome 12", &[]);
        assert_eq!(d.series_name.as_deref(), Some("Les Légendaires"));
        assert_eq!(d.volume, Some(12));
        assert_eq!(d.confidence, 80);

        let d = detect("Perry Rhodan Band 7", &[]);
        assert_eq!(d.volume, Some(7));

        let d = detect("Detective Conan — Tome 3", &[]);
        assert_eq!(d.confidence, 85);
    }

    #[test]
    fn four_digit_numbers_are_not_volumes() {
        assert_eq!(detect("Nineteen Eighty-Four", &[]), Detection::none());
        assert!(!detect("Paris 1944", &[]).is_series());
    }

    #[test]
    fn no_match_returns_none() {
        let d = detect("The Old Man and the Sea", &[]);
        assert_eq!(d, Detection::none());
    }

    #[test]
    fn short_name_and_stop_phrase_penalties() {
        let d = detect("X-Men, Vol. 2", &[]);
        assert_eq!(d.series_name.as_deref(), Some("X-Men"));
        assert_eq!(d.confidence, 85);

        let d = detect("Ace Vol. 2", &[]);
        assert_eq!(d.series_name.as_deref(), Some("Ace"));
        assert_eq!(d.confidence, 75);

        let d = detect("Cookbook, Volume 2", &[]);
        assert_eq!(d.confidence, 75);
    }

    #[test]
    fn series_keyword_subject_bonus() {
        let plain = detect("Shadow Academy Part 2", &[]);
        let boosted = detect("Shadow Academy Part 2", &["Fantasy saga"]);
        assert_eq!(boosted.confidence, plain.confidence + 5);
    }

    #[test]
    fn ties_prefer_earlier_pattern() {
        // "localized" and "franchise" both reach 85; the regex battery comes first.
        let d = detect("Astérix Tome 3", &[]);
        assert_eq!(d.volume, Some(3));
        assert_eq!(d.confidence, 85);
    }

    #[test]
    fn roman_numerals() {
        assert_eq!(roman_value("IV"), Some(4));
        assert_eq!(roman_value("XIX"), Some(19));
        assert_eq!(roman_value("XX"), Some(20));
        assert_eq!(roman_value("Q"), None);
    }
}
