//! Candidate aggregation.
//!
//! Groups analysis records with a detected series by
//! `(normalize(series_name), normalize(primary_author))`. Pure and
//! deterministic: groups come out ordered by key, and books within a group
//! ordered by volume then title.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::models::{AnalysisRecord, SeriesCandidate};
use crate::normalize::normalize_key;

pub fn aggregate<I>(records: I) -> Vec<SeriesCandidate>
where
    I: IntoIterator<Item = AnalysisRecord>,
{
    let mut groups: BTreeMap<(String, String), Vec<AnalysisRecord>> = BTreeMap::new();

    for record in records {
        let Some(series) = record.detected_series_name.as_deref() else {
            continue;
        };
        let key = (normalize_key(series), normalize_key(&record.primary_author));
        if key.0.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(record);
    }

    groups
        .into_iter()
        .map(|((normalized_name, normalized_author), books)| {
            build_candidate(normalized_name, normalized_author, books)
        })
        .collect()
}

fn build_candidate(
    normalized_name: String,
    normalized_author: String,
    mut books: Vec<AnalysisRecord>,
) -> SeriesCandidate {
    books.sort_by(|a, b| {
        a.volume_number
            .unwrap_or(u32::MAX)
            .cmp(&b.volume_number.unwrap_or(u32::MAX))
            .then_with(|| a.title.cmp(&b.title))
            .then_with(|| a.hash.cmp(&b.hash))
    });

    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for book in &books {
        if let Some(name) = book.detected_series_name.as_deref() {
            *name_counts.entry(name.trim()).or_default() += 1;
        }
    }
    let display_name = name_counts
        .iter()
        .max_by(|(a_name, a_n), (b_name, b_n)| a_n.cmp(b_n).then_with(|| b_name.cmp(a_name)))
        .map(|(name, _)| name.to_string())
        .unwrap_or_else(|| normalized_name.clone());

    let author = books
        .iter()
        .map(|b| b.primary_author.trim())
        .find(|a| !a.is_empty())
        .unwrap_or_default()
        .to_string();

    let volumes: BTreeSet<u32> = books.iter().filter_map(|b| b.volume_number).collect();
    let confidences = books.iter().map(|b| b.confidence).collect();
    let strategy_tags = books.iter().map(|b| b.strategy_tag.clone()).collect();
    let subjects = books.iter().flat_map(|b| b.subjects.iter().cloned()).collect();
    let languages = books.iter().filter_map(|b| b.language.clone()).collect();
    let years: Vec<i32> = books.iter().filter_map(|b| b.first_publish_year).collect();

    SeriesCandidate {
        normalized_name,
        normalized_author,
        display_name,
        author,
        volumes,
        confidences,
        strategy_tags,
        subjects,
        languages,
        earliest_year: years.iter().copied().min(),
        latest_year: years.iter().copied().max(),
        books,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(title: &str, author: &str, series: Option<&str>, volume: Option<u32>, conf: u8) -> AnalysisRecord {
        AnalysisRecord {
            hash: format!("{}-{}", title, author),
            remote_key: format!("/works/{}", title),
            title: title.to_string(),
            primary_author: author.to_string(),
            detected_series_name: series.map(str::to_string),
            volume_number: volume,
            confidence: conf,
            strategy_tag: "authors".to_string(),
            processing_ms: 1,
            analysis_timestamp: Utc::now(),
            subjects: vec!["fantasy".to_string()],
            language: Some("eng".to_string()),
            first_publish_year: volume.map(|v| 2000 + v as i32),
            publisher: None,
        }
    }

    #[test]
    fn groups_by_normalized_name_and_author() {
        let groups = aggregate(vec![
            record("Harry Potter 1", "J. K. Rowling", Some("Harry Potter"), Some(1), 70),
            record("harry potter 3", "j. k.  rowling", Some("harry  potter"), Some(3), 65),
            record("Harry Potter 2", "Someone Else", Some("Harry Potter"), Some(2), 65),
        ]);
        assert_eq!(groups.len(), 2);

        let rowling = groups
            .iter()
            .find(|g| g.normalized_author == "j. k. rowling")
            .unwrap();
        assert_eq!(rowling.book_count(), 2);
        assert_eq!(rowling.max_confidence(), 70);
        assert_eq!(rowling.max_volume(), Some(3));
        assert_eq!(rowling.earliest_year, Some(2001));
        assert_eq!(rowling.latest_year, Some(2003));
        assert_eq!(rowling.author, "J. K. Rowling");
    }

    #[test]
    fn unmatched_records_do_not_contribute() {
        let groups = aggregate(vec![
            record("The Old Man and the Sea", "Ernest Hemingway", None, None, 0),
            record("Dune Messiah 2", "Frank Herbert", Some("Dune Messiah"), Some(2), 65),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].display_name, "Dune Messiah");
    }

    #[test]
    fn display_name_is_most_frequent_spelling() {
        let groups = aggregate(vec![
            record("a", "Author", Some("the saga"), Some(1), 60),
            record("b", "Author", Some("The Saga"), Some(2), 60),
            record("c", "Author", Some("The Saga"), Some(3), 60),
        ]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].display_name, "The Saga");
        let volumes: Vec<u32> = groups[0].books.iter().filter_map(|b| b.volume_number).collect();
        assert_eq!(volumes, vec![1, 2, 3]);
    }

    #[test]
    fn output_is_ordered_by_key() {
        let groups = aggregate(vec![
            record("z", "A", Some("Zeta"), Some(1), 90),
            record("a", "A", Some("Alpha"), Some(1), 90),
        ]);
        let names: Vec<&str> = groups.iter().map(|g| g.normalized_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
