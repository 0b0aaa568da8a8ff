//! Canonical series file merge.
//!
//! The canonical file is a JSON array of series objects. Existing objects
//! are kept as opaque [`serde_json::Value`]s so fields this crate does not
//! know about survive a merge untouched. New entries are appended; an entry
//! whose case-folded name is already present (or was already appended in
//! the same merge) becomes a [`DuplicateEvent`] instead.
//!
//! Write sequence:
//!
//! 1. Take an exclusive lock on `<canonical>.lock`.
//! 2. Copy the current file to `backup_YYYYMMDD_HHMMSS.json`.
//! 3. Write the new array to a temp file in the same directory and rename
//!    it over the canonical path.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{HarvestError, Result};
use crate::models::CanonicalEntry;
use crate::normalize::normalize_key;

/// A proposed entry that was not merged because its name already exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateEvent {
    pub name: String,
    /// Name of the entry it collided with, as written in the file.
    pub existing_name: String,
    pub confidence: u8,
    /// The collision was with another entry of the same merge.
    pub within_batch: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MergeOutcome {
    pub canonical_path: PathBuf,
    pub added: Vec<String>,
    pub duplicates: Vec<DuplicateEvent>,
    pub backup_path: Option<PathBuf>,
    /// Entries in the canonical file after the merge.
    pub total_entries: usize,
    pub dry_run: bool,
}

pub struct Merger {
    canonical_path: PathBuf,
}

impl Merger {
    pub fn new(canonical_path: impl Into<PathBuf>) -> Self {
        Self {
            canonical_path: canonical_path.into(),
        }
    }

    pub fn canonical_path(&self) -> &Path {
        &self.canonical_path
    }

    /// Merge `entries` into the canonical file. With `dry_run` the file is
    /// read and duplicates are computed, but nothing is locked or written.
    pub fn merge(&self, entries: Vec<CanonicalEntry>, dry_run: bool) -> Result<MergeOutcome> {
        let dir = parent_dir(&self.canonical_path);
        let _lock = if dry_run {
            None
        } else {
            std::fs::create_dir_all(dir).map_err(|source| HarvestError::CanonicalWrite {
                path: self.canonical_path.clone(),
                backup: None,
                source,
            })?;
            Some(MergeLock::acquire(&self.canonical_path)?)
        };

        let existed = self.canonical_path.exists();
        let mut current = self.read_existing()?;

        let mut names: HashMap<String, (String, bool)> = current
            .iter()
            .filter_map(|v| v.get("name").and_then(Value::as_str))
            .map(|name| (normalize_key(name), (name.to_string(), false)))
            .collect();

        let mut outcome = MergeOutcome {
            canonical_path: self.canonical_path.clone(),
            dry_run,
            ..MergeOutcome::default()
        };
        let mut fresh: Vec<CanonicalEntry> = Vec::new();

        for entry in entries {
            let key = normalize_key(&entry.name);
            if let Some((existing_name, within_batch)) = names.get(&key) {
                tracing::info!(
                    "duplicate series '{}' (already present as '{}')",
                    entry.name,
                    existing_name
                );
                outcome.duplicates.push(DuplicateEvent {
                    name: entry.name.clone(),
                    existing_name: existing_name.clone(),
                    confidence: entry.confidence,
                    within_batch: *within_batch,
                });
                continue;
            }
            names.insert(key, (entry.name.clone(), true));
            outcome.added.push(entry.name.clone());
            fresh.push(entry);
        }

        outcome.total_entries = current.len() + fresh.len();
        if dry_run {
            return Ok(outcome);
        }

        if existed {
            let backup = backup_path(dir);
            std::fs::copy(&self.canonical_path, &backup).map_err(|source| {
                HarvestError::CanonicalWrite {
                    path: self.canonical_path.clone(),
                    backup: None,
                    source,
                }
            })?;
            tracing::info!("backed up canonical file to {}", backup.display());
            outcome.backup_path = Some(backup);
        }

        if fresh.is_empty() {
            return Ok(outcome);
        }

        for entry in &fresh {
            current.push(serde_json::to_value(entry)?);
        }
        self.write_atomic(&current, outcome.backup_path.clone())?;
        Ok(outcome)
    }

    fn read_existing(&self) -> Result<Vec<Value>> {
        let read_err = |message: String| HarvestError::CanonicalRead {
            path: self.canonical_path.clone(),
            message,
        };

        let content = match std::fs::read_to_string(&self.canonical_path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_err(e.to_string())),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Array(items)) => Ok(items),
            Ok(_) => Err(read_err("expected a JSON array of series".to_string())),
            Err(e) => Err(read_err(e.to_string())),
        }
    }

    fn write_atomic(&self, items: &[Value], backup: Option<PathBuf>) -> Result<()> {
        let wrap = |source: std::io::Error| HarvestError::CanonicalWrite {
            path: self.canonical_path.clone(),
            backup: backup.clone(),
            source,
        };

        let mut json = serde_json::to_string_pretty(items)?;
        json.push('\n');

        let mut tmp = NamedTempFile::new_in(parent_dir(&self.canonical_path)).map_err(wrap)?;
        tmp.write_all(json.as_bytes()).map_err(wrap)?;
        tmp.as_file().sync_all().map_err(wrap)?;
        tmp.persist(&self.canonical_path).map_err(|e| wrap(e.error))?;
        Ok(())
    }
}

/// Exclusive advisory lock held for the duration of a merge.
struct MergeLock {
    file: File,
}

impl MergeLock {
    fn acquire(canonical: &Path) -> Result<Self> {
        let mut name = canonical.as_os_str().to_owned();
        name.push(".lock");
        let path = PathBuf::from(name);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        match fs2::FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Self { file }),
            Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(HarvestError::MergeLocked(canonical.to_path_buf()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for MergeLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// `backup_YYYYMMDD_HHMMSS.json`, with `_N` appended if that name is taken.
fn backup_path(dir: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let first = dir.join(format!("backup_{}.json", stamp));
    if !first.exists() {
        return first;
    }
    (1u32..)
        .map(|n| dir.join(format!("backup_{}_{}.json", stamp, n)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;
    use tempfile::TempDir;

    fn entry(name: &str, confidence: u8) -> CanonicalEntry {
        CanonicalEntry {
            name: name.to_string(),
            authors: vec!["Someone".to_string()],
            category: Category::Novel,
            volumes: 3,
            keywords: vec!["someone".to_string()],
            title_variations: vec![],
            exclusions: vec![],
            source: "harvest:authors".to_string(),
            confidence,
            first_detected_at: Utc::now(),
        }
    }

    fn backups(dir: &Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("backup_"))
            })
            .collect();
        out.sort();
        out
    }

    #[test]
    fn first_merge_creates_file_without_backup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        let outcome = Merger::new(&path)
            .merge(vec![entry("Harry Potter", 85)], false)
            .unwrap();

        assert_eq!(outcome.added, vec!["Harry Potter"]);
        assert!(outcome.backup_path.is_none());
        let written: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0]["category"], "novel");
    }

    #[test]
    fn duplicate_name_is_never_merged() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        let original = "[\n  {\n    \"name\": \"Harry Potter\",\n    \"authors\": [\"J. K. Rowling\"]\n  }\n]\n";
        std::fs::write(&path, original).unwrap();

        let outcome = Merger::new(&path)
            .merge(vec![entry("harry  potter", 100)], false)
            .unwrap();

        assert!(outcome.added.is_empty());
        assert_eq!(outcome.duplicates.len(), 1);
        assert_eq!(outcome.duplicates[0].existing_name, "Harry Potter");
        assert!(!outcome.duplicates[0].within_batch);
        // Canonical file untouched, backup still written.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
        let backup = outcome.backup_path.unwrap();
        assert_eq!(std::fs::read_to_string(backup).unwrap(), original);
    }

    #[test]
    fn backup_is_verbatim_previous_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        let original = "[{\"name\":\"Discworld\",\"authors\":[\"Terry Pratchett\"]}]";
        std::fs::write(&path, original).unwrap();

        let outcome = Merger::new(&path)
            .merge(vec![entry("Dune", 90)], false)
            .unwrap();
        let backup = outcome.backup_path.unwrap();
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), original);
        assert!(backup
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("backup_"));
    }

    #[test]
    fn unknown_fields_and_order_survive() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        std::fs::write(
            &path,
            r#"[{"name":"Zeta","authors":["Z"],"legacy_id":17,"notes":{"x":true}},{"name":"Alpha","authors":["A"]}]"#,
        )
        .unwrap();

        Merger::new(&path).merge(vec![entry("Beta", 90)], false).unwrap();

        let written: Vec<Value> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let names: Vec<&str> = written.iter().map(|v| v["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Zeta", "Alpha", "Beta"]);
        assert_eq!(written[0]["legacy_id"], 17);
        assert_eq!(written[0]["notes"]["x"], true);
        assert!(written[2].get("legacy_id").is_none());
    }

    #[test]
    fn names_stay_unique_within_one_merge() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        let outcome = Merger::new(&path)
            .merge(vec![entry("One Piece", 90), entry("ONE PIECE", 80)], false)
            .unwrap();
        assert_eq!(outcome.added, vec!["One Piece"]);
        assert_eq!(outcome.duplicates.len(), 1);
        assert!(outcome.duplicates[0].within_batch);
    }

    #[test]
    fn backups_do_not_collide() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        std::fs::write(&path, "[]").unwrap();
        let merger = Merger::new(&path);
        merger.merge(vec![entry("A Saga", 90)], false).unwrap();
        merger.merge(vec![entry("B Saga", 90)], false).unwrap();
        assert_eq!(backups(tmp.path()).len(), 2);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        let outcome = Merger::new(&path)
            .merge(vec![entry("Dune", 90)], true)
            .unwrap();
        assert_eq!(outcome.added, vec!["Dune"]);
        assert!(outcome.dry_run);
        assert!(!path.exists());
        assert!(backups(tmp.path()).is_empty());
    }

    #[test]
    fn concurrent_merge_is_refused() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        let held = MergeLock::acquire(&path).unwrap();

        let err = Merger::new(&path)
            .merge(vec![entry("Dune", 90)], false)
            .unwrap_err();
        assert_eq!(err.kind(), "MergeLocked");

        drop(held);
        assert!(Merger::new(&path).merge(vec![entry("Dune", 90)], false).is_ok());
    }

    #[test]
    fn non_array_canonical_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("series.json");
        std::fs::write(&path, "{\"name\":\"x\"}").unwrap();
        let err = Merger::new(&path).merge(vec![], false).unwrap_err();
        assert_eq!(err.kind(), "CanonicalReadError");
    }

    #[test]
    fn unwritable_directory_is_a_canonical_write_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, "not a directory").unwrap();
        let err = Merger::new(blocker.join("series.json"))
            .merge(vec![entry("Saga", 90)], false)
            .unwrap_err();
        assert_eq!(err.kind(), "CanonicalWriteError");
        assert!(err.is_fatal());
        assert!(err.backup_path().is_none());
    }
}
