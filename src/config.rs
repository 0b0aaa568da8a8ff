//! Configuration loading.
//!
//! Settings come from a TOML file (every key optional) and are then
//! overridden by a small set of environment variables:
//!
//! | Variable | Setting |
//! |----------|---------|
//! | `OPENLIBRARY_BASE_URL` | `catalog.base_url` |
//! | `HARVEST_RATE_LIMIT` | `catalog.rate_limit` (requests per second) |
//! | `HARVEST_CONCURRENCY` | `catalog.concurrency` (simultaneous requests) |

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::validator::Tier;

pub const ENV_BASE_URL: &str = "OPENLIBRARY_BASE_URL";
pub const ENV_RATE_LIMIT: &str = "HARVEST_RATE_LIMIT";
pub const ENV_CONCURRENCY: &str = "HARVEST_CONCURRENCY";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub catalog: CatalogConfig,
    pub session: SessionConfig,
    pub planner: PlannerConfig,
    pub detector: DetectorConfig,
    pub validator: ValidatorConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PathsConfig {
    pub ledger: PathBuf,
    pub canonical: PathBuf,
    pub checkpoint: PathBuf,
    pub reports: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self::under(Path::new("./data"))
    }
}

impl PathsConfig {
    /// Standard layout rooted at `dir`.
    pub fn under(dir: &Path) -> Self {
        Self {
            ledger: dir.join("ledger.sqlite"),
            canonical: dir.join("series.json"),
            checkpoint: dir.join("checkpoint.json"),
            reports: dir.join("reports"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CatalogConfig {
    pub base_url: String,
    /// Requests per second, shared by all in-flight calls.
    pub rate_limit: u32,
    /// Simultaneous outstanding requests.
    pub concurrency: usize,
    pub page_size: u32,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub user_agent: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openlibrary.org".to_string(),
            rate_limit: 5,
            concurrency: 3,
            page_size: 100,
            timeout_secs: 30,
            max_attempts: 5,
            retry_base_ms: 1000,
            user_agent: format!("series-harvester/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub max_books: Option<u64>,
    pub max_minutes: Option<u64>,
    pub max_api_calls: Option<u64>,
    pub per_strategy_book_budget: u64,
    pub progress_every: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_books: None,
            max_minutes: None,
            max_api_calls: None,
            per_strategy_book_budget: 5_000,
            progress_every: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PlannerConfig {
    /// When set, queries within each strategy are shuffled with this seed.
    pub seed: Option<u64>,
    pub authors: Vec<String>,
    pub subjects: Vec<String>,
    pub publishers: Vec<String>,
    pub year_from: i32,
    pub year_to: i32,
    pub volume_probes: Vec<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            seed: None,
            authors: strings(&[
                "Terry Pratchett",
                "Brandon Sanderson",
                "Robert Jordan",
                "J. K. Rowling",
                "Rick Riordan",
                "Stephen King",
                "Agatha Christie",
                "Georges Simenon",
                "Jim Butcher",
                "Erin Hunter",
                "Ann M. Martin",
                "R. L. Stine",
                "Eiichiro Oda",
                "Masashi Kishimoto",
                "Akira Toriyama",
                "Rumiko Takahashi",
                "Naoko Takeuchi",
                "René Goscinny",
                "Hergé",
                "Jean Van Hamme",
            ]),
            subjects: strings(&[
                "fantasy",
                "science fiction",
                "manga",
                "graphic novels",
                "comic books, strips",
                "bandes dessinées",
                "mystery and detective stories",
                "young adult fiction",
            ]),
            publishers: strings(&[
                "Glénat",
                "Dargaud",
                "Dupuis",
                "Casterman",
                "Kana",
                "Viz Media",
                "Kodansha",
                "Tor Books",
                "Del Rey",
                "Scholastic",
            ]),
            year_from: 2015,
            year_to: 2024,
            volume_probes: strings(&["vol", "volume", "tome", "band", "tomo", "book 1", "part 1"]),
        }
    }
}

/// A well-known franchise, optionally with its volume titles in order.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Franchise {
    pub name: String,
    #[serde(default)]
    pub volumes: Vec<String>,
}

impl Franchise {
    fn new(name: &str, volumes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            volumes: strings(volumes),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectorConfig {
    pub franchises: Vec<Franchise>,
    /// Subjects that raise confidence when present.
    pub series_keywords: Vec<String>,
    /// Names that are never a series on their own.
    pub stop_phrases: Vec<String>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            franchises: vec![
                Franchise::new(
                    "Harry Potter",
                    &[
                        "Philosopher's Stone",
                        "Chamber of Secrets",
                        "Prisoner of Azkaban",
                        "Goblet of Fire",
                        "Order of the Phoenix",
                        "Half-Blood Prince",
                        "Deathly Hallows",
                    ],
                ),
                Franchise::new(
                    "Percy Jackson",
                    &[
                        "Lightning Thief",
                        "Sea of Monsters",
                        "Titan's Curse",
                        "Battle of the Labyrinth",
                        "Last Olympian",
                    ],
                ),
                Franchise::new("Astérix", &[]),
                Franchise::new("Tintin", &[]),
                Franchise::new("Lucky Luke", &[]),
                Franchise::new("Blake et Mortimer", &[]),
                Franchise::new("Spirou et Fantasio", &[]),
                Franchise::new("Star Wars", &[]),
                Franchise::new("Discworld", &[]),
            ],
            series_keywords: strings(&["manga", "saga", "chronicles", "cycle"]),
            stop_phrases: strings(&[
                "student edition",
                "teacher edition",
                "textbook",
                "cookbook",
                "anthology",
                "omnibus",
                "complete",
            ]),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ValidatorConfig {
    pub tier: Tier,
    pub manga_indicators: Vec<String>,
    pub comic_indicators: Vec<String>,
    /// Tokens never used as keywords.
    pub stop_words: Vec<String>,
    /// Tokens that disqualify a title from matching a series.
    pub exclusions: Vec<String>,
    pub max_keywords: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            tier: Tier::Permissive,
            manga_indicators: strings(&[
                "manga",
                "shonen",
                "shojo",
                "shoujo",
                "seinen",
                "josei",
                "one piece",
                "naruto",
                "dragon ball",
                "bleach",
                "death note",
                "attack on titan",
                "fullmetal alchemist",
                "sailor moon",
                "my hero academia",
            ]),
            comic_indicators: strings(&[
                "bande dessinée",
                "bandes dessinées",
                "comic",
                "graphic novel",
                "astérix",
                "tintin",
                "lucky luke",
                "spirou",
                "blake et mortimer",
                "largo winch",
                "thorgal",
            ]),
            stop_words: strings(&[
                "volume", "tome", "book", "part", "chapter", "vol", "the", "and", "les", "des",
                "une", "for", "with", "from",
            ]),
            exclusions: strings(&[
                "anthology",
                "omnibus",
                "box set",
                "collection",
                "companion",
                "coloring book",
            ]),
            max_keywords: 12,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Config {
    /// Override settings from the environment variables listed in the
    /// module docs.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup(ENV_BASE_URL) {
            self.catalog.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(rate) = lookup(ENV_RATE_LIMIT) {
            self.catalog.rate_limit = rate
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer, got '{}'", ENV_RATE_LIMIT, rate))?;
        }
        if let Some(k) = lookup(ENV_CONCURRENCY) {
            self.catalog.concurrency = k
                .trim()
                .parse()
                .with_context(|| format!("{} must be a positive integer, got '{}'", ENV_CONCURRENCY, k))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.catalog.rate_limit == 0 {
            bail!("catalog.rate_limit must be >= 1");
        }
        if self.catalog.concurrency == 0 {
            bail!("catalog.concurrency must be >= 1");
        }
        if !(1..=1000).contains(&self.catalog.page_size) {
            bail!("catalog.page_size must be in [1, 1000]");
        }
        if self.catalog.max_attempts == 0 {
            bail!("catalog.max_attempts must be >= 1");
        }
        if self.catalog.timeout_secs == 0 {
            bail!("catalog.timeout_secs must be >= 1");
        }
        if self.planner.year_from > self.planner.year_to {
            bail!(
                "planner.year_from ({}) must not exceed planner.year_to ({})",
                self.planner.year_from,
                self.planner.year_to
            );
        }
        if self.session.progress_every == 0 {
            bail!("session.progress_every must be >= 1");
        }
        if self.validator.max_keywords == 0 {
            bail!("validator.max_keywords must be >= 1");
        }
        Ok(())
    }
}

/// Load configuration from `path`, apply environment overrides and validate.
///
/// A missing file is not an error: built-in defaults are used.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| "Failed to parse config file")?
    } else {
        Config::default()
    };

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.catalog.rate_limit, 5);
        assert_eq!(config.catalog.concurrency, 3);
        assert_eq!(config.catalog.page_size, 100);
        assert_eq!(config.catalog.timeout_secs, 30);
        assert_eq!(config.catalog.max_attempts, 5);
        assert_eq!(config.session.progress_every, 100);
        assert_eq!(config.validator.tier, Tier::Permissive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [catalog]
            rate_limit = 2

            [validator]
            tier = "strict"

            [[detector.franchises]]
            name = "Mistborn"
            volumes = ["The Final Empire", "The Well of Ascension"]
            "#,
        )
        .unwrap();
        assert_eq!(config.catalog.rate_limit, 2);
        assert_eq!(config.catalog.concurrency, 3);
        assert_eq!(config.validator.tier, Tier::Strict);
        assert_eq!(config.detector.franchises.len(), 1);
        assert_eq!(config.detector.franchises[0].volumes.len(), 2);
        assert_eq!(config.paths.ledger, PathBuf::from("./data/ledger.sqlite"));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            (ENV_BASE_URL, "http://127.0.0.1:9000/"),
            (ENV_RATE_LIMIT, "9"),
            (ENV_CONCURRENCY, "1"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.catalog.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.catalog.rate_limit, 9);
        assert_eq!(config.catalog.concurrency, 1);
    }

    #[test]
    fn invalid_env_override_is_an_error() {
        let mut config = Config::default();
        let result = config.apply_overrides(|k| (k == ENV_RATE_LIMIT).then(|| "fast".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = Config::default();
        config.catalog.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.catalog.page_size, 100);
    }
}
