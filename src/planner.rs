//! Query planning.
//!
//! Enumerates `(strategy, query)` pairs from the configured inputs. The
//! sequence is finite and deterministic: the same configuration (and seed)
//! always yields the same queries in the same order, which is what makes a
//! checkpoint meaningful across restarts.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fmt;
use std::str::FromStr;

use crate::checkpoint::Checkpoint;
use crate::config::{DetectorConfig, PlannerConfig};

/// A family of queries sharing an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Strategy {
    ProlificAuthors,
    Subjects,
    Publishers,
    YearWindows,
    VolumeProbes,
    FranchiseSeeds,
}

impl Strategy {
    /// Enumeration order.
    pub const ALL: [Strategy; 6] = [
        Strategy::ProlificAuthors,
        Strategy::Subjects,
        Strategy::Publishers,
        Strategy::YearWindows,
        Strategy::VolumeProbes,
        Strategy::FranchiseSeeds,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            Strategy::ProlificAuthors => "authors",
            Strategy::Subjects => "subjects",
            Strategy::Publishers => "publishers",
            Strategy::YearWindows => "years",
            Strategy::VolumeProbes => "volume_probes",
            Strategy::FranchiseSeeds => "franchises",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Strategy::ProlificAuthors => "curated list of prolific series authors",
            Strategy::Subjects => "genre and subject facets",
            Strategy::Publishers => "major series publishers",
            Strategy::YearWindows => "one-year windows of recent publications",
            Strategy::VolumeProbes => "title probes likely to return numbered volumes",
            Strategy::FranchiseSeeds => "known franchises used to pull adjacent works",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .iter()
            .copied()
            .find(|st| st.tag() == s.trim())
            .ok_or_else(|| {
                let known: Vec<&str> = Strategy::ALL.iter().map(|s| s.tag()).collect();
                format!("unknown strategy '{}'. Available: {}", s, known.join(", "))
            })
    }
}

/// One planned search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedQuery {
    pub strategy: Strategy,
    /// Position of this query within its strategy.
    pub index: usize,
    pub query: String,
}

impl PlannedQuery {
    pub fn tag(&self) -> &'static str {
        self.strategy.tag()
    }
}

pub struct QueryPlanner {
    planner: PlannerConfig,
    franchises: Vec<String>,
    strategies: Vec<Strategy>,
    seed: Option<u64>,
}

fn quoted(field: &str, value: &str) -> String {
    format!("{}:\"{}\"", field, value.replace('"', ""))
}

impl QueryPlanner {
    pub fn new(planner: &PlannerConfig, detector: &DetectorConfig) -> Self {
        Self {
            planner: planner.clone(),
            franchises: detector.franchises.iter().map(|f| f.name.clone()).collect(),
            strategies: Strategy::ALL.to_vec(),
            seed: planner.seed,
        }
    }

    /// Restrict enumeration to `subset`, keeping the canonical order.
    /// An empty subset keeps every strategy.
    pub fn with_strategies(mut self, subset: &[Strategy]) -> Self {
        if !subset.is_empty() {
            self.strategies = Strategy::ALL
                .iter()
                .copied()
                .filter(|s| subset.contains(s))
                .collect();
        }
        self
    }

    /// Override the shuffle seed (used when resuming a checkpointed run).
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Tags of the selected strategies, in planning order. Checkpoints
    /// record this to tell which selection they belong to.
    pub fn selection(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.tag().to_string()).collect()
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Query strings of one strategy, in enumeration order.
    pub fn queries_for(&self, strategy: Strategy) -> Vec<String> {
        let p = &self.planner;
        let mut queries: Vec<String> = match strategy {
            Strategy::ProlificAuthors => p.authors.iter().map(|a| quoted("author", a)).collect(),
            Strategy::Subjects => p.subjects.iter().map(|s| quoted("subject", s)).collect(),
            Strategy::Publishers => p.publishers.iter().map(|s| quoted("publisher", s)).collect(),
            Strategy::YearWindows => (p.year_from..=p.year_to)
                .rev()
                .map(|y| format!("first_publish_year:[{} TO {}]", y, y))
                .collect(),
            Strategy::VolumeProbes => p.volume_probes.iter().map(|t| quoted("title", t)).collect(),
            Strategy::FranchiseSeeds => self.franchises.iter().map(|t| quoted("title", t)).collect(),
        };

        if let Some(seed) = self.seed {
            // Mix the strategy in so each strategy gets its own permutation.
            let mut rng = StdRng::seed_from_u64(seed ^ (strategy as u64).wrapping_mul(0x9e37_79b9));
            queries.shuffle(&mut rng);
        }
        queries
    }

    /// Lazily enumerate every planned query.
    pub fn iter(&self) -> impl Iterator<Item = PlannedQuery> + '_ {
        self.strategies.iter().flat_map(move |&strategy| {
            self.queries_for(strategy)
                .into_iter()
                .enumerate()
                .map(move |(index, query)| PlannedQuery {
                    strategy,
                    index,
                    query,
                })
        })
    }

    /// Enumerate from the checkpoint position onwards.
    ///
    /// Strategies that come before the checkpointed one, and queries before
    /// its index, are skipped. A checkpoint naming a strategy that is no
    /// longer selected restarts from the first selected strategy after it
    /// in canonical order.
    pub fn resume_from<'a>(
        &'a self,
        checkpoint: &Checkpoint,
    ) -> Box<dyn Iterator<Item = PlannedQuery> + 'a> {
        if checkpoint.completed {
            return Box::new(std::iter::empty());
        }
        let Ok(resume_strategy) = checkpoint.strategy_tag.parse::<Strategy>() else {
            return Box::new(self.iter());
        };
        let resume_index = checkpoint.query_index;
        Box::new(self.iter().filter(move |q| {
            q.strategy > resume_strategy
                || (q.strategy == resume_strategy && q.index >= resume_index)
        }))
    }

    pub fn total_queries(&self) -> usize {
        self.strategies
            .iter()
            .map(|&s| self.queries_for(s).len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::Checkpoint;

    fn planner() -> QueryPlanner {
        QueryPlanner::new(&PlannerConfig::default(), &DetectorConfig::default())
    }

    #[test]
    fn enumerates_every_strategy_in_order() {
        let p = planner();
        let tags: Vec<&str> = p.iter().map(|q| q.tag()).collect();
        let mut seen = Vec::new();
        for t in tags {
            if seen.last() != Some(&t) {
                seen.push(t);
            }
        }
        assert_eq!(
            seen,
            vec!["authors", "subjects", "publishers", "years", "volume_probes", "franchises"]
        );
        assert_eq!(p.iter().count(), p.total_queries());
    }

    #[test]
    fn query_syntax() {
        let p = planner();
        let first = p.iter().next().unwrap();
        assert_eq!(first.query, "author:\"Terry Pratchett\"");
        let years = p.queries_for(Strategy::YearWindows);
        assert_eq!(years[0], "first_publish_year:[2024 TO 2024]");
        assert_eq!(years.len(), 10);
    }

    #[test]
    fn same_seed_same_order() {
        let a = planner().with_seed(Some(7));
        let b = planner().with_seed(Some(7));
        let qa: Vec<_> = a.iter().collect();
        let qb: Vec<_> = b.iter().collect();
        assert_eq!(qa, qb);

        let unseeded: Vec<_> = planner().iter().collect();
        assert_eq!(qa.len(), unseeded.len());
    }

    #[test]
    fn strategy_filter_keeps_canonical_order() {
        let p = planner().with_strategies(&[Strategy::FranchiseSeeds, Strategy::Subjects]);
        assert_eq!(p.strategies(), &[Strategy::Subjects, Strategy::FranchiseSeeds]);
        assert!(p.iter().all(|q| q.strategy != Strategy::ProlificAuthors));
        assert_eq!(p.selection(), vec!["subjects", "franchises"]);
    }

    #[test]
    fn resume_skips_completed_queries() {
        let p = planner();
        let checkpoint = Checkpoint {
            strategy_tag: "subjects".to_string(),
            query_index: 2,
            offset: 200,
            ..Checkpoint::default()
        };
        let first = p.resume_from(&checkpoint).next().unwrap();
        assert_eq!(first.strategy, Strategy::Subjects);
        assert_eq!(first.index, 2);
    }

    #[test]
    fn completed_checkpoint_yields_nothing() {
        let p = planner();
        let checkpoint = Checkpoint {
            completed: true,
            ..Checkpoint::default()
        };
        assert_eq!(p.resume_from(&checkpoint).count(), 0);
    }

    #[test]
    fn parse_strategy_tags() {
        assert_eq!("volume_probes".parse::<Strategy>().unwrap(), Strategy::VolumeProbes);
        assert!("everything".parse::<Strategy>().is_err());
    }
}
