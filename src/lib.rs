//! # Series Harvester
//!
//! A resumable bulk book harvester and series detector for the Open Library
//! catalog.
//!
//! The harvester runs planned query strategies against the catalog, detects
//! series membership from each book title, records every analysed book in a
//! SQLite ledger (so nothing is analysed twice across sessions), and merges
//! validated series into a canonical JSON file that other tools consume.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ Planner  │──▶│ Catalog  │──▶│ Detector │──▶│  Ledger  │
//! │ (queries)│   │ (HTTP)   │   │ (titles) │   │ (SQLite) │
//! └──────────┘   └──────────┘   └──────────┘   └────┬─────┘
//!                                                   │
//!     ┌──────────┐   ┌───────────┐   ┌────────────┐ │
//!     │  Merger  │◀──│ Validator │◀──│ Aggregator │◀┘
//!     │ (JSON)   │   │  (tiers)  │   │  (groups)  │
//!     └──────────┘   └───────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                           # create the ledger
//! harvest run --max-books 5000           # bounded session
//! harvest run                            # resume where it stopped
//! harvest merge --tier strict --dry-run  # preview a stricter merge
//! harvest stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment overrides |
//! | [`error`] | Error kinds |
//! | [`models`] | Core data types |
//! | [`normalize`] | Case/diacritic folding and content hashing |
//! | [`catalog`] | Catalog trait and Open Library client |
//! | [`db`] | Database connection |
//! | [`migrate`] | Ledger schema |
//! | [`ledger`] | Dedup ledger of analysed books |
//! | [`planner`] | Query strategies |
//! | [`detector`] | Title pattern battery |
//! | [`aggregator`] | Grouping of detections into candidates |
//! | [`validator`] | Acceptance tiers and entry synthesis |
//! | [`merger`] | Canonical file merge |
//! | [`checkpoint`] | Resumable session position |
//! | [`progress`] | Progress reporting |
//! | [`harvest`] | Session orchestration |
//! | [`report`] | Session reports |
//! | [`stats`] | Ledger statistics |

pub mod aggregator;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod detector;
pub mod error;
pub mod harvest;
pub mod ledger;
pub mod merger;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod planner;
pub mod progress;
pub mod report;
pub mod stats;
pub mod validator;
