//! Ledger statistics and harvest overview.
//!
//! Provides a quick summary of what has been harvested: analysed books,
//! detection rate, per-strategy breakdowns, the most frequent series and the
//! checkpoint position. Used by `harvest stats`.

use anyhow::Result;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::ledger::Ledger;

/// Run the stats command: query the ledger and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let ledger = Ledger::open(&config.paths.ledger).await?;

    let total = ledger.count().await?;
    let strategies = ledger.strategy_counts().await?;
    let with_series: u64 = strategies.iter().map(|s| s.with_series).sum();
    let top = ledger.series_counts(10).await?;
    ledger.close().await;

    let ledger_size = std::fs::metadata(&config.paths.ledger)
        .map(|m| m.len())
        .unwrap_or(0);
    let canonical_entries = std::fs::read_to_string(&config.paths.canonical)
        .ok()
        .and_then(|s| serde_json::from_str::<Vec<serde_json::Value>>(&s).ok())
        .map(|v| v.len());

    println!("Series Harvester: Ledger Stats");
    println!("===============================");
    println!();
    println!("  Ledger:      {}", config.paths.ledger.display());
    println!("  Size:        {}", format_bytes(ledger_size));
    println!();
    println!("  Analysed:    {}", total);
    println!(
        "  With series: {} ({}%)",
        with_series,
        if total > 0 { (with_series * 100) / total } else { 0 }
    );
    match canonical_entries {
        Some(n) => println!("  Canonical:   {} entries in {}", n, config.paths.canonical.display()),
        None => println!("  Canonical:   not created yet"),
    }
    match Checkpoint::load(&config.paths.checkpoint) {
        Some(cp) if cp.completed => println!(
            "  Checkpoint:  plan completed for [{}]",
            cp.strategies.join(", ")
        ),
        Some(cp) => println!(
            "  Checkpoint:  {} query {} offset {}",
            cp.strategy_tag, cp.query_index, cp.offset
        ),
        None => println!("  Checkpoint:  none"),
    }

    if !strategies.is_empty() {
        println!();
        println!("  By strategy:");
        println!("  {:<16} {:>10} {:>10}", "STRATEGY", "ANALYSED", "SERIES");
        println!("  {}", "-".repeat(38));
        for s in &strategies {
            println!("  {:<16} {:>10} {:>10}", s.strategy_tag, s.analysed, s.with_series);
        }
    }

    if !top.is_empty() {
        println!();
        println!("  Top series:");
        for (name, books) in &top {
            println!("  {:>6}  {}", books, name);
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
