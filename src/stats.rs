//! Pipeline status overview.
//!
//! Gives a quick read on pipeline health: filing counts per status, chunk
//! corpus size, recent event activity, and the most recent failures. Used
//! by `gravity status` to confirm ingestion and indexing are keeping up.

use anyhow::Result;

use crate::orchestrator::Orchestrator;

/// Run the status command: query the stores and print a summary.
pub async fn run_status(orchestrator: &Orchestrator, window_minutes: i64) -> Result<()> {
    let state_store = orchestrator.state_store();

    let status_counts = state_store.count_filings_by_status().await?;
    let total_filings: i64 = status_counts.values().sum();
    let chunk_count = orchestrator.rag().count_chunks().await?;
    let recent_events = state_store.count_recent_events(window_minutes).await?;
    let failures = state_store.list_recent_failures(10).await?;

    println!("Gravity — Pipeline Status");
    println!("=========================");
    println!();
    println!("  Filings:     {}", total_filings);
    for status in ["INGESTED", "ANALYZED", "ANALYZED_NOT_INDEXED", "DEAD_LETTER"] {
        if let Some(count) = status_counts.get(status) {
            println!("    {:<22} {}", status, count);
        }
    }
    println!("  Chunks:      {}", chunk_count);

    if !recent_events.is_empty() {
        println!();
        println!("  Events (last {} min):", window_minutes);
        let mut topics: Vec<_> = recent_events.iter().collect();
        topics.sort_by(|a, b| a.0.cmp(b.0));
        for (topic, count) in topics {
            println!("    {:<22} {}", topic, count);
        }
    }

    if !failures.is_empty() {
        println!();
        println!("  Recent failures:");
        println!(
            "  {:<28} {:<8} {:<22} {}",
            "ACCESSION", "TICKER", "STATUS", "REASON"
        );
        println!("  {}", "-".repeat(76));
        for filing in &failures {
            let reason = if filing.dead_letter_reason.is_empty() {
                filing.last_error.as_str()
            } else {
                filing.dead_letter_reason.as_str()
            };
            println!(
                "  {:<28} {:<8} {:<22} {}",
                filing.accession_number, filing.ticker, filing.status, reason
            );
        }
    }

    println!();
    Ok(())
}
