//! `waymark memory` - Memory inspection commands.

use super::{CliResult, runtime_for};

pub async fn stats(workspace: &str) -> CliResult {
    let (state, id) = runtime_for(workspace).await?;
    let stats = state.memory.stats(&id).await?;

    println!("🧠 Memory for '{workspace}'");
    println!("====================");
    println!("  Backend:          {}", state.memory.persistence_name());
    println!("  Episodic records: {}", stats.episodic_records);
    println!("  Semantic facts:   {}", stats.semantic_facts);
    println!(
        "  Workflows:        {} active, {} retired",
        stats.active_workflows, stats.retired_workflows
    );
    println!("  Next sequence:    {}", stats.next_sequence_no);
    println!("  Summarized to:    {}", stats.summarized_through);

    if state.memory.persistence_name() == "none" {
        println!("\n  ⚠️  memory.backend = \"none\": nothing survives a restart");
    }
    Ok(())
}

pub async fn search(workspace: &str, query: &str, limit: usize) -> CliResult {
    let (state, id) = runtime_for(workspace).await?;

    println!("🔍 Facts in '{workspace}' for: \"{query}\"\n");
    let facts = state.memory.query_semantic(&id, query, limit).await?;
    if facts.is_empty() {
        println!("  No facts found.");
        return Ok(());
    }
    for (i, fact) in facts.iter().enumerate() {
        println!(
            "  {}. [{:.2}] {} ({} source record(s))",
            i + 1,
            fact.confidence,
            fact.statement,
            fact.source_record_ids.len()
        );
        println!("     id: {}", fact.id);
    }
    Ok(())
}

pub async fn promote(workspace: &str) -> CliResult {
    let (state, id) = runtime_for(workspace).await?;
    let report = state.memory.promote(&id).await?;

    println!("⬆️  Promotion for '{workspace}' (through #{})", report.considered_through);
    println!("  Facts:     {} new, {} merged", report.facts_created, report.facts_merged);
    println!(
        "  Workflows: {} new, {} reinforced, {} demoted, {} retired",
        report.workflows_created,
        report.workflows_reinforced,
        report.workflows_demoted,
        report.workflows_retired
    );
    if report.summarization_failed {
        println!("  ⚠️  Summarizer unavailable; facts will be retried next pass");
    }
    Ok(())
}
