use anyhow::Result;
use colored::*;

use mory::core::config::Config;

use super::{open_store, print_json};

pub fn run(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let stats = store.semantic_stats()?;

    if json {
        return print_json(&stats);
    }

    println!("{}", "Memory Store".bold());
    println!("{}", "=".repeat(40));
    println!("  Backend:    {}", stats.storage_type.to_string().cyan());
    println!("  Memories:   {}", stats.total_memories);
    println!(
        "  Embedded:   {} ({:.0}%)",
        stats.memories_with_embeddings,
        stats.embedding_coverage * 100.0
    );

    match &stats.semantic {
        Some(semantic) => {
            let state = if semantic.enabled { "enabled".green() } else { "disabled".yellow() };
            println!();
            println!("{}", "Semantic Search".bold());
            println!("  State:      {}", state);
            println!("  Model:      {}", semantic.model);
            println!("  Weight:     {:.2}", semantic.hybrid_weight);
            println!("  Threshold:  {:.2}", semantic.similarity_threshold);
            println!("  Vectors:    {}", semantic.vector_count);
            println!("  Cached:     {}", semantic.cached_embeddings);
        }
        None => {
            println!();
            println!("{}", "Semantic search not configured".dimmed());
        }
    }
    Ok(())
}
