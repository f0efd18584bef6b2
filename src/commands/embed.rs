use anyhow::{bail, Result};
use colored::*;

use mory::core::config::Config;

use super::{open_store, print_json};

/// Generate embeddings for every entry whose text changed
pub fn run(config: &Config, json: bool) -> Result<()> {
    if !config.semantic.enabled {
        bail!("semantic search is disabled; set MORY_OPENAI_API_KEY or MORY_SEMANTIC_ENABLED=true");
    }

    let store = open_store(config)?;
    let report = store.generate_embeddings()?;

    if json {
        return print_json(&report);
    }

    println!("{}", "Embedding Generation".bold());
    println!("{}", "=".repeat(40));
    println!("  Processed: {}", report.processed);
    println!("  Generated: {}", report.generated.to_string().green());
    println!("  Unchanged: {}", report.unchanged);
    if report.failed > 0 {
        println!("  Failed:    {}", report.failed.to_string().red());
    }
    Ok(())
}
