use anyhow::Result;
use colored::*;

use mory::core::config::Config;
use mory::core::entry::SearchQuery;

use super::{entry_line, open_store, print_json};

pub fn run(config: &Config, query: &str, category: Option<String>, limit: Option<usize>, min_score: f64, json: bool) -> Result<()> {
    let store = open_store(config)?;

    let mut search = SearchQuery::new(query).with_min_score(min_score);
    if let Some(category) = category {
        search = search.in_category(category);
    }
    if let Some(limit) = limit {
        search = search.with_limit(limit);
    }

    let results = store.search(&search)?;

    if json {
        return print_json(&results);
    }

    let mode = match store.semantic_engine() {
        Some(engine) if engine.is_enabled() => "hybrid",
        _ => "keyword",
    };

    println!("{}", "Search Results".bold());
    println!("{}", "=".repeat(60));
    println!("Query: \"{}\" ({})", query, mode);
    println!("Found: {} matches", results.len());
    println!();

    if results.is_empty() {
        println!("{}", "No matches found.".yellow());
        return Ok(());
    }

    for result in &results {
        println!("{}  {}", format!("{:.2}", result.score).green(), entry_line(&result.entry, 50));
    }

    Ok(())
}
