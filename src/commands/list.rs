use anyhow::Result;
use colored::*;

use mory::core::config::Config;

use super::{entry_line, open_store, print_json};

pub fn run(config: &Config, category: Option<&str>, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let entries = store.list(category.unwrap_or(""))?;

    if json {
        return print_json(&entries);
    }

    match category {
        Some(c) => println!("{} {}", "Memories in".bold(), c.cyan()),
        None => println!("{}", "Memories".bold()),
    }
    println!("{}", "=".repeat(60));

    if entries.is_empty() {
        println!("{}", "No memories stored.".yellow());
        return Ok(());
    }

    for entry in &entries {
        println!("{}", entry_line(entry, 56));
    }
    println!();
    println!("{} total", entries.len());

    Ok(())
}
