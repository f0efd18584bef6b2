pub mod delete;
pub mod embed;
pub mod get;
pub mod list;
pub mod migrate;
pub mod migrate_bulk;
pub mod save;
pub mod search;
pub mod stats;

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::*;
use serde::Serialize;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use mory::core::config::Config;
use mory::core::entry::MemoryEntry;
use mory::storage::{attach_semantic_engine, create_store, MemoryStore};

/// Open the configured backend, attaching the semantic engine when enabled
pub fn open_store(config: &Config) -> Result<Arc<dyn MemoryStore>> {
    let store = create_store(&config.storage).context("failed to open memory store")?;
    if config.semantic.enabled {
        attach_semantic_engine(store.as_ref(), &config.semantic).context("failed to start semantic search")?;
    }
    Ok(store)
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print one entry as a block
pub fn print_entry(entry: &MemoryEntry) {
    let title = if entry.key.is_empty() { entry.id.as_str() } else { entry.key.as_str() };
    println!("{} [{}]", title.cyan().bold(), entry.category);
    println!("  {}", entry.value);
    if !entry.tags.is_empty() {
        println!("  {} {}", "tags:".dimmed(), entry.tags.join(", "));
    }
    println!(
        "  {} {}  {} {}",
        "id:".dimmed(),
        entry.id,
        "updated:".dimmed(),
        entry.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}

/// One-line summary, value cut to fit the terminal column budget
pub fn entry_line(entry: &MemoryEntry, value_width: usize) -> String {
    let key = if entry.key.is_empty() { "-" } else { entry.key.as_str() };
    format!(
        "{}  {}  {}",
        pad(&truncate(key, 20), 20).cyan(),
        pad(&truncate(&entry.category, 12), 12).dimmed(),
        truncate(&entry.value.replace('\n', " "), value_width)
    )
}

/// Cut `s` to at most `max` display columns (wide characters count as two)
pub fn truncate(s: &str, max: usize) -> String {
    if s.width() <= max {
        return s.to_string();
    }

    let budget = max.saturating_sub(3);
    let mut used = 0;
    let mut out = String::new();
    for c in s.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push_str("...");
    out
}

fn pad(s: &str, width: usize) -> String {
    let fill = width.saturating_sub(s.width());
    format!("{}{}", s, " ".repeat(fill))
}
