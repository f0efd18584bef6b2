use anyhow::Result;
use colored::*;
use serde_json::json;

use mory::core::config::Config;
use mory::core::entry::MemoryEntry;

use super::{open_store, print_json};

pub struct SaveArgs {
    pub category: String,
    pub value: String,
    pub key: Option<String>,
    pub tags: Vec<String>,
    pub id: Option<String>,
    /// Refresh the entry's embedding before saving
    pub embed: bool,
}

pub fn run(config: &Config, args: SaveArgs, json: bool) -> Result<()> {
    let store = open_store(config)?;

    let mut entry = MemoryEntry::new(args.category, args.key.unwrap_or_default(), args.value).with_tags(args.tags);
    if let Some(id) = args.id {
        entry = entry.with_id(id);
    }

    let existed = !entry.key.is_empty() && store.get(&entry.key).is_ok();
    let mut id = store.save(entry)?;

    if args.embed {
        if let Some(engine) = store.semantic_engine() {
            let mut saved = store.get_by_id(&id)?;
            if engine.generate_embedding(&mut saved)? {
                id = store.save(saved)?;
            }
        } else {
            eprintln!("{}", "Semantic search is disabled, skipping embedding".yellow());
        }
    }

    if json {
        return print_json(&json!({ "id": id, "updated": existed }));
    }

    let verb = if existed { "Updated" } else { "Saved" };
    println!("{} {}", verb.green(), id);
    Ok(())
}
