use anyhow::{Context, Result};

use mory::core::config::Config;

use super::{open_store, print_entry, print_json};

/// Look up by key, or by id when `by_id` is set
pub fn run(config: &Config, target: &str, by_id: bool, json: bool) -> Result<()> {
    let store = open_store(config)?;

    let entry = if by_id {
        store.get_by_id(target)
    } else {
        store.get(target)
    }
    .with_context(|| format!("failed to get '{}'", target))?;

    if json {
        print_json(&entry)
    } else {
        print_entry(&entry);
        Ok(())
    }
}
