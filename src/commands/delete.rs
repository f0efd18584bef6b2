use anyhow::{Context, Result};
use colored::*;

use mory::core::config::Config;

use super::open_store;

pub fn run(config: &Config, target: &str, by_id: bool) -> Result<()> {
    let store = open_store(config)?;

    if by_id {
        store.delete_by_id(target)
    } else {
        store.delete(target)
    }
    .with_context(|| format!("failed to delete '{}'", target))?;

    println!("{} {}", "Deleted".green(), target);
    Ok(())
}
