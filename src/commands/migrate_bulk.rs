use std::path::PathBuf;

use anyhow::{bail, Result};
use colored::*;

use mory::core::config::Config;
use mory::core::paths::collect_json_files;
use mory::storage::migration::migrate_bulk;

use super::migrate::print_summary;
use super::print_json;

/// `inputs` may mix files, directories and glob patterns
pub fn run(config: &Config, inputs: &[String], to: Option<PathBuf>, json: bool) -> Result<()> {
    let files = collect_json_files(inputs)?;
    if files.is_empty() {
        bail!("no JSON files matched {:?}", inputs);
    }

    let target = to.unwrap_or_else(|| config.storage.sqlite_path.clone());

    if !json {
        println!("{}", "Bulk JSON to SQLite Migration".bold());
        println!("{}", "=".repeat(40));
        for file in &files {
            println!("  {}", file.display().to_string().dimmed());
        }
        println!("  -> {}", target.display());
        println!();
    }

    let result = migrate_bulk(&files, &target)?;

    if json {
        print_json(&result)?;
    } else {
        print_summary(&result);
    }

    result.ensure_complete()?;
    Ok(())
}
