use std::path::PathBuf;

use anyhow::Result;
use colored::*;

use mory::core::config::Config;
use mory::storage::migration::{MigrationOptions, MigrationResult, Migrator};

use super::print_json;

pub struct MigrateArgs {
    pub from: Option<PathBuf>,
    pub to: Option<PathBuf>,
    pub no_backup: bool,
    pub no_validate: bool,
    pub no_skip_existing: bool,
    pub reset_timestamps: bool,
    pub batch: usize,
}

pub fn run(config: &Config, args: MigrateArgs, json: bool) -> Result<()> {
    let mut options = MigrationOptions::new(
        args.from.unwrap_or_else(|| config.storage.json_path.clone()),
        args.to.unwrap_or_else(|| config.storage.sqlite_path.clone()),
    );
    options.backup_source = !args.no_backup;
    options.validate_after = !args.no_validate;
    options.skip_existing = !args.no_skip_existing;
    options.preserve_timestamps = !args.reset_timestamps;
    options.batch_size = args.batch;

    let migrator = Migrator::new(options);
    let options = migrator.options();

    if !json {
        println!("{}", "JSON to SQLite Migration".bold());
        println!("{}", "=".repeat(40));
        println!("  Source:     {}", options.json_file.display());
        println!("  Target:     {}", options.sqlite_path.display());
        println!("  Backup:     {}", options.backup_source);
        println!("  Validate:   {}", options.validate_after);
        println!("  Batch size: {}", options.batch_size);
        println!();
    }

    let result = migrator.migrate()?;

    if json {
        print_json(&result)?;
    } else {
        print_summary(&result);
    }

    result.ensure_complete()?;

    if !json {
        println!();
        println!("{} {}", "SQLite database is ready at".green(), options.sqlite_path.display());
    }
    Ok(())
}

pub fn print_summary(result: &MigrationResult) {
    let status = if result.ensure_complete().is_ok() {
        "Migration completed".green().bold()
    } else {
        "Migration finished with problems".yellow().bold()
    };
    println!("{}", status);
    println!("  Total:      {}", result.total);
    println!("  Migrated:   {}", result.migrated.to_string().green());
    println!("  Skipped:    {}", result.skipped);
    println!("  Failed:     {}", colored_count(result.failed));
    println!("  Duration:   {:?}", result.duration);

    match result.validation_passed {
        Some(true) => println!("  Validation: {}", "passed".green()),
        Some(false) => println!("  Validation: {}", "FAILED".red()),
        None => println!("  Validation: {}", "skipped".dimmed()),
    }

    if let Some(path) = &result.backup_path {
        println!("  Backup:     {}", path.display());
    }

    if !result.errors.is_empty() {
        println!();
        println!("{}", "Errors:".yellow());
        for error in &result.errors {
            println!("  - {}", error);
        }
    }
}

fn colored_count(n: usize) -> ColoredString {
    if n > 0 {
        n.to_string().red()
    } else {
        n.to_string().normal()
    }
}
