mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use mory::core::config::Config;

#[derive(Parser)]
#[command(name = "mory")]
#[command(about = "Local memory store with keyword and semantic search", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(long, global = true, help = "YAML config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    // ===== Memories =====
    /// Save a memory (updates in place when the key exists)
    Save {
        category: String,
        value: String,
        #[arg(short, long, help = "Key to address the memory by")]
        key: Option<String>,
        #[arg(short, long, value_delimiter = ',', help = "Comma-separated tags")]
        tags: Vec<String>,
        #[arg(long, help = "Explicit id")]
        id: Option<String>,
        #[arg(long, help = "Generate the embedding right away")]
        embed: bool,
        #[arg(long, help = "JSON output")]
        json: bool,
    },
    Get {
        key: String,
        #[arg(long, help = "Treat the argument as an id")]
        id: bool,
        #[arg(long, help = "JSON output")]
        json: bool,
    },
    List {
        #[arg(short, long, help = "Only this category")]
        category: Option<String>,
        #[arg(long, help = "JSON output")]
        json: bool,
    },
    Search {
        query: String,
        #[arg(short, long, help = "Only this category")]
        category: Option<String>,
        #[arg(short, long, help = "Limit results")]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0.0, help = "Drop results scoring below this")]
        min_score: f64,
        #[arg(long, help = "JSON output")]
        json: bool,
    },
    Delete {
        key: String,
        #[arg(long, help = "Treat the argument as an id")]
        id: bool,
    },

    // ===== Semantic Search =====
    /// Generate embeddings for new or changed memories
    Embed {
        #[arg(long, help = "JSON output")]
        json: bool,
    },
    /// Storage and semantic index statistics
    Stats {
        #[arg(long, help = "JSON output")]
        json: bool,
    },

    // ===== Migration =====
    /// Migrate a JSON store into SQLite
    Migrate {
        #[arg(long, help = "Source JSON file (default: storage.json_path)")]
        from: Option<PathBuf>,
        #[arg(long, help = "Target SQLite database (default: storage.sqlite_path)")]
        to: Option<PathBuf>,
        #[arg(long, help = "Skip the source backup")]
        no_backup: bool,
        #[arg(long, help = "Skip post-migration validation")]
        no_validate: bool,
        #[arg(long, help = "Overwrite entries already in the target")]
        no_skip_existing: bool,
        #[arg(long, help = "Stamp migrated entries with the current time")]
        reset_timestamps: bool,
        #[arg(long, default_value_t = 1000, help = "Entries per batch")]
        batch: usize,
        #[arg(long, help = "JSON output")]
        json: bool,
    },
    /// Migrate several JSON files, directories or globs into one database
    #[command(name = "migrate-bulk")]
    MigrateBulk {
        #[arg(required = true)]
        inputs: Vec<String>,
        #[arg(long, help = "Target SQLite database (default: storage.sqlite_path)")]
        to: Option<PathBuf>,
        #[arg(long, help = "JSON output")]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        // Memories
        Commands::Save {
            category,
            value,
            key,
            tags,
            id,
            embed,
            json,
        } => commands::save::run(
            &config,
            commands::save::SaveArgs {
                category,
                value,
                key,
                tags,
                id,
                embed,
            },
            json,
        ),
        Commands::Get { key, id, json } => commands::get::run(&config, &key, id, json),
        Commands::List { category, json } => commands::list::run(&config, category.as_deref(), json),
        Commands::Search {
            query,
            category,
            limit,
            min_score,
            json,
        } => commands::search::run(&config, &query, category, limit, min_score, json),
        Commands::Delete { key, id } => commands::delete::run(&config, &key, id),

        // Semantic search
        Commands::Embed { json } => commands::embed::run(&config, json),
        Commands::Stats { json } => commands::stats::run(&config, json),

        // Migration
        Commands::Migrate {
            from,
            to,
            no_backup,
            no_validate,
            no_skip_existing,
            reset_timestamps,
            batch,
            json,
        } => commands::migrate::run(
            &config,
            commands::migrate::MigrateArgs {
                from,
                to,
                no_backup,
                no_validate,
                no_skip_existing,
                reset_timestamps,
                batch,
            },
            json,
        ),
        Commands::MigrateBulk { inputs, to, json } => commands::migrate_bulk::run(&config, &inputs, to, json),
    }
}
