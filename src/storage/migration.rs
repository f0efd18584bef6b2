//! One-way JSON -> SQLite migration
//!
//! Stages run in order: load source, back up source, copy in batches,
//! validate. Entries already in the target are skipped, so re-running a
//! migration is safe. Per-entry failures are collected and never abort the
//! run; rows written before a failure stay in the target.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use super::json_store::load_entries;
use super::sqlite_store::SqliteMemoryStore;
use super::MemoryStore;
use crate::core::entry::{generate_id, MemoryEntry};
use crate::core::error::{MemoryError, Result};
use crate::core::paths::backup_path;

/// Entries spot-checked by validation
const VALIDATION_SAMPLE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStage {
    #[default]
    NotStarted,
    LoadingSource,
    BackingUp,
    Copying,
    Validating,
    Done,
    Failed,
}

impl fmt::Display for MigrationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::LoadingSource => "loading source",
            Self::BackingUp => "backing up source",
            Self::Copying => "copying entries",
            Self::Validating => "validating",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub json_file: PathBuf,
    pub sqlite_path: PathBuf,
    /// Skip entries whose key (or else id) already exists in the target
    pub skip_existing: bool,
    pub validate_after: bool,
    pub backup_source: bool,
    /// Keep source timestamps instead of stamping entries with "now"
    pub preserve_timestamps: bool,
    pub batch_size: usize,
}

impl MigrationOptions {
    pub fn new(json_file: impl Into<PathBuf>, sqlite_path: impl Into<PathBuf>) -> Self {
        Self {
            json_file: json_file.into(),
            sqlite_path: sqlite_path.into(),
            skip_existing: true,
            validate_after: true,
            backup_source: true,
            preserve_timestamps: true,
            batch_size: 1000,
        }
    }
}

/// A source entry that could not be written
#[derive(Debug, Clone, Serialize)]
pub struct EntryFailure {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationResult {
    pub total: usize,
    pub migrated: usize,
    pub skipped: usize,
    pub failed: usize,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
    /// `None` when validation did not run
    pub validation_passed: Option<bool>,
    pub backup_created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub errors: Vec<String>,
    pub failures: Vec<EntryFailure>,
    pub stage: MigrationStage,
    pub cancelled: bool,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl MigrationResult {
    /// Error unless every entry was handled and validation (if run) passed
    pub fn ensure_complete(&self) -> Result<()> {
        if self.cancelled {
            return Err(MemoryError::migration(MigrationStage::Copying, "cancelled"));
        }
        if self.failed > 0 {
            return Err(MemoryError::MigrationPartialFailure {
                failed: self.failed,
                total: self.total,
            });
        }
        if self.validation_passed == Some(false) {
            let reason = self.errors.last().cloned().unwrap_or_else(|| "validation failed".to_string());
            return Err(MemoryError::migration(MigrationStage::Validating, reason));
        }
        Ok(())
    }

    fn absorb(&mut self, other: MigrationResult) {
        self.total += other.total;
        self.migrated += other.migrated;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.errors.extend(other.errors);
        self.failures.extend(other.failures);
        self.cancelled |= other.cancelled;
    }
}

enum EntryOutcome {
    Migrated,
    Skipped,
}

pub struct Migrator {
    options: MigrationOptions,
    cancel: Arc<AtomicBool>,
    stage: Mutex<MigrationStage>,
}

impl Migrator {
    pub fn new(options: MigrationOptions) -> Self {
        Self {
            options,
            cancel: Arc::new(AtomicBool::new(false)),
            stage: Mutex::new(MigrationStage::NotStarted),
        }
    }

    /// Setting the flag stops the run before the next entry
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Stage of the current or last run; `Failed` after an aborted run
    pub fn stage(&self) -> MigrationStage {
        *self.stage.lock()
    }

    fn enter(&self, result: &mut MigrationResult, stage: MigrationStage) {
        *self.stage.lock() = stage;
        result.stage = stage;
    }

    fn abort(&self, stage: MigrationStage, reason: impl ToString) -> MemoryError {
        *self.stage.lock() = MigrationStage::Failed;
        MemoryError::migration(stage, reason)
    }

    /// Migrate into the target named by the options
    pub fn migrate(&self) -> Result<MigrationResult> {
        let started = Instant::now();
        info!(
            "Starting JSON to SQLite migration: {} -> {}",
            self.options.json_file.display(),
            self.options.sqlite_path.display()
        );

        let mut result = MigrationResult::default();
        let source = self.load_source(&mut result)?;

        if self.options.backup_source {
            self.backup(&mut result);
        }

        self.enter(&mut result, MigrationStage::Copying);
        let target = SqliteMemoryStore::open(&self.options.sqlite_path).map_err(|e| {
            self.abort(
                MigrationStage::Copying,
                format!("failed to open {}: {}", self.options.sqlite_path.display(), e),
            )
        })?;

        self.finish(source, &target, result, started)
    }

    /// Migrate into an already open store; the configured target path is ignored
    pub fn migrate_into(&self, target: &SqliteMemoryStore) -> Result<MigrationResult> {
        let started = Instant::now();
        let mut result = MigrationResult::default();
        let source = self.load_source(&mut result)?;

        if self.options.backup_source {
            self.backup(&mut result);
        }

        self.finish(source, target, result, started)
    }

    fn finish(
        &self,
        source: Vec<MemoryEntry>,
        target: &SqliteMemoryStore,
        mut result: MigrationResult,
        started: Instant,
    ) -> Result<MigrationResult> {
        self.enter(&mut result, MigrationStage::Copying);
        self.copy_entries(&source, target, &mut result);

        if self.options.validate_after && !result.cancelled {
            self.enter(&mut result, MigrationStage::Validating);
            result.validation_passed = Some(validate(&source, target, &mut result));
        }

        self.enter(&mut result, MigrationStage::Done);
        result.duration = started.elapsed();
        info!(
            "Migration completed in {:?}: total {}, migrated {}, skipped {}, failed {}",
            result.duration, result.total, result.migrated, result.skipped, result.failed
        );
        Ok(result)
    }

    /// Read the source file; missing or unparsable sources abort the run
    pub fn load_source(&self, result: &mut MigrationResult) -> Result<Vec<MemoryEntry>> {
        self.enter(result, MigrationStage::LoadingSource);
        let path = &self.options.json_file;

        if !path.is_file() {
            result.stage = MigrationStage::Failed;
            return Err(self.abort(
                MigrationStage::LoadingSource,
                format!("source file does not exist: {}", path.display()),
            ));
        }

        let entries = load_entries(path).map_err(|e| {
            result.stage = MigrationStage::Failed;
            self.abort(MigrationStage::LoadingSource, e)
        })?;

        result.total += entries.len();
        info!("Loaded {} memories from {}", entries.len(), path.display());
        Ok(entries)
    }

    fn backup(&self, result: &mut MigrationResult) {
        self.enter(result, MigrationStage::BackingUp);
        let target = backup_path(&self.options.json_file, Local::now());

        match fs::copy(&self.options.json_file, &target) {
            Ok(_) => {
                info!("Created backup: {}", target.display());
                result.backup_created = true;
                result.backup_path = Some(target);
            }
            Err(e) => {
                warn!("Failed to create backup: {}", e);
                result.errors.push(format!("backup failed: {}", e));
            }
        }
    }

    fn copy_entries(&self, source: &[MemoryEntry], target: &SqliteMemoryStore, result: &mut MigrationResult) {
        let batch_size = self.options.batch_size.max(1);

        for (n, batch) in source.chunks(batch_size).enumerate() {
            let first = n * batch_size + 1;
            debug!("Processing batch {}-{} ({} memories)", first, first + batch.len() - 1, batch.len());

            for entry in batch {
                if self.cancel.load(Ordering::SeqCst) {
                    warn!("Migration cancelled after {} memories", result.migrated + result.skipped + result.failed);
                    result.cancelled = true;
                    return;
                }

                match self.migrate_entry(entry.clone(), target) {
                    Ok(EntryOutcome::Migrated) => result.migrated += 1,
                    Ok(EntryOutcome::Skipped) => result.skipped += 1,
                    Err(e) => {
                        warn!("Failed to migrate memory {}: {}", entry.id, e);
                        result.failed += 1;
                        result.errors.push(format!("memory {} failed: {}", entry.id, e));
                        result.failures.push(EntryFailure {
                            id: entry.id.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }
    }

    fn migrate_entry(&self, mut entry: MemoryEntry, target: &SqliteMemoryStore) -> Result<EntryOutcome> {
        if self.options.skip_existing && exists_in(target, &entry)? {
            debug!("Skipping existing memory {}", entry.id);
            return Ok(EntryOutcome::Skipped);
        }

        if !self.options.preserve_timestamps {
            let now = Utc::now();
            entry.created_at = now;
            entry.updated_at = now;
        }
        if entry.id.is_empty() {
            entry.id = generate_id();
        }

        target.import(entry)?;
        Ok(EntryOutcome::Migrated)
    }
}

/// Present by key, or else by id
fn exists_in(target: &SqliteMemoryStore, entry: &MemoryEntry) -> Result<bool> {
    if !entry.key.is_empty() {
        match target.get(&entry.key) {
            Ok(_) => return Ok(true),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    if !entry.id.is_empty() {
        match target.get_by_id(&entry.id) {
            Ok(_) => return Ok(true),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

fn lookup(target: &SqliteMemoryStore, entry: &MemoryEntry) -> Option<MemoryEntry> {
    (!entry.key.is_empty())
        .then(|| target.get(&entry.key).ok())
        .flatten()
        .or_else(|| target.get_by_id(&entry.id).ok())
}

/// Count check against `result.migrated`, then a content spot-check
fn validate(source: &[MemoryEntry], target: &SqliteMemoryStore, result: &mut MigrationResult) -> bool {
    info!("Validating migration");

    let actual = match target.count() {
        Ok(n) => n,
        Err(e) => {
            result.errors.push(format!("validation count failed: {}", e));
            return false;
        }
    };

    if actual < result.migrated {
        warn!("Validation failed: expected at least {} memories, found {}", result.migrated, actual);
        result
            .errors
            .push(format!("count mismatch: expected >= {}, got {}", result.migrated, actual));
        return false;
    }

    for expected in source.iter().take(VALIDATION_SAMPLE) {
        let Some(found) = lookup(target, expected) else {
            warn!("Validation sample {} not found in target", expected.id);
            continue;
        };
        if found.category != expected.category || found.value != expected.value {
            warn!("Validation failed: content mismatch for {}", expected.id);
            result.errors.push(format!("content mismatch for memory {}", expected.id));
            return false;
        }
    }

    info!("Validation passed: {} memories in target", actual);
    true
}

/// Migrate several JSON files into one SQLite database.
///
/// Files are never backed up and validation runs once at the end. A file
/// that cannot be loaded is recorded in `errors` and skipped.
pub fn migrate_bulk(files: &[PathBuf], sqlite_path: &Path) -> Result<MigrationResult> {
    if files.is_empty() {
        return Err(MemoryError::validation("no JSON files provided"));
    }

    let started = Instant::now();
    let target = SqliteMemoryStore::open(sqlite_path).map_err(|e| {
        MemoryError::migration(MigrationStage::Copying, format!("failed to open {}: {}", sqlite_path.display(), e))
    })?;

    info!("Starting bulk migration of {} files", files.len());
    let mut total = MigrationResult::default();
    let mut sources = Vec::new();

    for (i, file) in files.iter().enumerate() {
        info!("Processing file {}/{}: {}", i + 1, files.len(), file.display());

        let mut options = MigrationOptions::new(file, sqlite_path);
        options.backup_source = false;
        options.validate_after = false;
        let migrator = Migrator::new(options);

        let mut result = MigrationResult::default();
        let source = match migrator.load_source(&mut result) {
            Ok(source) => source,
            Err(e) => {
                warn!("Skipping {}: {}", file.display(), e);
                total.errors.push(format!("file {}: {}", file.display(), e));
                continue;
            }
        };

        migrator.copy_entries(&source, &target, &mut result);
        total.absorb(result);
        sources.extend(source);
    }

    total.stage = MigrationStage::Validating;
    let passed = validate(&sources, &target, &mut total);
    total.validation_passed = Some(passed);

    total.stage = MigrationStage::Done;
    total.duration = started.elapsed();
    info!(
        "Bulk migration completed in {:?}: total {}, migrated {}, skipped {}, failed {}",
        total.duration, total.total, total.migrated, total.skipped, total.failed
    );
    Ok(total)
}
