//! Flat-file backend: a JSON array of entries plus an NDJSON operation log

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{prepare_save, sync_semantic_index, MemoryStore, StorageKind};
use crate::core::entry::{MemoryEntry, Operation, OperationLogEntry, SearchQuery, SearchResult};
use crate::core::error::{MemoryError, Result};
use crate::core::paths::ensure_parent_dir;
use crate::search::engine::LexicalSearchEngine;
use crate::search::semantic::SemanticSearchEngine;

/// Read a JSON array of entries; a missing or blank file is an empty store
pub fn load_entries(path: &Path) -> Result<Vec<MemoryEntry>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    serde_json::from_str(&content)
        .map_err(|e| MemoryError::validation(format!("failed to parse {}: {}", path.display(), e)))
}

pub struct JsonMemoryStore {
    data_file: PathBuf,
    log_file: PathBuf,
    lock: RwLock<()>,
    semantic: RwLock<Option<Arc<SemanticSearchEngine>>>,
}

impl JsonMemoryStore {
    /// Files are created on first write
    pub fn new(data_file: impl Into<PathBuf>, log_file: impl Into<PathBuf>) -> Self {
        Self {
            data_file: data_file.into(),
            log_file: log_file.into(),
            lock: RwLock::new(()),
            semantic: RwLock::new(None),
        }
    }

    fn write_entries(&self, entries: &[MemoryEntry]) -> Result<()> {
        ensure_parent_dir(&self.data_file)?;
        let json = serde_json::to_string_pretty(entries)?;
        fs::write(&self.data_file, json)?;
        Ok(())
    }

    fn record(&self, log: OperationLogEntry) {
        if let Err(e) = self.log_operation(&log) {
            warn!("Failed to log {} operation: {}", log.operation, e);
        }
    }

    fn find(entries: &[MemoryEntry], key: &str, id: &str) -> Option<usize> {
        let by_key = (!key.is_empty())
            .then(|| entries.iter().position(|e| e.key == key))
            .flatten();
        by_key.or_else(|| {
            (!id.is_empty())
                .then(|| entries.iter().position(|e| e.id == id))
                .flatten()
        })
    }

    fn save_locked(&self, entry: MemoryEntry) -> Result<(Operation, Option<MemoryEntry>, MemoryEntry)> {
        let mut entries = load_entries(&self.data_file)?;
        let index = Self::find(&entries, &entry.key, &entry.id);
        let before = index.map(|i| entries[i].clone());
        let (operation, saved) = prepare_save(entry, before.as_ref(), true);

        match index {
            Some(i) => entries[i] = saved.clone(),
            None => entries.push(saved.clone()),
        }
        self.write_entries(&entries)?;
        Ok((operation, before, saved))
    }

    fn delete_where<F>(&self, what: &str, matches: F) -> Result<()>
    where
        F: Fn(&MemoryEntry) -> bool,
    {
        let _guard = self.lock.write();
        let mut entries = load_entries(&self.data_file)?;
        let index = entries
            .iter()
            .position(|e| matches(e))
            .ok_or_else(|| MemoryError::not_found(what))?;

        let removed = entries.remove(index);
        if let Err(e) = self.write_entries(&entries) {
            self.record(OperationLogEntry::failed(Operation::Delete, &removed.key, &e));
            return Err(e);
        }

        self.record(OperationLogEntry::succeeded(Operation::Delete, Some(&removed), None));
        if let Some(engine) = self.semantic_engine() {
            engine.remove_embedding(&removed.id);
        }
        debug!("Deleted memory {}", removed.id);
        Ok(())
    }
}

impl MemoryStore for JsonMemoryStore {
    fn kind(&self) -> StorageKind {
        StorageKind::Json
    }

    fn save(&self, entry: MemoryEntry) -> Result<String> {
        let _guard = self.lock.write();
        let key = entry.key.clone();

        match self.save_locked(entry) {
            Ok((operation, before, saved)) => {
                self.record(OperationLogEntry::succeeded(operation, before.as_ref(), Some(&saved)));
                sync_semantic_index(self.semantic_engine(), &saved);
                debug!("Saved memory {} ({})", saved.id, operation);
                Ok(saved.id)
            }
            Err(e) => {
                self.record(OperationLogEntry::failed(Operation::Save, &key, &e));
                Err(e)
            }
        }
    }

    fn get(&self, key: &str) -> Result<MemoryEntry> {
        let _guard = self.lock.read();
        load_entries(&self.data_file)?
            .into_iter()
            .find(|e| !key.is_empty() && e.key == key)
            .ok_or_else(|| MemoryError::not_found(key))
    }

    fn get_by_id(&self, id: &str) -> Result<MemoryEntry> {
        let _guard = self.lock.read();
        load_entries(&self.data_file)?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| MemoryError::not_found(id))
    }

    fn list(&self, category: &str) -> Result<Vec<MemoryEntry>> {
        let _guard = self.lock.read();
        let mut entries: Vec<MemoryEntry> = load_entries(&self.data_file)?
            .into_iter()
            .filter(|e| e.in_category(category))
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(entries)
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>> {
        match self.semantic_engine() {
            Some(engine) => engine.search(self, query),
            None => LexicalSearchEngine::new().search(self, query),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(MemoryError::not_found(key));
        }
        self.delete_where(key, |e| e.key == key)
    }

    fn delete_by_id(&self, id: &str) -> Result<()> {
        self.delete_where(id, |e| e.id == id)
    }

    fn log_operation(&self, entry: &OperationLogEntry) -> Result<()> {
        ensure_parent_dir(&self.log_file)?;
        let line = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.log_file)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn set_semantic_engine(&self, engine: Arc<SemanticSearchEngine>) {
        *self.semantic.write() = Some(engine);
    }

    fn semantic_engine(&self) -> Option<Arc<SemanticSearchEngine>> {
        self.semantic.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, JsonMemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonMemoryStore::new(dir.path().join("data/memories.json"), dir.path().join("logs/ops.log"));
        (dir, store)
    }

    fn read_log(dir: &TempDir) -> Vec<OperationLogEntry> {
        fs::read_to_string(dir.path().join("logs/ops.log"))
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_concurrent_saves_lose_no_updates() -> Result<()> {
        let (dir, store) = setup();
        let store = Arc::new(store);
        let threads = 8;
        let per_thread = 5;

        let writers: Vec<_> = (0..threads)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || -> Result<()> {
                    for i in 0..per_thread {
                        store.save(MemoryEntry::new("load", format!("key-{}-{}", t, i), "v"))?;
                        store.list("load")?;
                    }
                    Ok(())
                })
            })
            .collect();
        for handle in writers {
            handle.join().expect("writer panicked")?;
        }

        let entries = store.list("")?;
        assert_eq!(entries.len(), threads * per_thread);
        let ids: std::collections::HashSet<_> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids.len(), threads * per_thread);

        let log = read_log(&dir);
        assert_eq!(log.len(), threads * per_thread);
        assert!(log.iter().all(|l| l.success && l.operation == Operation::Save));
        Ok(())
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let (_dir, store) = setup();
        let id = store.save(MemoryEntry::new("personal", "birthday", "1990-05-15").with_tags(["date", "family"]))?;

        let by_key = store.get("birthday")?;
        let by_id = store.get_by_id(&id)?;
        assert_eq!(by_key, by_id);
        assert_eq!(by_key.tags, vec!["date", "family"]);
        assert!(by_key.created_at <= by_key.updated_at);
        Ok(())
    }

    #[test]
    fn test_update_in_place() -> Result<()> {
        let (dir, store) = setup();
        let first = store.save(MemoryEntry::new("personal", "birthday", "1990-05-15"))?;
        let created = store.get("birthday")?.created_at;
        let second = store.save(MemoryEntry::new("personal", "birthday", "1990-05-16"))?;

        assert_eq!(first, second);
        let all = store.list("")?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "1990-05-16");
        assert_eq!(all[0].created_at, created);

        let log = read_log(&dir);
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].operation, Operation::Save);
        assert_eq!(log[1].operation, Operation::Update);
        assert_eq!(log[1].before.as_ref().map(|b| b.value.as_str()), Some("1990-05-15"));
        Ok(())
    }

    #[test]
    fn test_update_by_id_without_key() -> Result<()> {
        let (_dir, store) = setup();
        let id = store.save(MemoryEntry::new("notes", "", "draft"))?;
        store.save(MemoryEntry::new("notes", "", "final").with_id(id.clone()))?;

        let all = store.list("")?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "final");
        Ok(())
    }

    #[test]
    fn test_list_filters_and_orders_newest_first() -> Result<()> {
        let (_dir, store) = setup();
        store.save(MemoryEntry::new("work", "a", "1"))?;
        store.save(MemoryEntry::new("home", "b", "2"))?;
        store.save(MemoryEntry::new("work", "c", "3"))?;

        let work = store.list("work")?;
        assert_eq!(work.len(), 2);
        assert_eq!(work[0].key, "c");
        assert_eq!(store.list("")?.len(), 3);
        Ok(())
    }

    #[test]
    fn test_delete() -> Result<()> {
        let (dir, store) = setup();
        let id = store.save(MemoryEntry::new("c", "k", "v"))?;
        store.save(MemoryEntry::new("c", "k2", "v2"))?;

        store.delete("k")?;
        assert!(store.get("k").unwrap_err().is_not_found());
        assert!(store.delete("k").unwrap_err().is_not_found());
        assert!(store.delete("").unwrap_err().is_not_found());

        let k2 = store.get("k2")?;
        store.delete_by_id(&k2.id)?;
        assert!(store.list("")?.is_empty());

        let deletes: Vec<_> = read_log(&dir).into_iter().filter(|l| l.operation == Operation::Delete).collect();
        assert_eq!(deletes.len(), 2);
        assert_eq!(deletes[0].memory_id, id);
        assert!(deletes[0].before.is_some());
        Ok(())
    }

    #[test]
    fn test_missing_file_is_empty_and_state_survives_reopen() -> Result<()> {
        let (dir, store) = setup();
        assert!(store.list("")?.is_empty());
        assert!(store.get_by_id("memory_0").unwrap_err().is_not_found());

        store.save(MemoryEntry::new("c", "k", "v"))?;
        let reopened = JsonMemoryStore::new(dir.path().join("data/memories.json"), dir.path().join("logs/ops.log"));
        assert_eq!(reopened.get("k")?.value, "v");
        Ok(())
    }

    #[test]
    fn test_malformed_file_is_validation_error() -> Result<()> {
        let (dir, store) = setup();
        fs::create_dir_all(dir.path().join("data"))?;
        fs::write(dir.path().join("data/memories.json"), "{ not json")?;

        assert!(matches!(store.list(""), Err(MemoryError::Validation(_))));
        Ok(())
    }

    #[test]
    fn test_failed_save_is_logged() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // a directory cannot be read as the data file
        let store = JsonMemoryStore::new(dir.path(), dir.path().join("ops.log"));

        assert!(store.save(MemoryEntry::new("c", "k", "v")).is_err());
        let log = fs::read_to_string(dir.path().join("ops.log"))?;
        let record: OperationLogEntry = serde_json::from_str(log.trim())?;
        assert!(!record.success);
        assert!(record.error.is_some());
        assert_eq!(record.key, "k");
        Ok(())
    }

    #[test]
    fn test_lexical_search_scenario() -> Result<()> {
        let (_dir, store) = setup();
        store.save(MemoryEntry::new("programming", "lang", "rust"))?;
        store.save(MemoryEntry::new("programming", "editor", "helix"))?;
        store.save(MemoryEntry::new("personal", "birthday", "1990-05-15"))?;

        let hits = store.search(&SearchQuery::new("programming"))?;
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.entry.category == "programming"));

        let personal = store.search(&SearchQuery::new("").in_category("personal"))?;
        assert_eq!(personal.len(), 1);
        assert_eq!(personal[0].score, 1.0);
        Ok(())
    }
}
