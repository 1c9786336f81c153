//! Write-ahead log: the crash-recovery boundary for multi-backend
//! writes. Append-only NDJSON, one entry per line, fsynced on every
//! append. Compaction (`remove`) rewrites the file via a
//! temp-file-rename, never mutating the live file in place.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;

use crate::error::WalError;
use crate::model::{WalEntry, WalOperation};

/// Append-only NDJSON write-ahead log.
pub struct Wal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Wal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and fsync. Atomic substitution (temp+rename) is
    /// reserved for compaction; a single-line append only needs the
    /// fsync to guarantee durability of what's already on disk.
    pub fn append(&self, entry: &WalEntry) -> Result<(), WalError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        tracing::debug!(id = %entry.id, op = ?entry.operation, "wal append");
        Ok(())
    }

    /// Compact the file by rewriting it without `id`. Failures here are
    /// logged by the caller, not propagated to the owning store — the
    /// next stale-entry compaction reconciles state.
    pub fn remove(&self, id: &str) -> Result<(), WalError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let entries = self.read_all_locked()?;
        let remaining: Vec<WalEntry> = entries.into_iter().filter(|e| e.id != id).collect();

        if remaining.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }

        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in &remaining {
                let mut line = serde_json::to_string(entry)?;
                line.push('\n');
                tmp.write_all(line.as_bytes())?;
            }
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Entries whose timestamp is within `max_age` of now.
    pub fn valid_entries(&self, max_age: chrono::Duration) -> Result<Vec<WalEntry>, WalError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let entries = self.read_all_locked()?;
        Ok(entries
            .into_iter()
            .filter(|e| now.signed_duration_since(e.timestamp) <= max_age)
            .collect())
    }

    /// Called at startup: returns entries eligible for replay. Callers
    /// replay them idempotently through the normal store path and
    /// remove each on success.
    pub fn recover(&self, max_age: chrono::Duration) -> Result<Vec<WalEntry>, WalError> {
        let entries = self.valid_entries(max_age)?;
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "replaying pending WAL entries");
        }
        Ok(entries)
    }

    /// Reads every line in the file, tolerating the legacy single-JSON-array
    /// format on first run (a file written before NDJSON was adopted).
    fn read_all_locked(&self) -> Result<Vec<WalEntry>, WalError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut lines = Vec::new();
        for line in reader.lines() {
            lines.push(line?);
        }

        // Legacy format: the whole file is a single JSON array.
        if let Some(first) = lines.first() {
            let trimmed = first.trim_start();
            if trimmed.starts_with('[') {
                let whole = lines.join("\n");
                if let Ok(legacy) = serde_json::from_str::<Vec<WalEntry>>(&whole) {
                    return Ok(legacy);
                }
            }
        }

        for line in lines {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<WalEntry>(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed WAL line");
                }
            }
        }
        Ok(entries)
    }
}

/// Convenience constructor for a `store` WAL entry.
pub fn store_entry(id: impl Into<String>, data: serde_json::Value) -> WalEntry {
    WalEntry {
        id: id.into(),
        timestamp: Utc::now(),
        operation: WalOperation::Store,
        data,
    }
}

/// Convenience constructor for an `update` WAL entry.
pub fn update_entry(id: impl Into<String>, data: serde_json::Value) -> WalEntry {
    WalEntry {
        id: id.into(),
        timestamp: Utc::now(),
        operation: WalOperation::Update,
        data,
    }
}

/// Convenience constructor for a `remove` WAL entry.
pub fn remove_entry(id: impl Into<String>, data: serde_json::Value) -> WalEntry {
    WalEntry {
        id: id.into(),
        timestamp: Utc::now(),
        operation: WalOperation::Remove,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_then_recover_round_trips() {
        let dir = tempdir().unwrap();
        let wal = Wal::new(dir.path().join("test.wal.ndjson"));
        let entry = store_entry("fact-1", serde_json::json!({"text": "hello"}));
        wal.append(&entry).unwrap();

        let recovered = wal.recover(chrono::Duration::minutes(5)).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, "fact-1");
    }

    #[test]
    fn remove_compacts_and_unlinks_when_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.wal.ndjson");
        let wal = Wal::new(&path);
        wal.append(&store_entry("a", serde_json::json!({}))).unwrap();
        wal.append(&store_entry("b", serde_json::json!({}))).unwrap();

        wal.remove("a").unwrap();
        let remaining = wal.valid_entries(chrono::Duration::minutes(5)).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "b");

        wal.remove("b").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn stale_entries_excluded_by_max_age() {
        let dir = tempdir().unwrap();
        let wal = Wal::new(dir.path().join("test.wal.ndjson"));
        let mut entry = store_entry("old", serde_json::json!({}));
        entry.timestamp = Utc::now() - chrono::Duration::hours(1);
        wal.append(&entry).unwrap();

        let valid = wal.valid_entries(chrono::Duration::minutes(5)).unwrap();
        assert!(valid.is_empty());
    }

    #[test]
    fn legacy_json_array_file_is_readable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("legacy.wal.ndjson");
        let legacy = serde_json::json!([
            {"id": "x", "timestamp": Utc::now().to_rfc3339(), "operation": "store", "data": {}}
        ]);
        std::fs::write(&path, serde_json::to_string(&legacy).unwrap()).unwrap();

        let wal = Wal::new(&path);
        let entries = wal.recover(chrono::Duration::minutes(5)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "x");
    }
}
