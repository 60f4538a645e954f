//! Persistence (C2): write-ahead log for unflushed deltas, plus a durable
//! cursor store for connector resumption state.
//!
//! Calls must be synchronous from the caller's perspective so the
//! push -> persist -> buffer sequence stays indivisible with respect to
//! crash recovery; the file-backed variant still does its I/O off the async
//! executor by delegating to `tokio::task::spawn_blocking`-free sync calls
//! guarded by a mutex, in the buffered-writer style used elsewhere in this
//! crate.

use crate::error::{GatewayError, Result};
use crate::model::RowDelta;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// Append-only log of unflushed deltas, plus per-connector cursor blobs.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn append_batch(&self, deltas: &[RowDelta]) -> Result<()>;
    async fn load_all(&self) -> Result<Vec<RowDelta>>;
    /// Clears the WAL after a successful flush. Failure here is logged, not
    /// fatal; the buffer already deduplicates by `delta_id` on replay.
    async fn clear(&self) -> Result<()>;

    async fn save_cursor(&self, connector: &str, cursor_json: &str) -> Result<()>;
    async fn load_cursor(&self, connector: &str) -> Result<Option<String>>;
}

/// In-memory variant: tests and ephemeral single-node deployments.
#[derive(Default)]
pub struct MemoryPersistence {
    wal: Mutex<Vec<RowDelta>>,
    cursors: Mutex<HashMap<String, String>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn append_batch(&self, deltas: &[RowDelta]) -> Result<()> {
        self.wal.lock().extend_from_slice(deltas);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<RowDelta>> {
        Ok(self.wal.lock().clone())
    }

    async fn clear(&self) -> Result<()> {
        self.wal.lock().clear();
        Ok(())
    }

    async fn save_cursor(&self, connector: &str, cursor_json: &str) -> Result<()> {
        self.cursors
            .lock()
            .insert(connector.to_string(), cursor_json.to_string());
        Ok(())
    }

    async fn load_cursor(&self, connector: &str) -> Result<Option<String>> {
        Ok(self.cursors.lock().get(connector).cloned())
    }
}

/// Local embedded-file variant: one WAL file of newline-delimited JSON
/// deltas, fsync'd on every append, plus a JSON cursor file. Both guarded by
/// the same mutex as the in-memory variant; the file handle is reopened per
/// call rather than held across `.await`, so the lock is never held over I/O
/// that could suspend indefinitely.
pub struct FilePersistence {
    wal_path: PathBuf,
    cursor_path: PathBuf,
    lock: Mutex<()>,
}

impl FilePersistence {
    pub fn new(data_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        Ok(Self {
            wal_path: data_dir.join("wal.jsonl"),
            cursor_path: data_dir.join("cursors.json"),
            lock: Mutex::new(()),
        })
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn append_batch(&self, deltas: &[RowDelta]) -> Result<()> {
        let _guard = self.lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.wal_path)?;
        for delta in deltas {
            let line = serde_json::to_string(delta)?;
            writeln!(file, "{line}")?;
        }
        file.sync_all()?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<RowDelta>> {
        let _guard = self.lock.lock();
        if !self.wal_path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.wal_path)?;
        let reader = std::io::BufReader::new(file);
        let mut deltas = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            deltas.push(serde_json::from_str(&line)?);
        }
        Ok(deltas)
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock();
        std::fs::File::create(&self.wal_path)?;
        Ok(())
    }

    async fn save_cursor(&self, connector: &str, cursor_json: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut all: HashMap<String, String> = if self.cursor_path.exists() {
            let text = std::fs::read_to_string(&self.cursor_path)?;
            serde_json::from_str(&text).unwrap_or_default()
        } else {
            HashMap::new()
        };
        all.insert(connector.to_string(), cursor_json.to_string());
        let text = serde_json::to_string(&all)
            .map_err(|e| GatewayError::Internal(format!("cursor store encode: {e}")))?;
        std::fs::write(&self.cursor_path, text)?;
        Ok(())
    }

    async fn load_cursor(&self, connector: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        if !self.cursor_path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.cursor_path)?;
        let all: HashMap<String, String> = serde_json::from_str(&text).unwrap_or_default();
        Ok(all.get(connector).cloned())
    }
}
