//! Storage adapter interface (C6): pluggable table (SQL-like) and lake
//! (object store) backends, plus the optional action-handler extension.
//!
//! Concrete drivers (Postgres, S3, etc.) are out of scope; this module ships
//! one reference implementation of each so the gateway is exercisable and
//! testable end to end.

use crate::error::{GatewayError, Result};
use crate::hlc::HlcTimestamp;
use crate::model::{ActionDescriptor, RowDelta};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A successful imperative action's free-form result payload.
pub type ActionOutcome = serde_json::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ActionExecutionError {
    #[error("action not supported: {0}")]
    NotSupported(String),
    #[error("action failed: {0}")]
    Failed(String),
}

/// Optional extension: a connector or adapter may expose imperative
/// side-effect operations alongside its delta stream.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn supported_actions(&self) -> Vec<ActionDescriptor>;
    async fn execute_action(
        &self,
        action_type: &str,
        params: serde_json::Value,
    ) -> std::result::Result<ActionOutcome, ActionExecutionError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub key: String,
    pub size_bytes: u64,
    pub etag: String,
}

/// Row-table shaped backend: used for the cross-instance shared buffer (C9)
/// and Postgres-style durable stores.
#[async_trait]
pub trait TableAdapter: Send + Sync {
    async fn insert_deltas(&self, batch: &[RowDelta]) -> Result<()>;
    async fn query_deltas_since(
        &self,
        since: HlcTimestamp,
        tables: Option<&[String]>,
    ) -> Result<Vec<RowDelta>>;
    async fn get_latest_state(
        &self,
        table: &str,
        row_id: &str,
    ) -> Result<Option<serde_json::Value>>;
    async fn ensure_schema(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Object-store shaped backend: used for batch flush targets.
#[async_trait]
pub trait LakeAdapter: Send + Sync {
    async fn put_object(&self, key: &str, bytes: &[u8]) -> Result<()>;
    async fn head_object(&self, key: &str) -> Result<ObjectMetadata>;
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMetadata>>;
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;
    async fn close(&self) -> Result<()>;
}

/// Reference `TableAdapter`: an in-process row table. Doubles as the shared
/// write-through adapter in single-process cluster-mode tests.
#[derive(Default)]
pub struct InMemoryTableAdapter {
    rows: RwLock<Vec<RowDelta>>,
}

impl InMemoryTableAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableAdapter for InMemoryTableAdapter {
    async fn insert_deltas(&self, batch: &[RowDelta]) -> Result<()> {
        let mut rows = self.rows.write();
        let existing: std::collections::HashSet<&str> =
            rows.iter().map(|d| d.delta_id.as_str()).collect();
        for delta in batch {
            if !existing.contains(delta.delta_id.as_str()) {
                rows.push(delta.clone());
            }
        }
        Ok(())
    }

    async fn query_deltas_since(
        &self,
        since: HlcTimestamp,
        tables: Option<&[String]>,
    ) -> Result<Vec<RowDelta>> {
        let mut matched: Vec<RowDelta> = self
            .rows
            .read()
            .iter()
            .filter(|d| d.hlc > since)
            .filter(|d| tables.map_or(true, |ts| ts.iter().any(|t| t == &d.table)))
            .cloned()
            .collect();
        matched.sort_by_key(|d| d.hlc);
        Ok(matched)
    }

    async fn get_latest_state(
        &self,
        table: &str,
        row_id: &str,
    ) -> Result<Option<serde_json::Value>> {
        let mut latest: Option<&RowDelta> = None;
        for d in self.rows.read().iter() {
            if d.table == table && d.row_id == row_id {
                if latest.map_or(true, |l| d.hlc > l.hlc) {
                    latest = Some(d);
                }
            }
        }
        Ok(latest.map(|d| {
            serde_json::json!({
                "rowId": d.row_id,
                "op": d.op,
                "columns": d.columns,
                "hlc": d.hlc,
            })
        }))
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Reference `LakeAdapter`: object semantics over a local directory. Keys
/// are relative paths; directories are created on demand.
pub struct LocalFsLakeAdapter {
    root: PathBuf,
}

impl LocalFsLakeAdapter {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.contains("..") {
            return Err(GatewayError::BadRequest(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl LakeAdapter for LocalFsLakeAdapter {
    async fn put_object(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, bytes)?;
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        let path = self.resolve(key)?;
        let meta = std::fs::metadata(&path)
            .map_err(|_| GatewayError::NotFound(format!("object {key}")))?;
        let bytes = std::fs::read(&path)?;
        Ok(ObjectMetadata {
            key: key.to_string(),
            size_bytes: meta.len(),
            etag: format!("{:08x}", crc32fast::hash(&bytes)),
        })
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        let base = self.resolve(prefix)?;
        let mut out = Vec::new();
        let walk_root = if base.is_dir() { base } else { self.root.clone() };
        let mut stack = vec![walk_root];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let rel = path
                    .strip_prefix(&self.root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                if rel.starts_with(prefix) {
                    let bytes = std::fs::read(&path)?;
                    out.push(ObjectMetadata {
                        key: rel,
                        size_bytes: bytes.len() as u64,
                        etag: format!("{:08x}", crc32fast::hash(&bytes)),
                    });
                }
            }
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        std::fs::read(&path).map_err(|_| GatewayError::NotFound(format!("object {key}")))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// `{name, kind, registeredAt}` registry entry, kept alongside the live
/// adapter instances by the connector manager.
pub struct RegisteredAdapters {
    pub tables: HashMap<String, std::sync::Arc<dyn TableAdapter>>,
    pub lakes: HashMap<String, std::sync::Arc<dyn LakeAdapter>>,
}

impl Default for RegisteredAdapters {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            lakes: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Op;

    fn delta(id: &str, hlc: u64) -> RowDelta {
        RowDelta {
            delta_id: id.to_string(),
            table: "todos".to_string(),
            row_id: "row-1".to_string(),
            client_id: "c1".to_string(),
            op: Op::Insert,
            columns: vec![("title".to_string(), serde_json::json!("a"))],
            hlc: HlcTimestamp::from(hlc),
        }
    }

    #[tokio::test]
    async fn in_memory_table_adapter_dedups_by_delta_id() {
        let adapter = InMemoryTableAdapter::new();
        adapter.insert_deltas(&[delta("a", 1), delta("a", 1)]).await.unwrap();
        let rows = adapter
            .query_deltas_since(HlcTimestamp::from(0), None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn in_memory_table_adapter_filters_by_table() {
        let adapter = InMemoryTableAdapter::new();
        let mut other = delta("b", 2);
        other.table = "notes".to_string();
        adapter.insert_deltas(&[delta("a", 1), other]).await.unwrap();
        let rows = adapter
            .query_deltas_since(
                HlcTimestamp::from(0),
                Some(&["todos".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].table, "todos");
    }

    #[tokio::test]
    async fn local_fs_lake_adapter_round_trips_objects() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalFsLakeAdapter::new(dir.path().to_path_buf()).unwrap();
        adapter.put_object("batches/1.json", b"hello").await.unwrap();
        let back = adapter.get_object("batches/1.json").await.unwrap();
        assert_eq!(back, b"hello");
        let listed = adapter.list_objects("batches/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "batches/1.json");
    }

    #[tokio::test]
    async fn local_fs_lake_adapter_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = LocalFsLakeAdapter::new(dir.path().to_path_buf()).unwrap();
        let result = adapter.put_object("../escape.json", b"x").await;
        assert!(result.is_err());
    }
}
