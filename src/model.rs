//! Core data model: row deltas, operation kinds, and authenticated claims.

use crate::hlc::HlcTimestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The kind of row-level change a delta carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Insert,
    Update,
    Delete,
}

/// A scalar or JSON column value. Deltas are transport-agnostic, so values
/// are kept as `serde_json::Value` rather than a closed primitive set.
pub type ColumnValue = serde_json::Value;

/// One row-level change at one instant. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowDelta {
    pub delta_id: String,
    pub table: String,
    pub row_id: String,
    pub client_id: String,
    pub op: Op,
    /// Ordered so the same logical update always serializes identically;
    /// matters for content-addressed `delta_id`s.
    pub columns: Vec<(String, ColumnValue)>,
    pub hlc: HlcTimestamp,
}

impl RowDelta {
    /// Content-addressed delta id: a crc32 of table+row_id+hlc+columns. The
    /// spec permits but does not require this; callers that already have a
    /// stable id of their own should use it instead.
    pub fn content_hash_id(table: &str, row_id: &str, hlc: HlcTimestamp, columns: &[(String, ColumnValue)]) -> String {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(table.as_bytes());
        hasher.update(row_id.as_bytes());
        hasher.update(&hlc.as_u64().to_be_bytes());
        for (k, v) in columns {
            hasher.update(k.as_bytes());
            hasher.update(v.to_string().as_bytes());
        }
        format!("{:08x}", hasher.finalize())
    }

    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Approximate wire size used for buffer byte accounting. JSON
    /// serialization is the simplest faithful proxy for "bytes on disk" and
    /// matches how the delta is actually persisted in the WAL.
    pub fn approx_byte_size(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(0)
    }
}

/// A client's authenticated identity and custom claims, derived from a
/// verified bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Client,
    Admin,
}

impl Default for Role {
    fn default() -> Self {
        Role::Client
    }
}

#[derive(Debug, Clone, Default)]
pub struct Claims {
    pub client_id: String,
    pub gateway_id: String,
    pub role: Role,
    /// Arbitrary string or string-list claims, consulted by sync-rule
    /// `claim:<name>` references.
    pub custom: BTreeMap<String, ClaimValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimValue {
    Single(String),
    List(Vec<String>),
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn get(&self, name: &str) -> Option<&ClaimValue> {
        self.custom.get(name)
    }
}

/// Request/response shapes for the sync protocol (C5).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PushRequest {
    pub client_id: String,
    pub deltas: Vec<RowDelta>,
    #[serde(default)]
    pub last_seen_hlc: Option<HlcTimestamp>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushResponse {
    pub accepted: usize,
    pub server_hlc: HlcTimestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deltas: Option<Vec<RowDelta>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullQuery {
    pub since: u64,
    pub client_id: String,
    pub limit: Option<usize>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullResponse {
    pub deltas: Vec<RowDelta>,
    pub server_hlc: HlcTimestamp,
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionRequest {
    pub action_id: String,
    pub connector: String,
    pub action_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub hlc: Option<HlcTimestamp>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionBatch {
    pub client_id: String,
    pub actions: Vec<ActionRequest>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ActionResult {
    Ok {
        action_id: String,
        result: serde_json::Value,
    },
    Error {
        action_id: String,
        code: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionBatchResponse {
    pub results: Vec<ActionResult>,
}

/// `{actionType, description, paramsSchema?}`, per-connector action catalog
/// entry, returned by `describeActions` / `GET /v1/sync/{gw}/actions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub action_type: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params_schema: Option<serde_json::Value>,
}

/// `{name, kind, registeredAt}`, returned by the connector manager's list
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Table,
    Lake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub name: String,
    pub kind: AdapterKind,
    pub registered_at: HlcTimestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn content_hash_is_stable_for_same_input() {
        let d = delta("ignored", 100);
        let a = RowDelta::content_hash_id(&d.table, &d.row_id, d.hlc, &d.columns);
        let b = RowDelta::content_hash_id(&d.table, &d.row_id, d.hlc, &d.columns);
        assert_eq!(a, b);
    }

    #[test]
    fn content_hash_differs_on_column_change() {
        let d1 = delta("x", 100);
        let mut d2 = d1.clone();
        d2.columns = vec![("title".to_string(), serde_json::json!("b"))];
        let h1 = RowDelta::content_hash_id(&d1.table, &d1.row_id, d1.hlc, &d1.columns);
        let h2 = RowDelta::content_hash_id(&d2.table, &d2.row_id, d2.hlc, &d2.columns);
        assert_ne!(h1, h2);
    }

    #[test]
    fn column_lookup_finds_existing_and_missing() {
        let d = delta("x", 100);
        assert_eq!(d.column("title"), Some(&serde_json::json!("a")));
        assert_eq!(d.column("missing"), None);
    }
}
