//! Sync gateway (C5): push/pull/flush/action orchestration and the
//! adapter/action-handler registries.

use crate::adapter::{ActionHandler, TableAdapter};
use crate::buffer::DeltaBuffer;
use crate::config::{ClusterMode, ClusteringConfig};
use crate::connector::PushTarget;
use crate::error::{GatewayError, Result};
use crate::hlc::{HlcClock, HlcTimestamp};
use crate::lock::LockStore;
use crate::metrics::Metrics;
use crate::model::{
    ActionBatch, ActionBatchResponse, ActionDescriptor, ActionResult, Claims, PullResponse,
    PushResponse, RowDelta,
};
use crate::persistence::Persistence;
use crate::rules::SyncRules;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

const MAX_DELTAS_PER_PUSH: usize = 10_000;
const FLUSH_LOCK_TTL: Duration = Duration::from_secs(30);

/// Fans an accepted push out to connected clients of one gateway, excluding
/// the submitter. Implemented by the WebSocket manager (C10), which serves
/// every configured gateway out of a single connection registry and uses
/// `gateway_id` to scope the fan-out to that gateway's own clients.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast(&self, gateway_id: &str, deltas: &[RowDelta], exclude_client_id: &str);
}

pub struct NoopBroadcaster;

#[async_trait]
impl Broadcaster for NoopBroadcaster {
    async fn broadcast(&self, _gateway_id: &str, _deltas: &[RowDelta], _exclude_client_id: &str) {}
}

pub struct SyncGateway {
    pub gateway_id: String,
    buffer: Arc<DeltaBuffer>,
    persistence: Arc<dyn Persistence>,
    clock: Arc<HlcClock>,
    rules: RwLock<SyncRules>,
    sources: DashMap<String, Arc<dyn TableAdapter>>,
    lake_adapter: RwLock<Option<Arc<dyn crate::adapter::LakeAdapter>>>,
    action_handlers: DashMap<String, (String, Arc<dyn ActionHandler>)>,
    /// C9 cross-instance write-through/merge target.
    shared_adapter: RwLock<Option<Arc<dyn TableAdapter>>>,
    /// C6 durable flush destination. May be the same adapter as
    /// `shared_adapter` in deployments that use one shared table for both
    /// roles, but the two are configured independently.
    flush_adapter: RwLock<Option<Arc<dyn TableAdapter>>>,
    cluster: ClusteringConfig,
    pub metrics: Arc<Metrics>,
    broadcaster: RwLock<Arc<dyn Broadcaster>>,
}

impl SyncGateway {
    pub fn new(
        gateway_id: String,
        buffer: Arc<DeltaBuffer>,
        persistence: Arc<dyn Persistence>,
        clock: Arc<HlcClock>,
        cluster: ClusteringConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            gateway_id,
            buffer,
            persistence,
            clock,
            rules: RwLock::new(SyncRules::default()),
            sources: DashMap::new(),
            lake_adapter: RwLock::new(None),
            action_handlers: DashMap::new(),
            shared_adapter: RwLock::new(None),
            flush_adapter: RwLock::new(None),
            cluster,
            metrics,
            broadcaster: RwLock::new(Arc::new(NoopBroadcaster)),
        }
    }

    pub fn set_broadcaster(&self, broadcaster: Arc<dyn Broadcaster>) {
        *self.broadcaster.write() = broadcaster;
    }

    pub fn set_sync_rules(&self, rules: SyncRules) {
        *self.rules.write() = rules;
    }

    pub fn sync_rules(&self) -> SyncRules {
        self.rules.read().clone()
    }

    pub fn set_lake_adapter(&self, adapter: Arc<dyn crate::adapter::LakeAdapter>) {
        *self.lake_adapter.write() = Some(adapter);
    }

    pub fn set_shared_adapter(&self, adapter: Arc<dyn TableAdapter>) {
        *self.shared_adapter.write() = Some(adapter);
    }

    pub fn set_flush_adapter(&self, adapter: Arc<dyn TableAdapter>) {
        *self.flush_adapter.write() = Some(adapter);
    }

    pub fn register_source(&self, name: impl Into<String>, adapter: Arc<dyn TableAdapter>) {
        self.sources.insert(name.into(), adapter);
    }

    pub fn unregister_source(&self, name: &str) {
        self.sources.remove(name);
    }

    pub fn register_action_handler(
        &self,
        connector: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) {
        let connector = connector.into();
        self.action_handlers
            .insert(connector.clone(), (connector, handler));
    }

    pub fn unregister_action_handler(&self, connector: &str) {
        self.action_handlers.remove(connector);
    }

    pub fn describe_actions(&self) -> HashMap<String, Vec<ActionDescriptor>> {
        self.action_handlers
            .iter()
            .map(|entry| {
                let (connector, handler) = entry.value();
                (connector.clone(), handler.supported_actions())
            })
            .collect()
    }

    /// Validates, persists, buffers, write-throughs, and broadcasts a push
    /// batch. `from_network` is `false` when the push originates from a
    /// source poller, so it is never broadcast back as a client echo check
    /// The excluded id is still the synthetic poller client id, which no
    /// real WS client can share.
    pub async fn handle_push(&self, client_id: &str, deltas: Vec<RowDelta>) -> Result<PushResponse> {
        let start = Instant::now();
        let result = self.handle_push_inner(client_id, deltas).await;
        self.metrics.push_latency_seconds.observe(start.elapsed().as_secs_f64());
        result
    }

    async fn handle_push_inner(&self, client_id: &str, deltas: Vec<RowDelta>) -> Result<PushResponse> {
        if client_id.is_empty() {
            self.metrics.push_total_error.inc();
            return Err(GatewayError::BadRequest("clientId is required".to_string()));
        }
        if deltas.len() > MAX_DELTAS_PER_PUSH {
            self.metrics.push_total_error.inc();
            return Err(GatewayError::BadRequest("too many deltas".to_string()));
        }

        // Persist before buffering so the sequence is indivisible for crash
        // recovery: a persisted-but-not-buffered delta is replayed and
        // deduplicated on restart; a buffered-but-not-persisted one can't
        // happen because persist failure aborts before this point.
        if let Err(err) = self.persistence.append_batch(&deltas).await {
            self.metrics.push_total_error.inc();
            return Err(err);
        }

        let outcome = self.buffer.append(deltas.clone()).await?;
        self.sync_buffer_gauges().await;

        if self.cluster.enabled {
            if let Some(adapter) = self.shared_adapter.read().clone() {
                if let Err(err) = adapter.insert_deltas(&deltas).await {
                    match self.cluster.mode {
                        ClusterMode::Eventual => {
                            warn!(gateway = %self.gateway_id, error = %err, "shared write-through failed (eventual mode)");
                        }
                        ClusterMode::Strong => {
                            self.metrics.push_total_error.inc();
                            return Err(GatewayError::Internal(format!(
                                "shared write-through failed: {err}"
                            )));
                        }
                    }
                }
            }
        }

        let broadcaster = self.broadcaster.read().clone();
        let accepted_deltas = deltas.clone();
        let exclude = client_id.to_string();
        let gateway_id = self.gateway_id.clone();
        tokio::spawn(async move {
            broadcaster.broadcast(&gateway_id, &accepted_deltas, &exclude).await;
        });

        self.metrics.push_total_ok.inc();
        Ok(PushResponse {
            accepted: outcome.accepted,
            server_hlc: outcome.server_hlc,
            deltas: None,
        })
    }

    pub async fn handle_pull(
        &self,
        since: HlcTimestamp,
        limit: usize,
        source: Option<&str>,
        claims: &Claims,
    ) -> Result<PullResponse> {
        let rules = self.rules.read().clone();

        let (deltas, server_hlc, has_more) = if let Some(source_name) = source {
            let adapter = self
                .sources
                .get(source_name)
                .ok_or_else(|| GatewayError::NotFound(format!("source {source_name}")))?
                .clone();
            let mut rows = adapter.query_deltas_since(since, None).await?;
            rows.sort_by_key(|d| d.hlc);
            let has_more = rows.len() > limit;
            rows.truncate(limit);
            let server_hlc = rows.last().map(|d| d.hlc).unwrap_or(since);
            (rows, server_hlc, has_more)
        } else if self.cluster.enabled {
            let (mut buffered, buffered_more) = self.buffer.query_since(since, limit).await;
            if let Some(adapter) = self.shared_adapter.read().clone() {
                let shared = adapter.query_deltas_since(since, None).await.unwrap_or_default();
                let mut seen: std::collections::HashSet<String> =
                    buffered.iter().map(|d| d.delta_id.clone()).collect();
                for delta in shared {
                    if seen.insert(delta.delta_id.clone()) {
                        buffered.push(delta);
                    }
                }
                buffered.sort_by_key(|d| d.hlc);
                buffered.truncate(limit);
                let server_hlc = buffered.last().map(|d| d.hlc).unwrap_or(since);
                // Per the clustering contract, a merged pull always reports
                // hasMore=true: the shared adapter may hold more than this
                // page regardless of what the local buffer alone would say.
                let _ = buffered_more;
                (buffered, server_hlc, true)
            } else {
                let server_hlc = buffered.last().map(|d| d.hlc).unwrap_or(since);
                (buffered, server_hlc, buffered_more)
            }
        } else {
            let (rows, has_more) = self.buffer.query_since(since, limit).await;
            let server_hlc = rows.last().map(|d| d.hlc).unwrap_or(since);
            (rows, server_hlc, has_more)
        };

        let filtered = crate::rules::filter_deltas(deltas, claims, &rules);
        self.metrics.pull_total_ok.inc();
        Ok(PullResponse {
            deltas: filtered,
            server_hlc,
            has_more,
        })
    }

    pub async fn handle_action(&self, batch: ActionBatch) -> ActionBatchResponse {
        let mut results = Vec::with_capacity(batch.actions.len());
        for action in batch.actions {
            let outcome = match self.action_handlers.get(&action.connector) {
                None => ActionResult::Error {
                    action_id: action.action_id,
                    code: "ACTION_NOT_SUPPORTED",
                    message: format!("unknown connector: {}", action.connector),
                },
                Some(entry) => {
                    let (_, handler) = entry.value();
                    match handler.execute_action(&action.action_type, action.params).await {
                        Ok(result) => ActionResult::Ok {
                            action_id: action.action_id,
                            result,
                        },
                        Err(err) => ActionResult::Error {
                            action_id: action.action_id,
                            code: match err {
                                crate::adapter::ActionExecutionError::NotSupported(_) => {
                                    "ACTION_NOT_SUPPORTED"
                                }
                                crate::adapter::ActionExecutionError::Failed(_) => "INTERNAL_ERROR",
                            },
                            message: err.to_string(),
                        },
                    }
                }
            };
            results.push(outcome);
        }
        ActionBatchResponse { results }
    }

    /// Buffer-level flush with no cross-instance coordination. Used directly
    /// in single-node mode; clustered deployments should go through
    /// `flush_with_lock`. Prefers a registered `TableAdapter` flush target;
    /// falls back to a registered `LakeAdapter`, serializing the batch as a
    /// single JSON object keyed by the batch's max HLC.
    pub async fn flush(&self) -> Result<usize> {
        let start = Instant::now();
        let result = if let Some(adapter) = self.flush_adapter.read().clone() {
            self.buffer.flush(adapter.as_ref(), self.persistence.as_ref()).await
        } else if let Some(lake) = self.lake_adapter.read().clone() {
            self.flush_to_lake(lake.as_ref()).await
        } else {
            Err(GatewayError::Internal(
                "no flush target adapter registered".to_string(),
            ))
        };
        self.metrics.flush_duration_seconds.observe(start.elapsed().as_secs_f64());

        match result {
            Ok(n) => {
                self.metrics.flush_total_ok.inc();
                self.sync_buffer_gauges().await;
                Ok(n)
            }
            Err(err) => {
                self.metrics.flush_total_error.inc();
                Err(err)
            }
        }
    }

    /// Refreshes the buffer-size gauges from the current buffer state.
    /// Called after every operation that mutates the buffer's contents.
    async fn sync_buffer_gauges(&self) {
        let stats = self.buffer.stats().await;
        self.metrics.buffer_bytes.set(stats.byte_size as f64);
        self.metrics.buffer_deltas.set(stats.log_size as f64);
    }

    async fn flush_to_lake(&self, lake: &dyn crate::adapter::LakeAdapter) -> Result<usize> {
        let snapshot = self.buffer.peek().await;
        if snapshot.is_empty() {
            return Ok(0);
        }
        let max_hlc = snapshot.iter().map(|d| d.hlc).max().unwrap_or(HlcTimestamp::ZERO);
        let key = format!("gateways/{}/batches/{}.json", self.gateway_id, max_hlc.as_u64());
        let bytes = serde_json::to_vec(&snapshot)?;
        lake.put_object(&key, &bytes).await?;
        self.buffer.clear().await;
        self.persistence.clear().await?;
        Ok(snapshot.len())
    }

    /// Acquires `flush:<gatewayId>` before flushing; if another instance
    /// holds it, the flush is skipped rather than retried immediately.
    pub async fn flush_with_lock(&self, lock: &dyn LockStore, holder_id: &str) -> Result<Option<usize>> {
        let key = format!("flush:{}", self.gateway_id);
        if !lock.acquire(&key, holder_id, FLUSH_LOCK_TTL).await {
            return Ok(None);
        }
        let result = self.flush().await;
        lock.release(&key, holder_id).await;
        result.map(Some)
    }

    /// Forwards to the registered flush-target `TableAdapter`'s schema
    /// setup; a lake-only deployment has nothing to ensure.
    pub async fn ensure_schema(&self) -> Result<()> {
        match self.flush_adapter.read().clone() {
            Some(adapter) => adapter.ensure_schema().await,
            None => Err(GatewayError::NotFound("no table adapter registered".to_string())),
        }
    }

    /// Replays the WAL into the in-memory buffer on startup. Returns the
    /// number of deltas replayed.
    pub async fn rehydrate(&self) -> Result<usize> {
        let deltas = self.persistence.load_all().await?;
        let count = deltas.len();
        if count > 0 {
            self.buffer.append(deltas).await?;
            self.sync_buffer_gauges().await;
        }
        Ok(count)
    }

    pub async fn stats(&self) -> crate::buffer::BufferStats {
        self.buffer.stats().await
    }

    /// Health-checks whichever adapter this gateway is configured to flush
    /// to, bounded by `timeout`: a table adapter gets a trivial query, a lake
    /// adapter a head-object call against a sentinel key. A gateway with no
    /// flush target configured has nothing to probe and reports ready.
    pub async fn check_ready(&self, timeout: Duration) -> bool {
        let flush_adapter = self.flush_adapter.read().clone();
        let lake_adapter = self.lake_adapter.read().clone();
        let probe = async move {
            if let Some(adapter) = flush_adapter {
                adapter.query_deltas_since(HlcTimestamp::ZERO, None).await.is_ok()
            } else if let Some(lake) = lake_adapter {
                match lake.head_object("__lakesync_ready_probe__").await {
                    Ok(_) => true,
                    Err(GatewayError::NotFound(_)) => true,
                    Err(_) => false,
                }
            } else {
                true
            }
        };
        tokio::time::timeout(timeout, probe).await.unwrap_or(false)
    }

    pub fn clock(&self) -> Arc<HlcClock> {
        self.clock.clone()
    }
}

#[async_trait]
impl PushTarget for SyncGateway {
    async fn ingest(&self, deltas: Vec<RowDelta>) {
        if deltas.is_empty() {
            return;
        }
        let client_id = deltas[0].client_id.clone();
        if let Err(err) = self.handle_push(&client_id, deltas).await {
            error!(gateway = %self.gateway_id, error = %err, "poller-originated push failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryTableAdapter;
    use crate::model::Op;
    use crate::persistence::MemoryPersistence;
    use std::collections::BTreeMap;

    fn delta(id: &str, hlc: u64, owner: &str) -> RowDelta {
        RowDelta {
            delta_id: id.to_string(),
            table: "todos".to_string(),
            row_id: format!("row-{id}"),
            client_id: "c1".to_string(),
            op: Op::Insert,
            columns: vec![("owner".to_string(), serde_json::json!(owner))],
            hlc: HlcTimestamp::from(hlc),
        }
    }

    fn claims(sub: &str) -> Claims {
        Claims {
            client_id: sub.to_string(),
            gateway_id: "gw-1".to_string(),
            role: crate::model::Role::Client,
            custom: BTreeMap::new(),
        }
    }

    fn new_gateway() -> SyncGateway {
        SyncGateway::new(
            "gw-1".to_string(),
            Arc::new(DeltaBuffer::new(Arc::new(HlcClock::new()), 4 * 1024 * 1024, 30_000)),
            Arc::new(MemoryPersistence::new()),
            Arc::new(HlcClock::new()),
            ClusteringConfig {
                enabled: false,
                mode: ClusterMode::Eventual,
            },
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn push_then_pull_returns_all_accepted_deltas() {
        let gateway = new_gateway();
        gateway
            .handle_push("c1", vec![delta("a", 100, "a")])
            .await
            .unwrap();
        let response = gateway
            .handle_pull(HlcTimestamp::from(0), 100, None, &claims("c2"))
            .await
            .unwrap();
        assert_eq!(response.deltas.len(), 1);
        assert!(response.server_hlc >= HlcTimestamp::from(100));
    }

    #[tokio::test]
    async fn push_rejects_empty_client_id() {
        let gateway = new_gateway();
        let result = gateway.handle_push("", vec![delta("a", 100, "a")]).await;
        assert!(matches!(result, Err(GatewayError::BadRequest(_))));
    }

    #[tokio::test]
    async fn push_rejects_oversize_batch() {
        let gateway = new_gateway();
        let batch: Vec<RowDelta> = (0..10_001)
            .map(|i| delta(&i.to_string(), i as u64, "a"))
            .collect();
        let result = gateway.handle_push("c1", batch).await;
        assert!(matches!(result, Err(GatewayError::BadRequest(_))));
        assert_eq!(gateway.stats().await.log_size, 0);
    }

    #[tokio::test]
    async fn pull_applies_sync_rules_per_claims() {
        let gateway = new_gateway();
        gateway.set_sync_rules(crate::rules::SyncRules {
            version: 1,
            buckets: vec![crate::rules::Bucket {
                name: "mine".to_string(),
                tables: vec!["todos".to_string()],
                filters: vec![crate::rules::Filter {
                    column: "owner".to_string(),
                    op: crate::rules::FilterOp::Eq,
                    value: serde_json::json!("claim:sub"),
                }],
            }],
        });
        gateway
            .handle_push("c1", vec![delta("a", 100, "b")])
            .await
            .unwrap();
        let as_a = gateway
            .handle_pull(HlcTimestamp::from(0), 100, None, &claims("a"))
            .await
            .unwrap();
        assert!(as_a.deltas.is_empty());
        let as_b = gateway
            .handle_pull(HlcTimestamp::from(0), 100, None, &claims("b"))
            .await
            .unwrap();
        assert_eq!(as_b.deltas.len(), 1);
    }

    #[tokio::test]
    async fn handle_action_reports_unknown_connector() {
        let gateway = new_gateway();
        let response = gateway
            .handle_action(ActionBatch {
                client_id: "c1".to_string(),
                actions: vec![crate::model::ActionRequest {
                    action_id: "a1".to_string(),
                    connector: "missing".to_string(),
                    action_type: "noop".to_string(),
                    params: serde_json::json!({}),
                    hlc: None,
                }],
            })
            .await;
        assert_eq!(response.results.len(), 1);
        assert!(matches!(
            &response.results[0],
            ActionResult::Error { code, .. } if *code == "ACTION_NOT_SUPPORTED"
        ));
    }

    #[tokio::test]
    async fn flush_drains_buffer_through_shared_adapter() {
        let gateway = new_gateway();
        let adapter: Arc<dyn TableAdapter> = Arc::new(InMemoryTableAdapter::new());
        gateway.set_flush_adapter(adapter.clone());
        gateway
            .handle_push("c1", vec![delta("a", 100, "a")])
            .await
            .unwrap();
        let flushed = gateway.flush().await.unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(gateway.stats().await.log_size, 0);
    }

    #[tokio::test]
    async fn flush_falls_back_to_lake_adapter_when_no_table_adapter_registered() {
        let gateway = new_gateway();
        let dir = tempfile::tempdir().unwrap();
        let lake: Arc<dyn crate::adapter::LakeAdapter> =
            Arc::new(crate::adapter::LocalFsLakeAdapter::new(dir.path().to_path_buf()).unwrap());
        gateway.set_lake_adapter(lake.clone());
        gateway
            .handle_push("c1", vec![delta("a", 100, "a")])
            .await
            .unwrap();
        let flushed = gateway.flush().await.unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(gateway.stats().await.log_size, 0);
        let listed = lake.list_objects("").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn flush_with_lock_skips_when_lock_held_elsewhere() {
        let gateway = new_gateway();
        let lock = crate::lock::InMemoryLockStore::new();
        lock.acquire("flush:gw-1", "other-instance", Duration::from_secs(30))
            .await;
        let result = gateway.flush_with_lock(&lock, "this-instance").await.unwrap();
        assert!(result.is_none());
    }
}
