//! Source poller (C7): cursor- and diff-based change detection loops that
//! turn an external data source into deltas injected as if from a synthetic
//! client.

use crate::hlc::HlcClock;
use crate::model::{ColumnValue, Op, RowDelta};
use crate::persistence::Persistence;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{error, warn};

/// One row as read from the external source: its identity, the raw
/// cursor-column value (cursor strategy only), and every other column.
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub row_id: String,
    pub cursor_value: Option<ColumnValue>,
    pub columns: BTreeMap<String, ColumnValue>,
}

/// Abstracts the concrete query execution a real SQL driver would perform.
/// Concrete drivers are out of scope for this crate.
#[async_trait]
pub trait PollSource: Send + Sync {
    /// Cursor strategy: `cursor_col > floor` ordered ascending by the
    /// cursor column. `floor` is `None` on the first poll (no predicate).
    async fn fetch_cursor(
        &self,
        table: &str,
        cursor_column: &str,
        floor: Option<&ColumnValue>,
    ) -> crate::error::Result<Vec<SourceRow>>;

    /// Diff strategy: the full current result set for the table.
    async fn fetch_all(&self, table: &str) -> crate::error::Result<Vec<SourceRow>>;
}

#[derive(Debug, Clone)]
pub enum PollStrategy {
    Cursor { column: String, lookback_ms: u64 },
    Diff,
}

#[derive(Debug, Clone)]
pub struct TableConfig {
    pub table: String,
    pub row_id_column: String,
    pub strategy: PollStrategy,
}

/// Per-table in-memory state carried between polls: the last-seen cursor
/// value (cursor strategy) and the previous row snapshot (used for column
/// diffing by both strategies).
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TableCursorState {
    pub cursor_value: Option<ColumnValue>,
    pub prior_rows: BTreeMap<String, BTreeMap<String, ColumnValue>>,
}

/// A connector-scoped cursor snapshot: table name -> its state. This is what
/// gets persisted via C2 and restored on restart.
pub type CursorSnapshot = BTreeMap<String, TableCursorState>;

const DIFF_SNAPSHOT_WARN_ROWS: usize = 1_000;

pub struct SourcePoller {
    connector_name: String,
    source: Arc<dyn PollSource>,
    tables: Vec<TableConfig>,
    interval: Duration,
    clock: HlcClock,
    state: parking_lot::Mutex<CursorSnapshot>,
    running: Arc<AtomicBool>,
    stop: Arc<Notify>,
    deltas_tx: mpsc::Sender<Vec<RowDelta>>,
    /// C2 cursor durability. `None` for tests and ephemeral connectors that
    /// don't need to survive a restart.
    persistence: Option<Arc<dyn Persistence>>,
}

impl SourcePoller {
    pub fn new(
        connector_name: String,
        source: Arc<dyn PollSource>,
        tables: Vec<TableConfig>,
        interval: Duration,
        initial_state: CursorSnapshot,
        deltas_tx: mpsc::Sender<Vec<RowDelta>>,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Self {
        Self {
            connector_name,
            source,
            tables,
            interval,
            clock: HlcClock::new(),
            state: parking_lot::Mutex::new(initial_state),
            running: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(Notify::new()),
            deltas_tx,
            persistence,
        }
    }

    /// Restores a connector's last cursor snapshot from C2, for passing as
    /// `initial_state` to `new` on (re)start. Absent or corrupt state is
    /// treated as a first run rather than an error.
    pub async fn load_initial_state(
        connector_name: &str,
        persistence: &dyn Persistence,
    ) -> CursorSnapshot {
        match persistence.load_cursor(connector_name).await {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_default(),
            Ok(None) => CursorSnapshot::default(),
            Err(err) => {
                warn!(connector = %connector_name, error = %err, "failed to load poller cursor, starting fresh");
                CursorSnapshot::default()
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        self.state.lock().clone()
    }

    async fn persist_cursor(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let snapshot = self.snapshot();
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(err) => {
                warn!(connector = %self.connector_name, error = %err, "failed to serialize poller cursor");
                return;
            }
        };
        if let Err(err) = persistence.save_cursor(&self.connector_name, &json).await {
            warn!(connector = %self.connector_name, error = %err, "failed to persist poller cursor");
        }
    }

    /// Idempotent: a second `start()` while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                this.poll_once().await;
                if !this.running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(this.interval) => {}
                    _ = this.stop.notified() => break,
                }
            }
        });
    }

    /// Idempotent: stopping an already-stopped poller is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
    }

    /// Runs every configured table once, in sequence. Per-table errors are
    /// caught and logged, never propagated to the caller.
    pub async fn poll_once(&self) {
        for table in &self.tables {
            if let Err(err) = self.poll_table(table).await {
                error!(
                    connector = %self.connector_name,
                    table = %table.table,
                    error = %err,
                    "poller tick failed for table"
                );
            }
        }
        self.persist_cursor().await;
    }

    async fn poll_table(&self, table: &TableConfig) -> crate::error::Result<()> {
        let prior_state = {
            let state = self.state.lock();
            state.get(&table.table).cloned().unwrap_or_default()
        };

        let (rows, new_cursor) = match &table.strategy {
            PollStrategy::Cursor { column, lookback_ms } => {
                let floor = prior_state
                    .cursor_value
                    .as_ref()
                    .and_then(|v| apply_lookback(v, *lookback_ms));
                let rows = self
                    .source
                    .fetch_cursor(&table.table, column, floor.as_ref())
                    .await?;
                let new_cursor = rows
                    .iter()
                    .filter_map(|r| r.cursor_value.clone())
                    .fold(prior_state.cursor_value.clone(), |acc, v| {
                        Some(max_column_value(acc, v))
                    });
                (rows, new_cursor)
            }
            PollStrategy::Diff => {
                let rows = self.source.fetch_all(&table.table).await?;
                if rows.len() > DIFF_SNAPSHOT_WARN_ROWS {
                    warn!(
                        connector = %self.connector_name,
                        table = %table.table,
                        rows = rows.len(),
                        "diff snapshot exceeds 1000 rows"
                    );
                }
                (rows, None)
            }
        };

        let mut deltas = Vec::new();
        let mut next_prior = prior_state.prior_rows.clone();

        match &table.strategy {
            PollStrategy::Cursor { .. } => {
                for row in &rows {
                    let prior = next_prior.get(&row.row_id);
                    if let Some(delta) = self.diff_to_delta(table, prior, Some(row))? {
                        deltas.push(delta);
                    }
                    next_prior.insert(row.row_id.clone(), row.columns.clone());
                }
            }
            PollStrategy::Diff => {
                let current: BTreeMap<String, &SourceRow> =
                    rows.iter().map(|r| (r.row_id.clone(), r)).collect();

                for row in &rows {
                    let prior = next_prior.get(&row.row_id);
                    if let Some(delta) = self.diff_to_delta(table, prior, Some(row))? {
                        deltas.push(delta);
                    }
                }
                let deleted_ids: Vec<String> = next_prior
                    .keys()
                    .filter(|id| !current.contains_key(*id))
                    .cloned()
                    .collect();
                for row_id in &deleted_ids {
                    let delta = self.make_delta(table, row_id, Op::Delete, Vec::new())?;
                    deltas.push(delta);
                }
                next_prior = current
                    .into_iter()
                    .map(|(id, row)| (id, row.columns.clone()))
                    .collect();
            }
        }

        {
            let mut state = self.state.lock();
            state.insert(
                table.table.clone(),
                TableCursorState {
                    cursor_value: new_cursor.or(prior_state.cursor_value),
                    prior_rows: next_prior,
                },
            );
        }

        if !deltas.is_empty() && self.deltas_tx.send(deltas).await.is_err() {
            warn!(connector = %self.connector_name, "poller delta channel closed");
        }
        Ok(())
    }

    fn diff_to_delta(
        &self,
        table: &TableConfig,
        prior: Option<&BTreeMap<String, ColumnValue>>,
        current: Option<&SourceRow>,
    ) -> crate::error::Result<Option<RowDelta>> {
        let Some(row) = current else {
            return Ok(None);
        };
        let (op, changed_columns) = match prior {
            None => (Op::Insert, row.columns.clone().into_iter().collect()),
            Some(prior_cols) => {
                let changed: Vec<(String, ColumnValue)> = row
                    .columns
                    .iter()
                    .filter(|(k, v)| prior_cols.get(*k) != Some(*v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                if changed.is_empty() {
                    return Ok(None);
                }
                (Op::Update, changed)
            }
        };
        Ok(Some(self.make_delta(table, &row.row_id, op, changed_columns)?))
    }

    fn make_delta(
        &self,
        table: &TableConfig,
        row_id: &str,
        op: Op,
        columns: Vec<(String, ColumnValue)>,
    ) -> crate::error::Result<RowDelta> {
        let hlc = self.clock.now()?;
        let delta_id = RowDelta::content_hash_id(&table.table, row_id, hlc, &columns);
        Ok(RowDelta {
            delta_id,
            table: table.table.clone(),
            row_id: row_id.to_string(),
            client_id: format!("poller:{}", self.connector_name),
            op,
            columns,
            hlc,
        })
    }
}

fn apply_lookback(value: &ColumnValue, lookback_ms: u64) -> Option<ColumnValue> {
    value
        .as_u64()
        .map(|v| serde_json::json!(v.saturating_sub(lookback_ms)))
        .or_else(|| value.as_i64().map(|v| serde_json::json!(v - lookback_ms as i64)))
        .or(Some(value.clone()))
}

fn max_column_value(a: Option<ColumnValue>, b: ColumnValue) -> ColumnValue {
    match a {
        None => b,
        Some(a) => match (a.as_f64(), b.as_f64()) {
            (Some(af), Some(bf)) => {
                if bf > af {
                    b
                } else {
                    a
                }
            }
            _ => b,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FixtureSource {
        rows: StdMutex<Vec<SourceRow>>,
    }

    #[async_trait]
    impl PollSource for FixtureSource {
        async fn fetch_cursor(
            &self,
            _table: &str,
            _column: &str,
            floor: Option<&ColumnValue>,
        ) -> crate::error::Result<Vec<SourceRow>> {
            let rows = self.rows.lock().unwrap();
            let floor_val = floor.and_then(|v| v.as_i64()).unwrap_or(i64::MIN);
            Ok(rows
                .iter()
                .filter(|r| r.cursor_value.as_ref().and_then(|v| v.as_i64()).unwrap_or(0) > floor_val)
                .cloned()
                .collect())
        }

        async fn fetch_all(&self, _table: &str) -> crate::error::Result<Vec<SourceRow>> {
            Ok(self.rows.lock().unwrap().clone())
        }
    }

    fn row(id: &str, updated_at: i64, title: &str) -> SourceRow {
        let mut columns = BTreeMap::new();
        columns.insert("title".to_string(), serde_json::json!(title));
        SourceRow {
            row_id: id.to_string(),
            cursor_value: Some(serde_json::json!(updated_at)),
            columns,
        }
    }

    fn table_config() -> TableConfig {
        TableConfig {
            table: "todos".to_string(),
            row_id_column: "id".to_string(),
            strategy: PollStrategy::Cursor {
                column: "updated_at".to_string(),
                lookback_ms: 0,
            },
        }
    }

    #[tokio::test]
    async fn first_cursor_poll_emits_inserts_for_every_row() {
        let source = Arc::new(FixtureSource {
            rows: StdMutex::new(vec![row("1", 1000, "a"), row("2", 2000, "b")]),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let poller = SourcePoller::new(
            "fixture".to_string(),
            source,
            vec![table_config()],
            Duration::from_secs(60),
            CursorSnapshot::default(),
            tx,
            None,
        );
        poller.poll_once().await;
        let deltas = rx.try_recv().unwrap();
        assert_eq!(deltas.len(), 2);
        assert!(deltas.iter().all(|d| d.op == Op::Insert));
    }

    #[tokio::test]
    async fn second_cursor_poll_emits_only_new_row() {
        let source = Arc::new(FixtureSource {
            rows: StdMutex::new(vec![row("1", 1000, "a"), row("2", 2000, "b")]),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let poller = Arc::new(SourcePoller::new(
            "fixture".to_string(),
            source.clone(),
            vec![table_config()],
            Duration::from_secs(60),
            CursorSnapshot::default(),
            tx,
            None,
        ));
        poller.poll_once().await;
        rx.try_recv().unwrap();

        source.rows.lock().unwrap().push(row("3", 3000, "c"));
        poller.poll_once().await;
        let deltas = rx.try_recv().unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].row_id, "3");
    }

    #[tokio::test]
    async fn cursor_poll_with_no_source_changes_produces_zero_deltas() {
        let source = Arc::new(FixtureSource {
            rows: StdMutex::new(vec![row("1", 1000, "a")]),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let poller = Arc::new(SourcePoller::new(
            "fixture".to_string(),
            source,
            vec![table_config()],
            Duration::from_secs(60),
            CursorSnapshot::default(),
            tx,
            None,
        ));
        poller.poll_once().await;
        rx.try_recv().unwrap();
        poller.poll_once().await;
        assert!(rx.try_recv().is_err());
    }

    fn diff_table_config() -> TableConfig {
        TableConfig {
            table: "todos".to_string(),
            row_id_column: "id".to_string(),
            strategy: PollStrategy::Diff,
        }
    }

    #[tokio::test]
    async fn diff_poll_detects_insert_update_and_delete() {
        let source = Arc::new(FixtureSource {
            rows: StdMutex::new(vec![row("1", 0, "a"), row("2", 0, "b")]),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let poller = Arc::new(SourcePoller::new(
            "fixture".to_string(),
            source.clone(),
            vec![diff_table_config()],
            Duration::from_secs(60),
            CursorSnapshot::default(),
            tx,
            None,
        ));
        poller.poll_once().await;
        let first = rx.try_recv().unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|d| d.op == Op::Insert));

        {
            let mut rows = source.rows.lock().unwrap();
            rows[0] = row("1", 0, "a-changed");
            rows.remove(1);
            rows.push(row("3", 0, "c"));
        }
        poller.poll_once().await;
        let second = rx.try_recv().unwrap();
        assert_eq!(second.len(), 3);
        assert!(second.iter().any(|d| d.op == Op::Update && d.row_id == "1"));
        assert!(second.iter().any(|d| d.op == Op::Delete && d.row_id == "2"));
        assert!(second.iter().any(|d| d.op == Op::Insert && d.row_id == "3"));
    }

    #[tokio::test]
    async fn diff_poll_with_identical_snapshots_produces_zero_deltas() {
        let source = Arc::new(FixtureSource {
            rows: StdMutex::new(vec![row("1", 0, "a")]),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let poller = Arc::new(SourcePoller::new(
            "fixture".to_string(),
            source,
            vec![diff_table_config()],
            Duration::from_secs(60),
            CursorSnapshot::default(),
            tx,
            None,
        ));
        poller.poll_once().await;
        rx.try_recv().unwrap();
        poller.poll_once().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_stop_is_idempotent() {
        let source = Arc::new(FixtureSource {
            rows: StdMutex::new(vec![]),
        });
        let (tx, _rx) = mpsc::channel(8);
        let poller = Arc::new(SourcePoller::new(
            "fixture".to_string(),
            source,
            vec![table_config()],
            Duration::from_millis(10),
            CursorSnapshot::default(),
            tx,
            None,
        ));
        poller.start();
        poller.start();
        assert!(poller.is_running());
        poller.stop();
        poller.stop();
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn cursor_survives_a_restart_via_persistence() {
        use crate::persistence::MemoryPersistence;

        let source = Arc::new(FixtureSource {
            rows: StdMutex::new(vec![row("1", 1000, "a"), row("2", 2000, "b")]),
        });
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let (tx, mut rx) = mpsc::channel(8);
        let poller = SourcePoller::new(
            "fixture".to_string(),
            source.clone(),
            vec![table_config()],
            Duration::from_secs(60),
            CursorSnapshot::default(),
            tx,
            Some(persistence.clone()),
        );
        poller.poll_once().await;
        rx.try_recv().unwrap();
        let before_restart = poller.snapshot();

        let restored = SourcePoller::load_initial_state("fixture", persistence.as_ref()).await;
        assert_eq!(
            restored.get("todos").and_then(|t| t.cursor_value.clone()),
            before_restart.get("todos").and_then(|t| t.cursor_value.clone())
        );

        let (tx2, _rx2) = mpsc::channel(8);
        let restarted = SourcePoller::new(
            "fixture".to_string(),
            source,
            vec![table_config()],
            Duration::from_secs(60),
            restored,
            tx2,
            Some(persistence),
        );
        assert_eq!(restarted.snapshot(), before_restart);
    }
}
