//! WebSocket manager (C10): upgrade handling, the framed binary protocol,
//! broadcast fan-out, and per-connection rate limiting.

use crate::gateway::{Broadcaster, SyncGateway};
use crate::hlc::HlcTimestamp;
use crate::metrics::Metrics;
use crate::model::{Claims, PullQuery, PushRequest, RowDelta};
use crate::rules;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

pub const TAG_PUSH: u8 = 0x01;
pub const TAG_PULL: u8 = 0x02;
pub const TAG_BROADCAST: u8 = 0x10;

pub const CLOSE_MALFORMED: u16 = 1002;
pub const CLOSE_POLICY: u16 = 1008;
pub const CLOSE_SERVER_SHUTDOWN: u16 = 1001;

/// Decodes a framed WS message: 1-byte tag + length-prefixed payload (the
/// length prefix is implicit in `bytes`' own length since axum already
/// frames at the WebSocket-message level; the payload is simply everything
/// after the tag byte).
pub fn decode_frame(bytes: &[u8]) -> Option<(u8, &[u8])> {
    bytes.split_first().map(|(tag, rest)| (*tag, rest))
}

pub fn encode_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(tag);
    out.extend_from_slice(payload);
    out
}

/// Fixed 1-second window per-connection message counter.
struct RateLimiter {
    max_per_window: u32,
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    fn new(max_per_window: u32) -> Self {
        Self {
            max_per_window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// `true` if the message is within budget; resets the window when a
    /// full second has elapsed.
    fn allow(&mut self) -> bool {
        if self.window_start.elapsed() >= Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.count = 0;
        }
        if self.count >= self.max_per_window {
            return false;
        }
        self.count += 1;
        true
    }
}

struct Connection {
    gateway_id: String,
    client_id: String,
    claims: Claims,
    sender: mpsc::Sender<Vec<u8>>,
}

/// Live WS connection registry plus the `Broadcaster` implementation,
/// shared across every configured gateway and partitioned by `gateway_id`
/// so one gateway's push never fans out to another's clients.
#[derive(Clone)]
pub struct WsManager {
    connections: Arc<DashMap<u64, Connection>>,
    next_id: Arc<AtomicU64>,
    max_connections: usize,
    /// Weak to avoid a reference cycle: each gateway holds this manager as
    /// its `Broadcaster`, and the manager needs the gateways back only to
    /// read their current sync rules when fanning out a broadcast.
    gateways: Arc<DashMap<String, Weak<SyncGateway>>>,
    metrics: Arc<Metrics>,
}

impl WsManager {
    pub fn new(max_connections: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            max_connections,
            gateways: Arc::new(DashMap::new()),
            metrics,
        }
    }

    /// Called once per gateway after it is constructed, so broadcast can
    /// read its sync rules without holding a strong cycle.
    pub fn bind_gateway(&self, gateway: &Arc<SyncGateway>) {
        self.gateways
            .insert(gateway.gateway_id.clone(), Arc::downgrade(gateway));
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn at_capacity(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Registers a connection and returns its id plus a channel the send
    /// loop should forward to the socket.
    fn register(&self, gateway_id: String, client_id: String, claims: Claims) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(256);
        self.connections.insert(
            id,
            Connection {
                gateway_id,
                client_id,
                claims,
                sender: tx,
            },
        );
        self.metrics.ws_connections.inc();
        (id, rx)
    }

    fn unregister(&self, id: u64) {
        if self.connections.remove(&id).is_some() {
            self.metrics.ws_connections.dec();
        }
    }

    /// Runs a single upgraded WebSocket connection end to end: framed
    /// request/response plus rate limiting. Exits on close, decode error, or
    /// rate-limit violation.
    pub async fn handle_socket(
        &self,
        mut socket: WebSocket,
        gateway: Arc<SyncGateway>,
        client_id: String,
        claims: Claims,
        messages_per_second: u32,
    ) {
        if self.at_capacity() {
            let _ = socket
                .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: CLOSE_POLICY,
                    reason: "connection cap reached".into(),
                })))
                .await;
            return;
        }

        let (id, mut outbound) = self.register(gateway.gateway_id.clone(), client_id.clone(), claims.clone());
        let mut limiter = RateLimiter::new(messages_per_second);

        loop {
            tokio::select! {
                outgoing = outbound.recv() => {
                    match outgoing {
                        Some(bytes) => {
                            if socket.send(Message::Binary(bytes.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                incoming = socket.recv() => {
                    let Some(incoming) = incoming else { break };
                    let Ok(message) = incoming else { break };
                    match message {
                        Message::Binary(bytes) => {
                            if !limiter.allow() {
                                let _ = socket.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                    code: CLOSE_POLICY,
                                    reason: "rate limit exceeded".into(),
                                }))).await;
                                break;
                            }
                            match self.dispatch(&bytes, &gateway, &claims).await {
                                Ok(Some(response)) => {
                                    if socket.send(Message::Binary(response.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(close_code) => {
                                    let _ = socket.send(Message::Close(Some(axum::extract::ws::CloseFrame {
                                        code: close_code,
                                        reason: "".into(),
                                    }))).await;
                                    break;
                                }
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        self.unregister(id);
    }

    async fn dispatch(
        &self,
        bytes: &[u8],
        gateway: &Arc<SyncGateway>,
        claims: &Claims,
    ) -> Result<Option<Vec<u8>>, u16> {
        let Some((tag, payload)) = decode_frame(bytes) else {
            return Err(CLOSE_MALFORMED);
        };
        match tag {
            TAG_PUSH => {
                let request: PushRequest =
                    serde_json::from_slice(payload).map_err(|_| CLOSE_MALFORMED)?;
                let response = gateway
                    .handle_push(&request.client_id, request.deltas)
                    .await
                    .map_err(|_| CLOSE_POLICY)?;
                let body = serde_json::to_vec(&response).map_err(|_| CLOSE_MALFORMED)?;
                Ok(Some(body))
            }
            TAG_PULL => {
                let query: PullQuery = serde_json::from_slice(payload).map_err(|_| CLOSE_MALFORMED)?;
                let limit = query.limit.unwrap_or(10_000).min(10_000);
                let response = gateway
                    .handle_pull(
                        HlcTimestamp::from(query.since),
                        limit,
                        query.source.as_deref(),
                        claims,
                    )
                    .await
                    .map_err(|_| CLOSE_POLICY)?;
                let body = serde_json::to_vec(&response).map_err(|_| CLOSE_MALFORMED)?;
                Ok(Some(body))
            }
            _ => Err(CLOSE_MALFORMED),
        }
    }
}

#[async_trait]
impl Broadcaster for WsManager {
    /// Enumerates connections excluding the sender, applies each
    /// connection's own sync-rule filter, and sends best-effort; a full or
    /// closed channel just drops that delta for that connection.
    async fn broadcast(&self, gateway_id: &str, deltas: &[RowDelta], exclude_client_id: &str) {
        if deltas.is_empty() {
            return;
        }
        let rules = self
            .gateways
            .get(gateway_id)
            .and_then(|entry| entry.upgrade())
            .map(|gw| gw.sync_rules());

        let mut dead = VecDeque::new();
        for entry in self.connections.iter() {
            let (id, conn) = (*entry.key(), entry.value());
            if conn.gateway_id != gateway_id || conn.client_id == exclude_client_id {
                continue;
            }
            let visible: Vec<&RowDelta> = match &rules {
                Some(rules) => deltas
                    .iter()
                    .filter(|d| rules::is_allowed(d, &conn.claims, rules))
                    .collect(),
                None => deltas.iter().collect(),
            };
            if visible.is_empty() {
                continue;
            }
            let payload = serde_json::to_vec(&visible).unwrap_or_default();
            let frame = encode_frame(TAG_BROADCAST, &payload);
            if conn.sender.try_send(frame).is_err() {
                dead.push_back(id);
            }
        }
        for id in dead {
            if let Some((_, conn)) = self.connections.remove(&id) {
                warn!(client_id = %conn.client_id, "dropped dead websocket connection during broadcast");
            }
        }
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new(1_000, Arc::new(Metrics::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_tag_and_payload() {
        let encoded = encode_frame(TAG_PUSH, b"hello");
        let (tag, payload) = decode_frame(&encoded).unwrap();
        assert_eq!(tag, TAG_PUSH);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn decode_empty_frame_is_none() {
        assert!(decode_frame(&[]).is_none());
    }

    #[test]
    fn rate_limiter_blocks_after_budget_exhausted() {
        let mut limiter = RateLimiter::new(2);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }

    #[test]
    fn rate_limiter_resets_after_window() {
        let mut limiter = RateLimiter::new(1);
        assert!(limiter.allow());
        limiter.window_start = Instant::now() - Duration::from_secs(2);
        assert!(limiter.allow());
    }

    #[test]
    fn manager_reports_capacity() {
        let manager = WsManager::new(1, Arc::new(Metrics::new()));
        assert!(!manager.at_capacity());
        let (_id, _rx) = manager.register(
            "gw-1".to_string(),
            "c1".to_string(),
            Claims {
                client_id: "c1".to_string(),
                gateway_id: "gw-1".to_string(),
                role: crate::model::Role::Client,
                custom: Default::default(),
            },
        );
        assert!(manager.at_capacity());
    }
}
