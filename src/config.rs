//! Gateway configuration (A2): environment-driven with validated defaults,
//! optionally overridden by a TOML file.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    Eventual,
    Strong,
}

impl Default for ClusterMode {
    fn default() -> Self {
        ClusterMode::Eventual
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    pub enabled: bool,
    pub mode: ClusterMode,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ClusterMode::default(),
        }
    }
}

/// Resource caps from the "Resource caps" section of the design doc. All
/// fields have the documented defaults and are individually overridable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub listen_addr: String,
    pub data_dir: PathBuf,

    /// HS256 verification secret. `None` disables auth entirely (every
    /// route unauthenticated), matching the documented fallback behavior.
    pub jwt_secret: Option<String>,
    /// Gateway IDs this instance serves; requests to any other gateway id
    /// are rejected with a gateway mismatch.
    pub gateway_ids: Vec<String>,

    pub cluster: ClusteringConfig,

    pub ws_max_connections: usize,
    pub ws_max_messages_per_second: u32,
    pub http_max_requests_per_minute: u32,
    pub max_push_payload_bytes: usize,
    pub max_deltas_per_push: usize,

    pub flush_interval: Duration,
    pub flush_timeout: Duration,
    pub max_buffer_bytes: usize,
    pub max_buffer_age: Duration,

    pub request_timeout: Duration,
    pub drain_timeout: Duration,
    pub readiness_probe_timeout: Duration,

    pub cors_allowed_origins: Vec<String>,

    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("./data"),
            jwt_secret: None,
            gateway_ids: Vec::new(),
            cluster: ClusteringConfig::default(),
            ws_max_connections: 1_000,
            ws_max_messages_per_second: 50,
            http_max_requests_per_minute: 100,
            max_push_payload_bytes: 1024 * 1024,
            max_deltas_per_push: 10_000,
            flush_interval: Duration::from_secs(30),
            flush_timeout: Duration::from_secs(30),
            max_buffer_bytes: 4 * 1024 * 1024,
            max_buffer_age: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            readiness_probe_timeout: Duration::from_secs(5),
            cors_allowed_origins: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Loads defaults, applies an optional TOML file, then applies
    /// `LAKESYNC_`-prefixed environment variables on top. Env wins, matching
    /// the usual twelve-factor override order.
    pub fn load(toml_path: Option<&std::path::Path>) -> crate::error::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = toml_path {
            let text = std::fs::read_to_string(path)?;
            config = toml::from_str(&text)
                .map_err(|e| crate::error::GatewayError::Internal(format!("invalid config file: {e}")))?;
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LAKESYNC_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("LAKESYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LAKESYNC_JWT_SECRET") {
            self.jwt_secret = Some(v);
        }
        if let Ok(v) = std::env::var("LAKESYNC_GATEWAY_IDS") {
            self.gateway_ids = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("LAKESYNC_CLUSTER_ENABLED") {
            self.cluster.enabled = parse_bool(&v, self.cluster.enabled);
        }
        if let Ok(v) = std::env::var("LAKESYNC_CLUSTER_MODE") {
            self.cluster.mode = match v.to_ascii_lowercase().as_str() {
                "strong" => ClusterMode::Strong,
                _ => ClusterMode::Eventual,
            };
        }
        if let Ok(v) = std::env::var("LAKESYNC_WS_MAX_CONNECTIONS") {
            self.ws_max_connections = parse_or(&v, self.ws_max_connections);
        }
        if let Ok(v) = std::env::var("LAKESYNC_WS_MAX_MSG_PER_SEC") {
            self.ws_max_messages_per_second = parse_or(&v, self.ws_max_messages_per_second);
        }
        if let Ok(v) = std::env::var("LAKESYNC_HTTP_MAX_REQ_PER_MIN") {
            self.http_max_requests_per_minute = parse_or(&v, self.http_max_requests_per_minute);
        }
        if let Ok(v) = std::env::var("LAKESYNC_MAX_PUSH_PAYLOAD_BYTES") {
            self.max_push_payload_bytes = parse_or(&v, self.max_push_payload_bytes);
        }
        if let Ok(v) = std::env::var("LAKESYNC_MAX_DELTAS_PER_PUSH") {
            self.max_deltas_per_push = parse_or(&v, self.max_deltas_per_push);
        }
        if let Ok(v) = std::env::var("LAKESYNC_FLUSH_INTERVAL_SECS") {
            self.flush_interval = Duration::from_secs(parse_or(&v, self.flush_interval.as_secs()));
        }
        if let Ok(v) = std::env::var("LAKESYNC_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn validate(&self) -> crate::error::Result<()> {
        if self.max_deltas_per_push == 0 {
            return Err(crate::error::GatewayError::Internal(
                "max_deltas_per_push must be > 0".to_string(),
            ));
        }
        if self.ws_max_connections == 0 {
            return Err(crate::error::GatewayError::Internal(
                "ws_max_connections must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(v: &str, default: bool) -> bool {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_or<T: std::str::FromStr>(v: &str, default: T) -> T {
    v.parse().unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply_on_top_of_defaults() {
        std::env::set_var("LAKESYNC_WS_MAX_CONNECTIONS", "42");
        let mut config = GatewayConfig::default();
        config.apply_env();
        assert_eq!(config.ws_max_connections, 42);
        std::env::remove_var("LAKESYNC_WS_MAX_CONNECTIONS");
    }
}
