//! LakeSync Gateway - multi-tenant HLC-ordered sync server core library.

pub mod adapter;
pub mod auth;
pub mod buffer;
pub mod config;
pub mod connector;
pub mod error;
pub mod gateway;
pub mod hlc;
pub mod http;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod poller;
pub mod quota;
pub mod rules;
pub mod server;
pub mod ws;

pub use error::{GatewayError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
