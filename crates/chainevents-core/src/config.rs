//! Event-service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::publish::SendPolicy;
use crate::error::EventError;
use crate::logging::LogConfig;

/// Peer-selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolverStrategy {
    Balanced,
    #[default]
    MinBlockHeight,
    PreferOrg,
    PreferPeer,
}

/// Final pick among eligible peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    #[default]
    RoundRobin,
    Random,
}

/// Everything the event service can be tuned with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventServiceConfig {
    /// Capacity of each subscriber channel and of the dispatcher queue.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Publish timeout: negative drops on a full channel, 0 blocks, positive waits that long.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: i64,
    /// Connect attempts per `connect` call (0 = unbounded).
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Reconnect attempts after a lost connection (0 = unbounded).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "bool_true")]
    pub reconnect: bool,
    #[serde(default)]
    pub reconnect_initial_delay_ms: u64,
    /// Delay between attempts; values under one second are raised to one second.
    #[serde(default = "default_time_between_connect_attempts_ms")]
    pub time_between_connect_attempts_ms: u64,
    /// How long to wait for the dispatcher to answer a connect.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub resolver_strategy: ResolverStrategy,
    #[serde(default)]
    pub balancer: BalancerKind,
    #[serde(default = "default_block_height_lag_threshold")]
    pub block_height_lag_threshold: i64,
    #[serde(default = "default_reconnect_block_height_lag_threshold")]
    pub reconnect_block_height_lag_threshold: i64,
    /// How often the connected peer is re-evaluated (0 disables).
    #[serde(default = "default_peer_monitor_period_ms")]
    pub peer_monitor_period_ms: u64,
    /// Peer URLs for the `prefer_peer` strategy.
    #[serde(default)]
    pub preferred_peers: Vec<String>,
    /// Local organization for the `prefer_org` strategy.
    #[serde(default)]
    pub msp_id: String,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_buffer_size() -> usize { 100 }
fn default_send_timeout_ms() -> i64 { 500 }
fn default_max_connect_attempts() -> u32 { 1 }
fn bool_true() -> bool { true }
fn default_time_between_connect_attempts_ms() -> u64 { 5_000 }
fn default_response_timeout_ms() -> u64 { 5_000 }
fn default_block_height_lag_threshold() -> i64 { 5 }
fn default_reconnect_block_height_lag_threshold() -> i64 { 10 }
fn default_peer_monitor_period_ms() -> u64 { 5_000 }

pub const MIN_TIME_BETWEEN_CONNECT_ATTEMPTS: Duration = Duration::from_secs(1);

impl Default for EventServiceConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            send_timeout_ms: default_send_timeout_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            max_reconnect_attempts: 0,
            reconnect: true,
            reconnect_initial_delay_ms: 0,
            time_between_connect_attempts_ms: default_time_between_connect_attempts_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            resolver_strategy: ResolverStrategy::default(),
            balancer: BalancerKind::default(),
            block_height_lag_threshold: default_block_height_lag_threshold(),
            reconnect_block_height_lag_threshold: default_reconnect_block_height_lag_threshold(),
            peer_monitor_period_ms: default_peer_monitor_period_ms(),
            preferred_peers: vec![],
            msp_id: String::new(),
            log: LogConfig::default(),
        }
    }
}

impl EventServiceConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EventError> {
        if self.buffer_size == 0 {
            return Err(EventError::Config("buffer_size must be greater than 0".into()));
        }
        if self.resolver_strategy == ResolverStrategy::PreferOrg && self.msp_id.is_empty() {
            return Err(EventError::Config("prefer_org strategy requires msp_id".into()));
        }
        if self.resolver_strategy == ResolverStrategy::PreferPeer && self.preferred_peers.is_empty() {
            return Err(EventError::Config("prefer_peer strategy requires preferred_peers".into()));
        }
        self.log.validate()
    }

    pub fn send_policy(&self) -> SendPolicy {
        SendPolicy::from_millis(self.send_timeout_ms)
    }

    pub fn time_between_connect_attempts(&self) -> Duration {
        Duration::from_millis(self.time_between_connect_attempts_ms)
            .max(MIN_TIME_BETWEEN_CONNECT_ATTEMPTS)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn peer_monitor_period(&self) -> Duration {
        Duration::from_millis(self.peer_monitor_period_ms)
    }
}
