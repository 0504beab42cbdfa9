//! Client options.

use std::time::Duration;

use tokio::sync::mpsc;

use chainevents_core::config::MIN_TIME_BETWEEN_CONNECT_ATTEMPTS;
use chainevents_core::{ConnectionEvent, EventServiceConfig};

use crate::retry::{RetryConfig, RetryPolicy};

/// Options controlling how a [`Client`](crate::Client) connects and reconnects.
#[derive(Debug, Clone)]
pub struct ClientParams {
    /// Whether the caller may register for full blocks.
    pub permit_block_events: bool,
    /// Reconnect automatically after an unsolicited, non-fatal disconnect.
    pub reconnect: bool,
    /// Attempts per `connect` call (0 = unbounded).
    pub max_connect_attempts: u32,
    /// Attempts per reconnect (0 = unbounded).
    pub max_reconnect_attempts: u32,
    pub reconnect_initial_delay: Duration,
    /// Pause between attempts, never below one second.
    pub time_between_connect_attempts: Duration,
    /// How long a single connect attempt may wait for the dispatcher.
    pub response_timeout: Duration,
    /// Receives a copy of every connection event.
    pub connection_events: Option<mpsc::Sender<ConnectionEvent>>,
}

impl Default for ClientParams {
    fn default() -> Self {
        Self::from(&EventServiceConfig::default())
    }
}

impl From<&EventServiceConfig> for ClientParams {
    fn from(config: &EventServiceConfig) -> Self {
        Self {
            permit_block_events: false,
            reconnect: config.reconnect,
            max_connect_attempts: config.max_connect_attempts,
            max_reconnect_attempts: config.max_reconnect_attempts,
            reconnect_initial_delay: config.reconnect_initial_delay(),
            time_between_connect_attempts: config.time_between_connect_attempts(),
            response_timeout: config.response_timeout(),
            connection_events: None,
        }
    }
}

impl ClientParams {
    pub fn permit_block_events(mut self, permit: bool) -> Self {
        self.permit_block_events = permit;
        self
    }

    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_max_connect_attempts(mut self, attempts: u32) -> Self {
        self.max_connect_attempts = attempts;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_initial_delay(mut self, delay: Duration) -> Self {
        self.reconnect_initial_delay = delay;
        self
    }

    pub fn with_time_between_connect_attempts(mut self, delay: Duration) -> Self {
        self.time_between_connect_attempts = delay.max(MIN_TIME_BETWEEN_CONNECT_ATTEMPTS);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_connection_events(mut self, sender: mpsc::Sender<ConnectionEvent>) -> Self {
        self.connection_events = Some(sender);
        self
    }

    pub(crate) fn connect_policy(&self) -> RetryPolicy {
        self.policy(self.max_connect_attempts)
    }

    pub(crate) fn reconnect_policy(&self) -> RetryPolicy {
        self.policy(self.max_reconnect_attempts)
    }

    fn policy(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            delay: self.time_between_connect_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_service_config() {
        let params = ClientParams::default();
        assert!(!params.permit_block_events);
        assert!(params.reconnect);
        assert_eq!(params.max_connect_attempts, 1);
        assert_eq!(params.max_reconnect_attempts, 0);
        assert_eq!(params.time_between_connect_attempts, Duration::from_secs(5));
        assert_eq!(params.response_timeout, Duration::from_secs(5));
    }

    #[test]
    fn attempt_delay_is_floored() {
        let params = ClientParams::default().with_time_between_connect_attempts(Duration::from_millis(1));
        assert_eq!(params.time_between_connect_attempts, Duration::from_secs(1));
    }

    #[test]
    fn reconnect_policy_unbounded_by_default() {
        let params = ClientParams::default();
        assert!(params.reconnect_policy().is_unbounded());
        assert!(!params.connect_policy().is_unbounded());
    }
}
