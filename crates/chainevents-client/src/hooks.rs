//! Protocol hooks run around connection changes.

use async_trait::async_trait;

use chainevents_core::{Dispatcher, EventError, Protocol};

/// Protocol-specific work the client runs around (re)connects.
#[async_trait]
pub trait ConnectionHooks<P: Protocol>: Send + Sync + 'static {
    /// Runs after the dispatcher reports a connection. An error disconnects
    /// and fails the attempt.
    async fn after_connect(&self, _dispatcher: &Dispatcher<P>) -> Result<(), EventError> {
        Ok(())
    }

    /// Runs once before a reconnect sequence begins.
    async fn before_reconnect(&self, _dispatcher: &Dispatcher<P>) {}
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl<P: Protocol> ConnectionHooks<P> for NoHooks {}
