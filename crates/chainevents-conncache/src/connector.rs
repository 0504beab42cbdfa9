//! Connection cache keyed by target address.
//!
//! `dial` hands out a shared connection per target and counts its users;
//! callers give it back with `release_conn`. A janitor task sweeps the cache
//! on a fixed interval, closing connections that have had no users for longer
//! than the idle threshold and connections that report a terminal state. The
//! janitor exits once the cache is empty and is restarted by the next `dial`,
//! so eviction is best-effort: a connection cached while the janitor is
//! exiting may outlive its idle threshold until the next sweep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::CacheError;

/// Connectivity state reported by a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnState {
    /// A connection in this state will not recover on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::TransientFailure | Self::Shutdown)
    }
}

/// A transport connection that can be cached.
pub trait ClientConn: Send + Sync + 'static {
    fn state(&self) -> ConnState;

    /// Tear the connection down. Idempotent.
    fn close(&self);
}

/// Opens transport connections.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: ClientConn;

    /// Open a connection to `target`, resolving once it is usable.
    async fn dial(&self, target: &str) -> Result<Self::Conn, CacheError>;
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How often the janitor wakes up.
    pub sweep_interval: Duration,
    /// How long a connection may stay unused before it is closed.
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// A connection shared by every caller dialing the same target.
#[derive(Debug)]
pub struct CachedConn<C> {
    target: String,
    conn: C,
    open: AtomicUsize,
    last_release: Mutex<Instant>,
}

impl<C: ClientConn> CachedConn<C> {
    fn new(target: String, conn: C) -> Self {
        Self {
            target,
            conn,
            open: AtomicUsize::new(1),
            last_release: Mutex::new(Instant::now()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn conn(&self) -> &C {
        &self.conn
    }

    /// Number of callers that dialed and have not released yet.
    pub fn open_count(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }

    fn acquire(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the remaining user count.
    fn release(&self) -> usize {
        *self.last_release.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        let prev = self
            .open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if prev == 0 {
            warn!(addr = %self.target, "released a connection with no open users");
        }
        prev.saturating_sub(1)
    }

    fn idle_since(&self) -> Instant {
        *self.last_release.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<C> std::ops::Deref for CachedConn<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

type ConnMap<C> = HashMap<String, Arc<CachedConn<C>>>;

struct Janitor {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared<D: Dialer> {
    dialer: D,
    config: CacheConfig,
    conns: RwLock<ConnMap<D::Conn>>,
    janitor: Mutex<Option<Janitor>>,
    closed: AtomicBool,
}

/// Caches one connection per target. Cheap to clone.
pub struct CachingConnector<D: Dialer> {
    shared: Arc<Shared<D>>,
}

impl<D: Dialer> Clone for CachingConnector<D> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<D: Dialer> CachingConnector<D> {
    pub fn new(dialer: D, config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                dialer,
                config,
                conns: RwLock::new(HashMap::new()),
                janitor: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of cached connections.
    pub fn len(&self) -> usize {
        self.shared.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the cached connection to `target` if it is healthy, otherwise
    /// dial a new one within `timeout`. Every successful call must be paired
    /// with [`release_conn`](Self::release_conn).
    pub async fn dial(
        &self,
        target: &str,
        timeout: Duration,
    ) -> Result<Arc<CachedConn<D::Conn>>, CacheError> {
        let shared = &self.shared;
        if shared.is_closed() {
            error!(addr = target, "dial on a closed connection cache");
            return Err(CacheError::Closed);
        }

        // Acquired under the read lock so a sweep cannot evict it in between.
        let healthy = shared
            .read()
            .get(target)
            .filter(|c| !c.conn.state().is_terminal())
            .map(|c| {
                c.acquire();
                Arc::clone(c)
            });
        if let Some(cached) = healthy {
            debug!(addr = target, users = cached.open_count(), "reusing cached connection");
            shared.ensure_janitor();
            return Ok(cached);
        }

        debug!(addr = target, "dialing new connection");
        let conn = match tokio::time::timeout(timeout, shared.dialer.dial(target)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(CacheError::Timeout {
                    target: target.to_string(),
                    ms: timeout.as_millis() as u64,
                })
            }
        };

        let cached = {
            let mut conns = shared.write();
            if shared.is_closed() {
                conn.close();
                return Err(CacheError::Closed);
            }
            match conns.get(target) {
                Some(existing) if !existing.conn.state().is_terminal() => {
                    // Another caller cached a connection while we were dialing.
                    conn.close();
                    existing.acquire();
                    Arc::clone(existing)
                }
                _ => {
                    let fresh = Arc::new(CachedConn::new(target.to_string(), conn));
                    if let Some(stale) = conns.insert(target.to_string(), Arc::clone(&fresh)) {
                        info!(addr = target, state = ?stale.conn.state(), "replacing unhealthy connection");
                        stale.conn.close();
                    }
                    fresh
                }
            }
        };
        shared.ensure_janitor();
        Ok(cached)
    }

    /// Give back a connection obtained from [`dial`](Self::dial).
    pub fn release_conn(&self, conn: &Arc<CachedConn<D::Conn>>) {
        if self.shared.is_closed() {
            warn!(addr = %conn.target, "release on a closed connection cache");
            return;
        }
        let remaining = conn.release();
        let cached = self
            .shared
            .read()
            .get(&conn.target)
            .map_or(false, |c| Arc::ptr_eq(c, conn));
        if !cached && remaining == 0 {
            debug!(addr = %conn.target, "closing released connection that is no longer cached");
            conn.conn.close();
        }
    }

    /// Stop the janitor and close every cached connection.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::AcqRel) {
            warn!("connection cache already closed");
            return;
        }
        if let Some(janitor) = shared.janitor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = janitor.stop.send(());
        }
        let drained: Vec<_> = shared.write().drain().collect();
        info!(connections = drained.len(), "closing connection cache");
        for (_, cached) in drained {
            cached.conn.close();
        }
    }
}

impl<D: Dialer> Shared<D> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ConnMap<D::Conn>> {
        self.conns.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ConnMap<D::Conn>> {
        self.conns.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_janitor(self: &Arc<Self>) {
        let mut slot = self.janitor.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_closed() || slot.as_ref().is_some_and(|j| !j.handle.is_finished()) {
            return;
        }
        let (stop, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(janitor(Arc::downgrade(self), stop_rx, self.config.sweep_interval));
        debug!(sweep_ms = self.config.sweep_interval.as_millis() as u64, "janitor started");
        *slot = Some(Janitor { stop, handle });
    }

    /// Evict idle and terminal connections. Returns how many remain.
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let mut conns = self.write();
        conns.retain(|target, cached| {
            let state = cached.conn.state();
            let idle = cached.open_count() == 0
                && now.saturating_duration_since(cached.idle_since()) >= idle_timeout;
            if state.is_terminal() || idle {
                debug!(addr = %target, ?state, idle, "evicting connection");
                cached.conn.close();
                return false;
            }
            true
        });
        conns.len()
    }
}

async fn janitor<D: Dialer>(shared: Weak<Shared<D>>, mut stop: oneshot::Receiver<()>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {}
        }
        let Some(shared) = shared.upgrade() else { break };
        if shared.sweep() == 0 {
            debug!("connection cache empty, janitor exiting");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;

    #[derive(Debug)]
    struct MockConn {
        state: AtomicU8,
        closed: AtomicBool,
    }

    impl MockConn {
        fn set_state(&self, state: ConnState) {
            self.state.store(state as u8, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl ClientConn for Arc<MockConn> {
        fn state(&self) -> ConnState {
            match self.state.load(Ordering::SeqCst) {
                0 => ConnState::Idle,
                1 => ConnState::Connecting,
                2 => ConnState::Ready,
                3 => ConnState::TransientFailure,
                _ => ConnState::Shutdown,
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.set_state(ConnState::Shutdown);
        }
    }

    #[derive(Default)]
    struct MockDialer {
        dials: AtomicUsize,
        delay: Duration,
        dialed: Mutex<Vec<Arc<MockConn>>>,
    }

    #[async_trait]
    impl Dialer for Arc<MockDialer> {
        type Conn = Arc<MockConn>;

        async fn dial(&self, target: &str) -> Result<Arc<MockConn>, CacheError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if target.is_empty() {
                return Err(CacheError::Dial { target: target.into(), reason: "empty target".into() });
            }
            let conn = Arc::new(MockConn {
                state: AtomicU8::new(ConnState::Ready as u8),
                closed: AtomicBool::new(false),
            });
            self.dialed.lock().unwrap().push(Arc::clone(&conn));
            Ok(conn)
        }
    }

    const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

    fn connector(delay: Duration) -> (CachingConnector<Arc<MockDialer>>, Arc<MockDialer>) {
        let dialer = Arc::new(MockDialer { delay, ..Default::default() });
        let config = CacheConfig {
            sweep_interval: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(2),
        };
        (CachingConnector::new(Arc::clone(&dialer), config), dialer)
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_cached_connection() {
        let (cache, dialer) = connector(Duration::ZERO);
        let a = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        let b = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        let c = cache.dial("peer1:7051", DIAL_TIMEOUT).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.open_count(), 2);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replaces_unhealthy_connection() {
        let (cache, dialer) = connector(Duration::ZERO);
        let first = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        first.set_state(ConnState::TransientFailure);

        let second = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_evicts_idle_connections() {
        let (cache, _dialer) = connector(Duration::ZERO);
        let conn = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        cache.release_conn(&conn);
        assert_eq!(conn.open_count(), 0);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_keeps_connections_in_use() {
        let (cache, _dialer) = connector(Duration::ZERO);
        let conn = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(cache.len(), 1);
        assert!(!conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn reused_idle_connection_survives_sweep() {
        let dialer = Arc::new(MockDialer::default());
        let config = CacheConfig {
            sweep_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(2),
        };
        let cache = CachingConnector::new(Arc::clone(&dialer), config);

        let conn = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        cache.release_conn(&conn);
        tokio::time::sleep(Duration::from_secs(3)).await;

        // Idle past the threshold, but handed out again before the sweep.
        let again = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(again.open_count(), 1);
        assert_eq!(cache.shared.sweep(), 1);
        assert!(!again.is_closed());
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_restarts_after_cache_empties() {
        let (cache, dialer) = connector(Duration::ZERO);
        let conn = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        cache.release_conn(&conn);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.is_empty());

        let conn = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        cache.release_conn(&conn);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_evicts_terminal_connections() {
        let (cache, _dialer) = connector(Duration::ZERO);
        let conn = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();
        conn.set_state(ConnState::TransientFailure);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(cache.is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_and_rejects_use() {
        let (cache, _dialer) = connector(Duration::ZERO);
        let conn = cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap();

        cache.close();
        assert!(conn.is_closed());
        assert!(cache.is_empty());
        assert_eq!(
            cache.dial("peer0:7051", DIAL_TIMEOUT).await.unwrap_err(),
            CacheError::Closed
        );
        // Second close and late release are harmless.
        cache.close();
        cache.release_conn(&conn);
    }

    #[tokio::test(start_paused = true)]
    async fn dial_times_out() {
        let (cache, _dialer) = connector(Duration::from_secs(10));
        let err = cache.dial("peer0:7051", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CacheError::Timeout { ms: 1000, .. }));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dial_error_is_propagated() {
        let (cache, _dialer) = connector(Duration::ZERO);
        let err = cache.dial("", DIAL_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, CacheError::Dial { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_dials_share_one_connection() {
        let (cache, dialer) = connector(Duration::from_millis(100));
        let (a, b) = tokio::join!(
            cache.dial("peer0:7051", DIAL_TIMEOUT),
            cache.dial("peer0:7051", DIAL_TIMEOUT)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_count(), 2);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        let dialed = dialer.dialed.lock().unwrap();
        assert_eq!(dialed.iter().filter(|c| c.is_closed()).count(), 1);
    }
}
