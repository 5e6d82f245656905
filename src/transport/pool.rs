//! Connection pool for shared device connections.
//!
//! Keeps physical connections keyed by [`PoolKey`] so handlers that agree
//! on host, credential scope and transport share them.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ConnectionPool                │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ key A → [conn-1 (3 refs), conn-2 (0)]  │  │
//! │  │ key B → [conn-3 (1 ref)]               │  │
//! │  └────────────────────────────────────────┘  │
//! │  SettingsGuard: key → initial PoolingSettings│
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Entry Lifecycle
//!
//! 1. `acquire` shares an entry below its sharer limit, or dials a new one
//!    if the key is below `max_pool_size`
//! 2. The returned [`PoolLease`] keeps the entry referenced
//! 3. Dropping the lease releases it exactly once and stamps the idle deadline
//! 4. Unreferenced entries past their deadline are closed by the sweep task
//!    or lazily on the next `acquire`
//! 5. `shutdown` aborts everything

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ConnectionId;

use super::guard::SettingsGuard;
use super::identity::{ConnectionIdentity, PoolKey};
use super::session::{ConnectionFactory, TransportConnection};
use super::settings::{ExhaustionPolicy, PoolingSettings, TransportSettings};

// ============================================================================
// Constants
// ============================================================================

/// Interval of the background idle sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Types
// ============================================================================

/// One pooled physical connection.
struct Entry {
    id: ConnectionId,
    connection: Arc<dyn TransportConnection>,
    ref_count: usize,
    last_released: Option<Instant>,
    /// Set while unreferenced.
    idle_deadline: Option<Instant>,
    /// Faulted entries take no new sharers and close at zero refs.
    faulted: bool,
}

impl Entry {
    fn can_share(&self, max_sharers: usize) -> bool {
        !self.faulted && self.ref_count < max_sharers && self.connection.is_healthy()
    }

    fn is_evictable(&self, now: Instant) -> bool {
        if self.ref_count > 0 {
            return false;
        }
        self.faulted
            || !self.connection.is_healthy()
            || self.idle_deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// Entries and bookkeeping for one key.
struct KeyedPool {
    settings: PoolingSettings,
    entries: Vec<Entry>,
    /// Slots reserved by in-flight dials.
    connecting: usize,
    /// Bumped whenever capacity may have freed up.
    available: watch::Sender<u64>,
}

impl KeyedPool {
    fn new(settings: PoolingSettings) -> Self {
        Self {
            settings,
            entries: Vec::new(),
            connecting: 0,
            available: watch::Sender::new(0),
        }
    }

    fn has_capacity(&self) -> bool {
        self.entries.len() + self.connecting < self.settings.max_pool_size
    }

    fn notify_available(&self) {
        self.available.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Removes evictable entries and returns their connections.
    fn evict(&mut self, now: Instant) -> Vec<Arc<dyn TransportConnection>> {
        let mut evicted = Vec::new();
        self.entries.retain(|entry| {
            if entry.is_evictable(now) {
                debug!(
                    connection_id = %entry.id,
                    faulted = entry.faulted,
                    idle_for_ms = entry
                        .last_released
                        .map_or(0, |at| now.saturating_duration_since(at).as_millis() as u64),
                    "Evicting pooled connection"
                );
                evicted.push(Arc::clone(&entry.connection));
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            self.notify_available();
        }
        evicted
    }
}

/// Outcome of one locked acquire attempt.
enum Slot {
    Shared(PoolLease),
    Reserved(Reservation),
    Full(watch::Receiver<u64>),
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Keyed registry of shareable connections.
///
/// Thread-safe; share it between handlers as `Arc<ConnectionPool>`.
///
/// # Example
///
/// ```ignore
/// let pool = ConnectionPool::new(Arc::new(NetworkConnector::new()));
/// let lease = pool.acquire(&key, &identity, &settings, &cancel).await?;
/// let session = lease.connection().open_session(&identity).await?;
/// drop(lease); // released exactly once
/// ```
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    guard: SettingsGuard,
    keys: Mutex<FxHashMap<PoolKey, KeyedPool>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("keys", &self.keys.lock().len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates a pool dialing through `factory`.
    ///
    /// Starts the background idle sweep when called inside a Tokio runtime;
    /// otherwise idle entries are only evicted lazily on `acquire`.
    #[must_use]
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let pool = Arc::new(Self {
            factory,
            guard: SettingsGuard::new(),
            keys: Mutex::new(FxHashMap::default()),
            shutdown: CancellationToken::new(),
        });

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(Self::sweep_loop(
                    Arc::downgrade(&pool),
                    pool.shutdown.clone(),
                ));
            }
            Err(_) => debug!("No runtime, idle sweep runs lazily on acquire"),
        }

        info!("ConnectionPool started");
        pool
    }

    async fn sweep_loop(pool: Weak<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else { break };
                    pool.sweep_idle();
                }
            }
        }
        trace!("Idle sweep stopped");
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Registers pooling settings for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `settings` differ from those first
    /// registered for `key`.
    #[inline]
    pub fn register(&self, key: &PoolKey, settings: &PoolingSettings) -> Result<()> {
        self.guard.register(key, settings)
    }

    /// Returns the settings guard.
    #[inline]
    #[must_use]
    pub fn settings_guard(&self) -> &SettingsGuard {
        &self.guard
    }

    /// Acquires a connection for `key`.
    ///
    /// Shares an existing entry if one is below its sharer limit, dials a
    /// new one if the key is below `max_pool_size`, and otherwise applies
    /// the configured [`ExhaustionPolicy`].
    ///
    /// # Errors
    ///
    /// - [`Error::Canceled`] if `cancel` fires; no slot is left reserved
    /// - [`Error::PoolExhausted`] if at capacity under `Fail`, or after the
    ///   `Wait` timeout
    /// - [`Error::PoolClosed`] if the pool is shut down
    /// - [`Error::Config`] if `settings` conflict with the key's settings
    /// - Any error from the connection factory
    pub async fn acquire(
        self: &Arc<Self>,
        key: &PoolKey,
        identity: &ConnectionIdentity,
        settings: &TransportSettings,
        cancel: &CancellationToken,
    ) -> Result<PoolLease> {
        if cancel.is_cancelled() {
            return Err(Error::canceled("acquire"));
        }
        if self.is_shut_down() {
            return Err(Error::PoolClosed);
        }
        let pooling = settings.pooling;
        self.guard.register(key, &pooling)?;

        let wait_deadline = match pooling.exhaustion {
            ExhaustionPolicy::Fail => None,
            ExhaustionPolicy::Wait { timeout } => Some(Instant::now() + timeout),
        };

        let reservation = loop {
            match self.try_acquire(key, &pooling) {
                Slot::Shared(lease) => return Ok(lease),
                Slot::Reserved(reservation) => break reservation,
                Slot::Full(mut available) => {
                    let Some(deadline) = wait_deadline else {
                        debug!(%key, "Pool exhausted");
                        return Err(Error::pool_exhausted(key.clone(), pooling.max_pool_size));
                    };

                    trace!(%key, "Pool at capacity, waiting");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::canceled("acquire")),
                        _ = self.shutdown.cancelled() => return Err(Error::PoolClosed),
                        _ = sleep_until(deadline) => {
                            debug!(%key, "Timed out waiting for pool capacity");
                            return Err(Error::pool_exhausted(key.clone(), pooling.max_pool_size));
                        }
                        _ = available.changed() => {}
                    }
                }
            }
        };

        // Dropping the reservation on any early return frees the slot.
        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("acquire")),
            _ = self.shutdown.cancelled() => return Err(Error::PoolClosed),
            result = self.factory.connect(identity, settings) => result?,
        };

        reservation.complete(connection)
    }

    /// Closes unreferenced entries whose idle deadline has passed.
    ///
    /// Returns the number of entries evicted.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<_> = {
            let mut keys = self.keys.lock();
            keys.values_mut().flat_map(|pool| pool.evict(now)).collect()
        };
        let count = evicted.len();
        if count > 0 {
            debug!(count, "Idle sweep evicted connections");
        }
        self.close_detached(evicted);
        count
    }

    /// Aborts every entry regardless of references and rejects further
    /// acquires.
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let pools: Vec<_> = self.keys.lock().drain().collect();
        let mut aborted = 0;
        for (_, pool) in pools {
            for entry in &pool.entries {
                entry.connection.abort();
                aborted += 1;
            }
            pool.notify_available();
        }

        info!(aborted, "ConnectionPool shut down");
    }

    /// Returns `true` after [`shutdown`](Self::shutdown).
    #[inline]
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Returns the number of live entries for `key`.
    #[must_use]
    pub fn entry_count(&self, key: &PoolKey) -> usize {
        self.keys.lock().get(key).map_or(0, |pool| pool.entries.len())
    }

    /// Returns the total references held on entries for `key`.
    #[must_use]
    pub fn ref_count(&self, key: &PoolKey) -> usize {
        self.keys
            .lock()
            .get(key)
            .map_or(0, |pool| pool.entries.iter().map(|e| e.ref_count).sum())
    }
}

// ============================================================================
// ConnectionPool - Internal
// ============================================================================

impl ConnectionPool {
    fn try_acquire(self: &Arc<Self>, key: &PoolKey, pooling: &PoolingSettings) -> Slot {
        let (slot, evicted) = {
            let mut keys = self.keys.lock();
            let pool = keys
                .entry(key.clone())
                .or_insert_with(|| KeyedPool::new(*pooling));
            let evicted = pool.evict(Instant::now());
            let max_sharers = pool.settings.max_sharers_per_entry;

            let slot = if let Some(entry) = pool
                .entries
                .iter_mut()
                .find(|entry| entry.can_share(max_sharers))
            {
                entry.ref_count += 1;
                entry.idle_deadline = None;
                trace!(%key, connection_id = %entry.id, refs = entry.ref_count, "Sharing pooled connection");
                Slot::Shared(PoolLease::new(
                    Arc::clone(self),
                    key.clone(),
                    entry.id,
                    Arc::clone(&entry.connection),
                ))
            } else if pool.has_capacity() {
                pool.connecting += 1;
                Slot::Reserved(Reservation {
                    pool: Arc::clone(self),
                    key: key.clone(),
                    completed: false,
                })
            } else {
                Slot::Full(pool.available.subscribe())
            };
            (slot, evicted)
        };

        self.close_detached(evicted);
        slot
    }

    fn release(&self, key: &PoolKey, id: ConnectionId) {
        let detached = {
            let mut keys = self.keys.lock();
            let Some(pool) = keys.get_mut(key) else {
                return;
            };
            let idle_timeout = pool.settings.idle_timeout;
            let Some(index) = pool.entries.iter().position(|e| e.id == id) else {
                return;
            };

            let entry = &mut pool.entries[index];
            debug_assert!(entry.ref_count > 0, "pool entry released more often than acquired");
            entry.ref_count = entry.ref_count.saturating_sub(1);

            let now = Instant::now();
            entry.last_released = Some(now);
            let detached = if entry.ref_count == 0 {
                entry.idle_deadline = Some(now + idle_timeout);
                if entry.faulted || !entry.connection.is_healthy() {
                    Some(pool.entries.swap_remove(index).connection)
                } else {
                    None
                }
            } else {
                None
            };
            trace!(%key, connection_id = %id, "Pooled connection released");
            pool.notify_available();
            detached
        };

        if let Some(connection) = detached {
            debug!(%key, connection_id = %id, "Discarding faulted pooled connection");
            self.close_detached(vec![connection]);
        }
    }

    fn mark_faulted(&self, key: &PoolKey, id: ConnectionId) {
        let mut keys = self.keys.lock();
        if let Some(entry) = keys
            .get_mut(key)
            .and_then(|pool| pool.entries.iter_mut().find(|e| e.id == id))
        {
            if !entry.faulted {
                warn!(%key, connection_id = %id, "Pooled connection faulted");
                entry.faulted = true;
            }
        }
    }

    /// Closes connections that have left the pool.
    ///
    /// Graceful close runs on the runtime; without one the connections
    /// are aborted.
    fn close_detached(&self, connections: Vec<Arc<dyn TransportConnection>>) {
        if connections.is_empty() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for connection in connections {
                        connection.close().await;
                    }
                });
            }
            Err(_) => {
                for connection in connections {
                    connection.abort();
                }
            }
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Reservation
// ============================================================================

/// A slot held for an in-flight dial; freed on drop unless completed.
struct Reservation {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
    completed: bool,
}

impl Reservation {
    fn complete(mut self, connection: Arc<dyn TransportConnection>) -> Result<PoolLease> {
        let id = connection.id();
        {
            let mut keys = self.pool.keys.lock();
            let Some(pool) = keys.get_mut(&self.key) else {
                // Shut down while dialing.
                drop(keys);
                connection.abort();
                return Err(Error::PoolClosed);
            };

            pool.connecting = pool.connecting.saturating_sub(1);
            pool.entries.push(Entry {
                id,
                connection: Arc::clone(&connection),
                ref_count: 1,
                last_released: None,
                idle_deadline: None,
                faulted: false,
            });
            self.completed = true;
            debug!(key = %self.key, connection_id = %id, entries = pool.entries.len(), "Pooled connection added");
        }

        Ok(PoolLease::new(
            Arc::clone(&self.pool),
            self.key.clone(),
            id,
            connection,
        ))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut keys = self.pool.keys.lock();
        if let Some(pool) = keys.get_mut(&self.key) {
            pool.connecting = pool.connecting.saturating_sub(1);
            pool.notify_available();
            trace!(key = %self.key, "Pool reservation released");
        }
    }
}

// ============================================================================
// PoolLease
// ============================================================================

/// A reference on one pooled connection.
///
/// Released exactly once: explicitly via [`release`](Self::release) or on
/// drop. The connection itself is only closed by the pool.
pub struct PoolLease {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
    id: ConnectionId,
    connection: Arc<dyn TransportConnection>,
    released: AtomicBool,
}

impl fmt::Debug for PoolLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolLease")
            .field("key", &self.key)
            .field("connection_id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PoolLease {
    fn new(
        pool: Arc<ConnectionPool>,
        key: PoolKey,
        id: ConnectionId,
        connection: Arc<dyn TransportConnection>,
    ) -> Self {
        Self {
            pool,
            key,
            id,
            connection,
            released: AtomicBool::new(false),
        }
    }

    /// Returns the leased connection.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn TransportConnection> {
        &self.connection
    }

    /// Returns the leased connection's ID.
    #[inline]
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the pool key.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Marks the connection faulted so it is never shared again and is
    /// closed once its last reference is released.
    pub fn mark_faulted(&self) {
        self.pool.mark_faulted(&self.key, self.id);
    }

    /// Releases the reference now.
    pub fn release(self) {
        drop(self);
    }

    fn release_once(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.pool.release(&self.key, self.id);
        }
    }
}

impl Drop for PoolLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use crate::transport::session::ProtocolSession;
    use crate::transport::TransportType;

    struct StubConnection {
        id: ConnectionId,
    }

    #[async_trait]
    impl TransportConnection for StubConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn open_session(
            &self,
            _identity: &ConnectionIdentity,
        ) -> Result<Arc<dyn ProtocolSession>> {
            Err(Error::unsupported("open_session"))
        }

        fn is_healthy(&self) -> bool {
            true
        }

        async fn close(&self) {}

        fn abort(&self) {}
    }

    #[derive(Default)]
    struct StubFactory {
        dialed: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory for StubFactory {
        async fn connect(
            &self,
            _identity: &ConnectionIdentity,
            _settings: &TransportSettings,
        ) -> Result<Arc<dyn TransportConnection>> {
            self.dialed.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubConnection {
                id: ConnectionId::next(),
            }))
        }
    }

    fn fixture(pooling: PoolingSettings) -> (ConnectionIdentity, PoolKey, TransportSettings) {
        let identity = ConnectionIdentity::new("hub", "dev-1");
        let key = identity.pool_key(TransportType::AmqpTcp);
        let settings = TransportSettings::new(TransportType::AmqpTcp).with_pooling(pooling);
        (identity, key, settings)
    }

    #[tokio::test]
    async fn test_shares_entry_below_sharer_limit() {
        let factory = Arc::new(StubFactory::default());
        let pool = ConnectionPool::new(factory.clone());
        let (identity, key, settings) = fixture(PoolingSettings::enabled());
        let cancel = CancellationToken::new();

        let a = pool.acquire(&key, &identity, &settings, &cancel).await.unwrap();
        let b = pool.acquire(&key, &identity, &settings, &cancel).await.unwrap();

        assert_eq!(a.connection_id(), b.connection_id());
        assert_eq!(factory.dialed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.ref_count(&key), 2);

        drop(a);
        b.release();
        assert_eq!(pool.ref_count(&key), 0);
        assert_eq!(pool.entry_count(&key), 1);
    }

    #[tokio::test]
    async fn test_fail_policy_at_capacity() {
        let pool = ConnectionPool::new(Arc::new(StubFactory::default()));
        let (identity, key, settings) = fixture(
            PoolingSettings::enabled()
                .with_max_pool_size(1)
                .with_max_sharers_per_entry(1),
        );
        let cancel = CancellationToken::new();

        let _held = pool.acquire(&key, &identity, &settings, &cancel).await.unwrap();
        let err = pool
            .acquire(&key, &identity, &settings, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { max_pool_size: 1, .. }));
    }

    #[tokio::test]
    async fn test_faulted_entry_not_reused() {
        let factory = Arc::new(StubFactory::default());
        let pool = ConnectionPool::new(factory.clone());
        let (identity, key, settings) = fixture(PoolingSettings::enabled());
        let cancel = CancellationToken::new();

        let lease = pool.acquire(&key, &identity, &settings, &cancel).await.unwrap();
        let faulted_id = lease.connection_id();
        lease.mark_faulted();
        drop(lease);
        assert_eq!(pool.entry_count(&key), 0);

        let fresh = pool.acquire(&key, &identity, &settings, &cancel).await.unwrap();
        assert_ne!(fresh.connection_id(), faulted_id);
        assert_eq!(factory.dialed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let pool = ConnectionPool::new(Arc::new(StubFactory::default()));
        let (identity, key, settings) = fixture(PoolingSettings::enabled());

        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shut_down());
        let err = pool
            .acquire(&key, &identity, &settings, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }

    #[test]
    fn test_pool_without_runtime() {
        let pool = ConnectionPool::new(Arc::new(StubFactory::default()));
        assert_eq!(pool.sweep_idle(), 0);
        assert!(!pool.is_shut_down());
    }
}
