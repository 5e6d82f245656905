//! Protocol-agnostic transport handler.
//!
//! A [`TransportHandler`] is one logical device session bound to fixed
//! [`TransportSettings`]. Every operation takes a caller
//! [`CancellationToken`]:
//!
//! 1. A token that is already canceled fails the call with
//!    [`Error::Canceled`] before any I/O
//! 2. The operation then races the token and the operation timeout
//! 3. A cancel mid-flight drops the operation future, which releases any
//!    pool lease or connection it acquired
//!
//! Errors that are fatal to the channel (protocol violations, connection
//! faults) discard the session. A pooled connection is marked faulted so
//! the pool closes it instead of handing it out again.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::DeliveryTag;
use crate::protocol::{Disposition, Message};

use super::builder::TransportHandlerBuilder;
use super::identity::{ConnectionIdentity, PoolKey};
use super::pool::{ConnectionPool, PoolLease};
use super::session::{ConnectionFactory, ProtocolSession, TransportConnection};
use super::settings::TransportSettings;

// ============================================================================
// Types
// ============================================================================

/// How the handler holds its connection.
enum Link {
    /// Shared through the pool; released on drop.
    Pooled(PoolLease),
    /// Exclusively owned.
    Owned(Arc<dyn TransportConnection>),
}

impl Link {
    fn mark_faulted(&self) {
        match self {
            Self::Pooled(lease) => lease.mark_faulted(),
            Self::Owned(connection) => connection.abort(),
        }
    }
}

/// An open session and the connection carrying it.
struct Active {
    generation: u64,
    session: Arc<dyn ProtocolSession>,
    link: Link,
}

/// Aborts an owned connection unless disarmed.
struct AbortOnDrop(Option<Arc<dyn TransportConnection>>);

impl AbortOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(connection) = self.0.take() {
            debug!(connection_id = %connection.id(), "Aborting connection from unfinished open");
            connection.abort();
        }
    }
}

/// Internal shared state for a handler.
struct HandlerInner {
    identity: ConnectionIdentity,
    settings: TransportSettings,
    key: PoolKey,
    pool: Option<Arc<ConnectionPool>>,
    factory: Arc<dyn ConnectionFactory>,
    active: Mutex<Option<Active>>,
    /// Serializes `open`.
    open_lock: AsyncMutex<()>,
    generation: AtomicU64,
    /// Delivery tags received and not yet settled.
    unsettled: Mutex<FxHashSet<DeliveryTag>>,
}

impl Drop for HandlerInner {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take()
            && let Link::Owned(connection) = &active.link
        {
            connection.abort();
        }
    }
}

// ============================================================================
// TransportHandler
// ============================================================================

/// Cancellable, protocol-agnostic device session.
///
/// Cheap to clone; clones share the same session.
///
/// # Example
///
/// ```ignore
/// let handler = TransportHandler::builder()
///     .connection_string("HostName=hub;DeviceId=dev-1;SharedAccessKey=...")
///     .settings(settings)
///     .pool(Arc::clone(&pool))
///     .build()?;
///
/// handler.open(&cancel).await?;
/// handler.send_event(Message::new("21.5"), &cancel).await?;
/// if let Some(message) = handler.receive(Duration::from_secs(5), &cancel).await? {
///     handler.complete(message.delivery_tag.as_ref().unwrap(), &cancel).await?;
/// }
/// handler.close().await;
/// ```
#[derive(Clone)]
pub struct TransportHandler {
    inner: Arc<HandlerInner>,
}

impl fmt::Debug for TransportHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandler")
            .field("key", &self.inner.key)
            .field("transport", &self.inner.settings.transport_type)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// TransportHandler - Constructor
// ============================================================================

impl TransportHandler {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> TransportHandlerBuilder {
        TransportHandlerBuilder::new()
    }

    /// Assembles a validated handler. Called by the builder.
    pub(crate) fn from_parts(
        identity: ConnectionIdentity,
        settings: TransportSettings,
        pool: Option<Arc<ConnectionPool>>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let key = identity.pool_key(settings.transport_type);
        debug!(%key, pooled = settings.pooling.enabled, "Transport handler created");

        Self {
            inner: Arc::new(HandlerInner {
                identity,
                settings,
                key,
                pool,
                factory,
                active: Mutex::new(None),
                open_lock: AsyncMutex::new(()),
                generation: AtomicU64::new(0),
                unsettled: Mutex::new(FxHashSet::default()),
            }),
        }
    }
}

// ============================================================================
// TransportHandler - Accessors
// ============================================================================

impl TransportHandler {
    /// Returns the connection identity.
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &ConnectionIdentity {
        &self.inner.identity
    }

    /// Returns the settings fixed at construction.
    #[inline]
    #[must_use]
    pub fn settings(&self) -> &TransportSettings {
        &self.inner.settings
    }

    /// Returns the pooling key.
    #[inline]
    #[must_use]
    pub fn pool_key(&self) -> &PoolKey {
        &self.inner.key
    }

    /// Returns `true` if connections come from the pool.
    #[inline]
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.inner.settings.pooling.enabled && self.inner.pool.is_some()
    }

    /// Returns `true` while a session is open.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Returns the number of received, unsettled deliveries.
    #[inline]
    #[must_use]
    pub fn unsettled_count(&self) -> usize {
        self.inner.unsettled.lock().len()
    }
}

// ============================================================================
// TransportHandler - Operations
// ============================================================================

impl TransportHandler {
    /// Opens the session. No-op if already open.
    ///
    /// # Errors
    ///
    /// - [`Error::Canceled`] if `cancel` fires; any acquired lease is released
    /// - [`Error::PoolExhausted`] / [`Error::PoolClosed`] from the pool
    /// - [`Error::Timeout`] if opening exceeds the operation timeout
    /// - Any connect or attach error
    pub async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        ensure_not_canceled(cancel, "open")?;

        let _open = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("open")),
            guard = self.inner.open_lock.lock() => guard,
        };
        if self.is_open() {
            return Ok(());
        }

        let active = self
            .run("open", cancel, Some(self.inner.settings.operation_timeout), self.establish(cancel))
            .await?;
        info!(key = %self.inner.key, generation = active.generation, "Transport handler opened");
        *self.inner.active.lock() = Some(active);
        Ok(())
    }

    /// Sends one message.
    ///
    /// # Errors
    ///
    /// - [`Error::Canceled`] if `cancel` fires
    /// - [`Error::NotOpen`] if not open
    /// - [`Error::Timeout`], [`Error::Remote`] or a connection error
    pub async fn send_event(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.with_session("send", cancel, |session| async move {
            session.send(message).await
        })
        .await
    }

    /// Sends messages as one unit; all are accepted or the call fails.
    ///
    /// An empty batch succeeds without I/O.
    ///
    /// # Errors
    ///
    /// Same as [`send_event`](Self::send_event).
    pub async fn send_events(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if messages.is_empty() {
            ensure_not_canceled(cancel, "send_batch")?;
            self.session()?;
            return Ok(());
        }

        let count = messages.len();
        self.with_session("send_batch", cancel, |session| async move {
            session.send_batch(messages).await
        })
        .await?;
        trace!(count, "Batch sent");
        Ok(())
    }

    /// Waits up to `wait` for the next inbound message.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. Messages carrying a
    /// delivery tag must later be settled with `complete`, `abandon` or
    /// `reject`.
    ///
    /// # Errors
    ///
    /// - [`Error::Canceled`] if `cancel` fires
    /// - [`Error::NotOpen`] if not open
    /// - A connection error if the connection fails while waiting
    pub async fn receive(
        &self,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>> {
        ensure_not_canceled(cancel, "receive")?;
        let (generation, session) = self.current()?;

        let result = self
            .run("receive", cancel, None, async move { session.receive(wait).await })
            .await;

        match result {
            Ok(Some(message)) => {
                if let Some(tag) = &message.delivery_tag {
                    self.inner.unsettled.lock().insert(tag.clone());
                }
                Ok(Some(message))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.on_error(generation, &e);
                Err(e)
            }
        }
    }

    /// Completes a received message.
    ///
    /// # Errors
    ///
    /// - [`Error::Canceled`] if `cancel` fires
    /// - [`Error::NotOpen`] if not open
    /// - [`Error::NotFound`] if `tag` is unknown or already settled
    pub async fn complete(&self, tag: &DeliveryTag, cancel: &CancellationToken) -> Result<()> {
        self.settle(tag, Disposition::Complete, cancel).await
    }

    /// Abandons a received message so it is redelivered.
    ///
    /// # Errors
    ///
    /// Same as [`complete`](Self::complete).
    pub async fn abandon(&self, tag: &DeliveryTag, cancel: &CancellationToken) -> Result<()> {
        self.settle(tag, Disposition::Abandon, cancel).await
    }

    /// Rejects a received message so it is dead-lettered.
    ///
    /// # Errors
    ///
    /// Same as [`complete`](Self::complete).
    pub async fn reject(&self, tag: &DeliveryTag, cancel: &CancellationToken) -> Result<()> {
        self.settle(tag, Disposition::Reject, cancel).await
    }

    /// Closes the session and returns or closes the connection.
    ///
    /// Never fails. A pooled connection goes back to the pool; an owned
    /// one is closed.
    pub async fn close(&self) {
        let active = self.inner.active.lock().take();
        self.inner.unsettled.lock().clear();
        let Some(active) = active else {
            return;
        };

        let limit = self.inner.settings.operation_timeout;
        match timeout(limit, active.session.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(key = %self.inner.key, error = %e, "Session close failed"),
            Err(_) => warn!(key = %self.inner.key, "Session close timed out"),
        }

        match active.link {
            Link::Pooled(lease) => lease.release(),
            Link::Owned(connection) => connection.close().await,
        }
        info!(key = %self.inner.key, "Transport handler closed");
    }
}

// ============================================================================
// TransportHandler - Internal
// ============================================================================

impl TransportHandler {
    async fn establish(&self, cancel: &CancellationToken) -> Result<Active> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(pool) = inner.pool.as_ref().filter(|_| inner.settings.pooling.enabled) {
            let lease = pool
                .acquire(&inner.key, &inner.identity, &inner.settings, cancel)
                .await?;
            return match lease.connection().open_session(&inner.identity).await {
                Ok(session) => Ok(Active {
                    generation,
                    session,
                    link: Link::Pooled(lease),
                }),
                Err(e) => {
                    if e.is_fatal_to_channel() {
                        lease.mark_faulted();
                    }
                    Err(e)
                }
            };
        }

        let connection = inner.factory.connect(&inner.identity, &inner.settings).await?;
        let guard = AbortOnDrop(Some(Arc::clone(&connection)));
        let session = connection.open_session(&inner.identity).await?;
        guard.disarm();

        Ok(Active {
            generation,
            session,
            link: Link::Owned(connection),
        })
    }

    fn current(&self) -> Result<(u64, Arc<dyn ProtocolSession>)> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| (active.generation, Arc::clone(&active.session)))
            .ok_or(Error::NotOpen)
    }

    fn session(&self) -> Result<Arc<dyn ProtocolSession>> {
        self.current().map(|(_, session)| session)
    }

    async fn settle(
        &self,
        tag: &DeliveryTag,
        disposition: Disposition,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let operation = disposition.as_str();
        ensure_not_canceled(cancel, operation)?;
        self.session()?;

        if !self.inner.unsettled.lock().remove(tag) {
            return Err(Error::not_found(tag.clone()));
        }

        let result = self
            .with_session(operation, cancel, |session| async move {
                session.settle(tag, disposition).await
            })
            .await;

        if let Err(e) = &result
            && !e.is_fatal_to_channel()
            && (e.is_canceled() || e.is_timeout())
        {
            // Outcome unknown; the caller may settle again.
            self.inner.unsettled.lock().insert(tag.clone());
        }
        result
    }

    async fn with_session<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn ProtocolSession>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        ensure_not_canceled(cancel, operation)?;
        let (generation, session) = self.current()?;

        let limit = Some(self.inner.settings.operation_timeout);
        let result = self.run(operation, cancel, limit, f(session)).await;
        if let Err(e) = &result {
            self.on_error(generation, e);
        }
        result
    }

    /// Races `fut` against `cancel` and an optional time limit.
    async fn run<T>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        limit: Option<Duration>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let bounded = async {
            match limit {
                Some(limit) => timeout(limit, fut)
                    .await
                    .unwrap_or_else(|_| Err(Error::timeout(operation, limit.as_millis() as u64))),
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(operation, "Operation canceled");
                Err(Error::canceled(operation))
            }
            result = bounded => result,
        }
    }

    /// Discards the session of `generation` if `error` is fatal to it.
    fn on_error(&self, generation: u64, error: &Error) {
        if !error.is_fatal_to_channel() {
            return;
        }

        let discarded = {
            let mut active = self.inner.active.lock();
            match active.as_ref() {
                Some(current) if current.generation == generation => active.take(),
                _ => None,
            }
        };

        if let Some(active) = discarded {
            warn!(key = %self.inner.key, error = %error, "Session faulted, discarding connection");
            active.link.mark_faulted();
            self.inner.unsettled.lock().clear();
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn ensure_not_canceled(cancel: &CancellationToken, operation: &'static str) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::canceled(operation))
    } else {
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
