//! Byte channel: one physical duplex stream bridged into a [`Pipeline`].
//!
//! # Loops
//!
//! The channel runs at most one read loop and one write drain at a time,
//! each as a supervised tokio task. A failure or panic inside either loop is
//! converted into [`Pipeline::fire_exception`] followed by [`Channel::close`];
//! nothing escapes a loop unobserved.
//!
//! # Lifecycle
//!
//! ```text
//! Inactive ──► Open ──► Closing ──► Closed
//!                 │         │
//!                 └─────────┴──────► Aborted
//! ```
//!
//! `Closing` is entered on a close request or an unrecoverable fault.
//! `Closed` requires the stream to confirm the close handshake within the
//! configured timeout; otherwise the stream is aborted. Resources (pending
//! writes, cancellation sources) are released exactly once on the terminal
//! transition.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::ChannelId;
use crate::transport::settings::duration_ms;

use super::alloc::{AllocHandle, RecvBufferPolicy};
use super::pipeline::Pipeline;
use super::stream::{CloseStatus, DuplexStream, FrameKind, Received, StreamState};

// ============================================================================
// Constants
// ============================================================================

/// Default bound on the close handshake.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// ChannelState
// ============================================================================

/// Lifecycle state of a [`Channel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Stream not yet usable.
    Inactive,
    /// Reads and writes accepted.
    Open,
    /// Close in progress.
    Closing,
    /// Close handshake confirmed.
    Closed,
    /// Torn down without a confirmed handshake.
    Aborted,
}

impl ChannelState {
    /// Returns `true` for `Closed` and `Aborted`.
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Aborted)
    }
}

// ============================================================================
// ChannelConfig
// ============================================================================

/// Channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Bound on the graceful close handshake.
    #[serde(with = "duration_ms")]
    pub close_timeout: Duration,

    /// Start the next read cycle automatically after read-complete.
    pub auto_read: bool,

    /// Receive-buffer sizing policy.
    pub recv: RecvBufferPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelConfig {
    /// Creates the default configuration (30 s close timeout, auto-read on).
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            auto_read: true,
            recv: RecvBufferPolicy::new(),
        }
    }

    /// Sets the close handshake bound.
    #[inline]
    #[must_use]
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Enables or disables automatic read cycles.
    #[inline]
    #[must_use]
    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    /// Sets the receive-buffer policy.
    #[inline]
    #[must_use]
    pub fn with_recv_policy(mut self, recv: RecvBufferPolicy) -> Self {
        self.recv = recv;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero close timeout or invalid
    /// receive-buffer bounds.
    pub fn validate(&self) -> Result<()> {
        if self.close_timeout.is_zero() {
            return Err(Error::config("close_timeout must be non-zero"));
        }
        self.recv.validate()
    }
}

// ============================================================================
// Types
// ============================================================================

/// How a read cycle ended.
enum CycleEnd {
    /// Handle asked to yield; more data may follow.
    Yield,
    /// A receive returned no bytes.
    Empty,
    /// Peer initiated the close.
    PeerClosed,
}

/// Internal shared state for a channel.
struct ChannelInner {
    id: ChannelId,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    stream: Box<dyn DuplexStream>,
    pipeline: Arc<dyn Pipeline>,
    read_pending: AtomicBool,
    write_in_progress: AtomicBool,
    pending_writes: Mutex<VecDeque<Bytes>>,
    /// Write-scoped cancellation source; `None` once disposed.
    write_cancel: Mutex<Option<CancellationToken>>,
    read_cancel: CancellationToken,
    drained: Notify,
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        if !self.state.get_mut().is_terminal() {
            self.read_cancel.cancel();
            if let Some(token) = self.write_cancel.get_mut().take() {
                token.cancel();
            }
            self.stream.abort();
            debug!(channel_id = %self.id, "Channel dropped while open, stream aborted");
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Flow-controlled, event-driven channel over one [`DuplexStream`].
///
/// Cheap to clone; all clones refer to the same physical connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("pending_writes", &self.pending_write_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Channel - Constructor
// ============================================================================

impl Channel {
    /// Creates a channel over `stream` publishing into `pipeline`.
    ///
    /// The channel starts `Open` if the stream is open, otherwise `Inactive`.
    /// Reading does not start until [`begin_read`](Self::begin_read).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub fn new(
        stream: Box<dyn DuplexStream>,
        pipeline: Arc<dyn Pipeline>,
        config: ChannelConfig,
    ) -> Result<Self> {
        config.validate()?;

        let id = ChannelId::next();
        let state = if stream.state() == StreamState::Open {
            ChannelState::Open
        } else {
            ChannelState::Inactive
        };
        debug!(channel_id = %id, ?state, "Channel created");

        Ok(Self {
            inner: Arc::new(ChannelInner {
                id,
                config,
                state: Mutex::new(state),
                stream,
                pipeline,
                read_pending: AtomicBool::new(false),
                write_in_progress: AtomicBool::new(false),
                pending_writes: Mutex::new(VecDeque::new()),
                write_cancel: Mutex::new(Some(CancellationToken::new())),
                read_cancel: CancellationToken::new(),
                drained: Notify::new(),
            }),
        })
    }
}

// ============================================================================
// Channel - Accessors
// ============================================================================

impl Channel {
    /// Returns the channel ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    /// Returns the lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.inner.state.lock()
    }

    /// Returns `true` while the channel is `Open` and the stream reports open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_active() && self.inner.stream.state() == StreamState::Open
    }

    /// Returns `true` while the channel is `Open`, whatever the stream reports.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Returns `true` while a read loop is running.
    #[inline]
    #[must_use]
    pub fn is_read_pending(&self) -> bool {
        self.inner.read_pending.load(Ordering::Acquire)
    }

    /// Returns `true` while a write drain is running.
    #[inline]
    #[must_use]
    pub fn is_write_in_progress(&self) -> bool {
        self.inner.write_in_progress.load(Ordering::Acquire)
    }

    /// Returns the number of queued outbound buffers.
    #[inline]
    #[must_use]
    pub fn pending_write_count(&self) -> usize {
        self.inner.pending_writes.lock().len()
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::channel_inactive(self.inner.id))
        }
    }
}

// ============================================================================
// Channel - Read Path
// ============================================================================

impl Channel {
    /// Starts a read loop.
    ///
    /// No-op if a read loop is already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelInactive`] if the channel is not `Open`, or
    /// [`Error::Config`] if called outside a Tokio runtime.
    pub fn begin_read(&self) -> Result<()> {
        self.ensure_active()?;
        if self
            .inner
            .read_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(channel_id = %self.inner.id, "Read already pending");
            return Ok(());
        }

        let channel = self.clone();
        let spawned = self.spawn_supervised("read loop", async move { channel.read_loop().await });
        if let Err(e) = spawned {
            self.inner.read_pending.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Runs read cycles until the peer closes, a fault occurs, or auto-read
    /// is off. Entered with `read_pending` set.
    async fn read_loop(&self) -> Result<()> {
        let mut handle = self.inner.config.recv.new_handle();

        loop {
            let outcome = self.read_cycle(&mut handle).await;
            handle.read_complete();
            self.inner.read_pending.store(false, Ordering::Release);
            self.inner.pipeline.fire_read_complete();

            match outcome {
                Ok(CycleEnd::PeerClosed) => {
                    debug!(channel_id = %self.inner.id, "Peer closed channel");
                    self.close_with(CloseStatus::NORMAL).await;
                    return Ok(());
                }
                Ok(CycleEnd::Yield | CycleEnd::Empty) => {}
                Err(e) if !self.is_active() => {
                    trace!(channel_id = %self.inner.id, error = %e, "Read loop stopped by close");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            if !self.inner.config.auto_read || !self.is_active() {
                return Ok(());
            }

            tokio::task::yield_now().await;

            if self
                .inner
                .read_pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another loop was started in the gap
                return Ok(());
            }
        }
    }

    /// One read cycle: receive until the handle says to yield.
    async fn read_cycle(&self, handle: &mut AllocHandle) -> Result<CycleEnd> {
        handle.reset();

        loop {
            let mut buf = self.inner.pipeline.allocate(handle.guess());
            handle.attempt(buf.capacity() - buf.len());

            let received = self
                .inner
                .stream
                .receive(&mut buf, &self.inner.read_cancel)
                .await?;

            match received {
                Received::Closed { status, reason } => {
                    handle.record(0);
                    debug!(channel_id = %self.inner.id, ?status, %reason, "Close frame received");
                    return Ok(CycleEnd::PeerClosed);
                }
                Received::Data {
                    kind: FrameKind::Text,
                    ..
                } => {
                    return Err(Error::protocol_violation(
                        "text frame received where only binary framing is valid",
                    ));
                }
                Received::Data { count: 0, .. } => {
                    handle.record(0);
                    trace!(channel_id = %self.inner.id, "Empty receive, ending read cycle");
                    return Ok(CycleEnd::Empty);
                }
                Received::Data { count, .. } => {
                    handle.record(count);
                    handle.inc_messages();
                    trace!(channel_id = %self.inner.id, count, "Buffer read");
                    self.inner.pipeline.fire_read(buf.freeze())?;

                    if !handle.continue_reading() {
                        return Ok(CycleEnd::Yield);
                    }
                }
            }
        }
    }
}

// ============================================================================
// Channel - Write Path
// ============================================================================

impl Channel {
    /// Queues `buf` for transmission without flushing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelInactive`] if the channel is not `Open`.
    pub fn write(&self, buf: Bytes) -> Result<()> {
        self.ensure_active()?;
        self.inner.pending_writes.lock().push_back(buf);
        Ok(())
    }

    /// Starts draining the pending write queue.
    ///
    /// Coalesced into the running drain if one is active.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelInactive`] if the channel is not `Open`, or
    /// [`Error::Config`] if called outside a Tokio runtime.
    pub fn flush(&self) -> Result<()> {
        self.ensure_active()?;
        if self
            .inner
            .write_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!(channel_id = %self.inner.id, "Flush coalesced into running drain");
            return Ok(());
        }

        let Some(token) = self.inner.write_cancel.lock().clone() else {
            self.inner.write_in_progress.store(false, Ordering::Release);
            return Err(Error::channel_inactive(self.inner.id));
        };

        let channel = self.clone();
        let spawned = self.spawn_supervised("write drain", async move { channel.drain(token).await });
        if let Err(e) = spawned {
            self.inner.write_in_progress.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Queues `buf` and flushes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelInactive`] if the channel is not `Open`.
    pub fn write_and_flush(&self, buf: Bytes) -> Result<()> {
        self.write(buf)?;
        self.flush()
    }

    /// Waits until the pending write queue is empty and no drain is running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelInactive`] if the channel is not `Open` or
    /// leaves `Open` before the queue drains.
    pub async fn wait_drained(&self) -> Result<()> {
        loop {
            let notified = self.inner.drained.notified();
            self.ensure_active()?;
            if !self.is_write_in_progress() && self.pending_write_count() == 0 {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Sends queued buffers in FIFO order until the queue is empty.
    /// Entered with `write_in_progress` set.
    async fn drain(&self, token: CancellationToken) -> Result<()> {
        loop {
            let next = self.inner.pending_writes.lock().front().cloned();

            match next {
                Some(buf) if buf.is_empty() => {
                    self.inner.pending_writes.lock().pop_front();
                    trace!(channel_id = %self.inner.id, "Dropped empty write");
                }

                Some(buf) => {
                    let len = buf.len();
                    // The flag stays set until `terminate` so no second
                    // drain re-sends the failed head.
                    self.inner.stream.send(buf, true, &token).await?;
                    self.inner.pending_writes.lock().pop_front();
                    trace!(channel_id = %self.inner.id, len, "Buffer written");
                }

                None => {
                    self.inner.write_in_progress.store(false, Ordering::Release);
                    self.inner.drained.notify_waiters();

                    // Pick up writes queued while the flag was being released
                    let raced = !self.inner.pending_writes.lock().is_empty()
                        && self.is_active()
                        && self
                            .inner
                            .write_in_progress
                            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok();
                    if !raced {
                        return Ok(());
                    }
                }
            }
        }
    }
}

// ============================================================================
// Channel - Lifecycle
// ============================================================================

impl Channel {
    /// Closes the channel gracefully.
    ///
    /// Idempotent and infallible: a failed or timed-out handshake aborts
    /// the stream instead of returning an error.
    pub async fn close(&self) {
        self.close_with(CloseStatus::NORMAL).await;
    }

    async fn close_with(&self, status: CloseStatus) {
        {
            let mut state = self.inner.state.lock();
            if matches!(
                *state,
                ChannelState::Closing | ChannelState::Closed | ChannelState::Aborted
            ) {
                return;
            }
            *state = ChannelState::Closing;
        }

        match self.inner.stream.state() {
            StreamState::Closed => {
                self.terminate(ChannelState::Closed);
                return;
            }
            StreamState::Aborted => {
                self.terminate(ChannelState::Aborted);
                return;
            }
            _ => {}
        }

        self.cancel_pending_write();
        debug!(channel_id = %self.inner.id, %status, "Closing channel");

        let close_cancel = CancellationToken::new();
        let close_timeout = self.inner.config.close_timeout;
        let result = timeout(
            close_timeout,
            self.inner.stream.close(status, "", &close_cancel),
        )
        .await;

        match result {
            Ok(Ok(())) => self.terminate(ChannelState::Closed),
            Ok(Err(e)) => {
                warn!(channel_id = %self.inner.id, error = %e, "Close handshake failed, aborting");
                self.inner.stream.abort();
                self.terminate(ChannelState::Aborted);
            }
            Err(_) => {
                close_cancel.cancel();
                warn!(
                    channel_id = %self.inner.id,
                    timeout_ms = close_timeout.as_millis() as u64,
                    "Close handshake timed out, aborting"
                );
                self.inner.stream.abort();
                self.terminate(ChannelState::Aborted);
            }
        }
    }

    /// Tears the stream down immediately.
    pub fn abort(&self) {
        self.cancel_pending_write();
        self.inner.stream.abort();
        self.terminate(ChannelState::Aborted);
    }

    /// Unsupported: a client-initiated tunnel has no bind phase.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn bind(&self) -> Result<()> {
        Err(Error::unsupported("bind"))
    }

    /// Unsupported: a client-initiated tunnel has no disconnect phase.
    ///
    /// # Errors
    ///
    /// Always returns [`Error::Unsupported`].
    pub fn disconnect(&self) -> Result<()> {
        Err(Error::unsupported("disconnect"))
    }

    /// Cancels a send blocked on the network.
    fn cancel_pending_write(&self) {
        match self.inner.write_cancel.lock().take() {
            Some(token) => token.cancel(),
            None => trace!(channel_id = %self.inner.id, "Write cancellation already disposed"),
        }
    }

    /// Enters a terminal state and releases resources exactly once.
    fn terminate(&self, terminal: ChannelState) {
        {
            let mut state = self.inner.state.lock();
            if state.is_terminal() {
                return;
            }
            *state = terminal;
        }

        self.inner.read_cancel.cancel();
        self.cancel_pending_write();
        let dropped = {
            let mut queue = self.inner.pending_writes.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.inner.write_in_progress.store(false, Ordering::Release);
        self.inner.drained.notify_waiters();
        self.inner.pipeline.fire_inactive();

        debug!(channel_id = %self.inner.id, state = ?terminal, dropped, "Channel terminated");
    }

    /// Spawns `task`, converting its failure or panic into
    /// fire-exception plus close.
    fn spawn_supervised<F>(&self, name: &'static str, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = Handle::try_current()
            .map_err(|_| Error::config(format!("{name} requires a Tokio runtime")))?;
        let channel = self.clone();
        handle.spawn(async move {
            let error = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => e,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_owned())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_owned());
                    Error::connection(format!("{name} panicked: {message}"))
                }
            };
            channel.fault(name, error).await;
        });
        Ok(())
    }

    /// Reports a loop fault downstream and closes.
    async fn fault(&self, task: &'static str, error: Error) {
        if !self.is_active() {
            debug!(channel_id = %self.inner.id, task, error = %error, "Fault after close ignored");
            return;
        }

        warn!(channel_id = %self.inner.id, task, error = %error, "Channel fault");
        let status = if error.is_protocol_violation() {
            CloseStatus::PROTOCOL_ERROR
        } else {
            CloseStatus::INTERNAL_ERROR
        };
        self.inner.pipeline.fire_exception(error);
        self.close_with(status).await;
    }
}

// ============================================================================
// Tests
// ============================================================================
