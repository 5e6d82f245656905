//! Channel-backed connection speaking the reference frame protocol.
//!
//! One [`FramedConnection`] owns one [`Channel`] and multiplexes device
//! sessions over it. The connection is its channel's [`Pipeline`]: inbound
//! buffers are decoded into frames, `deliver` frames are routed to the
//! owning session's queue, and `outcome` frames resolve pending requests.
//!
//! # Request Correlation
//!
//! Every request frame carries a [`RequestId`]. The caller parks on a
//! oneshot receiver keyed by that ID until the matching `outcome` arrives,
//! the request times out, or the channel goes inactive. When the channel
//! faults or closes, every pending request fails with
//! [`Error::ConnectionClosed`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelConfig, DuplexStream, Pipeline};
use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, DeliveryTag, RequestId};
use crate::protocol::{Disposition, Frame, FrameCodec, Message};

use super::identity::ConnectionIdentity;
use super::session::{ProtocolSession, TransportConnection};

// ============================================================================
// Constants
// ============================================================================

/// Maximum pending requests before rejecting new ones.
const MAX_PENDING_REQUESTS: usize = 100;

// ============================================================================
// Types
// ============================================================================

/// Map of request IDs to outcome channels.
type CorrelationMap = FxHashMap<RequestId, oneshot::Sender<Result<()>>>;

/// Map of session names to inbound queues.
type SessionMap = FxHashMap<String, mpsc::UnboundedSender<Message>>;

// ============================================================================
// FramedShared
// ============================================================================

/// State shared between the connection and its pipeline.
struct FramedShared {
    codec: Mutex<FrameCodec>,
    correlation: Mutex<CorrelationMap>,
    sessions: Mutex<SessionMap>,
    closed: AtomicBool,
}

impl FramedShared {
    fn new() -> Self {
        Self {
            codec: Mutex::new(FrameCodec::new()),
            correlation: Mutex::new(CorrelationMap::default()),
            sessions: Mutex::new(SessionMap::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn dispatch(&self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Deliver { device, message } => {
                let sessions = self.sessions.lock();
                match sessions.get(&device) {
                    Some(tx) => {
                        if tx.send(message).is_err() {
                            warn!(%device, "Session queue closed, delivery dropped");
                        }
                    }
                    None => warn!(%device, "Delivery for unknown session dropped"),
                }
                Ok(())
            }

            Frame::Outcome { id, error } => {
                let tx = self.correlation.lock().remove(&id);
                match tx {
                    Some(tx) => {
                        let result = match error {
                            Some(message) => Err(Error::remote(message)),
                            None => Ok(()),
                        };
                        let _ = tx.send(result);
                    }
                    None => warn!(%id, "Outcome for unknown request"),
                }
                Ok(())
            }

            other => Err(Error::protocol_violation(format!(
                "unexpected device-bound frame: {other:?}"
            ))),
        }
    }

    /// Fails all pending requests and closes session queues.
    fn shut(&self) {
        self.closed.store(true, Ordering::Release);

        let pending: Vec<_> = self.correlation.lock().drain().collect();
        let count = pending.len();
        for (_, tx) in pending {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
        self.sessions.lock().clear();

        if count > 0 {
            debug!(count, "Failed pending requests on close");
        }
    }
}

// ============================================================================
// FramedPipeline
// ============================================================================

/// The [`Pipeline`] a [`FramedConnection`] installs on its channel.
struct FramedPipeline {
    shared: Arc<FramedShared>,
}

impl Pipeline for FramedPipeline {
    fn fire_read(&self, buf: Bytes) -> Result<()> {
        let mut frames = Vec::new();
        {
            let mut codec = self.shared.codec.lock();
            codec.push(&buf);
            while let Some(frame) = codec.next_frame()? {
                frames.push(frame);
            }
        }

        for frame in frames {
            trace!(request_id = ?frame.request_id(), "Frame received");
            self.shared.dispatch(frame)?;
        }
        Ok(())
    }

    fn fire_read_complete(&self) {}

    fn fire_exception(&self, error: Error) {
        warn!(error = %error, "Framed connection faulted");
        self.shared.shut();
    }

    fn fire_inactive(&self) {
        self.shared.shut();
    }
}

// ============================================================================
// CorrelationGuard
// ============================================================================

/// Removes a correlation entry when the waiting request is dropped.
struct CorrelationGuard<'a> {
    shared: &'a FramedShared,
    id: RequestId,
}

impl Drop for CorrelationGuard<'_> {
    fn drop(&mut self) {
        if self.shared.correlation.lock().remove(&self.id).is_some() {
            trace!(id = %self.id, "Removed abandoned correlation");
        }
    }
}

/// Unregisters a session name unless the attach completed.
struct AttachGuard<'a> {
    shared: &'a FramedShared,
    name: &'a str,
    armed: bool,
}

impl AttachGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.shared.sessions.lock().remove(self.name).is_some() {
            debug!(session = %self.name, "Removed unattached session");
        }
    }
}

// ============================================================================
// FramedConnection
// ============================================================================

/// Internal shared state for a framed connection.
struct FramedInner {
    id: ConnectionId,
    channel: Channel,
    shared: Arc<FramedShared>,
    request_timeout: Duration,
}

impl Drop for FramedInner {
    fn drop(&mut self) {
        if !self.channel.state().is_terminal() {
            self.channel.abort();
        }
    }
}

/// A [`TransportConnection`] over one [`Channel`].
///
/// Cheap to clone; sessions hold a clone.
#[derive(Clone)]
pub struct FramedConnection {
    inner: Arc<FramedInner>,
}

impl fmt::Debug for FramedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedConnection")
            .field("id", &self.inner.id)
            .field("channel", &self.inner.channel)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl FramedConnection {
    /// Wraps `stream` in a channel and starts reading.
    ///
    /// Requests wait at most `request_timeout` for their outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid channel configuration, or
    /// [`Error::ChannelInactive`] if the stream is not open.
    pub fn new(
        stream: Box<dyn DuplexStream>,
        config: ChannelConfig,
        request_timeout: Duration,
    ) -> Result<Self> {
        let shared = Arc::new(FramedShared::new());
        let pipeline = Arc::new(FramedPipeline {
            shared: Arc::clone(&shared),
        });
        let channel = Channel::new(stream, pipeline, config)?;
        channel.begin_read()?;

        let id = ConnectionId::next();
        debug!(connection_id = %id, channel_id = %channel.id(), "Framed connection opened");

        Ok(Self {
            inner: Arc::new(FramedInner {
                id,
                channel,
                shared,
                request_timeout,
            }),
        })
    }

    /// Returns the underlying channel.
    #[inline]
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.inner.channel
    }

    /// Returns the number of requests awaiting an outcome.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.shared.correlation.lock().len()
    }

    /// Sends a request frame and waits for its outcome.
    async fn request(&self, frame: Frame) -> Result<()> {
        let shared: &FramedShared = &self.inner.shared;
        let id = frame
            .request_id()
            .ok_or_else(|| Error::protocol_violation("request frame without id"))?;

        if shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut correlation = shared.correlation.lock();
            if correlation.len() >= MAX_PENDING_REQUESTS {
                warn!(
                    pending = correlation.len(),
                    max = MAX_PENDING_REQUESTS,
                    "Too many pending requests"
                );
                return Err(Error::connection(format!(
                    "too many pending requests: {}/{MAX_PENDING_REQUESTS}",
                    correlation.len()
                )));
            }
            correlation.insert(id, tx);
        }
        let _guard = CorrelationGuard { shared, id };

        let bytes = FrameCodec::encode(&frame)?;
        self.inner.channel.write_and_flush(bytes)?;
        trace!(%id, "Request sent");

        match timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => Err(Error::timeout(
                format!("request {id}"),
                self.inner.request_timeout.as_millis() as u64,
            )),
        }
    }

    fn unregister(&self, name: &str) {
        self.inner.shared.sessions.lock().remove(name);
    }
}

#[async_trait]
impl TransportConnection for FramedConnection {
    fn id(&self) -> ConnectionId {
        self.inner.id
    }

    async fn open_session(&self, identity: &ConnectionIdentity) -> Result<Arc<dyn ProtocolSession>> {
        let name = identity.session_name();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut sessions = self.inner.shared.sessions.lock();
            if sessions.contains_key(&name) {
                return Err(Error::config(format!(
                    "session '{name}' is already attached to {}",
                    self.inner.id
                )));
            }
            sessions.insert(name.clone(), tx);
        }

        let guard = AttachGuard {
            shared: &self.inner.shared,
            name: &name,
            armed: true,
        };
        let attach = Frame::Attach {
            id: RequestId::generate(),
            device: name.clone(),
        };
        self.request(attach).await?;
        guard.disarm();

        debug!(connection_id = %self.inner.id, session = %name, "Session attached");
        Ok(Arc::new(FramedSession {
            connection: self.clone(),
            name,
            inbound: AsyncMutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_healthy(&self) -> bool {
        self.inner.channel.is_open() && !self.inner.shared.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.inner.channel.close().await;
    }

    fn abort(&self) {
        self.inner.channel.abort();
    }
}

// ============================================================================
// FramedSession
// ============================================================================

/// One device session on a [`FramedConnection`].
pub struct FramedSession {
    connection: FramedConnection,
    name: String,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    closed: AtomicBool,
}

impl fmt::Debug for FramedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedSession")
            .field("name", &self.name)
            .field("connection_id", &self.connection.inner.id)
            .finish_non_exhaustive()
    }
}

impl FramedSession {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::NotOpen)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ProtocolSession for FramedSession {
    async fn send(&self, message: Message) -> Result<()> {
        self.send_batch(vec![message]).await
    }

    async fn send_batch(&self, messages: Vec<Message>) -> Result<()> {
        self.ensure_open()?;
        self.connection
            .request(Frame::Send {
                id: RequestId::generate(),
                device: self.name.clone(),
                messages,
            })
            .await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Message>> {
        self.ensure_open()?;
        let mut inbound = self.inbound.lock().await;
        match timeout(wait, inbound.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(_) => Ok(None),
        }
    }

    async fn settle(&self, tag: &DeliveryTag, disposition: Disposition) -> Result<()> {
        self.ensure_open()?;
        self.connection
            .request(Frame::Settle {
                id: RequestId::generate(),
                device: self.name.clone(),
                tag: tag.clone(),
                outcome: disposition,
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.connection.unregister(&self.name);
        if !self.connection.is_healthy() {
            return Ok(());
        }

        let detach = Frame::Detach {
            id: RequestId::generate(),
            device: self.name.clone(),
        };
        self.connection.request(detach).await?;
        debug!(session = %self.name, "Session detached");
        Ok(())
    }
}

impl Drop for FramedSession {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.connection.unregister(&self.name);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_with_session(name: &str) -> (FramedShared, mpsc::UnboundedReceiver<Message>) {
        let shared = FramedShared::new();
        let (tx, rx) = mpsc::unbounded_channel();
        shared.sessions.lock().insert(name.to_string(), tx);
        (shared, rx)
    }

    #[test]
    fn test_deliver_routed_to_session() {
        let (shared, mut rx) = shared_with_session("dev-1");
        let message = Message::new(&b"hi"[..]).with_delivery_tag(DeliveryTag::new("t-1"));

        shared
            .dispatch(Frame::Deliver {
                device: "dev-1".into(),
                message: message.clone(),
            })
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), message);
    }

    #[test]
    fn test_outcome_resolves_request() {
        let shared = FramedShared::new();
        let id = RequestId::generate();
        let (tx, mut rx) = oneshot::channel();
        shared.correlation.lock().insert(id, tx);

        shared
            .dispatch(Frame::Outcome {
                id,
                error: Some("quota exceeded".into()),
            })
            .unwrap();
        let err = rx.try_recv().unwrap().unwrap_err();
        assert!(matches!(err, Error::Remote { .. }));
        assert!(shared.correlation.lock().is_empty());
    }

    #[test]
    fn test_device_bound_request_is_violation() {
        let shared = FramedShared::new();
        let err = shared
            .dispatch(Frame::Attach {
                id: RequestId::generate(),
                device: "dev-1".into(),
            })
            .unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_shut_fails_pending() {
        let (shared, mut inbound) = shared_with_session("dev-1");
        let (tx, mut rx) = oneshot::channel();
        shared.correlation.lock().insert(RequestId::generate(), tx);

        shared.shut();
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(Error::ConnectionClosed)
        ));
        assert!(inbound.try_recv().is_err());
        assert!(shared.closed.load(Ordering::Acquire));
    }

    #[test]
    fn test_pipeline_reassembles_split_frames() {
        let (shared, mut rx) = shared_with_session("dev-1");
        let pipeline = FramedPipeline {
            shared: Arc::new(shared),
        };
        let wire = FrameCodec::encode(&Frame::Deliver {
            device: "dev-1".into(),
            message: Message::new(&b"x"[..]),
        })
        .unwrap();

        let (head, tail) = wire.split_at(5);
        pipeline.fire_read(Bytes::copy_from_slice(head)).unwrap();
        assert!(rx.try_recv().is_err());
        pipeline.fire_read(Bytes::copy_from_slice(tail)).unwrap();
        assert_eq!(&rx.try_recv().unwrap().body[..], b"x");
    }
}
