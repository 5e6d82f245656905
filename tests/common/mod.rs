//! Shared test doubles.
//!
//! Provides scripted implementations of the crate's seams:
//! - [`MockStream`] - scripted duplex stream for channel tests
//! - [`RecordingPipeline`] - pipeline that records every event
//! - [`MockFactory`] - connection factory with controllable sessions

#![allow(dead_code)]

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use device_transport::{
    CloseStatus, ConnectionFactory, ConnectionIdentity, ConnectionId, DeliveryTag, Disposition,
    DuplexStream, Error, FrameKind, Message, Pipeline, ProtocolSession, Received, Result,
    StreamState, TransportConnection, TransportSettings,
};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ============================================================================
// Logging
// ============================================================================

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Helpers
// ============================================================================

/// Polls `condition` until it holds, failing the test after 5 seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let polled = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), polled)
        .await
        .expect("condition not reached in time");
}

// ============================================================================
// MockStream
// ============================================================================

/// One scripted receive result.
#[derive(Debug, Clone)]
pub enum Step {
    /// A binary buffer.
    Data(Bytes),
    /// A text frame.
    Text(Bytes),
    /// A zero-byte receive.
    Empty,
    /// A peer close frame.
    Close,
    /// A receive error.
    Fail(&'static str),
}

/// How the stream answers a close handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    Ok,
    Fail,
    Hang,
}

/// State shared between a [`MockStream`] and the test.
pub struct MockShared {
    script: Mutex<VecDeque<Step>>,
    script_added: Notify,
    state: Mutex<StreamState>,
    sent: Mutex<Vec<Bytes>>,
    send_gate: watch::Sender<bool>,
    fail_sends: AtomicBool,
    close_behavior: Mutex<CloseBehavior>,
    sends: AtomicUsize,
    receives: AtomicUsize,
    closes: AtomicUsize,
    aborts: AtomicUsize,
}

impl MockShared {
    /// Appends a receive result.
    pub fn push(&self, step: Step) {
        self.script.lock().push_back(step);
        self.script_added.notify_one();
    }

    /// Appends a binary buffer.
    pub fn push_data(&self, data: &[u8]) {
        self.push(Step::Data(Bytes::copy_from_slice(data)));
    }

    /// Returns every buffer sent so far, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Blocks sends until [`release_sends`](Self::release_sends).
    pub fn hold_sends(&self) {
        self.send_gate.send_replace(false);
    }

    /// Unblocks sends.
    pub fn release_sends(&self) {
        self.send_gate.send_replace(true);
    }

    /// Makes every following send fail.
    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::Release);
    }

    /// Sets how the close handshake behaves.
    pub fn set_close(&self, behavior: CloseBehavior) {
        *self.close_behavior.lock() = behavior;
    }

    /// Returns the stream state.
    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::Acquire)
    }

    pub fn receives(&self) -> usize {
        self.receives.load(Ordering::Acquire)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::Acquire)
    }
}

/// Scripted [`DuplexStream`].
///
/// Receives pop the script in order and block once it is empty.
pub struct MockStream(Arc<MockShared>);

impl MockStream {
    /// Creates an open stream and its control handle.
    pub fn open() -> (Box<dyn DuplexStream>, Arc<MockShared>) {
        let shared = Arc::new(MockShared {
            script: Mutex::new(VecDeque::new()),
            script_added: Notify::new(),
            state: Mutex::new(StreamState::Open),
            sent: Mutex::new(Vec::new()),
            send_gate: watch::Sender::new(true),
            fail_sends: AtomicBool::new(false),
            close_behavior: Mutex::new(CloseBehavior::Ok),
            sends: AtomicUsize::new(0),
            receives: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        });
        (Box::new(Self(Arc::clone(&shared))), shared)
    }
}

#[async_trait]
impl DuplexStream for MockStream {
    async fn send(
        &self,
        data: Bytes,
        _end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.0.sends.fetch_add(1, Ordering::AcqRel);
        if self.0.state().is_terminal() {
            return Err(Error::ConnectionClosed);
        }

        let mut gate = self.0.send_gate.subscribe();
        let opened = async { gate.wait_for(|open| *open).await.is_ok() };
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::canceled("send")),
            opened = opened => {
                if !opened {
                    return Err(Error::ConnectionClosed);
                }
            }
        }

        if self.0.fail_sends.load(Ordering::Acquire) {
            return Err(Error::connection("scripted send failure"));
        }
        self.0.sent.lock().push(data);
        Ok(())
    }

    async fn receive(&self, buf: &mut BytesMut, cancel: &CancellationToken) -> Result<Received> {
        self.0.receives.fetch_add(1, Ordering::AcqRel);
        loop {
            let step = self.0.script.lock().pop_front();
            match step {
                Some(Step::Data(data)) => {
                    buf.extend_from_slice(&data);
                    return Ok(Received::Data {
                        count: data.len(),
                        kind: FrameKind::Binary,
                        end_of_message: true,
                    });
                }
                Some(Step::Text(data)) => {
                    buf.extend_from_slice(&data);
                    return Ok(Received::Data {
                        count: data.len(),
                        kind: FrameKind::Text,
                        end_of_message: true,
                    });
                }
                Some(Step::Empty) => {
                    return Ok(Received::Data {
                        count: 0,
                        kind: FrameKind::Binary,
                        end_of_message: true,
                    });
                }
                Some(Step::Close) => {
                    *self.0.state.lock() = StreamState::CloseReceived;
                    return Ok(Received::Closed {
                        status: Some(CloseStatus::NORMAL),
                        reason: "peer done".to_owned(),
                    });
                }
                Some(Step::Fail(message)) => return Err(Error::connection(message)),
                None => {}
            }

            if self.0.state().is_terminal() {
                return Err(Error::ConnectionClosed);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::canceled("receive")),
                _ = self.0.script_added.notified() => {}
            }
        }
    }

    async fn close(
        &self,
        _status: CloseStatus,
        _reason: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.0.closes.fetch_add(1, Ordering::AcqRel);
        let behavior = *self.0.close_behavior.lock();
        match behavior {
            CloseBehavior::Ok => {
                *self.0.state.lock() = StreamState::Closed;
                Ok(())
            }
            CloseBehavior::Fail => Err(Error::connection("scripted close failure")),
            CloseBehavior::Hang => {
                cancel.cancelled().await;
                Err(Error::canceled("close"))
            }
        }
    }

    fn abort(&self) {
        self.0.aborts.fetch_add(1, Ordering::AcqRel);
        *self.0.state.lock() = StreamState::Aborted;
        self.0.script_added.notify_one();
    }

    fn state(&self) -> StreamState {
        self.0.state()
    }
}

// ============================================================================
// RecordingPipeline
// ============================================================================

/// [`Pipeline`] that records every event it receives.
#[derive(Default)]
pub struct RecordingPipeline {
    reads: Mutex<Vec<Bytes>>,
    read_completes: AtomicUsize,
    /// `(message, is_protocol_violation)` per exception.
    exceptions: Mutex<Vec<(String, bool)>>,
    inactive: AtomicUsize,
}

impl RecordingPipeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns every buffer read so far, in order.
    pub fn reads(&self) -> Vec<Bytes> {
        self.reads.lock().clone()
    }

    /// Returns all bytes read so far, concatenated.
    pub fn read_bytes(&self) -> Vec<u8> {
        self.reads.lock().iter().flat_map(|b| b.iter().copied()).collect()
    }

    pub fn read_complete_count(&self) -> usize {
        self.read_completes.load(Ordering::Acquire)
    }

    pub fn exceptions(&self) -> Vec<(String, bool)> {
        self.exceptions.lock().clone()
    }

    pub fn inactive_count(&self) -> usize {
        self.inactive.load(Ordering::Acquire)
    }
}

impl Pipeline for RecordingPipeline {
    fn fire_read(&self, buf: Bytes) -> Result<()> {
        self.reads.lock().push(buf);
        Ok(())
    }

    fn fire_read_complete(&self) {
        self.read_completes.fetch_add(1, Ordering::AcqRel);
    }

    fn fire_exception(&self, error: Error) {
        let violation = error.is_protocol_violation();
        self.exceptions.lock().push((error.to_string(), violation));
    }

    fn fire_inactive(&self) {
        self.inactive.fetch_add(1, Ordering::AcqRel);
    }
}

// ============================================================================
// MockFactory
// ============================================================================

/// Knobs and records shared by a [`MockFactory`] and everything it creates.
#[derive(Default)]
pub struct MockBehavior {
    /// Every connect, open-session and session call.
    pub io_calls: AtomicUsize,
    pub connects: AtomicUsize,
    pub connection_closes: AtomicUsize,
    pub connection_aborts: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub hang_open: AtomicBool,
    pub hang_sends: AtomicBool,
    pub fail_send_fatal: AtomicBool,
    pub sent: Mutex<Vec<Vec<Message>>>,
    pub settled: Mutex<Vec<(DeliveryTag, Disposition)>>,
    pub inbound: Mutex<VecDeque<Message>>,
}

impl MockBehavior {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn io_calls(&self) -> usize {
        self.io_calls.load(Ordering::Acquire)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::Release);
    }

    /// Queues an inbound message carrying `tag`.
    pub fn deliver(&self, body: &'static str, tag: &str) {
        self.inbound
            .lock()
            .push_back(Message::new(body).with_delivery_tag(DeliveryTag::new(tag)));
    }

    fn io(&self) {
        self.io_calls.fetch_add(1, Ordering::AcqRel);
    }
}

/// [`ConnectionFactory`] producing in-memory connections.
pub struct MockFactory {
    pub behavior: Arc<MockBehavior>,
}

impl MockFactory {
    pub fn new(behavior: &Arc<MockBehavior>) -> Arc<Self> {
        Arc::new(Self {
            behavior: Arc::clone(behavior),
        })
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(
        &self,
        _identity: &ConnectionIdentity,
        _settings: &TransportSettings,
    ) -> Result<Arc<dyn TransportConnection>> {
        self.behavior.io();
        self.behavior.connects.fetch_add(1, Ordering::AcqRel);
        if self.behavior.fail_connect.load(Ordering::Acquire) {
            return Err(Error::connection("scripted connect failure"));
        }
        Ok(Arc::new(MockConnection {
            id: ConnectionId::next(),
            behavior: Arc::clone(&self.behavior),
            healthy: AtomicBool::new(true),
        }))
    }
}

/// In-memory [`TransportConnection`].
pub struct MockConnection {
    id: ConnectionId,
    behavior: Arc<MockBehavior>,
    healthy: AtomicBool,
}

#[async_trait]
impl TransportConnection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn open_session(
        &self,
        _identity: &ConnectionIdentity,
    ) -> Result<Arc<dyn ProtocolSession>> {
        self.behavior.io();
        if self.behavior.hang_open.load(Ordering::Acquire) {
            return std::future::pending().await;
        }
        Ok(Arc::new(MockSession {
            behavior: Arc::clone(&self.behavior),
        }))
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.behavior.connection_closes.fetch_add(1, Ordering::AcqRel);
        self.healthy.store(false, Ordering::Release);
    }

    fn abort(&self) {
        self.behavior.connection_aborts.fetch_add(1, Ordering::AcqRel);
        self.healthy.store(false, Ordering::Release);
    }
}

/// In-memory [`ProtocolSession`].
pub struct MockSession {
    behavior: Arc<MockBehavior>,
}

#[async_trait]
impl ProtocolSession for MockSession {
    async fn send(&self, message: Message) -> Result<()> {
        self.send_batch(vec![message]).await
    }

    async fn send_batch(&self, messages: Vec<Message>) -> Result<()> {
        self.behavior.io();
        if self.behavior.hang_sends.load(Ordering::Acquire) {
            return std::future::pending().await;
        }
        if self.behavior.fail_send_fatal.load(Ordering::Acquire) {
            return Err(Error::connection("scripted link loss"));
        }
        self.behavior.sent.lock().push(messages);
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        self.behavior.io();
        let next = self.behavior.inbound.lock().pop_front();
        match next {
            Some(message) => Ok(Some(message)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn settle(&self, tag: &DeliveryTag, disposition: Disposition) -> Result<()> {
        self.behavior.io();
        if self.behavior.hang_sends.load(Ordering::Acquire) {
            return std::future::pending().await;
        }
        self.behavior.settled.lock().push((tag.clone(), disposition));
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
