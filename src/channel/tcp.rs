//! Raw TCP implementation of [`DuplexStream`].
//!
//! Used by the MQTT and AMQP transports that do not tunnel through
//! WebSocket. Every read is [`FrameKind::Binary`]; framing is left to the
//! protocol codec. The close handshake is a write-half shutdown.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

use super::stream::{CloseStatus, DuplexStream, FrameKind, Received, StreamState};

// ============================================================================
// TcpDuplex
// ============================================================================

/// TCP connection usable as a [`DuplexStream`].
pub struct TcpDuplex {
    writer: AsyncMutex<Option<OwnedWriteHalf>>,
    reader: AsyncMutex<Option<OwnedReadHalf>>,
    state: Mutex<StreamState>,
    aborted: CancellationToken,
}

impl TcpDuplex {
    /// Connects to `addr` with `TCP_NODELAY` set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(peer = ?stream.peer_addr().ok(), "TCP connected");
        Ok(Self::new(stream))
    }

    /// Wraps an established TCP stream.
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            writer: AsyncMutex::new(Some(writer)),
            reader: AsyncMutex::new(Some(reader)),
            state: Mutex::new(StreamState::Open),
            aborted: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl DuplexStream for TcpDuplex {
    async fn send(
        &self,
        data: Bytes,
        _end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("send")),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::canceled("send")),
            _ = self.aborted.cancelled() => Err(Error::ConnectionClosed),
            result = writer.write_all(&data) => {
                result?;
                trace!(len = data.len(), "TCP bytes sent");
                Ok(())
            }
        }
    }

    async fn receive(&self, buf: &mut BytesMut, cancel: &CancellationToken) -> Result<Received> {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("receive")),
            guard = self.reader.lock() => guard,
        };
        let reader = guard.as_mut().ok_or(Error::ConnectionClosed)?;

        let count = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("receive")),
            _ = self.aborted.cancelled() => return Err(Error::ConnectionClosed),
            result = reader.read_buf(buf) => result?,
        };

        if count == 0 {
            debug!("TCP peer closed");
            let mut state = self.state.lock();
            if !state.is_terminal() {
                *state = StreamState::CloseReceived;
            }
            return Ok(Received::Closed {
                status: None,
                reason: String::new(),
            });
        }

        Ok(Received::Data {
            count,
            kind: FrameKind::Binary,
            end_of_message: true,
        })
    }

    async fn close(&self, status: CloseStatus, _reason: &str, cancel: &CancellationToken) -> Result<()> {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("close")),
            guard = self.writer.lock() => guard,
        };
        if let Some(mut writer) = guard.take() {
            writer.shutdown().await?;
        }
        *self.state.lock() = StreamState::Closed;
        debug!(%status, "TCP write half shut down");
        Ok(())
    }

    fn abort(&self) {
        {
            let mut state = self.state.lock();
            if *state == StreamState::Closed {
                return;
            }
            *state = StreamState::Aborted;
        }
        self.aborted.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        debug!("TCP aborted");
    }

    fn state(&self) -> StreamState {
        *self.state.lock()
    }
}

// ============================================================================
// Tests
// ============================================================================
