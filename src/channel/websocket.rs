//! WebSocket implementation of [`DuplexStream`].
//!
//! Wraps a `tokio-tungstenite` client stream. Binary messages carry data;
//! text messages are reported as [`FrameKind::Text`] and left for the channel
//! to reject. Ping/pong frames are answered by tungstenite and skipped here.
//!
//! A message larger than the buffer offered to [`receive`](DuplexStream::receive)
//! is delivered across several receives, the last one flagged
//! `end_of_message`.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::error::{Error, Result};

use super::stream::{CloseStatus, DuplexStream, FrameKind, Received, StreamState};

// ============================================================================
// Types
// ============================================================================

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsSource<S> = SplitStream<WebSocketStream<S>>;

/// Read half plus the unread remainder of the current message.
struct SourceState<S> {
    stream: Option<WsSource<S>>,
    pending: Bytes,
    pending_kind: FrameKind,
}

// ============================================================================
// WebSocketDuplex
// ============================================================================

/// Client WebSocket connection usable as a [`DuplexStream`].
pub struct WebSocketDuplex<S> {
    sink: AsyncMutex<Option<WsSink<S>>>,
    source: AsyncMutex<SourceState<S>>,
    state: Mutex<StreamState>,
    aborted: CancellationToken,
}

impl WebSocketDuplex<MaybeTlsStream<TcpStream>> {
    /// Dials `url` and completes the WebSocket handshake.
    ///
    /// # Arguments
    ///
    /// * `url` - `ws://` or `wss://` endpoint
    /// * `subprotocol` - Value for `Sec-WebSocket-Protocol`
    ///
    /// # Errors
    ///
    /// Returns [`Error::WebSocket`] if the connection or handshake fails.
    pub async fn connect(url: &Url, subprotocol: &'static str) -> Result<Self> {
        let mut request = url.as_str().into_client_request()?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(subprotocol));

        let (ws_stream, response) = tokio_tungstenite::connect_async(request).await?;
        debug!(%url, status = %response.status(), subprotocol, "WebSocket connected");

        Ok(Self::new(ws_stream))
    }
}

impl<S> WebSocketDuplex<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an established WebSocket stream.
    #[must_use]
    pub fn new(ws_stream: WebSocketStream<S>) -> Self {
        let (sink, source) = ws_stream.split();
        Self {
            sink: AsyncMutex::new(Some(sink)),
            source: AsyncMutex::new(SourceState {
                stream: Some(source),
                pending: Bytes::new(),
                pending_kind: FrameKind::Binary,
            }),
            state: Mutex::new(StreamState::Open),
            aborted: CancellationToken::new(),
        }
    }

    fn set_state(&self, state: StreamState) {
        let mut current = self.state.lock();
        if !current.is_terminal() {
            *current = state;
        }
    }

    /// Moves up to the buffer's spare capacity from the pending remainder.
    fn take_pending(source: &mut SourceState<S>, buf: &mut BytesMut) -> Received {
        let spare = buf.capacity() - buf.len();
        let count = spare.min(source.pending.len());
        buf.extend_from_slice(&source.pending.split_to(count));
        Received::Data {
            count,
            kind: source.pending_kind,
            end_of_message: source.pending.is_empty(),
        }
    }
}

#[async_trait]
impl<S> DuplexStream for WebSocketDuplex<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(
        &self,
        data: Bytes,
        end_of_message: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !end_of_message {
            return Err(Error::unsupported("fragmented WebSocket send"));
        }

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("send")),
            guard = self.sink.lock() => guard,
        };
        let sink = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        let len = data.len();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::canceled("send")),
            _ = self.aborted.cancelled() => Err(Error::ConnectionClosed),
            result = sink.send(Message::Binary(data)) => {
                result?;
                trace!(len, "WebSocket binary message sent");
                Ok(())
            }
        }
    }

    async fn receive(&self, buf: &mut BytesMut, cancel: &CancellationToken) -> Result<Received> {
        let mut source = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("receive")),
            guard = self.source.lock() => guard,
        };

        loop {
            if !source.pending.is_empty() {
                return Ok(Self::take_pending(&mut source, buf));
            }

            let stream = source.stream.as_mut().ok_or(Error::ConnectionClosed)?;
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::canceled("receive")),
                _ = self.aborted.cancelled() => return Err(Error::ConnectionClosed),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(data))) => {
                    if data.is_empty() {
                        return Ok(Received::Data {
                            count: 0,
                            kind: FrameKind::Binary,
                            end_of_message: true,
                        });
                    }
                    source.pending = data;
                    source.pending_kind = FrameKind::Binary;
                }

                Some(Ok(Message::Text(text))) => {
                    if text.is_empty() {
                        return Ok(Received::Data {
                            count: 0,
                            kind: FrameKind::Text,
                            end_of_message: true,
                        });
                    }
                    source.pending = Bytes::copy_from_slice(text.as_str().as_bytes());
                    source.pending_kind = FrameKind::Text;
                }

                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket close frame received");
                    self.set_state(StreamState::CloseReceived);
                    let (status, reason) = match frame {
                        Some(frame) => (
                            Some(CloseStatus::new(u16::from(frame.code))),
                            frame.reason.as_str().to_owned(),
                        ),
                        None => (None, String::new()),
                    };
                    return Ok(Received::Closed { status, reason });
                }

                // Control frames are handled by tungstenite
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}

                Some(Err(e)) => return Err(e.into()),

                None => {
                    debug!("WebSocket stream ended");
                    self.set_state(StreamState::Closed);
                    return Ok(Received::Closed {
                        status: None,
                        reason: String::new(),
                    });
                }
            }
        }
    }

    async fn close(&self, status: CloseStatus, reason: &str, cancel: &CancellationToken) -> Result<()> {
        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("close")),
            guard = self.sink.lock() => guard,
        };
        let Some(sink) = guard.as_mut() else {
            return Ok(());
        };

        let frame = CloseFrame {
            code: CloseCode::from(status.code()),
            reason: reason.to_owned().into(),
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::canceled("close")),
            result = sink.send(Message::Close(Some(frame))) => result,
        };

        match result {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {}
            Err(e) => return Err(e.into()),
        }

        // Dropping the write half ends the handshake from our side
        guard.take();
        self.set_state(StreamState::Closed);
        debug!(%status, "WebSocket close handshake sent");
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
        if let Ok(mut sink) = self.sink.try_lock() {
            sink.take();
        }
        if let Ok(mut source) = self.source.try_lock() {
            source.stream.take();
        }
        debug!("WebSocket aborted");
    }

    fn state(&self) -> StreamState {
        *self.state.lock()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    use crate::channel::{Channel, ChannelConfig, ChannelState, Pipeline};

    type Server = WebSocketStream<TcpStream>;

    fn echo_subprotocol(
        request: &Request,
        mut response: Response,
    ) -> std::result::Result<Response, ErrorResponse> {
        if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", protocol.clone());
        }
        Ok(response)
    }

    async fn pair() -> (WebSocketDuplex<MaybeTlsStream<TcpStream>>, Server) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let url = Url::parse(&format!("ws://127.0.0.1:{port}/$iothub/websocket")).expect("url");

        let accept = async {
            let (tcp, _) = listener.accept().await.expect("accept");
            tokio_tungstenite::accept_hdr_async(tcp, echo_subprotocol)
                .await
                .expect("server handshake")
        };
        let (client, server) = tokio::join!(WebSocketDuplex::connect(&url, "mqtt"), accept);
        (client.expect("connect"), server)
    }

    #[tokio::test]
    async fn test_send_and_receive_binary() {
        let (client, mut server) = pair().await;
        let cancel = CancellationToken::new();

        client
            .send(Bytes::from_static(b"ping"), true, &cancel)
            .await
            .expect("send");
        let inbound = server.next().await.expect("frame").expect("message");
        assert_eq!(inbound, Message::binary(&b"ping"[..]));

        server.send(Message::binary(&b"pong"[..])).await.expect("server send");
        let mut buf = BytesMut::with_capacity(16);
        let received = client.receive(&mut buf, &cancel).await.expect("receive");
        assert_eq!(
            received,
            Received::Data {
                count: 4,
                kind: FrameKind::Binary,
                end_of_message: true,
            }
        );
        assert_eq!(&buf[..], b"pong");
    }

    #[tokio::test]
    async fn test_fragmented_send_unsupported() {
        let (client, _server) = pair().await;
        let err = client
            .send(Bytes::from_static(b"x"), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_large_message_split_across_receives() {
        let (client, mut server) = pair().await;
        let cancel = CancellationToken::new();
        server
            .send(Message::binary(&b"0123456789"[..]))
            .await
            .expect("server send");

        let mut chunks = Vec::new();
        let mut body = Vec::new();
        loop {
            let mut buf = BytesMut::with_capacity(4);
            match client.receive(&mut buf, &cancel).await.expect("receive") {
                Received::Data {
                    count,
                    end_of_message,
                    ..
                } => {
                    chunks.push(count);
                    body.extend_from_slice(&buf);
                    if end_of_message {
                        break;
                    }
                }
                other => panic!("unexpected receive: {other:?}"),
            }
        }

        assert_eq!(chunks, vec![4, 4, 2]);
        assert_eq!(body, b"0123456789");
    }

    #[tokio::test]
    async fn test_text_frame_reported_as_text() {
        let (client, mut server) = pair().await;
        server.send(Message::text("hello")).await.expect("server send");

        let mut buf = BytesMut::with_capacity(16);
        let received = client
            .receive(&mut buf, &CancellationToken::new())
            .await
            .expect("receive");
        assert!(matches!(
            received,
            Received::Data {
                count: 5,
                kind: FrameKind::Text,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_ping_skipped() {
        let (client, mut server) = pair().await;
        server
            .send(Message::Ping(Bytes::from_static(b"hb")))
            .await
            .expect("server ping");
        server.send(Message::binary(&b"data"[..])).await.expect("server send");

        let mut buf = BytesMut::with_capacity(16);
        let received = client
            .receive(&mut buf, &CancellationToken::new())
            .await
            .expect("receive");
        assert!(matches!(received, Received::Data { count: 4, .. }));
        assert_eq!(&buf[..], b"data");
    }

    #[tokio::test]
    async fn test_peer_close_frame_reported() {
        let (client, mut server) = pair().await;
        server
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            })))
            .await
            .expect("server close");

        let mut buf = BytesMut::with_capacity(16);
        let received = client
            .receive(&mut buf, &CancellationToken::new())
            .await
            .expect("receive");
        assert_eq!(
            received,
            Received::Closed {
                status: Some(CloseStatus::NORMAL),
                reason: "bye".to_owned(),
            }
        );
        assert_eq!(client.state(), StreamState::CloseReceived);
    }

    #[tokio::test]
    async fn test_close_handshake_reaches_peer() {
        let (client, mut server) = pair().await;

        client
            .close(CloseStatus::NORMAL, "done", &CancellationToken::new())
            .await
            .expect("close");
        assert_eq!(client.state(), StreamState::Closed);

        match server.next().await.expect("frame").expect("message") {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason.as_str(), "done");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        client.abort();
        assert_eq!(client.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_abort_fails_later_io() {
        let (client, _server) = pair().await;
        let cancel = CancellationToken::new();

        client.abort();
        assert_eq!(client.state(), StreamState::Aborted);

        let mut buf = BytesMut::with_capacity(16);
        assert!(matches!(
            client.receive(&mut buf, &cancel).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(matches!(
            client.send(Bytes::from_static(b"x"), true, &cancel).await,
            Err(Error::ConnectionClosed)
        ));
    }

    /// Counts protocol violations seen by the channel.
    #[derive(Default)]
    struct ViolationCounter {
        violations: Mutex<usize>,
    }

    impl Pipeline for ViolationCounter {
        fn fire_read(&self, _buf: Bytes) -> Result<()> {
            Ok(())
        }

        fn fire_read_complete(&self) {}

        fn fire_exception(&self, error: Error) {
            if error.is_protocol_violation() {
                *self.violations.lock() += 1;
            }
        }
    }

    #[tokio::test]
    async fn test_channel_rejects_text_frame() {
        let (client, mut server) = pair().await;
        let pipeline = Arc::new(ViolationCounter::default());
        let channel = Channel::new(
            Box::new(client),
            Arc::clone(&pipeline) as Arc<dyn Pipeline>,
            ChannelConfig::new(),
        )
        .expect("channel");

        channel.begin_read().expect("begin read");
        server.send(Message::text("nope")).await.expect("server send");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !channel.state().is_terminal() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel closed");

        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(*pipeline.violations.lock(), 1);
    }
}
