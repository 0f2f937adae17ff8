//! Full-duplex grpc-web transport over a websocket (`grpc-websockets` sub protocol).
//!
//! Wire convention:
//!
//! - the first message sent is the request headers, serialized http/1 style;
//! - every request frame is sent as `0x00 ++ frame`;
//! - the end of the request stream is signalled by the single byte `0x01`;
//! - each response is read as a group of four messages,
//!   of which the first two are skipped and the last two form the response frame.

use std::fmt;

use rama::bytes::{BufMut as _, Bytes, BytesMut};
use rama::error::BoxError;
use rama::extensions::Extensions;
use rama::http::headers::SecWebSocketProtocol;
use rama::http::ws::handshake::client::{ClientWebSocket, HttpClientWebSocketExt as _};
use rama::telemetry::tracing;
use rama::utils::str::non_empty_str;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{HttpClient, StreamTransport, StreamTransportBuilder};
use crate::GrpcWebError;

const REQUEST_HEADERS: &[u8] = b"Content-Type: application/grpc-web+proto\r\nX-Grpc-Web: 1\r\n";

const DATA_MARKER: u8 = 0x00;
const END_OF_STREAM_MARKER: u8 = 0x01;

/// Number of socket messages making up a single response.
const RESPONSE_MESSAGE_COUNT: usize = 4;
/// Leading messages of a response which are not part of the frame.
const RESPONSE_SKIPPED_MESSAGES: usize = 2;

/// Message oriented socket underneath a [`WebSocketTransport`].
///
/// Implemented for [`ClientWebSocket`], only binary (and text) payloads are exposed.
pub trait MessageSocket: Send + 'static {
    /// Write a single binary message.
    fn send_binary(&mut self, data: Bytes) -> impl Future<Output = Result<(), BoxError>> + Send;

    /// Read the payload of the next data message,
    /// `Ok(None)` once the peer closed the socket.
    fn recv_binary(&mut self) -> impl Future<Output = Result<Option<Bytes>, BoxError>> + Send;

    /// Perform the closing handshake.
    fn close(&mut self) -> impl Future<Output = Result<(), BoxError>> + Send;
}

impl MessageSocket for ClientWebSocket {
    async fn send_binary(&mut self, data: Bytes) -> Result<(), BoxError> {
        self.send_message(data.into()).await?;
        Ok(())
    }

    async fn recv_binary(&mut self) -> Result<Option<Bytes>, BoxError> {
        loop {
            let msg = self.recv_message().await?;
            if msg.is_binary() || msg.is_text() {
                return Ok(Some(msg.into_data()));
            }
            if msg.is_close() {
                tracing::debug!("grpc-websockets peer closed the socket");
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        (**self).close(None).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
/// Error cause used when a [`WebSocketTransport`] is used after it was closed.
pub struct ConnectionClosed;

impl fmt::Display for ConnectionClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection closed")
    }
}

impl std::error::Error for ConnectionClosed {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Error cause used when the peer closed the socket in the middle of a response.
pub struct IncompleteResponse {
    /// Messages received before the socket closed.
    pub received: usize,
}

impl fmt::Display for IncompleteResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "socket closed after {} of {RESPONSE_MESSAGE_COUNT} response messages",
            self.received
        )
    }
}

impl std::error::Error for IncompleteResponse {}

struct Connection<S> {
    socket: Option<S>,
    headers_sent: bool,
}

/// [`StreamTransport`] over a single websocket connection.
///
/// All reads and writes are serialized over one lock,
/// the request headers are written exactly once, in front of the first frame.
pub struct WebSocketTransport<S = ClientWebSocket> {
    conn: Mutex<Connection<S>>,
    closed: CancellationToken,
}

impl<S> fmt::Debug for WebSocketTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl<S: MessageSocket> WebSocketTransport<S> {
    /// Create a new [`WebSocketTransport`] on top of an established socket.
    pub fn new(socket: S) -> Self {
        Self {
            conn: Mutex::new(Connection {
                socket: Some(socket),
                headers_sent: false,
            }),
            closed: CancellationToken::new(),
        }
    }
}

async fn receive_response<S: MessageSocket>(
    socket: &mut S,
) -> Result<Option<Bytes>, GrpcWebError> {
    let mut frame = BytesMut::new();
    for received in 0..RESPONSE_MESSAGE_COUNT {
        let msg = match socket.recv_binary().await {
            Ok(Some(msg)) => msg,
            Ok(None) if received == 0 => return Ok(None),
            Ok(None) => {
                return Err(GrpcWebError::ReceiveFailed(
                    IncompleteResponse { received }.into(),
                ));
            }
            Err(err) => return Err(GrpcWebError::ReceiveFailed(err)),
        };
        if received < RESPONSE_SKIPPED_MESSAGES {
            tracing::trace!(len = msg.len(), "skip grpc-websockets response preamble");
            continue;
        }
        frame.extend_from_slice(&msg);
    }
    Ok(Some(frame.freeze()))
}

async fn finish_stream<S: MessageSocket>(socket: &mut S) -> Result<Option<Bytes>, GrpcWebError> {
    socket
        .send_binary(Bytes::from_static(&[END_OF_STREAM_MARKER]))
        .await
        .map_err(GrpcWebError::FinishFailed)?;
    let response = receive_response(socket)
        .await
        .map_err(|err| GrpcWebError::FinishFailed(err.into()))?;
    socket.close().await.map_err(GrpcWebError::FinishFailed)?;
    Ok(response)
}

impl<S: MessageSocket> StreamTransport for WebSocketTransport<S> {
    async fn send(&self, frame: Bytes) -> Result<(), GrpcWebError> {
        let mut conn = self.conn.lock().await;
        let Connection {
            socket,
            headers_sent,
        } = &mut *conn;
        let socket = socket
            .as_mut()
            .ok_or_else(|| GrpcWebError::SendFailed(ConnectionClosed.into()))?;

        if !*headers_sent {
            socket
                .send_binary(Bytes::from_static(REQUEST_HEADERS))
                .await
                .map_err(GrpcWebError::SendFailed)?;
            *headers_sent = true;
            tracing::trace!("grpc-websockets request headers sent");
        }

        let mut msg = BytesMut::with_capacity(1 + frame.len());
        msg.put_u8(DATA_MARKER);
        msg.extend_from_slice(&frame);
        socket
            .send_binary(msg.freeze())
            .await
            .map_err(GrpcWebError::SendFailed)
    }

    async fn receive(&self) -> Result<Option<Bytes>, GrpcWebError> {
        let mut conn = self.conn.lock().await;
        let Some(socket) = conn.socket.as_mut() else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            result = receive_response(socket) => result,
        }
    }

    async fn finish(&self) -> Result<Option<Bytes>, GrpcWebError> {
        let mut conn = self.conn.lock().await;
        let Some(socket) = conn.socket.as_mut() else {
            return Err(GrpcWebError::FinishFailed(ConnectionClosed.into()));
        };

        // on cancellation the socket stays in place, to be closed by `close`
        let result = tokio::select! {
            biased;
            _ = self.closed.cancelled() => {
                return Err(GrpcWebError::FinishFailed(ConnectionClosed.into()));
            }
            result = finish_stream(socket) => result,
        };
        conn.socket = None;

        tracing::debug!(ok = result.is_ok(), "grpc-websockets stream finished");
        result
    }

    async fn close(&self) -> Result<(), GrpcWebError> {
        self.closed.cancel();
        let mut conn = self.conn.lock().await;
        let Some(mut socket) = conn.socket.take() else {
            return Ok(());
        };
        tracing::debug!("close grpc-websockets connection");
        socket.close().await.map_err(GrpcWebError::FinishFailed)
    }
}

#[derive(Debug, Clone, Default)]
/// Default [`StreamTransportBuilder`], dialing a websocket
/// to `ws://<host><endpoint>` with the `grpc-websockets` sub protocol.
pub struct WebSocketTransportBuilder {
    client: HttpClient,
}

impl WebSocketTransportBuilder {
    /// Create a new [`WebSocketTransportBuilder`] using the given http client.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

impl StreamTransportBuilder for WebSocketTransportBuilder {
    type Transport = WebSocketTransport<ClientWebSocket>;

    async fn build(&self, host: &str, endpoint: &str) -> Result<Self::Transport, GrpcWebError> {
        let url = format!("ws://{host}{endpoint}");
        tracing::debug!(%url, "dial grpc-websockets connection");

        let socket = self
            .client
            .websocket(url)
            .with_protocols(SecWebSocketProtocol::new(non_empty_str!(
                "grpc-websockets"
            )))
            .handshake(Extensions::default())
            .await
            .map_err(|err| GrpcWebError::SendFailed(err.into()))?;

        Ok(WebSocketTransport::new(socket))
    }
}
