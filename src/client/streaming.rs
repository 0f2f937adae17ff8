use std::sync::Arc;

use prost::Message;
use rama::bytes::{Bytes, BytesMut};
use rama::http::grpc::Status;
use rama::telemetry::tracing;
use tokio_util::codec::Decoder as _;

use super::{discard_leftover, marshal, status_from_trailers, unmarshal};
use crate::codec::GrpcWebFrameCodec;
use crate::transport::StreamTransport;
use crate::{GrpcWebError, Request};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotStarted,
    Draining,
    Exhausted,
}

/// Receiving side of a server streaming call.
///
/// Created by [`Client::server_streaming`](super::Client::server_streaming).
/// The request is sent by the first call to [`ServerStreamClient::recv`],
/// after which each call decodes the next response message into the output
/// message of the request, until the stream is exhausted.
pub struct ServerStreamClient<T, I, O> {
    transport: Arc<T>,
    request: Request<I, O>,
    codec: GrpcWebFrameCodec,
    state: State,
    status: Option<Status>,
}

impl<T, I, O> std::fmt::Debug for ServerStreamClient<T, I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStreamClient")
            .field("endpoint", &self.request.endpoint())
            .field("state", &self.state)
            .field("status", &self.status)
            .finish()
    }
}

impl<T, I, O> ServerStreamClient<T, I, O>
where
    T: StreamTransport,
    I: Message,
    O: Message,
{
    pub(super) fn new(transport: Arc<T>, request: Request<I, O>, codec: GrpcWebFrameCodec) -> Self {
        Self {
            transport,
            request,
            codec,
            state: State::NotStarted,
            status: None,
        }
    }

    /// Receive the next response message.
    ///
    /// Returns `Ok(None)` once the stream is exhausted, which is the case when
    /// the peer closed the stream or sent its trailers. Once exhausted,
    /// every following call returns `Ok(None)` as well.
    ///
    /// A failure to send the request is terminal.
    /// A message that cannot be decoded is reported, but does not end the stream.
    pub async fn recv(&mut self) -> Result<Option<&O>, GrpcWebError> {
        match self.state {
            State::Exhausted => return Ok(None),
            State::NotStarted => {
                self.state = State::Exhausted;
                let frame = marshal(self.request.input())?;
                self.transport.send(frame).await?;
                self.state = State::Draining;
                tracing::trace!(endpoint = self.request.endpoint(), "server streaming request sent");
            }
            State::Draining => (),
        }

        let received = match self.transport.receive().await {
            Ok(received) => received,
            Err(err) => {
                self.state = State::Exhausted;
                return Err(err);
            }
        };
        match self.accept(received) {
            Ok(true) => Ok(Some(self.request.output())),
            Ok(false) => {
                tracing::debug!(endpoint = self.request.endpoint(), "server stream exhausted");
                self.state = State::Exhausted;
                Ok(None)
            }
            Err(err @ GrpcWebError::UnmarshalFailed(_)) => Err(err),
            Err(err) => {
                self.state = State::Exhausted;
                Err(err)
            }
        }
    }

    /// Signal the end of the request stream and drain the final response,
    /// closing the underlying connection.
    ///
    /// Returns the final response message, if the peer sent one.
    /// The stream is exhausted afterwards, also when finishing failed.
    pub async fn finish(&mut self) -> Result<Option<&O>, GrpcWebError> {
        self.state = State::Exhausted;
        let received = match self.transport.finish().await {
            Ok(received) => received,
            Err(err) => {
                if let Err(close_err) = self.transport.close().await {
                    tracing::debug!("failed to close stream transport after finish failure: {close_err}");
                }
                return Err(err);
            }
        };
        if self.accept(received)? {
            Ok(Some(self.request.output()))
        } else {
            Ok(None)
        }
    }

    /// Close the underlying connection, exhausting the stream.
    ///
    /// Use [`ServerStreamClient::transport`] to close the stream
    /// from another task while a [`ServerStreamClient::recv`] is pending.
    pub async fn close(&mut self) -> Result<(), GrpcWebError> {
        self.state = State::Exhausted;
        self.transport.close().await
    }

    /// Returns `true` once the stream is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.state == State::Exhausted
    }

    /// The status sent by the peer in its trailers, if any was received.
    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    /// Shared handle to the underlying transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// The request of this call, holding the last received message as output.
    pub fn request(&self) -> &Request<I, O> {
        &self.request
    }

    /// Consume the stream into its request.
    pub fn into_request(self) -> Request<I, O> {
        self.request
    }

    // `Ok(true)` if a message was decoded into the output
    fn accept(&mut self, received: Option<Bytes>) -> Result<bool, GrpcWebError> {
        let Some(received) = received else {
            return Ok(false);
        };
        let mut buf = BytesMut::from(received);
        let Some(frame) = self.codec.decode_eof(&mut buf)? else {
            return Ok(false);
        };
        discard_leftover(&buf);

        if !frame.is_data() {
            if frame.is_trailer() {
                self.status = status_from_trailers(frame.payload());
            }
            tracing::trace!(flags = frame.flags(), "server stream received non-data frame");
            return Ok(false);
        }

        tracing::trace!(len = frame.payload().len(), "server stream message received");
        unmarshal(frame.into_payload(), self.request.output_mut())?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::codec::encode_frame;
    use crate::request::test_support::{SimpleRequest, SimpleResponse, request};
    use rama::http::grpc::Code;

    fn data(message: &str) -> Result<Option<Bytes>, GrpcWebError> {
        Ok(Some(encode_frame(
            &SimpleResponse {
                message: message.to_owned(),
            }
            .encode_to_vec(),
        )))
    }

    fn stream(
        transport: ScriptedStream,
    ) -> ServerStreamClient<ScriptedStream, SimpleRequest, SimpleResponse> {
        ServerStreamClient::new(
            Arc::new(transport),
            request("ServerStreaming", "ktr"),
            GrpcWebFrameCodec::new(),
        )
    }

    #[tokio::test]
    async fn three_messages_then_trailer_flag() {
        let mut stream = stream(ScriptedStream::new([
            data("one"),
            data("two"),
            data("three"),
            Ok(Some(Bytes::from_static(b"\x02\x00\x00\x00\x00"))),
        ]));

        let mut received = Vec::new();
        while let Some(msg) = stream.recv().await.unwrap() {
            received.push(msg.message.clone());
        }
        assert_eq!(received, ["one", "two", "three"]);
        assert!(stream.is_exhausted());

        let sent = stream.transport().sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0],
            encode_frame(
                &SimpleRequest {
                    name: "ktr".to_owned()
                }
                .encode_to_vec()
            )
        );
    }

    #[tokio::test]
    async fn end_of_stream_is_deterministic() {
        let mut stream = stream(ScriptedStream::new([data("one"), Ok(None), data("late")]));

        assert_eq!(stream.recv().await.unwrap().unwrap().message, "one");
        for _ in 0..3 {
            assert!(stream.recv().await.unwrap().is_none());
        }
        assert_eq!(stream.transport().responses.lock().len(), 1);
    }

    #[tokio::test]
    async fn trailer_status_is_kept() {
        let mut stream = stream(ScriptedStream::new([
            data("one"),
            Ok(Some(trailer_frame(b"grpc-status: 14\r\ngrpc-message: going away\r\n"))),
        ]));

        assert!(stream.recv().await.unwrap().is_some());
        assert!(stream.recv().await.unwrap().is_none());
        let status = stream.status().unwrap();
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "going away");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn only_first_frame_of_response_is_used() {
        let mut received = BytesMut::from(&data("one").unwrap().unwrap()[..]);
        received.extend_from_slice(&data("two").unwrap().unwrap());
        let mut stream = stream(ScriptedStream::new([Ok(Some(received.freeze())), Ok(None)]));

        assert_eq!(stream.recv().await.unwrap().unwrap().message, "one");
        assert!(logs_contain("discarding bytes after last frame"));
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_response_is_end_of_stream() {
        let mut stream = stream(ScriptedStream::new([Ok(Some(Bytes::new()))]));
        assert!(stream.recv().await.unwrap().is_none());
        assert!(stream.is_exhausted());
    }

    #[tokio::test]
    async fn send_failure_is_terminal() {
        let mut stream = stream(ScriptedStream {
            fail_send: true,
            ..ScriptedStream::new([data("one")])
        });

        let err = stream.recv().await.unwrap_err();
        assert!(matches!(err, GrpcWebError::SendFailed(_)), "{err}");
        assert!(stream.recv().await.unwrap().is_none());
        assert_eq!(stream.transport().responses.lock().len(), 1);
    }

    #[tokio::test]
    async fn receive_failure_is_terminal() {
        let mut stream = stream(ScriptedStream::new([
            Err(GrpcWebError::ReceiveFailed("connection reset".into())),
            data("one"),
        ]));

        let err = stream.recv().await.unwrap_err();
        assert!(matches!(err, GrpcWebError::ReceiveFailed(_)), "{err}");
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_terminal() {
        let frame = encode_frame(b"\x0a\x03one");
        let mut stream = stream(ScriptedStream::new([
            Ok(Some(frame.slice(..frame.len() - 1))),
            data("two"),
        ]));

        let err = stream.recv().await.unwrap_err();
        assert!(err.is_truncated_frame(), "{err}");
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undecodable_message_does_not_end_stream() {
        let mut stream = stream(ScriptedStream::new([
            Ok(Some(encode_frame(b"\xff\xff\xff"))),
            data("two"),
        ]));

        let err = stream.recv().await.unwrap_err();
        assert!(matches!(err, GrpcWebError::UnmarshalFailed(_)), "{err}");
        assert_eq!(stream.recv().await.unwrap().unwrap().message, "two");
    }

    #[tokio::test]
    async fn finish_drains_final_message() {
        let mut stream = stream(ScriptedStream::new([data("one"), data("last")]));

        assert_eq!(stream.recv().await.unwrap().unwrap().message, "one");
        assert_eq!(stream.finish().await.unwrap().unwrap().message, "last");
        assert!(stream.is_exhausted());
        assert!(stream.recv().await.unwrap().is_none());
        assert_eq!(*stream.transport().finished.lock(), 1);
    }

    #[tokio::test]
    async fn finish_failure_closes_transport() {
        let mut stream = stream(ScriptedStream::new([Err(GrpcWebError::FinishFailed(
            "broken pipe".into(),
        ))]));

        let err = stream.finish().await.unwrap_err();
        assert!(matches!(err, GrpcWebError::FinishFailed(_)), "{err}");
        assert_eq!(*stream.transport().closed.lock(), 1);
    }

    #[tokio::test]
    async fn close_exhausts_stream() {
        let mut stream = stream(ScriptedStream::new([data("one")]));

        stream.close().await.unwrap();
        assert!(stream.recv().await.unwrap().is_none());
        assert!(stream.transport().sent.lock().is_empty());
        assert_eq!(*stream.transport().closed.lock(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recv_and_finish_over_websocket_are_serialized() {
        use crate::transport::WebSocketTransport;
        use crate::transport::ws::test_support::channel_socket;

        let (socket, mut peer) = channel_socket();
        let mut stream = ServerStreamClient::new(
            Arc::new(WebSocketTransport::new(socket)),
            request("ServerStreaming", "ktr"),
            GrpcWebFrameCodec::new(),
        );

        let finisher = tokio::spawn({
            let transport = stream.transport().clone();
            async move { transport.finish().await }
        });
        // one response for each of recv and finish, whichever drains first
        peer.respond(&data("one").unwrap().unwrap());
        peer.respond(&data("two").unwrap().unwrap());

        let received = stream.recv().await.map(|msg| msg.is_some());
        finisher.await.unwrap().unwrap();
        assert!(peer.closed.try_recv().is_ok());

        // either the request went out in full before the end of stream marker,
        // or finish won and the request was never written
        let written = peer.written();
        assert_eq!(&written.last().unwrap()[..], b"\x01");
        match written.len() {
            3 => {
                assert!(written[0].starts_with(b"Content-Type"));
                assert_eq!(written[1][0], 0x00);
                assert!(received.is_ok());
            }
            1 => assert!(matches!(received, Err(GrpcWebError::SendFailed(_)))),
            n => panic!("unexpected number of written messages: {n}"),
        }
    }
}
