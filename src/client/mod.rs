//! grpc-web [`Client`], driving unary and server streaming calls over the
//! transports of [`crate::transport`].

use std::fmt;
use std::sync::Arc;

use prost::Message;
use rama::bytes::{Bytes, BytesMut};
use rama::http::body::util::BodyExt as _;
use rama::http::grpc::{Code, Status};
use rama::telemetry::tracing;
use rama::utils::macros::generate_set_and_with;
use tokio_util::codec::Decoder as _;

use crate::codec::{
    DEFAULT_MAX_DECODING_MESSAGE_SIZE, GrpcWebFrameCodec, decode_trailers, encode_frame,
    frame_len,
};
use crate::transport::{
    HttpTransportBuilder, StreamTransportBuilder, Transport, TransportBuilder,
    WebSocketTransportBuilder,
};
use crate::{CallContext, GrpcWebError, Request};

mod streaming;
#[doc(inline)]
pub use streaming::ServerStreamClient;

const SCHEMES: [&str; 4] = ["http://", "https://", "ws://", "wss://"];

#[derive(Debug, Clone)]
/// A grpc-web client bound to a single host.
///
/// Unary calls use a [`TransportBuilder`] (by default [`HttpTransportBuilder`]),
/// server streaming calls a [`StreamTransportBuilder`]
/// (by default [`WebSocketTransportBuilder`]).
/// A new transport is built for every call, the client itself
/// can be shared and used for any number of concurrent calls.
pub struct Client<B = HttpTransportBuilder, SB = WebSocketTransportBuilder> {
    host: String,
    transport_builder: B,
    stream_transport_builder: SB,
    max_decoding_message_size: usize,
}

impl Client {
    /// Create a new [`Client`] for the given host, e.g. `localhost:50051`.
    ///
    /// A leading `http://`, `https://`, `ws://` or `wss://` scheme is ignored.
    pub fn new(host: impl AsRef<str>) -> Self {
        let host = host.as_ref();
        let host = SCHEMES
            .iter()
            .find_map(|scheme| host.strip_prefix(scheme))
            .unwrap_or(host)
            .trim_end_matches('/');
        Self {
            host: host.to_owned(),
            transport_builder: HttpTransportBuilder::default(),
            stream_transport_builder: WebSocketTransportBuilder::default(),
            max_decoding_message_size: DEFAULT_MAX_DECODING_MESSAGE_SIZE,
        }
    }
}

impl<B, SB> Client<B, SB> {
    /// Use the given [`TransportBuilder`] for unary calls.
    pub fn with_transport_builder<T>(self, transport_builder: T) -> Client<T, SB> {
        Client {
            host: self.host,
            transport_builder,
            stream_transport_builder: self.stream_transport_builder,
            max_decoding_message_size: self.max_decoding_message_size,
        }
    }

    /// Use the given [`StreamTransportBuilder`] for server streaming calls.
    pub fn with_stream_transport_builder<T>(self, stream_transport_builder: T) -> Client<B, T> {
        Client {
            host: self.host,
            transport_builder: self.transport_builder,
            stream_transport_builder,
            max_decoding_message_size: self.max_decoding_message_size,
        }
    }

    generate_set_and_with! {
        /// Limit the maximum payload size of a response message.
        ///
        /// Default: 4 MiB.
        pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
            self.max_decoding_message_size = limit;
            self
        }
    }

    /// Host (authority) all calls are made to.
    pub fn host(&self) -> &str {
        &self.host
    }

    fn codec(&self) -> GrpcWebFrameCodec {
        GrpcWebFrameCodec::new().with_max_decoding_message_size(self.max_decoding_message_size)
    }
}

impl<B, SB> Client<B, SB>
where
    B: TransportBuilder,
    SB: StreamTransportBuilder,
{
    /// Perform a unary call.
    ///
    /// On success the response is decoded into the output message of the request.
    /// A response frame without payload leaves the output at its default value.
    pub async fn unary<I, O>(
        &self,
        ctx: &CallContext,
        req: &mut Request<I, O>,
    ) -> Result<(), GrpcWebError>
    where
        I: Message,
        O: Message,
    {
        let frame = marshal(req.input())?;

        let transport = self.transport_builder.build(&self.host, req.endpoint());
        tracing::debug!(host = %self.host, endpoint = req.endpoint(), "grpc-web unary call");

        let body = transport.send(ctx, frame).await?;
        let body = ctx
            .run(body.collect())
            .await
            .map_err(|err| GrpcWebError::ReceiveFailed(err.into()))?
            .map_err(|err| GrpcWebError::ReceiveFailed(err.into()))?
            .to_bytes();

        let mut buf = BytesMut::from(body);
        let mut codec = self.codec();

        let Some(frame) = codec.decode_eof(&mut buf)? else {
            return Err(GrpcWebError::ReceiveFailed(MissingResponse.into()));
        };
        if frame.is_trailer() {
            check_status(frame.payload())?;
            return Err(GrpcWebError::ReceiveFailed(MissingResponse.into()));
        }

        if let Some(trailer) = codec.decode_eof(&mut buf)?
            && trailer.is_trailer()
        {
            check_status(trailer.payload())?;
        }
        discard_leftover(&buf);

        tracing::trace!(len = frame.payload().len(), "grpc-web unary response received");
        unmarshal(frame.into_payload(), req.output_mut())
    }

    /// Start a server streaming call.
    ///
    /// Only the connection is established here, the request itself is sent
    /// by the first [`ServerStreamClient::recv`].
    pub async fn server_streaming<I, O>(
        &self,
        ctx: &CallContext,
        req: Request<I, O>,
    ) -> Result<ServerStreamClient<SB::Transport, I, O>, GrpcWebError>
    where
        I: Message,
        O: Message,
    {
        let transport = ctx
            .run(
                self.stream_transport_builder
                    .build(&self.host, req.endpoint()),
            )
            .await
            .map_err(|err| GrpcWebError::SendFailed(err.into()))??;

        tracing::debug!(
            host = %self.host,
            endpoint = req.endpoint(),
            "grpc-web server streaming call"
        );
        Ok(ServerStreamClient::new(
            Arc::new(transport),
            req,
            self.codec(),
        ))
    }
}

fn discard_leftover(buf: &BytesMut) {
    if !buf.is_empty() {
        tracing::debug!(len = buf.len(), "grpc-web response: discarding bytes after last frame");
    }
}

fn marshal<M: Message>(msg: &M) -> Result<Bytes, GrpcWebError> {
    let len = msg.encoded_len();
    frame_len(len).map_err(|err| GrpcWebError::MarshalFailed(err.into()))?;
    let mut buf = BytesMut::with_capacity(len);
    msg.encode(&mut buf)
        .map_err(|err| GrpcWebError::MarshalFailed(err.into()))?;
    Ok(encode_frame(&buf))
}

fn unmarshal<M: Message>(payload: Bytes, output: &mut M) -> Result<(), GrpcWebError> {
    output.clear();
    output
        .merge(payload)
        .map_err(|err| GrpcWebError::UnmarshalFailed(err.into()))
}

fn status_from_trailers(payload: &[u8]) -> Option<Status> {
    Status::from_header_map(&decode_trailers(payload))
}

fn check_status(trailers: &[u8]) -> Result<(), GrpcWebError> {
    match status_from_trailers(trailers) {
        Some(status) if status.code() != Code::Ok => Err(GrpcWebError::Status(status)),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
/// Cause of a [`GrpcWebError::ReceiveFailed`] when a unary
/// response completed without a response message.
pub struct MissingResponse;

impl fmt::Display for MissingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("response did not contain a message")
    }
}

impl std::error::Error for MissingResponse {}
