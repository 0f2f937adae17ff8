//! Transports carrying grpc-web frames to and from the server.
//!
//! - [`Transport`]: a single request/response exchange, see [`HttpTransport`];
//! - [`StreamTransport`]: a persistent full-duplex connection, see [`WebSocketTransport`].
//!
//! Both are created per call by a builder ([`TransportBuilder`], [`StreamTransportBuilder`]),
//! which is the seam used to plug in custom transports or test doubles.

use std::pin::Pin;
use std::sync::Arc;

use rama::bytes::Bytes;
use rama::error::BoxError;
use rama::http::{Body, Request, Response};
use rama::Service;

use crate::{CallContext, GrpcWebError};

pub mod http;
#[doc(inline)]
pub use http::{HttpTransport, HttpTransportBuilder};

pub mod ws;
#[doc(inline)]
pub use ws::{MessageSocket, WebSocketTransport, WebSocketTransportBuilder};

/// Content type used for binary (protobuf) grpc-web messages.
pub const GRPC_WEB_PROTO: &str = "application/grpc-web+proto";

/// Header marking a request as grpc-web.
pub const X_GRPC_WEB: &str = "x-grpc-web";

/// Sub protocol negotiated for grpc-web over websockets.
pub const GRPC_WEBSOCKETS_PROTOCOL: &str = "grpc-websockets";

/// Single-shot request/response transport.
///
/// A transport is created for exactly one call:
/// [`Transport::send`] may only be called once per instance.
pub trait Transport: Send + Sync + 'static {
    /// Send a framed request and return the (framed) response body.
    fn send(
        &self,
        ctx: &CallContext,
        frame: Bytes,
    ) -> impl Future<Output = Result<Body, GrpcWebError>> + Send;
}

/// Persistent full-duplex transport used for streaming calls.
pub trait StreamTransport: Send + Sync + 'static {
    /// Send a (framed) request message.
    fn send(&self, frame: Bytes) -> impl Future<Output = Result<(), GrpcWebError>> + Send;

    /// Receive the next response frame.
    ///
    /// Returns `Ok(None)` once the peer ended the stream.
    fn receive(&self) -> impl Future<Output = Result<Option<Bytes>, GrpcWebError>> + Send;

    /// Signal that no more requests will be sent,
    /// drain the final response and close the connection.
    fn finish(&self) -> impl Future<Output = Result<Option<Bytes>, GrpcWebError>> + Send;

    /// Close the connection. Safe to call more than once.
    fn close(&self) -> impl Future<Output = Result<(), GrpcWebError>> + Send;
}

/// Creates a [`Transport`] for a single call.
pub trait TransportBuilder: Send + Sync + 'static {
    /// The [`Transport`] created by this builder.
    type Transport: Transport;

    /// Create a transport targeting the given host and endpoint path.
    fn build(&self, host: &str, endpoint: &str) -> Self::Transport;
}

impl<F, T> TransportBuilder for F
where
    F: Fn(&str, &str) -> T + Send + Sync + 'static,
    T: Transport,
{
    type Transport = T;

    fn build(&self, host: &str, endpoint: &str) -> Self::Transport {
        (self)(host, endpoint)
    }
}

/// Creates (dials) a [`StreamTransport`] for a single streaming call.
pub trait StreamTransportBuilder: Send + Sync + 'static {
    /// The [`StreamTransport`] created by this builder.
    type Transport: StreamTransport;

    /// Connect to the given host and endpoint path.
    fn build(
        &self,
        host: &str,
        endpoint: &str,
    ) -> impl Future<Output = Result<Self::Transport, GrpcWebError>> + Send;
}

impl<F, Fut, T> StreamTransportBuilder for F
where
    F: Fn(&str, &str) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, GrpcWebError>> + Send,
    T: StreamTransport,
{
    type Transport = T;

    fn build(
        &self,
        host: &str,
        endpoint: &str,
    ) -> impl Future<Output = Result<Self::Transport, GrpcWebError>> + Send {
        (self)(host, endpoint)
    }
}

type BoxResponseFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Response, BoxError>> + Send + 'a>>;

trait DynHttpService: Send + Sync + 'static {
    fn serve_boxed(&self, req: Request) -> BoxResponseFuture<'_>;
}

impl<S> DynHttpService for S
where
    S: Service<Request, Output = Response, Error: Into<BoxError>>,
{
    fn serve_boxed(&self, req: Request) -> BoxResponseFuture<'_> {
        Box::pin(async move { self.serve(req).await.map_err(Into::into) })
    }
}

#[derive(Clone)]
/// Type erased http client shared by the default transport builders.
///
/// Any rama http client [`Service`] can be used,
/// by default an [`EasyHttpWebClient`] is used.
///
/// [`EasyHttpWebClient`]: rama::http::client::EasyHttpWebClient
pub struct HttpClient(Arc<dyn DynHttpService>);

impl HttpClient {
    /// Wrap the given http client service.
    pub fn new<S>(service: S) -> Self
    where
        S: Service<Request, Output = Response, Error: Into<BoxError>>,
    {
        Self(Arc::new(service))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(rama::http::client::EasyHttpWebClient::default())
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("HttpClient").finish()
    }
}

impl Service<Request> for HttpClient {
    type Output = Response;
    type Error = BoxError;

    async fn serve(&self, req: Request) -> Result<Self::Output, Self::Error> {
        self.0.serve_boxed(req).await
    }
}
