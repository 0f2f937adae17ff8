//! Single-shot grpc-web transport over plain http.

use std::sync::atomic::{AtomicBool, Ordering};

use rama::Service;
use rama::bytes::Bytes;
use rama::http::grpc::{Code, Status};
use rama::http::header::CONTENT_TYPE;
use rama::http::{Body, HeaderValue, Method, Request};
use rama::telemetry::tracing;

use super::{GRPC_WEB_PROTO, HttpClient, Transport, TransportBuilder, X_GRPC_WEB};
use crate::{CallContext, GrpcWebError, TransportReused, UnexpectedHttpStatus};

/// [`Transport`] issuing a single http POST per call.
///
/// The request frame is sent as the body of a `POST http://<host><endpoint>`
/// request, the response body is returned as is.
pub struct HttpTransport {
    client: HttpClient,
    uri: String,
    sent: AtomicBool,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("uri", &self.uri)
            .field("sent", &self.sent.load(Ordering::Relaxed))
            .finish()
    }
}

impl HttpTransport {
    /// Create a new [`HttpTransport`] for the given host and endpoint path.
    pub fn new(client: HttpClient, host: &str, endpoint: &str) -> Self {
        Self {
            client,
            uri: format!("http://{host}{endpoint}"),
            sent: AtomicBool::new(false),
        }
    }

    /// Uri the request is sent to.
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Transport for HttpTransport {
    async fn send(&self, ctx: &CallContext, frame: Bytes) -> Result<Body, GrpcWebError> {
        if self.sent.swap(true, Ordering::AcqRel) {
            return Err(GrpcWebError::SendFailed(TransportReused.into()));
        }

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.uri.as_str())
            .header(CONTENT_TYPE, HeaderValue::from_static(GRPC_WEB_PROTO))
            .header(X_GRPC_WEB, HeaderValue::from_static("1"))
            .body(Body::from(frame))
            .map_err(|err| GrpcWebError::SendFailed(err.into()))?;

        tracing::trace!(uri = %self.uri, "send grpc-web request");

        let resp = ctx
            .run(self.client.serve(req))
            .await
            .map_err(|err| GrpcWebError::SendFailed(err.into()))?
            .map_err(GrpcWebError::SendFailed)?;

        if !resp.status().is_success() {
            tracing::debug!(uri = %self.uri, status = %resp.status(), "grpc-web request failed");
            return Err(GrpcWebError::SendFailed(
                UnexpectedHttpStatus(resp.status()).into(),
            ));
        }

        // trailers-only responses carry the status as response headers
        if let Some(status) = Status::from_header_map(resp.headers())
            && status.code() != Code::Ok
        {
            return Err(GrpcWebError::Status(status));
        }

        Ok(resp.into_body())
    }
}

#[derive(Debug, Clone, Default)]
/// Default [`TransportBuilder`], creating an [`HttpTransport`] per call.
pub struct HttpTransportBuilder {
    client: HttpClient,
}

impl HttpTransportBuilder {
    /// Create a new [`HttpTransportBuilder`] using the given http client.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self { client }
    }
}

impl TransportBuilder for HttpTransportBuilder {
    type Transport = HttpTransport;

    fn build(&self, host: &str, endpoint: &str) -> Self::Transport {
        HttpTransport::new(self.client.clone(), host, endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rama::http::{Response, StatusCode, body::util::BodyExt as _};
    use rama::service::service_fn;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn echo_client(counter: Arc<AtomicUsize>) -> HttpClient {
        HttpClient::new(service_fn(move |req: Request| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(req.method(), Method::POST);
                assert_eq!(req.uri().to_string(), "http://localhost:50051/api.Example/Unary");
                assert_eq!(req.headers()[CONTENT_TYPE], GRPC_WEB_PROTO);
                assert_eq!(req.headers()[X_GRPC_WEB], "1");
                let body = req.into_body().collect().await.unwrap().to_bytes();
                Ok::<_, Infallible>(Response::new(Body::from(body)))
            }
        }))
    }

    #[tokio::test]
    async fn send_posts_frame_and_returns_body() {
        let counter = Arc::new(AtomicUsize::new(0));
        let transport = HttpTransportBuilder::new(echo_client(counter.clone()))
            .build("localhost:50051", "/api.Example/Unary");

        let body = transport
            .send(&CallContext::default(), Bytes::from_static(b"\x00\x00\x00\x00\x01a"))
            .await
            .unwrap();
        let body = body.collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"\x00\x00\x00\x00\x01a");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_send_is_rejected() {
        let counter = Arc::new(AtomicUsize::new(0));
        let transport = HttpTransport::new(
            echo_client(counter.clone()),
            "localhost:50051",
            "/api.Example/Unary",
        );

        transport
            .send(&CallContext::default(), Bytes::new())
            .await
            .unwrap();
        let err = transport
            .send(&CallContext::default(), Bytes::new())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, GrpcWebError::SendFailed(cause) if cause.is::<TransportReused>()),
            "{err}"
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_send_is_rejected_after_failure() {
        let client = HttpClient::new(service_fn(async |_: Request| {
            Ok::<_, Infallible>(
                Response::builder()
                    .status(StatusCode::BAD_GATEWAY)
                    .body(Body::empty())
                    .unwrap(),
            )
        }));
        let transport = HttpTransport::new(client, "localhost:50051", "/api.Example/Unary");

        let err = transport
            .send(&CallContext::default(), Bytes::new())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, GrpcWebError::SendFailed(cause) if cause.is::<UnexpectedHttpStatus>()),
            "{err}"
        );

        let err = transport
            .send(&CallContext::default(), Bytes::new())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, GrpcWebError::SendFailed(cause) if cause.is::<TransportReused>()),
            "{err}"
        );
    }

    #[tokio::test]
    async fn trailers_only_error_status() {
        let client = HttpClient::new(service_fn(async |_: Request| {
            Ok::<_, Infallible>(
                Response::builder()
                    .header("grpc-status", "5")
                    .header("grpc-message", "no such user")
                    .body(Body::empty())
                    .unwrap(),
            )
        }));
        let transport = HttpTransport::new(client, "localhost:50051", "/api.Example/Unary");

        let err = transport
            .send(&CallContext::default(), Bytes::new())
            .await
            .unwrap_err();
        match err {
            GrpcWebError::Status(status) => {
                assert_eq!(status.code(), Code::NotFound);
                assert_eq!(status.message(), "no such user");
            }
            err => panic!("unexpected error: {err}"),
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_request() {
        let client = HttpClient::new(service_fn(async |_: Request| {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, Infallible>(Response::new(Body::empty()))
        }));
        let transport = HttpTransport::new(client, "localhost:50051", "/api.Example/Unary");

        let token = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(token.clone());
        token.cancel();

        let err = transport.send(&ctx, Bytes::new()).await.unwrap_err();
        assert!(
            matches!(&err, GrpcWebError::SendFailed(cause) if cause.is::<crate::CallAborted>()),
            "{err}"
        );
    }
}
