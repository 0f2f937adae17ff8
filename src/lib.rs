//! # rama-grpc-web
//!
//! [gRPC-web] client built on top of rama.
//!
//! gRPC-web makes grpc methods reachable over plain http/1.1,
//! using a length prefixed framing for messages and trailers:
//!
//! - unary calls are sent as a single http `POST`, see [`transport::HttpTransport`];
//! - server streaming calls run over a websocket negotiated with the
//!   `grpc-websockets` sub protocol, see [`transport::WebSocketTransport`].
//!
//! Messages are protobuf messages as generated by [`prost`],
//! the resolved service and method descriptors are passed in with each [`Request`].
//!
//! ## Example
//!
//! ```no_run
//! # use prost_types::{DescriptorProto, ServiceDescriptorProto};
//! use rama_grpc_web::{CallContext, Client, Request};
//!
//! # async fn example(
//! #     service: ServiceDescriptorProto,
//! #     output_descriptor: DescriptorProto,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new("localhost:50051");
//!
//! let mut req = Request::new(service, "Unary", output_descriptor, (), ())?
//!     .with_package("api");
//! client.unary(&CallContext::default(), &mut req).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Rama
//!
//! Crate built on the `rama` crate.
//!
//! Learn more about `rama`:
//!
//! - Github: <https://github.com/plabayo/rama>
//! - Book: <https://ramaproxy.org/book/>
//!
//! [gRPC-web]: https://github.com/grpc/grpc/blob/master/doc/PROTOCOL-WEB.md

#![doc(
    html_favicon_url = "https://raw.githubusercontent.com/plabayo/rama/main/docs/img/old_logo.png"
)]
#![doc(html_logo_url = "https://raw.githubusercontent.com/plabayo/rama/main/docs/img/old_logo.png")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(
    not(test),
    warn(clippy::print_stdout, clippy::dbg_macro),
    deny(clippy::unwrap_used, clippy::expect_used)
)]

pub mod client;
pub mod codec;
pub mod transport;

mod context;
mod error;
mod request;

#[doc(inline)]
pub use client::{Client, MissingResponse, ServerStreamClient};
#[doc(inline)]
pub use codec::{Frame, FrameError};
pub use context::{CallAborted, CallContext, Cancelled, DeadlineExceeded};
pub use error::{GrpcWebError, TransportReused, UnexpectedHttpStatus};
pub use request::{Request, UnknownMethod};
