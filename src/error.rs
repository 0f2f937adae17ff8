use std::fmt;

use rama::error::BoxError;
use rama::http::StatusCode;
use rama::http::grpc::Status;

use crate::codec::FrameError;

#[derive(Debug)]
/// Error returned by a grpc-web call.
///
/// Each variant names the stage of the call in which the failure happened.
/// End of stream is never reported as an error, it is signalled as `Ok(None)`.
pub enum GrpcWebError {
    /// The request message could not be encoded.
    MarshalFailed(BoxError),
    /// A response payload could not be decoded into the output message.
    UnmarshalFailed(BoxError),
    /// The request could not be delivered.
    ///
    /// This includes network and handshake failures, cancellation
    /// ([`Cancelled`](crate::Cancelled), [`DeadlineExceeded`](crate::DeadlineExceeded))
    /// and reuse of a single-shot transport ([`TransportReused`]).
    SendFailed(BoxError),
    /// The response could not be read from the transport.
    ReceiveFailed(BoxError),
    /// A response frame was malformed.
    Frame(FrameError),
    /// The end-of-stream handshake of a duplex transport failed.
    FinishFailed(BoxError),
    /// The server completed the call with a non-OK status.
    Status(Status),
}

impl GrpcWebError {
    /// Returns `true` if this is a [`FrameError::Truncated`] error.
    #[must_use]
    pub fn is_truncated_frame(&self) -> bool {
        matches!(self, Self::Frame(FrameError::Truncated { .. }))
    }
}

impl fmt::Display for GrpcWebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MarshalFailed(err) => write!(f, "failed to marshal request: {err}"),
            Self::UnmarshalFailed(err) => write!(f, "failed to unmarshal response: {err}"),
            Self::SendFailed(err) => write!(f, "failed to send request: {err}"),
            Self::ReceiveFailed(err) => write!(f, "failed to receive response: {err}"),
            Self::Frame(err) => write!(f, "failed to decode response frame: {err}"),
            Self::FinishFailed(err) => write!(f, "failed to finish stream: {err}"),
            Self::Status(status) => write!(
                f,
                "call failed with status {:?}: {}",
                status.code(),
                status.message()
            ),
        }
    }
}

impl std::error::Error for GrpcWebError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::MarshalFailed(err)
            | Self::UnmarshalFailed(err)
            | Self::SendFailed(err)
            | Self::ReceiveFailed(err)
            | Self::FinishFailed(err) => Some(err.as_ref()),
            Self::Frame(err) => Some(err),
            Self::Status(status) => Some(status),
        }
    }
}

impl From<FrameError> for GrpcWebError {
    fn from(value: FrameError) -> Self {
        Self::Frame(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
/// Cause of a [`GrpcWebError::SendFailed`] when
/// a single-shot transport is used for a second request.
pub struct TransportReused;

impl fmt::Display for TransportReused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("send must be called only once per single-shot transport")
    }
}

impl std::error::Error for TransportReused {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Cause of a [`GrpcWebError::SendFailed`] when
/// the server answered with a non-success http status.
pub struct UnexpectedHttpStatus(pub StatusCode);

impl fmt::Display for UnexpectedHttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unexpected http status code: {}", self.0)
    }
}

impl std::error::Error for UnexpectedHttpStatus {}
