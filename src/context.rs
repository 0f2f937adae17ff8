use std::fmt;
use std::time::Duration;

use rama::utils::macros::generate_set_and_with;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
/// Caller supplied context of a single call.
///
/// Allows the caller to abort an in-flight request,
/// either explicitly via a [`CancellationToken`] or by a timeout.
/// A default context never cancels.
pub struct CallContext {
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl CallContext {
    /// Create a new [`CallContext`] which never cancels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    generate_set_and_with! {
        /// Abort the call once the given token is cancelled.
        pub fn cancellation(mut self, token: CancellationToken) -> Self {
            self.cancel = Some(token);
            self
        }
    }

    generate_set_and_with! {
        /// Abort the call if it did not complete within the given duration.
        pub fn timeout(mut self, timeout: Duration) -> Self {
            self.timeout = Some(timeout);
            self
        }
    }

    /// Returns `true` if the cancellation token of this context was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Drive the future to completion unless the context fires first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, CallAborted>
    where
        F: Future,
    {
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(CallAborted::Cancelled(Cancelled)),
            _ = deadline => Err(CallAborted::DeadlineExceeded(DeadlineExceeded)),
            output = fut => Ok(output),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Reason a [`CallContext`] aborted a call.
pub enum CallAborted {
    /// The cancellation token fired.
    Cancelled(Cancelled),
    /// The timeout elapsed.
    DeadlineExceeded(DeadlineExceeded),
}

impl fmt::Display for CallAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled(err) => err.fmt(f),
            Self::DeadlineExceeded(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for CallAborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cancelled(err) => Some(err),
            Self::DeadlineExceeded(err) => Some(err),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
/// The call was cancelled by the caller.
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("call cancelled")
    }
}

impl std::error::Error for Cancelled {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
/// The call did not complete before its deadline.
pub struct DeadlineExceeded;

impl fmt::Display for DeadlineExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deadline exceeded")
    }
}

impl std::error::Error for DeadlineExceeded {}
