use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport-defined sentinel code: the server discarded the request because
/// its invoke-after target failed, and the request must be resent on a fresh
/// chain. Part of the contract with the transport.
pub const RESEND_INVOKE_AFTER: i32 = -32090;

/// An error value as exchanged with the transport and surfaced to callers.
///
/// Positive codes mirror HTTP-style transport codes (`400`, `429`, `500`);
/// negative codes are transport-defined sentinels such as
/// [`RESEND_INVOKE_AFTER`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Error {
    /// Numeric error code.
    pub code: i32,

    /// Human-readable message. For sentinel codes the exact text is part of
    /// the transport contract.
    pub message: String,
}

impl Error {
    /// Create an error from a code and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Error {
            code,
            message: message.into(),
        }
    }

    /// The error attached to every query still held by the dispatcher when it
    /// is torn down.
    pub fn request_aborted() -> Self {
        Error::new(500, "Request aborted")
    }

    /// Synthesized when a query's accumulated flood-wait budget exceeds its
    /// limit. `retry_after` is the most recent flood-wait, rounded up to
    /// whole seconds.
    pub fn too_many_requests(retry_after: i64) -> Self {
        Error::new(429, format!("Too Many Requests: retry after {retry_after}"))
    }

    /// Internal plumbing failure (e.g. the dispatcher actor is gone).
    pub fn internal(message: impl Into<String>) -> Self {
        Error::new(-32603, message)
    }

    /// Whether this completion means the invoke-after chain broke and the
    /// query must be resent with a rebuilt predecessor reference.
    ///
    /// Recognized forms: the [`RESEND_INVOKE_AFTER`] sentinel, and code `400`
    /// with message `MSG_WAIT_FAILED` or `MSG_WAIT_TIMEOUT`.
    pub fn is_chain_break(&self) -> bool {
        self.code == RESEND_INVOKE_AFTER
            || (self.code == 400
                && (self.message == "MSG_WAIT_FAILED" || self.message == "MSG_WAIT_TIMEOUT"))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}
