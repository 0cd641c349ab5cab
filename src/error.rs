//! Client error taxonomy.
//!
//! Every failure in this crate maps onto one of four kinds:
//! - [`ClientError::Validation`]: rejected input, raised before any network call.
//! - [`ClientError::Transport`]: the channel itself failed (connect, read, timeout).
//! - [`ClientError::Backend`]: the backend answered, but with an error response.
//! - [`ClientError::MalformedEvent`]: a streamed payload that cannot be normalized.
//!
//! Validation and MalformedEvent are always handled locally; Transport drives the
//! bounded reconnect policy; Backend aborts the operation that issued the call.
//! None of them may take the process down.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

impl ClientError {
    /// Wrap a serde failure on a request/response round-trip.
    ///
    /// A response we cannot decode means the channel delivered garbage, so it
    /// counts as a transport failure, not a backend one.
    pub(crate) fn bad_wire(err: serde_json::Error) -> Self {
        ClientError::Transport(io::Error::new(io::ErrorKind::InvalidData, err))
    }

    pub(crate) fn timeout(what: &str) -> Self {
        ClientError::Transport(io::Error::new(io::ErrorKind::TimedOut, what.to_string()))
    }
}

/// Result of [`SessionController::stop_session`](crate::session::SessionController::stop_session).
///
/// Stopping is idempotent and local-first: the session is Ended and the stream
/// cancelled whether or not the backend acknowledged. A failed acknowledgement
/// is carried here as a warning, not an error.
#[derive(Debug)]
pub enum StopOutcome {
    /// No session was active; nothing was sent anywhere.
    NotActive,
    /// The session was ended locally. `warning` holds the end-session
    /// acknowledgement failure, if any.
    Stopped { warning: Option<ClientError> },
}

impl StopOutcome {
    pub fn was_active(&self) -> bool {
        matches!(self, StopOutcome::Stopped { .. })
    }
}
