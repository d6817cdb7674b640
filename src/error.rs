//! Error taxonomy shared by every fallible operation in the relay core.
//!
//! Mirrors the five kinds from the error handling design: protocol
//! violations and resource exhaustion close the session; transport errors
//! close it quietly; persistence errors are logged and swallowed. A ping
//! that fails version negotiation never produces a `RelayError` at all —
//! banning is tracked on the session itself, since the transport must stay
//! open.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl RelayError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Whether this error should tear down the connection (§7: kinds 1-3),
    /// as opposed to being logged and absorbed (kind 5).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Persistence(_))
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
