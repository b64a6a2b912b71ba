//! Error taxonomy shared by every service in the crate.
//!
//! Callers need to tell apart "your input is malformed", "slow down",
//! "request a new code" and "check the code" to give different guidance, so
//! each of those is a distinct variant rather than a stringly-typed error.
//! Infrastructure failures (store unavailable, provider unreachable) are
//! wrapped as `Internal` and are fatal for the request; nothing in this crate
//! retries on its own.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Malformed input (phone, password, email). Locally recoverable;
    /// the message carries field-level feedback.
    #[error("{0}")]
    Validation(String),

    /// Too many requests for this action/identifier pair.
    #[error("Too many requests. Please try again in {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: i64 },

    /// The referenced record does not exist (account, authenticator).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A challenge or code existed but is past its expiry.
    #[error("{0} has expired")]
    Expired(&'static str),

    /// The record exists and is live, but the provided value does not match.
    #[error("{0}")]
    Mismatch(String),

    /// Non-advancing WebAuthn signature counter: possible cloned credential.
    #[error("authenticator signature counter did not advance")]
    ReplaySuspected,

    /// The SMS provider reported a failure; retryable by the user within
    /// rate limits.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// Store or provider infrastructure failure; fatal for this request.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// True for errors the caller should surface as user input problems.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
