//! # Kunci (multi-method authentication core)
//!
//! `kunci` is the authentication core embedded in a larger business
//! application. It issues and validates credentials across four independent
//! sign-in methods — password, email magic-link token verification handled by
//! the host app, SMS one-time code, and WebAuthn/passkey — and owns the
//! ephemeral state behind them: challenge rows for WebAuthn ceremonies, the
//! one-time-code lifecycle, and the fixed-window rate limiting protecting all
//! of it from abuse.
//!
//! ## Boundaries
//!
//! The crate does not route requests and does not mint sessions: a caller
//! (HTTP handler, RPC method) checks the [`rate_limit::RateLimiter`] first,
//! delegates to the relevant service, and receives either a verified identity
//! or a structured [`error::AuthError`] distinguishing validation failures,
//! rate-limit rejections, missing/expired artifacts, mismatches and replay
//! suspicion. Session issuance is the caller's concern.
//!
//! ## State and storage
//!
//! Persistent records flow through the [`store::AuthStore`] seam, with an
//! in-memory implementation for tests and embedding and a Postgres
//! implementation for production. Every compound mutation the invariants
//! depend on (single active code per account, single live challenge per
//! ceremony, verify-then-consume) is a single atomic store operation.
//! Time flows through [`clock::Clock`] so expiry behavior is testable.

pub mod cleanup;
pub mod clock;
pub mod error;
pub mod otp;
pub mod password;
pub mod phone;
pub mod rate_limit;
pub mod store;
pub mod webauthn;

pub use error::{AuthError, AuthResult};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
