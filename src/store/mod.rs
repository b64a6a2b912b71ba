//! Storage seam for the authentication core.
//!
//! Every service reads and writes persistent records through [`AuthStore`]
//! instead of a concrete database, so the core can be embedded with either
//! the in-memory store (tests, small deployments) or the Postgres store.
//!
//! The trait deliberately exposes *compound* operations wherever the
//! invariants require atomicity: `replace_otp` / `replace_challenge` implement the
//! delete-existing-then-insert-new pattern as one unit, and the two
//! `commit_*` operations pair a credential write with the consumption of the
//! challenge that authorized it. Implementations must make each of those a
//! single transaction (or hold a single lock across the sequence) so that a
//! concurrent request can never observe two live codes or replay a consumed
//! challenge.

pub mod memory;
pub mod models;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use models::{Account, Authenticator, CeremonyKind, OneTimeCode, WebauthnChallenge};
pub use postgres::PgStore;

#[async_trait]
pub trait AuthStore: Send + Sync {
    // -- accounts -----------------------------------------------------------

    async fn create_account(&self, account: Account) -> Result<()>;

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>>;

    async fn account_by_email(&self, email: &str) -> Result<Option<Account>>;

    /// Lookup by sanitized E.164 phone. Only verified bindings participate in
    /// uniqueness, but the lookup returns any holder so callers can reject
    /// in-flight duplicates too.
    async fn account_by_phone(&self, phone: &str) -> Result<Option<Account>>;

    async fn set_password_hash(&self, account_id: Uuid, hash: &str) -> Result<()>;

    /// Bind an (unverified) phone number to the account. Returns `false`
    /// without writing when another account already holds the number.
    async fn set_phone(&self, account_id: Uuid, phone: &str) -> Result<bool>;

    async fn mark_phone_verified(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    // -- one-time codes -----------------------------------------------------

    /// Delete every unverified code for the owning account, then insert the
    /// new one. Atomic: two concurrent issues can never leave two live codes.
    async fn replace_otp(&self, otp: OneTimeCode) -> Result<()>;

    async fn unverified_otp(&self, account_id: Uuid) -> Result<Option<OneTimeCode>>;

    async fn mark_otp_verified(&self, otp_id: Uuid) -> Result<()>;

    // -- webauthn challenges ------------------------------------------------

    /// Delete any prior live challenge of the same (account, kind), then
    /// insert the new one. Atomic for the same reason as `replace_otp`.
    async fn replace_challenge(&self, challenge: WebauthnChallenge) -> Result<()>;

    async fn challenge(
        &self,
        account_id: Uuid,
        kind: CeremonyKind,
    ) -> Result<Option<WebauthnChallenge>>;

    // -- authenticators -----------------------------------------------------

    /// Persist a freshly registered authenticator and delete the consumed
    /// registration challenge, as one transaction. A crash between the two
    /// must leave neither an orphaned credential nor a replayable challenge.
    async fn commit_registration(
        &self,
        challenge_id: Uuid,
        authenticator: Authenticator,
    ) -> Result<()>;

    /// Update the stored signature counter (and serialized passkey) after a
    /// successful authentication and delete the consumed challenge, as one
    /// transaction.
    async fn commit_authentication(
        &self,
        challenge_id: Uuid,
        credential_id: &[u8],
        passkey: &[u8],
        counter: i64,
        used_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn authenticators(&self, account_id: Uuid) -> Result<Vec<Authenticator>>;

    async fn authenticator_by_credential(
        &self,
        credential_id: &[u8],
    ) -> Result<Option<Authenticator>>;

    /// Explicit user-driven removal. Returns `false` when no row matched.
    async fn delete_authenticator(&self, account_id: Uuid, credential_id: &[u8]) -> Result<bool>;

    // -- cleanup ------------------------------------------------------------

    /// Delete codes with `expires_at < now`, plus verified codes created
    /// before `verified_cutoff` (kept briefly for audit, then purged).
    async fn delete_stale_otps(
        &self,
        now: DateTime<Utc>,
        verified_cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    async fn delete_expired_challenges(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Delete all codes, challenges and authenticators for one account in a
    /// single transaction (right-to-erasure). A partial wipe must never leave
    /// dangling credentials.
    async fn wipe_account(&self, account_id: Uuid) -> Result<()>;
}
