use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, FromRow, Row};
use uuid::Uuid;

/// Identity root. Owned credentials (authenticators, codes, challenges) hang
/// off the account id and are stored separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub phone: Option<String>,
    pub phone_verified_at: Option<DateTime<Utc>>,
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Account {
    #[must_use]
    pub fn new(email: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.to_string(),
            phone: None,
            phone_verified_at: None,
            password_hash: None,
            created_at,
        }
    }

    #[must_use]
    pub fn phone_verified(&self) -> bool {
        self.phone_verified_at.is_some()
    }
}

impl<'r> FromRow<'r, PgRow> for Account {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            phone_verified_at: row.try_get("phone_verified_at")?,
            password_hash: row.try_get("password_hash")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Ephemeral SMS code. At most one unverified row per account at any instant;
/// issuing a new code replaces all prior unverified ones atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimeCode {
    pub id: Uuid,
    pub account_id: Uuid,
    pub code: String,
    pub verified: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OneTimeCode {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            code: row.try_get("code")?,
            verified: row.try_get("verified")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CeremonyKind {
    Registration,
    Authentication,
}

impl CeremonyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registration => "registration",
            Self::Authentication => "authentication",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "registration" => Some(Self::Registration),
            "authentication" => Some(Self::Authentication),
            _ => None,
        }
    }
}

/// Ephemeral WebAuthn ceremony state. `state` holds the serialized
/// `webauthn-rs` registration/authentication state so that `finish` can run
/// on a different process instance than `begin`. At most one live challenge
/// per (account, kind).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebauthnChallenge {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: CeremonyKind,
    pub state: Vec<u8>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for WebauthnChallenge {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            kind: CeremonyKind::parse(&kind)
                .ok_or_else(|| sqlx::Error::Decode(format!("unknown ceremony kind: {kind}").into()))?,
            state: row.try_get("state")?,
            expires_at: row.try_get("expires_at")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Persistent WebAuthn credential. `passkey` is the serialized
/// `webauthn_rs::prelude::Passkey`; `counter` mirrors its signature counter
/// for the clone-detection policy and is monotonic non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authenticator {
    pub credential_id: Vec<u8>,
    pub account_id: Uuid,
    pub passkey: Vec<u8>,
    pub counter: i64,
    pub backup_eligible: bool,
    pub backed_up: bool,
    pub transports: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for Authenticator {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        // Postgres has no native string-array need here; transports are
        // stored as a JSON document and decoded into a typed list.
        let transports: serde_json::Value = row.try_get("transports")?;
        let transports = serde_json::from_value(transports)
            .map_err(|err| sqlx::Error::Decode(Box::new(err)))?;
        Ok(Self {
            credential_id: row.try_get("credential_id")?,
            account_id: row.try_get("account_id")?,
            passkey: row.try_get("passkey")?,
            counter: row.try_get("counter")?,
            backup_eligible: row.try_get("backup_eligible")?,
            backed_up: row.try_get("backed_up")?,
            transports,
            created_at: row.try_get("created_at")?,
            last_used_at: row.try_get("last_used_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceremony_kind_round_trips() {
        for kind in [CeremonyKind::Registration, CeremonyKind::Authentication] {
            assert_eq!(CeremonyKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CeremonyKind::parse("attestation"), None);
    }

    #[test]
    fn new_account_has_no_credentials() {
        let account = Account::new("user@example.com", Utc::now());
        assert!(account.password_hash.is_none());
        assert!(account.phone.is_none());
        assert!(!account.phone_verified());
    }
}
