//! SMS one-time-code lifecycle.
//!
//! Per-account state machine: no code, then one live unverified code, then
//! verified (or expired and swept). Issuing a new code always replaces every
//! prior unverified code for the account in one atomic store operation, so
//! two concurrent issue requests can never leave two live codes.

pub mod delivery;

use crate::clock::Clock;
use crate::error::{AuthError, AuthResult};
use crate::otp::delivery::DeliveryProvider;
use crate::phone;
use crate::store::{AuthStore, OneTimeCode};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Codes are valid for ten minutes from issuance.
pub const CODE_TTL_MINUTES: i64 = 10;

/// Outcome of issuing a code. The code itself is only handed to the delivery
/// provider, never returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCode {
    pub expires_at: DateTime<Utc>,
    pub masked_phone: String,
}

/// Generate a uniformly random six-digit code (leading zeros permitted).
#[must_use]
pub fn generate_code() -> String {
    let value: u32 = rand::rngs::OsRng.gen_range(0..1_000_000);
    format!("{value:06}")
}

/// Pure verification: expiry is checked before code correctness so an
/// expired-but-correct code still reads as expired, and both sides are
/// trimmed before the exact match.
pub fn check(stored: &str, provided: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> AuthResult<()> {
    if now > expires_at {
        return Err(AuthError::Expired("verification code"));
    }
    if stored.trim() != provided.trim() {
        return Err(AuthError::Mismatch("Invalid code".to_string()));
    }
    Ok(())
}

pub struct OtpService {
    store: Arc<dyn AuthStore>,
    delivery: Arc<dyn DeliveryProvider>,
    clock: Arc<dyn Clock>,
}

impl OtpService {
    #[must_use]
    pub fn new(
        store: Arc<dyn AuthStore>,
        delivery: Arc<dyn DeliveryProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            delivery,
            clock,
        }
    }

    /// Bind a phone number to the account (unverified) and send the first
    /// verification code.
    ///
    /// # Errors
    /// `Validation` for malformed or already-claimed numbers, `NotFound` for
    /// an unknown account, `Delivery` when the provider reports a failure.
    pub async fn add_phone(&self, account_id: Uuid, raw_phone: &str) -> AuthResult<SentCode> {
        let validation = phone::validate(raw_phone);
        let formatted = match validation.formatted {
            Some(formatted) if validation.is_valid => formatted,
            _ => {
                let message = validation
                    .error
                    .unwrap_or_else(|| "Invalid phone number".to_string());
                return Err(AuthError::Validation(message));
            }
        };

        self.store
            .account_by_id(account_id)
            .await
            .context("failed to load account")?
            .ok_or(AuthError::NotFound("account"))?;

        let bound = self
            .store
            .set_phone(account_id, &formatted)
            .await
            .context("failed to bind phone")?;
        if !bound {
            return Err(AuthError::Validation(
                "Phone number is already in use".to_string(),
            ));
        }

        self.issue_and_send(account_id, &formatted).await
    }

    /// Re-issue the verification code for the account's current phone. The
    /// previous code is invalidated and the countdown restarts.
    ///
    /// # Errors
    /// `NotFound` when the account or its phone binding is missing,
    /// `Delivery` on provider failure.
    pub async fn resend(&self, account_id: Uuid) -> AuthResult<SentCode> {
        let account = self
            .store
            .account_by_id(account_id)
            .await
            .context("failed to load account")?
            .ok_or(AuthError::NotFound("account"))?;
        let Some(number) = account.phone else {
            return Err(AuthError::NotFound("phone binding"));
        };
        self.issue_and_send(account_id, &number).await
    }

    /// Verify the code the user typed against the account's live code. On
    /// success the code flips to verified and the phone binding is stamped.
    ///
    /// # Errors
    /// `NotFound` when no live code exists, `Expired` past the deadline,
    /// `Mismatch` on a wrong code.
    pub async fn verify(&self, account_id: Uuid, provided: &str) -> AuthResult<()> {
        let otp = self
            .store
            .unverified_otp(account_id)
            .await
            .context("failed to load one-time code")?
            .ok_or(AuthError::NotFound("verification code"))?;

        let now = self.clock.now();
        check(&otp.code, provided, otp.expires_at, now)?;

        self.store
            .mark_otp_verified(otp.id)
            .await
            .context("failed to mark code verified")?;
        self.store
            .mark_phone_verified(account_id, now)
            .await
            .context("failed to mark phone verified")?;
        info!(%account_id, "phone number verified");
        Ok(())
    }

    async fn issue_and_send(&self, account_id: Uuid, number: &str) -> AuthResult<SentCode> {
        let now = self.clock.now();
        let code = generate_code();
        let expires_at = now + Duration::minutes(CODE_TTL_MINUTES);

        // Replace-then-send: the store call atomically invalidates any prior
        // unverified code before the new one exists.
        self.store
            .replace_otp(OneTimeCode {
                id: Uuid::new_v4(),
                account_id,
                code: code.clone(),
                verified: false,
                expires_at,
                created_at: now,
            })
            .await
            .context("failed to store one-time code")?;

        let receipt = self
            .delivery
            .send_code(number, &code)
            .await
            .context("delivery provider failed")?;
        if !receipt.success {
            let reason = receipt
                .error
                .unwrap_or_else(|| "provider reported failure".to_string());
            return Err(AuthError::Delivery(reason));
        }
        debug!(%account_id, message_id = ?receipt.message_id, "verification code sent");

        Ok(SentCode {
            expires_at,
            masked_phone: phone::format_masked(number),
        })
    }
}
