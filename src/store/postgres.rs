//! Postgres [`AuthStore`] backed by `sqlx`.
//!
//! Every compound operation (replace, commit, wipe) runs inside a single
//! transaction so the single-active-code and single-use-challenge invariants
//! hold under concurrent requests hitting different connections. The schema
//! lives in `db/schema.sql`.

use crate::store::models::{Account, Authenticator, CeremonyKind, OneTimeCode, WebauthnChallenge};
use crate::store::AuthStore;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuthStore for PgStore {
    async fn create_account(&self, account: Account) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO accounts (id, email, phone, phone_verified_at, password_hash, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(account.id)
        .bind(&account.email)
        .bind(&account.phone)
        .bind(account.phone_verified_at)
        .bind(&account.password_hash)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert account")?;
        Ok(())
    }

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account by id")
    }

    async fn account_by_email(&self, email: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account by email")
    }

    async fn account_by_phone(&self, phone: &str) -> Result<Option<Account>> {
        sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE phone = $1")
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch account by phone")
    }

    async fn set_password_hash(&self, account_id: Uuid, hash: &str) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET password_hash = $1 WHERE id = $2")
            .bind(hash)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .context("Failed to update password hash")?;
        if result.rows_affected() == 0 {
            bail!("account not found: {account_id}");
        }
        Ok(())
    }

    async fn set_phone(&self, account_id: Uuid, phone: &str) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start set-phone transaction")?;

        // Uniqueness check and write share the transaction; the unique index
        // on accounts.phone backstops a concurrent insert.
        let holder = sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM accounts WHERE phone = $1 AND id <> $2 FOR UPDATE",
        )
        .bind(phone)
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to check phone uniqueness")?;
        if holder.is_some() {
            tx.rollback().await.ok();
            return Ok(false);
        }

        let result = sqlx::query(
            "UPDATE accounts SET phone = $1, phone_verified_at = NULL WHERE id = $2",
        )
        .bind(phone)
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update phone")?;
        if result.rows_affected() == 0 {
            tx.rollback().await.ok();
            bail!("account not found: {account_id}");
        }

        tx.commit()
            .await
            .context("Failed to commit set-phone transaction")?;
        Ok(true)
    }

    async fn mark_phone_verified(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE accounts SET phone_verified_at = $1 WHERE id = $2")
            .bind(at)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark phone verified")?;
        Ok(())
    }

    async fn replace_otp(&self, otp: OneTimeCode) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start replace-otp transaction")?;

        sqlx::query("DELETE FROM one_time_codes WHERE account_id = $1 AND verified = FALSE")
            .bind(otp.account_id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete prior one-time codes")?;

        sqlx::query(
            r"
            INSERT INTO one_time_codes (id, account_id, code, verified, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(otp.id)
        .bind(otp.account_id)
        .bind(&otp.code)
        .bind(otp.verified)
        .bind(otp.expires_at)
        .bind(otp.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert one-time code")?;

        tx.commit()
            .await
            .context("Failed to commit replace-otp transaction")
    }

    async fn unverified_otp(&self, account_id: Uuid) -> Result<Option<OneTimeCode>> {
        sqlx::query_as::<_, OneTimeCode>(
            "SELECT * FROM one_time_codes WHERE account_id = $1 AND verified = FALSE",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch one-time code")
    }

    async fn mark_otp_verified(&self, otp_id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE one_time_codes SET verified = TRUE WHERE id = $1")
            .bind(otp_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark one-time code verified")?;
        if result.rows_affected() == 0 {
            bail!("one-time code not found: {otp_id}");
        }
        Ok(())
    }

    async fn replace_challenge(&self, challenge: WebauthnChallenge) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start replace-challenge transaction")?;

        sqlx::query("DELETE FROM webauthn_challenges WHERE account_id = $1 AND kind = $2")
            .bind(challenge.account_id)
            .bind(challenge.kind.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to delete prior challenges")?;

        sqlx::query(
            r"
            INSERT INTO webauthn_challenges (id, account_id, kind, state, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(challenge.id)
        .bind(challenge.account_id)
        .bind(challenge.kind.as_str())
        .bind(&challenge.state)
        .bind(challenge.expires_at)
        .bind(challenge.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert challenge")?;

        tx.commit()
            .await
            .context("Failed to commit replace-challenge transaction")
    }

    async fn challenge(
        &self,
        account_id: Uuid,
        kind: CeremonyKind,
    ) -> Result<Option<WebauthnChallenge>> {
        sqlx::query_as::<_, WebauthnChallenge>(
            "SELECT * FROM webauthn_challenges WHERE account_id = $1 AND kind = $2",
        )
        .bind(account_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch challenge")
    }

    async fn commit_registration(
        &self,
        challenge_id: Uuid,
        authenticator: Authenticator,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start registration transaction")?;

        let deleted = sqlx::query("DELETE FROM webauthn_challenges WHERE id = $1")
            .bind(challenge_id)
            .execute(&mut *tx)
            .await
            .context("Failed to consume registration challenge")?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await.ok();
            bail!("challenge already consumed: {challenge_id}");
        }

        let transports = serde_json::to_value(&authenticator.transports)
            .context("Failed to serialize transports")?;
        sqlx::query(
            r"
            INSERT INTO authenticators
                (credential_id, account_id, passkey, counter, backup_eligible, backed_up,
                 transports, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(&authenticator.credential_id)
        .bind(authenticator.account_id)
        .bind(&authenticator.passkey)
        .bind(authenticator.counter)
        .bind(authenticator.backup_eligible)
        .bind(authenticator.backed_up)
        .bind(transports)
        .bind(authenticator.created_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert authenticator")?;

        tx.commit()
            .await
            .context("Failed to commit registration transaction")
    }

    async fn commit_authentication(
        &self,
        challenge_id: Uuid,
        credential_id: &[u8],
        passkey: &[u8],
        counter: i64,
        used_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start authentication transaction")?;

        let deleted = sqlx::query("DELETE FROM webauthn_challenges WHERE id = $1")
            .bind(challenge_id)
            .execute(&mut *tx)
            .await
            .context("Failed to consume authentication challenge")?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await.ok();
            bail!("challenge already consumed: {challenge_id}");
        }

        let updated = sqlx::query(
            r"
            UPDATE authenticators
            SET counter = $1, passkey = $2, last_used_at = $3
            WHERE credential_id = $4
            ",
        )
        .bind(counter)
        .bind(passkey)
        .bind(used_at)
        .bind(credential_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update authenticator counter")?;
        if updated.rows_affected() == 0 {
            tx.rollback().await.ok();
            bail!("authenticator not found during counter update");
        }

        tx.commit()
            .await
            .context("Failed to commit authentication transaction")
    }

    async fn authenticators(&self, account_id: Uuid) -> Result<Vec<Authenticator>> {
        sqlx::query_as::<_, Authenticator>(
            "SELECT * FROM authenticators WHERE account_id = $1 ORDER BY created_at",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list authenticators")
    }

    async fn authenticator_by_credential(
        &self,
        credential_id: &[u8],
    ) -> Result<Option<Authenticator>> {
        sqlx::query_as::<_, Authenticator>(
            "SELECT * FROM authenticators WHERE credential_id = $1",
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch authenticator")
    }

    async fn delete_authenticator(&self, account_id: Uuid, credential_id: &[u8]) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM authenticators WHERE account_id = $1 AND credential_id = $2")
                .bind(account_id)
                .bind(credential_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete authenticator")?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_stale_otps(
        &self,
        now: DateTime<Utc>,
        verified_cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM one_time_codes
            WHERE expires_at < $1 OR (verified = TRUE AND created_at < $2)
            ",
        )
        .bind(now)
        .bind(verified_cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to delete stale one-time codes")?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_challenges(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM webauthn_challenges WHERE expires_at < $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .context("Failed to delete expired challenges")?;
        Ok(result.rows_affected())
    }

    async fn wipe_account(&self, account_id: Uuid) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to start wipe transaction")?;

        sqlx::query("DELETE FROM one_time_codes WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .context("Failed to wipe one-time codes")?;
        sqlx::query("DELETE FROM webauthn_challenges WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .context("Failed to wipe challenges")?;
        sqlx::query("DELETE FROM authenticators WHERE account_id = $1")
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .context("Failed to wipe authenticators")?;

        tx.commit().await.context("Failed to commit wipe transaction")
    }
}
