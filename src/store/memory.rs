//! In-memory [`AuthStore`] used by tests and database-less embeddings.
//!
//! A single mutex guards the whole state, which makes every compound
//! operation (replace, commit) trivially atomic: the lock is held across the
//! delete and the insert.

use crate::store::models::{Account, Authenticator, CeremonyKind, OneTimeCode, WebauthnChallenge};
use crate::store::AuthStore;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    accounts: HashMap<Uuid, Account>,
    otps: HashMap<Uuid, OneTimeCode>,
    challenges: HashMap<Uuid, WebauthnChallenge>,
    authenticators: Vec<Authenticator>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unverified codes currently held for an account. Test hook
    /// for the single-active-code invariant.
    pub async fn unverified_otp_count(&self, account_id: Uuid) -> usize {
        let inner = self.inner.lock().await;
        inner
            .otps
            .values()
            .filter(|otp| otp.account_id == account_id && !otp.verified)
            .count()
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn create_account(&self, account: Account) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .accounts
            .values()
            .any(|existing| existing.email == account.email)
        {
            bail!("email already registered: {}", account.email);
        }
        inner.accounts.insert(account.id, account);
        Ok(())
    }

    async fn account_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let inner = self.inner.lock().await;
        Ok(inner.accounts.get(&id).cloned())
    }

    async fn account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .accounts
            .values()
            .find(|account| account.email == email)
            .cloned())
    }

    async fn account_by_phone(&self, phone: &str) -> Result<Option<Account>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .accounts
            .values()
            .find(|account| account.phone.as_deref() == Some(phone))
            .cloned())
    }

    async fn set_password_hash(&self, account_id: Uuid, hash: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.accounts.get_mut(&account_id) {
            Some(account) => {
                account.password_hash = Some(hash.to_string());
                Ok(())
            }
            None => bail!("account not found: {account_id}"),
        }
    }

    async fn set_phone(&self, account_id: Uuid, phone: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let taken = inner
            .accounts
            .values()
            .any(|account| account.id != account_id && account.phone.as_deref() == Some(phone));
        if taken {
            return Ok(false);
        }
        match inner.accounts.get_mut(&account_id) {
            Some(account) => {
                account.phone = Some(phone.to_string());
                account.phone_verified_at = None;
                Ok(true)
            }
            None => bail!("account not found: {account_id}"),
        }
    }

    async fn mark_phone_verified(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.accounts.get_mut(&account_id) {
            Some(account) => {
                account.phone_verified_at = Some(at);
                Ok(())
            }
            None => bail!("account not found: {account_id}"),
        }
    }

    async fn replace_otp(&self, otp: OneTimeCode) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .otps
            .retain(|_, existing| existing.account_id != otp.account_id || existing.verified);
        inner.otps.insert(otp.id, otp);
        Ok(())
    }

    async fn unverified_otp(&self, account_id: Uuid) -> Result<Option<OneTimeCode>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .otps
            .values()
            .find(|otp| otp.account_id == account_id && !otp.verified)
            .cloned())
    }

    async fn mark_otp_verified(&self, otp_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.otps.get_mut(&otp_id) {
            Some(otp) => {
                otp.verified = true;
                Ok(())
            }
            None => bail!("one-time code not found: {otp_id}"),
        }
    }

    async fn replace_challenge(&self, challenge: WebauthnChallenge) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.challenges.retain(|_, existing| {
            existing.account_id != challenge.account_id || existing.kind != challenge.kind
        });
        inner.challenges.insert(challenge.id, challenge);
        Ok(())
    }

    async fn challenge(
        &self,
        account_id: Uuid,
        kind: CeremonyKind,
    ) -> Result<Option<WebauthnChallenge>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .challenges
            .values()
            .find(|challenge| challenge.account_id == account_id && challenge.kind == kind)
            .cloned())
    }

    async fn commit_registration(
        &self,
        challenge_id: Uuid,
        authenticator: Authenticator,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.challenges.remove(&challenge_id).is_none() {
            // A concurrent finish already consumed the challenge; refusing
            // here keeps the credential write tied to exactly one ceremony.
            bail!("challenge already consumed: {challenge_id}");
        }
        inner.authenticators.push(authenticator);
        Ok(())
    }

    async fn commit_authentication(
        &self,
        challenge_id: Uuid,
        credential_id: &[u8],
        passkey: &[u8],
        counter: i64,
        used_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.challenges.remove(&challenge_id).is_none() {
            bail!("challenge already consumed: {challenge_id}");
        }
        match inner
            .authenticators
            .iter_mut()
            .find(|authenticator| authenticator.credential_id == credential_id)
        {
            Some(authenticator) => {
                authenticator.counter = counter;
                authenticator.passkey = passkey.to_vec();
                authenticator.last_used_at = Some(used_at);
                Ok(())
            }
            None => bail!("authenticator not found during counter update"),
        }
    }

    async fn authenticators(&self, account_id: Uuid) -> Result<Vec<Authenticator>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .authenticators
            .iter()
            .filter(|authenticator| authenticator.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn authenticator_by_credential(
        &self,
        credential_id: &[u8],
    ) -> Result<Option<Authenticator>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .authenticators
            .iter()
            .find(|authenticator| authenticator.credential_id == credential_id)
            .cloned())
    }

    async fn delete_authenticator(&self, account_id: Uuid, credential_id: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let before = inner.authenticators.len();
        inner.authenticators.retain(|authenticator| {
            authenticator.account_id != account_id || authenticator.credential_id != credential_id
        });
        Ok(inner.authenticators.len() < before)
    }

    async fn delete_stale_otps(
        &self,
        now: DateTime<Utc>,
        verified_cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.otps.len();
        inner.otps.retain(|_, otp| {
            let expired = otp.expires_at < now;
            let stale_verified = otp.verified && otp.created_at < verified_cutoff;
            !expired && !stale_verified
        });
        Ok((before - inner.otps.len()) as u64)
    }

    async fn delete_expired_challenges(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.challenges.len();
        inner
            .challenges
            .retain(|_, challenge| challenge.expires_at >= now);
        Ok((before - inner.challenges.len()) as u64)
    }

    async fn wipe_account(&self, account_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.otps.retain(|_, otp| otp.account_id != account_id);
        inner
            .challenges
            .retain(|_, challenge| challenge.account_id != account_id);
        inner
            .authenticators
            .retain(|authenticator| authenticator.account_id != account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn otp_for(account_id: Uuid, code: &str, now: DateTime<Utc>) -> OneTimeCode {
        OneTimeCode {
            id: Uuid::new_v4(),
            account_id,
            code: code.to_string(),
            verified: false,
            expires_at: now + Duration::minutes(10),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn replace_otp_keeps_a_single_unverified_code() -> Result<()> {
        let store = MemoryStore::new();
        let account_id = Uuid::new_v4();
        let now = Utc::now();

        store.replace_otp(otp_for(account_id, "111111", now)).await?;
        store.replace_otp(otp_for(account_id, "222222", now)).await?;

        assert_eq!(store.unverified_otp_count(account_id).await, 1);
        let live = store.unverified_otp(account_id).await?;
        assert_eq!(live.map(|otp| otp.code), Some("222222".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn replace_otp_preserves_verified_history() -> Result<()> {
        let store = MemoryStore::new();
        let account_id = Uuid::new_v4();
        let now = Utc::now();

        let mut verified = otp_for(account_id, "111111", now);
        verified.verified = true;
        let verified_id = verified.id;
        store.replace_otp(verified).await?;
        store.mark_otp_verified(verified_id).await?;
        store.replace_otp(otp_for(account_id, "222222", now)).await?;

        // The verified row survives for the audit window; only unverified
        // codes are replaced.
        assert_eq!(store.unverified_otp_count(account_id).await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn set_phone_rejects_numbers_held_by_other_accounts() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = Account::new("first@example.com", now);
        let second = Account::new("second@example.com", now);
        let (first_id, second_id) = (first.id, second.id);
        store.create_account(first).await?;
        store.create_account(second).await?;

        assert!(store.set_phone(first_id, "+12345678900").await?);
        assert!(!store.set_phone(second_id, "+12345678900").await?);

        let holder = store.account_by_phone("+12345678900").await?;
        assert_eq!(holder.map(|account| account.id), Some(first_id));
        assert!(store.account_by_phone("+10000000000").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn commit_registration_requires_a_live_challenge() -> Result<()> {
        let store = MemoryStore::new();
        let account_id = Uuid::new_v4();
        let authenticator = Authenticator {
            credential_id: vec![1, 2, 3],
            account_id,
            passkey: vec![],
            counter: 0,
            backup_eligible: false,
            backed_up: false,
            transports: vec![],
            created_at: Utc::now(),
            last_used_at: None,
        };

        let result = store
            .commit_registration(Uuid::new_v4(), authenticator)
            .await;
        assert!(result.is_err());
        assert!(store.authenticators(account_id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn wipe_account_removes_everything_owned() -> Result<()> {
        let store = MemoryStore::new();
        let account_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let now = Utc::now();

        store.replace_otp(otp_for(account_id, "111111", now)).await?;
        store.replace_otp(otp_for(other, "222222", now)).await?;
        store
            .replace_challenge(WebauthnChallenge {
                id: Uuid::new_v4(),
                account_id,
                kind: CeremonyKind::Registration,
                state: vec![],
                expires_at: now + Duration::minutes(5),
                created_at: now,
            })
            .await?;

        store.wipe_account(account_id).await?;

        assert_eq!(store.unverified_otp_count(account_id).await, 0);
        assert!(store
            .challenge(account_id, CeremonyKind::Registration)
            .await?
            .is_none());
        assert_eq!(store.unverified_otp_count(other).await, 1);
        Ok(())
    }
}
