//! Purge of expired ephemeral artifacts and per-account data wipe.
//!
//! Deletions are pure filters on timestamps and flags, so the job can run
//! concurrently with live traffic: a row matching the predicate is by
//! definition no longer usable by any in-flight ceremony. Verified one-time
//! codes are retained for a day for debugging, then purged.

use crate::clock::Clock;
use crate::error::AuthResult;
use crate::store::AuthStore;
use anyhow::Context;
use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

/// How long verified codes are kept before being purged.
pub const VERIFIED_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub otp_deleted: u64,
    pub challenges_deleted: u64,
    pub total_deleted: u64,
}

pub struct CleanupJob {
    store: Arc<dyn AuthStore>,
    clock: Arc<dyn Clock>,
}

impl CleanupJob {
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Delete expired one-time codes (plus verified ones past retention) and
    /// expired ceremony challenges.
    ///
    /// # Errors
    /// Infrastructure errors from the store.
    pub async fn run_periodic_cleanup(&self) -> AuthResult<CleanupReport> {
        let now = self.clock.now();
        let verified_cutoff = now - Duration::hours(VERIFIED_RETENTION_HOURS);

        let otp_deleted = self
            .store
            .delete_stale_otps(now, verified_cutoff)
            .await
            .context("failed to delete stale one-time codes")?;
        let challenges_deleted = self
            .store
            .delete_expired_challenges(now)
            .await
            .context("failed to delete expired challenges")?;

        let report = CleanupReport {
            otp_deleted,
            challenges_deleted,
            total_deleted: otp_deleted + challenges_deleted,
        };
        if report.total_deleted > 0 {
            info!(
                otp = report.otp_deleted,
                challenges = report.challenges_deleted,
                "cleanup removed expired auth artifacts"
            );
        }
        Ok(report)
    }

    /// Remove every one-time code, challenge and authenticator owned by the
    /// account, in one transaction (right-to-erasure flows).
    ///
    /// # Errors
    /// Infrastructure errors from the store.
    pub async fn wipe_account(&self, account_id: Uuid) -> AuthResult<()> {
        self.store
            .wipe_account(account_id)
            .await
            .context("failed to wipe account credentials")?;
        info!(%account_id, "wiped account auth data");
        Ok(())
    }

    /// Run the periodic cleanup on an interval until the job is dropped.
    #[must_use]
    pub fn spawn(self: &Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        let job = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(job) = job.upgrade() else {
                    break;
                };
                if let Err(err) = job.run_periodic_cleanup().await {
                    error!("periodic cleanup failed: {err}");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{CeremonyKind, MemoryStore, OneTimeCode, WebauthnChallenge};
    use anyhow::Result;
    use chrono::{DateTime, Utc};

    fn otp(
        account_id: Uuid,
        verified: bool,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> OneTimeCode {
        OneTimeCode {
            id: Uuid::new_v4(),
            account_id,
            code: "123456".to_string(),
            verified,
            expires_at,
            created_at,
        }
    }

    #[tokio::test]
    async fn cleanup_deletes_expired_and_stale_verified_codes() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let now = clock.now();

        let live_account = Uuid::new_v4();
        let expired_account = Uuid::new_v4();
        let verified_account = Uuid::new_v4();

        store
            .replace_otp(otp(live_account, false, now, now + Duration::minutes(5)))
            .await?;
        store
            .replace_otp(otp(
                expired_account,
                false,
                now - Duration::minutes(20),
                now - Duration::minutes(10),
            ))
            .await?;
        // Verified recently: retained. Verified past retention: purged even
        // though its expiry is irrelevant by now.
        store
            .replace_otp(otp(
                verified_account,
                true,
                now - Duration::hours(1),
                now + Duration::minutes(5),
            ))
            .await?;
        store
            .replace_otp(otp(
                Uuid::new_v4(),
                true,
                now - Duration::hours(25),
                now - Duration::hours(24),
            ))
            .await?;

        let job = CleanupJob::new(store.clone(), clock);
        let report = job.run_periodic_cleanup().await?;
        assert_eq!(report.otp_deleted, 2);
        assert_eq!(report.challenges_deleted, 0);
        assert_eq!(report.total_deleted, 2);

        assert!(store.unverified_otp(live_account).await?.is_some());
        assert!(store.unverified_otp(expired_account).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_deletes_expired_challenges_only() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let now = clock.now();
        let live = Uuid::new_v4();
        let stale = Uuid::new_v4();

        for (account_id, expires_at) in [
            (live, now + Duration::minutes(4)),
            (stale, now - Duration::seconds(1)),
        ] {
            store
                .replace_challenge(WebauthnChallenge {
                    id: Uuid::new_v4(),
                    account_id,
                    kind: CeremonyKind::Registration,
                    state: vec![],
                    expires_at,
                    created_at: now - Duration::minutes(5),
                })
                .await?;
        }

        let job = CleanupJob::new(store.clone(), clock);
        let report = job.run_periodic_cleanup().await?;
        assert_eq!(report.challenges_deleted, 1);

        assert!(store
            .challenge(live, CeremonyKind::Registration)
            .await?
            .is_some());
        assert!(store
            .challenge(stale, CeremonyKind::Registration)
            .await?
            .is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cleanup_is_a_noop_on_fresh_state() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let job = CleanupJob::new(store, clock);
        assert_eq!(job.run_periodic_cleanup().await?, CleanupReport::default());
        Ok(())
    }

    #[tokio::test]
    async fn periodic_task_stops_when_job_drops() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::starting_now());
        let job = Arc::new(CleanupJob::new(store, clock));
        let handle = job.spawn(std::time::Duration::from_millis(5));
        drop(job);
        tokio::time::timeout(std::time::Duration::from_secs(1), handle).await??;
        Ok(())
    }
}
