//! Password hashing, verification, strength scoring and administrative
//! password generation.
//!
//! Hashing uses argon2id in PHC string format with a per-call random salt.
//! Everything here is pure except [`PasswordService::set_password`], which
//! persists the new hash through the store after proving knowledge of the
//! current password.

use crate::error::{AuthError, AuthResult};
use crate::store::AuthStore;
use anyhow::{anyhow, Context, Result};
use argon2::{
    password_hash::{rand_core::OsRng as HashRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::{seq::SliceRandom, Rng};
use uuid::Uuid;

const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const SYMBOLS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

pub const DEFAULT_MIN_LENGTH: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct PasswordPolicy {
    pub min_length: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_LENGTH,
        }
    }
}

/// Outcome of a strength check. Not an error: callers surface the feedback
/// to the user before any persistence happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrengthReport {
    pub score: u8,
    pub is_valid: bool,
    pub feedback: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PasswordService {
    policy: PasswordPolicy,
}

impl PasswordService {
    #[must_use]
    pub fn new(policy: PasswordPolicy) -> Self {
        Self { policy }
    }

    /// Hash a password with a fresh random salt. Two calls on the same input
    /// never produce the same output.
    ///
    /// # Errors
    /// Returns error if the hasher fails (effectively never at runtime).
    pub fn hash(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut HashRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|err| anyhow!("failed to hash password: {err}"))?;
        Ok(hash.to_string())
    }

    /// Verify a password against a stored PHC hash. A malformed hash verifies
    /// false rather than erroring; the comparison itself is performed by the
    /// argon2 verifier and does not short-circuit on content.
    #[must_use]
    pub fn verify(&self, password: &str, hash: &str) -> bool {
        PasswordHash::new(hash).is_ok_and(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
    }

    /// Score a candidate password: one point each for minimum length,
    /// an uppercase letter, a lowercase letter, a digit and a symbol,
    /// capped at 4. Valid means minimum length plus a score of at least 3.
    /// Feedback lists every unmet criterion in a fixed order.
    #[must_use]
    pub fn check_strength(&self, password: &str) -> StrengthReport {
        let min = self.policy.min_length;
        let long_enough = password.chars().count() >= min;
        let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
        let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
        let has_digit = password.chars().any(|c| c.is_ascii_digit());
        let has_symbol = password.chars().any(|c| SYMBOLS.contains(c));

        let mut feedback = Vec::new();
        if !long_enough {
            feedback.push(format!("Password must be at least {min} characters long"));
        }
        if !has_upper {
            feedback.push("Password must contain an uppercase letter".to_string());
        }
        if !has_lower {
            feedback.push("Password must contain a lowercase letter".to_string());
        }
        if !has_digit {
            feedback.push("Password must contain a number".to_string());
        }
        if !has_symbol {
            feedback.push("Password must contain a special character".to_string());
        }

        let points = [long_enough, has_upper, has_lower, has_digit, has_symbol]
            .into_iter()
            .filter(|met| *met)
            .count();
        let score = points.min(4) as u8;

        StrengthReport {
            score,
            is_valid: long_enough && score >= 3,
            feedback,
        }
    }

    /// Generate a random password for administrative resets: at least one
    /// character from each class, the remainder uniform over the combined
    /// alphabet, then shuffled. Lengths below 4 are raised to 4 so every
    /// class can appear.
    #[must_use]
    pub fn generate_random_password(&self, length: usize) -> String {
        let mut rng = rand::rngs::OsRng;
        let length = length.max(4);
        let combined: Vec<char> = [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS]
            .concat()
            .chars()
            .collect();

        let mut chars: Vec<char> = [UPPERCASE, LOWERCASE, DIGITS, SYMBOLS]
            .iter()
            .map(|class| pick(class, &mut rng))
            .collect();
        while chars.len() < length {
            chars.push(combined[rng.gen_range(0..combined.len())]);
        }
        chars.shuffle(&mut rng);
        chars.into_iter().collect()
    }

    /// Set or change an account's password.
    ///
    /// When the account already has a password the current one must be
    /// supplied and match; first-time setup needs no proof. The new password
    /// must pass the strength check before anything is persisted.
    ///
    /// # Errors
    /// `Validation` for weak passwords or a missing current password,
    /// `Mismatch` for a wrong current password, `NotFound` for an unknown
    /// account.
    pub async fn set_password(
        &self,
        store: &dyn AuthStore,
        account_id: Uuid,
        current_password: Option<&str>,
        new_password: &str,
    ) -> AuthResult<()> {
        let account = store
            .account_by_id(account_id)
            .await
            .context("failed to load account")?
            .ok_or(AuthError::NotFound("account"))?;

        if let Some(existing_hash) = account.password_hash.as_deref() {
            let current = current_password.ok_or_else(|| {
                AuthError::Validation("Current password is required".to_string())
            })?;
            if !self.verify(current, existing_hash) {
                return Err(AuthError::Mismatch(
                    "Current password is incorrect".to_string(),
                ));
            }
        }

        let report = self.check_strength(new_password);
        if !report.is_valid {
            return Err(AuthError::Validation(report.feedback.join("; ")));
        }

        let hash = self.hash(new_password).context("failed to hash password")?;
        store
            .set_password_hash(account_id, &hash)
            .await
            .context("failed to persist password hash")?;
        Ok(())
    }

    /// Check a login attempt against the stored hash.
    ///
    /// # Errors
    /// `NotFound` when the account does not exist or has no password,
    /// `Mismatch` when the password is wrong.
    pub async fn authenticate(
        &self,
        store: &dyn AuthStore,
        email: &str,
        password: &str,
    ) -> AuthResult<Uuid> {
        let account = store
            .account_by_email(email)
            .await
            .context("failed to load account")?
            .ok_or(AuthError::NotFound("account"))?;
        let hash = account
            .password_hash
            .as_deref()
            .ok_or(AuthError::NotFound("password credential"))?;
        if self.verify(password, hash) {
            Ok(account.id)
        } else {
            Err(AuthError::Mismatch("Invalid password".to_string()))
        }
    }
}

fn pick(class: &str, rng: &mut rand::rngs::OsRng) -> char {
    let chars: Vec<char> = class.chars().collect();
    chars[rng.gen_range(0..chars.len())]
}
