//! Enrollment and device credential service.
//!
//! Owns the two auth tables: short-lived single-use enrollment tokens
//! (bootstrapped over QR) and long-lived device credentials. Every
//! operation is linearized through one mutex, so redeem's verify-and-flip
//! can never admit the same token twice. Nothing here is persisted; a
//! restart forgets every table and devices re-pair.

mod error;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;

pub use error::AuthError;

/// Enrollment token size in bytes (128 bits).
const TOKEN_BYTES: usize = 16;

/// Credential key size in bytes (256 bits).
const KEY_BYTES: usize = 32;

/// Capacity of the revocation broadcast.
const REVOCATION_CAPACITY: usize = 16;

/// A short-lived, single-use pairing token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentToken {
    /// Opaque token value.
    pub token: String,
    /// When it was issued.
    pub issued_at: DateTime<Utc>,
    /// When it stops redeeming.
    pub expires_at: DateTime<Utc>,
    /// Flipped exactly once, on the first valid redemption.
    pub consumed: bool,
}

/// A long-lived device credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCredential {
    /// Opaque credential key.
    pub key: String,
    /// Device the credential is bound to.
    pub device_id: String,
    /// When it was minted.
    pub issued_at: DateTime<Utc>,
    /// When it stops validating.
    pub expires_at: DateTime<Utc>,
    /// Last successful validation.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Explicitly revoked.
    pub revoked: bool,
}

#[derive(Default)]
struct Tables {
    enrollments: HashMap<String, EnrollmentToken>,
    credentials: HashMap<String, DeviceCredential>,
}

/// The auth service. Cheap to share via `Arc`.
pub struct AuthService {
    enrollment_ttl: chrono::Duration,
    credential_ttl: chrono::Duration,
    tables: Mutex<Tables>,
    revocations: broadcast::Sender<String>,
}

impl AuthService {
    /// Create a service with the configured TTLs.
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            enrollment_ttl: to_chrono(config.enrollment_ttl),
            credential_ttl: to_chrono(config.credential_ttl),
            tables: Mutex::new(Tables::default()),
            revocations: broadcast::channel(REVOCATION_CAPACITY).0,
        }
    }

    /// Issue a fresh enrollment token.
    pub fn issue_enrollment(&self) -> EnrollmentToken {
        self.issue_enrollment_at(Utc::now())
    }

    /// Issue a fresh enrollment token with an explicit clock.
    pub fn issue_enrollment_at(&self, now: DateTime<Utc>) -> EnrollmentToken {
        let enrollment = EnrollmentToken {
            token: random_hex(TOKEN_BYTES),
            issued_at: now,
            expires_at: now + self.enrollment_ttl,
            consumed: false,
        };
        let mut tables = self.lock();
        tables
            .enrollments
            .insert(enrollment.token.clone(), enrollment.clone());
        tracing::debug!(expires_at = %enrollment.expires_at, "Issued enrollment token");
        enrollment
    }

    /// Redeem an enrollment token, minting a device credential.
    ///
    /// Verify-and-flip is atomic: a second redemption of the same token
    /// always fails with `already_consumed`.
    ///
    /// # Errors
    ///
    /// [`AuthError::UnknownToken`], [`AuthError::TokenConsumed`] or
    /// [`AuthError::TokenExpired`].
    pub fn redeem_enrollment(
        &self,
        token: &str,
        device_id: &str,
    ) -> Result<DeviceCredential, AuthError> {
        self.redeem_enrollment_at(token, device_id, Utc::now())
    }

    /// Redeem with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`AuthService::redeem_enrollment`].
    pub fn redeem_enrollment_at(
        &self,
        token: &str,
        device_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceCredential, AuthError> {
        let mut tables = self.lock();

        let enrollment = tables
            .enrollments
            .get_mut(token)
            .ok_or(AuthError::UnknownToken)?;
        if enrollment.consumed {
            return Err(AuthError::TokenConsumed);
        }
        if now >= enrollment.expires_at {
            return Err(AuthError::TokenExpired);
        }
        enrollment.consumed = true;

        let credential = DeviceCredential {
            key: random_hex(KEY_BYTES),
            device_id: device_id.to_string(),
            issued_at: now,
            expires_at: now + self.credential_ttl,
            last_used_at: None,
            revoked: false,
        };
        tables
            .credentials
            .insert(credential.key.clone(), credential.clone());
        tracing::info!(device_id = %device_id, "Paired new device");
        Ok(credential)
    }

    /// Validate a credential key, touching `last_used_at`.
    ///
    /// # Errors
    ///
    /// [`AuthError::UnknownKey`], [`AuthError::KeyRevoked`] or
    /// [`AuthError::KeyExpired`].
    pub fn validate(&self, key: &str) -> Result<DeviceCredential, AuthError> {
        self.validate_at(key, Utc::now())
    }

    /// Validate with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`AuthService::validate`].
    pub fn validate_at(&self, key: &str, now: DateTime<Utc>) -> Result<DeviceCredential, AuthError> {
        let mut tables = self.lock();
        let credential = tables.credentials.get_mut(key).ok_or(AuthError::UnknownKey)?;
        if credential.revoked {
            return Err(AuthError::KeyRevoked);
        }
        if now >= credential.expires_at {
            return Err(AuthError::KeyExpired);
        }
        credential.last_used_at = Some(now);
        Ok(credential.clone())
    }

    /// Extend a currently valid credential by one credential TTL.
    ///
    /// # Errors
    ///
    /// Same taxonomy as [`AuthService::validate`].
    pub fn refresh(&self, key: &str) -> Result<DeviceCredential, AuthError> {
        self.refresh_at(key, Utc::now())
    }

    /// Refresh with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`AuthService::refresh`].
    pub fn refresh_at(&self, key: &str, now: DateTime<Utc>) -> Result<DeviceCredential, AuthError> {
        let mut tables = self.lock();
        let credential = tables.credentials.get_mut(key).ok_or(AuthError::UnknownKey)?;
        if credential.revoked {
            return Err(AuthError::KeyRevoked);
        }
        if now >= credential.expires_at {
            return Err(AuthError::KeyExpired);
        }
        credential.expires_at = credential.expires_at + self.credential_ttl;
        credential.last_used_at = Some(now);
        Ok(credential.clone())
    }

    /// Revoke a credential. Subsequent validations fail and any connected
    /// client holding the key is told to disconnect.
    ///
    /// # Errors
    ///
    /// [`AuthError::UnknownKey`] when no such credential exists. Revoking
    /// an already revoked credential is a no-op.
    pub fn revoke(&self, key: &str) -> Result<(), AuthError> {
        {
            let mut tables = self.lock();
            let credential = tables.credentials.get_mut(key).ok_or(AuthError::UnknownKey)?;
            if credential.revoked {
                return Ok(());
            }
            credential.revoked = true;
            tracing::info!(device_id = %credential.device_id, "Revoked credential");
        }
        let _ = self.revocations.send(key.to_string());
        Ok(())
    }

    /// Subscribe to revoked-key announcements.
    #[must_use]
    pub fn subscribe_revocations(&self) -> broadcast::Receiver<String> {
        self.revocations.subscribe()
    }

    /// Delete expired rows from both tables. Returns how many were removed.
    pub fn sweep(&self) -> (usize, usize) {
        self.sweep_at(Utc::now())
    }

    /// Sweep with an explicit clock.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let mut tables = self.lock();
        let enrollments_before = tables.enrollments.len();
        let credentials_before = tables.credentials.len();
        tables.enrollments.retain(|_, e| e.expires_at > now);
        tables.credentials.retain(|_, c| c.expires_at > now);
        let swept = (
            enrollments_before - tables.enrollments.len(),
            credentials_before - tables.credentials.len(),
        );
        if swept.0 > 0 || swept.1 > 0 {
            tracing::debug!(
                enrollments = swept.0,
                credentials = swept.1,
                "Swept expired auth entries"
            );
        }
        swept
    }

    /// Periodic sweep loop; runs until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.sweep();
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(30))
}

/// Cryptographically random hex string of `bytes` bytes.
fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}
