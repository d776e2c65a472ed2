//! Credential pool with health tracking and round-robin selection.
//!
//! All state sits behind one mutex, so `acquire` and `report_outcome` are
//! atomic with respect to each other: two concurrent Jobs can never be handed
//! a credential that only one of them should see as available.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::credential::{
    fingerprint, Credential, CredentialHealth, CredentialId, CredentialLease, CredentialOutcome,
    CredentialView, PoolHealth,
};
use super::keyfile::StoredCredential;
use crate::config::ForgeConfig;
use crate::error::ErrorCode;
use crate::metrics::MetricsCollector;

/// Errors returned by credential pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The secret is already registered and healthy.
    #[error("Credential ending in {0} is already registered")]
    DuplicateCredential(String),

    /// Empty or whitespace-only secret.
    #[error("Credential secret cannot be empty")]
    EmptySecret,

    /// No credential matches the given id or suffix.
    #[error("Credential not found: {0}")]
    NotFound(String),

    /// No credential is currently eligible for selection.
    #[error("No credential available: all credentials are exhausted, invalid or cooling down")]
    PoolExhausted,

    /// Reading or writing the credential file failed.
    #[error("Credential file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential file is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PoolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::DuplicateCredential(_) => ErrorCode::DuplicateCredential,
            PoolError::EmptySecret => ErrorCode::InvalidInput,
            PoolError::NotFound(_) => ErrorCode::NotFound,
            PoolError::PoolExhausted => ErrorCode::NoCredentialAvailable,
            PoolError::Io(_) | PoolError::Serialization(_) => ErrorCode::StorageFailure,
        }
    }
}

/// Cooldown policy applied when outcomes are reported.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    /// Cooldown after a quota rejection.
    pub quota_cooldown: Duration,
    /// Consecutive transient failures that trigger a cooldown.
    pub transient_failure_threshold: u32,
    /// Cooldown after the transient threshold is reached.
    pub transient_cooldown: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            quota_cooldown: Duration::from_secs(300),
            transient_failure_threshold: 3,
            transient_cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&ForgeConfig> for PoolPolicy {
    fn from(config: &ForgeConfig) -> Self {
        Self {
            quota_cooldown: config.quota_cooldown,
            transient_failure_threshold: config.transient_failure_threshold,
            transient_cooldown: config.transient_cooldown,
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    /// Registration order.
    credentials: Vec<Credential>,
    next_registration: u64,
    next_acquire: u64,
    last_acquired: Option<CredentialId>,
}

/// Owns every registered credential and decides which one serves the next call.
#[derive(Debug)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
    /// Bumped on every change worth persisting.
    revision: AtomicU64,
    policy: PoolPolicy,
    metrics: MetricsCollector,
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new(PoolPolicy::default())
    }
}

impl CredentialPool {
    /// Creates an empty pool.
    pub fn new(policy: PoolPolicy) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            revision: AtomicU64::new(0),
            policy,
            metrics: MetricsCollector::new(),
        }
    }

    /// Registers a secret as a new `available` credential.
    ///
    /// Re-registering a secret whose credential was marked `invalid` returns
    /// it to rotation under the same id instead of failing.
    pub fn register(&self, secret: SecretString) -> Result<CredentialId, PoolError> {
        let trimmed = secret.expose_secret().trim();
        if trimmed.is_empty() {
            return Err(PoolError::EmptySecret);
        }
        let secret = if trimmed.len() == secret.expose_secret().len() {
            secret
        } else {
            SecretString::from(trimmed.to_string())
        };
        let fingerprint = fingerprint(&secret);

        let mut state = self.state.lock().expect("credential pool lock poisoned");
        if let Some(existing) = state
            .credentials
            .iter_mut()
            .find(|c| c.fingerprint == fingerprint)
        {
            if existing.health != CredentialHealth::Invalid {
                return Err(PoolError::DuplicateCredential(existing.suffix.clone()));
            }
            existing.health = CredentialHealth::Available;
            existing.consecutive_failures = 0;
            existing.cooldown_until = None;
            info!(credential = %existing.suffix, "Re-registered invalid credential");
            self.bump();
            return Ok(existing.id);
        }

        let seq = state.next_registration;
        state.next_registration += 1;
        let credential = Credential::new(secret, seq);
        let id = credential.id;
        info!(credential = %credential.suffix, "Registered credential");
        state.credentials.push(credential);
        self.bump();
        Ok(id)
    }

    /// Re-registers persisted credentials, skipping secrets already present.
    ///
    /// Returns how many were added.
    pub fn restore(&self, stored: Vec<StoredCredential>) -> usize {
        let mut state = self.state.lock().expect("credential pool lock poisoned");
        let mut added = 0;
        for entry in stored {
            if entry.secret.expose_secret().trim().is_empty() {
                continue;
            }
            let fingerprint = fingerprint(&entry.secret);
            if state.credentials.iter().any(|c| c.fingerprint == fingerprint) {
                continue;
            }
            let seq = state.next_registration;
            state.next_registration += 1;
            let credential = Credential::from_stored(entry, seq);
            debug!(credential = %credential.suffix, health = %credential.health, "Restored credential");
            state.credentials.push(credential);
            added += 1;
        }
        if added > 0 {
            self.bump();
        }
        added
    }

    /// Persistable form of every credential, in registration order.
    pub fn export(&self) -> Vec<StoredCredential> {
        self.state
            .lock()
            .expect("credential pool lock poisoned")
            .credentials
            .iter()
            .map(Credential::stored)
            .collect()
    }

    /// Change counter; moves whenever registration or health changes.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes a credential by id.
    pub fn remove(&self, id: CredentialId) -> Result<CredentialView, PoolError> {
        let mut state = self.state.lock().expect("credential pool lock poisoned");
        let position = state
            .credentials
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;
        let removed = Self::remove_at(&mut state, position);
        self.bump();
        Ok(removed)
    }

    /// Removes the first credential (in registration order) with the given display suffix.
    pub fn remove_by_suffix(&self, suffix: &str) -> Result<CredentialView, PoolError> {
        let mut state = self.state.lock().expect("credential pool lock poisoned");
        let position = state
            .credentials
            .iter()
            .position(|c| c.suffix == suffix)
            .ok_or_else(|| PoolError::NotFound(suffix.to_string()))?;
        let removed = Self::remove_at(&mut state, position);
        self.bump();
        Ok(removed)
    }

    fn remove_at(state: &mut PoolState, position: usize) -> CredentialView {
        let removed = state.credentials.remove(position);
        if state.last_acquired == Some(removed.id) {
            state.last_acquired = None;
        }
        info!(credential = %removed.suffix, "Removed credential");
        removed.view()
    }

    /// Hands out the least recently used eligible credential.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::PoolExhausted` if no credential is eligible.
    pub fn acquire(&self) -> Result<CredentialLease, PoolError> {
        self.acquire_at(Utc::now(), None)
    }

    /// Like [`acquire`](Self::acquire) but prefers any credential other than `avoid`.
    pub fn acquire_avoiding(&self, avoid: Option<CredentialId>) -> Result<CredentialLease, PoolError> {
        self.acquire_at(Utc::now(), avoid)
    }

    pub(crate) fn acquire_at(
        &self,
        now: DateTime<Utc>,
        avoid: Option<CredentialId>,
    ) -> Result<CredentialLease, PoolError> {
        let mut state = self.state.lock().expect("credential pool lock poisoned");

        let mut eligible: Vec<usize> = (0..state.credentials.len())
            .filter(|&i| state.credentials[i].is_eligible(now))
            .collect();
        if eligible.is_empty() {
            self.metrics.record_credential_event("pool_exhausted");
            debug!("No eligible credential in pool");
            return Err(PoolError::PoolExhausted);
        }

        // Narrow the candidates while alternatives remain
        for skip in [avoid, state.last_acquired].into_iter().flatten() {
            if eligible.len() > 1 {
                eligible.retain(|&i| state.credentials[i].id != skip);
            }
        }

        let chosen = eligible
            .into_iter()
            .min_by_key(|&i| {
                let c = &state.credentials[i];
                (c.acquired_seq, c.registered_seq)
            })
            .ok_or(PoolError::PoolExhausted)?;

        let seq = state.next_acquire;
        state.next_acquire += 1;
        let credential = &mut state.credentials[chosen];
        credential.restore_if_cooled(now);
        credential.acquired_seq = Some(seq);
        let lease = credential.lease();
        state.last_acquired = Some(lease.id);

        self.metrics.record_credential_event("acquired");
        debug!(credential = %lease.suffix, "Acquired credential");
        Ok(lease)
    }

    /// Feeds the outcome of an external call back into credential health.
    ///
    /// Returns the credential's health after the update.
    pub fn report_outcome(
        &self,
        id: CredentialId,
        outcome: CredentialOutcome,
    ) -> Result<CredentialHealth, PoolError> {
        self.report_outcome_at(id, outcome, Utc::now())
    }

    pub(crate) fn report_outcome_at(
        &self,
        id: CredentialId,
        outcome: CredentialOutcome,
        now: DateTime<Utc>,
    ) -> Result<CredentialHealth, PoolError> {
        let mut state = self.state.lock().expect("credential pool lock poisoned");
        let credential = state
            .credentials
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| PoolError::NotFound(id.to_string()))?;

        match outcome {
            CredentialOutcome::Success => {
                credential.last_used_at = Some(now);
                credential.consecutive_failures = 0;
            }
            CredentialOutcome::QuotaExhausted => {
                if credential.health != CredentialHealth::Invalid {
                    credential.health = CredentialHealth::Exhausted;
                    credential.cooldown_until = Some(cooldown_end(now, self.policy.quota_cooldown));
                }
                warn!(
                    credential = %credential.suffix,
                    cooldown_secs = self.policy.quota_cooldown.as_secs(),
                    "Credential quota exhausted, cooling down"
                );
            }
            CredentialOutcome::Invalid => {
                credential.health = CredentialHealth::Invalid;
                credential.cooldown_until = None;
                warn!(credential = %credential.suffix, "Credential rejected, removed from rotation");
            }
            CredentialOutcome::TransientError => {
                credential.consecutive_failures += 1;
                if credential.health == CredentialHealth::Available
                    && credential.consecutive_failures >= self.policy.transient_failure_threshold
                {
                    credential.health = CredentialHealth::Exhausted;
                    credential.cooldown_until =
                        Some(cooldown_end(now, self.policy.transient_cooldown));
                    warn!(
                        credential = %credential.suffix,
                        failures = credential.consecutive_failures,
                        "Credential degraded, cooling down"
                    );
                }
            }
        }

        if outcome != CredentialOutcome::Success {
            self.metrics.record_credential_event(outcome.as_str());
        }
        let health = credential.health;
        drop(state);
        self.bump();
        Ok(health)
    }

    /// Number of registered credentials.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .expect("credential pool lock poisoned")
            .credentials
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of credentials `acquire` could hand out right now.
    pub fn available_count(&self) -> usize {
        let now = Utc::now();
        self.state
            .lock()
            .expect("credential pool lock poisoned")
            .credentials
            .iter()
            .filter(|c| c.is_eligible(now))
            .count()
    }

    /// Secret-free views of every credential, in registration order.
    pub fn views(&self) -> Vec<CredentialView> {
        let now = Utc::now();
        let mut state = self.state.lock().expect("credential pool lock poisoned");
        state
            .credentials
            .iter_mut()
            .map(|c| {
                c.restore_if_cooled(now);
                c.view()
            })
            .collect()
    }

    /// Aggregate health counts.
    pub fn health(&self) -> PoolHealth {
        let now = Utc::now();
        let state = self.state.lock().expect("credential pool lock poisoned");
        let mut health = PoolHealth {
            total: state.credentials.len(),
            ..PoolHealth::default()
        };
        for credential in &state.credentials {
            if credential.is_eligible(now) {
                health.available += 1;
            } else if credential.health == CredentialHealth::Invalid {
                health.invalid += 1;
            } else {
                health.exhausted += 1;
            }
        }
        health
    }
}

fn cooldown_end(now: DateTime<Utc>, cooldown: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(cooldown).unwrap_or_else(|_| TimeDelta::days(365));
    now + delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    fn pool_with(keys: &[&str]) -> (CredentialPool, Vec<CredentialId>) {
        let pool = CredentialPool::default();
        let ids = keys
            .iter()
            .map(|k| pool.register(secret(k)).expect("should register"))
            .collect();
        (pool, ids)
    }

    #[test]
    fn test_register_and_duplicate() {
        let (pool, _) = pool_with(&["key-aaaaaaaa"]);
        let result = pool.register(secret("key-aaaaaaaa"));
        assert!(matches!(result, Err(PoolError::DuplicateCredential(s)) if s == "aaaaaaaa"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_register_trims_and_rejects_empty() {
        let pool = CredentialPool::default();
        assert!(matches!(pool.register(secret("   ")), Err(PoolError::EmptySecret)));

        pool.register(secret("  key-bbbbbbbb \n")).expect("should register");
        let result = pool.register(secret("key-bbbbbbbb"));
        assert!(matches!(result, Err(PoolError::DuplicateCredential(_))));
    }

    #[test]
    fn test_remove_and_not_found() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        let removed = pool.remove(ids[0]).expect("should remove");
        assert_eq!(removed.suffix, "aaaaaaaa");
        assert!(matches!(pool.remove(ids[0]), Err(PoolError::NotFound(_))));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_remove_by_suffix_takes_first_match() {
        let (pool, ids) = pool_with(&["one-samesuff", "two-samesuff"]);
        let removed = pool.remove_by_suffix("samesuff").expect("should remove");
        assert_eq!(removed.id, ids[0]);
        assert!(pool.remove_by_suffix("missing!").is_err());
    }

    #[test]
    fn test_round_robin_two_credentials() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        let order: Vec<CredentialId> = (0..4)
            .map(|_| pool.acquire().expect("should acquire").id)
            .collect();
        assert_eq!(order, vec![ids[0], ids[1], ids[0], ids[1]]);
    }

    #[test]
    fn test_least_recently_used_across_three() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa", "key-bbbbbbbb", "key-cccccccc"]);
        let order: Vec<CredentialId> = (0..6)
            .map(|_| pool.acquire().expect("should acquire").id)
            .collect();
        assert_eq!(order, vec![ids[0], ids[1], ids[2], ids[0], ids[1], ids[2]]);
    }

    #[test]
    fn test_single_credential_reused() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa"]);
        assert_eq!(pool.acquire().expect("first").id, ids[0]);
        assert_eq!(pool.acquire().expect("second").id, ids[0]);
    }

    #[test]
    fn test_empty_pool_is_exhausted() {
        let pool = CredentialPool::default();
        assert!(matches!(pool.acquire(), Err(PoolError::PoolExhausted)));
    }

    #[test]
    fn test_quota_exhausted_cooldown() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        let now = Utc::now();

        let health = pool
            .report_outcome_at(ids[0], CredentialOutcome::QuotaExhausted, now)
            .expect("should report");
        assert_eq!(health, CredentialHealth::Exhausted);

        // Only B qualifies while A cools down
        for _ in 0..3 {
            let lease = pool.acquire_at(now, None).expect("should acquire");
            assert_eq!(lease.id, ids[1]);
        }

        pool.report_outcome_at(ids[1], CredentialOutcome::QuotaExhausted, now)
            .expect("should report");
        assert!(matches!(
            pool.acquire_at(now + TimeDelta::seconds(60), None),
            Err(PoolError::PoolExhausted)
        ));

        // After the cooldown A is back and restored to available
        let later = now + TimeDelta::seconds(301);
        let lease = pool.acquire_at(later, None).expect("cooldown elapsed");
        assert_eq!(lease.id, ids[0]);
        let view = pool
            .views()
            .into_iter()
            .find(|v| v.id == ids[0])
            .expect("view exists");
        assert_eq!(view.health, CredentialHealth::Available);
    }

    #[test]
    fn test_invalid_is_permanent_until_reregistered() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa"]);
        pool.report_outcome(ids[0], CredentialOutcome::Invalid)
            .expect("should report");

        let far_future = Utc::now() + TimeDelta::days(30);
        assert!(matches!(
            pool.acquire_at(far_future, None),
            Err(PoolError::PoolExhausted)
        ));
        assert_eq!(pool.health().invalid, 1);

        let id = pool.register(secret("key-aaaaaaaa")).expect("re-register");
        assert_eq!(id, ids[0]);
        assert_eq!(pool.available_count(), 1);
    }

    #[test]
    fn test_transient_threshold() {
        let pool = CredentialPool::new(PoolPolicy {
            transient_failure_threshold: 2,
            transient_cooldown: Duration::from_secs(10),
            ..PoolPolicy::default()
        });
        let id = pool.register(secret("key-aaaaaaaa")).expect("register");
        let now = Utc::now();

        let health = pool
            .report_outcome_at(id, CredentialOutcome::TransientError, now)
            .expect("report");
        assert_eq!(health, CredentialHealth::Available);

        // A success in between resets the counter
        pool.report_outcome_at(id, CredentialOutcome::Success, now)
            .expect("report");
        pool.report_outcome_at(id, CredentialOutcome::TransientError, now)
            .expect("report");
        let health = pool
            .report_outcome_at(id, CredentialOutcome::TransientError, now)
            .expect("report");
        assert_eq!(health, CredentialHealth::Exhausted);

        assert!(pool.acquire_at(now + TimeDelta::seconds(5), None).is_err());
        assert!(pool.acquire_at(now + TimeDelta::seconds(11), None).is_ok());
    }

    #[test]
    fn test_acquire_avoiding_prefers_other() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa", "key-bbbbbbbb", "key-cccccccc"]);
        let first = pool.acquire().expect("acquire");
        assert_eq!(first.id, ids[0]);

        // B would be next anyway; avoiding B must yield C
        let retry = pool.acquire_avoiding(Some(ids[1])).expect("acquire");
        assert_eq!(retry.id, ids[2]);
    }

    #[test]
    fn test_acquire_avoiding_falls_back_to_only_candidate() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa"]);
        let lease = pool.acquire_avoiding(Some(ids[0])).expect("only one left");
        assert_eq!(lease.id, ids[0]);
    }

    #[test]
    fn test_report_after_removal_is_not_found() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa"]);
        let lease = pool.acquire().expect("acquire");
        pool.remove(ids[0]).expect("remove");
        let result = pool.report_outcome(lease.id, CredentialOutcome::Success);
        assert!(matches!(result, Err(PoolError::NotFound(_))));
    }

    #[test]
    fn test_success_updates_last_used() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa"]);
        assert!(pool.views()[0].last_used_at.is_none());
        pool.report_outcome(ids[0], CredentialOutcome::Success)
            .expect("report");
        assert!(pool.views()[0].last_used_at.is_some());
    }

    #[test]
    fn test_failures_leave_last_used_untouched() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa", "key-bbbbbbbb"]);
        pool.report_outcome(ids[0], CredentialOutcome::TransientError)
            .expect("report");
        pool.report_outcome(ids[1], CredentialOutcome::QuotaExhausted)
            .expect("report");
        assert!(pool.views().iter().all(|v| v.last_used_at.is_none()));
    }

    #[test]
    fn test_revision_tracks_persisted_changes() {
        let pool = CredentialPool::default();
        let start = pool.revision();
        let id = pool.register(secret("key-aaaaaaaa")).expect("register");
        let registered = pool.revision();
        assert!(registered > start);

        // Selection alone is not persisted
        pool.acquire().expect("acquire");
        assert_eq!(pool.revision(), registered);

        pool.report_outcome(id, CredentialOutcome::QuotaExhausted)
            .expect("report");
        assert!(pool.revision() > registered);
    }

    #[test]
    fn test_restore_skips_known_secrets() {
        let (pool, _) = pool_with(&["key-aaaaaaaa"]);
        let mut stored = pool.export();
        let other = CredentialPool::default();
        other.register(secret("key-bbbbbbbb")).expect("register");
        stored.extend(other.export());

        assert_eq!(pool.restore(stored), 1);
        let suffixes: Vec<String> = pool.views().into_iter().map(|v| v.suffix).collect();
        assert_eq!(suffixes, vec!["aaaaaaaa", "bbbbbbbb"]);
    }

    #[test]
    fn test_health_counts() {
        let (pool, ids) = pool_with(&["key-aaaaaaaa", "key-bbbbbbbb", "key-cccccccc"]);
        pool.report_outcome(ids[0], CredentialOutcome::QuotaExhausted)
            .expect("report");
        pool.report_outcome(ids[1], CredentialOutcome::Invalid)
            .expect("report");

        let health = pool.health();
        assert_eq!(
            health,
            PoolHealth {
                total: 3,
                available: 1,
                exhausted: 1,
                invalid: 1,
            }
        );
    }

    #[test]
    fn test_concurrent_acquire_is_exclusive() {
        use std::sync::Arc;

        let pool = Arc::new(CredentialPool::default());
        for i in 0..4 {
            pool.register(secret(&format!("key-{:08}", i)))
                .expect("register");
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || pool.acquire().expect("acquire").id)
            })
            .collect();
        let mut ids: Vec<CredentialId> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        ids.sort_by_key(|id| id.to_string());
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }
}
