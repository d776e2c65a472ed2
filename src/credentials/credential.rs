//! Credential entity, health state and the views handed out of the pool.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::keyfile::StoredCredential;

/// Number of trailing secret characters shown to clients.
pub const DISPLAY_SUFFIX_LEN: usize = 8;

/// Opaque identifier of a registered credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialId(Uuid);

impl CredentialId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CredentialId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Health of a credential as seen by the selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialHealth {
    /// Eligible for selection.
    Available,
    /// Cooling down; eligible again once `cooldown_until` has passed.
    Exhausted,
    /// Rejected by the service; out of rotation until removed or re-registered.
    Invalid,
}

impl std::fmt::Display for CredentialHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialHealth::Available => write!(f, "available"),
            CredentialHealth::Exhausted => write!(f, "exhausted"),
            CredentialHealth::Invalid => write!(f, "invalid"),
        }
    }
}

/// Outcome of one external call, fed back into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    Success,
    QuotaExhausted,
    Invalid,
    TransientError,
}

impl CredentialOutcome {
    /// Label used for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialOutcome::Success => "success",
            CredentialOutcome::QuotaExhausted => "exhausted",
            CredentialOutcome::Invalid => "invalid",
            CredentialOutcome::TransientError => "transient",
        }
    }
}

/// A registered credential. Only the pool holds these.
#[derive(Debug)]
pub(crate) struct Credential {
    pub id: CredentialId,
    pub secret: SecretString,
    pub fingerprint: String,
    pub suffix: String,
    pub health: CredentialHealth,
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub registered_seq: u64,
    /// Sequence number of the last acquire; `None` when never handed out.
    pub acquired_seq: Option<u64>,
}

impl Credential {
    pub fn new(secret: SecretString, registered_seq: u64) -> Self {
        let fingerprint = fingerprint(&secret);
        let suffix = display_suffix(secret.expose_secret());
        Self {
            id: CredentialId::new(),
            secret,
            fingerprint,
            suffix,
            health: CredentialHealth::Available,
            consecutive_failures: 0,
            last_used_at: None,
            cooldown_until: None,
            registered_seq,
            acquired_seq: None,
        }
    }

    /// Whether selection may hand this credential out at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.health {
            CredentialHealth::Available => true,
            CredentialHealth::Exhausted => self.cooldown_until.map_or(true, |until| until <= now),
            CredentialHealth::Invalid => false,
        }
    }

    /// Returns an exhausted credential to rotation once its cooldown is over.
    pub fn restore_if_cooled(&mut self, now: DateTime<Utc>) {
        if self.health == CredentialHealth::Exhausted && self.is_eligible(now) {
            self.health = CredentialHealth::Available;
            self.cooldown_until = None;
            self.consecutive_failures = 0;
        }
    }

    pub fn view(&self) -> CredentialView {
        CredentialView {
            id: self.id,
            suffix: self.suffix.clone(),
            health: self.health,
            consecutive_failures: self.consecutive_failures,
            last_used_at: self.last_used_at,
            cooldown_until: self.cooldown_until,
        }
    }

    /// Rebuilds a credential from its persisted form.
    pub fn from_stored(stored: StoredCredential, registered_seq: u64) -> Self {
        let mut credential = Self::new(stored.secret, registered_seq);
        credential.health = stored.health;
        credential.consecutive_failures = stored.consecutive_failures;
        credential.last_used_at = stored.last_used_at;
        credential.cooldown_until = stored.cooldown_until;
        credential
    }

    pub fn stored(&self) -> StoredCredential {
        StoredCredential {
            secret: self.secret.clone(),
            health: self.health,
            consecutive_failures: self.consecutive_failures,
            last_used_at: self.last_used_at,
            cooldown_until: self.cooldown_until,
        }
    }

    pub fn lease(&self) -> CredentialLease {
        CredentialLease {
            id: self.id,
            suffix: self.suffix.clone(),
            secret: self.secret.clone(),
        }
    }
}

/// Public, secret-free description of a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialView {
    pub id: CredentialId,
    pub suffix: String,
    pub health: CredentialHealth,
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// A credential handed out for one external call.
///
/// The secret is only reachable through [`CredentialLease::secret`] and is
/// redacted in `Debug` output.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub id: CredentialId,
    pub suffix: String,
    secret: SecretString,
}

impl CredentialLease {
    pub fn secret(&self) -> &SecretString {
        &self.secret
    }
}

/// Aggregate health counts of the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHealth {
    pub total: usize,
    pub available: usize,
    pub exhausted: usize,
    pub invalid: usize,
}

/// Last `DISPLAY_SUFFIX_LEN` characters of a secret.
pub fn display_suffix(secret: &str) -> String {
    let count = secret.chars().count();
    secret
        .chars()
        .skip(count.saturating_sub(DISPLAY_SUFFIX_LEN))
        .collect()
}

/// SHA-256 of the secret, used for duplicate detection without comparing secrets.
pub(crate) fn fingerprint(secret: &SecretString) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.expose_secret().as_bytes());
    hex::encode(hasher.finalize())
}
