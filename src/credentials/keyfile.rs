//! On-disk form of the credential pool.
//!
//! Secrets are written in clear text, so the file is created owner-only. Only
//! health survives a restart; rotation order starts over.

use std::path::Path;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::credential::CredentialHealth;
use super::pool::{CredentialPool, PoolError};
use crate::utils::write_atomic;

const KEYFILE_VERSION: u32 = 1;

/// One credential as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    #[serde(serialize_with = "expose_secret", deserialize_with = "wrap_secret")]
    pub secret: SecretString,
    pub health: CredentialHealth,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Every credential of a pool, in registration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub credentials: Vec<StoredCredential>,
}

impl CredentialFile {
    pub fn capture(pool: &CredentialPool) -> Self {
        Self {
            version: KEYFILE_VERSION,
            saved_at: Utc::now(),
            credentials: pool.export(),
        }
    }

    pub async fn write_to(&self, path: &Path) -> Result<(), PoolError> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, json).await?;
        Ok(())
    }

    /// Reads a credential file. A missing file yields `None`.
    pub fn read_from(path: &Path) -> Result<Option<Self>, PoolError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }
}

fn expose_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

fn wrap_secret<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}
