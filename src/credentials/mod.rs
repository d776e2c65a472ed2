//! Credential pool: registration, health tracking and selection of API keys.

mod credential;
mod keyfile;
mod pool;

pub use credential::{
    display_suffix, CredentialHealth, CredentialId, CredentialLease, CredentialOutcome,
    CredentialView, PoolHealth, DISPLAY_SUFFIX_LEN,
};
pub use keyfile::{CredentialFile, StoredCredential};
pub use pool::{CredentialPool, PoolError, PoolPolicy};
