//! The user directory: resolves `(issuer, uid)` to a [`UserRecord`].
//!
//! The directory is an external collaborator. This module defines the contract
//! the decision engine relies on, plus the building blocks a deployment stacks
//! on top of each other:
//!
//! - [`FileDirectory`]: JSON file, re-read on every lookup
//! - [`TimeoutDirectory`]: bounds each lookup, a timeout is a transient failure
//! - [`CachedDirectory`]: explicit cache with a staleness bound
//!
//! e.g. `CachedDirectory::new(TimeoutDirectory::new(file, timeout), clock, ttl)`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod cache;
pub mod store;
pub mod timeout;

pub use cache::CachedDirectory;
pub use store::FileDirectory;
pub use timeout::TimeoutDirectory;

#[derive(Clone, Deserialize, PartialEq, Eq, Serialize)]
/// Snapshot of a user's access state.
///
/// Missing fields fail closed: no secret never verifies, no `active` flag
/// means inactive. Other document fields (name, role, ...) are ignored.
pub struct UserRecord {
    /// Base32 TOTP secret shared with the user's authenticator
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub active: bool,
}

impl UserRecord {
    pub fn new(secret: impl Into<String>, active: bool) -> Self {
        Self { secret: secret.into(), active }
    }
}

/// Secrets stay out of logs.
impl core::fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UserRecord")
            .field("secret", &"<redacted>")
            .field("active", &self.active)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The directory answered, and has no such user
    #[error("user not found")]
    NotFound,
    /// The directory could not answer (unreachable, timed out, corrupt)
    #[error("directory unavailable: {0}")]
    Transient(String),
}

impl LookupError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LookupError::Transient(_))
    }
}

pub trait UserDirectory {
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError>;
}

impl<D: UserDirectory + ?Sized> UserDirectory for &D {
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError> {
        (**self).lookup(issuer, uid)
    }
}

impl<D: UserDirectory + ?Sized> UserDirectory for Arc<D> {
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError> {
        (**self).lookup(issuer, uid)
    }
}

impl<D: UserDirectory + ?Sized> UserDirectory for Box<D> {
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError> {
        (**self).lookup(issuer, uid)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
/// In-memory directory, keyed by issuer, then by uid.
///
/// Its serialized form is the directory file format:
///
/// ```json
/// { "acme": { "alice": { "secret": "JBSWY3DPEHPK3PXP", "active": true } } }
/// ```
pub struct MemoryDirectory {
    tenants: HashMap<String, HashMap<String, UserRecord>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Adds or replaces a user, returning the previous record.
    pub fn insert(
        &mut self,
        issuer: impl Into<String>,
        uid: impl Into<String>,
        record: UserRecord,
    ) -> Option<UserRecord> {
        self.tenants
            .entry(issuer.into())
            .or_default()
            .insert(uid.into(), record)
    }

    pub fn remove(&mut self, issuer: &str, uid: &str) -> Option<UserRecord> {
        self.tenants.get_mut(issuer)?.remove(uid)
    }

    /// Number of users across all issuers
    pub fn len(&self) -> usize {
        self.tenants.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl UserDirectory for MemoryDirectory {
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError> {
        self.tenants
            .get(issuer)
            .and_then(|users| users.get(uid))
            .cloned()
            .ok_or(LookupError::NotFound)
    }
}
