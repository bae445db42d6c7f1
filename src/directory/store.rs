//! File-backed directory.
//!
//! The file holds the whole directory as one JSON document, and is re-read on
//! every lookup, so an edit is visible to the next scan. Wrap it in a
//! [`CachedDirectory`](super::CachedDirectory) to bound the I/O.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use log::{debug, info};

use super::{LookupError, MemoryDirectory, UserDirectory, UserRecord};

#[derive(Clone, Debug)]
pub struct FileDirectory {
    path: PathBuf,
}

impl FileDirectory {
    /// Opens the directory file, failing if it cannot be loaded right now.
    ///
    /// Later failures to read it are reported per lookup, as transient.
    pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
        let directory = Self { path: path.as_ref().into() };
        let snapshot = directory
            .load()
            .with_context(|| format!("cannot load user directory {}", directory.path.display()))?;
        info!(
            "user directory {} holds {} users",
            directory.path.display(),
            snapshot.len()
        );
        Ok(directory)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<MemoryDirectory, LookupError> {
        let contents = std::fs::read(&self.path).map_err(|error| {
            LookupError::Transient(format!("reading {}: {}", self.path.display(), error))
        })?;
        serde_json::from_slice(&contents).map_err(|error| {
            LookupError::Transient(format!("parsing {}: {}", self.path.display(), error))
        })
    }
}

impl UserDirectory for FileDirectory {
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError> {
        debug!("looking up {}/{} in {}", issuer, uid, self.path.display());
        self.load()?.lookup(issuer, uid)
    }
}
