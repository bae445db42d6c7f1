//! Lookup cache with an explicit staleness bound.
//!
//! Found users and definite misses are kept for at most `ttl`, measured on the
//! injected [`Clock`]. Transient failures are never cached, and an expired
//! entry is never served, even when the directory is down.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use log::{debug, trace};

use super::{LookupError, UserDirectory, UserRecord};
use crate::clock::Clock;

/// Default staleness bound
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
/// Default number of cached answers. Misses for arbitrary scanned uids are
/// cached too, so the cache must be bounded.
pub const DEFAULT_CAPACITY: usize = 1024;

struct Entry {
    fetched_at: Duration,
    answer: Result<UserRecord, LookupError>,
}

pub struct CachedDirectory<D, C> {
    inner: D,
    clock: C,
    ttl: Duration,
    capacity: usize,
    entries: Mutex<HashMap<(String, String), Entry>>,
}

impl<D: UserDirectory, C: Clock> CachedDirectory<D, C> {
    pub fn new(inner: D, clock: C, ttl: Duration) -> Self {
        Self::with_capacity(inner, clock, ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: D, clock: C, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner,
            clock,
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn invalidate(&self, issuer: &str, uid: &str) {
        self.entries().remove(&(issuer.to_owned(), uid.to_owned()));
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_inner(self) -> D {
        self.inner
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, entry: &Entry, now: Duration) -> bool {
        now.checked_sub(entry.fetched_at)
            .map_or(false, |age| age < self.ttl)
    }
}

impl<D: UserDirectory, C: Clock> UserDirectory for CachedDirectory<D, C> {
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError> {
        let key = (issuer.to_owned(), uid.to_owned());
        let now = self.clock.uptime();

        if let Some(entry) = self.entries().get(&key) {
            if self.is_fresh(entry, now) {
                trace!("cache hit for {}/{}", issuer, uid);
                return entry.answer.clone();
            }
        }

        let answer = self.inner.lookup(issuer, uid);
        if let Err(LookupError::Transient(_)) = answer {
            return answer;
        }

        let mut entries = self.entries();
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let before = entries.len();
            entries.retain(|_, entry| self.is_fresh(entry, now));
            if entries.len() >= self.capacity {
                entries.clear();
            }
            debug!("directory cache evicted {} entries", before - entries.len());
        }
        entries.insert(key, Entry { fetched_at: now, answer: answer.clone() });

        answer
    }
}
