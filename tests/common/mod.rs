#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use qr_door::directory::{LookupError, MemoryDirectory, UserDirectory, UserRecord};
use qr_door::indicator::SignalDevice;

pub const SECRET: &str = "JBSWY3DPEHPK3PXP";
/// JBSWY3DPEHPK3PXP yields 123456 during [1710757650, 1710757680),
/// 617488 in the step before and 049292 in the step after.
pub const NOW: u64 = 1_710_757_665;

pub fn acme() -> MemoryDirectory {
    let mut directory = MemoryDirectory::new();
    directory.insert("acme", "alice", UserRecord::new(SECRET, true));
    directory.insert("acme", "bob", UserRecord::new(SECRET, false));
    directory
}

pub const ACME_JSON: &str = r#"{
    "acme": {
        "alice": { "name": "Alice", "role": "staff", "uid": "alice", "secret": "JBSWY3DPEHPK3PXP", "active": true },
        "bob": { "name": "Bob", "role": "contractor", "uid": "bob", "secret": "JBSWY3DPEHPK3PXP", "active": false }
    }
}"#;

/// Counts lookups on the way to a directory.
pub struct Counting<D> {
    pub inner: D,
    lookups: AtomicUsize,
}

impl<D> Counting<D> {
    pub fn new(inner: D) -> Self {
        Self { inner, lookups: AtomicUsize::new(0) }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl<D: UserDirectory> UserDirectory for Counting<D> {
    fn lookup(&self, issuer: &str, uid: &str) -> Result<UserRecord, LookupError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.lookup(issuer, uid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    High,
    Low,
}

/// Remembers every level it was driven to. Clones share the history.
#[derive(Clone, Default)]
pub struct RecordingDevice {
    levels: Arc<Mutex<Vec<Level>>>,
}

impl RecordingDevice {
    pub fn levels(&self) -> Vec<Level> {
        self.levels.lock().unwrap().clone()
    }

    pub fn pulses(&self) -> usize {
        self.levels().iter().filter(|level| **level == Level::High).count()
    }

    pub fn is_low(&self) -> bool {
        self.levels().last() != Some(&Level::High)
    }

    pub fn clear(&self) {
        self.levels.lock().unwrap().clear();
    }
}

impl SignalDevice for RecordingDevice {
    fn activate(&mut self) -> io::Result<()> {
        self.levels.lock().unwrap().push(Level::High);
        Ok(())
    }

    fn deactivate(&mut self) -> io::Result<()> {
        self.levels.lock().unwrap().push(Level::Low);
        Ok(())
    }
}
