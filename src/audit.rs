//! Audit trail of access attempts.
//!
//! One [`AuditRecord`] is written per attempt that named a user, granted or
//! not. The sink stamps each record when writing it, so the controller's clock
//! never ends up in the log.
//!
//! Writing must never hold up the door: the controller talks to an
//! [`AuditWorker`], which queues records for a background thread. Records still
//! queued when the process dies are lost; a record is written at most once.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead as _, BufReader, Write as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub uid: String,
    pub issuer: String,
    /// Whether access was granted
    pub access: bool,
    /// Reason for a denial
    pub info: Option<String>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
/// An [`AuditRecord`] as stored, stamped at write time.
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub record: AuditRecord,
}

impl AuditEntry {
    pub fn stamp(record: AuditRecord) -> Self {
        Self { timestamp: Utc::now(), record }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log i/o: {0}")]
    Io(#[from] io::Error),
    #[error("cannot encode audit entry: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("audit worker has stopped")]
    Closed,
}

pub trait AuditSink {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

impl<S: AuditSink + ?Sized> AuditSink for &S {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        (**self).record(record)
    }
}

impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        (**self).record(record)
    }
}

impl<S: AuditSink + ?Sized> AuditSink for Box<S> {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        (**self).record(record)
    }
}

/// Appends entries to a file, one JSON object per line.
///
/// Each entry goes out in a single append-mode write followed by a flush, so
/// readers never observe half an entry from this process.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("appending audit entries to {}", path.display());
        Ok(Self { path, file: Mutex::new(file) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonLinesSink {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let entry = AuditEntry::stamp(record.clone());
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

/// Reads back a log written by [`JsonLinesSink`].
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>, AuditError> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            entries.push(serde_json::from_str(&line)?);
        }
    }
    Ok(entries)
}

#[derive(Debug, Default)]
/// Keeps entries in memory.
pub struct MemorySink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.entries().into_iter().map(|entry| entry.record).collect()
    }
}

impl AuditSink for MemorySink {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(AuditEntry::stamp(record.clone()));
        Ok(())
    }
}

/// How often a failed write is retried before the record is dropped
pub const DEFAULT_RETRIES: u32 = 2;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Default)]
/// Shared tallies of an [`AuditWorker`].
pub struct AuditCounters {
    written: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl AuditCounters {
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Records given up on after exhausting retries
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }
}

/// Writes records to a sink on a background thread, in submission order.
///
/// [`AuditSink::record`] on the worker only enqueues. Failed writes are
/// retried, then dropped and counted; they are never reported back.
pub struct AuditWorker {
    sender: Option<mpsc::Sender<AuditRecord>>,
    handle: Option<thread::JoinHandle<()>>,
    counters: AuditCounters,
}

impl AuditWorker {
    pub fn spawn<S>(sink: S) -> io::Result<Self>
    where
        S: AuditSink + Send + 'static,
    {
        Self::spawn_with(sink, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY)
    }

    pub fn spawn_with<S>(sink: S, retries: u32, retry_delay: Duration) -> io::Result<Self>
    where
        S: AuditSink + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel::<AuditRecord>();
        let counters = AuditCounters::default();
        let tallies = counters.clone();

        let handle = thread::Builder::new()
            .name("audit-writer".into())
            .spawn(move || {
                for record in receiver {
                    write_with_retries(&sink, &record, retries, retry_delay, &tallies);
                }
                debug!("audit writer drained");
            })?;

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            counters,
        })
    }

    pub fn counters(&self) -> AuditCounters {
        self.counters.clone()
    }

    /// Writes out everything queued, then stops the background thread.
    pub fn shutdown(mut self) -> AuditCounters {
        self.stop();
        self.counters.clone()
    }

    fn stop(&mut self) {
        drop(self.sender.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("audit writer panicked");
            }
        }
    }
}

impl AuditSink for AuditWorker {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.sender
            .as_ref()
            .ok_or(AuditError::Closed)?
            .send(record.clone())
            .map_err(|_| AuditError::Closed)
    }
}

impl Drop for AuditWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_with_retries<S: AuditSink>(
    sink: &S,
    record: &AuditRecord,
    retries: u32,
    retry_delay: Duration,
    counters: &AuditCounters,
) {
    let mut attempt = 0;
    loop {
        match sink.record(record) {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Err(error) if attempt < retries => {
                attempt += 1;
                debug!("audit write failed ({}), retry {} of {}", error, attempt, retries);
                thread::sleep(retry_delay);
            }
            Err(error) => {
                let dropped = counters.dropped.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "dropping audit record for {}/{} after {} attempts: {} ({} dropped so far)",
                    record.issuer,
                    record.uid,
                    attempt + 1,
                    error,
                    dropped
                );
                return;
            }
        }
    }
}
