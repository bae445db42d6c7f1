//! The scan loop: one decision at a time, from payload to light and log.
//!
//! Decoded payloads arrive as lines of text, e.g. from `zbarcam --raw`
//! writing into a pipe. Each payload is decided, its audit record is queued,
//! the indicator plays the verdict, and the loop pauses before the next scan.

use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::audit::AuditSink;
use crate::clock::Clock;
use crate::directory::UserDirectory;
use crate::engine::{Decision, Engine, LogObserver, StageObserver};
use crate::indicator::{Indicator, SignalDevice};
use crate::totp::{CodeVerifier, Totp};

/// Pause between two scans
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(500);
/// How long to wait for a payload before checking for an interrupt
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scan {
    Payload(String),
    /// A payload that is not UTF-8 text
    Undecodable,
    /// Nothing scanned within the poll interval
    Idle,
    /// The payload source has ended
    Closed,
}

/// Payload lines read on a background thread, so the loop can notice
/// interrupts while the source blocks.
pub struct ScanFeed {
    receiver: mpsc::Receiver<Scan>,
}

impl ScanFeed {
    pub fn spawn<R>(mut reader: R) -> io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("scan-feed".into())
            .spawn(move || {
                let mut line = Vec::new();
                loop {
                    line.clear();
                    match reader.read_until(b'\n', &mut line) {
                        Ok(0) => break,
                        Ok(_) => {}
                        Err(error) => {
                            error!("cannot read scanned payloads: {}", error);
                            break;
                        }
                    }
                    while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                        line.pop();
                    }
                    if line.is_empty() {
                        continue;
                    }
                    let scan = match std::str::from_utf8(&line) {
                        Ok(payload) => Scan::Payload(payload.to_owned()),
                        Err(_) => Scan::Undecodable,
                    };
                    if sender.send(scan).is_err() {
                        break;
                    }
                }
                debug!("scan feed closed");
            })?;
        Ok(Self { receiver })
    }

    pub fn next_scan(&self, timeout: Duration) -> Scan {
        match self.receiver.recv_timeout(timeout) {
            Ok(scan) => scan,
            Err(mpsc::RecvTimeoutError::Timeout) => Scan::Idle,
            Err(mpsc::RecvTimeoutError::Disconnected) => Scan::Closed,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    pub scans: u64,
    pub granted: u64,
    pub denied: u64,
    /// Audit records that could not even be queued
    pub audit_failures: u64,
}

pub struct Controller<D, S, C, A, V = Totp, O = LogObserver>
where
    S: SignalDevice,
    C: Clock,
{
    engine: Engine<D, V, O>,
    indicator: Indicator<S, C>,
    audit: A,
    clock: C,
    scan_interval: Duration,
    stats: RunStats,
}

impl<D, S, C, A, V, O> Controller<D, S, C, A, V, O>
where
    D: UserDirectory,
    S: SignalDevice,
    C: Clock + Clone,
    A: AuditSink,
    V: CodeVerifier,
    O: StageObserver,
{
    pub fn new(engine: Engine<D, V, O>, device: S, audit: A, clock: C) -> Self {
        Self {
            engine,
            indicator: Indicator::new(device, clock.clone()),
            audit,
            clock,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            stats: RunStats::default(),
        }
    }

    pub fn with_scan_interval(mut self, scan_interval: Duration) -> Self {
        self.scan_interval = scan_interval;
        self
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }

    pub fn indicator(&self) -> &Indicator<S, C> {
        &self.indicator
    }

    /// Runs one scan cycle for `raw`.
    ///
    /// The audit record is handed off before the indicator plays, and whatever
    /// the audit sink answers, the verdict stands.
    pub fn handle(&mut self, raw: &str) -> Decision {
        let now = self.clock.unix_time();
        let decision = self.engine.decide(raw, now);
        self.conclude(&decision);
        decision
    }

    /// Runs until `stop` is set or the feed closes.
    pub fn run(&mut self, feed: &ScanFeed, stop: &AtomicBool) -> RunStats {
        info!("QR code scanner ready, present a code");
        while !stop.load(Ordering::SeqCst) {
            match feed.next_scan(POLL_INTERVAL) {
                Scan::Payload(raw) => {
                    self.handle(&raw);
                }
                Scan::Undecodable => {
                    warn!("Access Denied: scanned payload is not UTF-8 text");
                    self.conclude(&Decision::malformed());
                }
                Scan::Idle => continue,
                Scan::Closed => {
                    info!("payload source closed");
                    break;
                }
            }
            self.clock.sleep(self.scan_interval);
        }
        self.indicator.off();
        self.stats
    }

    /// Stops the controller, handing back the audit sink (e.g. to drain it).
    pub fn into_audit(self) -> A {
        self.audit
    }

    fn conclude(&mut self, decision: &Decision) {
        self.stats.scans += 1;
        if decision.verdict.is_granted() {
            self.stats.granted += 1;
        } else {
            self.stats.denied += 1;
        }

        if let Some(record) = decision.audit_record() {
            if let Err(error) = self.audit.record(&record) {
                self.stats.audit_failures += 1;
                error!("audit record for {}/{} lost: {}", record.issuer, record.uid, error);
            }
        }
        self.indicator.signal(&decision.verdict);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditError, AuditRecord, MemorySink};
    use crate::clock::ManualClock;
    use crate::directory::{MemoryDirectory, UserRecord};
    use crate::engine::Verdict;
    use crate::indicator::{ConsoleDevice, DENY_INTERVAL, GRANT_HOLD};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    const NOW: u64 = 1_710_757_665;

    struct Refusing;

    impl AuditSink for Refusing {
        fn record(&self, _record: &AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Closed)
        }
    }

    fn engine() -> Engine<MemoryDirectory> {
        let mut directory = MemoryDirectory::new();
        directory.insert("acme", "alice", UserRecord::new("JBSWY3DPEHPK3PXP", true));
        Engine::new(directory)
    }

    #[test]
    fn feed_splits_lines_and_flags_binary() {
        let feed = ScanFeed::spawn(Cursor::new(b"123456:alice:acme\r\n\n\xff\xfe\nlast".to_vec())).unwrap();
        let timeout = Duration::from_secs(5);

        assert_eq!(feed.next_scan(timeout), Scan::Payload("123456:alice:acme".into()));
        assert_eq!(feed.next_scan(timeout), Scan::Undecodable);
        assert_eq!(feed.next_scan(timeout), Scan::Payload("last".into()));
        assert_eq!(feed.next_scan(timeout), Scan::Closed);
    }

    #[test]
    fn audit_failure_does_not_change_the_verdict() {
        let clock = ManualClock::at(NOW);
        let mut controller = Controller::new(engine(), ConsoleDevice::new(), Refusing, clock.clone());

        let decision = controller.handle("123456:alice:acme");

        assert_eq!(decision.verdict, Verdict::Granted);
        assert_eq!(clock.sleeps(), vec![GRANT_HOLD]);
        assert_eq!(controller.stats().audit_failures, 1);
        assert_eq!(controller.stats().granted, 1);
    }

    #[test]
    fn run_processes_feed_until_closed() {
        let clock = ManualClock::at(NOW);
        let audit = MemorySink::new();
        let mut controller = Controller::new(engine(), ConsoleDevice::new(), &audit, clock.clone())
            .with_scan_interval(Duration::from_millis(500));
        let feed = ScanFeed::spawn(Cursor::new("garbage\n000000:alice:acme\n".as_bytes().to_vec())).unwrap();

        let stats = controller.run(&feed, &AtomicBool::new(false));

        assert_eq!(stats, RunStats { scans: 2, granted: 0, denied: 2, audit_failures: 0 });
        assert_eq!(audit.records().len(), 1);
        assert_eq!(audit.records()[0].info.as_deref(), Some("Invalid code"));

        // two blink patterns, each followed by the pause between scans
        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 2 * (10 + 1));
        assert_eq!(sleeps[0], DENY_INTERVAL);
        assert_eq!(sleeps[10], Duration::from_millis(500));
    }

    #[test]
    fn run_stops_when_interrupted() {
        let clock = ManualClock::at(NOW);
        let mut controller = Controller::new(engine(), ConsoleDevice::new(), MemorySink::new(), clock);
        let feed = ScanFeed::spawn(Cursor::new(b"123456:alice:acme\n".to_vec())).unwrap();

        let stats = controller.run(&feed, &AtomicBool::new(true));

        assert_eq!(stats.scans, 0);
        assert!(controller.into_audit().records().is_empty());
    }

    /// Raises `stop` the first time it is switched on, as a signal arriving
    /// in the middle of a grant would.
    #[derive(Clone)]
    struct InterruptedRelay {
        stop: Arc<AtomicBool>,
        lit: Arc<AtomicBool>,
        activations: Arc<AtomicUsize>,
    }

    impl SignalDevice for InterruptedRelay {
        fn activate(&mut self) -> io::Result<()> {
            self.stop.store(true, Ordering::SeqCst);
            self.activations.fetch_add(1, Ordering::SeqCst);
            self.lit.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn deactivate(&mut self) -> io::Result<()> {
            self.lit.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn stop_during_grant_leaves_the_output_low() {
        let clock = ManualClock::at(NOW);
        let relay = InterruptedRelay {
            stop: Arc::new(AtomicBool::new(false)),
            lit: Arc::new(AtomicBool::new(false)),
            activations: Arc::new(AtomicUsize::new(0)),
        };
        let audit = MemorySink::new();
        let mut controller = Controller::new(engine(), relay.clone(), &audit, clock.clone());
        let feed = ScanFeed::spawn(Cursor::new(
            b"123456:alice:acme\n123456:alice:acme\n".to_vec(),
        ))
        .unwrap();

        let stats = controller.run(&feed, &relay.stop);

        // the grant in progress completes, the queued scan is never taken
        assert_eq!(stats.scans, 1);
        assert_eq!(relay.activations.load(Ordering::SeqCst), 1);
        assert_eq!(clock.sleeps(), vec![GRANT_HOLD, Duration::from_millis(500)]);
        assert!(!relay.lit.load(Ordering::SeqCst));
        assert_eq!(audit.records().len(), 1);

        drop(controller);
        assert!(!relay.lit.load(Ordering::SeqCst));
    }

    #[test]
    fn undecodable_payload_is_denied_without_audit() {
        let clock = ManualClock::at(NOW);
        let audit = MemorySink::new();
        let mut controller = Controller::new(engine(), ConsoleDevice::new(), &audit, clock);
        let feed = ScanFeed::spawn(Cursor::new(vec![0xc3, 0x28, b'\n'])).unwrap();

        let stats = controller.run(&feed, &AtomicBool::new(false));

        assert_eq!(stats.denied, 1);
        assert!(audit.records().is_empty());
    }
}
