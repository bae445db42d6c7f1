//! The access decision engine.
//!
//! Turns one scanned payload into one [`Verdict`], strictly in this order:
//!
//! 1. parse the payload; a malformed payload is denied and leaves no audit trail
//! 2. look the user up; a missing user, or an unreachable directory, is denied
//! 3. an inactive user is denied, without checking the code
//! 4. verify the code with one step of drift tolerance
//!
//! The engine holds no state between calls. It neither signals nor writes the
//! audit log; the caller hands the [`Decision`] to those sinks.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::audit::AuditRecord;
use crate::claim::{self, AccessClaim};
use crate::directory::{LookupError, UserDirectory};
use crate::totp::{CodeVerifier, Totp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DenyReason {
    InvalidCode,
    InactiveUser,
    UnknownUser,
    MalformedPayload,
}

/// These are the `info` strings of the audit log.
impl core::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            DenyReason::InvalidCode => "Invalid code",
            DenyReason::InactiveUser => "Inactive user",
            DenyReason::UnknownUser => "UID not found",
            DenyReason::MalformedPayload => "Malformed payload",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    Granted,
    Denied(DenyReason),
}

impl Verdict {
    pub fn is_granted(&self) -> bool {
        matches!(self, Verdict::Granted)
    }
}

impl core::fmt::Display for Verdict {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Verdict::Granted => f.write_str("Access Granted"),
            Verdict::Denied(reason) => write!(f, "Access Denied: {}", reason),
        }
    }
}

/// `info` of an audit record when the directory could not answer
pub const DIRECTORY_UNAVAILABLE: &str = "Directory unavailable";

#[derive(Clone, Debug, PartialEq, Eq)]
/// The outcome of one scan cycle.
pub struct Decision {
    pub verdict: Verdict,
    /// Absent iff the payload was malformed
    pub claim: Option<AccessClaim>,
    /// Why the lookup failed, for `Denied(UnknownUser)`
    pub lookup_failure: Option<LookupError>,
}

impl Decision {
    fn new(verdict: Verdict, claim: Option<AccessClaim>) -> Self {
        Self { verdict, claim, lookup_failure: None }
    }

    /// The decision for a payload that is not even a claim.
    pub fn malformed() -> Self {
        Self::new(Verdict::Denied(DenyReason::MalformedPayload), None)
    }

    /// The record to audit, if there is a subject to attribute it to.
    ///
    /// An unreachable directory is logged apart from an unknown user, so
    /// operators can tell an outage from someone probing uids.
    pub fn audit_record(&self) -> Option<AuditRecord> {
        let claim = self.claim.as_ref()?;
        let info = match (self.verdict, &self.lookup_failure) {
            (Verdict::Granted, _) => None,
            (Verdict::Denied(DenyReason::UnknownUser), Some(LookupError::Transient(_))) => {
                Some(DIRECTORY_UNAVAILABLE.to_owned())
            }
            (Verdict::Denied(reason), _) => Some(reason.to_string()),
        };
        Some(AuditRecord {
            uid: claim.uid.clone(),
            issuer: claim.issuer.clone(),
            access: self.verdict.is_granted(),
            info,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Parse,
    Lookup,
    Verify,
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Stage::Parse => "parse",
            Stage::Lookup => "lookup",
            Stage::Verify => "verify",
        })
    }
}

/// Receives the duration of each stage of a decision.
pub trait StageObserver {
    fn observe(&self, stage: Stage, elapsed: Duration);
}

impl<O: StageObserver + ?Sized> StageObserver for &O {
    fn observe(&self, stage: Stage, elapsed: Duration) {
        (**self).observe(stage, elapsed)
    }
}

#[derive(Clone, Copy, Debug, Default)]
/// Emits stage timings as debug logs.
pub struct LogObserver;

impl StageObserver for LogObserver {
    fn observe(&self, stage: Stage, elapsed: Duration) {
        debug!("{} took {:.4}s", stage, elapsed.as_secs_f64());
    }
}

pub struct Engine<D, V = Totp, O = LogObserver> {
    directory: D,
    verifier: V,
    observer: O,
}

impl<D: UserDirectory> Engine<D> {
    /// Engine with the default TOTP policy, logging stage timings.
    pub fn new(directory: D) -> Self {
        Self::with_parts(directory, Totp::default(), LogObserver)
    }
}

impl<D, V, O> Engine<D, V, O>
where
    D: UserDirectory,
    V: CodeVerifier,
    O: StageObserver,
{
    pub fn with_parts(directory: D, verifier: V, observer: O) -> Self {
        Self { directory, verifier, observer }
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Decides on the raw payload `raw`, scanned at `now` (seconds since the UNIX epoch).
    pub fn decide(&self, raw: &str, now: u64) -> Decision {
        debug!("decoded payload: {}", raw);

        let claim = match self.timed(Stage::Parse, || claim::parse(raw)) {
            Ok(claim) => claim,
            Err(error) => {
                warn!("Access Denied: malformed payload ({}), expected CODE:UID:ISSUER", error);
                return Decision::malformed();
            }
        };

        let record = match self.timed(Stage::Lookup, || {
            self.directory.lookup(&claim.issuer, &claim.uid)
        }) {
            Ok(record) => record,
            Err(error) => {
                match &error {
                    LookupError::NotFound => {
                        warn!("Access Denied: {}/{} not found", claim.issuer, claim.uid)
                    }
                    LookupError::Transient(cause) => warn!(
                        "Access Denied: {}/{} could not be looked up: {}",
                        claim.issuer, claim.uid, cause
                    ),
                }
                return Decision {
                    verdict: Verdict::Denied(DenyReason::UnknownUser),
                    claim: Some(claim),
                    lookup_failure: Some(error),
                };
            }
        };

        if !record.active {
            warn!("Access Denied: {}/{} is inactive", claim.issuer, claim.uid);
            return Decision::new(Verdict::Denied(DenyReason::InactiveUser), Some(claim));
        }

        let valid = self.timed(Stage::Verify, || {
            self.verifier.verify(&record.secret, &claim.code, now)
        });
        let verdict = if valid {
            info!("Access Granted: {}/{}", claim.issuer, claim.uid);
            Verdict::Granted
        } else {
            warn!("Access Denied: invalid code for {}/{}", claim.issuer, claim.uid);
            Verdict::Denied(DenyReason::InvalidCode)
        };
        Decision::new(verdict, Some(claim))
    }

    fn timed<T>(&self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let start_time = Instant::now();
        let result = f();
        self.observer.observe(stage, start_time.elapsed());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, UserRecord};
    use std::cell::{Cell, RefCell};

    const SECRET: &str = "JBSWY3DPEHPK3PXP";
    // JBSWY3DPEHPK3PXP yields 123456 during [1710757650, 1710757680)
    const NOW: u64 = 1_710_757_665;

    #[derive(Default)]
    struct CountingVerifier {
        calls: Cell<usize>,
    }

    impl CodeVerifier for CountingVerifier {
        fn verify(&self, secret: &str, code: &str, now: u64) -> bool {
            self.calls.set(self.calls.get() + 1);
            Totp::default().verify(secret, code, now)
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        stages: RefCell<Vec<Stage>>,
    }

    impl StageObserver for RecordingObserver {
        fn observe(&self, stage: Stage, _elapsed: Duration) {
            self.stages.borrow_mut().push(stage);
        }
    }

    struct Unreachable;

    impl UserDirectory for Unreachable {
        fn lookup(&self, _issuer: &str, _uid: &str) -> Result<UserRecord, LookupError> {
            Err(LookupError::Transient("connection refused".into()))
        }
    }

    fn directory() -> MemoryDirectory {
        let mut directory = MemoryDirectory::new();
        directory.insert("acme", "alice", UserRecord::new(SECRET, true));
        directory.insert("acme", "bob", UserRecord::new(SECRET, false));
        directory.insert("acme", "eve", UserRecord::new("", true));
        directory
    }

    #[test]
    fn grants_valid_code() {
        let engine = Engine::new(directory());
        let decision = engine.decide("123456:alice:acme", NOW);

        assert_eq!(decision.verdict, Verdict::Granted);
        assert_eq!(decision.claim, Some(AccessClaim::new("123456", "alice", "acme")));
        assert_eq!(
            decision.audit_record(),
            Some(AuditRecord {
                uid: "alice".into(),
                issuer: "acme".into(),
                access: true,
                info: None,
            })
        );
    }

    #[test]
    fn denies_invalid_code() {
        let engine = Engine::new(directory());
        let decision = engine.decide("000000:alice:acme", NOW);

        assert_eq!(decision.verdict, Verdict::Denied(DenyReason::InvalidCode));
        let record = decision.audit_record().unwrap();
        assert!(!record.access);
        assert_eq!(record.info.as_deref(), Some("Invalid code"));
    }

    #[test]
    fn malformed_payload_is_not_audited() {
        let engine = Engine::new(directory());
        for raw in ["garbage", "123456:alice", "123456::acme", "1:2:3:4", ""] {
            let decision = engine.decide(raw, NOW);
            assert_eq!(decision.verdict, Verdict::Denied(DenyReason::MalformedPayload));
            assert_eq!(decision.claim, None);
            assert_eq!(decision.audit_record(), None);
        }
    }

    #[test]
    fn malformed_payload_skips_lookup_and_verify() {
        let observer = RecordingObserver::default();
        let engine = Engine::with_parts(directory(), Totp::default(), &observer);
        engine.decide("garbage", NOW);
        assert_eq!(*observer.stages.borrow(), vec![Stage::Parse]);
    }

    #[test]
    fn unknown_user_is_audited() {
        let engine = Engine::new(directory());
        let decision = engine.decide("123456:mallory:acme", NOW);

        assert_eq!(decision.verdict, Verdict::Denied(DenyReason::UnknownUser));
        assert_eq!(decision.lookup_failure, Some(LookupError::NotFound));
        assert_eq!(
            decision.audit_record().unwrap().info.as_deref(),
            Some("UID not found")
        );
    }

    #[test]
    fn outage_is_denied_but_distinguishable() {
        let engine = Engine::new(Unreachable);
        let decision = engine.decide("123456:alice:acme", NOW);

        assert_eq!(decision.verdict, Verdict::Denied(DenyReason::UnknownUser));
        assert!(decision.lookup_failure.as_ref().unwrap().is_transient());
        assert_eq!(
            decision.audit_record().unwrap().info.as_deref(),
            Some(DIRECTORY_UNAVAILABLE)
        );
    }

    #[test]
    fn inactive_user_never_reaches_verifier() {
        let verifier = CountingVerifier::default();
        let observer = RecordingObserver::default();
        let engine = Engine::with_parts(directory(), &verifier, &observer);

        let decision = engine.decide("123456:bob:acme", NOW);

        assert_eq!(decision.verdict, Verdict::Denied(DenyReason::InactiveUser));
        assert_eq!(verifier.calls.get(), 0);
        assert_eq!(*observer.stages.borrow(), vec![Stage::Parse, Stage::Lookup]);
        assert_eq!(
            decision.audit_record().unwrap().info.as_deref(),
            Some("Inactive user")
        );
    }

    #[test]
    fn verifier_runs_once_for_active_users() {
        let verifier = CountingVerifier::default();
        let engine = Engine::with_parts(directory(), &verifier, LogObserver);

        engine.decide("123456:alice:acme", NOW);
        engine.decide("000000:alice:acme", NOW);
        assert_eq!(verifier.calls.get(), 2);
    }

    #[test]
    fn empty_secret_never_grants() {
        let engine = Engine::new(directory());
        let decision = engine.decide("123456:eve:acme", NOW);
        assert_eq!(decision.verdict, Verdict::Denied(DenyReason::InvalidCode));
    }

    #[test]
    fn decisions_are_repeatable() {
        let engine = Engine::new(directory());
        for raw in ["123456:alice:acme", "000000:alice:acme", "123456:bob:acme", "x"] {
            assert_eq!(engine.decide(raw, NOW), engine.decide(raw, NOW));
        }
    }

    #[test]
    fn drift_window_is_one_step() {
        let engine = Engine::new(directory());
        // 123456 is current during [1710757650, 1710757680)
        assert!(engine.decide("123456:alice:acme", 1_710_757_620).verdict.is_granted());
        assert!(engine.decide("123456:alice:acme", 1_710_757_709).verdict.is_granted());
        assert!(!engine.decide("123456:alice:acme", 1_710_757_619).verdict.is_granted());
        assert!(!engine.decide("123456:alice:acme", 1_710_757_710).verdict.is_granted());
    }

    #[test]
    fn verdicts_read_like_the_door_log() {
        assert_eq!(Verdict::Granted.to_string(), "Access Granted");
        assert_eq!(
            Verdict::Denied(DenyReason::InactiveUser).to_string(),
            "Access Denied: Inactive user"
        );
    }
}
