//! # QR door controller
//!
//! An unattended access controller: a camera scans a QR code carrying
//! `<code>:<uid>:<issuer>`, the one-time code is checked against the user's
//! TOTP secret, the door indicator signals the verdict, and every attempt is
//! logged.
//!
//! The library is the access-decision pipeline and the pieces it is wired
//! to; everything outside of it is a collaborator behind a trait:
//! - [`directory::UserDirectory`]: who the users are, whether they are active,
//!   and their secrets
//! - [`audit::AuditSink`]: where attempts are recorded
//! - [`indicator::SignalDevice`]: the light (or relay) that shows the verdict
//! - [`clock::Clock`]: what time it is, and how to wait
//!
//! The pipeline itself, [`engine::Engine`], is a pure function of the scanned
//! payload, the time, and the directory's answer. The scan loop in
//! [`controller`] strings it together with the sinks.
//!
//! Camera capture and QR decoding are left to existing tools: the controller
//! reads decoded payloads line by line, e.g. from `zbarcam --raw`.

/// Application-level results. Library modules define their own `thiserror`
/// errors, which convert into this.
pub use anyhow::Result;

pub mod audit;
pub mod claim;
pub mod cli;
pub mod clock;
pub mod controller;
pub mod directory;
pub mod engine;
pub mod indicator;
pub mod totp;
