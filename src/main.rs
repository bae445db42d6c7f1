use core::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use log::{info, warn, LevelFilter};

use qr_door::{
    audit::{AuditWorker, JsonLinesSink},
    claim::AccessClaim,
    cli,
    clock::{Clock, SystemClock},
    controller::{Controller, ScanFeed},
    directory::{CachedDirectory, FileDirectory, TimeoutDirectory},
    engine::Engine,
    indicator::{ConsoleDevice, SignalDevice, SysfsGpio},
    totp,
};

fn main() -> Result<()> {

    let args = init_app();
    init_logger(cli::verbosity(&args))?;
    info!("qr-door {}", clap::crate_version!());

    let command = cli::Command::try_from(&args)?;

    match command {
        cli::Command::Run(run) => {
            scan(&run)?;
        }
        cli::Command::Check(check) => {
            let directory = FileDirectory::open(&check.directory)?;
            let now = check.timestamp.unwrap_or_else(|| SystemClock::new().unix_time());
            let decision = Engine::new(directory).decide(&check.payload, now);

            println!("{}", decision.verdict);
            if let Some(record) = decision.audit_record() {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        cli::Command::Code(code) => {
            let now = code.timestamp.unwrap_or_else(|| SystemClock::new().unix_time());
            let otp = totp::Totp::default().generate_for(&code.secret, now)?;

            println!("OTP = {}", otp);
            if let Some((uid, issuer)) = &code.subject {
                println!("payload = {}", AccessClaim::new(otp.to_string(), uid, issuer).payload());
                println!("uri = {}", totp::key_uri(uid, issuer, &code.secret));
            }
        }
    }

    Ok(())
}

/// Brings up every resource, then scans until interrupted or the source ends.
///
/// Resources are released in reverse order on every path out of here: the
/// indicator is switched off, the GPIO unexported, queued audit records written.
fn scan(parameters: &cli::Run) -> Result<()> {
    let clock = SystemClock::new();

    let directory = CachedDirectory::new(
        TimeoutDirectory::new(FileDirectory::open(&parameters.directory)?, parameters.lookup_timeout),
        clock.clone(),
        parameters.cache_ttl,
    );

    let sink = JsonLinesSink::open(&parameters.audit_log)
        .with_context(|| format!("cannot open audit log {}", parameters.audit_log.display()))?;
    let audit = AuditWorker::spawn(sink).context("cannot start audit writer")?;

    let device: Box<dyn SignalDevice> = match parameters.gpio_pin {
        Some(pin) => {
            let line = match &parameters.gpio_chip {
                Some(label) => SysfsGpio::line_number(SysfsGpio::ROOT, label, pin)
                    .with_context(|| format!("cannot find line {} of GPIO chip {}", pin, label))?,
                None => pin,
            };
            Box::new(SysfsGpio::open(line).with_context(|| format!("cannot set up GPIO {}", line))?)
        }
        None => {
            warn!("no GPIO pin configured, the indicator only shows up in debug logs");
            Box::new(ConsoleDevice::new())
        }
    };

    let feed = match &parameters.source {
        Some(path) => ScanFeed::spawn(BufReader::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => ScanFeed::spawn(BufReader::new(io::stdin())),
    }
    .context("cannot start reading payloads")?;

    // SIGINT, SIGTERM and SIGHUP all end the loop, so the cleanup below runs
    // for `systemctl stop` and `docker stop` too
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("cannot install interrupt handler")?;
    }

    let mut controller = Controller::new(Engine::new(directory), device, audit, clock)
        .with_scan_interval(parameters.scan_interval);
    let stats = controller.run(&feed, &stop);
    let counters = controller.into_audit().shutdown();

    info!(
        "Exiting... {} scans, {} granted, {} denied",
        stats.scans, stats.granted, stats.denied
    );
    if counters.dropped() > 0 || stats.audit_failures > 0 {
        warn!(
            "{} audit records written, {} lost",
            counters.written(),
            counters.dropped() + stats.audit_failures
        );
    }

    Ok(())
}

pub fn init_app() -> clap::ArgMatches<'static> {
    let app = cli::app();
    let matches = app.get_matches();
    matches
}

pub fn init_logger(verbosity: u64) -> Result<()> {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    simple_logger::SimpleLogger::new().with_level(level).init()?;
    Ok(())
}
