use core::convert::TryFrom;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Error, Result};
use clap::{
    App,
    Arg,
    crate_authors, crate_version,
    SubCommand,
};

use crate::controller::DEFAULT_SCAN_INTERVAL;
use crate::directory::{cache::DEFAULT_TTL, timeout::DEFAULT_TIMEOUT};

const DEFAULT_DIRECTORY: &str = "directory.json";

const ABOUT: &str = "
Unattended door controller: reads scanned CODE:UID:ISSUER payloads, checks the
one-time code against the user directory, signals the verdict and logs it.

Pipe decoded QR codes in, e.g. `zbarcam --raw | qr-door run --gpio-pin 17 --gpio-chip pinctrl-bcm2711`.
";

pub fn app() -> clap::App<'static, 'static> {

    let app = App::new("qr-door")
        .author(crate_authors!())
        .version(crate_version!())
        .about(ABOUT)
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)

        .arg(Arg::with_name("verbose")
             .short("v")
             .long("verbose")
             .multiple(true)
             .help("more logging, repeat for even more")
             .global(true)
        )

        .arg(Arg::with_name("directory")
             .short("d")
             .long("directory")
             .help("JSON file with the users of each issuer [default: directory.json]")
             .value_name("FILE")
             .global(true)
        )

        .subcommand(SubCommand::with_name("run")
            .about("scan payloads and drive the door indicator until interrupted")
            .arg(Arg::with_name("source")
                 .long("source")
                 .help("read payloads from this file or FIFO instead of stdin")
                 .value_name("FILE")
             )
            .arg(Arg::with_name("audit-log")
                 .long("audit-log")
                 .default_value("access-log.jsonl")
                 .help("file the access log is appended to")
                 .value_name("FILE")
             )
            .arg(Arg::with_name("gpio-pin")
                 .long("gpio-pin")
                 .help("sysfs GPIO number driving the indicator, or its line on --gpio-chip; without it, the indicator is logged")
                 .value_name("PIN")
             )
            .arg(Arg::with_name("gpio-chip")
                 .long("gpio-chip")
                 .help("count --gpio-pin from the base of this chip, e.g. pinctrl-bcm2711 for BCM numbering on a Pi 4")
                 .value_name("LABEL")
                 .requires("gpio-pin")
             )
            .arg(Arg::with_name("scan-interval-ms")
                 .long("scan-interval-ms")
                 .help("pause between two scans")
                 .value_name("MILLISECONDS")
             )
            .arg(Arg::with_name("cache-ttl-secs")
                 .long("cache-ttl-secs")
                 .help("how stale a cached directory answer may be")
                 .value_name("SECONDS")
             )
            .arg(Arg::with_name("lookup-timeout-ms")
                 .long("lookup-timeout-ms")
                 .help("directory lookups taking longer are treated as failed")
                 .value_name("MILLISECONDS")
             )
        )

        .subcommand(SubCommand::with_name("check")
            .about("decide on a payload without signalling or logging it")
            .arg(Arg::with_name("PAYLOAD")
                 .help("scanned payload, e.g. 123456:alice:acme")
                 .required(true)
             )
            .arg(Arg::with_name("timestamp")
                 .short("t")
                 .long("timestamp")
                 .help("decide as of this time, in seconds since the UNIX epoch")
                 .value_name("TIMESTAMP")
             )
        )

        // cf. https://github.com/google/google-authenticator/wiki/Key-Uri-Format
        // eg. otpauth://totp/acme:alice?secret=JBSWY3DPEHPK3PXP&issuer=acme

        .subcommand(SubCommand::with_name("code")
            .about("generate the current code for a TOTP secret")
            .arg(Arg::with_name("SECRET")
                 .help("the Base32 TOTP secret, e.g. JBSWY3DPEHPK3PXP")
                 .required(true)
             )
            .arg(Arg::with_name("timestamp")
                 .short("t")
                 .long("timestamp")
                 .help("timestamp to use to generate the code, as seconds since the UNIX epoch")
                 .value_name("TIMESTAMP")
             )
            .arg(Arg::with_name("uid")
                 .long("uid")
                 .help("also print the scan payload and provisioning URI for this user")
                 .value_name("UID")
                 .requires("issuer")
             )
            .arg(Arg::with_name("issuer")
                 .long("issuer")
                 .value_name("ISSUER")
                 .requires("uid")
             )
        )
    ;

    app

}

#[derive(Clone, Debug, PartialEq)]
/// Runs the scan loop
pub struct Run {
    pub directory: PathBuf,
    /// `None` reads stdin
    pub source: Option<PathBuf>,
    pub audit_log: PathBuf,
    /// `None` logs the indicator instead of driving a pin
    pub gpio_pin: Option<u32>,
    /// Label of the chip `gpio_pin` is a line of; `None` if it is a sysfs number
    pub gpio_chip: Option<String>,
    pub scan_interval: Duration,
    pub cache_ttl: Duration,
    pub lookup_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
/// Dry-run decision on one payload
pub struct Check {
    pub directory: PathBuf,
    pub payload: String,
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
/// Code generation for a secret
pub struct Code {
    pub secret: String,
    pub timestamp: Option<u64>,
    /// uid and issuer, when the full payload is wanted
    pub subject: Option<(String, String)>,
}

#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum Command {
    Run(Run),
    Check(Check),
    Code(Code),
}

/// Logging verbosity, from the number of `-v` flags
pub fn verbosity(args: &clap::ArgMatches<'static>) -> u64 {
    let sub = args.subcommand().1.map_or(0, |command| command.occurrences_of("verbose"));
    args.occurrences_of("verbose").max(sub)
}

/// Global options may come before or after the subcommand.
fn directory(args: &clap::ArgMatches<'static>, command: &clap::ArgMatches<'static>) -> PathBuf {
    command
        .value_of("directory")
        .or_else(|| args.value_of("directory"))
        .unwrap_or(DEFAULT_DIRECTORY)
        .into()
}

fn required<'a>(args: &'a clap::ArgMatches<'static>, name: &str) -> Result<&'a str> {
    args.value_of(name)
        .ok_or_else(|| anyhow::anyhow!("missing argument {}", name))
}

fn number(args: &clap::ArgMatches<'static>, name: &str) -> Result<Option<u64>> {
    args.value_of(name)
        .map(|value| value.parse::<u64>().with_context(|| format!("--{} expects a number, got {:?}", name, value)))
        .transpose()
}

impl TryFrom<&'_ clap::ArgMatches<'static>> for Command {
    type Error = Error;
    fn try_from(args: &clap::ArgMatches<'static>) -> Result<Self> {
        if let Some(command) = args.subcommand_matches("run") {
            let gpio_pin = number(command, "gpio-pin")?
                .map(u32::try_from)
                .transpose()
                .context("--gpio-pin is out of range")?;
            return Ok(Command::Run(Run {
                directory: directory(args, command),
                source: command.value_of("source").map(PathBuf::from),
                audit_log: required(command, "audit-log")?.into(),
                gpio_pin,
                gpio_chip: command.value_of("gpio-chip").map(String::from),
                scan_interval: number(command, "scan-interval-ms")?
                    .map_or(DEFAULT_SCAN_INTERVAL, Duration::from_millis),
                cache_ttl: number(command, "cache-ttl-secs")?
                    .map_or(DEFAULT_TTL, Duration::from_secs),
                lookup_timeout: number(command, "lookup-timeout-ms")?
                    .map_or(DEFAULT_TIMEOUT, Duration::from_millis),
            }));
        }

        if let Some(command) = args.subcommand_matches("check") {
            return Ok(Command::Check(Check {
                directory: directory(args, command),
                payload: required(command, "PAYLOAD")?.into(),
                timestamp: number(command, "timestamp")?,
            }));
        }

        if let Some(command) = args.subcommand_matches("code") {
            let subject = match (command.value_of("uid"), command.value_of("issuer")) {
                (Some(uid), Some(issuer)) => Some((uid.into(), issuer.into())),
                _ => None,
            };
            return Ok(Command::Code(Code {
                secret: required(command, "SECRET")?.into(),
                timestamp: number(command, "timestamp")?,
                subject,
            }));
        }
        Err(anyhow::anyhow!("Unexpected case"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(argv: &[&str]) -> Result<Command> {
        let args = app().get_matches_from_safe(argv.iter().copied())?;
        Command::try_from(&args)
    }

    #[test]
    fn run_defaults() {
        assert_eq!(
            command(&["qr-door", "run"]).unwrap(),
            Command::Run(Run {
                directory: "directory.json".into(),
                source: None,
                audit_log: "access-log.jsonl".into(),
                gpio_pin: None,
                gpio_chip: None,
                scan_interval: Duration::from_millis(500),
                cache_ttl: Duration::from_secs(30),
                lookup_timeout: Duration::from_millis(1500),
            })
        );
    }

    #[test]
    fn run_options() {
        let parsed = command(&[
            "qr-door", "-d", "users.json", "run",
            "--source", "/run/qr.fifo",
            "--gpio-pin", "17",
            "--scan-interval-ms", "250",
            "--cache-ttl-secs", "5",
            "--lookup-timeout-ms", "1000",
        ])
        .unwrap();
        match parsed {
            Command::Run(run) => {
                assert_eq!(run.directory, PathBuf::from("users.json"));
                assert_eq!(run.source, Some(PathBuf::from("/run/qr.fifo")));
                assert_eq!(run.gpio_pin, Some(17));
                assert_eq!(run.gpio_chip, None);
                assert_eq!(run.scan_interval, Duration::from_millis(250));
                assert_eq!(run.cache_ttl, Duration::from_secs(5));
                assert_eq!(run.lookup_timeout, Duration::from_secs(1));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn gpio_chip_needs_a_pin() {
        match command(&["qr-door", "run", "--gpio-pin", "17", "--gpio-chip", "pinctrl-bcm2711"]).unwrap() {
            Command::Run(run) => {
                assert_eq!(run.gpio_pin, Some(17));
                assert_eq!(run.gpio_chip.as_deref(), Some("pinctrl-bcm2711"));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert!(command(&["qr-door", "run", "--gpio-chip", "pinctrl-bcm2711"]).is_err());
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(command(&["qr-door", "run", "--gpio-pin", "seventeen"]).is_err());
        assert!(command(&["qr-door", "check", "1:2:3", "-t", "yesterday"]).is_err());
    }

    #[test]
    fn check_and_code() {
        assert_eq!(
            command(&["qr-door", "check", "123456:alice:acme", "-t", "1710757665"]).unwrap(),
            Command::Check(Check {
                directory: "directory.json".into(),
                payload: "123456:alice:acme".into(),
                timestamp: Some(1_710_757_665),
            })
        );
        assert_eq!(
            command(&["qr-door", "code", "JBSWY3DPEHPK3PXP", "--uid", "alice", "--issuer", "acme"]).unwrap(),
            Command::Code(Code {
                secret: "JBSWY3DPEHPK3PXP".into(),
                timestamp: None,
                subject: Some(("alice".into(), "acme".into())),
            })
        );
    }

    #[test]
    fn counts_verbosity() {
        let args = app().get_matches_from_safe(["qr-door", "-vv", "code", "X"].iter().copied()).unwrap();
        assert_eq!(verbosity(&args), 2);
    }
}
