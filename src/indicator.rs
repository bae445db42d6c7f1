//! The grant/deny indicator.
//!
//! A single binary output (an LED, a strike relay) signals the verdict:
//! held on for 3 seconds when access is granted, blinked 5 times at 0.2 second
//! intervals when denied. Signalling blocks the scan loop on purpose, so the
//! code still in front of the camera is not read again as a second attempt.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::clock::Clock;
use crate::engine::Verdict;

pub const GRANT_HOLD: Duration = Duration::from_secs(3);
pub const DENY_BLINKS: u32 = 5;
pub const DENY_INTERVAL: Duration = Duration::from_millis(200);

/// A binary output.
pub trait SignalDevice {
    fn activate(&mut self) -> io::Result<()>;
    fn deactivate(&mut self) -> io::Result<()>;
}

impl<S: SignalDevice + ?Sized> SignalDevice for Box<S> {
    fn activate(&mut self) -> io::Result<()> {
        (**self).activate()
    }
    fn deactivate(&mut self) -> io::Result<()> {
        (**self).deactivate()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pattern {
    /// On for the duration, then off
    Hold(Duration),
    /// `count` times on for `interval`, then off for `interval`
    Blink { count: u32, interval: Duration },
}

impl Pattern {
    pub fn for_verdict(verdict: &Verdict) -> Self {
        match verdict {
            Verdict::Granted => Pattern::Hold(GRANT_HOLD),
            Verdict::Denied(_) => Pattern::Blink { count: DENY_BLINKS, interval: DENY_INTERVAL },
        }
    }

    /// How long playing the pattern takes
    pub fn duration(&self) -> Duration {
        match *self {
            Pattern::Hold(duration) => duration,
            Pattern::Blink { count, interval } => interval * 2 * count,
        }
    }
}

/// Drives a [`SignalDevice`] with verdict patterns.
///
/// Device errors are logged and otherwise ignored: the verdict stands whether
/// or not the light came on. The device is switched off when the indicator is
/// dropped, on every exit path.
pub struct Indicator<S: SignalDevice, C: Clock> {
    device: S,
    clock: C,
}

impl<S: SignalDevice, C: Clock> Indicator<S, C> {
    pub fn new(device: S, clock: C) -> Self {
        let mut indicator = Self { device, clock };
        indicator.switch(false);
        indicator
    }

    pub fn signal(&mut self, verdict: &Verdict) {
        self.play(Pattern::for_verdict(verdict));
    }

    pub fn play(&mut self, pattern: Pattern) {
        debug!("indicator pattern {:?}", pattern);
        match pattern {
            Pattern::Hold(duration) => {
                self.switch(true);
                self.clock.sleep(duration);
                self.switch(false);
            }
            Pattern::Blink { count, interval } => {
                for _ in 0..count {
                    self.switch(true);
                    self.clock.sleep(interval);
                    self.switch(false);
                    self.clock.sleep(interval);
                }
            }
        }
    }

    pub fn off(&mut self) {
        self.switch(false);
    }

    pub fn device(&self) -> &S {
        &self.device
    }

    fn switch(&mut self, on: bool) {
        let result = if on { self.device.activate() } else { self.device.deactivate() };
        if let Err(error) = result {
            warn!("cannot switch indicator {}: {}", if on { "on" } else { "off" }, error);
        }
    }
}

impl<S: SignalDevice, C: Clock> Drop for Indicator<S, C> {
    fn drop(&mut self) {
        if let Err(error) = self.device.deactivate() {
            error!("cannot release indicator: {}", error);
        }
    }
}

#[derive(Debug, Default)]
/// Stand-in for a real output when running on a bench, logs state changes.
pub struct ConsoleDevice {
    lit: bool,
}

impl ConsoleDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignalDevice for ConsoleDevice {
    fn activate(&mut self) -> io::Result<()> {
        if !self.lit {
            debug!("indicator on");
        }
        self.lit = true;
        Ok(())
    }

    fn deactivate(&mut self) -> io::Result<()> {
        if self.lit {
            debug!("indicator off");
        }
        self.lit = false;
        Ok(())
    }
}

/// A GPIO output driven through the Linux sysfs interface.
///
/// The pin is exported (if it was not already) and configured as output on
/// open, driven low, and unexported again on drop if we exported it.
pub struct SysfsGpio {
    pin: u32,
    root: PathBuf,
    exported: bool,
}

impl SysfsGpio {
    pub const ROOT: &'static str = "/sys/class/gpio";
    /// BCM line the door controller is wired to by default
    pub const DEFAULT_PIN: u32 = 17;

    pub fn open(pin: u32) -> io::Result<Self> {
        Self::open_at(Self::ROOT, pin)
    }

    pub fn open_at(root: impl AsRef<Path>, pin: u32) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        let mut gpio = Self { pin, root, exported: false };

        if !gpio.pin_dir().exists() {
            fs::write(gpio.root.join("export"), pin.to_string())?;
            gpio.exported = true;
            info!("exported GPIO {}", pin);
        }
        fs::write(gpio.pin_dir().join("direction"), "out")?;
        gpio.deactivate()?;
        Ok(gpio)
    }

    /// The sysfs number of line `offset` of the GPIO chip labelled `label`.
    ///
    /// Since Linux 6.6 sysfs numbers start at each chip's base rather than 0,
    /// e.g. BCM 17 is 529 on a Raspberry Pi 4 (`pinctrl-bcm2711`, base 512).
    pub fn line_number(root: impl AsRef<Path>, label: &str, offset: u32) -> io::Result<u32> {
        let invalid = |what: String| io::Error::new(io::ErrorKind::InvalidData, what);

        for entry in fs::read_dir(root.as_ref())? {
            let chip = entry?.path();
            let is_chip = chip
                .file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with("gpiochip"));
            if !is_chip || fs::read_to_string(chip.join("label"))?.trim() != label {
                continue;
            }

            let read_number = |file: &str| -> io::Result<u32> {
                let text = fs::read_to_string(chip.join(file))?;
                text.trim()
                    .parse()
                    .map_err(|_| invalid(format!("{}/{}: {:?} is not a number", chip.display(), file, text.trim())))
            };
            let (base, lines) = (read_number("base")?, read_number("ngpio")?);
            if offset >= lines {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has {} lines, there is no line {}", label, lines, offset),
                ));
            }
            debug!("GPIO {} of {} is sysfs GPIO {}", offset, label, base + offset);
            return Ok(base + offset);
        }

        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no GPIO chip labelled {:?}", label),
        ))
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    fn pin_dir(&self) -> PathBuf {
        self.root.join(format!("gpio{}", self.pin))
    }

    fn write_value(&self, value: &str) -> io::Result<()> {
        fs::write(self.pin_dir().join("value"), value)
    }
}

impl SignalDevice for SysfsGpio {
    fn activate(&mut self) -> io::Result<()> {
        self.write_value("1")
    }

    fn deactivate(&mut self) -> io::Result<()> {
        self.write_value("0")
    }
}

impl Drop for SysfsGpio {
    fn drop(&mut self) {
        if let Err(error) = self.write_value("0") {
            error!("cannot drive GPIO {} low: {}", self.pin, error);
        }
        if self.exported {
            if let Err(error) = fs::write(self.root.join("unexport"), self.pin.to_string()) {
                warn!("cannot unexport GPIO {}: {}", self.pin, error);
            }
        }
    }
}
