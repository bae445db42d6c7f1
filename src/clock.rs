//! Time sources.
//!
//! Everything time-dependent (code verification, cache expiry, indicator
//! patterns, the pause between scans) reads time through [`Clock`], so tests
//! can run against a [`ManualClock`] without waiting on real sleeps.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock {
    /// Wall clock, seconds since the UNIX epoch
    fn unix_time(&self) -> u64;
    /// Monotonic time since the clock was created
    fn uptime(&self) -> Duration;
    /// Blocks the caller for `duration`
    fn sleep(&self, duration: Duration);
}

impl<C: Clock + ?Sized> Clock for &C {
    fn unix_time(&self) -> u64 {
        (**self).unix_time()
    }
    fn uptime(&self) -> Duration {
        (**self).uptime()
    }
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn unix_time(&self) -> u64 {
        (**self).unix_time()
    }
    fn uptime(&self) -> Duration {
        (**self).uptime()
    }
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration)
    }
}

#[derive(Clone, Debug)]
pub struct SystemClock {
    start_time: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn unix_time(&self) -> u64 {
        // a clock before 1970 is a broken clock; treat it as the epoch
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since_epoch| since_epoch.as_secs())
            .unwrap_or(0)
    }

    fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

#[derive(Debug, Default)]
struct ManualState {
    unix_time: Duration,
    uptime: Duration,
    sleeps: Vec<Duration>,
}

#[derive(Clone, Debug, Default)]
/// A virtual clock. Sleeping returns immediately, advances both time bases and
/// is recorded, so timing behavior can be asserted on.
///
/// Clones share the same state.
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn at(unix_time: u64) -> Self {
        let clock = Self::default();
        clock.state().unix_time = Duration::from_secs(unix_time);
        clock
    }

    pub fn advance(&self, duration: Duration) {
        let mut state = self.state();
        state.unix_time += duration;
        state.uptime += duration;
    }

    pub fn set_unix_time(&self, unix_time: u64) {
        self.state().unix_time = Duration::from_secs(unix_time);
    }

    /// All sleeps requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state().sleeps.clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.state().sleeps.iter().sum()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn unix_time(&self) -> u64 {
        self.state().unix_time.as_secs()
    }

    fn uptime(&self) -> Duration {
        self.state().uptime
    }

    fn sleep(&self, duration: Duration) {
        let mut state = self.state();
        state.sleeps.push(duration);
        state.unix_time += duration;
        state.uptime += duration;
    }
}
