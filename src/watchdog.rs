//! Hardware watchdog feed.
//!
//! The watchdog resets the board when it is not fed within its timeout, so
//! the 1 s feed task must never be starved — this is why dosing in the
//! scheduler is non-blocking. Under the `gpio` feature each feed writes to
//! `/dev/watchdog`; without it the feed is software-only but the late-feed
//! detection still runs, so a starved loop shows up in the logs on a bench
//! build too.

use anyhow::Result;
use std::time::{Duration, Instant};
use tracing::warn;

#[cfg(feature = "gpio")]
use std::io::Write;

pub struct Watchdog {
    timeout: Duration,
    last_feed: Option<Instant>,
    #[cfg(feature = "gpio")]
    device: std::fs::File,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Result<Self> {
        #[cfg(feature = "gpio")]
        let device = std::fs::OpenOptions::new()
            .write(true)
            .open("/dev/watchdog")
            .map_err(|e| anyhow::anyhow!("failed to open /dev/watchdog: {e}"))?;

        Ok(Self {
            timeout,
            last_feed: None,
            #[cfg(feature = "gpio")]
            device,
        })
    }

    /// True when the gap since the previous feed exceeds the hardware
    /// timeout — at that point a reset has likely already fired.
    pub fn late(&self) -> bool {
        matches!(self.last_feed, Some(last) if last.elapsed() > self.timeout)
    }

    pub fn feed(&mut self) {
        if self.late() {
            warn!(
                timeout_sec = self.timeout.as_secs_f32(),
                "watchdog fed late — hardware reset may have fired"
            );
        }

        #[cfg(feature = "gpio")]
        if let Err(e) = self.device.write_all(b".") {
            warn!("watchdog feed write failed: {e}");
        }

        self.last_feed = Some(Instant::now());
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_fed_is_not_late() {
        let wdt = Watchdog::new(Duration::from_millis(500)).unwrap();
        assert!(!wdt.late());
    }

    #[test]
    fn fresh_feed_is_not_late() {
        let mut wdt = Watchdog::new(Duration::from_secs(5)).unwrap();
        wdt.feed();
        assert!(!wdt.late());
    }

    #[test]
    fn stale_feed_is_late() {
        let mut wdt = Watchdog::new(Duration::from_secs(5)).unwrap();
        wdt.last_feed = Some(Instant::now() - Duration::from_secs(10));
        assert!(wdt.late());
    }

    #[test]
    fn feeding_clears_lateness() {
        let mut wdt = Watchdog::new(Duration::from_secs(5)).unwrap();
        wdt.last_feed = Some(Instant::now() - Duration::from_secs(10));
        wdt.feed();
        assert!(!wdt.late());
    }
}
