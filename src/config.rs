//! TOML config file loading and validation.
//!
//! Every field has a default matching the deployed controller (AM2315 at
//! 0x5C, relay on GPIO 14, hourly doses, 7.5 s watchdog), so a missing
//! config file is not an error.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sensor: SensorSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub schedule: ScheduleSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    /// 7-bit I2C address of the AM2315.
    pub i2c_address: u16,
    pub temperature_poll_sec: f32,
    pub humidity_poll_sec: f32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub gpio_pin: u8,
    pub active_low: bool,
    /// Cadence at which the relay state is reported to the control plane.
    pub report_sec: f32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScheduleSection {
    /// Spacing between dose starts. One hour in production.
    pub dose_interval_sec: f32,
    /// Cadence at which a running dose is checked for completion.
    pub poll_sec: f32,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogSection {
    pub timeout_sec: f32,
    pub feed_sec: f32,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self {
            i2c_address: crate::sensor::AM2315_ADDR,
            temperature_poll_sec: 60.0,
            humidity_poll_sec: 55.0,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            gpio_pin: 14,
            active_low: false,
            report_sec: 0.1,
        }
    }
}

impl Default for ScheduleSection {
    fn default() -> Self {
        Self {
            dose_interval_sec: 3600.0,
            poll_sec: 1.0,
        }
    }
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            timeout_sec: 7.5,
            feed_sec: 1.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sensor: SensorSection::default(),
            relay: RelaySection::default(),
            schedule: ScheduleSection::default(),
            watchdog: WatchdogSection::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Valid 7-bit I2C address range (0x00-0x07 and 0x78-0x7f are reserved).
const I2C_ADDR_MIN: u16 = 0x08;
const I2C_ADDR_MAX: u16 = 0x77;

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        // ── Sensor ───────────────────────────────────────────
        if !(I2C_ADDR_MIN..=I2C_ADDR_MAX).contains(&self.sensor.i2c_address) {
            errors.push(format!(
                "sensor: i2c_address 0x{:02x} outside 7-bit range [0x{I2C_ADDR_MIN:02x}, 0x{I2C_ADDR_MAX:02x}]",
                self.sensor.i2c_address
            ));
        }
        check_cadence(&mut errors, "sensor.temperature_poll_sec", self.sensor.temperature_poll_sec);
        check_cadence(&mut errors, "sensor.humidity_poll_sec", self.sensor.humidity_poll_sec);

        // ── Relay ────────────────────────────────────────────
        if !VALID_GPIO_PINS.contains(&self.relay.gpio_pin) {
            errors.push(format!(
                "relay: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                self.relay.gpio_pin
            ));
        }
        check_cadence(&mut errors, "relay.report_sec", self.relay.report_sec);

        // ── Schedule ─────────────────────────────────────────
        check_cadence(&mut errors, "schedule.dose_interval_sec", self.schedule.dose_interval_sec);
        check_cadence(&mut errors, "schedule.poll_sec", self.schedule.poll_sec);
        if self.schedule.poll_sec > 0.0
            && self.schedule.dose_interval_sec > 0.0
            && self.schedule.poll_sec >= self.schedule.dose_interval_sec
        {
            errors.push(format!(
                "schedule: poll_sec ({}) must be below dose_interval_sec ({})",
                self.schedule.poll_sec, self.schedule.dose_interval_sec
            ));
        }

        // ── Watchdog ─────────────────────────────────────────
        check_cadence(&mut errors, "watchdog.timeout_sec", self.watchdog.timeout_sec);
        check_cadence(&mut errors, "watchdog.feed_sec", self.watchdog.feed_sec);
        if self.watchdog.feed_sec > 0.0
            && self.watchdog.timeout_sec > 0.0
            && self.watchdog.feed_sec >= self.watchdog.timeout_sec
        {
            errors.push(format!(
                "watchdog: feed_sec ({}) must be below timeout_sec ({})",
                self.watchdog.feed_sec, self.watchdog.timeout_sec
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }
}

fn check_cadence(errors: &mut Vec<String>, name: &str, value: f32) {
    if !value.is_finite() || value <= 0.0 {
        errors.push(format!("{name} must be a positive number, got {value}"));
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
