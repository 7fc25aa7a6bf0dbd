//! Relay actuation via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation logs state changes to stderr.
//!
//! Purely set/get — the scheduler owns all timing.

use anyhow::Result;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct Relay {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
    on: bool,
}

#[cfg(feature = "gpio")]
impl Relay {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let mut pin = Gpio::new()?.get(pin_num)?.into_output();

        // Fail-safe: ensure "OFF" at startup
        if active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }

        Ok(Self {
            pin,
            active_low,
            on: false,
        })
    }

    pub fn set(&mut self, on: bool) {
        let level_high = on != self.active_low;
        if level_high {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        self.on = on;
        eprintln!("relay set {}", if on { "ON" } else { "OFF" });
    }

    pub fn get(&self) -> bool {
        self.on
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development — no hardware, logs state to stderr)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct Relay {
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl Relay {
    pub fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        eprintln!("[mock-gpio] relay registered (gpio {pin_num} — not wired)");
        Ok(Self { on: false })
    }

    pub fn set(&mut self, on: bool) {
        self.on = on;
        eprintln!("[mock-gpio] relay set {}", if on { "ON" } else { "OFF" });
    }

    pub fn get(&self) -> bool {
        self.on
    }
}

// ===========================================================================
// Tests
// ===========================================================================
