//! Daily-budget irrigation scheduler.
//!
//! The control plane writes a daily target in minutes (`irrigation_day`);
//! the scheduler splits it into [`DOSES_PER_CYCLE`] hourly doses, drives the
//! relay for each dose, and reports progress back. After the 14th dose the
//! plan resets to zero in one step and the cycle re-arms on the next
//! target write.
//!
//! Dosing is non-blocking: the hourly tick opens the relay and records the
//! start instant, and the frequent poll tick closes it once the dose
//! duration has elapsed. A dose can run for tens of minutes, so it must not
//! hold up the watchdog feed or the sensor polls.
//!
//! ```text
//! Idle ──[hourly tick, target > 0]──▶ Dosing ──[interval×60 s elapsed]──▶ Idle
//!  ▲                                                                        │
//!  └──────────────[14th dose: plan reset to zero]◀─────────────────────────┘
//! ```

use std::time::Duration;

use rumqttc::AsyncClient;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cloud;
use crate::relay::Relay;

/// Doses a daily budget is split into (one per hour).
pub const DOSES_PER_CYCLE: u32 = 14;

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Progress through one daily watering cycle. Snapshots are published as
/// JSON to `stat/plan` after every completed dose.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IrrigationPlan {
    pub daily_target_minutes: f32,
    pub doses_completed: u32,
    pub minutes_irrigated_total: f32,
}

impl IrrigationPlan {
    /// Always derived from the target, never stored.
    pub fn interval_minutes_per_dose(&self) -> f32 {
        self.daily_target_minutes / DOSES_PER_CYCLE as f32
    }

    pub fn remaining_minutes(&self) -> f32 {
        self.daily_target_minutes - self.minutes_irrigated_total
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

enum DoseState {
    Idle,
    /// Relay ON; waiting for the dose duration to elapse before sending OFF.
    /// The dose length is captured at start: a target write landing mid-dose
    /// must not retime or abort the dose already in flight.
    Dosing { since: Instant, minutes: f32 },
}

pub struct Scheduler {
    plan: IrrigationPlan,
    irrigate: bool,
    dose: DoseState,
}

impl Scheduler {
    /// Cold start: zeroed plan. The control plane rehydrates the target and
    /// dose counter through the write hooks (retained `cmnd` messages).
    pub fn new() -> Self {
        Self {
            plan: IrrigationPlan::default(),
            irrigate: false,
            dose: DoseState::Idle,
        }
    }

    pub fn plan(&self) -> &IrrigationPlan {
        &self.plan
    }

    pub fn irrigate(&self) -> bool {
        self.irrigate
    }

    /// Write hook for `irrigation_day`: set the daily target in minutes.
    pub fn on_target_changed(&mut self, minutes: f32) {
        let minutes = minutes.max(0.0);
        self.plan.daily_target_minutes = minutes;
        self.irrigate = minutes > 0.0;
        info!(
            target_min = minutes,
            interval_min = self.plan.interval_minutes_per_dose(),
            "daily irrigation target updated"
        );
    }

    /// Write hook for `intervals_done`: overwrite the local dose counter,
    /// used to pick a cycle back up after a restart. The wire value is a
    /// float; fractional counts round to the nearest whole dose.
    pub fn on_doses_completed_changed(&mut self, value: f32) {
        self.plan.doses_completed = value.max(0.0).round() as u32;
        info!(doses = self.plan.doses_completed, "dose counter rehydrated");
    }

    /// Hourly dosing tick: open the relay and start a dose if one is due.
    /// The relay transition is reported before the dose timer starts.
    pub async fn hourly_tick(&mut self, relay: &mut Relay, client: &AsyncClient) {
        if self.plan.daily_target_minutes <= 0.0 {
            info!("no irrigation this hour");
            return;
        }
        if matches!(self.dose, DoseState::Dosing { .. }) {
            // Only possible when the dose interval exceeds an hour
            // (target > 14 h). Never overlap two doses.
            warn!("dose still running at the next hourly tick — skipping");
            return;
        }

        let minutes = self.plan.interval_minutes_per_dose();
        relay.set(true);
        cloud::report(client, "relay", cloud::format_bool(true).to_string()).await;
        self.dose = DoseState::Dosing {
            since: Instant::now(),
            minutes,
        };
        info!(dose_min = minutes, "dose started");
    }

    /// Frequent poll: close out the running dose once its duration elapses.
    /// No-op while idle or while the dose is still running; a started dose
    /// always runs to its full duration.
    pub async fn poll(&mut self, relay: &mut Relay, client: &AsyncClient) {
        let (since, minutes) = match self.dose {
            DoseState::Dosing { since, minutes } => (since, minutes),
            DoseState::Idle => return,
        };
        if since.elapsed() < dose_duration(minutes) {
            return;
        }
        self.finish_dose(relay, client, minutes).await;
    }

    async fn finish_dose(&mut self, relay: &mut Relay, client: &AsyncClient, minutes: f32) {
        relay.set(false);
        cloud::report(client, "relay", cloud::format_bool(false).to_string()).await;
        self.dose = DoseState::Idle;

        self.plan.minutes_irrigated_total += minutes;
        self.plan.doses_completed += 1;
        // Progress goes to the stat topic for observers and, retained, to
        // the rehydration topic so a restart resumes from the right count.
        cloud::report(
            client,
            "intervals_done",
            self.plan.doses_completed.to_string(),
        )
        .await;
        cloud::write_back(
            client,
            "intervals_done",
            self.plan.doses_completed.to_string(),
        )
        .await;

        if self.plan.doses_completed >= DOSES_PER_CYCLE {
            // Target, counter and total reset together in the same step.
            // The write-backs overwrite the retained rehydration values, so
            // a restart after a completed cycle stays at zero instead of
            // replaying the old target.
            self.plan = IrrigationPlan::default();
            cloud::report(client, "irrigation_day", "0".to_string()).await;
            cloud::report(client, "intervals_done", "0".to_string()).await;
            cloud::write_back(client, "irrigation_day", "0".to_string()).await;
            cloud::write_back(client, "intervals_done", "0".to_string()).await;
            info!("daily irrigation cycle completed");
        }

        if let Ok(snapshot) = serde_json::to_string(&self.plan) {
            cloud::report(client, "plan", snapshot).await;
        }
        info!(
            doses = self.plan.doses_completed,
            remaining_min = self.plan.remaining_minutes(),
            "dose finished"
        );
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn dose_duration(interval_minutes: f32) -> Duration {
    Duration::from_secs_f64(interval_minutes as f64 * 60.0)
}

// ===========================================================================
// Tests
// ===========================================================================
