mod cloud;
mod config;
mod relay;
mod scheduler;
mod sensor;
mod watchdog;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, path::Path, time::Duration};
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay::Relay;
use scheduler::Scheduler;
use sensor::{I2cBus, SensorReader};
use watchdog::Watchdog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env + file config ───────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        info!(path = %config_path, "no config file — using built-in defaults");
        config::Config::default()
    };

    // ── Hardware ────────────────────────────────────────────────────
    // Fail-safe: the relay constructor drives the pin OFF before anything
    // else runs.
    let mut relay = Relay::new(cfg.relay.gpio_pin, cfg.relay.active_low)?;
    let mut sensors = SensorReader::new(I2cBus::open(cfg.sensor.i2c_address)?);
    let mut wdt = Watchdog::new(Duration::from_secs_f32(cfg.watchdog.timeout_sec))?;
    let mut sched = Scheduler::new();

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("irrigationd", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 20);
    client.subscribe("cmnd/+", QoS::AtLeastOnce).await?;
    info!("subscribed to cmnd/+");

    // ── Periodic duties ─────────────────────────────────────────────
    let mut relay_tick = interval(Duration::from_secs_f32(cfg.relay.report_sec));
    let mut temp_tick = interval(Duration::from_secs_f32(cfg.sensor.temperature_poll_sec));
    let mut hum_tick = interval(Duration::from_secs_f32(cfg.sensor.humidity_poll_sec));
    let mut poll_tick = interval(Duration::from_secs_f32(cfg.schedule.poll_sec));
    let mut feed_tick = interval(Duration::from_secs_f32(cfg.watchdog.feed_sec));
    // No dose at process start: the first hourly tick lands one full
    // interval after boot.
    let dose_every = Duration::from_secs_f32(cfg.schedule.dose_interval_sec);
    let mut dose_tick = interval_at(Instant::now() + dose_every, dose_every);
    for t in [
        &mut relay_tick,
        &mut temp_tick,
        &mut hum_tick,
        &mut poll_tick,
        &mut feed_tick,
        &mut dose_tick,
    ] {
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    info!(
        dose_interval_sec = cfg.schedule.dose_interval_sec,
        watchdog_timeout_sec = cfg.watchdog.timeout_sec,
        "controller started"
    );

    // One cooperative loop drives every duty, so the plan is only ever
    // touched from this task and needs no lock.
    loop {
        tokio::select! {
            ev = eventloop.poll() => match ev {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    handle_command(&p.topic, &p.payload, &mut sched);
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(e) => {
                    // A running dose is never aborted by a transport failure;
                    // the scheduler keeps working from local state.
                    warn!("mqtt error: {e}. reconnecting...");
                    sleep(Duration::from_secs(2)).await;
                }
            },
            _ = feed_tick.tick() => wdt.feed(),
            _ = poll_tick.tick() => sched.poll(&mut relay, &client).await,
            _ = dose_tick.tick() => sched.hourly_tick(&mut relay, &client).await,
            _ = relay_tick.tick() => {
                cloud::report(&client, "relay", cloud::format_bool(relay.get()).to_string()).await;
            }
            _ = temp_tick.tick() => {
                let t = sensors.temperature().await;
                info!(temperature_c = t, "temperature polled");
                cloud::report(&client, "temperature", format!("{t:.1}")).await;
            }
            _ = hum_tick.tick() => {
                let h = sensors.humidity().await;
                info!(humidity_pct = h, "humidity polled");
                cloud::report(&client, "humidity", format!("{h:.1}")).await;
            }
        }
    }
}

/// Dispatch a control-plane write to the matching scheduler hook.
fn handle_command(topic: &str, payload: &[u8], sched: &mut Scheduler) {
    let Some(key) = cloud::extract_command_key(topic) else {
        warn!(topic, "unhandled topic");
        return;
    };
    match key {
        "irrigation_day" => match cloud::parse_number(payload) {
            Ok(minutes) => sched.on_target_changed(minutes),
            Err(e) => warn!(key, "bad write payload: {e}"),
        },
        "intervals_done" => match cloud::parse_number(payload) {
            Ok(count) => sched.on_doses_completed_changed(count),
            Err(e) => warn!(key, "bad write payload: {e}"),
        },
        other => warn!(key = other, "unknown control key"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_sets_daily_target() {
        let mut sched = Scheduler::new();
        handle_command("cmnd/irrigation_day", b"28", &mut sched);
        assert_eq!(sched.plan().daily_target_minutes, 28.0);
        assert!(sched.irrigate());
    }

    #[test]
    fn command_rehydrates_dose_counter() {
        let mut sched = Scheduler::new();
        handle_command("cmnd/intervals_done", b"10", &mut sched);
        assert_eq!(sched.plan().doses_completed, 10);
    }

    #[test]
    fn bad_payload_leaves_state_unchanged() {
        let mut sched = Scheduler::new();
        handle_command("cmnd/irrigation_day", b"tomorrow", &mut sched);
        assert_eq!(sched.plan().daily_target_minutes, 0.0);
        assert!(!sched.irrigate());
    }

    #[test]
    fn echoed_write_back_is_idempotent() {
        // The scheduler's retained write-backs come back through our own
        // cmnd/+ subscription; replaying them must not move the state.
        let mut sched = Scheduler::new();
        handle_command("cmnd/irrigation_day", b"28", &mut sched);
        handle_command("cmnd/intervals_done", b"5", &mut sched);

        handle_command(&cloud::command_topic("intervals_done"), b"5", &mut sched);
        handle_command(&cloud::command_topic("irrigation_day"), b"28", &mut sched);

        assert_eq!(sched.plan().daily_target_minutes, 28.0);
        assert_eq!(sched.plan().doses_completed, 5);
        assert!(sched.irrigate());
    }

    #[test]
    fn unknown_key_ignored() {
        let mut sched = Scheduler::new();
        handle_command("cmnd/frobnicate", b"1", &mut sched);
        assert_eq!(sched.plan().daily_target_minutes, 0.0);
    }

    #[test]
    fn foreign_topic_ignored() {
        let mut sched = Scheduler::new();
        handle_command("stat/irrigation_day", b"28", &mut sched);
        assert_eq!(sched.plan().daily_target_minutes, 0.0);
    }
}
