//! Key/value control-plane adapter over MQTT.
//!
//! Each key the controller exposes is published retained to `stat/<key>`;
//! writes from the control plane arrive on `cmnd/<key>`. Retained `cmnd`
//! messages double as restart rehydration: the broker replays the last
//! target and dose counter as soon as the controller resubscribes.

use rumqttc::{AsyncClient, QoS};
use tracing::warn;

/// Topic a value for `key` is published on.
pub fn stat_topic(key: &str) -> String {
    format!("stat/{key}")
}

/// Topic writes for `key` arrive on; also the rehydration topic the
/// scheduler writes its own progress back to.
pub fn command_topic(key: &str) -> String {
    format!("cmnd/{key}")
}

/// Extract the key from "cmnd/<key>".
pub fn extract_command_key(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 2 && parts[0] == "cmnd" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse a numeric write payload (trimmed decimal text, finite).
pub fn parse_number(payload: &[u8]) -> Result<f32, String> {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();
    match s.parse::<f32>() {
        Ok(v) if v.is_finite() => Ok(v),
        Ok(v) => Err(format!("non-finite value '{v}'")),
        Err(_) => Err(format!("unparseable number '{s}'")),
    }
}

/// Relay states go over the wire as ON/OFF.
pub fn format_bool(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Publish a value to the control plane. Failures are logged and swallowed:
/// a control-plane outage degrades to last-known local state, it never
/// interrupts the scheduler.
pub async fn report(client: &AsyncClient, key: &str, payload: String) {
    if let Err(e) = client
        .publish(stat_topic(key), QoS::AtLeastOnce, true, payload.into_bytes())
        .await
    {
        warn!(key, "control plane publish failed: {e}");
    }
}

/// Write a value back to a key's own rehydration topic, retained, so the
/// broker replays current progress to the controller after a restart.
/// The broker echoes these to our own `cmnd/+` subscription; the write
/// hooks overwrite local state with the value it already holds.
pub async fn write_back(client: &AsyncClient, key: &str, payload: String) {
    if let Err(e) = client
        .publish(
            command_topic(key),
            QoS::AtLeastOnce,
            true,
            payload.into_bytes(),
        )
        .await
    {
        warn!(key, "control plane write-back failed: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
