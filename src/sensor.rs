//! AM2315 temperature/humidity acquisition over I2C.
//!
//! The sensor sleeps between transactions to limit self-heating, so every
//! poll is wake → read command → settle → 8-byte reply. The bus is noisy
//! (long cable runs, 10 kHz clock), so a poll retries up to three times
//! with a linear backoff before giving up.
//!
//! Internally failures are `Result`s; the `temperature()` / `humidity()`
//! getters used by the reporting path convert them to out-of-range
//! sentinels so the control plane sees a uniform numeric value.

use anyhow::{bail, Result};
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// 7-bit I2C address of the AM2315.
pub const AM2315_ADDR: u16 = 0x5c;

/// Modbus-style "read registers" function code.
const CMD_READ: u8 = 0x03;
/// Register offset and byte count requested on every poll.
const READ_START: u8 = 0x00;
const READ_COUNT: u8 = 0x04;
/// Reply layout: function code, byte count, 4 data bytes, 2 CRC bytes.
const REPLY_LEN: usize = 8;

/// Hold time after the wake pulse before the sensor accepts commands.
const WAKE_DELAY: Duration = Duration::from_millis(100);
/// Settle time between the read command and fetching the reply.
const READ_DELAY: Duration = Duration::from_millis(200);

/// Total attempts before a poll is abandoned.
const MAX_ATTEMPTS: u32 = 3;

/// Reported in place of a temperature when all attempts fail.
pub const TEMPERATURE_SENTINEL: f32 = 1000.0;
/// Reported in place of a humidity when all attempts fail.
pub const HUMIDITY_SENTINEL: f32 = -1000.0;

// ---------------------------------------------------------------------------
// Bus seam
// ---------------------------------------------------------------------------

/// Byte-level transactions against the sensor address. The real
/// implementation is `rppal` I2C; tests script replies.
pub trait SensorBus {
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    /// Fill `buf` and return the number of bytes actually received.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// Real I2C bus (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct I2cBus {
    i2c: rppal::i2c::I2c,
}

#[cfg(feature = "gpio")]
impl I2cBus {
    /// Open I2C bus 1 addressed at the sensor.
    pub fn open(addr: u16) -> Result<Self> {
        let mut i2c = rppal::i2c::I2c::new()?;
        i2c.set_slave_address(addr)?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "i2c bus opened");
        Ok(Self { i2c })
    }
}

#[cfg(feature = "gpio")]
impl SensorBus for I2cBus {
    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.i2c.write(bytes)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.i2c.read(buf)?)
    }
}

// ---------------------------------------------------------------------------
// Mock bus (development — no hardware, replies with a fixed frame)
// ---------------------------------------------------------------------------

#[cfg(not(feature = "gpio"))]
pub struct I2cBus {
    frame: [u8; REPLY_LEN],
}

#[cfg(not(feature = "gpio"))]
impl I2cBus {
    pub fn open(addr: u16) -> Result<Self> {
        eprintln!("[mock-i2c] sensor at 0x{addr:02x} (not wired — fixed 21.5C / 48.2%)");
        // 48.2 % RH = 482, 21.5 C = 215, CRC not checked.
        Ok(Self {
            frame: [CMD_READ, READ_COUNT, 0x01, 0xe2, 0x00, 0xd7, 0x00, 0x00],
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl SensorBus for I2cBus {
    fn write(&mut self, _bytes: &[u8]) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.frame.len().min(buf.len());
        buf[..n].copy_from_slice(&self.frame[..n]);
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// One decoded sensor poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReading {
    pub temperature: f32,
    pub humidity: f32,
}

pub struct SensorReader<B: SensorBus> {
    bus: B,
}

impl<B: SensorBus> SensorReader<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Poll the sensor, retrying transient bus errors and malformed replies
    /// up to [`MAX_ATTEMPTS`] times with linear backoff.
    pub async fn read(&mut self) -> Result<SensorReading> {
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt().await {
                Ok(reading) => return Ok(reading),
                Err(e) => warn!(attempt, "sensor read failed: {e}"),
            }
            sleep(backoff(attempt)).await;
        }
        bail!("sensor unreachable after {MAX_ATTEMPTS} attempts")
    }

    /// Temperature for the reporting path; failure maps to the sentinel.
    pub async fn temperature(&mut self) -> f32 {
        match self.read().await {
            Ok(r) => r.temperature,
            Err(_) => TEMPERATURE_SENTINEL,
        }
    }

    /// Humidity for the reporting path; failure maps to the sentinel.
    pub async fn humidity(&mut self) -> f32 {
        match self.read().await {
            Ok(r) => r.humidity,
            Err(_) => HUMIDITY_SENTINEL,
        }
    }

    async fn attempt(&mut self) -> Result<SensorReading> {
        self.wake().await;
        self.bus.write(&[CMD_READ, READ_START, READ_COUNT])?;
        sleep(READ_DELAY).await;
        let mut buf = [0u8; REPLY_LEN];
        let n = self.bus.read(&mut buf)?;
        decode_reply(&buf[..n])
    }

    /// The sensor NAKs the wake write when it is already awake; that is
    /// expected, not an error.
    async fn wake(&mut self) {
        let _ = self.bus.write(&[0x00]);
        sleep(WAKE_DELAY).await;
    }
}

/// Linear backoff: 0.5 s after attempt 1, 1.0 s after 2, 1.5 s after 3.
fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * attempt as u64)
}

fn decode_reply(data: &[u8]) -> Result<SensorReading> {
    if data.len() != REPLY_LEN {
        bail!("short reply: {} bytes", data.len());
    }
    if data[0] != CMD_READ || data[1] != READ_COUNT {
        bail!("bad reply header: {:#04x} {:#04x}", data[0], data[1]);
    }
    let humidity = u16::from_be_bytes([data[2], data[3]]) as f32 / 10.0;
    let temperature = u16::from_be_bytes([data[4], data[5]]) as f32 / 10.0;
    Ok(SensorReading {
        temperature,
        humidity,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::time::Instant;

    /// Scripted bus: pops one canned reply per read; `Err` entries model a
    /// bus-level I/O failure.
    struct ScriptedBus {
        replies: VecDeque<Result<Vec<u8>, ()>>,
        writes: usize,
    }

    impl ScriptedBus {
        fn new(replies: Vec<Result<Vec<u8>, ()>>) -> Self {
            Self {
                replies: replies.into(),
                writes: 0,
            }
        }
    }

    impl SensorBus for ScriptedBus {
        fn write(&mut self, _bytes: &[u8]) -> Result<()> {
            self.writes += 1;
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.replies.pop_front() {
                Some(Ok(reply)) => {
                    buf[..reply.len()].copy_from_slice(&reply);
                    Ok(reply.len())
                }
                Some(Err(())) => bail!("i2c transaction failed"),
                None => bail!("no reply scripted"),
            }
        }
    }

    fn valid_frame() -> Vec<u8> {
        // 48.2 % RH, 21.5 C
        vec![0x03, 0x04, 0x01, 0xe2, 0x00, 0xd7, 0x00, 0x00]
    }

    // -- Decoding -----------------------------------------------------------

    #[test]
    fn decode_valid_frame() {
        let r = decode_reply(&valid_frame()).unwrap();
        assert_eq!(r.humidity, 48.2);
        assert_eq!(r.temperature, 21.5);
    }

    #[test]
    fn decode_short_reply_rejected() {
        assert!(decode_reply(&valid_frame()[..7]).is_err());
    }

    #[test]
    fn decode_empty_reply_rejected() {
        assert!(decode_reply(&[]).is_err());
    }

    #[test]
    fn decode_wrong_function_code_rejected() {
        let mut frame = valid_frame();
        frame[0] = 0x04;
        assert!(decode_reply(&frame).is_err());
    }

    #[test]
    fn decode_wrong_byte_count_rejected() {
        let mut frame = valid_frame();
        frame[1] = 0x02;
        assert!(decode_reply(&frame).is_err());
    }

    #[test]
    fn decode_one_decimal_precision() {
        // 100.0 % RH = 1000, -? temps are not encoded by this sensor frame;
        // check the 0.1 scaling at the top of the range.
        let frame = vec![0x03, 0x04, 0x03, 0xe8, 0x01, 0x90, 0x00, 0x00];
        let r = decode_reply(&frame).unwrap();
        assert_eq!(r.humidity, 100.0);
        assert_eq!(r.temperature, 40.0);
    }

    // -- Backoff ------------------------------------------------------------

    #[test]
    fn backoff_is_linear_half_second_steps() {
        assert_eq!(backoff(1), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_millis(1000));
        assert_eq!(backoff(3), Duration::from_millis(1500));
    }

    // -- Read path ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn read_succeeds_first_attempt() {
        let mut reader = SensorReader::new(ScriptedBus::new(vec![Ok(valid_frame())]));
        let r = reader.read().await.unwrap();
        assert_eq!(r.temperature, 21.5);
        assert_eq!(r.humidity, 48.2);
        // wake + read command per attempt
        assert_eq!(reader.bus.writes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn read_retries_bus_error_then_succeeds() {
        let mut reader =
            SensorReader::new(ScriptedBus::new(vec![Err(()), Ok(valid_frame())]));
        let r = reader.read().await.unwrap();
        assert_eq!(r.humidity, 48.2);
        assert_eq!(reader.bus.writes, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn read_retries_malformed_reply_then_succeeds() {
        let short = valid_frame()[..7].to_vec();
        let mut reader = SensorReader::new(ScriptedBus::new(vec![Ok(short), Ok(valid_frame())]));
        assert!(reader.read().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn read_gives_up_after_three_attempts() {
        let mut reader = SensorReader::new(ScriptedBus::new(vec![Err(()), Err(()), Err(())]));
        assert!(reader.read().await.is_err());
        // No fourth attempt.
        assert_eq!(reader.bus.writes, 6);
        assert!(reader.bus.replies.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_read_takes_exactly_the_scripted_delays() {
        // 3 × (100 ms wake + 200 ms settle) + 0.5 s + 1.0 s + 1.5 s = 3.9 s
        let mut reader = SensorReader::new(ScriptedBus::new(vec![Err(()), Err(()), Err(())]));
        let start = Instant::now();
        let _ = reader.read().await;
        assert_eq!(start.elapsed(), Duration::from_millis(3900));
    }

    // -- Sentinels ----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn temperature_sentinel_after_three_short_replies() {
        let short = valid_frame()[..7].to_vec();
        let mut reader = SensorReader::new(ScriptedBus::new(vec![
            Ok(short.clone()),
            Ok(short.clone()),
            Ok(short),
        ]));
        assert_eq!(reader.temperature().await, 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn humidity_sentinel_after_three_bus_errors() {
        let mut reader = SensorReader::new(ScriptedBus::new(vec![Err(()), Err(()), Err(())]));
        assert_eq!(reader.humidity().await, -1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn getters_return_real_values_on_success() {
        let mut reader = SensorReader::new(ScriptedBus::new(vec![Ok(valid_frame())]));
        assert_eq!(reader.temperature().await, 21.5);
        let mut reader = SensorReader::new(ScriptedBus::new(vec![Ok(valid_frame())]));
        assert_eq!(reader.humidity().await, 48.2);
    }

    // -- Mock bus ------------------------------------------------------------

    #[cfg(not(feature = "gpio"))]
    #[tokio::test(start_paused = true)]
    async fn mock_bus_produces_a_valid_reading() {
        let mut reader = SensorReader::new(I2cBus::open(AM2315_ADDR).unwrap());
        let r = reader.read().await.unwrap();
        assert_eq!(r.temperature, 21.5);
        assert_eq!(r.humidity, 48.2);
    }
}
