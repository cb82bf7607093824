//! AMS ENS210 temperature/humidity sensor behind a serial USB-to-I2C dongle.
//!
//! The dongle speaks a line-oriented console (`i2c opt ...`, `i2c raw ...`)
//! and answers with free-form text, so every command is followed by a timed
//! [`read_burst`]. One conversion is:
//!
//! 1. `i2c raw 22 03`: start a single-shot T+H conversion (register 0x22).
//! 2. wait 120 ms.
//! 3. `i2c raw 30 r6`: read T_VAL and H_VAL (registers 0x30..0x35).
//!
//! Each value is a 24-bit little-endian word: 16 data bits, a valid bit and a
//! 7-bit CRC over the lower 17 bits.
//!
//! ```text
//!  23      17 16 15             0
//! +----------+--+----------------+
//! |  CRC-7   |V |      data      |
//! +----------+--+----------------+
//! ```

use super::capabilities::{HumiditySensor, SensorReading};
use super::serial::{drain_serial_buffer, read_burst, BurstTiming, DynSerial};
use crate::transport::{ProtocolLog, ProtocolOp};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Default 7-bit I2C address of the ENS210.
pub const DEFAULT_ADDR: u8 = 0x43;

/// Time the sensor needs for one single-shot T+H conversion.
pub const CONVERSION_TIME: Duration = Duration::from_millis(120);

const CRC7_POLY: u32 = 0x89;
const CRC7_WIDTH: u32 = 7;
const CRC7_IVEC: u32 = 0x7F;
const DATA7_WIDTH: u32 = 17;

const KELVIN_OFFSET: f64 = 273.15;

#[allow(clippy::expect_used)]
static HEX_BYTE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([0-9a-fA-F]{2})\b").expect("Invalid hex byte regex"));

/// CRC-7 (polynomial 0x89, initial vector 0x7F) over a 17-bit payload.
pub fn crc7(payload: u32) -> u8 {
    let mut pol = CRC7_POLY << (DATA7_WIDTH - CRC7_WIDTH - 1);
    let mut bit = 1u32 << (DATA7_WIDTH - 1);
    let mut val = ((payload & 0x1_FFFF) << CRC7_WIDTH) | CRC7_IVEC;
    pol <<= CRC7_WIDTH;
    while bit >= 1 {
        if val & (bit << CRC7_WIDTH) != 0 {
            val ^= pol;
        }
        bit >>= 1;
        pol >>= 1;
    }
    (val & ((1 << CRC7_WIDTH) - 1)) as u8
}

/// One decoded T_VAL or H_VAL word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorWord {
    /// 16-bit measurement.
    pub data: u16,
    /// Sensor's valid flag.
    pub valid: bool,
    /// CRC matched.
    pub crc_ok: bool,
}

impl SensorWord {
    /// Split a 24-bit word into its fields and check the CRC.
    pub fn decode(val24: u32) -> Self {
        let crc = ((val24 >> 17) & 0x7F) as u8;
        Self {
            data: (val24 & 0xFFFF) as u16,
            valid: (val24 >> 16) & 0x1 == 1,
            crc_ok: crc7(val24 & 0x1_FFFF) == crc,
        }
    }

    /// Decode little-endian bytes, falling back to MSB-first order when the
    /// CRC does not match. Some dongle firmwares print the bytes reversed.
    pub fn decode_bytes(bytes: [u8; 3]) -> Self {
        let word = Self::decode(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]));
        if word.crc_ok {
            return word;
        }
        let swapped = Self::decode(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]));
        if swapped.crc_ok {
            swapped
        } else {
            word
        }
    }
}

/// Convert the six T_VAL/H_VAL bytes into a reading.
pub fn decode_reading(bytes: [u8; 6], ignore_crc: bool) -> SensorReading {
    let t = SensorWord::decode_bytes([bytes[0], bytes[1], bytes[2]]);
    let h = SensorWord::decode_bytes([bytes[3], bytes[4], bytes[5]]);

    let temp_k = f64::from(t.data) / 64.0;
    let rh_pct = f64::from(h.data) / 512.0;
    let crc_ok = t.crc_ok && h.crc_ok;

    SensorReading {
        temp_c: Some(temp_k - KELVIN_OFFSET),
        temp_k: Some(temp_k),
        rh_pct: Some(rh_pct),
        ok: t.valid && h.valid && (crc_ok || ignore_crc),
        t_valid: t.valid,
        h_valid: h.valid,
        t_crc_ok: t.crc_ok,
        h_crc_ok: h.crc_ok,
    }
}

/// Pull six data bytes out of the dongle's reply to `i2c raw 30 r6`.
///
/// The expected line is `i2c: raw dev 86: 8a 4a d1 00 5a 95 error=none`; only
/// the text after its last colon is scanned so the `dev 86` token is skipped.
/// Without such a line, any six hex pairs in the reply are accepted.
pub fn parse_raw_bytes(reply: &str) -> Result<[u8; 6]> {
    let payload = reply
        .lines()
        .find(|l| l.trim_start().starts_with("i2c: raw dev"))
        .map(|l| l.rsplit(':').next().unwrap_or(l))
        .unwrap_or(reply);

    let bytes: Vec<u8> = HEX_BYTE_RE
        .captures_iter(payload)
        .filter_map(|c| u8::from_str_radix(&c[1], 16).ok())
        .take(6)
        .collect();

    bytes.try_into().map_err(|b: Vec<u8>| {
        anyhow!(
            "expected 6 data bytes from dongle, got {} in '{}'",
            b.len(),
            reply.trim()
        )
    })
}

/// Dongle settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ens210Options {
    /// 7-bit I2C address.
    pub addr: u8,
    /// Report `ok` even when a CRC fails.
    pub ignore_crc: bool,
    /// Reply collection timing.
    pub burst: BurstTiming,
}

impl Default for Ens210Options {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR,
            ignore_crc: false,
            burst: BurstTiming::default(),
        }
    }
}

/// ENS210 driver.
pub struct Ens210 {
    port: Mutex<Option<DynSerial>>,
    remote: String,
    options: Ens210Options,
    log: Option<ProtocolLog>,
}

impl Ens210 {
    /// Open the dongle at `path` and configure it.
    #[cfg(feature = "tokio_serial")]
    pub async fn open(
        path: &str,
        baud: u32,
        timeout: Duration,
        options: Ens210Options,
        log: Option<ProtocolLog>,
    ) -> Result<Self> {
        let port = super::serial::open_serial_async(path, baud, timeout, "ENS210 dongle").await?;
        Self::connect(Box::new(port), path, options, log).await
    }

    /// Configure a dongle on an already open port.
    ///
    /// The dongle takes hex addresses without a prefix. The 8-bit (shifted)
    /// form is tried first; firmwares that reject it get the 7-bit form.
    pub async fn connect(
        port: DynSerial,
        remote: impl Into<String>,
        options: Ens210Options,
        log: Option<ProtocolLog>,
    ) -> Result<Self> {
        let sensor = Self {
            port: Mutex::new(Some(port)),
            remote: remote.into(),
            options,
            log,
        };

        {
            let mut guard = sensor.port.lock().await;
            let port = guard
                .as_mut()
                .ok_or_else(|| anyhow!("ENS210 port closed"))?;
            drain_serial_buffer(port, Duration::from_millis(20)).await;
            sensor.send(port, "").await?;
            tokio::time::sleep(Duration::from_millis(100)).await;

            let dev8 = (options.addr << 1) & 0xFE;
            let reply = sensor
                .exchange(port, &format!("i2c opt dev {dev8:02X} asize 1 vsize 1 speed 100000"))
                .await?;
            if reply.to_ascii_lowercase().contains("error") {
                debug!(addr = options.addr, "dongle rejected 8-bit address, using 7-bit");
                sensor
                    .exchange(
                        port,
                        &format!("i2c opt dev {:02X} asize 1 vsize 1 speed 100000", options.addr),
                    )
                    .await?;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            sensor.exchange(port, "i2c scan").await?;
        }

        Ok(sensor)
    }

    /// Device path or description of the port.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    fn log(&self, op: ProtocolOp, data: &str) {
        if let Some(log) = &self.log {
            log.record("ens210", op, &self.remote, data);
        }
    }

    async fn send(&self, port: &mut DynSerial, command: &str) -> Result<()> {
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        port.write_all(line.as_bytes())
            .await
            .with_context(|| format!("ENS210 dongle write '{}'", command))?;
        port.flush().await?;
        self.log(ProtocolOp::Write, line.trim());
        Ok(())
    }

    async fn exchange(&self, port: &mut DynSerial, command: &str) -> Result<String> {
        self.send(port, command).await?;
        let raw = read_burst(port, self.options.burst).await;
        let reply = String::from_utf8_lossy(&raw).into_owned();
        if !reply.is_empty() {
            self.log(ProtocolOp::Read, reply.trim());
        }
        Ok(reply)
    }

    async fn start_single_shot(&self, port: &mut DynSerial) -> Result<()> {
        for command in ["i2c raw 22 03", "i 22 03"] {
            if !self.exchange(port, command).await?.is_empty() {
                return Ok(());
            }
        }
        self.exchange(port, "i2c wr 22 03").await?;
        Ok(())
    }
}

#[async_trait]
impl HumiditySensor for Ens210 {
    async fn read(&self) -> Result<SensorReading> {
        let mut guard = self.port.lock().await;
        let Some(port) = guard.as_mut() else {
            bail!("ENS210 on {} is closed", self.remote);
        };

        self.start_single_shot(port).await?;
        tokio::time::sleep(CONVERSION_TIME).await;
        let reply = self.exchange(port, "i2c raw 30 r6").await?;
        let bytes = parse_raw_bytes(&reply)?;

        let reading = decode_reading(bytes, self.options.ignore_crc);
        if !reading.ok {
            warn!(
                t_valid = reading.t_valid,
                h_valid = reading.h_valid,
                t_crc_ok = reading.t_crc_ok,
                h_crc_ok = reading.h_crc_ok,
                "ENS210 reading flagged invalid"
            );
        }
        Ok(reading)
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut port) = self.port.lock().await.take() {
            let _ = port.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    const GOOD_LINE: &str = "i2c: raw dev 86: 8a 4a d1 00 5a 95 error=none";

    #[test]
    fn crc7_reference_values() {
        assert_eq!(crc7(0x14A8A), 0x68);
        assert_eq!(crc7(0x15A00), 0x4A);
        assert_eq!(crc7(0x00000), 0x7F);
        assert_eq!(crc7(0x1FFFF), 0x35);
    }

    #[test]
    fn decodes_little_endian_words() {
        let t = SensorWord::decode_bytes([0x8a, 0x4a, 0xd1]);
        assert_eq!(t.data, 0x4A8A);
        assert!(t.valid && t.crc_ok);
    }

    #[test]
    fn falls_back_to_msb_first_order() {
        let t = SensorWord::decode_bytes([0xd1, 0x4a, 0x8a]);
        assert_eq!(t.data, 0x4A8A);
        assert!(t.crc_ok);
    }

    #[test]
    fn corrupted_word_reports_crc_failure() {
        let t = SensorWord::decode_bytes([0x8b, 0x4a, 0xd1]);
        assert!(!t.crc_ok);
        assert_eq!(t.data, 0x4A8B);
    }

    #[test]
    fn full_reading_from_dongle_line() {
        let bytes = parse_raw_bytes(GOOD_LINE).unwrap();
        let r = decode_reading(bytes, false);
        assert!(r.ok);
        assert!((r.temp_k.unwrap() - 298.15625).abs() < 1e-9);
        assert!((r.temp_c.unwrap() - 25.00625).abs() < 1e-9);
        assert!((r.rh_pct.unwrap() - 45.0).abs() < 1e-9);
    }

    #[test]
    fn ignore_crc_keeps_reading_usable() {
        let bytes = [0x8b, 0x4a, 0xd1, 0x00, 0x5a, 0x95];
        assert!(!decode_reading(bytes, false).ok);
        let r = decode_reading(bytes, true);
        assert!(r.ok && !r.t_crc_ok && r.h_crc_ok);
    }

    #[test]
    fn raw_parse_skips_dev_token_and_falls_back() {
        let reply = format!("i2c raw 30 r6\r\n{GOOD_LINE}\r\n");
        assert_eq!(parse_raw_bytes(&reply).unwrap()[0], 0x8a);
        assert_eq!(
            parse_raw_bytes("8a 4a d1 00 5a 95").unwrap(),
            [0x8a, 0x4a, 0xd1, 0x00, 0x5a, 0x95]
        );
        assert!(parse_raw_bytes("error=timeout").is_err());
    }

    /// Fake dongle answering the console commands the driver sends.
    async fn fake_dongle(device: tokio::io::DuplexStream, reject_8bit: bool) {
        let (rx, mut tx) = tokio::io::split(device);
        let mut lines = BufReader::new(rx).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let reply = match line.trim() {
                "" => String::new(),
                l if l.starts_with("i2c opt dev 86") && reject_8bit => "error=arg\r\n".into(),
                l if l.starts_with("i2c opt") => "ok\r\n".into(),
                "i2c scan" => "found: 43\r\n".into(),
                "i2c raw 22 03" => "i2c: raw dev 86: error=none\r\n".into(),
                "i2c raw 30 r6" => format!("{GOOD_LINE}\r\n"),
                _ => "?\r\n".into(),
            };
            if !reply.is_empty() && tx.write_all(reply.as_bytes()).await.is_err() {
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reads_through_fake_dongle() {
        let (host, device) = tokio::io::duplex(1024);
        tokio::spawn(fake_dongle(device, true));

        let log = ProtocolLog::new(std::io::Cursor::new(Vec::new()));
        let sensor = Ens210::connect(
            Box::new(host),
            "/dev/ttyACM0",
            Ens210Options::default(),
            Some(log),
        )
        .await
        .unwrap();
        let reading = sensor.read().await.unwrap();
        assert!(reading.ok);
        assert!((reading.rh_pct.unwrap() - 45.0).abs() < 1e-9);

        sensor.close().await.unwrap();
        assert!(sensor.read().await.is_err());
    }
}
