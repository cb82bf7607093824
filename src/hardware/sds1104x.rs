//! Siglent SDS1104X-E four-channel oscilloscope.
//!
//! Amplitude readings use the scope's own measurement engine (`Cn:PAVA?`),
//! which keeps each response to a few bytes. Full waveform transfer is
//! available through [`Sds1104x::get_waveform`] but is far slower and is not
//! used by the sampling loop.

use super::capabilities::{ChannelSetup, Oscilloscope, TriggerSlope};
use super::scpi::{parse_floats, parse_labeled_float, ScpiInstrument};
use crate::transport::Transport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Timeout applied while the waveform preamble is fetched.
pub const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Point cap requested before a waveform transfer.
pub const WAVEFORM_POINTS: u32 = 1200;

/// Scaling parameters of a waveform transfer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Preamble {
    /// Seconds per point.
    pub xinc: f64,
    /// Time of the first point.
    pub xorig: f64,
    /// Reference point index.
    pub xref: f64,
    /// Volts per code.
    pub yinc: f64,
    /// Vertical origin in volts.
    pub yorig: f64,
    /// Reference code.
    pub yref: f64,
}

impl Preamble {
    /// Parse the first six numbers of a `WAV:PRE?` response.
    pub fn parse(text: &str) -> Option<Self> {
        let nums: Vec<f64> = parse_floats(text).take(6).collect();
        match nums[..] {
            [xinc, xorig, xref, yinc, yorig, yref] => Some(Self {
                xinc,
                xorig,
                xref,
                yinc,
                yorig,
                yref,
            }),
            _ => None,
        }
    }

    /// Convert raw codes to `(time, volts)` vectors.
    pub fn scale(&self, codes: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let xs = (0..codes.len())
            .map(|i| self.xorig + i as f64 * self.xinc)
            .collect();
        let ys = codes
            .iter()
            .map(|p| (p - self.yref) * self.yinc + self.yorig)
            .collect();
        (xs, ys)
    }
}

/// Driver for the SDS1104X-E.
pub struct Sds1104x {
    scpi: ScpiInstrument,
    measurements_enabled: AtomicBool,
}

impl Sds1104x {
    /// Create a driver on an already constructed transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            scpi: ScpiInstrument::new(transport, "sds1104x"),
            measurements_enabled: AtomicBool::new(false),
        }
    }

    /// Shared SCPI commands.
    pub fn scpi(&self) -> &ScpiInstrument {
        &self.scpi
    }

    /// Stop acquisition.
    pub async fn stop(&self) -> Result<()> {
        self.scpi.write("STOP").await
    }

    /// Arm a single acquisition.
    pub async fn single(&self) -> Result<()> {
        self.scpi.write("SING").await
    }

    async fn ensure_measurements(&self) {
        if self.measurements_enabled.load(Ordering::Relaxed) {
            return;
        }
        if self.scpi.try_write("MEAS:STAT ON").await {
            self.measurements_enabled.store(true, Ordering::Relaxed);
        }
    }

    async fn pava(&self, channel: &str, item: &str) -> Result<f64> {
        let response = self.scpi.query(&format!("{channel}:PAVA? {item}")).await?;
        parse_labeled_float(&response)
            .ok_or_else(|| anyhow!("unexpected PAVA response: '{}'", response))
    }

    /// `MEAS:ITEM? <item>,<ch>` then `MEAS:<item>? <ch>`.
    async fn meas_fallback(&self, channel: &str, item: &str) -> Result<f64> {
        match self.scpi.query_f64(&format!("MEAS:ITEM? {item},{channel}")).await {
            Ok(v) => Ok(v),
            Err(e) => {
                debug!(error = %e, item, "MEAS:ITEM? failed");
                self.scpi.query_f64(&format!("MEAS:{item}? {channel}")).await
            }
        }
    }

    async fn query_or(&self, command: &str, default: f64) -> f64 {
        self.scpi.query_f64(command).await.unwrap_or(default)
    }

    async fn preamble(&self) -> Result<Preamble> {
        let saved = self.scpi.timeout().await;
        self.scpi.set_timeout(PREAMBLE_TIMEOUT).await;
        let response = self.scpi.query("WAV:PRE?").await;
        if let Some(timeout) = saved {
            self.scpi.set_timeout(timeout).await;
        }

        match response.map(|text| Preamble::parse(&text)) {
            Ok(Some(pre)) => return Ok(pre),
            Ok(None) => debug!("incomplete waveform preamble, querying fields"),
            Err(e) => debug!(error = %e, "waveform preamble failed, querying fields"),
        }

        Ok(Preamble {
            xinc: self.scpi.query_f64("WAV:XINC?").await?,
            xorig: self.scpi.query_f64("WAV:XOR?").await?,
            xref: self.query_or("WAV:XREF?", 0.0).await,
            yinc: self.scpi.query_f64("WAV:YINC?").await?,
            yorig: self.query_or("WAV:YOR?", 0.0).await,
            yref: self.query_or("WAV:YREF?", 0.0).await,
        })
    }

    /// Transfer the displayed waveform of `channel` as `(seconds, volts)`.
    ///
    /// Acquisition is stopped for a consistent record and restarted afterwards.
    pub async fn get_waveform(&self, channel: &str) -> Result<(Vec<f64>, Vec<f64>)> {
        self.scpi.write("STOP").await?;
        self.scpi.write("WAV:MODE NORM").await?;
        self.scpi.write("WAV:FORM ASC").await?;
        self.scpi.write(&format!("WAV:SOUR {channel}")).await?;
        self.scpi
            .try_write(&format!("WAV:POIN {WAVEFORM_POINTS}"))
            .await;
        self.scpi.query("*OPC?").await?;

        let pre = self.preamble().await?;
        let raw = self.scpi.query("WAV:DATA?").await?;
        let codes: Vec<f64> = raw
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .filter_map(|v| v.parse().ok())
            .collect();

        self.scpi.try_write("RUN").await;
        Ok(pre.scale(&codes))
    }
}

/// Join commands into one `;`-separated program message.
fn program_message(parts: &[String]) -> String {
    parts.join("; ")
}

fn channel_commands(setup: &ChannelSetup) -> Vec<String> {
    let ch = &setup.channel;
    let mut parts = vec![format!(
        "{ch}:TRA {}",
        if setup.enabled { "ON" } else { "OFF" }
    )];
    if let Some(scale) = setup.scale {
        parts.push(format!("{ch}:SCAL {scale}"));
    }
    if let Some(offset) = setup.offset {
        parts.push(format!("{ch}:OFFS {offset}"));
    }
    if let Some(probe) = setup.probe {
        parts.push(format!("{ch}:PROB {probe}"));
    }
    parts
}

#[async_trait]
impl Oscilloscope for Sds1104x {
    async fn set_channel(&self, setup: &ChannelSetup) -> Result<()> {
        self.scpi
            .write(&program_message(&channel_commands(setup)))
            .await
    }

    async fn set_timebase(&self, tdiv: f64, points: Option<u32>) -> Result<()> {
        let mut parts = vec![format!("TDIV {tdiv}")];
        if let Some(points) = points {
            parts.push(format!("ACQ:MEMD {points}"));
        }
        self.scpi.write(&program_message(&parts)).await
    }

    async fn set_trigger_edge(&self, source: &str, level: f64, slope: TriggerSlope) -> Result<()> {
        let parts = [
            "TRIG:MODE EDGE".to_string(),
            format!("TRIG:EDGE:SOUR {source}"),
            format!("TRIG:EDGE:SLOP {}", slope.as_scpi()),
            format!("TRIG:LEV {level}"),
        ];
        self.scpi.write(&program_message(&parts)).await
    }

    async fn measure_vpp(&self, channel: &str) -> Result<f64> {
        self.ensure_measurements().await;
        match self.pava(channel, "VPP").await {
            Ok(v) => Ok(v),
            Err(e) => {
                debug!(error = %e, "PAVA VPP failed");
                self.meas_fallback(channel, "VPP").await
            }
        }
    }

    async fn measure_vrms(&self, channel: &str) -> Result<f64> {
        self.ensure_measurements().await;
        for item in ["VRMS", "RMS"] {
            match self.pava(channel, item).await {
                Ok(v) => return Ok(v),
                Err(e) => debug!(error = %e, item, "PAVA failed"),
            }
        }
        self.meas_fallback(channel, "VRMS").await
    }

    async fn run(&self) -> Result<()> {
        self.scpi.write("RUN").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_needs_six_numbers() {
        let pre = Preamble::parse("1e-6,-0.0006,0,0.01,-0.5,128").unwrap();
        assert_eq!(pre.xinc, 1e-6);
        assert_eq!(pre.yref, 128.0);
        assert!(Preamble::parse("1e-6,0,0").is_none());
    }

    #[test]
    fn scaling_applies_reference_and_origin() {
        let pre = Preamble {
            xinc: 0.5,
            xorig: 1.0,
            yinc: 0.1,
            yorig: 2.0,
            yref: 10.0,
            ..Default::default()
        };
        let (xs, ys) = pre.scale(&[10.0, 20.0]);
        assert_eq!(xs, vec![1.0, 1.5]);
        assert_eq!(ys, vec![2.0, 3.0]);
    }

    #[test]
    fn channel_program_message() {
        let setup = ChannelSetup {
            probe: Some(10.0),
            scale: Some(0.5),
            ..ChannelSetup::new("C1")
        };
        assert_eq!(
            program_message(&channel_commands(&setup)),
            "C1:TRA ON; C1:SCAL 0.5; C1:PROB 10"
        );
    }

    fn scope_handler(command: &str) -> Option<String> {
        let reply = match command {
            "C2:PAVA? VPP" => "C2:PAVA PKPK,1.50E+00V",
            "C2:PAVA? VRMS" => "C2:PAVA VRMS,****",
            "C2:PAVA? RMS" => "C2:PAVA RMS,7.07E-01V",
            "*OPC?" => "1",
            "WAV:PRE?" => "1e-3,0,0,0.1,0,0",
            "WAV:DATA?" => "0,10,20",
            other if other.ends_with('?') => "",
            _ => return None,
        };
        Some(reply.to_string())
    }

    async fn scope_on_mock() -> (Sds1104x, crate::hardware::mock::MockScpiServer) {
        let server = crate::hardware::mock::MockScpiServer::start(scope_handler)
            .await
            .unwrap();
        let transport = crate::transport::PersistentTcpTransport::new(server.host(), server.port());
        (Sds1104x::new(Box::new(transport)), server)
    }

    #[tokio::test]
    async fn pava_readings_and_fallback_item() {
        let (scope, server) = scope_on_mock().await;

        assert_eq!(scope.measure_vpp("C2").await.unwrap(), 1.5);
        assert_eq!(scope.measure_vrms("C2").await.unwrap(), 0.707);

        let commands = server.commands();
        assert_eq!(commands.iter().filter(|c| *c == "MEAS:STAT ON").count(), 1);
        assert!(commands.contains(&"C2:PAVA? RMS".to_string()));
    }

    #[tokio::test]
    async fn waveform_transfer_rearms() {
        let (scope, server) = scope_on_mock().await;

        let (xs, ys) = scope.get_waveform("C2").await.unwrap();
        assert_eq!(xs, vec![0.0, 0.001, 0.002]);
        assert_eq!(ys, vec![0.0, 1.0, 2.0]);

        // A query on the same session orders it after the trailing RUN.
        scope.scpi().query("*OPC?").await.unwrap();
        let commands = server.commands();
        assert_eq!(commands.first().map(String::as_str), Some("STOP"));
        assert!(commands.contains(&"WAV:SOUR C2".to_string()));
        assert_eq!(commands[commands.len() - 2], "RUN");
        // The preamble timeout is restored afterwards.
        assert_eq!(scope.scpi().timeout().await, Some(Duration::from_secs(5)));
    }
}
