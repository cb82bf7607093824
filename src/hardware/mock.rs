//! Mock Hardware Implementations
//!
//! Simulated instruments for testing without a bench. Two flavours exist:
//!
//! - [`MockScpiServer`]: a real TCP listener speaking newline-terminated SCPI,
//!   so the full transport + driver stack can be exercised. It counts
//!   connections and commands and can drop a session after N commands.
//! - `Mock*` capability implementations that skip the wire entirely and
//!   record what the runner asked of them.
//!
//! # Available Mocks
//!
//! - `spd_handler` - SPD3303X-style supply state machine (for `MockScpiServer`)
//! - `sdm_handler` - SDM3045X-style meter state machine (for `MockScpiServer`)
//! - `MockPowerSupply`, `MockMultimeter`, `MockOscilloscope`, `MockSensor`
//!
//! All mock devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep).

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::hardware::capabilities::{
    ChannelSetup, HumiditySensor, Multimeter, Oscilloscope, PowerSupply, SensorReading,
    TriggerSlope,
};

// =============================================================================
// MockScpiServer - TCP SCPI endpoint
// =============================================================================

/// Maps one received command to an optional response line.
///
/// `None` means the command produces no response (a plain SCPI write).
pub type CommandHandler = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct ServerStats {
    connections: AtomicUsize,
    commands: AtomicUsize,
    received: StdMutex<Vec<String>>,
}

/// Builder for [`MockScpiServer`].
pub struct MockScpiServerBuilder {
    handler: CommandHandler,
    bind: SocketAddr,
    drop_after: Option<usize>,
}

impl MockScpiServerBuilder {
    /// Listen on `addr` instead of an ephemeral loopback port.
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    /// Close each connection after it has served `n` commands.
    pub fn drop_after(mut self, n: usize) -> Self {
        self.drop_after = Some(n);
        self
    }

    /// Bind and start accepting connections in a background task.
    pub async fn start(self) -> Result<MockScpiServer> {
        let listener = TcpListener::bind(self.bind).await?;
        let addr = listener.local_addr()?;
        let stats = Arc::new(ServerStats::default());

        let task = {
            let stats = Arc::clone(&stats);
            let handler = Arc::clone(&self.handler);
            let drop_after = self.drop_after;
            tokio::spawn(async move {
                loop {
                    let Ok((stream, peer)) = listener.accept().await else {
                        break;
                    };
                    stats.connections.fetch_add(1, Ordering::SeqCst);
                    debug!(%peer, "mock SCPI connection");
                    tokio::spawn(serve_connection(
                        stream,
                        Arc::clone(&handler),
                        Arc::clone(&stats),
                        drop_after,
                    ));
                }
            })
        };

        info!(%addr, "mock SCPI server listening");
        Ok(MockScpiServer { addr, stats, task })
    }
}

async fn serve_connection(
    stream: TcpStream,
    handler: CommandHandler,
    stats: Arc<ServerStats>,
    drop_after: Option<usize>,
) {
    let (rx, mut tx) = stream.into_split();
    let mut lines = BufReader::new(rx).lines();
    let mut served = 0usize;

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim();
        if command.is_empty() {
            continue;
        }
        stats.commands.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut received) = stats.received.lock() {
            received.push(command.to_string());
        }

        if let Some(response) = handler(command) {
            let framed = format!("{response}\n");
            if tx.write_all(framed.as_bytes()).await.is_err() {
                break;
            }
        }

        served += 1;
        if drop_after.is_some_and(|n| served >= n) {
            debug!(served, "mock SCPI server dropping connection");
            break;
        }
    }
}

/// Loopback SCPI server backed by a [`CommandHandler`].
///
/// The accept loop is aborted when the server is dropped.
pub struct MockScpiServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    task: JoinHandle<()>,
}

impl MockScpiServer {
    /// Configure a server around `handler`.
    pub fn builder<F>(handler: F) -> MockScpiServerBuilder
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        MockScpiServerBuilder {
            handler: Arc::new(handler),
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            drop_after: None,
        }
    }

    /// Start a server on an ephemeral loopback port.
    pub async fn start<F>(handler: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::builder(handler).start().await
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound host as a string.
    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.stats.connections.load(Ordering::SeqCst)
    }

    /// Non-empty command lines received so far, across all connections.
    pub fn command_count(&self) -> usize {
        self.stats.commands.load(Ordering::SeqCst)
    }

    /// Every command received, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.stats
            .received
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Wait until the accept loop ends (it only ends on listener failure).
    pub async fn serve_forever(mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for MockScpiServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Generic reply for queries no state machine knows: an empty line, so a
/// persistent session stays in step.
fn unknown(command: &str) -> Option<String> {
    command.ends_with('?').then(String::new)
}

#[derive(Debug, Clone, Copy)]
struct SpdChannel {
    volts: f64,
    amps: f64,
    on: bool,
}

impl Default for SpdChannel {
    fn default() -> Self {
        Self {
            volts: 5.0,
            amps: 1.0,
            on: false,
        }
    }
}

/// State machine of an SPD3303X-style supply.
///
/// Output voltage reads 10 mV low while the output is on; current reads the
/// limit while on and zero while off.
pub fn spd_handler() -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
    let channels: StdMutex<HashMap<String, SpdChannel>> = StdMutex::new(
        ["CH1", "CH2", "CH3"]
            .into_iter()
            .map(|c| (c.to_string(), SpdChannel::default()))
            .collect(),
    );

    move |command: &str| {
        let mut channels = channels.lock().ok()?;
        let upper = command.to_ascii_uppercase();

        match upper.as_str() {
            "*IDN?" => return Some("SIGLENT,SPD3303X-E,MOCK,1.00".into()),
            "SYST:ERR?" => return Some("0,No error".into()),
            "*OPC?" => return Some("1".into()),
            _ => {}
        }

        if let Some(rest) = upper.strip_prefix("MEAS:VOLT? ") {
            let ch = channels.get(rest.trim())?;
            let v = ch.volts - if ch.on { 0.01 } else { 0.0 };
            return Some(format!("{v:.6}"));
        }
        if let Some(rest) = upper.strip_prefix("MEAS:CURR? ") {
            let ch = channels.get(rest.trim())?;
            let i = if ch.on { ch.amps } else { 0.0 };
            return Some(format!("{i:.6}"));
        }
        if let Some(rest) = upper.strip_prefix("OUTP ") {
            if let Some((name, state)) = rest.split_once(',') {
                if let Some(ch) = channels.get_mut(name.trim()) {
                    ch.on = state.trim() == "ON";
                }
            }
            return None;
        }
        if let Some((name, setting)) = upper.split_once(':') {
            if let (Some(ch), Some((key, value))) =
                (channels.get_mut(name), setting.split_once(' '))
            {
                let value: f64 = value.trim().parse().ok()?;
                match key {
                    "VOLT" => ch.volts = value,
                    "CURR" => ch.amps = value,
                    _ => {}
                }
                return None;
            }
        }
        unknown(command)
    }
}

/// State machine of an SDM3045X-style meter that always reads `volts`.
pub fn sdm_handler(volts: f64) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
    sdm_handler_with(Vec::new(), volts)
}

/// Meter whose successive readings come from `script`, then `default`.
///
/// `READ?`, `FETCh?` and `MEAS:VOLT:DC?` all consume one reading.
pub fn sdm_handler_with(
    script: Vec<f64>,
    default: f64,
) -> impl Fn(&str) -> Option<String> + Send + Sync + 'static {
    let script = StdMutex::new(VecDeque::from(script));

    move |command: &str| match command.to_ascii_uppercase().as_str() {
        "*IDN?" => Some("SIGLENT,SDM3045X,MOCK,1.00".into()),
        "SYST:ERR?" => Some("0,No error".into()),
        "*OPC?" => Some("1".into()),
        "READ?" | "FETCH?" | "MEAS:VOLT:DC?" => {
            let v = script
                .lock()
                .ok()
                .and_then(|mut s| s.pop_front())
                .unwrap_or(default);
            Some(format!("{v:.6}"))
        }
        _ => unknown(command),
    }
}

// =============================================================================
// In-process capability mocks
// =============================================================================

/// Supply that records every command in SCPI-like text.
#[derive(Default)]
pub struct MockPowerSupply {
    log: Mutex<Vec<String>>,
    state: Mutex<HashMap<String, SpdChannel>>,
    fail_output_off: bool,
}

impl MockPowerSupply {
    /// Supply with every channel off at 5 V / 1 A.
    pub fn new() -> Self {
        Self::default()
    }

    /// Supply whose `output_off` always fails.
    pub fn failing_output_off() -> Self {
        Self {
            fail_output_off: true,
            ..Self::default()
        }
    }

    /// Commands received so far.
    pub async fn commands(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    /// Whether `channel` is currently enabled.
    pub async fn is_on(&self, channel: &str) -> bool {
        self.state
            .lock()
            .await
            .get(channel)
            .map(|c| c.on)
            .unwrap_or(false)
    }

    async fn record(&self, command: String) {
        self.log.lock().await.push(command);
    }
}

#[async_trait]
impl PowerSupply for MockPowerSupply {
    async fn set_voltage(&self, channel: &str, volts: f64) -> Result<()> {
        self.state.lock().await.entry(channel.into()).or_default().volts = volts;
        self.record(format!("{channel}:VOLT {volts}")).await;
        Ok(())
    }

    async fn set_current(&self, channel: &str, amps: f64) -> Result<()> {
        self.state.lock().await.entry(channel.into()).or_default().amps = amps;
        self.record(format!("{channel}:CURR {amps}")).await;
        Ok(())
    }

    async fn output_on(&self, channel: &str) -> Result<()> {
        self.state.lock().await.entry(channel.into()).or_default().on = true;
        self.record(format!("OUTP {channel},ON")).await;
        Ok(())
    }

    async fn output_off(&self, channel: &str) -> Result<()> {
        self.record(format!("OUTP {channel},OFF")).await;
        if self.fail_output_off {
            return Err(anyhow!("mock supply refused output off"));
        }
        self.state.lock().await.entry(channel.into()).or_default().on = false;
        Ok(())
    }

    async fn measure_current(&self, channel: &str) -> Result<f64> {
        let state = self.state.lock().await;
        Ok(state
            .get(channel)
            .filter(|c| c.on)
            .map(|c| c.amps)
            .unwrap_or(0.0))
    }

    async fn measure_voltage(&self, channel: &str) -> Result<f64> {
        let state = self.state.lock().await;
        Ok(state.get(channel).map(|c| c.volts).unwrap_or(0.0))
    }
}

/// Meter returning scripted readings, then a default.
pub struct MockMultimeter {
    script: Mutex<VecDeque<Result<f64, String>>>,
    default: f64,
    reads: AtomicUsize,
    function: Mutex<Option<(String, Option<f64>)>>,
}

impl MockMultimeter {
    /// Meter that always reads `default`.
    pub fn constant(default: f64) -> Self {
        Self::scripted(Vec::new(), default)
    }

    /// Meter that reads `script` in order, then `default` forever.
    pub fn scripted(script: Vec<f64>, default: f64) -> Self {
        Self {
            script: Mutex::new(script.into_iter().map(Ok).collect()),
            default,
            reads: AtomicUsize::new(0),
            function: Mutex::new(None),
        }
    }

    /// Make read number `n` (1-based, counted from now) fail with `message`.
    pub async fn fail_on_read(self, n: usize, message: &str) -> Self {
        {
            let mut script = self.script.lock().await;
            while script.len() < n {
                script.push_back(Ok(self.default));
            }
            if let Some(slot) = n.checked_sub(1).and_then(|i| script.get_mut(i)) {
                *slot = Err(message.to_string());
            }
        }
        self
    }

    /// Number of `read` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Last function selected.
    pub async fn function(&self) -> Option<(String, Option<f64>)> {
        self.function.lock().await.clone()
    }
}

#[async_trait]
impl Multimeter for MockMultimeter {
    async fn set_function(&self, function: &str, range: Option<f64>) -> Result<()> {
        *self.function.lock().await = Some((function.to_string(), range));
        Ok(())
    }

    async fn read(&self) -> Result<f64> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().await.pop_front() {
            Some(Ok(v)) => Ok(v),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(self.default),
        }
    }
}

/// Scope reporting fixed amplitudes.
pub struct MockOscilloscope {
    vpp: f64,
    vrms: f64,
    fail_measure: bool,
    log: Mutex<Vec<String>>,
}

impl MockOscilloscope {
    /// Scope that measures `vpp` and `vrms` on every channel.
    pub fn new(vpp: f64, vrms: f64) -> Self {
        Self {
            vpp,
            vrms,
            fail_measure: false,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Scope whose measurement queries always fail.
    pub fn failing() -> Self {
        Self {
            fail_measure: true,
            ..Self::new(0.0, 0.0)
        }
    }

    /// Calls received so far.
    pub async fn calls(&self) -> Vec<String> {
        self.log.lock().await.clone()
    }

    async fn record(&self, call: String) {
        self.log.lock().await.push(call);
    }
}

#[async_trait]
impl Oscilloscope for MockOscilloscope {
    async fn set_channel(&self, setup: &ChannelSetup) -> Result<()> {
        self.record(format!("set_channel {}", setup.channel)).await;
        Ok(())
    }

    async fn set_timebase(&self, tdiv: f64, points: Option<u32>) -> Result<()> {
        self.record(format!("set_timebase {tdiv} {points:?}")).await;
        Ok(())
    }

    async fn set_trigger_edge(&self, source: &str, level: f64, slope: TriggerSlope) -> Result<()> {
        self.record(format!("set_trigger_edge {source} {level} {}", slope.as_scpi()))
            .await;
        Ok(())
    }

    async fn measure_vpp(&self, channel: &str) -> Result<f64> {
        self.record(format!("measure_vpp {channel}")).await;
        if self.fail_measure {
            bail!("measurement timed out on {channel}");
        }
        Ok(self.vpp)
    }

    async fn measure_vrms(&self, channel: &str) -> Result<f64> {
        self.record(format!("measure_vrms {channel}")).await;
        if self.fail_measure {
            bail!("measurement timed out on {channel}");
        }
        Ok(self.vrms)
    }

    async fn run(&self) -> Result<()> {
        self.record("run".to_string()).await;
        Ok(())
    }
}

/// Sensor returning scripted temperatures (or failures).
pub struct MockSensor {
    script: Mutex<VecDeque<Option<f64>>>,
    default_c: f64,
    rh_pct: f64,
    reads: AtomicUsize,
}

impl MockSensor {
    /// Sensor that always reads `temp_c` and `rh_pct`.
    pub fn constant(temp_c: f64, rh_pct: f64) -> Self {
        Self::scripted(Vec::new(), temp_c, rh_pct)
    }

    /// Sensor that reads `script` in order (`None` = read error), then
    /// `default_c` forever.
    pub fn scripted(script: Vec<Option<f64>>, default_c: f64, rh_pct: f64) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default_c,
            rh_pct,
            reads: AtomicUsize::new(0),
        }
    }

    /// Number of `read` calls so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HumiditySensor for MockSensor {
    async fn read(&self) -> Result<SensorReading> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let temp_c = match self.script.lock().await.pop_front() {
            Some(Some(t)) => t,
            Some(None) => return Err(anyhow!("mock sensor: no read data from dongle")),
            None => self.default_c,
        };
        Ok(SensorReading {
            temp_c: Some(temp_c),
            temp_k: Some(temp_c + 273.15),
            rh_pct: Some(self.rh_pct),
            ok: true,
            t_valid: true,
            h_valid: true,
            t_crc_ok: true,
            h_crc_ok: true,
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
