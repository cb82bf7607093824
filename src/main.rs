//! CLI Entry Point for sigbench
//!
//! Subcommands:
//! - `run`: execute a YAML test plan against the bench
//! - `scan`: list `/dev/usbtmc*` instruments and suggest a role mapping
//! - `ens`: print a few ENS210 readings as CSV
//!
//! # Usage
//!
//! ```bash
//! sigbench run plans/burn-in.yaml --out burn-in.csv \
//!     --spd 192.168.1.50 --sdm /dev/usbtmc0 --ens210 /dev/ttyACM0 \
//!     --debug-log scpi.ndjson
//! sigbench scan
//! sigbench ens --ens210 /dev/ttyACM0 --count 10
//! ```
//!
//! Exit status: 0 on completion or safety abort, 2 for configuration faults,
//! 1 for instrument faults.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sigbench::config::BenchConfig;
use sigbench::data::{open_sink, RecordSink};
use sigbench::error::DaqError;
use sigbench::experiment::{Plan, PlanRunner, RunContext, RunOutcome};
use sigbench::hardware::discovery::{scan_usbtmc, suggest_roles, PROBE_TIMEOUT};
use sigbench::hardware::target::{open_transport, Target, TransportOptions};
#[cfg(feature = "tokio_serial")]
use sigbench::hardware::Ens210Options;
use sigbench::hardware::{HumiditySensor, Sdm3045x, Sds1104x, Spd3303x};
use sigbench::tracing_init;
use sigbench::transport::ProtocolLog;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sigbench")]
#[command(
    version,
    about = "Unattended bench tests for Siglent instruments and an ENS210 probe",
    long_about = None
)]
struct Cli {
    /// Bench settings file (default: ./sigbench.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a YAML test plan
    Run(RunArgs),

    /// List USBTMC instruments and a suggested role mapping
    Scan {
        /// Directory holding the device nodes
        #[arg(long, default_value = sigbench::hardware::discovery::DEFAULT_DEV_DIR)]
        dev_dir: PathBuf,
    },

    /// Read the ENS210 through the serial USB-I2C dongle
    Ens(EnsArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Plan file
    plan: PathBuf,

    /// Output file (.csv, .arrow/.ipc/.feather for Arrow IPC, .parquet/.pq for Parquet)
    #[arg(long)]
    out: PathBuf,

    /// Power supply: /dev/usbtmcN or host[:port]
    #[arg(long)]
    spd: Option<String>,

    /// Multimeter: /dev/usbtmcN or host[:port]
    #[arg(long)]
    sdm: Option<String>,

    /// Oscilloscope: /dev/usbtmcN or host[:port]
    #[arg(long)]
    scope: Option<String>,

    /// Serial port of the ENS210 dongle
    #[arg(long)]
    ens210: Option<String>,

    /// Run without supply and meter; only log the sensor
    #[arg(long)]
    ens_only: bool,

    /// Append SCPI and dongle I/O to this NDJSON file
    #[arg(long)]
    debug_log: Option<PathBuf>,

    /// Open a new TCP connection for every command
    #[arg(long)]
    tcp_oneshot: bool,
}

#[derive(Args)]
struct EnsArgs {
    /// Serial port of the ENS210 dongle
    #[arg(long)]
    ens210: String,

    /// 7-bit I2C address (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_i2c_addr)]
    addr: Option<u8>,

    /// Number of readings
    #[arg(long, default_value_t = 5)]
    count: u32,

    /// Seconds between readings
    #[arg(long, default_value_t = 1.0)]
    delay: f64,

    /// Append dongle I/O to this NDJSON file
    #[arg(long)]
    debug_log: Option<PathBuf>,

    /// Report readings as ok even when a CRC check fails
    #[arg(long)]
    ignore_crc: bool,
}

fn parse_i2c_addr(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    match parsed {
        Ok(addr) if addr <= 0x7F => Ok(addr),
        _ => Err(format!("'{}' is not a 7-bit I2C address", s)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("sigbench: {}", e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = tracing_init::init_from_config(&config) {
        eprintln!("sigbench: {}", e);
        return ExitCode::from(2);
    }

    let result = match cli.command {
        Commands::Run(args) => run_plan(args, &config).await,
        Commands::Scan { dev_dir } => scan(&dev_dir).await,
        Commands::Ens(args) => read_sensor(args, &config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if is_configuration_fault(&e) => {
            eprintln!("sigbench: {}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("sigbench: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn is_configuration_fault(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<DaqError>())
        .any(DaqError::is_configuration)
}

fn load_config(path: Option<&Path>) -> Result<BenchConfig, DaqError> {
    match path {
        Some(path) if !path.exists() => Err(DaqError::Configuration(format!(
            "config file {} not found",
            path.display()
        ))),
        Some(path) => BenchConfig::load_from(path),
        None => BenchConfig::load(),
    }
}

fn open_debug_log(path: Option<&Path>) -> Result<Option<ProtocolLog>> {
    path.map(|p| {
        ProtocolLog::append_to(p).map_err(|e| {
            DaqError::Configuration(format!("cannot open debug log {}: {}", p.display(), e))
        })
    })
    .transpose()
    .map_err(Into::into)
}

async fn run_plan(args: RunArgs, config: &BenchConfig) -> Result<()> {
    // Everything that can be wrong with the invocation is checked before any
    // instrument I/O.
    let plan = Plan::load(&args.plan)?;
    if !args.ens_only && (args.spd.is_none() || args.sdm.is_none()) {
        return Err(DaqError::Configuration(
            "missing SPD/SDM targets; provide --spd and --sdm, or use --ens-only".into(),
        )
        .into());
    }
    let port = config.tcp.default_port;
    let parse = |arg: &Option<String>| arg.as_deref().map(|s| Target::parse(s, port)).transpose();
    let (spd, sdm, scope) = if args.ens_only {
        (None, None, parse(&args.scope)?)
    } else {
        (parse(&args.spd)?, parse(&args.sdm)?, parse(&args.scope)?)
    };
    let log = open_debug_log(args.debug_log.as_deref())?;
    let mut sink = open_sink(&args.out)?;

    let options = TransportOptions {
        config,
        tcp_oneshot: args.tcp_oneshot,
        log: log.clone(),
    };
    let mut ctx = RunContext::new();
    if let Some(target) = &spd {
        info!(target = %target, "power supply");
        ctx = ctx.with_psu(Arc::new(Spd3303x::new(open_transport(target, "psu", &options))));
    }
    if let Some(target) = &sdm {
        info!(target = %target, "multimeter");
        ctx = ctx.with_dmm(Arc::new(Sdm3045x::new(open_transport(target, "dmm", &options))));
    }
    if let Some(target) = &scope {
        info!(target = %target, "oscilloscope");
        ctx = ctx.with_scope(Arc::new(Sds1104x::new(open_transport(target, "scope", &options))));
    }
    let sensor = match &args.ens210 {
        Some(path) => Some(
            open_sensor(
                path,
                config,
                config.sensor.addr,
                config.sensor.ignore_crc,
                log.clone(),
            )
            .await?,
        ),
        None => None,
    };
    if let Some(sensor) = &sensor {
        ctx = ctx.with_sensor(sensor.clone());
    }

    let mut runner = PlanRunner::new(plan, ctx);
    let result = runner.run(sink.as_mut()).await;

    if let Err(e) = sink.finish().await {
        warn!(error = %e, path = %args.out.display(), "output not finalised");
    }
    if let Some(sensor) = &sensor {
        let _ = sensor.close().await;
    }

    match result? {
        RunOutcome::Completed { ticks } => {
            info!(ticks, out = %args.out.display(), "plan completed");
        }
        RunOutcome::Aborted { reason, step, ticks } => {
            println!("aborted at step {}: {}", step, reason);
            info!(ticks, out = %args.out.display(), "plan aborted by safety interlock");
        }
    }
    Ok(())
}

#[cfg(feature = "tokio_serial")]
async fn open_sensor(
    path: &str,
    config: &BenchConfig,
    addr: u8,
    ignore_crc: bool,
    log: Option<ProtocolLog>,
) -> Result<Arc<dyn HumiditySensor>> {
    let options = Ens210Options {
        addr,
        ignore_crc,
        ..Default::default()
    };
    let sensor = sigbench::hardware::Ens210::open(
        path,
        config.sensor.baud,
        config.sensor.timeout,
        options,
        log,
    )
    .await
        .with_context(|| format!("Failed to open ENS210 serial dongle at {}", path))?;
    Ok(Arc::new(sensor))
}

#[cfg(not(feature = "tokio_serial"))]
async fn open_sensor(
    _path: &str,
    _config: &BenchConfig,
    _addr: u8,
    _ignore_crc: bool,
    _log: Option<ProtocolLog>,
) -> Result<Arc<dyn HumiditySensor>> {
    Err(DaqError::FeatureNotEnabled("tokio_serial".to_string()).into())
}

async fn scan(dev_dir: &Path) -> Result<()> {
    let results = scan_usbtmc(dev_dir, PROBE_TIMEOUT)
        .await
        .with_context(|| format!("listing {}", dev_dir.display()))?;
    if results.is_empty() {
        println!("No {}/usbtmc* devices found.", dev_dir.display());
        return Ok(());
    }

    println!("Detected USBTMC devices and IDNs:");
    for result in &results {
        match &result.idn {
            Ok(idn) => println!("  {}: {}", result.path.display(), idn),
            Err(e) => println!("  {}: ERROR: {}", result.path.display(), e),
        }
    }

    let roles = suggest_roles(&results);
    let suggested = [("spd", &roles.spd), ("sdm", &roles.sdm), ("scope", &roles.scope)];
    if suggested.iter().any(|(_, path)| path.is_some()) {
        println!("\nSuggested role mapping:");
        for (role, path) in suggested {
            if let Some(path) = path {
                println!("  {}: {}", role, path.display());
            }
        }
    }
    Ok(())
}

async fn read_sensor(args: EnsArgs, config: &BenchConfig) -> Result<()> {
    let log = open_debug_log(args.debug_log.as_deref())?;
    let addr = args.addr.unwrap_or(config.sensor.addr);
    let ignore_crc = args.ignore_crc || config.sensor.ignore_crc;
    let sensor = open_sensor(&args.ens210, config, addr, ignore_crc, log).await?;

    println!("timestamp,temp_c,temp_k,rh_pct,ok,t_valid,h_valid,t_crc_ok,h_crc_ok");
    let delay = Duration::from_secs_f64(args.delay.max(0.0));
    let mut outcome = Ok(());
    for _ in 0..args.count.max(1) {
        let reading = match sensor.read().await {
            Ok(reading) => reading,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        println!(
            "{:.3},{},{},{},{},{},{},{},{}",
            ts,
            cell(reading.temp_c),
            cell(reading.temp_k),
            cell(reading.rh_pct),
            reading.ok,
            reading.t_valid,
            reading.h_valid,
            reading.t_crc_ok,
            reading.h_crc_ok
        );
        tokio::time::sleep(delay).await;
    }

    let _ = sensor.close().await;
    outcome
}

fn cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}
