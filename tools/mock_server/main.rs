//! Mock SCPI server for dry runs.
//!
//! Serves an SPD3303X-style supply and an SDM3045X-style meter over TCP so
//! `sigbench run` can be exercised without a bench:
//!
//! ```bash
//! mock_scpi_server &
//! sigbench run plan.yaml --out dry.csv --spd 127.0.0.1:15025 --sdm 127.0.0.1:15026
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use sigbench::hardware::mock::{sdm_handler, spd_handler, MockScpiServer};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mock_scpi_server")]
#[command(about = "Loopback SCPI endpoints for the supply and the meter", long_about = None)]
struct Args {
    /// Supply listen address
    #[arg(long, default_value = "127.0.0.1:15025")]
    spd: SocketAddr,

    /// Meter listen address
    #[arg(long, default_value = "127.0.0.1:15026")]
    sdm: SocketAddr,

    /// Voltage reported by the meter
    #[arg(long, default_value_t = 5.0)]
    volts: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let spd = MockScpiServer::builder(spd_handler())
        .bind(args.spd)
        .start()
        .await
        .with_context(|| format!("binding supply endpoint {}", args.spd))?;
    let sdm = MockScpiServer::builder(sdm_handler(args.volts))
        .bind(args.sdm)
        .start()
        .await
        .with_context(|| format!("binding meter endpoint {}", args.sdm))?;

    println!("SPD mock on {}", spd.addr());
    println!("SDM mock on {}", sdm.addr());

    tokio::select! {
        _ = spd.serve_forever() => {}
        _ = sdm.serve_forever() => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}
