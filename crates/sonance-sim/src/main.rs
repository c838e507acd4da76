//! # Sonance Sim
//!
//! Runs the audio engine headless against a scenario file and prints what
//! happened as JSON.
//!
//! ```text
//! sonance-sim [scenario.toml]
//! ```
//!
//! Without an argument the built-in scenario is used. Log verbosity follows
//! `RUST_LOG` (default `sonance=info`).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod scenario;
mod sim;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::scenario::SimConfig;
use crate::sim::Simulation;

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("sonance=info".parse()?))
        .init();

    info!("Sonance simulator {}", env!("CARGO_PKG_VERSION"));

    let config = match std::env::args().nth(1) {
        Some(path) => SimConfig::load_from(path)?,
        None => {
            info!("No scenario given, using built-in defaults");
            SimConfig::default()
        },
    };

    let report = Simulation::new(config)?.run();
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!(
        "Done: {} sources started, peak {} channels playing",
        report.started, report.peak_playing
    );
    Ok(())
}
