//! # Triad
//!
//! Motion-control supervisor for a linear-delta printer on a Raspberry
//! Pi class host. Loads and validates the machine configuration, brings
//! up the peripherals (GPIO, DMA pulse emitter, PWM pacer, system timer),
//! homes the towers, and then holds the machine ready with the
//! temperature loop running until terminated.
//!
//! G-code parsing and the command front-end live outside this binary;
//! the machine API ([`machine::Machine`]) is the integration surface.

mod machine;
mod stepdir;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use triad_common::config::load_config;
use triad_common::consts::DEFAULT_CONFIG_PATH;

use crate::machine::Machine;

#[derive(Parser, Debug)]
#[command(name = "triad", about = "Delta printer motion core")]
struct Args {
    /// Machine configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    check: bool,

    /// Skip the initial homing cycle (service use only).
    #[arg(long)]
    no_home: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("FATAL: {e}");
            process::exit(1);
        }
    };

    if args.check {
        info!(
            r_um = config.geometry.r_um,
            l_um = config.geometry.l_um,
            h_um = config.geometry.h_um,
            dma_channel = config.dma.channel,
            tick_us = config.dma.tick_us,
            "config OK"
        );
        return;
    }

    let home_on_start = config.motion.home_before_first_move && !args.no_home;
    let mut machine = match Machine::new(config) {
        Ok(machine) => machine,
        Err(e) => {
            error!("FATAL: bring-up failed: {e}");
            process::exit(1);
        }
    };

    if home_on_start {
        if let Err(e) = machine.home() {
            error!("FATAL: homing failed: {e}");
            machine.shutdown();
            process::exit(1);
        }
    }

    info!("machine ready; temperature loop running, awaiting termination");
    // SIGINT/SIGTERM land in the pin registry's shutdown hook, which
    // parks every pin at its default state before the process dies.
    loop {
        std::thread::sleep(Duration::from_secs(1));
    }
}
