//! Angle triggered capture system binary
use clap::Parser;
use log::{error, info};
use pivot::components::prelude::*;
use std::{process, sync::atomic::Ordering};

/// Arguments required for starting the program from the command line.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the config file for the Capture Station Component.
    #[arg(short, long)]
    filepath: String,
    /// Serial port to use instead of the one in the config file.
    #[arg(short, long)]
    port: Option<String>,
}

fn main() {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();
    let args = Args::parse();

    let mut config = match CaptureStationConfig::from_file(&args.filepath) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.serial.port = port;
    }

    let mut station = match CaptureStation::new(config) {
        Ok(station) => station,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };

    let stop_signal = station.stop_signal();
    if let Err(e) = ctrlc::set_handler(move || stop_signal.store(true, Ordering::Relaxed)) {
        error!("Failed to install interrupt handler: {e}");
        process::exit(1);
    }

    let stats = CaptureStationController::run(&mut station);
    info!(
        "Saved {} images ({} capture failures, {} save failures)",
        stats.saved, stats.capture_failures, stats.save_failures
    );
}
