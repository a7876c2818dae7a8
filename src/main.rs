//! CLI Entry Point for tilt-daq
//!
//! Provides command-line interface for:
//! - Acquiring from the accelerometer until a duration elapses or Ctrl-C is pressed
//! - Sending one manual frame on the bus
//! - Replaying a `candump` log through the decoder, filters and export
//! - Listing serial ports that can host an SLCAN adapter
//!
//! # Usage
//!
//! ```bash
//! tilt-daq acquire --interval 10 --csv run.csv --duration 30
//! tilt-daq send --id 61D --dlc 8 2B 00 18 05 E8 03 00 00
//! tilt-daq replay capture.log --interval 10 --csv replay.csv
//! tilt-daq ports
//! ```

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tilt_daq::acquisition::{
    replay_candump, AcquisitionController, AcquisitionEvent, AcquisitionRequest,
    AcquisitionService, StartOutcome, StopReport,
};
use tilt_daq::command::parse_manual_frame;
use tilt_daq::config::{Settings, DEFAULT_CONFIG_PATH};
use tilt_daq::data::filter_engine::FilterEngine;
use tilt_daq::data::storage::export_csv;
use tilt_daq::tracing_setup::{self, OutputFormat, TracingConfig};
use tokio::sync::broadcast;
use tracing::info;

#[derive(Parser)]
#[command(name = "tilt-daq")]
#[command(about = "CAN accelerometer acquisition with inclination channels", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire samples until the duration elapses or Ctrl-C
    Acquire {
        /// Sampling interval in milliseconds (1..=2000); defaults to the configured one
        #[arg(long)]
        interval: Option<u32>,

        /// CSV file written when the acquisition stops
        #[arg(long)]
        csv: Option<PathBuf>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Send one frame on the bus
    Send {
        /// Identifier, 1 to 3 hex digits
        #[arg(long)]
        id: String,

        /// Payload length, clamped to 0..=8
        #[arg(long, default_value = "8")]
        dlc: String,

        /// Payload bytes in hex; missing bytes are sent as 00
        bytes: Vec<String>,
    },

    /// Decode a candump log and derive channels offline
    Replay {
        /// candump log file
        log: PathBuf,

        /// Sampling interval the log was recorded with, in milliseconds
        #[arg(long)]
        interval: u32,

        /// CSV file to write
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// List serial ports usable as SLCAN channels
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    tracing_setup::init(TracingConfig::from_settings(&settings)?.with_format(cli.log_format))?;

    match cli.command {
        Commands::Acquire {
            interval,
            csv,
            duration,
        } => acquire(&settings, interval, csv, duration).await,
        Commands::Send { id, dlc, bytes } => send(&settings, &id, &dlc, &bytes),
        Commands::Replay { log, interval, csv } => replay(&settings, &log, interval, csv),
        Commands::Ports => ports(),
    }
}

async fn acquire(
    settings: &Settings,
    interval: Option<u32>,
    csv: Option<PathBuf>,
    duration: Option<u64>,
) -> Result<()> {
    let interval = interval.unwrap_or(settings.acquisition.sampling_interval_ms);
    let csv = csv.or_else(|| settings.storage.csv_path.clone());

    let controller = AcquisitionController::from_settings(settings);
    let (handle, task) = AcquisitionService::new(controller, &settings.acquisition).spawn();
    let mut events = handle.subscribe();

    let request = AcquisitionRequest {
        interval_ms: interval,
        csv_target: csv,
    };
    match handle.start(request).await? {
        StartOutcome::Started(session) => println!(
            "Acquiring at {} Hz on {} ({}); press Ctrl-C to stop",
            session.sampling_frequency_hz, settings.bus.channel, settings.bus.backend
        ),
        StartOutcome::AlreadyAcquiring => bail!("an acquisition is already running"),
    }

    let limit = async {
        match duration {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    let report = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            handle.stop().await?
        }
        _ = limit => handle.stop().await?,
        report = forced_stop(&mut events) => Some(report),
    };

    handle.shutdown().await?;
    task.await.context("acquisition service panicked")?;

    match report {
        Some(report) => print_report(&report),
        None => println!("Acquisition ended without a session"),
    }
    Ok(())
}

/// Resolves when the service reports a session stopped by a reader fault.
async fn forced_stop(events: &mut broadcast::Receiver<AcquisitionEvent>) -> StopReport {
    loop {
        match events.recv().await {
            Ok(AcquisitionEvent::Stopped(report)) if report.is_forced() => return report,
            Ok(AcquisitionEvent::Refreshed { sample_count }) => {
                tracing::debug!(sample_count, "derived channels refreshed");
            }
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

fn print_report(report: &StopReport) {
    println!("Samples: {}", report.sample_count);
    if let Some(fault) = &report.fault {
        println!("Stopped by bus fault: {fault}");
    }
    if report.reader_detached {
        println!("Reader thread did not exit in time; the bus will be reopened next time");
    }
    if let Some(path) = &report.exported_to {
        println!("Exported to {}", path.display());
    }
    if let Some(error) = &report.export_error {
        println!("Export failed: {error}");
    }
}

fn send(settings: &Settings, id: &str, dlc: &str, bytes: &[String]) -> Result<()> {
    let fields: Vec<&str> = bytes.iter().map(String::as_str).collect();
    let frame = parse_manual_frame(id, dlc, &fields)?;
    let mut controller = AcquisitionController::from_settings(settings);
    let result = controller.send_frame(&frame);
    controller.shutdown();
    result?;
    println!("Sent {frame}");
    Ok(())
}

fn replay(settings: &Settings, log: &Path, interval: u32, csv: Option<PathBuf>) -> Result<()> {
    let file = std::fs::File::open(log).with_context(|| format!("opening {}", log.display()))?;
    let replay = replay_candump(BufReader::new(file), interval, Local::now())?;
    let engine = FilterEngine::new(
        settings.filter.lowpass_cutoff_hz,
        settings.filter.highpass_cutoff_hz,
    );
    let derived = replay.derive(&engine, interval);

    println!(
        "Decoded {} samples ({} unparsed lines, {} skipped frames)",
        replay.samples.len(),
        replay.unparsed_lines,
        replay.skipped_frames
    );
    if let Some(channels) = &derived {
        if let Some(last) = channels.row(channels.len() - 1) {
            println!("Final tilt: XZ {:.3} deg, YZ {:.3} deg", last[6], last[7]);
        }
    }
    if let Some(path) = csv {
        let count = export_csv(&path, &replay.samples, derived.as_ref())?;
        println!("Exported {count} records to {}", path.display());
    }
    Ok(())
}

fn ports() -> Result<()> {
    #[cfg(feature = "instrument_serial")]
    {
        let ports = tilt_daq::hardware::list_ports()?;
        if ports.is_empty() {
            println!("No serial ports found");
        }
        for port in ports {
            println!("{port}");
        }
        Ok(())
    }

    #[cfg(not(feature = "instrument_serial"))]
    {
        bail!("serial support is not compiled in; rebuild with --features instrument_serial")
    }
}
