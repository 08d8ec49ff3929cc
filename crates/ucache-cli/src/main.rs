//! ucache - command line driver for Apogee uCache loggers
//!
//! Scans for loggers, reads their status, configures logging, and downloads
//! stored measurements to CSV.

mod config;
mod export;
mod routines;

use anyhow::{bail, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ucache_core::format_timestamp;
use ucache_discovery::ScanOptions;
use ucache_gatt::{BleTransport, DeviceSession, TimeSyncAction};

use crate::config::Config;
use crate::routines::{DownloadOptions, DownloadOutcome, TransferStart};

#[derive(Parser, Debug)]
#[command(name = "ucache")]
#[command(about = "Configure Apogee uCache loggers and download their data")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "ucache.toml")]
    config: PathBuf,

    /// Logger address (overrides the configuration; scans when neither is set)
    #[arg(short, long, global = true)]
    address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List loggers in range
    Scan {
        /// Scan duration in seconds
        #[arg(long)]
        secs: Option<u64>,
    },
    /// Show device information, battery, clock and sensor
    Info,
    /// Configure and start logging
    Setup {
        /// Sampling interval in seconds
        #[arg(long)]
        sampling: Option<u32>,
        /// Logging interval in seconds
        #[arg(long)]
        logging: Option<u32>,
        /// Advertise after every n-th log entry (0: on button press only)
        #[arg(long)]
        advertising: Option<u8>,
    },
    /// Download new log entries
    Download {
        /// Start from "all" or a local time "YYYY-MM-DD HH:MM"
        #[arg(long)]
        from: Option<TransferStart>,
    },
    /// Correct the logger clock against this computer
    SyncTime,
    /// Write a configuration file with default values
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("ucache v{}", env!("CARGO_PKG_VERSION"));

    if let Command::InitConfig = args.command {
        config::save_default_config(&args.config)?;
        info!(path = %args.config.display(), "Default configuration written");
        return Ok(());
    }

    // Load configuration
    let mut config = config::load_config(&args.config)?;
    if let Some(address) = args.address {
        config.device.address = Some(address);
    }

    match args.command {
        Command::Scan { secs } => {
            let mut options = config.scan_options();
            if let Some(secs) = secs {
                options.duration = std::time::Duration::from_secs(secs);
            }
            let devices = ucache_discovery::scan(&options).await?;
            if devices.is_empty() {
                println!("No loggers found");
            }
            for device in devices {
                println!(
                    "{}  {}  rssi {}",
                    device.address,
                    device.name.as_deref().unwrap_or("-"),
                    device.rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".to_string())
                );
            }
        }
        Command::Info => {
            let mut session = open_session(&config).await?;
            let report = routines::info(&mut session).await?;
            let status = &report.status;
            println!("Type:          {}", status.info.device_type());
            println!("Serial:        {}", status.info.serial_number);
            println!("Firmware rev.: {}", status.info.firmware_revision);
            println!("Hardware rev.: {}", status.info.hardware_revision);
            println!("Battery:       {}%", status.battery_level);
            println!("Device time:   {}", format_timestamp(status.device_time, &Local));
            println!(
                "Sensor:        {} ({})",
                report.sensor.display_name(),
                report.sensor.description
            );
        }
        Command::Setup {
            sampling,
            logging,
            advertising,
        } => {
            let mut logging_config = config.logging.clone();
            if let Some(s) = sampling {
                logging_config.sampling_interval_secs = s;
            }
            if let Some(l) = logging {
                logging_config.logging_interval_secs = l;
            }
            if let Some(a) = advertising {
                logging_config.advertising_freq = a;
            }

            let mut session = open_session(&config).await?;
            let report =
                routines::setup(&mut session, &logging_config, &config.output.log_file).await?;
            println!("Sample every {}s", report.settings.sampling_interval_s);
            println!("Log average every {}s", report.settings.logging_interval_s);
            println!("Advertise every {} log entries", report.advertising_freq);
            print_memory_full(report.memory_full_time);
        }
        Command::Download { from } => {
            let options = DownloadOptions {
                start: from,
                min_logs: config.transfer.min_logs,
                tolerance_s: config.time.tolerance_secs,
                transfer: config.transfer_options(),
            };
            let mut session = open_session(&config).await?;
            let outcome = routines::download(
                &mut session,
                &options,
                &config.output.data_file,
                &config.output.log_file,
            )
            .await?;
            match outcome {
                DownloadOutcome::NotLogging(status) => println!(
                    "Logger {} is not logging, nothing to download",
                    status.info.serial_number
                ),
                DownloadOutcome::TooFewLogs { status, available } => println!(
                    "Logger {} has only {} entries (minimum {}), not downloading",
                    status.info.serial_number, available, options.min_logs
                ),
                DownloadOutcome::Downloaded(report) => {
                    if let Some(last) = report.last_transferred {
                        println!("Previous transfer ended at {}", format_timestamp(last, &Local));
                    }
                    println!(
                        "Downloaded {} of {} entries to {}",
                        report.transfer.records.len(),
                        report.transfer.expected,
                        config.output.data_file.display()
                    );
                    if !report.transfer.is_complete() {
                        println!("Transfer ended early ({:?})", report.transfer.end);
                    }
                    match &report.time_sync {
                        Some(sync) => print_time_sync(sync.drift, sync.action),
                        None => println!("Device time could not be checked"),
                    }
                    print_memory_full(report.memory_full_time);
                }
            }
        }
        Command::SyncTime => {
            let mut session = open_session(&config).await?;
            let sync = routines::sync_time(&mut session, config.time.tolerance_secs).await?;
            print_time_sync(sync.drift, sync.action);
        }
        // Handled before loading the configuration
        Command::InitConfig => {}
    }

    Ok(())
}

/// Build a session for the configured logger, scanning for one if no address
/// is set
async fn open_session(config: &Config) -> Result<DeviceSession<BleTransport>> {
    let address = match &config.device.address {
        Some(address) => address.clone(),
        None => {
            let options = ScanOptions {
                stop_on_first: true,
                ..config.scan_options()
            };
            let devices = ucache_discovery::scan(&options).await?;
            let Some(device) = devices.into_iter().next() else {
                bail!("No logger found, scanning timed out after {:?}", options.duration);
            };
            info!(address = %device.address, "Using discovered logger");
            device.address
        }
    };

    let transport = BleTransport::new().await?;
    Ok(DeviceSession::new(address, transport).with_connect_timeout(config.connect_timeout()))
}

fn print_time_sync(drift: u64, action: TimeSyncAction) {
    match action {
        TimeSyncAction::WithinTolerance => println!("Time not updated, difference {drift}s"),
        TimeSyncAction::Updated => println!("Time updated, difference {drift}s"),
        TimeSyncAction::OutOfRange => {
            println!("Time not updated, difference {drift}s is implausible")
        }
        TimeSyncAction::WriteFailed => println!("Time update failed, difference {drift}s"),
    }
}

fn print_memory_full(time: Option<u32>) {
    match time {
        Some(t) => println!("Memory full on {}", format_timestamp(t, &Local)),
        None => println!("Memory full time unknown"),
    }
}
