//! CLI Entry Point for the energy meter driver
//!
//! Provides command-line access for:
//! - Reading energy (one shot or a series)
//! - Querying and selecting the measurement range
//! - Listing serial ports
//!
//! # Usage
//!
//! ```bash
//! energy-meter --config config/energy_meter.toml read --count 10
//! energy-meter --port /dev/ttyUSB0 set-range 30nJ
//! energy-meter ports
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use energy_meter::logging::{self, LoggingConfig, OutputFormat};
use energy_meter::{Config, EnergyMeter, EnergyReading, Range, RangeReading};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "energy-meter")]
#[command(about = "Serial driver for SCPI energy meters", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = energy_meter::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the serial port from the configuration
    #[arg(long)]
    port: Option<String>,

    /// Override the log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Compact)]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read energy in nanojoules
    Read {
        /// Number of readings
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Override the retry limit
        #[arg(long)]
        retries: Option<u32>,

        /// Pause between readings in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },

    /// Query the selected range
    GetRange,

    /// Select a range (300nJ, 30nJ, 3nJ)
    SetRange { range: Range },

    /// List serial ports visible to this machine
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Ports = cli.command {
        let level = logging::parse_log_level(cli.log_level.as_deref().unwrap_or("info"))
            .map_err(anyhow::Error::msg)?;
        init_logging(LoggingConfig::new(level), cli.log_format)?;
        return list_ports();
    }

    let mut figment = Config::figment(&cli.config);
    if let Some(port) = &cli.port {
        figment = figment.merge(("meter.port", port));
    }
    if let Some(level) = &cli.log_level {
        figment = figment.merge(("application.log_level", level));
    }
    let config: Config = figment
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    config.validate()?;

    init_logging(
        LoggingConfig::from_config(&config).map_err(anyhow::Error::msg)?,
        cli.log_format,
    )?;

    let mut meter = EnergyMeter::open(config.meter.session_config())
        .await?
        .with_retry_limit(config.meter.retry_limit)
        .with_settle_delay(config.meter.settle_delay);

    if let Some(range) = config.meter.default_range()? {
        meter.set_range_to(range).await;
    }

    let result = run(&mut meter, cli.command).await;

    if let Err(e) = meter.close().await {
        tracing::warn!(error = %e, "Failed to close energy meter");
    }
    result
}

async fn run(meter: &mut EnergyMeter, command: Commands) -> Result<()> {
    match command {
        Commands::Read {
            count,
            retries,
            interval_ms,
        } => {
            if let Some(retries) = retries {
                meter.set_retry_limit(retries);
            }
            for i in 0..count {
                if i > 0 && interval_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
                match meter.read_energy().await? {
                    EnergyReading::Measured { nanojoules, .. } => println!("{}", nanojoules),
                    failed => eprintln!("reading {}: {}", i + 1, failed),
                }
            }
            Ok(())
        }
        Commands::GetRange => {
            let reading = meter.get_range().await;
            match (&reading, reading.matching_range()) {
                (RangeReading::Zero, _) => println!("0"),
                (RangeReading::Raw(raw), Some(range)) => println!("{} ({})", range, raw.trim()),
                (RangeReading::Raw(raw), None) => println!("{}", raw.trim()),
            }
            Ok(())
        }
        Commands::SetRange { range } => {
            meter.set_range_to(range).await;
            println!("range set to {}", range);
            Ok(())
        }
        Commands::Ports => list_ports(),
    }
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        match port.port_type {
            serialport::SerialPortType::UsbPort(info) => println!(
                "{}  usb {:04x}:{:04x} {}",
                port.port_name,
                info.vid,
                info.pid,
                info.product.unwrap_or_default()
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

fn init_logging(config: LoggingConfig, format: OutputFormat) -> Result<()> {
    logging::init(config.with_format(format)).map_err(anyhow::Error::msg)
}
