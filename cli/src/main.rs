// bleprint: BLE central driver
//
// Runs one session against the simulated stack or, with the `desktop`
// feature, the host adapter through btleplug. Session events are printed to
// stdout as `method payload` lines; logs go to stderr.

mod config;

use anyhow::{Context, Result};
use bleprint_core::platform::{SimulatedPermissions, SimulatedRadio};
use bleprint_core::{BleError, BleSession, EventStream, SessionEvent, SessionHandle};
use clap::{Parser, Subcommand};
use colored::*;
use config::CliConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Slack on top of a scan window or connect timeout before giving up on events.
const EVENT_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "bleprint")]
#[command(about = "bleprint: BLE central session driver", long_about = None)]
#[command(version)]
struct Cli {
    /// Use the simulated stack from the config file
    #[arg(long, global = true)]
    simulate: bool,

    /// Log filter, overrides RUST_LOG (e.g. "debug", "bleprint_core=trace")
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the host platform name
    Platform,
    /// Show adapter availability and power state
    Status,
    /// Scan for named devices
    Scan {
        /// Scan window in milliseconds
        #[arg(short, long, allow_negative_numbers = true)]
        period: Option<i64>,
    },
    /// List bonded devices
    Paired,
    /// Connect to a device and follow its state
    Connect {
        address: String,
        /// Connection timeout in milliseconds
        #[arg(short, long, allow_negative_numbers = true)]
        timeout: Option<i64>,
        /// How long to keep the link before exiting, in milliseconds
        #[arg(long)]
        hold: Option<u64>,
    },
    /// Disconnect a device
    Disconnect { address: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Get { key: String },
    Set { key: String, value: String },
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let command = match cli.command {
        Commands::Config { action } => return cmd_config(action),
        other => other,
    };

    let config = CliConfig::load()?;
    let (handle, events) = open_session(cli.simulate, &config).await?;

    let result = match command {
        Commands::Platform => cmd_platform(&handle).await,
        Commands::Status => cmd_status(&handle, cli.simulate).await,
        Commands::Scan { period } => cmd_scan(&handle, events, period, &config).await,
        Commands::Paired => cmd_paired(&handle).await,
        Commands::Connect {
            address,
            timeout,
            hold,
        } => cmd_connect(&handle, events, &address, timeout, hold, &config).await,
        Commands::Disconnect { address } => cmd_disconnect(&handle, &address).await,
        Commands::Config { .. } => Ok(()),
    };

    handle.shutdown().await;
    result
}

// ============================================================================
// BACKENDS
// ============================================================================

fn use_desktop(simulate: bool) -> bool {
    cfg!(feature = "desktop") && !simulate
}

async fn open_session(simulate: bool, config: &CliConfig) -> Result<(SessionHandle, EventStream)> {
    if use_desktop(simulate) {
        return desktop_session(config).await;
    }

    tracing::debug!(
        "Simulated stack with {} devices",
        config.simulated_devices.len()
    );
    let radio = SimulatedRadio::new()
        .automatic()
        .with_devices(config.simulated_devices.clone());
    BleSession::spawn(
        Arc::new(radio),
        Arc::new(SimulatedPermissions::granted()),
        config.session.clone(),
    )
    .context("Failed to start session")
}

#[cfg(feature = "desktop")]
async fn desktop_session(config: &CliConfig) -> Result<(SessionHandle, EventStream)> {
    use bleprint_core::platform::DesktopRadio;
    use bleprint_core::NoRuntimePermissions;

    let radio = DesktopRadio::new()
        .await
        .context("Failed to open Bluetooth adapter")?;
    BleSession::spawn(
        Arc::new(radio),
        Arc::new(NoRuntimePermissions),
        config.session.clone(),
    )
    .context("Failed to start session")
}

#[cfg(not(feature = "desktop"))]
async fn desktop_session(_config: &CliConfig) -> Result<(SessionHandle, EventStream)> {
    anyhow::bail!("built without the `desktop` feature; pass --simulate")
}

/// Error with its wire code appended.
fn ble_error(e: BleError) -> anyhow::Error {
    anyhow::anyhow!("{} [{}]", e, e.code())
}

fn print_event(event: &SessionEvent) {
    println!("{} {}", event.method(), event.payload());
}

/// Print events until `deadline`, or until `stop` says the stream is done.
async fn follow_events<F>(events: &mut EventStream, deadline: Instant, mut stop: F)
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => {
                print_event(&event);
                if stop(&event) {
                    return;
                }
            }
            Ok(None) => return,
            Err(_) => {
                tracing::debug!("Stopped following events");
                return;
            }
        }
    }
}

fn window(requested: Option<i64>, default_ms: u64) -> Duration {
    match requested {
        Some(ms) if ms >= 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

async fn cmd_platform(handle: &SessionHandle) -> Result<()> {
    let name = handle.platform_name().await.map_err(ble_error)?;
    println!("{}", name);
    Ok(())
}

async fn cmd_status(handle: &SessionHandle, simulate: bool) -> Result<()> {
    let platform = handle.platform_name().await.map_err(ble_error)?;
    let available = handle.is_available().await.map_err(ble_error)?;
    let enabled = handle.is_enabled().await.map_err(ble_error)?;

    let flag = |on: bool| {
        if on {
            "yes".green()
        } else {
            "no".red()
        }
    };

    println!("{}", "Adapter Status".bold());
    println!();
    println!("  Platform:  {}", platform.bright_cyan());
    println!(
        "  Backend:   {}",
        if use_desktop(simulate) {
            "desktop"
        } else {
            "simulated"
        }
    );
    println!("  Available: {}", flag(available));
    println!("  Enabled:   {}", flag(enabled));
    println!(
        "  Config:    {}",
        CliConfig::config_file()?.display().to_string().dimmed()
    );
    Ok(())
}

async fn cmd_scan(
    handle: &SessionHandle,
    mut events: EventStream,
    period: Option<i64>,
    config: &CliConfig,
) -> Result<()> {
    handle.scan(period).await.map_err(ble_error)?;
    let deadline = Instant::now() + window(period, config.session.default_scan_period_ms) + EVENT_GRACE;
    follow_events(&mut events, deadline, |event| {
        matches!(event, SessionEvent::StopScan { .. })
    })
    .await;
    Ok(())
}

async fn cmd_paired(handle: &SessionHandle) -> Result<()> {
    let devices = handle.paired().await.map_err(ble_error)?;
    if devices.is_empty() {
        eprintln!("{}", "(no bonded devices)".dimmed());
    }
    for device in devices {
        let line =
            serde_json::to_string(&device.to_wire()).context("Failed to serialize device")?;
        println!("{}", line);
    }
    Ok(())
}

async fn cmd_connect(
    handle: &SessionHandle,
    mut events: EventStream,
    address: &str,
    timeout: Option<i64>,
    hold: Option<u64>,
    config: &CliConfig,
) -> Result<()> {
    handle
        .connect(address, timeout)
        .await
        .map_err(ble_error)
        .with_context(|| format!("Failed to connect to {}", address))?;
    eprintln!("{} Connecting to {}", "✓".green(), address.bright_cyan());

    let hold = match hold {
        Some(ms) => Duration::from_millis(ms),
        None => window(timeout, config.session.default_connect_timeout_ms) + EVENT_GRACE,
    };
    follow_events(&mut events, Instant::now() + hold, |_| false).await;
    Ok(())
}

async fn cmd_disconnect(handle: &SessionHandle, address: &str) -> Result<()> {
    handle
        .disconnect(address)
        .await
        .map_err(ble_error)
        .with_context(|| format!("Failed to disconnect {}", address))?;
    eprintln!("{} Disconnected {}", "✓".green(), address.bright_cyan());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = CliConfig::load()?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
            println!();
            println!("{}", "Simulated devices:".bold());
            if config.simulated_devices.is_empty() {
                println!("  {}", "(none configured)".dimmed());
            }
            for device in &config.simulated_devices {
                println!(
                    "  {}  {}{}{}",
                    device.id,
                    device.name.as_deref().unwrap_or("(nameless)"),
                    if device.bonded { "  bonded" } else { "" },
                    if device.connectable { "" } else { "  unreachable" },
                );
            }
        }

        ConfigAction::Get { key } => {
            let config = CliConfig::load()?;
            match config.get(&key) {
                Some(value) => println!("{} = {}", key.bright_cyan(), value),
                None => anyhow::bail!("Unknown config key: {}", key),
            }
        }

        ConfigAction::Set { key, value } => {
            let mut config = CliConfig::load()?;
            config.set(&key, &value)?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Reset => {
            CliConfig::reset()?;
            println!(
                "{} Restored defaults in {}",
                "✓".green(),
                CliConfig::config_file()?.display()
            );
        }
    }
    Ok(())
}
