//! ardu-usb bridge
//!
//! Command-line front end: lists attached boards, reads from or writes to a
//! slot, or monitors attach/detach and write-failure events.

use anyhow::{Context, Result};
use bridge::{Bridge, BridgeConfig, DeviceFile};
use clap::{Parser, Subcommand};
use common::{BridgeEvent, EventStream, setup_logging};
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};
use transport::{Slot, TransferStatus};

#[derive(Parser, Debug)]
#[command(name = "ardu-bridge")]
#[command(
    author,
    version,
    about = "ardu-usb bridge - talk to Arduino boards over raw USB bulk transfers"
)]
#[command(long_about = "
Binds to Arduino Uno R3 boards (2341:0043 by default) and exposes each one
as a device slot starting at 192 (ttyardu192, ttyardu193, ...).

EXAMPLES:
    # Watch boards come and go
    ardu-bridge monitor

    # List attached boards
    ardu-bridge list

    # Send a command line to the first board
    ardu-bridge write --newline 'm10,20'

    # Read five replies from slot 193
    ardu-bridge read --slot 193 --count 5

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/ardu-usb/bridge.toml
    3. /etc/ardu-usb/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached boards and exit
    List,

    /// Read from a board
    Read {
        /// Device slot
        #[arg(short, long, default_value_t = 192)]
        slot: u32,

        /// Number of bulk IN transfers to perform
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },

    /// Write text to a board
    Write {
        /// Device slot
        #[arg(short, long, default_value_t = 192)]
        slot: u32,

        /// Append a newline
        #[arg(long)]
        newline: bool,

        text: String,
    },

    /// Print bridge events until Ctrl+C (default)
    Monitor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    info!("ardu-usb bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let start_config = config.clone();
    let (bridge, events) = tokio::task::spawn_blocking(move || Bridge::start(&start_config))
        .await
        .context("Bridge startup task failed")??;

    let write_timeout = Duration::from_millis(config.transfers.write_timeout_ms);
    let result = match args.command.unwrap_or(Command::Monitor) {
        Command::List => {
            list_slots(&bridge);
            Ok(())
        }
        Command::Read { slot, count } => read_mode(&bridge, Slot(slot), count).await,
        Command::Write {
            slot,
            newline,
            text,
        } => write_mode(&bridge, Slot(slot), text, newline, write_timeout).await,
        Command::Monitor => monitor_mode(events).await,
    };

    info!("Shutting down bridge...");
    let mut bridge = bridge;
    let still_held = tokio::task::spawn_blocking(move || bridge.shutdown())
        .await
        .context("Bridge shutdown task failed")?;
    if still_held > 0 {
        warn!("{} devices were still open at exit", still_held);
    }

    result
}

fn list_slots(bridge: &Bridge) {
    let slots = bridge.slots();
    if slots.is_empty() {
        println!("No boards attached.");
        return;
    }

    println!("Found {} board(s):\n", slots.len());
    for info in slots {
        println!("  [{}] {} - {}", info.slot, info.name, info.location);
        println!(
            "      bulk in {:#04x} ({} bytes), bulk out {:#04x}, open: {}",
            info.input_endpoint, info.input_buffer_len, info.output_endpoint, info.open_holds
        );
    }
}

async fn read_mode(bridge: &Bridge, slot: Slot, count: usize) -> Result<()> {
    let file = bridge
        .open(slot)
        .with_context(|| format!("Failed to open slot {}", slot))?;

    tokio::task::spawn_blocking(move || read_loop(file, count))
        .await
        .context("Read task failed")?
}

fn read_loop(file: DeviceFile, count: usize) -> Result<()> {
    let mut buf = vec![0u8; file.device().input_buffer_len()];

    for _ in 0..count {
        match file.read(&mut buf) {
            Ok(n) => print!("{}", String::from_utf8_lossy(&buf[..n])),
            Err(bridge::ReadError::Transport(TransferStatus::Timeout)) => {
                warn!("{}: read timed out", file.name());
            }
            Err(e) => return Err(e).with_context(|| format!("Read from {} failed", file.name())),
        }
    }

    file.close();
    Ok(())
}

async fn write_mode(
    bridge: &Bridge,
    slot: Slot,
    text: String,
    newline: bool,
    timeout: Duration,
) -> Result<()> {
    let file = bridge
        .open(slot)
        .with_context(|| format!("Failed to open slot {}", slot))?;

    let mut data = text.into_bytes();
    if newline {
        data.push(b'\n');
    }

    tokio::task::spawn_blocking(move || {
        let written = file
            .write(&data)
            .with_context(|| format!("Write to {} failed", file.name()))?;

        // Writes complete asynchronously; wait so shutdown does not cancel it
        let deadline = Instant::now() + timeout;
        while file.device().outstanding_writes() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        info!("Wrote {} bytes to {}", written, file.name());
        file.close();
        Ok(())
    })
    .await
    .context("Write task failed")?
}

async fn monitor_mode(events: EventStream) -> Result<()> {
    info!("Monitoring bridge events, press Ctrl+C to stop");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            event = events.recv() => {
                let event = event.context("Event channel closed")?;
                print_event(&event);
            }
        }
    }
}

fn print_event(event: &BridgeEvent) {
    match event {
        BridgeEvent::DeviceAttached {
            slot,
            name,
            location,
        } => println!("attached  [{}] {} ({})", slot, name, location),
        BridgeEvent::AttachRejected { location, reason } => {
            println!("rejected  {}: {}", location, reason)
        }
        BridgeEvent::DeviceDetached {
            slot,
            location,
            open_holds,
        } => println!(
            "detached  [{}] ({}), {} still open",
            slot, location, open_holds
        ),
        BridgeEvent::DeviceDestroyed { slot } => println!("destroyed [{}]", slot),
        BridgeEvent::WriteFailed {
            slot,
            endpoint,
            len,
            status,
        } => println!(
            "write failed [{}] endpoint {:#04x}, {} bytes: {}",
            slot, endpoint, len, status
        ),
    }
}
