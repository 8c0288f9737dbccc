use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use arpmini_link::config::{read_song_file, write_song_file};
use arpmini_link::device::port_monitor::{create_port_monitor, PortEvent};
use arpmini_link::device::{DeviceManager, SlotIndex};
use arpmini_link::{EditorSettings, SimulatedArpmini};

#[derive(Parser)]
#[command(author, version, about = "Manage the song slots of an Arpmini over USB serial")]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, global = true, env = "ARPMINI_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port to use instead of the first discovered Arpmini
    #[arg(long, short, global = true)]
    port: Option<String>,

    /// USB vendor id override, e.g. 0x2341
    #[arg(long, global = true, value_parser = parse_u16)]
    vid: Option<u16>,

    /// USB product id override, e.g. 0x9030
    #[arg(long, global = true, value_parser = parse_u16)]
    pid: Option<u16>,

    /// Talk to an in-memory simulated device instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List connectable devices
    List,
    /// Scan all slots and print their status
    Scan,
    /// Query a single slot (1-60)
    Status { slot: usize },
    /// Write a .arpmini file into a slot
    Import {
        slot: usize,
        file: PathBuf,
        /// Overwrite a slot that is not empty
        #[arg(long)]
        force: bool,
    },
    /// Save a slot to a .arpmini file
    Export { slot: usize, file: PathBuf },
    /// Erase a slot
    Clear {
        slot: usize,
        /// Confirm the erase
        #[arg(long)]
        yes: bool,
    },
    /// Print device arrivals, removals and session events until Ctrl-C
    Watch,
}

fn parse_u16(raw: &str) -> Result<u16, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid id '{}': {}", raw, e))
}

fn load_settings(cli: &Cli) -> anyhow::Result<EditorSettings> {
    let mut settings = match &cli.config {
        Some(path) => EditorSettings::load(path)?,
        None => EditorSettings::default(),
    };
    if let Some(vid) = cli.vid {
        settings.vendor_id = vid;
    }
    if let Some(pid) = cli.pid {
        settings.product_id = pid;
    }
    Ok(settings)
}

async fn open_session(cli: &Cli, manager: &DeviceManager) -> anyhow::Result<()> {
    if cli.simulate {
        manager.connect_with_io("SIM", SimulatedArpmini::new().boxed()).await?;
    } else if let Some(port) = &cli.port {
        manager.connect(port).await?;
    } else {
        let port = manager.connect_first().await?;
        log::info!("Using {}", port);
    }
    manager.wait_for_scan().await;
    Ok(())
}

fn slot_arg(number: usize) -> anyhow::Result<SlotIndex> {
    SlotIndex::from_number(number).with_context(|| format!("slot must be between 1 and 60, got {}", number))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    arpmini_link::init_logging(log::LevelFilter::Info);
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let manager = DeviceManager::new(settings.clone());

    match &cli.command {
        Command::List => {
            let candidates = manager.discover_devices();
            if candidates.is_empty() {
                println!("No Arpmini found");
            }
            for candidate in candidates {
                println!("{}", candidate.label);
            }
            return Ok(());
        }
        Command::Watch => {
            let mut monitor = create_port_monitor(settings.device_filter(), settings.port_refresh_interval());
            let mut ports = monitor.get_receiver().context("port monitor receiver already taken")?;
            monitor.start().await.map_err(|e| anyhow::anyhow!(e))?;

            let mut events = manager.subscribe();
            if cli.port.is_some() || cli.simulate {
                open_session(&cli, &manager).await?;
            }

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    Some(event) = ports.recv() => match event {
                        PortEvent::PortAdded(c) => println!("+ {}", c.label),
                        PortEvent::PortRemoved(c) => println!("- {}", c.label),
                    },
                    Ok(event) = events.recv() => println!("{:?}", event),
                }
            }
            monitor.stop().await.map_err(|e| anyhow::anyhow!(e))?;
            let _ = manager.disconnect().await;
            return Ok(());
        }
        _ => {}
    }

    open_session(&cli, &manager).await?;

    let outcome = run_command(&cli.command, &manager).await;
    let _ = manager.disconnect().await;
    outcome
}

async fn run_command(command: &Command, manager: &DeviceManager) -> anyhow::Result<()> {
    match command {
        Command::Scan => {
            let registry = manager.registry().await;
            for entry in registry.entries() {
                println!("{}", entry.label());
            }
        }
        Command::Status { slot } => {
            let slot = slot_arg(*slot)?;
            let status = manager.query_status(slot).await?;
            println!("{} {}", status, slot.number());
        }
        Command::Import { slot, file, force } => {
            let slot = slot_arg(*slot)?;
            let blob = read_song_file(file)?;
            if manager.registry().await.is_occupied(slot) && !*force {
                bail!("{} is not empty; pass --force to overwrite it", slot);
            }
            let status = manager.import(slot, blob.as_bytes()).await?;
            println!("Slot {} updated successfully ({})", slot.number(), status);
        }
        Command::Export { slot, file } => {
            let slot = slot_arg(*slot)?;
            let blob = manager.export(slot).await?;
            let path = write_song_file(file, &blob)?;
            println!("Exported slot {} to {}", slot.number(), path.display());
        }
        Command::Clear { slot, yes } => {
            let slot = slot_arg(*slot)?;
            if !*yes {
                bail!("clearing {} cannot be undone; pass --yes to confirm", slot);
            }
            manager.clear(slot).await?;
            println!("Slot {} cleared successfully", slot.number());
        }
        Command::List | Command::Watch => {}
    }
    Ok(())
}
