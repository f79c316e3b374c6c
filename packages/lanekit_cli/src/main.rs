//! lanekit-cli — drive simulated feed sessions and inspect layouts
//!
//! `simulate` runs a scripted tool-change session against the mock backend,
//! printing machine transitions as they happen. `layout` resolves the
//! physical print-head arrangement for the configured scenario and prints it
//! as JSON.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::debug;

use lanekit::backend::mock::{MockBackend, SimulationSpeed};
use lanekit::backend::{FeedBackend, FeedError};
use lanekit::config::{create_backend, RuntimeConfig};
use lanekit::machine::{MachineEvent, ToolChangeMachine};
use lanekit::topology::{PhysicalLayout, ToolId};

#[derive(Parser)]
#[command(name = "lanekit", about = "Multi-material feed control console")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scripted change/load/unload session against the mock backend
    Simulate {
        /// Number of simulated lanes
        #[arg(long, default_value_t = 4)]
        lanes: usize,

        /// Simulate a hub unit (all lanes share one nozzle) instead of a
        /// tool changer
        #[arg(long)]
        hub: bool,

        /// Tools to change through, in order
        #[arg(long, value_delimiter = ',', default_value = "0,1,2")]
        tools: Vec<u32>,

        /// Divide all simulated operation durations by this factor
        #[arg(long, default_value_t = 20.0)]
        speedup: f64,

        /// Unload at the end of the session
        #[arg(long)]
        unload: bool,
    },
    /// Resolve and print the physical layout for the configured scenario
    Layout,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    match Cli::parse().command {
        Command::Simulate {
            lanes,
            hub,
            tools,
            speedup,
            unload,
        } => simulate(lanes, hub, tools, speedup, unload).await,
        Command::Layout => layout(),
    }
}

async fn simulate(
    lanes: usize,
    hub: bool,
    tools: Vec<u32>,
    speedup: f64,
    unload: bool,
) -> Result<()> {
    let speed = SimulationSpeed::new(speedup);
    let backend: Arc<MockBackend> = Arc::new(if hub {
        MockBackend::hub(lanes, speed)
    } else {
        MockBackend::tool_changer(lanes, speed)
    });
    backend.start().await?;

    let resolved = PhysicalLayout::resolve(&backend.topology());
    println!(
        "{} lanes, {} physical nozzle position(s), speedup {speedup}x",
        backend.topology().lanes.len(),
        resolved.physical_tool_count()
    );

    let machine = ToolChangeMachine::new(backend.clone());
    let mut events = machine.subscribe();

    for tool in tools {
        match machine.change_tool(ToolId(tool)).await {
            Ok(seq) => drain_until_finished(&machine, &backend, &mut events, seq).await,
            Err(error) => println!("T{tool}: rejected: {error}"),
        }
    }

    if unload {
        match machine.unload_filament().await {
            Ok(seq) => drain_until_finished(&machine, &backend, &mut events, seq).await,
            Err(error @ FeedError::NothingMounted) => println!("unload: {error}"),
            Err(error) => println!("unload: rejected: {error}"),
        }
    }

    println!(
        "session done, mounted: {}",
        machine.mounted_lane().unwrap_or_else(|| "none".into())
    );
    Ok(())
}

/// Print machine transitions until the operation with `seq` finishes.
async fn drain_until_finished(
    machine: &ToolChangeMachine,
    backend: &Arc<MockBackend>,
    events: &mut tokio::sync::broadcast::Receiver<MachineEvent>,
    seq: u64,
) {
    loop {
        match events.recv().await {
            Ok(MachineEvent::StateChanged(state)) => {
                println!("  #{seq} {state:?} (filament at {:?})", backend.path_segment());
            }
            Ok(MachineEvent::OperationFinished {
                seq: done,
                outcome,
            }) if done == seq => {
                match outcome {
                    Ok(()) => println!(
                        "  #{seq} done, mounted: {}",
                        machine.mounted_lane().unwrap_or_else(|| "none".into())
                    ),
                    Err(message) => println!("  #{seq} FAILED: {message}"),
                }
                return;
            }
            Ok(_) => {}
            Err(error) => {
                debug!("event stream ended: {error}");
                return;
            }
        }
    }
}

fn layout() -> Result<()> {
    let config = RuntimeConfig::from_env();
    let backend = create_backend(&config, None)?;
    let resolved = PhysicalLayout::resolve(&backend.topology());
    println!("{}", serde_json::to_string_pretty(&resolved)?);
    Ok(())
}
