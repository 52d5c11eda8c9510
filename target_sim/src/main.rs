extern crate canopy_core;
extern crate canopy_hal;

use canopy_core::{cfg::DaemonConfig,
                  conditional::{self, ConditionalBus},
                  core::{channel_manager::ChannelManager, event::Event},
                  daemon::Daemon,
                  driver::registry::DriverRegistry,
                  input::ControllerServices,
                  io::{self, OutputBus},
                  persistence::{self, JsonLinesStore, PersistenceBus},
                  trace::{self, trace_helper::TraceHelper},
                  util::clock::SystemClock};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};

mod sim;

/// Runs the acquisition daemon against simulated hardware.
#[derive(Parser, Debug)]
#[command(name = "canopy-sim", version, long_about = None)]
struct Args
{
    /// Daemon configuration (JSON)
    #[arg(short, long, default_value = "canopy.json")]
    config: PathBuf,

    /// Log filter, overrides the configured level
    #[arg(short, long)]
    log_level: Option<String>
}

fn main() -> Result<(), Box<dyn std::error::Error>>
{
    let args = Args::parse();
    let config = DaemonConfig::load(&args.config)?;
    trace::init(args.log_level.as_deref().unwrap_or(&config.log_level));
    let tracer = TraceHelper::new("SYS/Sim".to_string());

    let chm = ChannelManager::new();
    let output_thread = io::launch(&chm, Box::new(sim::LoggingOutputs::new()))?;
    let store_thread = persistence::launch(&chm, Box::new(JsonLinesStore::new(&config.store_path)))?;
    let action_thread = conditional::launch_action_log(&chm)?;

    let mut registry = DriverRegistry::new();
    sim::register(&mut registry);

    let services = ControllerServices {
        outputs: Arc::new(OutputBus::new(&chm)),
        sink: Arc::new(PersistenceBus::new(&chm)),
        actions: Arc::new(ConditionalBus::new(&chm)),
        clock: Arc::new(SystemClock)
    };
    let mut daemon = Daemon::from_file(&args.config, registry, services, &chm)?;
    tracer.info(format!("Running inputs: {:?}", daemon.running_inputs()));

    let stop = Event::new();
    let stop_handler = stop.clone();
    ctrlc::set_handler(move || stop_handler.trigger())?;
    stop.wait();

    tracer.info("Shutdown signal received");
    daemon.shutdown();
    for handle in vec![output_thread, store_thread, action_thread]
    {
        let _ = handle.join();
    }
    Ok(())
}
