use anyhow::Context;
use embassy_executor::{Executor, Spawner};
use env_logger::Builder;
use log::{LevelFilter, info};
use std::sync::mpsc;
use std::thread;

use rf_medium_simulator::common::config::load_config;
use rf_medium_simulator::gateway::UdpTransport;
use rf_medium_simulator::messages::InterruptSignal;
use rf_medium_simulator::simulator::Simulator;

const USAGE: &str = "usage: rf-medium-simulator <config> [--bind ADDR] [--no-wait]";
const DEFAULT_BIND: &str = "127.0.0.1:7400";

struct Args {
    config: String,
    bind: String,
    wait_for_all: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut config = None;
    let mut bind = DEFAULT_BIND.to_string();
    let mut wait_for_all = true;
    while let Some(arg) = args.next() {
        if arg == "--bind" {
            bind = args.next().with_context(|| format!("--bind needs an address\n{}", USAGE))?;
        } else if arg == "--no-wait" {
            wait_for_all = false;
        } else if arg == "-h" || arg == "--help" {
            anyhow::bail!(USAGE);
        } else if arg.starts_with('-') {
            anyhow::bail!("unknown option {}\n{}", arg, USAGE);
        } else if config.is_none() {
            config = Some(arg);
        } else {
            anyhow::bail!("unexpected argument {}\n{}", arg, USAGE);
        }
    }
    Ok(Args {
        config: config.context(USAGE)?,
        bind,
        wait_for_all,
    })
}

async fn drive(spawner: Spawner, simulator: &mut Simulator, wait_for_all: bool) -> anyhow::Result<()> {
    simulator.spawn_services(spawner)?;
    simulator.setup(wait_for_all).await?;
    simulator.run().await?;
    Ok(())
}

#[embassy_executor::task]
async fn simulation_task(spawner: Spawner, mut simulator: Simulator, wait_for_all: bool, done: mpsc::Sender<anyhow::Result<()>>) {
    let result = drive(spawner, &mut simulator, wait_for_all).await;
    simulator.close().await;
    if done.send(result).is_err() {
        log::error!("Main thread is gone, simulation result lost");
    }
}

fn embassy_init(spawner: Spawner, simulator: Simulator, wait_for_all: bool, done: mpsc::Sender<anyhow::Result<()>>) {
    if let Err(e) = spawner.spawn(simulation_task(spawner, simulator, wait_for_all, done)) {
        log::error!("Failed to spawn simulation task: {:?}", e);
    }
}

fn main() -> anyhow::Result<()> {
    // Logging setup
    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter(Some("rf_medium_simulator"), LevelFilter::Debug)
        .parse_default_env()
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    info!("Starting up with {}", args.config);

    let config = load_config(&args.config).with_context(|| format!("Failed to load config {}", args.config))?;

    // INTENTIONAL LEAK: the signal is shared with the Ctrl-C handler and the engine.
    let interrupt: &'static InterruptSignal = Box::leak(Box::new(InterruptSignal::new()));
    ctrlc::set_handler(move || {
        log::warn!("Interrupt received");
        interrupt.signal(());
    })
    .context("Error setting Ctrl-C handler")?;

    let simulator = Simulator::new(&config, interrupt)?;
    let transport = UdpTransport::bind(&args.bind)?;
    let channels = simulator.transport();
    transport.spawn(channels.frames_in, channels.frames_out)?;

    let (done_tx, done_rx) = mpsc::channel();
    let wait_for_all = args.wait_for_all;

    // Spawn Embassy executor on a dedicated background thread
    thread::Builder::new()
        .name("embassy-executor".to_string())
        .spawn(move || {
            // Leak the executor to satisfy the 'static lifetime required by run()
            let executor: &'static mut Executor = Box::leak(Box::new(Executor::new()));
            executor.run(|spawner| embassy_init(spawner, simulator, wait_for_all, done_tx));
        })
        .context("Failed to spawn embassy thread")?;

    let result = done_rx.recv().context("Simulation thread stopped unexpectedly")?;
    match &result {
        Ok(()) => info!("Simulation finished"),
        Err(e) => log::error!("Simulation failed: {:#}", e),
    }
    result
}
