//! MPLS domain simulator binary.
//!
//! Loads a scenario (or the built-in three-router line), runs it for the
//! configured number of ticks, either on the calling thread or with one tokio
//! task per node, and prints per-node counters plus a summary of every event
//! the nodes reported.

use anyhow::{Context, Result};
use clap::Parser;
use mplsim_node::{ChannelEventSink, DiscardReason, Runtime, SimEvent, Simulation};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;
mod summary;

use config::ScenarioConfig;
use logging::SimLogFormatter;
use summary::EventSummary;

/// Discrete-event MPLS domain simulator
#[derive(Parser, Debug)]
#[command(name = "mplsim", version, about = "Discrete-event MPLS domain simulator")]
struct Args {
    /// Scenario file (YAML); the built-in three-router line when omitted
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Tick length, e.g. 10us
    #[arg(long)]
    tick: Option<humantime::Duration>,

    /// Simulated time to run, e.g. 20ms
    #[arg(long)]
    duration: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run every node in its own task
    #[arg(long)]
    actors: bool,

    /// Write every event as a JSON line to this file
    #[arg(long)]
    events: Option<PathBuf>,

    /// Print the resolved scenario and exit
    #[arg(long)]
    dump_config: bool,
}

fn init_logging(level: &str) -> Result<()> {
    let mut env_filter = EnvFilter::new("warn");
    for target in [
        "mplsim",
        "mplsim_node",
        "mplsim_topology",
        "mplsim_switching",
        "mplsim_storage",
        "mplsim_wire",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(SimLogFormatter::new("mplsim"))
        .init();
    Ok(())
}

fn resolve_config(args: &Args) -> Result<ScenarioConfig> {
    let mut config = match &args.scenario {
        Some(path) => ScenarioConfig::load_from_file(path)?,
        None => {
            info!("No scenario given, using the built-in line");
            ScenarioConfig::default()
        }
    };
    config.apply_environment_overrides();

    if let Some(tick) = args.tick {
        config.simulation.tick_ns = u64::try_from(tick.as_nanos()).context("tick too long")?;
    }
    if let Some(duration) = args.duration {
        let duration_ns = u64::try_from(duration.as_nanos()).context("duration too long")?;
        config.simulation.steps = duration_ns.div_ceil(config.simulation.tick_ns.max(1));
    }
    Ok(config)
}

/// Drain the event channel, optionally mirroring it to a JSON-lines file
fn spawn_collector(
    mut events: mpsc::UnboundedReceiver<SimEvent>,
    output: Option<PathBuf>,
) -> JoinHandle<Result<EventSummary>> {
    tokio::spawn(async move {
        let mut writer = match output {
            Some(path) => {
                let file = tokio::fs::File::create(&path)
                    .await
                    .with_context(|| format!("creating {}", path.display()))?;
                Some(tokio::io::BufWriter::new(file))
            }
            None => None,
        };

        let mut summary = EventSummary::default();
        while let Some(event) = events.recv().await {
            summary.record(&event);
            if let Some(writer) = writer.as_mut() {
                let mut line = serde_json::to_vec(&event)?;
                line.push(b'\n');
                writer.write_all(&line).await?;
            }
        }
        if let Some(mut writer) = writer {
            writer.flush().await?;
        }
        Ok(summary)
    })
}

async fn run(sim: Simulation, steps: u64, actors: bool) -> Result<Simulation> {
    if actors {
        component_info!("runtime", "Running {} ticks with one task per node", steps);
        let mut runtime = Runtime::start(sim);
        let outcome = runtime.run(steps).await;
        let sim = runtime.shutdown().await?;
        outcome?;
        Ok(sim)
    } else {
        component_info!("runtime", "Running {} ticks sequentially", steps);
        tokio::task::spawn_blocking(move || -> Result<Simulation> {
            let mut sim = sim;
            sim.run(steps)?;
            Ok(sim)
        })
        .await?
    }
}

fn print_nodes(sim: &Simulation) {
    println!("nodes at {} ns", sim.now_ns());
    for node in sim.nodes() {
        if let Some(router) = node.as_router() {
            let stats = router.stats();
            println!(
                "  {:<16} {:<10} routed {:>8} sent {:>8} discarded {:>8} entries {:>4}",
                node.name(),
                node.role().to_string(),
                stats.routed,
                stats.sent,
                stats.discarded,
                router.matrix().len()
            );
        } else if let Some(receiver) = node.as_receiver() {
            let stats = receiver.stats();
            println!(
                "  {:<16} {:<10} packets {:>7} bytes {:>10}",
                node.name(),
                node.role().to_string(),
                stats.packets,
                stats.bytes
            );
        }
    }
    for link in sim.topology().links() {
        if link.is_broken() {
            component_warn!("topology", "Link {} ended the run broken", link.name);
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = std::env::var("MPLSIM_LOG_LEVEL").unwrap_or_else(|_| args.log_level.clone());
    init_logging(&log_level)?;

    info!("Starting mplsim v{}", env!("CARGO_PKG_VERSION"));

    let config = resolve_config(&args)?;
    if args.dump_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let (sink, events) = ChannelEventSink::channel();
    let collector = spawn_collector(events, args.events.clone());

    let sim = config.build(Arc::new(sink))?;
    component_info!(
        "scenario",
        "{} nodes, {} links, tick {} ns",
        sim.nodes().count(),
        sim.topology().links().len(),
        sim.tick_ns()
    );

    let sim = run(sim, config.simulation.steps, args.actors).await?;
    print_nodes(&sim);

    // the collector stops once the last sink handle is gone
    drop(sim);
    let summary = collector.await??;
    println!("{}", summary);
    let overflows = summary.discarded_for(DiscardReason::BufferOverflow);
    if overflows > 0 {
        component_warn!("scenario", "{} packets overflowed port buffers", overflows);
    }
    if let Some(path) = &args.events {
        component_info!("events", "Wrote {} events to {}", summary.events, path.display());
    }
    Ok(())
}
