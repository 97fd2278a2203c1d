use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use netsim_simulator::SimulationReport;
use netsim_simulator::scenario_runner::{self, load_scenario};

#[derive(Parser, Debug)]
#[command(author, version, about = "Headless packet-level network simulator")]
struct Args {
    /// Scenario file (TOML) describing topology, flows and assertions.
    #[arg(long)]
    scenario: PathBuf,

    /// Write a JSON trace of the finished simulation.
    #[arg(long)]
    trace_out: Option<PathBuf>,

    /// Override the scenario's random seed.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();
    info!("netsim starting…");

    let mut scenario = load_scenario(&args.scenario)?;
    if let Some(seed) = args.seed {
        scenario.config.seed = Some(seed);
    }
    let report = scenario_runner::run(&scenario)
        .with_context(|| format!("Scenario '{}' failed", scenario.name))?;
    log_summary(&report);

    if let Some(trace_path) = &args.trace_out {
        write_trace(trace_path, &report)?;
        info!("Trace written to {}", trace_path.display());
    }

    Ok(())
}

fn log_summary(report: &SimulationReport) {
    info!("Simulated {:.3} ms", report.duration_ms);
    for flow in &report.flows {
        info!(
            "{} from {} to {} ({:?}): {}, {}/{} bytes acked, {} retransmissions{}",
            flow.flow,
            flow.host,
            flow.destination,
            flow.algorithm,
            flow.status,
            flow.acked_bytes,
            flow.data_bytes,
            flow.retransmissions,
            match flow.completion_ms {
                Some(ms) => format!(", done in {ms:.1} ms"),
                None if flow.stalled => ", stalled".to_string(),
                None => String::new(),
            }
        );
    }
    for link in &report.links {
        let [ab, ba] = &link.directions;
        info!(
            "{} {} <-> {}: delivered {}/{} packets, lost {}/{}, overflow {}/{}",
            link.link,
            link.ends[0],
            link.ends[1],
            ab.delivered_packets,
            ba.delivered_packets,
            ab.lost_packets,
            ba.lost_packets,
            ab.overflow_drops,
            ba.overflow_drops
        );
    }
    if report.events_dropped > 0 {
        info!("{} events did not fit in the event log", report.events_dropped);
    }
}

fn write_trace(path: &Path, report: &SimulationReport) -> Result<()> {
    let data = serde_json::to_vec_pretty(report).context("Failed to serialize simulation trace")?;
    fs::write(path, &data)
        .with_context(|| format!("Failed to write trace file {}", path.display()))?;
    Ok(())
}
