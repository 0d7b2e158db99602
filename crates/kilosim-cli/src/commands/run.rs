//! `kilosim run` — build a system from a config file and simulate it.

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;

use kilosim_core::config::Config;
use kilosim_core::sim::Simulator;

pub fn run(config_path: &Path, json: bool) -> Result<()> {
    let cfg = Config::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let sim = Simulator::from_config(&cfg).context("building the simulated system")?;

    let started = Instant::now();
    let summary = sim.run();
    let wall = started.elapsed();

    info!(
        "finished in {:.2}s host time ({:.0} simulated instrs/s)",
        wall.as_secs_f64(),
        summary.instrs as f64 / wall.as_secs_f64().max(1e-9)
    );
    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!("phases:     {}", summary.phases);
        println!("instrs:     {}", summary.instrs);
        println!("max cycle:  {}", summary.max_core_cycle);
    }
    Ok(())
}
