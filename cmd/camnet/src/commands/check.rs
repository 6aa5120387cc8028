//! Configuration validation.

use anyhow::{Context, Result};
use clap::Args;

use camnet_handover::TopologyGraph;

use super::load_config;
use crate::Cli;

#[derive(Args)]
pub struct CheckCommand {
    /// Cameras to add to the configured topology (comma-separated)
    #[arg(long, value_delimiter = ',')]
    cameras: Vec<String>,
}

impl CheckCommand {
    pub fn run(&self, cli: &Cli) -> Result<()> {
        let cfg = load_config(cli)?;
        let topology =
            TopologyGraph::from_config(&cfg.topology, &self.cameras).context("build topology")?;

        println!("embedding_dim:   {}", cfg.embedding_dim);
        println!("metric:          {:?}", cfg.metric);
        println!("match_threshold: {}", cfg.match_threshold);
        for p in &cfg.pair_thresholds {
            println!("  {} <-> {}: {}", p.cameras[0], p.cameras[1], p.threshold);
        }
        println!("idle_timeout:    {}s", cfg.idle_timeout_secs);
        println!("bus:             {}", cfg.bus.url);
        println!();
        println!("cameras ({}):", topology.len());
        for camera in topology.cameras() {
            println!("  {camera}");
        }
        println!("edges:");
        for (from, to, window) in topology.edges() {
            match window {
                Some(w) => println!("  {from} -> {to} [{}s, {}s]", w.min_secs, w.max_secs),
                None => println!("  {from} -> {to}"),
            }
        }
        if topology.is_empty() {
            println!("warning: no cameras configured; every detection will be rejected");
        }
        Ok(())
    }
}
