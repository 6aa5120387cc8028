//! Offline replay of a detection log.
//!
//! Detections are decided in file order, `--batch` at a time. Expiry runs
//! on detection time: once per sweep interval, measured against the latest
//! timestamp seen. Output events go to stdout as JSON lines, the final
//! counters to stderr.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use camnet_handover::{Coordinator, Detection, OutboundEvent, Stats, TopologyGraph};

use super::load_config;
use crate::Cli;

#[derive(Args)]
pub struct ReplayCommand {
    /// Detection log, one JSON detection per line (`-` for stdin)
    file: String,

    /// Cameras to add to the configured topology (comma-separated)
    #[arg(long, value_delimiter = ',')]
    cameras: Vec<String>,

    /// Detections decided together as one batch
    #[arg(long, default_value_t = 1)]
    batch: usize,
}

struct Replay<W> {
    coordinator: Coordinator,
    sweep_secs: f64,
    next_sweep: Option<f64>,
    out: W,
}

impl<W: Write> Replay<W> {
    fn decide(&mut self, batch: Vec<Detection>) -> Result<()> {
        let outcome = self.coordinator.process_batch(batch)?;
        self.emit(&outcome.events)?;

        let Some(now) = self.coordinator.latest_timestamp() else {
            return Ok(());
        };
        let due = *self.next_sweep.get_or_insert(now + self.sweep_secs);
        if now >= due {
            let expired = self.coordinator.expire(now)?;
            self.emit(&expired)?;
            self.next_sweep = Some(now + self.sweep_secs);
        }
        Ok(())
    }

    fn emit(&mut self, events: &[OutboundEvent]) -> Result<()> {
        for event in events {
            serde_json::to_writer(&mut self.out, event)?;
            writeln!(self.out)?;
        }
        Ok(())
    }
}

impl ReplayCommand {
    pub fn run(&self, cli: &Cli) -> Result<()> {
        let cfg = load_config(cli)?;
        let topology = Arc::new(
            TopologyGraph::from_config(&cfg.topology, &self.cameras).context("build topology")?,
        );
        let stats = Arc::new(Stats::new());

        let reader: Box<dyn BufRead> = if self.file == "-" {
            Box::new(io::stdin().lock())
        } else {
            let file = File::open(&self.file).with_context(|| format!("open {}", self.file))?;
            Box::new(BufReader::new(file))
        };

        let mut replay = Replay {
            coordinator: Coordinator::new(&cfg, topology, stats.clone()),
            sweep_secs: cfg.sweep_interval().as_secs_f64(),
            next_sweep: None,
            out: io::stdout().lock(),
        };

        let batch_size = self.batch.max(1);
        let mut pending = Vec::with_capacity(batch_size);
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match serde_json::from_str::<Detection>(line) {
                Ok(det) => pending.push(det),
                Err(e) => {
                    stats.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(line = n + 1, error = %e, "undecodable detection");
                    continue;
                }
            }
            if pending.len() >= batch_size {
                replay.decide(std::mem::take(&mut pending))?;
            }
        }
        if !pending.is_empty() {
            replay.decide(pending)?;
        }
        replay.out.flush()?;

        let summary = serde_json::json!({
            "stats": stats.snapshot(),
            "identities": replay.coordinator.registry().len(),
            "next_global_id": replay.coordinator.registry().next_global_id(),
        });
        eprintln!("{summary}");
        info!("replay finished");
        Ok(())
    }
}
