//! Live coordination over MQTT.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use camnet_handover::{DetectionSource, MqttBus, Service, Stats, TopologyGraph};

use super::{load_config, parse_source};
use crate::Cli;

#[derive(Args)]
pub struct RunCommand {
    /// Camera sources, `id=uri` or a bare uri (named camera_<index>)
    #[arg(default_value = "0")]
    sources: Vec<String>,

    /// Broker address, overrides bus.url
    #[arg(long)]
    broker: Option<String>,
}

impl RunCommand {
    pub async fn run(&self, cli: &Cli) -> Result<()> {
        let mut cfg = load_config(cli)?;
        if let Some(broker) = &self.broker {
            cfg.bus.url = broker.clone();
        }

        let sources: Vec<_> = self
            .sources
            .iter()
            .enumerate()
            .map(|(i, s)| parse_source(i, s))
            .collect();
        for s in &sources {
            info!(camera = %s.id, uri = %s.uri, "camera source");
        }
        let ids: Vec<String> = sources.iter().map(|s| s.id.clone()).collect();

        let topology = Arc::new(
            TopologyGraph::from_config(&cfg.topology, &ids).context("build topology")?,
        );
        let cameras: Vec<String> = topology.cameras().map(String::from).collect();

        let stats = Arc::new(Stats::new());
        let (bus, streams) = MqttBus::connect(&cfg.bus, &cameras, cfg.channel_capacity, stats.clone())
            .context("connect bus")?;
        let service = Service::with_stats(cfg.clone(), topology, stats);
        let streams: Vec<Box<dyn DetectionSource>> = streams
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn DetectionSource>)
            .collect();

        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                on_signal.cancel();
            }
        });

        info!(broker = %cfg.bus.url, cameras = cameras.len(), "coordinator running");
        let result = service.run(streams, Arc::new(bus.sink()), cancel).await;

        if let Err(e) = bus.close().await {
            warn!(error = %e, "bus close");
        }

        let report = result.context("handover service")?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
