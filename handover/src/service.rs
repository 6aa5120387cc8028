//! Async runtime around the [`Coordinator`].
//!
//! One worker task per camera pulls from its [`DetectionSource`] and feeds a
//! bounded channel. A single decision task owns the coordinator, so the
//! registry is never shared: it drains whatever is queued into a batch,
//! decides it, publishes the resulting events and runs the expiry sweep on
//! a timer.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{Backoff, DetectionSource, EventSink};
use crate::config::HandoverConfig;
use crate::coordinator::Coordinator;
use crate::error::{HandoverError, Result};
use crate::stats::{Stats, StatsSnapshot};
use crate::topology::TopologyGraph;
use crate::types::{Detection, OutboundEvent};

/// Summary returned when the service stops cleanly.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceReport {
    pub stats: StatsSnapshot,
    /// Identities alive at shutdown.
    pub identities: usize,
}

/// Session time for the expiry sweep.
///
/// Detection timestamps come from the producers' clock. Between
/// detections the clock advances with local monotonic time from the moment
/// the latest timestamp was observed.
#[derive(Debug, Default)]
struct SessionClock {
    anchor: Option<(f64, Instant)>,
}

impl SessionClock {
    fn observe(&mut self, ts: Option<f64>) {
        let Some(ts) = ts else { return };
        match self.anchor {
            Some((seen, _)) if seen >= ts => {}
            _ => self.anchor = Some((ts, Instant::now())),
        }
    }

    fn now(&self) -> Option<f64> {
        self.anchor
            .map(|(ts, at)| ts + at.elapsed().as_secs_f64())
    }
}

pub struct Service {
    cfg: HandoverConfig,
    topology: Arc<TopologyGraph>,
    stats: Arc<Stats>,
}

impl Service {
    pub fn new(cfg: HandoverConfig, topology: Arc<TopologyGraph>) -> Self {
        Self::with_stats(cfg, topology, Arc::new(Stats::new()))
    }

    /// Shares counters with other components, e.g. the MQTT router.
    pub fn with_stats(cfg: HandoverConfig, topology: Arc<TopologyGraph>, stats: Arc<Stats>) -> Self {
        Self {
            cfg,
            topology,
            stats,
        }
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Runs until `cancel` fires or every source ends.
    ///
    /// Returns `RegistryInvariantViolation` if the registry was found
    /// inconsistent. The registry has been cleared and all workers stopped
    /// by then.
    pub async fn run(
        &self,
        sources: Vec<Box<dyn DetectionSource>>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<ServiceReport> {
        let workers_cancel = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<Detection>(self.cfg.channel_capacity);

        let mut workers = JoinSet::new();
        for source in sources {
            if !self.topology.contains(source.camera_id()) {
                warn!(camera = source.camera_id(), "source for camera outside the topology");
            }
            let backoff = Backoff::new(self.cfg.bus.retry_initial(), self.cfg.bus.retry_max());
            workers.spawn(camera_worker(
                source,
                tx.clone(),
                workers_cancel.clone(),
                self.stats.clone(),
                backoff,
            ));
        }
        drop(tx);

        let mut coordinator = Coordinator::new(&self.cfg, self.topology.clone(), self.stats.clone());
        let mut clock = SessionClock::default();
        let mut sweep = tokio::time::interval(self.cfg.sweep_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let max_batch = self.cfg.max_batch;

        info!(
            cameras = self.topology.len(),
            workers = workers.len(),
            "handover service started"
        );

        let result: Result<()> = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    break Ok(());
                }
                first = rx.recv() => {
                    let Some(first) = first else {
                        info!("all detection sources ended");
                        break Ok(());
                    };
                    let mut batch = vec![first];
                    while batch.len() < max_batch {
                        match rx.try_recv() {
                            Ok(det) => batch.push(det),
                            Err(_) => break,
                        }
                    }
                    match coordinator.process_batch(batch) {
                        Ok(outcome) => {
                            clock.observe(coordinator.latest_timestamp());
                            self.publish(sink.as_ref(), &outcome.events).await;
                        }
                        Err(e) => break Err(e),
                    }
                }
                _ = sweep.tick() => {
                    let Some(now) = clock.now() else { continue };
                    match coordinator.expire(now) {
                        Ok(events) => self.publish(sink.as_ref(), &events).await,
                        Err(e) => break Err(e),
                    }
                    debug!(stats = ?self.stats.snapshot(), identities = coordinator.registry().len(), "sweep");
                }
            }
        };

        workers_cancel.cancel();
        drop(rx);
        while workers.join_next().await.is_some() {}

        let report = ServiceReport {
            stats: self.stats.snapshot(),
            identities: coordinator.registry().len(),
        };
        match result {
            Ok(()) => {
                info!(stats = ?report.stats, identities = report.identities, "handover service stopped");
                Ok(report)
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, sink: &dyn EventSink, events: &[OutboundEvent]) {
        for event in events {
            if let Err(e) = sink.publish(event).await {
                Stats::bump(&self.stats.transport_errors);
                warn!(error = %e, "event publish failed");
            }
        }
    }
}

async fn camera_worker(
    mut source: Box<dyn DetectionSource>,
    tx: mpsc::Sender<Detection>,
    cancel: CancellationToken,
    stats: Arc<Stats>,
    mut backoff: Backoff,
) {
    let camera = source.camera_id().to_string();
    debug!(%camera, "camera worker started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = source.next_detection() => next,
        };
        match next {
            Ok(Some(det)) => {
                backoff.reset();
                if tx.send(det).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                debug!(%camera, "detection stream ended");
                break;
            }
            Err(HandoverError::TransportUnavailable(reason)) => {
                Stats::bump(&stats.transport_errors);
                let delay = backoff.next_delay();
                warn!(%camera, %reason, retry_in = ?delay, "detection stream unavailable");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                if matches!(e, HandoverError::MalformedDetection(_)) {
                    Stats::bump(&stats.malformed);
                }
                warn!(%camera, error = %e, "detection dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn clock_advances_from_latest_timestamp() {
        let mut clock = SessionClock::default();
        assert_eq!(clock.now(), None);

        clock.observe(Some(100.0));
        tokio::time::advance(Duration::from_secs(3)).await;
        let now = clock.now().unwrap();
        assert!((now - 103.0).abs() < 1e-6);

        // Older timestamps do not move the anchor.
        clock.observe(Some(50.0));
        assert!((clock.now().unwrap() - 103.0).abs() < 1e-6);

        clock.observe(Some(200.0));
        assert!((clock.now().unwrap() - 200.0).abs() < 1e-6);
    }
}
