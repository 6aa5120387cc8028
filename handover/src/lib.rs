//! Cross-camera identity handover.
//!
//! Each camera tracks people locally and publishes [`Detection`]s carrying
//! an appearance embedding. The coordinator keeps one [`Identity`] per
//! real-world subject and decides, per detection, whether it continues an
//! existing identity (same track, re-acquired track, or a handover from an
//! adjacent camera) or starts a new one.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use camnet_handover::{DetectionSource, HandoverConfig, MqttBus, Service, TopologyGraph};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> camnet_handover::Result<()> {
//! let cfg = HandoverConfig::load("camnet.yaml".as_ref())?;
//! let topology = Arc::new(TopologyGraph::from_config(&cfg.topology, &[])?);
//! let service = Service::new(cfg.clone(), topology.clone());
//!
//! let cameras: Vec<String> = topology.cameras().map(String::from).collect();
//! let (bus, sources) = MqttBus::connect(&cfg.bus, &cameras, cfg.channel_capacity, service.stats())?;
//! let sources: Vec<Box<dyn DetectionSource>> = sources
//!     .into_iter()
//!     .map(|s| Box::new(s) as Box<dyn DetectionSource>)
//!     .collect();
//!
//! let report = service.run(sources, Arc::new(bus.sink()), CancellationToken::new()).await?;
//! println!("{:?}", report.stats);
//! # Ok(())
//! # }
//! ```
//!
//! # Design
//!
//! The registry is owned by a single decision task; camera workers only
//! forward detections. Every decision is one transaction on the registry
//! followed by an invariant check, and an inconsistent registry is cleared
//! and reported as fatal instead of being repaired in place.

pub mod bus;
mod config;
mod coordinator;
mod error;
mod matcher;
mod registry;
mod service;
mod stats;
mod topology;
mod types;

pub use bus::memory::{MemoryPublisher, MemorySink, MemorySource};
pub use bus::mqtt::{MqttBus, MqttSink, MqttSource};
pub use bus::{DetectionSource, EventSink};
pub use config::{BusConfig, EdgeConfig, HandoverConfig, PairThreshold, TopologyConfig};
pub use coordinator::{BatchOutcome, Coordinator, Decision, Outcome};
pub use error::{HandoverError, Result};
pub use matcher::{Matcher, Metric, cosine_distance, euclidean_distance, is_match};
pub use registry::{IdentityRegistry, RegistryConfig};
pub use service::{Service, ServiceReport};
pub use stats::{Stats, StatsSnapshot};
pub use topology::{TopologyBuilder, TopologyGraph, TransitionWindow};
pub use types::{
    Assignment, BoundingRegion, CameraId, Detection, GlobalId, HandoverDecision, HandoverReason,
    Identity, IdentityState, ImplausibleHandover, OutboundEvent, Sighting, StateEvent, TrackId,
};
