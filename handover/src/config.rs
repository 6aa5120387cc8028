//! Coordinator configuration.
//!
//! Loaded from YAML or JSON (picked by file extension). Every field has a
//! default, so an empty file is a valid configuration.
//!
//! ```yaml
//! embedding_dim: 512
//! match_threshold: 0.35
//! pair_thresholds:
//!   - cameras: [lobby, hall]
//!     threshold: 0.45
//! idle_timeout_secs: 30
//! topology:
//!   cameras: [lobby, hall, garage]
//!   edges:
//!     - from: lobby
//!       to: hall
//!       window: { min_secs: 1, max_secs: 10 }
//!     - from: hall
//!       to: garage
//! bus:
//!   url: mqtt://127.0.0.1:1883
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HandoverError, Result};
use crate::matcher::{Matcher, Metric};
use crate::topology::TransitionWindow;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoverConfig {
    /// System-wide embedding length.
    pub embedding_dim: usize,

    pub metric: Metric,

    /// Maximum distance for a match. Lower = stricter (more new identities).
    pub match_threshold: f32,

    /// Threshold overrides per unordered camera pair.
    pub pair_thresholds: Vec<PairThreshold>,

    /// Identities not refreshed for this long are expired.
    pub idle_timeout_secs: f64,

    /// Period of the expiry sweep.
    pub sweep_interval_ms: u64,

    /// Weight of the previous representative in the embedding EMA:
    /// `rep = decay * rep + (1 - decay) * observed`.
    pub decay: f32,

    /// Confidence multiplier for identities created because the best match
    /// fell outside its transition window.
    pub implausible_confidence: f32,

    /// Trajectory entries kept per identity.
    pub max_history: usize,

    /// Upper bound on detections decided as one batch.
    pub max_batch: usize,

    /// Capacity of the worker -> decision channel.
    pub channel_capacity: usize,

    pub topology: TopologyConfig,

    pub bus: BusConfig,
}

impl Default for HandoverConfig {
    fn default() -> Self {
        Self {
            embedding_dim: 512,
            metric: Metric::Cosine,
            match_threshold: 0.35,
            pair_thresholds: Vec::new(),
            idle_timeout_secs: 30.0,
            sweep_interval_ms: 1000,
            decay: 0.8,
            implausible_confidence: 0.5,
            max_history: 32,
            max_batch: 64,
            channel_capacity: 256,
            topology: TopologyConfig::default(),
            bus: BusConfig::default(),
        }
    }
}

/// Threshold for one camera pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairThreshold {
    pub cameras: [String; 2],
    pub threshold: f32,
}

/// Topology as written in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub cameras: Vec<String>,
    pub edges: Vec<EdgeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    pub from: String,
    pub to: String,
    /// One-way edge. Edges are bidirectional by default.
    #[serde(default)]
    pub directed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<TransitionWindow>,
}

/// Message bus connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker address, `mqtt://[user:pass@]host:port`.
    pub url: String,
    /// Client id; a random one is generated when empty.
    pub client_id: String,
    pub keep_alive_secs: u16,
    /// First reconnect delay; doubles on each consecutive failure.
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://127.0.0.1:1883".to_string(),
            client_id: String::new(),
            keep_alive_secs: 20,
            retry_initial_ms: 200,
            retry_max_ms: 10_000,
        }
    }
}

impl BusConfig {
    pub fn retry_initial(&self) -> Duration {
        Duration::from_millis(self.retry_initial_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

impl HandoverConfig {
    /// Loads configuration from a `.yaml`, `.yml` or `.json` file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)?;
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        let cfg: HandoverConfig = match ext {
            "json" => serde_json::from_slice(&data)?,
            "yaml" | "yml" => serde_yaml::from_slice(&data)?,
            _ => {
                return Err(HandoverError::InvalidConfig(format!(
                    "unsupported config extension: {}",
                    path.display()
                )));
            }
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the coordinator cannot run with.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(HandoverError::InvalidConfig(msg));

        if self.embedding_dim == 0 {
            return bad("embedding_dim must be positive".into());
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            return bad(format!("match_threshold: {}", self.match_threshold));
        }
        for p in &self.pair_thresholds {
            if !p.threshold.is_finite() || p.threshold < 0.0 {
                return bad(format!(
                    "pair threshold {}/{}: {}",
                    p.cameras[0], p.cameras[1], p.threshold
                ));
            }
        }
        if !(self.idle_timeout_secs.is_finite() && self.idle_timeout_secs > 0.0) {
            return bad(format!("idle_timeout_secs: {}", self.idle_timeout_secs));
        }
        if self.sweep_interval_ms == 0 {
            return bad("sweep_interval_ms must be positive".into());
        }
        if !(0.0..1.0).contains(&self.decay) {
            return bad(format!("decay must be in [0, 1): {}", self.decay));
        }
        if !(0.0..=1.0).contains(&self.implausible_confidence) {
            return bad(format!(
                "implausible_confidence must be in [0, 1]: {}",
                self.implausible_confidence
            ));
        }
        if self.max_batch == 0 || self.channel_capacity == 0 {
            return bad("max_batch and channel_capacity must be positive".into());
        }
        if self.bus.retry_initial_ms == 0 || self.bus.retry_max_ms < self.bus.retry_initial_ms {
            return bad(format!(
                "bus retry: initial {}ms, max {}ms",
                self.bus.retry_initial_ms, self.bus.retry_max_ms
            ));
        }
        Ok(())
    }

    /// Builds the matcher described by this configuration.
    pub fn matcher(&self) -> Matcher {
        self.pair_thresholds
            .iter()
            .fold(Matcher::new(self.metric, self.match_threshold), |m, p| {
                m.with_pair_threshold(&p.cameras[0], &p.cameras[1], p.threshold)
            })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}
