//! The handover decision path.
//!
//! One [`Coordinator`] owns the [`IdentityRegistry`]. Every detection is one
//! transaction: read candidates, decide, write, verify. Per-detection errors
//! leave the registry untouched; an invariant violation clears the registry
//! and is returned to the caller as fatal.
//!
//! Decision order for a detection at camera `C` with track `T`:
//!
//! 1. `(C, T)` already owns an identity: refresh it (or drop the detection
//!    as a duplicate if it is not newer than the identity's last sighting).
//! 2. `(C, T)` handed its identity on earlier and the detection is not newer
//!    than the last one it reported: drop it as a redelivered duplicate.
//! 3. Otherwise take the nearest candidate from `C` or a camera adjacent to
//!    `C` that passes its pair threshold and was not last seen after the
//!    detection:
//!    - none: create a new identity at `C`;
//!    - owned at `C`: re-acquire under the same global id;
//!    - owned at `C'`: hand over if the elapsed time fits the `C' -> C`
//!      window (or no window is configured), else create a new identity at
//!      reduced confidence with an audit note.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::HandoverConfig;
use crate::error::{HandoverError, Result};
use crate::matcher::is_match;
use crate::registry::{IdentityRegistry, RegistryConfig};
use crate::stats::{Stats, StatsSnapshot};
use crate::topology::TopologyGraph;
use crate::types::{
    Assignment, CameraId, Detection, GlobalId, HandoverDecision, HandoverReason,
    ImplausibleHandover, OutboundEvent,
};

/// What a detection did to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Not newer than the identity's last sighting on the same track.
    Duplicate { global_id: GlobalId },
    /// Same track seen again.
    Refreshed { global_id: GlobalId },
    /// No plausible candidate; new identity.
    Created { global_id: GlobalId },
    /// New track at the owning camera picked up an existing identity.
    Reacquired { global_id: GlobalId },
    /// Ownership moved between cameras.
    HandedOver {
        global_id: GlobalId,
        from: CameraId,
    },
    /// Best match was too far off in time; new identity instead.
    Implausible {
        global_id: GlobalId,
        candidate: GlobalId,
    },
    /// Best match was already claimed by another camera earlier in the batch.
    Contested {
        global_id: GlobalId,
        claimed: GlobalId,
    },
}

impl Decision {
    pub fn global_id(&self) -> GlobalId {
        match self {
            Decision::Duplicate { global_id }
            | Decision::Refreshed { global_id }
            | Decision::Created { global_id }
            | Decision::Reacquired { global_id }
            | Decision::HandedOver { global_id, .. }
            | Decision::Implausible { global_id, .. }
            | Decision::Contested { global_id, .. } => *global_id,
        }
    }
}

/// Result of one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub decision: Decision,
    pub events: Vec<OutboundEvent>,
}

/// Result of a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub decisions: Vec<Decision>,
    pub events: Vec<OutboundEvent>,
    /// Detections dropped as malformed or from unknown cameras.
    pub rejected: usize,
}

/// Identities touched by a camera within the current batch.
#[derive(Debug, Default)]
struct Claims {
    by: HashMap<GlobalId, CameraId>,
}

impl Claims {
    fn contested(&self, gid: GlobalId, camera: &str) -> bool {
        self.by.get(&gid).is_some_and(|c| c != camera)
    }

    fn claim(&mut self, gid: GlobalId, camera: &str) {
        self.by.entry(gid).or_insert_with(|| camera.to_string());
    }
}

/// Serialized decision function over the identity registry.
pub struct Coordinator {
    registry: IdentityRegistry,
    dim: usize,
    implausible_confidence: f32,
    stats: Arc<Stats>,
    latest_timestamp: Option<f64>,
}

impl Coordinator {
    pub fn new(cfg: &HandoverConfig, topology: Arc<TopologyGraph>, stats: Arc<Stats>) -> Self {
        let registry = IdentityRegistry::new(
            RegistryConfig {
                decay: cfg.decay,
                idle_timeout_secs: cfg.idle_timeout_secs,
                max_history: cfg.max_history,
            },
            topology,
            cfg.matcher(),
        );
        Self {
            registry,
            dim: cfg.embedding_dim,
            implausible_confidence: cfg.implausible_confidence,
            stats,
            latest_timestamp: None,
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Highest detection timestamp accepted so far.
    pub fn latest_timestamp(&self) -> Option<f64> {
        self.latest_timestamp
    }

    /// Decides a single detection.
    pub fn process(&mut self, det: &Detection) -> Result<Outcome> {
        self.transact(det, &mut Claims::default())
    }

    /// Decides a batch of detections in timestamp order.
    ///
    /// When detections from different cameras both match the same identity,
    /// the earlier one wins and the later one becomes a new identity. Plain
    /// refreshes of an owned track do not claim anything, so batching never
    /// changes the outcome for them. Per-detection errors are logged,
    /// counted and skipped; only a fatal error aborts the batch.
    pub fn process_batch(&mut self, mut batch: Vec<Detection>) -> Result<BatchOutcome> {
        batch.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        let mut claims = Claims::default();
        let mut out = BatchOutcome::default();
        for det in &batch {
            match self.transact(det, &mut claims) {
                Ok(outcome) => {
                    out.decisions.push(outcome.decision);
                    out.events.extend(outcome.events);
                }
                Err(e) if e.is_per_detection() => out.rejected += 1,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Expires idle identities at `now`, returning one `Expired` assignment
    /// per removed identity.
    pub fn expire(&mut self, now: f64) -> Result<Vec<OutboundEvent>> {
        let removed = self.registry.expire(now);
        Stats::add(&self.stats.expired, removed.len() as u64);
        if let Err(e) = self.registry.verify() {
            return Err(self.fatal(e));
        }
        Ok(removed
            .iter()
            .map(|id| OutboundEvent::Assignment(Assignment::of(id, now)))
            .collect())
    }

    fn transact(&mut self, det: &Detection, claims: &mut Claims) -> Result<Outcome> {
        Stats::bump(&self.stats.received);
        if let Err(e) = self.admit(det) {
            match &e {
                HandoverError::UnknownCamera(_) => Stats::bump(&self.stats.unknown_camera),
                _ => Stats::bump(&self.stats.malformed),
            }
            warn!(camera = %det.camera_id, track = det.local_track_id, error = %e, "detection rejected");
            return Err(e);
        }

        let outcome = match self.decide(det, claims) {
            Ok(outcome) => outcome,
            Err(e) if e.is_fatal() => return Err(self.fatal(e)),
            Err(e) => return Err(e),
        };
        if let Err(e) = self.registry.verify() {
            return Err(self.fatal(e));
        }

        self.latest_timestamp = Some(
            self.latest_timestamp
                .map_or(det.timestamp, |t| t.max(det.timestamp)),
        );
        Ok(outcome)
    }

    fn admit(&self, det: &Detection) -> Result<()> {
        det.validate(self.dim)?;
        if !self.registry.topology().contains(&det.camera_id) {
            return Err(HandoverError::UnknownCamera(det.camera_id.clone()));
        }
        Ok(())
    }

    fn fatal(&mut self, e: HandoverError) -> HandoverError {
        error!(error = %e, identities = self.registry.len(), "registry corrupted, resetting");
        Stats::bump(&self.stats.invariant_violations);
        self.registry.reset();
        e
    }

    fn decide(&mut self, det: &Detection, claims: &mut Claims) -> Result<Outcome> {
        let camera = det.camera_id.as_str();

        if let Some(owned) = self.registry.owner_of(camera, det.local_track_id) {
            let gid = owned.global_id;
            if det.timestamp <= owned.last_seen_timestamp {
                Stats::bump(&self.stats.duplicates);
                debug!(global_id = %gid, camera, track = det.local_track_id, "duplicate detection");
                return Ok(Outcome {
                    decision: Decision::Duplicate { global_id: gid },
                    events: Vec::new(),
                });
            }
            self.registry.upsert(det, Some(gid))?;
            Stats::bump(&self.stats.refreshed);
            debug!(global_id = %gid, camera, track = det.local_track_id, "refreshed");
            return Ok(Outcome {
                decision: Decision::Refreshed { global_id: gid },
                events: Vec::new(),
            });
        }

        if let Some((gid, last_ts)) = self.registry.released_track(camera, det.local_track_id) {
            if det.timestamp <= last_ts {
                Stats::bump(&self.stats.duplicates);
                debug!(
                    global_id = %gid,
                    camera,
                    track = det.local_track_id,
                    "redelivered detection from released track"
                );
                return Ok(Outcome {
                    decision: Decision::Duplicate { global_id: gid },
                    events: Vec::new(),
                });
            }
        }

        // A subject cannot arrive at `camera` before it was last seen at
        // another camera, so such candidates are not handover sources.
        let best = {
            let matcher = self.registry.matcher();
            self.registry
                .find_candidates(det)
                .into_iter()
                .filter(|(id, _)| {
                    id.owning_camera_id == camera || det.timestamp >= id.last_seen_timestamp
                })
                .find(|(id, d)| is_match(*d, matcher.threshold_for(&id.owning_camera_id, camera)))
                .map(|(id, d)| {
                    (
                        id.global_id,
                        id.owning_camera_id.clone(),
                        id.last_seen_timestamp,
                        d,
                    )
                })
        };

        let Some((candidate, owner, last_seen, distance)) = best else {
            return self.create(det);
        };

        if claims.contested(candidate, camera) {
            let id = self.registry.upsert(det, None)?;
            let gid = id.global_id;
            let events = vec![OutboundEvent::Assignment(Assignment::of(id, det.timestamp))];
            claims.claim(gid, camera);
            Stats::bump(&self.stats.batch_conflicts);
            Stats::bump(&self.stats.created);
            info!(global_id = %gid, claimed = %candidate, camera, "contested match, new identity");
            return Ok(Outcome {
                decision: Decision::Contested {
                    global_id: gid,
                    claimed: candidate,
                },
                events,
            });
        }

        if owner == camera {
            let id = self.registry.upsert(det, Some(candidate))?;
            let events = vec![OutboundEvent::Assignment(Assignment::of(id, det.timestamp))];
            claims.claim(candidate, camera);
            Stats::bump(&self.stats.reacquired);
            info!(global_id = %candidate, camera, track = det.local_track_id, "re-acquired");
            return Ok(Outcome {
                decision: Decision::Reacquired {
                    global_id: candidate,
                },
                events,
            });
        }

        let elapsed = det.timestamp - last_seen;
        let window = self.registry.topology().transition_window(&owner, camera);
        let reason = match window {
            None => HandoverReason::Adjacent { elapsed },
            Some(w) if w.contains(elapsed) => HandoverReason::WithinWindow {
                elapsed,
                min: w.min_secs,
                max: w.max_secs,
            },
            Some(w) => {
                let audit = ImplausibleHandover {
                    candidate,
                    from_camera: owner.clone(),
                    elapsed,
                };
                let id = self
                    .registry
                    .upsert_implausible(det, audit, self.implausible_confidence)?;
                let gid = id.global_id;
                let events = vec![OutboundEvent::Assignment(Assignment::of(id, det.timestamp))];
                claims.claim(gid, camera);
                Stats::bump(&self.stats.implausible_handovers);
                Stats::bump(&self.stats.created);
                info!(
                    global_id = %gid,
                    candidate = %candidate,
                    from = %owner,
                    to = camera,
                    elapsed,
                    window_min = w.min_secs,
                    window_max = w.max_secs,
                    "handover outside transition window, new identity"
                );
                return Ok(Outcome {
                    decision: Decision::Implausible {
                        global_id: gid,
                        candidate,
                    },
                    events,
                });
            }
        };

        let id = self.registry.upsert(det, Some(candidate))?;
        let decision = HandoverDecision {
            global_id: candidate,
            from_camera: owner.clone(),
            to_camera: camera.to_string(),
            timestamp: det.timestamp,
            reason,
            distance,
        };
        let events = vec![
            OutboundEvent::Handover(decision),
            OutboundEvent::Assignment(Assignment::of(id, det.timestamp)),
        ];
        claims.claim(candidate, camera);
        Stats::bump(&self.stats.handovers);
        info!(global_id = %candidate, from = %owner, to = camera, elapsed, distance, "handover");
        Ok(Outcome {
            decision: Decision::HandedOver {
                global_id: candidate,
                from: owner,
            },
            events,
        })
    }

    fn create(&mut self, det: &Detection) -> Result<Outcome> {
        let id = self.registry.upsert(det, None)?;
        let gid = id.global_id;
        let events = vec![OutboundEvent::Assignment(Assignment::of(id, det.timestamp))];
        Stats::bump(&self.stats.created);
        info!(global_id = %gid, camera = %det.camera_id, track = det.local_track_id, "new identity");
        Ok(Outcome {
            decision: Decision::Created { global_id: gid },
            events,
        })
    }
}
