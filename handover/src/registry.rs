//! Authoritative table of live identities.
//!
//! The registry owns every [`Identity`] and the `(camera, track) -> global_id`
//! ownership index. It is a plain single-owner structure: callers serialize
//! access (the coordinator runs as the only owner inside one task), so each
//! method call is one transaction and no partial mutation is ever visible.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{HandoverError, Result};
use crate::matcher::{Matcher, Metric, l2_normalize};
use crate::topology::TopologyGraph;
use crate::types::{
    CameraId, Detection, GlobalId, Identity, IdentityState, ImplausibleHandover, Sighting,
    StateEvent, TrackId,
};

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Weight of the previous representative in the embedding EMA.
    pub decay: f32,
    pub idle_timeout_secs: f64,
    pub max_history: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            decay: 0.8,
            idle_timeout_secs: 30.0,
            max_history: 32,
        }
    }
}

/// Owns identities and the ownership index.
pub struct IdentityRegistry {
    cfg: RegistryConfig,
    topology: Arc<TopologyGraph>,
    matcher: Matcher,
    identities: BTreeMap<GlobalId, Identity>,
    owners: HashMap<(CameraId, TrackId), GlobalId>,
    // Tracks that handed their identity on, with the last timestamp they
    // reported. Redelivered detections from them are duplicates.
    released: HashMap<(CameraId, TrackId), (GlobalId, f64)>,
    next_id: u64,
}

impl IdentityRegistry {
    pub fn new(cfg: RegistryConfig, topology: Arc<TopologyGraph>, matcher: Matcher) -> Self {
        Self {
            cfg,
            topology,
            matcher,
            identities: BTreeMap::new(),
            owners: HashMap::new(),
            released: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn topology(&self) -> &TopologyGraph {
        &self.topology
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    /// Identities that could explain `det`, nearest first.
    ///
    /// Only identities owned by `det`'s own camera or by a camera with an
    /// edge into it are considered. Ties on distance go to the most recently
    /// seen identity, then to the lower global id.
    pub fn find_candidates(&self, det: &Detection) -> Vec<(&Identity, f32)> {
        let sources = self.topology.candidate_sources(&det.camera_id);
        let mut out: Vec<(&Identity, f32)> = self
            .identities
            .values()
            .filter(|id| {
                id.state
                    .owner()
                    .is_some_and(|owner| sources.contains(owner))
            })
            .map(|id| {
                let d = self
                    .matcher
                    .score(&det.embedding_vector, &id.representative_embedding);
                (id, d)
            })
            .collect();
        out.sort_by(|(a, da), (b, db)| {
            da.total_cmp(db)
                .then_with(|| b.last_seen_timestamp.total_cmp(&a.last_seen_timestamp))
                .then_with(|| a.global_id.cmp(&b.global_id))
        });
        out
    }

    /// Writes `det` into the registry.
    ///
    /// With `Some(id)` the identity absorbs the detection: its representative
    /// moves toward the observed embedding, and ownership moves to the
    /// detection's `(camera, track)` through the lifecycle state machine.
    /// With `None` a new identity is created under a fresh global id.
    pub fn upsert(&mut self, det: &Detection, target: Option<GlobalId>) -> Result<&Identity> {
        match target {
            Some(gid) => self.absorb(det, gid),
            None => {
                let confidence = det.quality_score.unwrap_or(1.0);
                self.insert_new(det, confidence, None)
            }
        }
    }

    /// Creates a new identity for a detection whose best match was rejected
    /// as an implausible handover. Confidence is scaled by `factor`.
    pub fn upsert_implausible(
        &mut self,
        det: &Detection,
        audit: ImplausibleHandover,
        factor: f32,
    ) -> Result<&Identity> {
        let confidence = det.quality_score.unwrap_or(1.0) * factor;
        self.insert_new(det, confidence, Some(audit))
    }

    /// Removes every identity idle for longer than the timeout at `now`.
    ///
    /// Returns the removed identities in global id order, already moved to
    /// [`IdentityState::Expired`]. Their ids are never handed out again.
    pub fn expire(&mut self, now: f64) -> Vec<Identity> {
        let timeout = self.cfg.idle_timeout_secs;
        let stale: Vec<GlobalId> = self
            .identities
            .values()
            .filter(|id| now - id.last_seen_timestamp > timeout)
            .map(|id| id.global_id)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for gid in stale {
            let Some(mut identity) = self.identities.remove(&gid) else {
                continue;
            };
            let key = (
                identity.owning_camera_id.clone(),
                identity.owning_local_track_id,
            );
            if self.owners.get(&key) == Some(&gid) {
                self.owners.remove(&key);
            }
            self.released.retain(|_, (owner, _)| *owner != gid);
            if let Some(next) = identity.state.transition(&StateEvent::Expire) {
                identity.state = next;
            }
            debug!(global_id = %gid, camera = %key.0, "identity expired");
            removed.push(identity);
        }
        removed
    }

    pub fn get(&self, gid: GlobalId) -> Option<&Identity> {
        self.identities.get(&gid)
    }

    /// The identity currently owned by `(camera, track)`.
    pub fn owner_of(&self, camera: &str, track: TrackId) -> Option<&Identity> {
        let gid = self.owners.get(&(camera.to_string(), track))?;
        self.identities.get(gid)
    }

    /// The identity `(camera, track)` gave up through a handover or
    /// re-acquire, with the last timestamp the track reported before that.
    pub fn released_track(&self, camera: &str, track: TrackId) -> Option<(GlobalId, f64)> {
        self.released.get(&(camera.to_string(), track)).copied()
    }

    /// Session trajectory of an identity, oldest first.
    pub fn trajectory(&self, gid: GlobalId) -> Option<&VecDeque<Sighting>> {
        self.identities.get(&gid).map(|id| &id.history)
    }

    /// Live identities in global id order.
    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.values()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// The id the next created identity will get.
    pub fn next_global_id(&self) -> GlobalId {
        GlobalId(self.next_id)
    }

    /// Drops all identities. The id counter is kept so ids stay unique for
    /// the lifetime of the process.
    pub fn reset(&mut self) {
        self.identities.clear();
        self.owners.clear();
        self.released.clear();
    }

    /// Checks the ownership index against the identity table.
    pub fn verify(&self) -> Result<()> {
        if self.owners.len() != self.identities.len() {
            return Err(violation(format!(
                "{} ownership entries for {} identities",
                self.owners.len(),
                self.identities.len()
            )));
        }
        if let Some(key) = self.released.keys().find(|k| self.owners.contains_key(*k)) {
            return Err(violation(format!(
                "{}/{} is both owned and released",
                key.0, key.1
            )));
        }
        for (gid, id) in &self.identities {
            if *gid != id.global_id || gid.0 >= self.next_id {
                return Err(violation(format!("identity keyed {gid} carries {}", id.global_id)));
            }
            match id.state.owner() {
                Some(cam) if cam == id.owning_camera_id => {}
                _ => {
                    return Err(violation(format!(
                        "{gid} in state {:?} between transactions",
                        id.state
                    )));
                }
            }
            let key = (id.owning_camera_id.clone(), id.owning_local_track_id);
            match self.owners.get(&key) {
                Some(owner) if owner == gid => {}
                other => {
                    return Err(violation(format!(
                        "{gid} owns {}/{} but index points to {:?}",
                        key.0, key.1, other
                    )));
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn owners_mut(&mut self) -> &mut HashMap<(CameraId, TrackId), GlobalId> {
        &mut self.owners
    }

    fn insert_new(
        &mut self,
        det: &Detection,
        confidence: f32,
        audit: Option<ImplausibleHandover>,
    ) -> Result<&Identity> {
        let key = (det.camera_id.clone(), det.local_track_id);
        if let Some(existing) = self.owners.get(&key) {
            return Err(violation(format!(
                "{}/{} already owned by {existing}",
                key.0, key.1
            )));
        }

        let state = IdentityState::Unmatched
            .transition(&StateEvent::Acquire {
                camera: det.camera_id.clone(),
            })
            .ok_or_else(|| violation("cannot acquire unmatched identity".to_string()))?;

        let gid = GlobalId(self.next_id);
        self.next_id += 1;

        let mut representative = det.embedding_vector.clone();
        if self.matcher.metric().normalizes() {
            l2_normalize(&mut representative);
        }

        let mut history = VecDeque::new();
        history.push_back(sighting(det));

        self.released.remove(&key);
        self.owners.insert(key, gid);
        let identity = self.identities.entry(gid).or_insert(Identity {
            global_id: gid,
            owning_camera_id: det.camera_id.clone(),
            owning_local_track_id: det.local_track_id,
            representative_embedding: representative,
            last_seen_timestamp: det.timestamp,
            confidence: confidence.clamp(0.0, 1.0),
            state,
            audit,
            history,
        });
        Ok(&*identity)
    }

    fn absorb(&mut self, det: &Detection, gid: GlobalId) -> Result<&Identity> {
        let new_key = (det.camera_id.clone(), det.local_track_id);
        if let Some(other) = self.owners.get(&new_key) {
            if *other != gid {
                return Err(violation(format!(
                    "{}/{} owned by {other}, cannot assign to {gid}",
                    new_key.0, new_key.1
                )));
            }
        }

        let metric = self.matcher.metric();
        let decay = self.cfg.decay;
        let max_history = self.cfg.max_history;
        let distance = match self.identities.get(&gid) {
            Some(id) => self
                .matcher
                .score(&det.embedding_vector, &id.representative_embedding),
            None => return Err(violation(format!("upsert into missing identity {gid}"))),
        };

        let identity = self
            .identities
            .get_mut(&gid)
            .ok_or_else(|| violation(format!("upsert into missing identity {gid}")))?;

        let old_key = (
            identity.owning_camera_id.clone(),
            identity.owning_local_track_id,
        );
        let old_last_seen = identity.last_seen_timestamp;

        let next = if identity.owning_camera_id == det.camera_id {
            identity.state.transition(&StateEvent::Refresh {
                camera: det.camera_id.clone(),
            })
        } else {
            identity
                .state
                .transition(&StateEvent::BeginHandover {
                    to: det.camera_id.clone(),
                })
                .and_then(|pending| pending.transition(&StateEvent::ConfirmHandover))
        };
        identity.state = match next {
            Some(state) => state,
            None => {
                return Err(violation(format!(
                    "{gid} in state {:?} cannot move to {}",
                    identity.state, det.camera_id
                )));
            }
        };

        for (rep, &obs) in identity
            .representative_embedding
            .iter_mut()
            .zip(det.embedding_vector.iter())
        {
            *rep = decay * *rep + (1.0 - decay) * obs;
        }
        if metric.normalizes() {
            l2_normalize(&mut identity.representative_embedding);
        }

        let observed = det.quality_score.unwrap_or(1.0) * similarity(metric, distance);
        identity.confidence =
            (decay * identity.confidence + (1.0 - decay) * observed).clamp(0.0, 1.0);
        identity.last_seen_timestamp = identity.last_seen_timestamp.max(det.timestamp);
        identity.owning_camera_id = det.camera_id.clone();
        identity.owning_local_track_id = det.local_track_id;
        identity.history.push_back(sighting(det));
        while identity.history.len() > max_history.max(1) {
            identity.history.pop_front();
        }

        if old_key != new_key {
            match self.owners.remove(&old_key) {
                Some(prev) if prev == gid => {}
                prev => {
                    error!(global_id = %gid, ?prev, "ownership index out of sync");
                    return Err(violation(format!(
                        "{gid} owned {}/{} but index held {:?}",
                        old_key.0, old_key.1, prev
                    )));
                }
            }
            self.released.remove(&new_key);
            self.released.insert(old_key, (gid, old_last_seen));
            self.owners.insert(new_key, gid);
        }

        self.identities
            .get(&gid)
            .ok_or_else(|| violation(format!("identity {gid} vanished")))
    }
}

/// Maps a distance to a [0, 1] similarity used for confidence.
fn similarity(metric: Metric, distance: f32) -> f32 {
    match metric {
        Metric::Cosine => (1.0 - distance).clamp(0.0, 1.0),
        Metric::Euclidean => 1.0 / (1.0 + distance.max(0.0)),
    }
}

fn sighting(det: &Detection) -> Sighting {
    Sighting {
        camera_id: det.camera_id.clone(),
        local_track_id: det.local_track_id,
        timestamp: det.timestamp,
        bounding_region: det.bounding_region,
    }
}

fn violation(msg: String) -> HandoverError {
    HandoverError::RegistryInvariantViolation(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::Metric;
    use crate::topology::TransitionWindow;
    use crate::types::BoundingRegion;

    fn registry() -> IdentityRegistry {
        let topo = TopologyGraph::builder()
            .camera("a")
            .camera("b")
            .camera("c")
            .edge("a", "b", Some(TransitionWindow::new(1.0, 10.0)))
            .edge("b", "c", None)
            .build()
            .unwrap();
        IdentityRegistry::new(
            RegistryConfig {
                decay: 0.5,
                idle_timeout_secs: 30.0,
                max_history: 3,
            },
            Arc::new(topo),
            Matcher::new(Metric::Cosine, 0.2),
        )
    }

    fn det(cam: &str, track: TrackId, t: f64, emb: &[f32]) -> Detection {
        Detection {
            camera_id: cam.into(),
            local_track_id: track,
            timestamp: t,
            bounding_region: BoundingRegion::default(),
            embedding_vector: emb.to_vec(),
            quality_score: None,
        }
    }

    #[test]
    fn upsert_none_allocates_monotonic_ids() {
        let mut reg = registry();
        let a = reg.upsert(&det("a", 1, 0.0, &[1.0, 0.0]), None).unwrap().global_id;
        let b = reg.upsert(&det("a", 2, 0.0, &[0.0, 1.0]), None).unwrap().global_id;
        assert_eq!(a, GlobalId(0));
        assert_eq!(b, GlobalId(1));
        assert_eq!(reg.len(), 2);
        reg.verify().unwrap();
    }

    #[test]
    fn candidates_restricted_to_adjacent_and_self() {
        let mut reg = registry();
        reg.upsert(&det("a", 1, 0.0, &[1.0, 0.0]), None).unwrap();
        reg.upsert(&det("c", 1, 0.0, &[1.0, 0.0]), None).unwrap();

        // From b both a and c are sources.
        assert_eq!(reg.find_candidates(&det("b", 1, 1.0, &[1.0, 0.0])).len(), 2);
        // From a, c is not adjacent.
        let cands = reg.find_candidates(&det("a", 9, 1.0, &[1.0, 0.0]));
        assert_eq!(cands.len(), 1);
        assert_eq!(cands[0].0.owning_camera_id, "a");
    }

    #[test]
    fn candidates_ordered_by_distance_then_recency() {
        let mut reg = registry();
        reg.upsert(&det("a", 1, 1.0, &[1.0, 0.0]), None).unwrap(); // T0, older
        reg.upsert(&det("a", 2, 5.0, &[1.0, 0.0]), None).unwrap(); // T1, newer
        reg.upsert(&det("a", 3, 9.0, &[0.0, 1.0]), None).unwrap(); // T2, far

        let cands = reg.find_candidates(&det("b", 1, 6.0, &[1.0, 0.0]));
        let ids: Vec<GlobalId> = cands.iter().map(|(i, _)| i.global_id).collect();
        assert_eq!(ids, vec![GlobalId(1), GlobalId(0), GlobalId(2)]);
        assert!(cands[0].1 < 1e-6);
    }

    #[test]
    fn absorb_moves_ownership_and_updates_ema() {
        let mut reg = registry();
        let gid = reg.upsert(&det("a", 1, 0.0, &[1.0, 0.0]), None).unwrap().global_id;

        let id = reg.upsert(&det("b", 7, 5.0, &[0.0, 1.0]), Some(gid)).unwrap();
        assert_eq!(id.global_id, gid);
        assert_eq!(id.owning_camera_id, "b");
        assert_eq!(id.owning_local_track_id, 7);
        assert_eq!(id.state, IdentityState::Owned { camera: "b".into() });
        assert_eq!(id.last_seen_timestamp, 5.0);
        // 0.5 * [1,0] + 0.5 * [0,1], normalized.
        let r = &id.representative_embedding;
        assert!((r[0] - r[1]).abs() < 1e-6);
        assert!((r[0] - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);

        assert!(reg.owner_of("a", 1).is_none());
        assert_eq!(reg.owner_of("b", 7).unwrap().global_id, gid);
        reg.verify().unwrap();
    }

    #[test]
    fn upsert_into_claimed_pair_is_violation() {
        let mut reg = registry();
        let first = reg.upsert(&det("a", 1, 0.0, &[1.0, 0.0]), None).unwrap().global_id;
        let second = reg.upsert(&det("a", 2, 0.0, &[0.0, 1.0]), None).unwrap().global_id;
        assert_ne!(first, second);

        let err = reg.upsert(&det("a", 1, 1.0, &[0.0, 1.0]), Some(second)).unwrap_err();
        assert!(err.is_fatal());

        let err = reg.upsert(&det("a", 1, 1.0, &[0.0, 1.0]), None).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn expire_removes_idle_and_never_reuses_ids() {
        let mut reg = registry();
        reg.upsert(&det("a", 1, 0.0, &[1.0, 0.0]), None).unwrap();
        reg.upsert(&det("a", 2, 20.0, &[0.0, 1.0]), None).unwrap();

        let gone = reg.expire(31.0);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].global_id, GlobalId(0));
        assert_eq!(gone[0].state, IdentityState::Expired);
        assert!(reg.get(GlobalId(0)).is_none());
        assert!(reg.owner_of("a", 1).is_none());
        reg.verify().unwrap();

        let gid = reg.upsert(&det("a", 1, 32.0, &[1.0, 0.0]), None).unwrap().global_id;
        assert_eq!(gid, GlobalId(2));
    }

    #[test]
    fn handed_off_track_is_remembered_until_expiry() {
        let mut reg = registry();
        let gid = reg.upsert(&det("a", 1, 2.0, &[1.0, 0.0]), None).unwrap().global_id;
        reg.upsert(&det("b", 7, 5.0, &[1.0, 0.0]), Some(gid)).unwrap();

        assert_eq!(reg.released_track("a", 1), Some((gid, 2.0)));
        assert_eq!(reg.released_track("b", 7), None);
        reg.verify().unwrap();

        // Taking the track back clears the release.
        reg.upsert(&det("a", 1, 8.0, &[1.0, 0.0]), Some(gid)).unwrap();
        assert_eq!(reg.released_track("a", 1), None);
        assert_eq!(reg.released_track("b", 7), Some((gid, 5.0)));

        reg.expire(100.0);
        assert_eq!(reg.released_track("b", 7), None);
        reg.verify().unwrap();
    }

    #[test]
    fn reset_keeps_counter() {
        let mut reg = registry();
        reg.upsert(&det("a", 1, 0.0, &[1.0, 0.0]), None).unwrap();
        reg.reset();
        assert!(reg.is_empty());
        assert_eq!(reg.next_global_id(), GlobalId(1));
        reg.verify().unwrap();
    }

    #[test]
    fn trajectory_is_bounded() {
        let mut reg = registry();
        let gid = reg.upsert(&det("a", 1, 0.0, &[1.0, 0.0]), None).unwrap().global_id;
        for t in 1..6 {
            reg.upsert(&det("a", 1, t as f64, &[1.0, 0.0]), Some(gid)).unwrap();
        }
        let traj = reg.trajectory(gid).unwrap();
        assert_eq!(traj.len(), 3);
        assert_eq!(traj.front().unwrap().timestamp, 3.0);
        assert_eq!(traj.back().unwrap().timestamp, 5.0);
    }

    #[test]
    fn implausible_identity_carries_audit() {
        let mut reg = registry();
        let audit = ImplausibleHandover {
            candidate: GlobalId(0),
            from_camera: "a".into(),
            elapsed: 20.0,
        };
        let mut d = det("b", 1, 20.0, &[1.0, 0.0]);
        d.quality_score = Some(0.8);
        let id = reg.upsert_implausible(&d, audit.clone(), 0.5).unwrap();
        assert_eq!(id.audit.as_ref(), Some(&audit));
        assert!((id.confidence - 0.4).abs() < 1e-6);
    }
}
