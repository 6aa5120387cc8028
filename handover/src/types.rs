//! Wire and registry data model.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{HandoverError, Result};

/// Camera identifier, stable across the session.
pub type CameraId = String;

/// Per-camera local track identifier.
pub type TrackId = u64;

/// Globally unique, monotonically assigned identity number.
///
/// Never reused within a process, not even after the identity expires
/// or the registry is reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalId(pub u64);

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Axis-aligned rectangle in camera-local pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingRegion {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A single observation of a subject in one camera frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub camera_id: CameraId,
    pub local_track_id: TrackId,
    /// Seconds on the producer's monotonic clock.
    pub timestamp: f64,
    #[serde(default)]
    pub bounding_region: BoundingRegion,
    pub embedding_vector: Vec<f32>,
    /// Detector confidence in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,
}

impl Detection {
    /// Checks the shape of the detection against the system-wide
    /// embedding dimension. Camera membership is checked by the topology.
    pub fn validate(&self, dim: usize) -> Result<()> {
        if self.camera_id.is_empty() {
            return Err(HandoverError::MalformedDetection(
                "empty camera_id".to_string(),
            ));
        }
        if self.embedding_vector.len() != dim {
            return Err(HandoverError::MalformedDetection(format!(
                "embedding length: expected {}, got {}",
                dim,
                self.embedding_vector.len()
            )));
        }
        if self.embedding_vector.iter().any(|v| !v.is_finite()) {
            return Err(HandoverError::MalformedDetection(
                "embedding contains non-finite values".to_string(),
            ));
        }
        if !self.timestamp.is_finite() {
            return Err(HandoverError::MalformedDetection(format!(
                "timestamp is not finite: {}",
                self.timestamp
            )));
        }
        if let Some(q) = self.quality_score {
            if !(0.0..=1.0).contains(&q) {
                return Err(HandoverError::MalformedDetection(format!(
                    "quality_score out of range: {q}"
                )));
            }
        }
        let r = &self.bounding_region;
        if !(r.x.is_finite() && r.y.is_finite() && r.width >= 0.0 && r.height >= 0.0) {
            return Err(HandoverError::MalformedDetection(format!(
                "bad bounding region: {r:?}"
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IdentityState {
    /// Created but not yet credited to any camera.
    Unmatched,
    /// Actively tracked by `camera`.
    Owned { camera: CameraId },
    /// Ownership is moving between cameras. Only observable inside a
    /// registry transaction.
    HandoverPending { from: CameraId, to: CameraId },
    /// Idle timeout elapsed. Terminal.
    Expired,
}

/// Input to the identity state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    Acquire { camera: CameraId },
    Refresh { camera: CameraId },
    BeginHandover { to: CameraId },
    ConfirmHandover,
    Expire,
}

impl IdentityState {
    /// Applies an event. Returns `None` for transitions the lifecycle does
    /// not allow.
    pub fn transition(&self, event: &StateEvent) -> Option<IdentityState> {
        use IdentityState::*;
        match (self, event) {
            (Expired, _) => None,
            (_, StateEvent::Expire) => Some(Expired),
            (Unmatched, StateEvent::Acquire { camera }) => Some(Owned {
                camera: camera.clone(),
            }),
            (Owned { camera }, StateEvent::Refresh { camera: at }) if camera == at => {
                Some(self.clone())
            }
            (Owned { camera }, StateEvent::BeginHandover { to }) if camera != to => {
                Some(HandoverPending {
                    from: camera.clone(),
                    to: to.clone(),
                })
            }
            (HandoverPending { to, .. }, StateEvent::ConfirmHandover) => Some(Owned {
                camera: to.clone(),
            }),
            _ => None,
        }
    }

    /// Returns the owning camera when the state is `Owned`.
    pub fn owner(&self) -> Option<&str> {
        match self {
            IdentityState::Owned { camera } => Some(camera),
            _ => None,
        }
    }
}

/// One entry of an identity's session trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub camera_id: CameraId,
    pub local_track_id: TrackId,
    pub timestamp: f64,
    pub bounding_region: BoundingRegion,
}

/// Audit note for an identity born from a handover that fell outside the
/// configured transition window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImplausibleHandover {
    /// The identity the detection matched best.
    pub candidate: GlobalId,
    pub from_camera: CameraId,
    /// Seconds since the candidate was last seen at `from_camera`.
    pub elapsed: f64,
}

/// The registry's belief about one real-world subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub global_id: GlobalId,
    pub owning_camera_id: CameraId,
    pub owning_local_track_id: TrackId,
    pub representative_embedding: Vec<f32>,
    pub last_seen_timestamp: f64,
    /// Belief strength in [0, 1].
    pub confidence: f32,
    pub state: IdentityState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit: Option<ImplausibleHandover>,
    /// Session-only trajectory, oldest first, bounded.
    #[serde(default)]
    pub history: VecDeque<Sighting>,
}

/// Why a handover was confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandoverReason {
    /// Elapsed time fell inside the edge's transition window.
    WithinWindow { elapsed: f64, min: f64, max: f64 },
    /// The edge has no window; adjacency alone suffices.
    Adjacent { elapsed: f64 },
}

/// Confirmed transfer of ownership, published on `handovers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoverDecision {
    pub global_id: GlobalId,
    pub from_camera: CameraId,
    pub to_camera: CameraId,
    pub timestamp: f64,
    pub reason: HandoverReason,
    /// Embedding distance of the winning match.
    pub distance: f32,
}

/// Identity state change, published on `assignments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub global_id: GlobalId,
    pub camera_id: CameraId,
    pub local_track_id: TrackId,
    pub state: IdentityState,
    pub timestamp: f64,
    pub confidence: f32,
}

impl Assignment {
    pub(crate) fn of(identity: &Identity, timestamp: f64) -> Self {
        Self {
            global_id: identity.global_id,
            camera_id: identity.owning_camera_id.clone(),
            local_track_id: identity.owning_local_track_id,
            state: identity.state.clone(),
            timestamp,
            confidence: identity.confidence,
        }
    }
}

/// Anything the coordinator emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    Assignment(Assignment),
    Handover(HandoverDecision),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(len: usize) -> Detection {
        Detection {
            camera_id: "cam_a".into(),
            local_track_id: 1,
            timestamp: 0.0,
            bounding_region: BoundingRegion::default(),
            embedding_vector: vec![0.5; len],
            quality_score: None,
        }
    }

    #[test]
    fn validate_accepts_well_formed() {
        assert!(det(4).validate(4).is_ok());
    }

    #[test]
    fn validate_rejects_wrong_length() {
        let err = det(3).validate(4).unwrap_err();
        assert!(matches!(err, HandoverError::MalformedDetection(_)));
    }

    #[test]
    fn validate_rejects_nan_and_bad_quality() {
        let mut d = det(2);
        d.embedding_vector[1] = f32::NAN;
        assert!(d.validate(2).is_err());

        let mut d = det(2);
        d.quality_score = Some(1.5);
        assert!(d.validate(2).is_err());

        let mut d = det(2);
        d.timestamp = f64::INFINITY;
        assert!(d.validate(2).is_err());
    }

    #[test]
    fn lifecycle_happy_path() {
        let s = IdentityState::Unmatched;
        let s = s
            .transition(&StateEvent::Acquire { camera: "a".into() })
            .unwrap();
        assert_eq!(s.owner(), Some("a"));

        let s = s.transition(&StateEvent::Refresh { camera: "a".into() }).unwrap();
        let s = s
            .transition(&StateEvent::BeginHandover { to: "b".into() })
            .unwrap();
        assert_eq!(
            s,
            IdentityState::HandoverPending {
                from: "a".into(),
                to: "b".into()
            }
        );
        assert_eq!(s.owner(), None);

        let s = s.transition(&StateEvent::ConfirmHandover).unwrap();
        assert_eq!(s.owner(), Some("b"));

        let s = s.transition(&StateEvent::Expire).unwrap();
        assert_eq!(s, IdentityState::Expired);
    }

    #[test]
    fn lifecycle_rejects_invalid() {
        let owned = IdentityState::Owned { camera: "a".into() };
        assert!(owned.transition(&StateEvent::Refresh { camera: "b".into() }).is_none());
        assert!(owned.transition(&StateEvent::BeginHandover { to: "a".into() }).is_none());
        assert!(owned.transition(&StateEvent::ConfirmHandover).is_none());
        assert!(IdentityState::Expired.transition(&StateEvent::Expire).is_none());
        assert!(IdentityState::Unmatched
            .transition(&StateEvent::Refresh { camera: "a".into() })
            .is_none());
    }

    #[test]
    fn outbound_event_json_shape() {
        let ev = OutboundEvent::Assignment(Assignment {
            global_id: GlobalId(7),
            camera_id: "cam_a".into(),
            local_track_id: 3,
            state: IdentityState::Owned { camera: "cam_a".into() },
            timestamp: 1.5,
            confidence: 0.9,
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "assignment");
        assert_eq!(v["global_id"], 7);
        assert_eq!(v["state"]["kind"], "owned");
        assert_eq!(v["state"]["camera"], "cam_a");
    }

    #[test]
    fn detection_quality_optional_on_wire() {
        let raw = r#"{"camera_id":"c","local_track_id":1,"timestamp":2.0,"embedding_vector":[1.0,0.0]}"#;
        let d: Detection = serde_json::from_str(raw).unwrap();
        assert_eq!(d.quality_score, None);
        assert_eq!(d.bounding_region, BoundingRegion::default());
    }
}
