//! Transport-agnostic message bus seams.
//!
//! The coordinator consumes one ordered [`DetectionSource`] per camera and
//! emits [`OutboundEvent`]s into an [`EventSink`]. Two implementations ship:
//! [`memory`] (tokio channels, for tests and embedding) and [`mqtt`]
//! (rumqttc).
//!
//! Topics:
//!
//! | Topic                  | Direction | Payload                 |
//! |------------------------|-----------|-------------------------|
//! | `detections/<camera>`  | in        | [`Detection`] JSON      |
//! | `assignments`          | out       | [`Assignment`] JSON     |
//! | `handovers`            | out       | [`HandoverDecision`] JSON |
//!
//! [`Assignment`]: crate::types::Assignment
//! [`HandoverDecision`]: crate::types::HandoverDecision

pub mod memory;
pub mod mqtt;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{HandoverError, Result};
use crate::types::{Detection, OutboundEvent};

/// Prefix of per-camera inbound topics.
pub const DETECTIONS_PREFIX: &str = "detections";
/// Subscription filter covering every camera.
pub const DETECTIONS_FILTER: &str = "detections/+";
pub const ASSIGNMENTS_TOPIC: &str = "assignments";
pub const HANDOVERS_TOPIC: &str = "handovers";

/// Inbound topic for one camera.
pub fn detection_topic(camera: &str) -> String {
    format!("{DETECTIONS_PREFIX}/{camera}")
}

/// Extracts the camera id from `detections/<camera>`.
pub fn camera_from_topic(topic: &str) -> Option<&str> {
    let camera = topic.strip_prefix(DETECTIONS_PREFIX)?.strip_prefix('/')?;
    if camera.is_empty() || camera.contains('/') {
        return None;
    }
    Some(camera)
}

/// Outbound topic for an event.
pub fn event_topic(event: &OutboundEvent) -> &'static str {
    match event {
        OutboundEvent::Assignment(_) => ASSIGNMENTS_TOPIC,
        OutboundEvent::Handover(_) => HANDOVERS_TOPIC,
    }
}

/// JSON payload for an event. The topic already carries the event type, so
/// the inner message is encoded without the enum tag.
pub fn encode_event(event: &OutboundEvent) -> Result<Vec<u8>> {
    let bytes = match event {
        OutboundEvent::Assignment(a) => serde_json::to_vec(a)?,
        OutboundEvent::Handover(h) => serde_json::to_vec(h)?,
    };
    Ok(bytes)
}

/// Decodes a detection received on `camera`'s topic.
pub fn decode_detection(camera: &str, payload: &[u8]) -> Result<Detection> {
    let det: Detection = serde_json::from_slice(payload)
        .map_err(|e| HandoverError::MalformedDetection(format!("decode: {e}")))?;
    if det.camera_id != camera {
        return Err(HandoverError::MalformedDetection(format!(
            "camera_id {} received on stream for {}",
            det.camera_id, camera
        )));
    }
    Ok(det)
}

/// Exponential reconnect delay, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Ordered stream of detections from one camera.
#[async_trait]
pub trait DetectionSource: Send {
    /// Camera this stream belongs to.
    fn camera_id(&self) -> &str;

    /// Waits for the next detection. `Ok(None)` means the stream ended.
    ///
    /// `TransportUnavailable` is transient: the caller backs off and calls
    /// again. Other errors concern a single message.
    async fn next_detection(&mut self) -> Result<Option<Detection>>;
}

/// Destination for coordinator output.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Assignment, GlobalId, IdentityState};

    #[test]
    fn topic_round_trip() {
        assert_eq!(detection_topic("lobby"), "detections/lobby");
        assert_eq!(camera_from_topic("detections/lobby"), Some("lobby"));
        assert_eq!(camera_from_topic("detections/"), None);
        assert_eq!(camera_from_topic("detections/a/b"), None);
        assert_eq!(camera_from_topic("assignments"), None);
        assert_eq!(camera_from_topic("detectionsX/a"), None);
    }

    #[test]
    fn decode_checks_stream_camera() {
        let payload = br#"{"camera_id":"a","local_track_id":1,"timestamp":0.5,"embedding_vector":[1.0]}"#;
        assert_eq!(decode_detection("a", payload).unwrap().local_track_id, 1);

        let err = decode_detection("b", payload).unwrap_err();
        assert!(matches!(err, HandoverError::MalformedDetection(_)));

        let err = decode_detection("a", b"{not json").unwrap_err();
        assert!(matches!(err, HandoverError::MalformedDetection(_)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn event_routing() {
        let ev = OutboundEvent::Assignment(Assignment {
            global_id: GlobalId(1),
            camera_id: "a".into(),
            local_track_id: 2,
            state: IdentityState::Expired,
            timestamp: 3.0,
            confidence: 0.5,
        });
        assert_eq!(event_topic(&ev), ASSIGNMENTS_TOPIC);
        let v: serde_json::Value = serde_json::from_slice(&encode_event(&ev).unwrap()).unwrap();
        assert!(v.get("type").is_none());
        assert_eq!(v["state"]["kind"], "expired");
    }
}
