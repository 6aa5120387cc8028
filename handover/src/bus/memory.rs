//! In-process bus over tokio channels.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{DetectionSource, EventSink};
use crate::error::{HandoverError, Result};
use crate::types::{CameraId, Detection, OutboundEvent};

/// Creates one source per camera plus a publisher that routes detections
/// to them by `camera_id`.
pub fn channel<S: AsRef<str>>(cameras: &[S], capacity: usize) -> (MemoryPublisher, Vec<MemorySource>) {
    let mut senders = HashMap::with_capacity(cameras.len());
    let mut sources = Vec::with_capacity(cameras.len());
    for camera in cameras {
        let camera = camera.as_ref().to_string();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        senders.insert(camera.clone(), tx);
        sources.push(MemorySource { camera, rx });
    }
    (MemoryPublisher { senders }, sources)
}

/// Producer half. Dropping it ends every source.
#[derive(Clone)]
pub struct MemoryPublisher {
    senders: HashMap<CameraId, mpsc::Sender<Result<Detection>>>,
}

impl MemoryPublisher {
    /// Sends a detection to its camera's stream.
    pub async fn send(&self, det: Detection) -> Result<()> {
        let tx = self
            .senders
            .get(&det.camera_id)
            .ok_or_else(|| HandoverError::UnknownCamera(det.camera_id.clone()))?;
        tx.send(Ok(det))
            .await
            .map_err(|_| HandoverError::TransportUnavailable("memory source closed".into()))
    }

    /// Injects a stream error, e.g. a simulated outage.
    pub async fn fail(&self, camera: &str, err: HandoverError) -> Result<()> {
        let tx = self
            .senders
            .get(camera)
            .ok_or_else(|| HandoverError::UnknownCamera(camera.to_string()))?;
        tx.send(Err(err))
            .await
            .map_err(|_| HandoverError::TransportUnavailable("memory source closed".into()))
    }

    /// Ends one camera's stream.
    pub fn close(&mut self, camera: &str) {
        self.senders.remove(camera);
    }
}

/// Consumer half for one camera.
pub struct MemorySource {
    camera: CameraId,
    rx: mpsc::Receiver<Result<Detection>>,
}

#[async_trait]
impl DetectionSource for MemorySource {
    fn camera_id(&self) -> &str {
        &self.camera
    }

    async fn next_detection(&mut self) -> Result<Option<Detection>> {
        match self.rx.recv().await {
            Some(Ok(det)) => Ok(Some(det)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Sink forwarding every event into an unbounded channel.
pub struct MemorySink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl MemorySink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| HandoverError::TransportUnavailable("event receiver dropped".into()))
    }
}
