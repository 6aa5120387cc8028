//! MQTT transport over rumqttc.
//!
//! One event-loop task owns the connection. It subscribes to
//! `detections/+` on every ConnAck and routes each publish by topic to the
//! matching camera's [`MqttSource`]. While the broker is unreachable every
//! source yields `TransportUnavailable` once per failed poll and the loop
//! waits with exponential backoff before polling again.
//!
//! Publishing never waits on the event loop: when its request queue is full
//! the event is dropped with `TransportUnavailable`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Backoff, DETECTIONS_FILTER, DetectionSource, EventSink, camera_from_topic, decode_detection,
    encode_event, event_topic,
};
use crate::config::BusConfig;
use crate::error::{HandoverError, Result};
use crate::stats::Stats;
use crate::types::{CameraId, Detection, OutboundEvent};

type Inbox = mpsc::Sender<Result<Bytes>>;

/// Handle to the broker connection.
pub struct MqttBus {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl MqttBus {
    /// Opens the connection and returns one source per camera.
    ///
    /// Does not wait for the broker: an unreachable broker shows up as
    /// `TransportUnavailable` on the sources.
    pub fn connect<S: AsRef<str>>(
        cfg: &BusConfig,
        cameras: &[S],
        capacity: usize,
        stats: Arc<Stats>,
    ) -> Result<(MqttBus, Vec<MqttSource>)> {
        let options = mqtt_options(cfg)?;
        let (client, event_loop) = AsyncClient::new(options, 100);

        let mut inboxes = HashMap::with_capacity(cameras.len());
        let mut sources = Vec::with_capacity(cameras.len());
        for camera in cameras {
            let camera = camera.as_ref().to_string();
            let (tx, rx) = mpsc::channel(capacity.max(1));
            inboxes.insert(camera.clone(), tx);
            sources.push(MqttSource { camera, rx });
        }

        let cancel = CancellationToken::new();
        let router = Router {
            client: client.clone(),
            inboxes,
            stats,
            backoff: Backoff::new(cfg.retry_initial(), cfg.retry_max()),
        };
        tokio::spawn(router.run(event_loop, cancel.clone()));

        Ok((MqttBus { client, cancel }, sources))
    }

    /// Sink publishing on this connection.
    pub fn sink(&self) -> MqttSink {
        MqttSink {
            client: self.client.clone(),
        }
    }

    /// Stops the event loop and disconnects. Sources end afterwards.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.client
            .disconnect()
            .await
            .map_err(|e| HandoverError::TransportUnavailable(e.to_string()))
    }
}

fn mqtt_options(cfg: &BusConfig) -> Result<MqttOptions> {
    let url = url::Url::parse(&cfg.url)
        .map_err(|e| HandoverError::InvalidConfig(format!("bus url {}: {e}", cfg.url)))?;
    if url.scheme() != "mqtt" && url.scheme() != "tcp" {
        return Err(HandoverError::InvalidConfig(format!(
            "bus url scheme not supported: {}",
            url.scheme()
        )));
    }
    let host = url.host_str().unwrap_or("127.0.0.1");
    let port = url.port().unwrap_or(1883);

    let id = if cfg.client_id.is_empty() {
        format!("camnet-{}", Uuid::new_v4())
    } else {
        cfg.client_id.clone()
    };

    let mut options = MqttOptions::new(id, host, port);
    options.set_keep_alive(Duration::from_secs(u64::from(cfg.keep_alive_secs.max(5))));
    if let Some(password) = url.password() {
        options.set_credentials(url.username(), password);
    }
    Ok(options)
}

struct Router {
    client: AsyncClient,
    inboxes: HashMap<CameraId, Inbox>,
    stats: Arc<Stats>,
    backoff: Backoff,
}

impl Router {
    async fn run(mut self, mut event_loop: EventLoop, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("mqtt event loop stopped");
                    break;
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("connected to broker");
                        self.backoff.reset();
                        if let Err(e) = self.client.subscribe(DETECTIONS_FILTER, QoS::AtLeastOnce).await {
                            warn!(error = %e, "subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.route(&publish.topic, publish.payload);
                    }
                    Ok(Event::Incoming(Packet::SubAck(suback))) => {
                        debug!(?suback, "subscription acknowledged");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("disconnected by broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let delay = self.backoff.next_delay();
                        warn!(error = %e, retry_in = ?delay, "broker unavailable");
                        self.fan_out(&e.to_string());
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }
        // Dropping the inboxes ends every source.
    }

    fn route(&self, topic: &str, payload: Bytes) {
        let Some(inbox) = camera_from_topic(topic).and_then(|c| self.inboxes.get(c)) else {
            Stats::bump(&self.stats.unknown_camera);
            warn!(topic, "detection on unknown camera topic dropped");
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = inbox.try_send(Ok(payload)) {
            warn!(topic, "camera inbox full, detection dropped");
        }
    }

    fn fan_out(&self, reason: &str) {
        for inbox in self.inboxes.values() {
            let _ = inbox.try_send(Err(HandoverError::TransportUnavailable(reason.to_string())));
        }
    }
}

/// Detections of one camera received over MQTT.
pub struct MqttSource {
    camera: CameraId,
    rx: mpsc::Receiver<Result<Bytes>>,
}

#[async_trait]
impl DetectionSource for MqttSource {
    fn camera_id(&self) -> &str {
        &self.camera
    }

    async fn next_detection(&mut self) -> Result<Option<Detection>> {
        match self.rx.recv().await {
            Some(Ok(payload)) => decode_detection(&self.camera, &payload).map(Some),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Publishes coordinator output with at-least-once delivery.
#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
}

#[async_trait]
impl EventSink for MqttSink {
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        let payload = encode_event(event)?;
        self.client
            .try_publish(event_topic(event), QoS::AtLeastOnce, false, payload)
            .map_err(|e| HandoverError::TransportUnavailable(e.to_string()))
    }
}
