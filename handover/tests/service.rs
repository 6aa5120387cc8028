//! End-to-end runs of the service over the in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use camnet_handover::{
    BoundingRegion, Detection, DetectionSource, GlobalId, HandoverConfig, HandoverError,
    IdentityState, MemoryPublisher, MemorySink, OutboundEvent, Result, Service, ServiceReport,
    TopologyGraph, bus,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SUBJECT: [f32; 4] = [1.0, 0.0, 0.0, 0.0];

fn det(camera: &str, track: u64, t: f64, emb: impl Into<Vec<f32>>) -> Detection {
    Detection {
        camera_id: camera.into(),
        local_track_id: track,
        timestamp: t,
        bounding_region: BoundingRegion::default(),
        embedding_vector: emb.into(),
        quality_score: None,
    }
}

const CONFIG: &str = r#"
embedding_dim: 4
match_threshold: 0.2
idle_timeout_secs: 2
sweep_interval_ms: 100
bus:
  retry_initial_ms: 10
  retry_max_ms: 40
topology:
  cameras: [A, B, C]
  edges:
    - from: A
      to: B
      window: { min_secs: 1, max_secs: 10 }
    - from: B
      to: C
"#;

struct Harness {
    publisher: MemoryPublisher,
    events: mpsc::UnboundedReceiver<OutboundEvent>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<ServiceReport>>,
}

impl Harness {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("camnet.yaml");
        std::fs::write(&path, CONFIG).unwrap();
        let cfg = HandoverConfig::load(&path).unwrap();

        let topology = Arc::new(TopologyGraph::from_config(&cfg.topology, &[]).unwrap());
        let cameras: Vec<String> = topology.cameras().map(String::from).collect();
        let (publisher, sources) = bus::memory::channel(&cameras, 16);
        let sources: Vec<Box<dyn DetectionSource>> = sources
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn DetectionSource>)
            .collect();
        let (sink, events) = MemorySink::new();

        let service = Service::new(cfg, topology);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { service.run(sources, Arc::new(sink), token).await });

        Self {
            publisher,
            events,
            cancel,
            handle,
        }
    }

    async fn send(&self, d: Detection) {
        self.publisher.send(d).await.unwrap();
    }

    async fn next_event(&mut self) -> OutboundEvent {
        tokio::time::timeout(Duration::from_secs(5), self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream closed")
    }

    async fn assignment(&mut self) -> (GlobalId, IdentityState) {
        match self.next_event().await {
            OutboundEvent::Assignment(a) => (a.global_id, a.state),
            other => panic!("expected assignment, got {other:?}"),
        }
    }

    /// Ends every stream and waits for the service to drain.
    async fn finish(self) -> ServiceReport {
        drop(self.publisher);
        self.handle.await.unwrap().unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn handover_within_window_is_published() {
    let mut h = Harness::start();
    h.send(det("A", 1, 0.0, SUBJECT)).await;
    let (gid, state) = h.assignment().await;
    assert_eq!(state, IdentityState::Owned { camera: "A".into() });

    h.send(det("B", 7, 5.0, SUBJECT)).await;
    let OutboundEvent::Handover(decision) = h.next_event().await else {
        panic!("expected handover");
    };
    assert_eq!(decision.global_id, gid);
    assert_eq!((decision.from_camera.as_str(), decision.to_camera.as_str()), ("A", "B"));
    let (same, state) = h.assignment().await;
    assert_eq!(same, gid);
    assert_eq!(state, IdentityState::Owned { camera: "B".into() });

    let report = h.finish().await;
    assert_eq!(report.stats.handovers, 1);
    assert_eq!(report.identities, 1);
}

#[tokio::test(start_paused = true)]
async fn outside_window_creates_new_identity_without_handover() {
    let mut h = Harness::start();
    h.send(det("A", 1, 0.0, SUBJECT)).await;
    let (first, _) = h.assignment().await;

    h.send(det("B", 7, 20.0, SUBJECT)).await;
    let (second, state) = h.assignment().await;
    assert_ne!(second, first);
    assert_eq!(state, IdentityState::Owned { camera: "B".into() });

    let report = h.finish().await;
    assert_eq!(report.stats.handovers, 0);
    assert_eq!(report.stats.implausible_handovers, 1);
}

#[tokio::test(start_paused = true)]
async fn idle_identity_expires_and_id_is_not_reused() {
    let mut h = Harness::start();
    h.send(det("A", 1, 0.0, SUBJECT)).await;
    let (gid, _) = h.assignment().await;

    // Session time keeps running from the last detection; the sweep fires
    // once more than idle_timeout_secs have passed.
    let (expired, state) = h.assignment().await;
    assert_eq!(expired, gid);
    assert_eq!(state, IdentityState::Expired);

    h.send(det("A", 1, 3.0, SUBJECT)).await;
    let (fresh, _) = h.assignment().await;
    assert!(fresh > gid);

    let report = h.finish().await;
    assert_eq!(report.stats.expired, 1);
    assert_eq!(report.stats.created, 2);
}

#[tokio::test(start_paused = true)]
async fn duplicates_and_bad_input_are_contained() {
    let mut h = Harness::start();
    let d = det("A", 1, 0.0, SUBJECT);
    h.send(d.clone()).await;
    let _ = h.assignment().await;
    h.send(d).await;
    h.send(det("A", 2, 0.5, [1.0, 0.0])).await;
    h.publisher
        .fail("C", HandoverError::MalformedDetection("garbled".into()))
        .await
        .unwrap();
    h.publisher
        .fail("B", HandoverError::TransportUnavailable("link down".into()))
        .await
        .unwrap();

    let report = h.finish().await;
    assert_eq!(report.stats.duplicates, 1);
    assert_eq!(report.stats.malformed, 2);
    assert_eq!(report.stats.transport_errors, 1);
    assert_eq!(report.identities, 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_cameras_settle_consistently() {
    let h = Harness::start();
    let mut tasks = Vec::new();
    for (i, camera) in ["A", "B", "C"].into_iter().enumerate() {
        let publisher = h.publisher.clone();
        tasks.push(tokio::spawn(async move {
            for step in 0..20u64 {
                let mut emb = [0.0f32; 4];
                emb[(step as usize + i) % 4] = 1.0;
                publisher
                    .send(det(camera, step % 3, step as f64 * 0.25, emb))
                    .await
                    .unwrap();
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    // The registry is verified after every transaction; a clean report
    // means ownership stayed unique throughout.
    let report = h.finish().await;
    assert_eq!(report.stats.received, 60);
    assert_eq!(report.stats.invariant_violations, 0);
    assert!(report.identities >= 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_service() {
    let h = Harness::start();
    h.send(det("A", 1, 0.0, SUBJECT)).await;
    h.cancel.cancel();
    let report = h.handle.await.unwrap().unwrap();
    assert!(report.stats.received <= 1);
}
