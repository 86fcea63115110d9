//! Ingestion: broker messages in, stored alerts and dashboard events out.
//!
//! ```text
//!                    ┌─► worker live_feed ──────────────────────────┐
//! inbound ─► router ─┼─► worker alerts/face ─► blob ─► repo ─┐      ├─► Broadcaster
//!  (mpsc)            ├─► worker alerts/...                   └──────┤
//!                    └─► worker ai_alerts (legacy)  ────────────────┘
//! ```
//!
//! One worker per topic keeps each topic in receipt order while a slow
//! alert write never holds up the live feed. Every per-message failure
//! ends at the worker with a log line.

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::broadcast::Broadcaster;
use crate::broker::InboundMessage;
use crate::config::PipelineConfig;
use crate::protocol::{
    decode_topic, AlertKind, AlertPayload, DecodeError, Event, EventName, LiveFrame,
    OutboundEvent, Topic,
};
use crate::storage::{Alert, AlertRepository, BlobStore, NewAlert, RepositoryError};

/// Counters for `/api/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub decoded: u64,
    pub decode_failures: u64,
    pub alerts_stored: u64,
    /// Lost to blob or repository failures
    pub alerts_dropped: u64,
    pub live_frames: u64,
    /// Discarded because a topic worker's queue was full
    pub backlog_dropped: u64,
}

#[derive(Default)]
struct AtomicPipelineStats {
    received: AtomicU64,
    decoded: AtomicU64,
    decode_failures: AtomicU64,
    alerts_stored: AtomicU64,
    alerts_dropped: AtomicU64,
    live_frames: AtomicU64,
    backlog_dropped: AtomicU64,
}

/// What became of one message.
#[derive(Debug)]
pub enum Outcome {
    /// Live frame queued to this many sessions
    Forwarded(usize),
    /// Alert persisted (and broadcast)
    Stored(Alert),
    Rejected(DecodeError),
    /// Decoded alert lost to a storage failure
    Dropped,
}

#[derive(Clone)]
pub struct IngestPipeline {
    alert_blobs: BlobStore,
    alerts: Arc<AlertRepository>,
    broadcaster: Broadcaster,
    config: PipelineConfig,
    stats: Arc<AtomicPipelineStats>,
}

impl IngestPipeline {
    pub fn new(
        alert_blobs: BlobStore,
        alerts: Arc<AlertRepository>,
        broadcaster: Broadcaster,
        config: PipelineConfig,
    ) -> Self {
        Self {
            alert_blobs,
            alerts,
            broadcaster,
            config,
            stats: Arc::new(AtomicPipelineStats::default()),
        }
    }

    /// Route inbound messages to per-topic workers until the stream ends or
    /// shutdown is signalled. Queued messages are drained before returning.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut queues: HashMap<Topic, mpsc::Sender<Bytes>> = HashMap::new();
        let mut workers = JoinSet::new();

        loop {
            let message = tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            self.stats.received.fetch_add(1, Ordering::Relaxed);

            let Some(topic) = Topic::from_name(&message.topic) else {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Ignoring message on unknown topic {}", message.topic);
                continue;
            };

            let queue = queues.entry(topic).or_insert_with(|| {
                let (tx, rx) = mpsc::channel(self.config.topic_queue_capacity.max(1));
                workers.spawn(self.clone().worker(topic, rx));
                tx
            });
            if let Err(mpsc::error::TrySendError::Full(_)) = queue.try_send(message.payload) {
                self.stats.backlog_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Worker for {topic} is behind, dropping message");
            }
        }

        // Closing the queues lets each worker finish what it already holds
        drop(queues);
        while workers.join_next().await.is_some() {}
        log::info!("Ingestion pipeline stopped");
    }

    async fn worker(self, topic: Topic, mut queue: mpsc::Receiver<Bytes>) {
        log::debug!("Worker for {topic} started");
        while let Some(payload) = queue.recv().await {
            self.process(topic, &payload).await;
        }
    }

    /// Decode, persist and broadcast one message.
    pub async fn process(&self, topic: Topic, payload: &[u8]) -> Outcome {
        let event = match decode_topic(topic, payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Discarding message on {topic}: {e}");
                return Outcome::Rejected(e);
            }
        };
        self.stats.decoded.fetch_add(1, Ordering::Relaxed);

        let (kind, alert, legacy) = match event {
            Event::Live(frame) => return self.forward_live(&frame).await,
            Event::Face(alert) => (AlertKind::Face, alert, false),
            Event::Object(alert) => (AlertKind::Object, alert, false),
            Event::Gesture(alert) => (AlertKind::Gesture, alert, false),
            Event::Voice(alert) => (AlertKind::Voice, alert, false),
            Event::LegacyAlert(alert) => (AlertKind::Object, alert, true),
        };
        self.handle_alert(kind, alert, legacy).await
    }

    async fn forward_live(&self, frame: &LiveFrame) -> Outcome {
        self.stats.live_frames.fetch_add(1, Ordering::Relaxed);
        match self.broadcaster.broadcast(&OutboundEvent::live_feed(frame)).await {
            Ok(sessions) => Outcome::Forwarded(sessions),
            Err(e) => {
                log::error!("Failed to encode live frame: {e}");
                Outcome::Forwarded(0)
            }
        }
    }

    async fn handle_alert(&self, kind: AlertKind, alert: AlertPayload, legacy: bool) -> Outcome {
        // Blob first: a record must never name a file that was not written
        let image_ref = match &alert.image {
            Some(bytes) => match self.alert_blobs.save(bytes, image_extension(bytes)).await {
                Ok(reference) => Some(reference),
                Err(e) => {
                    self.stats.alerts_dropped.fetch_add(1, Ordering::Relaxed);
                    log::error!("Dropping {} alert at {}: {}", kind.as_str(), alert.timestamp, e);
                    return Outcome::Dropped;
                }
            },
            None => None,
        };

        let record = NewAlert {
            timestamp: alert.timestamp,
            kind,
            objects: alert.objects,
            message: alert.message,
            image_ref,
        };
        let stored = match self.append_with_retry(record).await {
            Ok(stored) => stored,
            Err(e) => {
                self.stats.alerts_dropped.fetch_add(1, Ordering::Relaxed);
                log::error!("Dropping {} alert, repository unavailable: {}", kind.as_str(), e);
                return Outcome::Dropped;
            }
        };
        self.stats.alerts_stored.fetch_add(1, Ordering::Relaxed);
        log::info!("Stored {} alert {}: {}", kind.as_str(), stored.id, stored.label());

        let event = if legacy {
            legacy_alert_event(&stored)
        } else {
            alert_event(&stored)
        };
        if let Err(e) = self.broadcaster.broadcast(&event).await {
            log::error!("Failed to encode alert {}: {}", stored.id, e);
        }
        Outcome::Stored(stored)
    }

    async fn append_with_retry(&self, record: NewAlert) -> Result<Alert, RepositoryError> {
        let mut backoff = Duration::from_millis(self.config.repository_retry_backoff_ms);
        let mut attempt = 0;
        loop {
            match self.append_blocking(record.clone()).await {
                Ok(stored) => return Ok(stored),
                Err(e) if attempt < self.config.repository_retries => {
                    attempt += 1;
                    log::warn!("Alert append failed (attempt {attempt}): {e}; retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Synced RocksDB writes block, so they run off the async workers.
    async fn append_blocking(&self, record: NewAlert) -> Result<Alert, RepositoryError> {
        let alerts = self.alerts.clone();
        tokio::task::spawn_blocking(move || alerts.append(record))
            .await
            .map_err(|e| RepositoryError::Database(format!("append task failed: {e}")))?
    }

    pub fn stats(&self) -> PipelineStats {
        let s = &self.stats;
        PipelineStats {
            received: s.received.load(Ordering::Relaxed),
            decoded: s.decoded.load(Ordering::Relaxed),
            decode_failures: s.decode_failures.load(Ordering::Relaxed),
            alerts_stored: s.alerts_stored.load(Ordering::Relaxed),
            alerts_dropped: s.alerts_dropped.load(Ordering::Relaxed),
            live_frames: s.live_frames.load(Ordering::Relaxed),
            backlog_dropped: s.backlog_dropped.load(Ordering::Relaxed),
        }
    }
}

/// `alert` event: the stored record plus its rendered label.
pub fn alert_event(alert: &Alert) -> OutboundEvent {
    OutboundEvent::new(
        EventName::Alert,
        json!({
            "id": alert.id,
            "kind": alert.kind,
            "timestamp": alert.timestamp,
            "objects": alert.objects,
            "label": alert.label(),
            "message": alert.message,
            "image": alert.image_ref,
        }),
    )
}

/// `new_alert` event in the shape older dashboards expect.
pub fn legacy_alert_event(alert: &Alert) -> OutboundEvent {
    OutboundEvent::new(
        EventName::NewAlert,
        json!({
            "timestamp": alert.timestamp,
            "objects": alert.label(),
            "image": alert.image_ref,
        }),
    )
}

/// Longest pause between two append attempts.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_RETRY_BACKOFF)
}

fn image_extension(bytes: &[u8]) -> &'static str {
    match bytes {
        [0x89, b'P', b'N', b'G', ..] => "png",
        [b'G', b'I', b'F', b'8', ..] => "gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::SessionHandle;
    use crate::storage::{BlobArea, Database, StoreConfig};
    use base64::Engine;

    struct Fixture {
        _dir: tempfile::TempDir,
        pipeline: IngestPipeline,
        alerts: Arc<AlertRepository>,
        blobs: BlobStore,
        broadcaster: Broadcaster,
    }

    fn fixture_with_uploads(uploads: impl FnOnce(&std::path::Path) -> std::path::PathBuf) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let alerts = Arc::new(AlertRepository::new(db).unwrap());
        let blobs = BlobStore::new(uploads(dir.path()), "/uploads", BlobArea::Alerts);
        let broadcaster = Broadcaster::new(64);
        let pipeline = IngestPipeline::new(
            blobs.clone(),
            alerts.clone(),
            broadcaster.clone(),
            PipelineConfig::default(),
        );
        Fixture {
            _dir: dir,
            pipeline,
            alerts,
            blobs,
            broadcaster,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_uploads(|root| root.join("uploads"))
    }

    async fn session(broadcaster: &Broadcaster) -> SessionHandle {
        let handle = broadcaster.register().await;
        broadcaster.activate(&handle.id()).await;
        handle
    }

    async fn next_event(handle: &mut SessionHandle) -> OutboundEvent {
        let frame = tokio::time::timeout(Duration::from_secs(2), handle.next())
            .await
            .expect("no event")
            .expect("session closed");
        OutboundEvent::decode(&frame).unwrap()
    }

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[tokio::test]
    async fn test_face_alert_scenario() {
        let f = fixture();
        let mut dashboard = session(&f.broadcaster).await;
        let image = b"\xFF\xD8\xFFjpeg-bytes";
        let payload = format!(
            r#"{{"timestamp":1700000000,"objects":["cat"],"image":"{}"}}"#,
            b64(image)
        );

        let stored = match f.pipeline.process(Topic::FaceAlerts, payload.as_bytes()).await {
            Outcome::Stored(alert) => alert,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(stored.kind, AlertKind::Face);
        assert_eq!(stored.objects, vec!["cat"]);
        let reference = stored.image_ref.clone().unwrap();
        assert!(reference.starts_with("/uploads/alerts/"));
        assert_eq!(f.blobs.read(&reference).await.unwrap(), image);

        let event = next_event(&mut dashboard).await;
        assert_eq!(event.event, EventName::Alert);
        assert_eq!(event.data["kind"], "face");
        assert_eq!(event.data["timestamp"], 1_700_000_000);
        assert_eq!(event.data["objects"], json!(["cat"]));
        assert_eq!(event.data["label"], "cat");
        assert_eq!(event.data["image"], reference.as_str());
        assert_eq!(event.data["id"], stored.id);

        assert_eq!(f.alerts.list_recent(None).unwrap(), vec![stored]);
    }

    #[tokio::test]
    async fn test_garbage_live_feed_is_forwarded_not_stored() {
        let f = fixture();
        let mut dashboard = session(&f.broadcaster).await;

        let outcome = f.pipeline.process(Topic::LiveFeed, b"\x00\x01garbage").await;
        assert!(matches!(outcome, Outcome::Forwarded(1)));
        assert_eq!(next_event(&mut dashboard).await.event, EventName::LiveFeed);

        let outcome = f.pipeline.process(Topic::LiveFeed, b"").await;
        assert!(matches!(outcome, Outcome::Rejected(DecodeError::EmptyPayload)));

        assert_eq!(f.alerts.count().unwrap(), 0);
        let stats = f.pipeline.stats();
        assert_eq!(stats.live_frames, 1);
        assert_eq!(stats.decode_failures, 1);
    }

    #[tokio::test]
    async fn test_bad_message_does_not_stop_the_next() {
        let f = fixture();
        let bad = f.pipeline.process(Topic::ObjectAlerts, b"{not json").await;
        assert!(matches!(bad, Outcome::Rejected(DecodeError::InvalidJson(_))));
        let missing = f.pipeline.process(Topic::ObjectAlerts, br#"{"objects":["x"]}"#).await;
        assert!(matches!(missing, Outcome::Rejected(DecodeError::MissingTimestamp)));

        let good = f.pipeline.process(Topic::ObjectAlerts, br#"{"timestamp":5}"#).await;
        match good {
            Outcome::Stored(alert) => {
                assert!(alert.objects.is_empty());
                assert_eq!(alert.label(), "Unknown Object");
                assert!(alert.image_ref.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_blob_failure_drops_alert() {
        let f = fixture_with_uploads(|root| {
            let blocked = root.join("blocked");
            std::fs::write(&blocked, b"file, not a directory").unwrap();
            blocked
        });
        let mut dashboard = session(&f.broadcaster).await;
        let payload = format!(r#"{{"timestamp":1,"objects":[],"image":"{}"}}"#, b64(b"img"));

        let outcome = f.pipeline.process(Topic::FaceAlerts, payload.as_bytes()).await;
        assert!(matches!(outcome, Outcome::Dropped));
        assert_eq!(f.alerts.count().unwrap(), 0);
        assert_eq!(f.pipeline.stats().alerts_dropped, 1);

        let nothing = tokio::time::timeout(Duration::from_millis(50), dashboard.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_legacy_alert_emits_new_alert() {
        let f = fixture();
        let mut dashboard = session(&f.broadcaster).await;

        let payload = format!(
            r#"{{"timestamp":42,"objects":["person","dog"],"image":"{}"}}"#,
            b64(b"\xFF\xD8img")
        );
        let stored = match f.pipeline.process(Topic::LegacyAlerts, payload.as_bytes()).await {
            Outcome::Stored(alert) => alert,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(stored.kind, AlertKind::Object);

        let event = next_event(&mut dashboard).await;
        assert_eq!(event.event, EventName::NewAlert);
        assert_eq!(event.data["objects"], "person, dog");
        assert_eq!(event.data["timestamp"], 42);
        assert_eq!(event.data["image"], stored.image_ref.unwrap().as_str());
    }

    #[tokio::test]
    async fn test_gesture_message_preserved() {
        let f = fixture();
        let payload = br#"{"timestamp":9,"objects":["wave"],"message":"Hand wave detected"}"#;
        match f.pipeline.process(Topic::GestureAlerts, payload).await {
            Outcome::Stored(alert) => {
                assert_eq!(alert.kind, AlertKind::Gesture);
                assert_eq!(alert.message.as_deref(), Some("Hand wave detected"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_keeps_topic_order_and_drains_on_end() {
        let f = fixture();
        let mut dashboard = session(&f.broadcaster).await;
        let (tx, rx) = mpsc::channel(64);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        for ts in [3, 1, 2] {
            tx.send(InboundMessage {
                topic: "alerts/voice".into(),
                payload: Bytes::from(format!(r#"{{"timestamp":{ts},"objects":["v{ts}"]}}"#)),
            })
            .await
            .unwrap();
        }
        tx.send(InboundMessage {
            topic: "unknown/topic".into(),
            payload: Bytes::from_static(b"x"),
        })
        .await
        .unwrap();
        drop(tx);

        f.pipeline.run(rx, shutdown_rx).await;

        // Receipt order on the topic, regardless of timestamp
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(next_event(&mut dashboard).await.data["timestamp"].as_i64().unwrap());
        }
        assert_eq!(seen, vec![3, 1, 2]);

        let timestamps: Vec<i64> = f.alerts.list_recent(None).unwrap().iter().map(|a| a.timestamp).collect();
        assert_eq!(timestamps, vec![3, 2, 1]);

        let stats = f.pipeline.stats();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.alerts_stored, 3);
        assert_eq!(stats.decode_failures, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let (_tx, rx) = mpsc::channel::<InboundMessage>(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pipeline = f.pipeline.clone();
        let task = tokio::spawn(async move { pipeline.run(rx, shutdown_rx).await });
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pipeline did not stop")
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_appends_get_distinct_ids() {
        let f = fixture();
        let mut appends = JoinSet::new();
        for ts in 0..16 {
            let pipeline = f.pipeline.clone();
            appends.spawn(async move {
                pipeline
                    .append_with_retry(NewAlert {
                        timestamp: ts,
                        kind: AlertKind::Object,
                        objects: vec!["person".into()],
                        message: None,
                        image_ref: None,
                    })
                    .await
            });
        }

        let mut ids = Vec::new();
        while let Some(joined) = appends.join_next().await {
            ids.push(joined.unwrap().unwrap().id);
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
        assert_eq!(f.alerts.count().unwrap(), 16);
    }

    #[test]
    fn test_retry_backoff_doubles_up_to_cap() {
        assert_eq!(next_backoff(Duration::from_millis(100)), Duration::from_millis(200));
        assert_eq!(next_backoff(Duration::from_secs(20)), MAX_RETRY_BACKOFF);
        assert_eq!(next_backoff(Duration::MAX), MAX_RETRY_BACKOFF);
        assert_eq!(next_backoff(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_image_extension_sniffing() {
        assert_eq!(image_extension(b"\xFF\xD8\xFF"), "jpg");
        assert_eq!(image_extension(b"\x89PNG\r\n"), "png");
        assert_eq!(image_extension(b"RIFF\0\0\0\0WEBPVP8"), "webp");
        assert_eq!(image_extension(b""), "jpg");
    }
}
