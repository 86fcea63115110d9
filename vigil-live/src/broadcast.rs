//! Fan-out of dashboard events to every active session.
//!
//! Each session owns a single-receiver tokio broadcast channel used as a
//! bounded ring: when a slow session falls `capacity` frames behind, the
//! oldest frames are overwritten and the session observes the lag on its
//! next read. Ingestion never waits on a session.
//!
//! Frames are encoded once per event and shared as `Arc<str>`.
//!
//! Session lifecycle:
//! ```text
//! register() ──► Connecting ──activate()──► Active ──► Closed
//!                     │                       │     (deregister, send
//!                     └───────────────────────┘      failure, close_all)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::protocol::{OutboundEvent, ProtocolError};

/// One encoded text frame, shared by every recipient.
pub type Frame = Arc<str>;

/// Lifecycle of a session in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, handshake not finished; receives nothing yet
    Connecting,
    Active,
    /// Removed from the registry (or never registered)
    Closed,
}

/// Read-only view of a registered session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Uuid,
    pub connected_at: SystemTime,
    pub state: SessionState,
}

struct SessionEntry {
    connected_at: SystemTime,
    state: SessionState,
    outbound: broadcast::Sender<Frame>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BroadcastStats {
    /// Events broadcast
    pub events_sent: u64,
    /// Frames queued to sessions (one per session per event)
    pub deliveries: u64,
    /// Frames discarded because a session's queue overflowed
    pub events_dropped: u64,
    /// Sessions removed from the registry for any reason
    pub sessions_closed: u64,
    pub active_sessions: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    deliveries: AtomicU64,
    events_dropped: AtomicU64,
    sessions_closed: AtomicU64,
}

struct Inner {
    sessions: RwLock<HashMap<Uuid, SessionEntry>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

/// Session registry and fan-out point.
///
/// Cheap to clone; every clone shares the same registry. One instance is
/// built at startup and handed to the pipeline and the gateway.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl Broadcaster {
    /// `capacity` is the per-session outbound queue length.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
                stats: AtomicBroadcastStats::default(),
            }),
        }
    }

    /// Mint a session in the Connecting state.
    pub async fn register(&self) -> SessionHandle {
        let (outbound, receiver) = broadcast::channel(self.inner.capacity);
        let id = Uuid::new_v4();
        self.inner.sessions.write().await.insert(
            id,
            SessionEntry {
                connected_at: SystemTime::now(),
                state: SessionState::Connecting,
                outbound,
            },
        );
        log::debug!("Session {id} registered");
        SessionHandle {
            id,
            receiver,
            inner: self.inner.clone(),
        }
    }

    /// Connecting → Active. Returns `false` if the session is gone.
    pub async fn activate(&self, id: &Uuid) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        match sessions.get_mut(id) {
            Some(entry) => {
                entry.state = SessionState::Active;
                log::info!("Session {id} active ({} registered)", sessions.len());
                true
            }
            None => false,
        }
    }

    /// Remove a session. Its handle drains what is queued, then ends.
    pub async fn deregister(&self, id: &Uuid) -> bool {
        let removed = self.inner.sessions.write().await.remove(id).is_some();
        if removed {
            self.inner.stats.sessions_closed.fetch_add(1, Ordering::Relaxed);
            log::info!("Session {id} closed");
        }
        removed
    }

    /// Encode `event` once and queue it to every Active session.
    ///
    /// Returns the number of sessions it was queued to. Sessions whose
    /// receiving side is gone are closed on the spot.
    pub async fn broadcast(&self, event: &OutboundEvent) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::from(event.encode()?);
        Ok(self.broadcast_frame(frame).await)
    }

    /// Queue a pre-encoded frame to every Active session.
    pub async fn broadcast_frame(&self, frame: Frame) -> usize {
        // Exclusive, so every session sees events in one shared order.
        // Sends never wait, so the lock is held only for the loop.
        let mut sessions = self.inner.sessions.write().await;
        let mut delivered = 0;
        let mut broken = Vec::new();

        for (id, entry) in sessions.iter() {
            if entry.state != SessionState::Active {
                continue;
            }
            match entry.outbound.send(frame.clone()) {
                Ok(_) => delivered += 1,
                Err(_) => broken.push(*id),
            }
        }

        for id in &broken {
            sessions.remove(id);
            log::warn!("Session {id} transport gone, closing");
        }
        drop(sessions);

        let stats = &self.inner.stats;
        stats.events_sent.fetch_add(1, Ordering::Relaxed);
        stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        stats
            .sessions_closed
            .fetch_add(broken.len() as u64, Ordering::Relaxed);
        delivered
    }

    /// Close every session. Used on shutdown.
    pub async fn close_all(&self) -> usize {
        let mut sessions = self.inner.sessions.write().await;
        let closed = sessions.len();
        sessions.clear();
        self.inner
            .stats
            .sessions_closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        if closed > 0 {
            log::info!("Closed {closed} sessions");
        }
        closed
    }

    /// Current state; `Closed` for unknown ids.
    pub async fn state(&self, id: &Uuid) -> SessionState {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .map(|entry| entry.state)
            .unwrap_or(SessionState::Closed)
    }

    /// Registered sessions in any state.
    pub async fn session_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    pub async fn active_count(&self) -> usize {
        self.inner
            .sessions
            .read()
            .await
            .values()
            .filter(|entry| entry.state == SessionState::Active)
            .count()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                connected_at: entry.connected_at,
                state: entry.state,
            })
            .collect()
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> BroadcastStats {
        let stats = &self.inner.stats;
        BroadcastStats {
            events_sent: stats.events_sent.load(Ordering::Relaxed),
            deliveries: stats.deliveries.load(Ordering::Relaxed),
            events_dropped: stats.events_dropped.load(Ordering::Relaxed),
            sessions_closed: stats.sessions_closed.load(Ordering::Relaxed),
            active_sessions: self.active_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

/// Receiving side of one session's outbound queue.
///
/// Dropping the handle marks the transport as broken; the next broadcast
/// removes the session.
pub struct SessionHandle {
    id: Uuid,
    receiver: broadcast::Receiver<Frame>,
    inner: Arc<Inner>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next queued frame, in broadcast order.
    ///
    /// Skips over frames lost to overflow. `None` once the session has been
    /// closed and its queue drained.
    pub async fn next(&mut self) -> Option<Frame> {
        loop {
            match self.receiver.recv().await {
                Ok(frame) => return Some(frame),
                Err(RecvError::Lagged(skipped)) => {
                    self.inner
                        .stats
                        .events_dropped
                        .fetch_add(skipped, Ordering::Relaxed);
                    log::warn!(
                        "Session {} lagging, dropped {} oldest events",
                        self.id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
