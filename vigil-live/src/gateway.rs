//! WebSocket session gateway.
//!
//! Architecture:
//! ```text
//! Dashboard A ──┐                         ┌── SessionHandle A ◄──┐
//! Dashboard B ──┼── TcpListener ──accept──┼── SessionHandle B ◄──┼── Broadcaster
//! Dashboard C ──┘        │                └── SessionHandle C ◄──┘
//!                        └── over max_sessions: Close(1013)
//! ```
//!
//! Each connection runs in its own task: it registers a session, finishes
//! the WebSocket handshake, activates the session and then forwards queued
//! frames until either side goes away. Client data frames are ignored; the
//! push channel is one-way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};

use crate::broadcast::{Broadcaster, SessionHandle};
use crate::config::GatewayConfig;

/// How long shutdown waits for connection tasks to say goodbye.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("WebSocket handshake failed: {0}")]
    Handshake(tokio_tungstenite::tungstenite::Error),
    #[error("WebSocket handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("WebSocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Gateway statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Handshakes refused because `max_sessions` was reached
    pub rejected: u64,
    /// Upgrades that failed or did not finish in time
    pub handshake_failures: u64,
}

#[derive(Clone)]
pub struct SessionGateway {
    config: GatewayConfig,
    broadcaster: Broadcaster,
    stats: Arc<RwLock<GatewayStats>>,
}

impl SessionGateway {
    pub fn new(config: GatewayConfig, broadcaster: Broadcaster) -> Self {
        Self {
            config,
            broadcaster,
            stats: Arc::new(RwLock::new(GatewayStats::default())),
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })?;
        self.serve(listener, shutdown).await
    }

    /// Accept sessions on `listener` until shutdown, then close them all.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), GatewayError> {
        if let Ok(addr) = listener.local_addr() {
            log::info!("Session gateway listening on {addr}");
        }
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            // Per-connection accept errors (EMFILE, resets) are transient
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    self.stats.write().await.total_connections += 1;

                    if self.broadcaster.session_count().await >= self.config.max_sessions {
                        self.stats.write().await.rejected += 1;
                        log::warn!("Session limit {} reached, refusing {addr}", self.config.max_sessions);
                        connections.spawn(Self::refuse(stream, addr, self.handshake_timeout()));
                        continue;
                    }

                    let handle = self.broadcaster.register().await;
                    let gateway = self.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = gateway.handle_connection(stream, addr, handle, shutdown).await {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        let closed = self.broadcaster.close_all().await;
        log::info!("Session gateway stopping, closing {closed} sessions");

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            log::warn!("Connection tasks did not finish in time, aborting");
            connections.abort_all();
        }
        Ok(())
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.config.handshake_timeout_secs.max(1))
    }

    /// Finish the handshake only to send a Close frame.
    async fn refuse(stream: TcpStream, addr: SocketAddr, limit: Duration) {
        let handshake = tokio::time::timeout(limit, tokio_tungstenite::accept_async(stream));
        match handshake.await {
            Err(_) => log::debug!("Refused client {addr} never finished the handshake"),
            Ok(Ok(mut ws)) => {
                let frame = CloseFrame {
                    code: CloseCode::Again,
                    reason: Utf8Bytes::from_static("session limit reached"),
                };
                if let Err(e) = ws.close(Some(frame)).await {
                    log::debug!("Close to refused client {addr} failed: {e}");
                }
            }
            Ok(Err(e)) => log::debug!("Handshake with refused client {addr} failed: {e}"),
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        mut handle: SessionHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), GatewayError> {
        let session_id = handle.id();

        // The session holds a slot from accept, so the upgrade is bounded
        let limit = self.handshake_timeout();
        let handshake = tokio::time::timeout(limit, tokio_tungstenite::accept_async(stream));
        let ws_stream = match handshake.await {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                self.fail_handshake(&session_id).await;
                return Err(GatewayError::Handshake(e));
            }
            Err(_) => {
                self.fail_handshake(&session_id).await;
                return Err(GatewayError::HandshakeTimeout(limit));
            }
        };
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        self.stats.write().await.active_connections += 1;
        self.broadcaster.activate(&session_id).await;
        log::info!("Session {session_id} established from {addr}");

        let heartbeat_period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        let idle_timeout = self.config.idle_timeout_secs.map(Duration::from_secs);
        let mut last_seen = Instant::now();

        let result = loop {
            let idle_deadline = idle_timeout.map(|timeout| last_seen + timeout);

            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Session {session_id} closed by client");
                            break Ok(());
                        }
                        Some(Ok(_)) => {
                            // Pongs and data frames only count as liveness
                            last_seen = Instant::now();
                        }
                        Some(Err(e)) => break Err(e.into()),
                    }
                }

                frame = handle.next() => {
                    match frame {
                        Some(frame) => {
                            if let Err(e) = ws_sender.send(Message::Text(frame.to_string().into())).await {
                                break Err(e.into());
                            }
                        }
                        None => {
                            // Removed from the registry
                            let _ = ws_sender.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Away,
                                reason: Utf8Bytes::from_static("server shutting down"),
                            }))).await;
                            break Ok(());
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if let Err(e) = ws_sender.send(Message::Ping(Default::default())).await {
                        break Err(e.into());
                    }
                }

                _ = async {
                    match idle_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    log::info!("Session {session_id} idle, closing");
                    let _ = ws_sender.send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: Utf8Bytes::from_static("idle timeout"),
                    }))).await;
                    break Ok(());
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = ws_sender.send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: Utf8Bytes::from_static("server shutting down"),
                        }))).await;
                        break Ok(());
                    }
                }
            }
        };

        self.broadcaster.deregister(&session_id).await;
        {
            let mut stats = self.stats.write().await;
            stats.active_connections = stats.active_connections.saturating_sub(1);
        }
        result
    }

    async fn fail_handshake(&self, session_id: &uuid::Uuid) {
        self.broadcaster.deregister(session_id).await;
        self.stats.write().await.handshake_failures += 1;
    }

    pub async fn stats(&self) -> GatewayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gateway_stats_initial() {
        let gateway = SessionGateway::new(GatewayConfig::default(), Broadcaster::new(8));
        assert_eq!(gateway.stats().await, GatewayStats::default());
        assert_eq!(gateway.bind_addr(), "0.0.0.0:5001");
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = GatewayConfig {
            bind_addr: taken.local_addr().unwrap().to_string(),
            ..GatewayConfig::default()
        };
        let gateway = SessionGateway::new(config, Broadcaster::new(8));
        let (_tx, rx) = watch::channel(false);

        assert!(matches!(gateway.run(rx).await, Err(GatewayError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let gateway = SessionGateway::new(GatewayConfig::default(), Broadcaster::new(8));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(async move { gateway.serve(listener, rx).await });
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("gateway did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
