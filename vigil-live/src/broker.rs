//! MQTT broker client.
//!
//! Connection lifecycle:
//! ```text
//! Disconnected ──start()──► Connecting ──ConnAck──► Connected
//!                               ▲                      │ transport error
//!                               │   backoff sleep      ▼
//!                               └────────────── Reconnecting
//!
//! Connected ──SubAck failure before the first full set──► Failed
//! ```
//!
//! Sessions are clean, so the broker forgets subscriptions on disconnect.
//! Every ConnAck re-issues the full subscription set. Delivery is QoS 0:
//! messages published while the link is down are lost.
//!
//! A broker that refuses one of the initial subscriptions ends the client
//! with [`SubscriptionError::Rejected`]. Once every filter has been granted
//! once, later refusals are only logged.

use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::protocol::Topic;

/// Request queue between `AsyncClient` and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Upper bound on flushing the DISCONNECT packet during shutdown.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Stopped because the broker refused a startup subscription
    Failed,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid broker address: {0}")]
    InvalidAddress(String),
    #[error("broker transport error: {0}")]
    Transport(String),
}

impl From<rumqttc::ConnectionError> for ConnectionError {
    fn from(e: rumqttc::ConnectionError) -> Self {
        ConnectionError::Transport(e.to_string())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SubscriptionError {
    #[error("invalid topic filter {filter:?}: {reason}")]
    InvalidFilter { filter: String, reason: &'static str },
    #[error("broker rejected subscription (packet {pkid})")]
    Rejected { pkid: u16 },
}

/// One message as received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Check a subscription filter against the MQTT filter grammar.
pub fn validate_filter(filter: &str) -> Result<(), SubscriptionError> {
    let invalid = |reason| SubscriptionError::InvalidFilter {
        filter: filter.to_string(),
        reason,
    };

    if filter.is_empty() {
        return Err(invalid("empty filter"));
    }
    if filter.len() > u16::MAX as usize {
        return Err(invalid("longer than 65535 bytes"));
    }
    if filter.contains('\0') {
        return Err(invalid("contains NUL"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != levels.len() - 1) {
            return Err(invalid("'#' must be the whole last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid("'+' must be a whole level"));
        }
    }
    Ok(())
}

/// Broker connection plus the filters to hold on it.
///
/// Nothing touches the network until [`BrokerClient::start`]; an unreachable
/// broker only shows up as `Reconnecting` and a silent stream.
pub struct BrokerClient {
    client: AsyncClient,
    eventloop: EventLoop,
    config: BrokerConfig,
    subscriptions: Vec<String>,
    state_tx: watch::Sender<ConnectionState>,
}

impl BrokerClient {
    /// Prepare a connection to the configured broker.
    pub fn connect(config: &BrokerConfig) -> Result<Self, ConnectionError> {
        let (host, port) = config
            .host_port()
            .map_err(|e| ConnectionError::InvalidAddress(e.to_string()))?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        options.set_max_packet_size(config.max_packet_bytes, config.max_packet_bytes);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            client,
            eventloop,
            config: config.clone(),
            subscriptions: Vec::new(),
            state_tx,
        })
    }

    /// Add a filter to the subscription set.
    ///
    /// The filter is sent on every (re)connect. Adding one twice is a no-op.
    pub fn subscribe(&mut self, filter: &str) -> Result<(), SubscriptionError> {
        validate_filter(filter)?;
        if !self.subscriptions.iter().any(|f| f == filter) {
            self.subscriptions.push(filter.to_string());
        }
        Ok(())
    }

    /// Subscribe to every topic the pipeline decodes.
    pub fn subscribe_topics(&mut self, include_legacy: bool) -> Result<(), SubscriptionError> {
        for topic in Topic::subscriptions(include_legacy) {
            self.subscribe(topic.name())?;
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Watch connection state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Spawn the receive loop. The stream ends on shutdown, when the
    /// receiver is dropped or when a startup subscription is refused; it
    /// never ends because of a broker outage.
    pub fn start(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<InboundMessage>, JoinHandle<Result<(), SubscriptionError>>) {
        let (tx, rx) = mpsc::channel(self.config.inbound_capacity.max(1));
        let handle = tokio::spawn(self.run(tx, shutdown));
        (rx, handle)
    }

    async fn run(
        mut self,
        tx: mpsc::Sender<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SubscriptionError> {
        let initial = Duration::from_millis(self.config.reconnect_initial_ms.max(1));
        let max = Duration::from_millis(self.config.reconnect_max_ms).max(initial);
        let mut delay = initial;
        let mut dropping = false;
        // SubAcks still owed for the first complete subscription set
        let mut pending_acks = (!self.subscriptions.is_empty()).then_some(self.subscriptions.len());

        self.set_state(ConnectionState::Connecting);
        log::info!("Connecting to broker {}", self.config.url);

        let outcome = loop {
            tokio::select! {
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        self.set_state(ConnectionState::Connected);
                        log::info!("Connected to broker {}", self.config.url);
                        delay = initial;
                        if pending_acks.is_some() {
                            pending_acks = Some(self.subscriptions.len());
                        }
                        for filter in &self.subscriptions {
                            if let Err(e) = self.client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                                log::error!("Failed to queue subscription {filter}: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::SubAck(ack))) => {
                        let refused = ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure));
                        if refused {
                            let error = SubscriptionError::Rejected { pkid: ack.pkid };
                            if pending_acks.is_some() {
                                log::error!("{error}; stopping broker client");
                                break Err(error);
                            }
                            log::error!("{error}");
                            continue;
                        }
                        log::debug!("Subscription acknowledged (packet {})", ack.pkid);
                        if let Some(remaining) = pending_acks {
                            if remaining <= 1 {
                                log::info!("All {} subscriptions granted", self.subscriptions.len());
                                pending_acks = None;
                            } else {
                                pending_acks = Some(remaining - 1);
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: publish.topic,
                            payload: publish.payload,
                        };
                        match tx.try_send(message) {
                            Ok(()) => dropping = false,
                            Err(mpsc::error::TrySendError::Full(dropped)) => {
                                if !dropping {
                                    log::warn!("Inbound queue full, dropping messages (first on {})", dropped.topic);
                                    dropping = true;
                                }
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => {
                                log::info!("Inbound consumer gone, stopping broker client");
                                break Ok(());
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let error = ConnectionError::from(e);
                        self.set_state(ConnectionState::Reconnecting);
                        log::warn!("{error}; reconnecting in {delay:?}");

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = shutdown.changed() => {}
                        }
                        delay = (delay * 2).min(max);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }

            if *shutdown.borrow() {
                break Ok(());
            }
        };

        self.disconnect().await;
        match &outcome {
            Ok(()) => self.set_state(ConnectionState::Disconnected),
            Err(_) => self.set_state(ConnectionState::Failed),
        }
        log::info!("Broker client stopped");
        outcome
    }

    /// Send DISCONNECT if a connection is up, without waiting long for it.
    async fn disconnect(&mut self) {
        if *self.state_tx.borrow() != ConnectionState::Connected {
            return;
        }
        if self.client.try_disconnect().is_err() {
            return;
        }
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_GRACE, flush).await.is_err() {
            log::debug!("Broker disconnect not flushed in time");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Broker state {previous:?} -> {state:?}");
        }
    }
}
