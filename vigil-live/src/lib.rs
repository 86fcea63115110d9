//! # vigil-live: live alert pipeline for the monitoring dashboard
//!
//! Bridges the MQTT detector network to browser dashboards: camera frames
//! are relayed as they arrive, detector alerts are stored with their
//! snapshot and pushed to every connected session.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  (topic, bytes)  ┌────────────────┐
//! │ BrokerClient│ ───────────────► │ IngestPipeline │
//! │ (rumqttc)   │                  │ decode/topic   │
//! └─────────────┘                  └───┬────────┬───┘
//!                                      │        │ alerts
//!                           live frames│        ▼
//!                                      │  ┌───────────┐   ┌──────────────────┐
//!                                      │  │ BlobStore │──►│ AlertRepository  │
//!                                      │  └───────────┘   │ (RocksDB)        │
//!                                      │                  └────────┬─────────┘
//!                                      ▼                           │
//!                               ┌─────────────┐ ◄──────────────────┘
//!                               │ Broadcaster │  per-session bounded queues
//!                               └──────┬──────┘
//!                                      ▼
//!                               ┌──────────────┐      ┌──────────────┐
//!                               │SessionGateway│      │ HTTP API     │
//!                               │ (WebSocket)  │      │ (axum)       │
//!                               └──────────────┘      └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: topic table, payload decoding, outbound wire format
//! - [`broker`]: MQTT connection with reconnect and resubscribe
//! - [`pipeline`]: per-topic ingestion workers
//! - [`storage`]: blob store, alert repository, profiles, orphan sweep
//! - [`broadcast`]: session registry and fan-out
//! - [`gateway`]: WebSocket session gateway
//! - [`api`]: HTTP history/profile API
//! - [`config`]: TOML and environment configuration

pub mod api;
pub mod broadcast;
pub mod broker;
pub mod config;
pub mod gateway;
pub mod pipeline;
pub mod protocol;
pub mod storage;

// Re-exports for convenience
pub use api::{build_router, ApiError, AppState};
pub use broadcast::{BroadcastStats, Broadcaster, Frame, SessionHandle, SessionInfo, SessionState};
pub use broker::{
    BrokerClient, ConnectionError, ConnectionState, InboundMessage, SubscriptionError,
};
pub use config::{AppConfig, ConfigError};
pub use gateway::{GatewayError, GatewayStats, SessionGateway};
pub use pipeline::{IngestPipeline, Outcome, PipelineStats};
pub use protocol::{
    decode, render_objects, AlertKind, AlertPayload, DecodeError, Event, EventName, LiveFrame,
    OutboundEvent, ProtocolError, Topic,
};
pub use storage::{
    Alert, AlertRepository, BlobArea, BlobStore, Database, NewAlert, NewUser, Reconciler,
    RepositoryError, StorageError, StoreConfig, SweepReport, UserProfile, UserStore,
};
