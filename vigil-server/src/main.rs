//! Vigil server: MQTT ingestion, WebSocket fan-out and the dashboard API
//! in one process.
//!
//! Usage: `vigil-server [--config path/to/vigil.toml]`. Without `--config`,
//! `VIGIL_CONFIG` names the file; `VIGIL_*` variables override its values.

use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use vigil_live::api::{self, AppState};
use vigil_live::storage::{
    AlertRepository, BlobArea, BlobStore, Database, Reconciler, StoreConfig, UserStore,
};
use vigil_live::{AppConfig, Broadcaster, BrokerClient, IngestPipeline, SessionGateway};

/// How long background tasks get to finish after shutdown is signalled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn config_path() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("VIGIL_CONFIG").map(PathBuf::from)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = config_path();
    let config = AppConfig::load(path.as_ref())?;
    config.validate()?;
    match &path {
        Some(p) => info!("Configuration loaded from {}", p.display()),
        None => info!("No configuration file, using defaults and environment"),
    }

    // ─── Storage ─────────────────────────────────────────────────────────
    let storage = &config.storage;
    let db = Arc::new(Database::open(StoreConfig::new(
        &storage.database_path,
        storage.sync_writes,
    ))?);
    let alerts = Arc::new(AlertRepository::new(db.clone())?);
    let users = Arc::new(UserStore::new(db)?);
    let alert_blobs = BlobStore::new(&storage.uploads_dir, &storage.public_prefix, BlobArea::Alerts);
    let profile_blobs =
        BlobStore::new(&storage.uploads_dir, &storage.public_prefix, BlobArea::Profiles);
    info!(
        "Storage ready: {} alerts, {} profiles",
        alerts.count()?,
        users.list()?.len()
    );

    // ─── Fan-out ─────────────────────────────────────────────────────────
    let broadcaster = Broadcaster::new(config.gateway.queue_capacity);
    let gateway = SessionGateway::new(config.gateway.clone(), broadcaster.clone());
    let pipeline = IngestPipeline::new(
        alert_blobs.clone(),
        alerts.clone(),
        broadcaster,
        config.pipeline.clone(),
    );

    // Bind before spawning anything so address errors end startup
    let gateway_listener = TcpListener::bind(&config.gateway.bind_addr).await?;
    let http_listener = TcpListener::bind(&config.http.bind_addr).await?;

    let mut broker = BrokerClient::connect(&config.broker)?;
    broker.subscribe_topics(config.broker.legacy_alerts)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let (inbound, mut broker_task) = broker.start(shutdown_rx.clone());

    {
        let pipeline = pipeline.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { pipeline.run(inbound, shutdown).await });
    }

    {
        let gateway = gateway.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(e) = gateway.serve(gateway_listener, shutdown).await {
                error!("Session gateway failed: {e}");
            }
        });
    }

    if storage.sweep_interval_secs > 0 {
        let reconciler = Reconciler::new(
            alerts.clone(),
            users.clone(),
            vec![alert_blobs, profile_blobs.clone()],
            storage.orphan_grace(),
        );
        let every = Duration::from_secs(storage.sweep_interval_secs);
        tasks.spawn(reconciler.run(every, shutdown_rx.clone()));
    } else {
        info!("Orphan sweep disabled");
    }

    let state = AppState {
        alerts,
        users,
        profile_blobs,
        pipeline,
        gateway,
        config: Arc::new(config),
    };
    {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move {
            if let Err(e) = api::serve(state, http_listener, shutdown).await {
                error!("HTTP API failed: {e}");
            }
        });
    }

    info!("Vigil server running");
    // A refused subscription stops the broker client and the whole process
    let (fatal, broker_running) = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown requested");
            (None, true)
        }
        joined = &mut broker_task => match joined {
            Ok(Ok(())) => {
                warn!("Broker client stopped, shutting down");
                (None, false)
            }
            Ok(Err(e)) => {
                error!("Broker client failed: {e}");
                (Some(e), false)
            }
            Err(e) => {
                error!("Broker task failed: {e}");
                (None, false)
            }
        },
    };
    let _ = shutdown_tx.send(true);
    if broker_running {
        tasks.spawn(async move {
            if let Ok(Err(e)) = broker_task.await {
                error!("Broker client failed: {e}");
            }
        });
    }

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Tasks did not stop within {SHUTDOWN_GRACE:?}, aborting");
        tasks.abort_all();
    }

    info!("Vigil server stopped");
    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
