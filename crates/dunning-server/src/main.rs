use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dunning_channel::{
    BridgeConnector, ConnectionLifecycleManager, FileCredentialStore, SessionRegistry,
};
use dunning_core::config::{load_config_from, load_config_from_env, Config};
use dunning_core::{BroadcastEventBus, EventBus, PersistenceGateway};
use dunning_reminders::{run_daily, DailySchedule, MessageRenderer, ReminderDispatcher};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod db;
mod server;
mod telemetry;

use db::{Database, LibSqlGateway, MigrationRunner};
use server::AppState;

#[derive(Debug, Parser)]
#[command(name = "dunning-server", version, about = "Payment reminder messaging server")]
struct Args {
    /// Path to a TOML configuration file. Defaults plus DUNNING_* overrides when absent.
    #[arg(short, long, env = "DUNNING_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config_from(path)?,
        None => load_config_from_env()?,
    };

    telemetry::init(&config.logging).map_err(|e| anyhow::anyhow!(e))?;

    info!("Dunning Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let db = Database::open("dunning", config.database.path.as_deref()).await?;
    let runner = MigrationRunner::default();
    runner.run(&db).await?;
    info!(schema_version = ?runner.current_version(&db).await?, "Database ready");

    let gateway: Arc<dyn PersistenceGateway> = Arc::new(LibSqlGateway::new(db.clone()));
    let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new(config.channel.event_capacity));
    let registry = Arc::new(SessionRegistry::new());

    let manager = Arc::new(
        ConnectionLifecycleManager::new(
            Arc::new(BridgeConnector::new(&config.channel.bridge_url)?),
            Arc::new(FileCredentialStore::new(&config.channel.credentials_dir)),
            Arc::clone(&gateway),
            Arc::clone(&registry),
            Arc::clone(&events),
        )
        .with_reconnect_delay(config.channel.reconnect_delay()),
    );

    let mut dispatcher = ReminderDispatcher::new(
        Arc::clone(&gateway),
        Arc::clone(&registry),
        MessageRenderer::new(
            config.reminders.currency_symbol.as_str(),
            config.reminders.default_template.as_str(),
        ),
    )
    .with_lookback_days(config.reminders.lookback_days)
    .with_utc_offset(config.reminders.parsed_offset()?);
    if !config.reminders.verify_destination {
        dispatcher = dispatcher.without_destination_check();
    }
    let dispatcher = Arc::new(dispatcher);

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let scheduler = if config.reminders.enabled {
        let schedule = DailySchedule::from_config(&config.reminders)?;
        info!(times = ?config.reminders.times, offset = %schedule.offset(), "Reminder scheduler enabled");
        let dispatcher = Arc::clone(&dispatcher);
        Some(tokio::spawn(run_daily(schedule, shutdown.clone(), move || {
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.run_now().await }
        })))
    } else {
        info!("Reminder scheduler disabled");
        None
    };

    let state = Arc::new(AppState {
        db,
        gateway,
        manager: Arc::clone(&manager),
        events,
        dispatcher,
        connect_wait: config.server.connect_wait(),
    });

    let served = server::start(state, config.server.socket_addr()?, shutdown.clone()).await;

    // The server can also stop on its own (bind failure); stop everything else too.
    shutdown.cancel();
    if let Some(scheduler) = scheduler {
        if let Err(e) = scheduler.await {
            warn!(error = %e, "Reminder scheduler task failed");
        }
    }
    manager.shutdown().await;

    info!("Dunning Server stopped");
    served
}

/// Resolve on SIGINT, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
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
