use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gridwatch_store::Store;

use gridwatch_server::api::{self, AppState};
use gridwatch_server::clock::Clock;
use gridwatch_server::config::{Config, HEARTBEAT_RATE_PER_SEC};
use gridwatch_server::messenger::{Messenger, NoopMessenger, TelegramMessenger};
use gridwatch_server::monitor::{Monitor, TickStatus};
use gridwatch_server::notifier::Notifier;
use gridwatch_server::queue;
use gridwatch_server::rate_limit::HeartbeatLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gridwatch_server=debug")),
        )
        .init();

    info!("Starting gridwatch v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    info!(
        port = config.api_port,
        sensor_timeout_sec = config.sensor_timeout_sec,
        check_interval_sec = config.check_interval.as_secs(),
        canonical_sensors = config.sensor_uuid_map.len(),
        admins = config.admin_ids.len(),
        "Loaded configuration"
    );

    let store = match Store::open(&config.db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, path = %config.db_path.display(), "failed to open database");
            std::process::exit(1);
        }
    };

    let clock = Clock::system();
    let messenger: Arc<dyn Messenger> = match &config.bot_token {
        Some(token) => Arc::new(TelegramMessenger::new(token.clone())?),
        None => {
            warn!("BOT_TOKEN is not set; notifications will be logged and dropped");
            Arc::new(NoopMessenger)
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poke = Arc::new(Notify::new());
    let status = Arc::new(TickStatus::new());
    let heartbeat_limiter = HeartbeatLimiter::new(HEARTBEAT_RATE_PER_SEC);

    let mut tasks = Vec::new();

    // Liveness monitor + aggregator.
    let monitor = Monitor::new(
        Arc::clone(&store),
        Arc::clone(&config),
        clock.clone(),
        Arc::clone(&poke),
        Arc::clone(&status),
    );
    tasks.push(tokio::spawn(monitor.run(shutdown_rx.clone())));

    // Admin job worker.
    let notifier = Arc::new(Notifier::new(
        Arc::clone(&store),
        Arc::clone(&config),
        clock.clone(),
        messenger,
    ));
    tasks.push(tokio::spawn(notifier.run(shutdown_rx.clone())));

    // Lease reclaimer.
    tasks.push(tokio::spawn(queue::reclaimer_loop(
        Arc::clone(&store),
        clock.clone(),
        shutdown_rx.clone(),
    )));

    let state = AppState {
        store,
        config: Arc::clone(&config),
        clock,
        heartbeat_limiter,
        poke,
        status,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tokio::select! {
        result = api::serve(state, addr) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
                shutdown_tx.send(true).ok();
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    // Signal every loop and give in-flight work a bounded drain window.
    shutdown_tx.send(true).ok();
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        warn!("background tasks did not drain within 5s");
    }

    Ok(())
}
