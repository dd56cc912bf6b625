pub mod app_state;
pub mod auth;
pub mod batch;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod eventbus;
pub mod healthcheck;
pub mod history;
pub mod http;
pub mod rate_limit;
pub mod revision;
pub mod service;
pub mod singleflight;
pub mod store;
pub mod telemetry;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::app_state::AppState;
use crate::auth::{CacheAuthChecker, InstanceAuthority};
use crate::cache::CacheSet;
use crate::config::AppConfig;
use crate::eventbus::EventHub;
use crate::healthcheck::LeaderHealthChecker;
use crate::history::LogHistorySink;
use crate::http::ConnLimiter;
use crate::rate_limit::KeyedSlidingWindow;
use crate::service::discover::DiscoverServer;
use crate::service::InstanceServer;
use crate::store::Store;

/// Wires every component from configuration and a store handle. Components
/// receive their dependencies by construction; nothing is looked up through
/// process globals.
pub async fn build_app_state(
    app_config: AppConfig,
    store: Arc<dyn Store>,
    hub: EventHub,
) -> Result<AppState> {
    let caches = CacheSet::new(Arc::clone(&store));
    caches
        .refresh_all()
        .await
        .map_err(|err| anyhow::anyhow!("initial cache refresh failed: {err}"))?;

    let checker = LeaderHealthChecker::new(
        app_config.health_check.leader.clone(),
        &app_config.server.advertised_host,
        app_config.server.port,
    );
    checker
        .start(&hub, &store)
        .await
        .map_err(|err| anyhow::anyhow!("start health checker: {err}"))?;

    let instance_server = InstanceServer::new(
        Arc::clone(&store),
        Arc::clone(&caches),
        hub.clone(),
        Arc::clone(&checker),
        app_config.limits.clone(),
        app_config.instance_limit.clone(),
        app_config.async_register.clone(),
        Arc::new(LogHistorySink),
    );
    let auth_checker = CacheAuthChecker::new(
        Arc::clone(&caches),
        app_config.auth.console_open,
        app_config.auth.client_open,
    );
    let authority = InstanceAuthority::new(auth_checker, Arc::clone(&caches), instance_server);
    let discover = DiscoverServer::new(Arc::clone(&caches));

    let api_limiter = Arc::new(KeyedSlidingWindow::per_minute(
        app_config.api_rate_limit.per_minute,
    ));
    let conn_limiter = ConnLimiter::new(
        app_config.conn_limit.open_conn_limit,
        app_config.conn_limit.max_conn_per_host,
        app_config.conn_limit.max_conn_limit,
    );

    Ok(AppState {
        config: Arc::new(app_config),
        hub,
        store,
        caches,
        checker,
        authority,
        discover,
        api_limiter,
        conn_limiter,
    })
}

/// Boots the registry with the in-process store and blocks until shutdown.
pub async fn run() -> Result<()> {
    run_with_shutdown(shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let _metrics_handle = telemetry::init_metrics_recorder();

    let hub = EventHub::new();
    let store: Arc<dyn Store> = Arc::new(store::memory::MemoryStore::new(
        hub.clone(),
        app_config.server.advertised_host.clone(),
    ));
    let state = build_app_state(app_config, store, hub.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let refresh_task = state.caches.spawn_refresh_loop(
        Duration::from_millis(state.config.cache.refresh_interval_ms),
        shutdown_rx.clone(),
    );
    let sweeper_task = healthcheck::spawn_expiry_sweeper(
        Arc::clone(&state.checker),
        Arc::clone(&state.caches),
        Arc::clone(&state.store),
        state.hub.clone(),
        state.config.health_check.clone(),
        shutdown_rx.clone(),
    );

    let api_addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()
    .map_err(|err| anyhow::anyhow!("invalid listen address: {err}"))?;
    let metrics_addr: SocketAddr = format!(
        "{}:{}",
        state.config.metrics.host, state.config.metrics.port
    )
    .parse()
    .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {err}"))?;

    let app = http::build_router(state.clone()).with_state(state.clone());
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let metrics_app = http::build_metrics_router().with_state(state.clone());
    let metrics_service = metrics_app.into_make_service_with_connect_info::<SocketAddr>();

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    info!(%api_addr, "registry listening");
    info!(%metrics_addr, "registry metrics listening");

    let mut api_shutdown = shutdown_rx.clone();
    let mut metrics_shutdown = shutdown_rx.clone();

    let mut api_task = tokio::spawn(async move {
        axum::serve(api_listener, make_service)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });
    let mut metrics_task = tokio::spawn(async move {
        axum::serve(metrics_listener, metrics_service)
            .with_graceful_shutdown(async move {
                let _ = metrics_shutdown.changed().await;
            })
            .await
    });

    tokio::select! {
        res = &mut api_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("api task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("api server failed: {err}"))?;
        }
        res = &mut metrics_task => {
            let _ = shutdown_tx.send(true);
            res.map_err(|err| anyhow::anyhow!("metrics task failed: {err}"))?
                .map_err(|err| anyhow::anyhow!("metrics server failed: {err}"))?;
        }
    }

    api_task
        .await
        .map_err(|err| anyhow::anyhow!("api task failed: {err}"))?
        .map_err(|err| anyhow::anyhow!("api server failed: {err}"))?;
    metrics_task
        .await
        .map_err(|err| anyhow::anyhow!("metrics task failed: {err}"))?
        .map_err(|err| anyhow::anyhow!("metrics server failed: {err}"))?;

    state.checker.destroy().await;
    state.hub.shutdown();
    refresh_task.abort();
    sweeper_task.abort();
    Ok(())
}

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
}
