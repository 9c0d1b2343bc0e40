pub mod app;
pub mod config;
pub mod error;
pub mod implementations;
pub mod services;
pub mod utilities;

use std::{
    env,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, atomic::AtomicBool},
};

use downloader::DownloaderRegistry;
use factory::factories::{kubernetes::Kubernetes, observability::Observability};
use tokio::{sync::watch, task::JoinSet};
use tracing::{error, info};
use utility::shutdown_signal::shutdown_signal;

use crate::{
    app::AppState,
    config::Config,
    error::AppError,
    services::{kaniko::KanikoEngine, staging::StagingArea, store::KubeStore},
    utilities::{
        controller::Controller, notifier::ChangeNotifier,
        rate_limiter::default_controller_rate_limiter, reconciler::Reconciler,
        work_queue::WorkQueue,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // These are baked at COMPILE time
    let cargo_manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let cargo_crate_name = env!("CARGO_CRATE_NAME");
    let cargo_pkg_name = env!("CARGO_PKG_NAME");
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    let env_path = cargo_manifest_dir.join(".env");

    // Load service-specific .env
    dotenvy::from_path(&env_path).ok();
    // Load workspace root .env as fallback
    dotenvy::dotenv().ok();

    let path = env::var("CONFIG").unwrap_or("config.json".to_string());
    let full_path = cargo_manifest_dir.join(path);
    let cfg = Config::init(full_path).await?;

    let _guard = Observability::init(cargo_crate_name, cargo_pkg_version, &cfg.observability).await?;

    let kubernetes = Kubernetes::new(&cfg.kubernetes).await?;
    let http_client = reqwest::ClientBuilder::new().build()?;
    // A duplicate registration is a startup error
    let downloaders = Arc::new(DownloaderRegistry::with_defaults(http_client)?);

    let queue = Arc::new(WorkQueue::new(Box::new(default_controller_rate_limiter(
        &cfg.controller,
    ))));
    let notifier = ChangeNotifier::new(
        kubernetes.client.clone(),
        cfg.build.namespace.clone(),
        Arc::clone(&queue),
    );

    let store = KubeStore::new(
        kubernetes.client.clone(),
        cfg.build.namespace.clone(),
        notifier.image_store(),
    );
    let engine = KanikoEngine::new(kubernetes.client.clone(), cfg.build.clone());
    let reconciler = Reconciler::new(
        Arc::new(store),
        Arc::new(engine),
        downloaders,
        StagingArea::new(cfg.staging.dir.clone()),
        cfg.build.clone(),
    );

    let ready = Arc::new(AtomicBool::new(false));
    let controller = Arc::new(Controller::new(
        Arc::clone(&queue),
        Arc::new(reconciler),
        cfg.controller.max_retries,
        Arc::clone(&ready),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let caches_synced = notifier.wait_for_cache_sync();

    let mut set = JoinSet::new();

    // Spawn tasks into the set
    set.spawn(notifier.run(shutdown_rx.clone()));
    set.spawn(controller.run(
        cfg.controller.workers,
        caches_synced,
        shutdown_rx.clone(),
    ));
    set.spawn(start_health_server(
        AppState {
            cargo_pkg_name,
            cargo_pkg_version,
            ready,
        },
        cfg.server_address,
        shutdown_rx,
    ));

    info!("✅ All background tasks started");

    // Unified shutdown logic
    tokio::select! {
        _ = shutdown_signal() => {
            info!("🛑 Shutdown signal received");
        }
        Some(result) = set.join_next() => {
            match result {
                Ok(Ok(())) => error!("A background task exited unexpectedly!"),
                Ok(Err(e)) => error!("Task failed: {}", e),
                Err(e) => error!("Task panic: {}", e),
            }
        }
    }

    // Workers finish their in-flight items before the controller task returns
    shutdown_tx.send_replace(true);
    while let Some(result) = set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task failed during shutdown: {}", e),
            Err(e) => error!("Task panic during shutdown: {}", e),
        }
    }

    println!("👋 Shutting down gracefully...");

    Ok(())
}

// Start a simple HTTP server for health checks
async fn start_health_server(
    state: AppState,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), AppError> {
    let cargo_pkg_name = state.cargo_pkg_name;
    let app = app::app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🚀 {} service running at {:#?}", cargo_pkg_name, addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await?;

    Ok(())
}
