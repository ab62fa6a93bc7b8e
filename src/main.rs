use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use maildrift::config::{Cli, ServerConfig, StoreMode};
use maildrift::cursor::CursorStore;
use maildrift::doveadm::{DoveadmClient, UserDirectory};
use maildrift::handler::SyncEventHandler;
use maildrift::queue::ReplicationQueue;
use maildrift::reconciler::Reconciler;
use maildrift::routes::{build_router, AppState};
use maildrift::store::Store;
use maildrift::worker::WorkerPool;

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        store_mode = ?config.store_mode,
        namespace = %config.namespace,
        num_workers = config.num_workers,
        doveadm_url = %config.doveadm_url,
        "starting maildrift"
    );

    run(config).await
}

async fn run(config: ServerConfig) -> Result<()> {
    let store = Arc::new(match config.store_mode {
        StoreMode::Embedded => Store::embedded(),
        StoreMode::Remote => Store::remote(&config.redis_url)
            .await
            .context("failed to connect to redis")?,
    });
    store
        .ping()
        .await
        .context("storage backend unreachable at startup")?;

    let queue = Arc::new(ReplicationQueue::new(store.clone(), &config.namespace));
    let cursors = Arc::new(CursorStore::new(
        store.clone(),
        &config.namespace,
        config.cursor_ttl,
    ));
    let client = Arc::new(DoveadmClient::new(
        &config.doveadm_url,
        &config.doveadm_password,
    ));

    let handler = Arc::new(SyncEventHandler::new(
        client.clone(),
        cursors.clone(),
        &config.destination,
    ));
    let pool = WorkerPool::new(queue.clone(), config.num_workers, handler);
    pool.start();

    let reconciler = if config.reconciler_enabled {
        let directory: Arc<dyn UserDirectory> = client.clone();
        let reconciler = Arc::new(Reconciler::new(
            directory,
            queue.clone(),
            cursors.clone(),
            config.reconciler_interval,
            config.reconciler_threshold,
        ));
        reconciler.start();
        Some(reconciler)
    } else {
        info!("background reconciliation disabled");
        None
    };

    let ready = Arc::new(AtomicBool::new(false));
    let router = build_router(AppState {
        queue: queue.clone(),
        ready: ready.clone(),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    ready.store(true, Ordering::SeqCst);
    info!("maildrift listening on {}", config.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    ready.store(false, Ordering::SeqCst);
    info!("shutdown signal received, draining");

    if let Some(reconciler) = reconciler {
        if let Err(err) = reconciler.stop(config.shutdown_grace).await {
            warn!(error = %err, "reconciler did not stop cleanly");
        }
    }
    if let Err(err) = pool.stop(config.shutdown_grace).await {
        warn!(error = %err, "worker pool did not stop cleanly");
    }
    queue.close().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
