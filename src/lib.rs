//! apipatrol -- scheduled HTTP API test automation.
//!
//! This crate provides the core library for cron-scheduled test runs:
//! job lifecycle management, per-run execution of a collection's HTTP test
//! cases with cross-case templating, sandboxed validation scripts, report
//! persistence, and failure notification.

pub mod api;
pub mod config;
pub mod model;
pub mod notify;
pub mod runner;
pub mod sandbox;
pub mod scheduler;
pub mod storage;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::AppConfig;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::runner::RunOrchestrator;
use crate::sandbox::Sandbox;
use crate::scheduler::JobScheduler;
use crate::storage::{Persistence, SqliteStore};
use crate::transport::{HttpTransport, Transport};

/// Start the apipatrol daemon: storage, job scheduler, and admin API.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.db_path, "Initializing database");
    let pool = storage::open_pool(&config.db_path)?;
    let store: Arc<dyn Persistence> = Arc::new(SqliteStore::new(pool));

    // 2. Wire the execution engine
    let sandbox = Sandbox::new(Duration::from_millis(config.script_timeout_ms));
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(sandbox.clone()));
    let notifier: Arc<dyn Notifier> = match &config.notify_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };
    let orchestrator = Arc::new(RunOrchestrator::new(
        store.clone(),
        transport,
        notifier,
        sandbox,
    ));

    // 3. Boot all open timers
    let scheduler = Arc::new(JobScheduler::new(store.clone(), orchestrator.clone()));
    scheduler.init().await?;

    // 4. Start API Server
    let state = api::state::AppState {
        store,
        scheduler,
        orchestrator,
    };
    let app = api::router(state);

    let addr: std::net::SocketAddr = config.bind.parse()?;
    tracing::info!(%addr, "apipatrol listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
