//! Generation orchestrator service.
//!
//! Sits between chat clients and the KIE provider: runs the job engine,
//! the dedupe layer, both reconcilers, post-delivery billing, and the
//! health/metrics endpoints.
//!
//! ## Architecture
//!
//! ```text
//! submit -> tracker/dedupe/lock -> JobEngine -> KIE API
//!                                      |
//!                                  JobResult
//!                                      |
//!                         DeliveryService -> ChatTransport
//!                                      |
//!                                 BillingGate
//!
//! PendingReconciler and OrphanReconciler sweep persisted state on fixed
//! intervals, concurrent with all user-driven jobs.
//! ```

mod health;
mod runtime;
mod transport;

pub use runtime::{Runtime, RuntimeConfig};
pub use transport::{LoggingTransport, TransportOrphanNotifier};

use core_config::{app_info, Environment};
use eyre::{Result, WrapErr};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Run a reconciler loop under supervision: panics restart the task with a
/// bounded backoff instead of silently killing the sweep.
fn spawn_supervised<F, Fut>(
    name: &'static str,
    shutdown: watch::Receiver<bool>,
    factory: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(watch::Receiver<bool>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut restart_delay = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return;
            }
            let run = tokio::spawn(factory(shutdown.clone()));
            match run.await {
                Ok(()) => {
                    // Clean exit: the loop saw the shutdown signal.
                    return;
                }
                Err(e) => {
                    error!(task = name, error = %e, "supervised task died, restarting");
                    tokio::time::sleep(restart_delay).await;
                    restart_delay = (restart_delay * 2).min(Duration::from_secs(60));
                }
            }
        }
    })
}

async fn start_health_server(state: health::HealthState, port: u16) -> Result<()> {
    let app = health::health_router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {addr}"))?;
    info!(port, "Health server listening");
    axum::serve(listener, app).await.wrap_err("Health server failed")?;
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}

/// Run the orchestrator until a shutdown signal arrives.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    observability::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting generation orchestrator");
    info!("Environment: {:?}", environment);

    let config = RuntimeConfig::from_env()?;
    let health_port = config.health_port;
    let runtime = Arc::new(Runtime::build(config, Arc::new(LoggingTransport)).await?);
    info!(
        tenant = %runtime.config.tenant,
        lock_mode = runtime.locks.mode(),
        models = runtime.catalog.len(),
        provider_live = runtime.config.kie.is_live(),
        "Runtime assembled"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health_state = health::HealthState {
        redis: runtime.redis.clone(),
        app_name: app_info.name,
        app_version: app_info.version,
    };
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let pending = runtime.pending_reconciler.clone();
    let pending_task = spawn_supervised("pending_reconciler", shutdown_rx.clone(), move |rx| {
        let pending = pending.clone();
        async move { pending.run(rx).await }
    });
    let orphans = runtime.orphan_reconciler.clone();
    let orphan_task = spawn_supervised("orphan_reconciler", shutdown_rx.clone(), move |rx| {
        let orphans = orphans.clone();
        async move { orphans.run(rx).await }
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    // Drain the reconcilers before exiting.
    let _ = pending_task.await;
    let _ = orphan_task.await;
    info!("Generation orchestrator stopped");
    Ok(())
}
