//! Bootstrap: composes the components, runs the lifecycle and handles
//! graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::api::{build_router, AppState};
use crate::config::Config;
use crate::controller::{Controller, ControllerSubJobLauncher};
use crate::error::{Result, StevedoreError};
use crate::joblog::JobLogStore;
use crate::jobs::{DemoJob, DEMO_JOB_NAME};
use crate::pool::WorkerPool;
use crate::db::RedisPool;

/// Grace period for the API server before the second stop.
const SERVER_STOP_GRACE: Duration = Duration::from_secs(10);

/// Coordinates loading and running all components.
pub struct Bootstrap {
    config: Config,
    secret: String,
}

impl Bootstrap {
    pub fn new(config: Config, secret: String) -> Self {
        Self { config, secret }
    }

    /// Compose everything, serve until a signal or a background error,
    /// then drain gracefully. Blocks for the process lifetime.
    pub async fn load_and_run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (error_tx, mut error_rx) = mpsc::channel::<StevedoreError>(1);

        let redis = RedisPool::new(&self.config.redis.url, &self.config.redis.namespace)?;
        let logs = JobLogStore::new(
            self.config.job_log.dir.clone(),
            self.config.job_log.retention_hours,
        )?;

        let pool = Arc::new(WorkerPool::new(redis, logs.clone(), &self.config));

        // Register the known job types.
        pool.register_job(DEMO_JOB_NAME, DemoJob)?;

        // Fatal when Redis stays unreachable after the bounded pings.
        pool.start(shutdown_rx.clone(), error_tx.clone()).await?;

        let controller = Arc::new(Controller::new(pool.clone(), logs));
        // Jobs launch sub-jobs through the controller, wired in behind
        // the capability trait so the pool holds no controller.
        pool.set_sub_job_launcher(Arc::new(ControllerSubJobLauncher(controller.clone())));

        let state = AppState {
            controller,
            secret: Arc::new(self.secret),
        };
        let app = build_router(state);

        let addr: SocketAddr = format!("{}:{}", self.config.server.host, self.config.server.port)
            .parse()
            .map_err(|e| StevedoreError::configuration(format!("invalid listen address: {}", e)))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(address = %addr, "API server is started");

        let server_shutdown = shutdown_rx.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(wait_for_shutdown(server_shutdown))
                .await
        });

        // Block until a termination signal or the first background error.
        let mut first_error = None;
        tokio::select! {
            _ = shutdown_signal() => {
                info!("termination signal received");
            }
            err = error_rx.recv() => {
                if let Some(e) = err {
                    error!(error = %e, "background component reported a fatal error");
                    first_error = Some(e);
                }
            }
        }

        // Tell every subsystem to drain.
        let _ = shutdown_tx.send(true);

        // Give the API server a grace window, then force the second stop.
        match tokio::time::timeout(SERVER_STOP_GRACE, &mut server).await {
            Ok(Ok(Ok(()))) => info!("API server stopped"),
            Ok(Ok(Err(e))) => error!(error = %e, "API server exited with error"),
            Ok(Err(e)) => error!(error = %e, "API server task failed"),
            Err(_) => {
                warn!("API server did not stop in time, forcing shutdown");
                server.abort();
                let _ = server.await;
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("server gracefully exit");
                Ok(())
            }
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
