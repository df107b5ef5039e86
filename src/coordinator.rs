//! Coordinator wiring: owns the ledger, store, registry, and scheduler, and
//! runs the HTTP and worker-stream servers. There is no process-wide
//! singleton; everything hangs off this object.

use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::sqlite::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::CoordinatorConfig;
use crate::db;
use crate::error::{GridError, Result};
use crate::ledger::{Credits, Ledger};
use crate::registry::WorkerRegistry;
use crate::scheduler::{DispatchSignal, Scheduler};
use crate::session::{self, SessionState};
use crate::store::JobStore;

pub struct Coordinator {
    pub config: CoordinatorConfig,
    pub pool: SqlitePool,
    pub ledger: Ledger,
    pub store: JobStore,
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<Scheduler>,
}

impl Coordinator {
    pub async fn new(
        config: CoordinatorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DispatchSignal>)> {
        let pool = db::connect(&config.db_path).await?;
        let ledger = Ledger::new(pool.clone(), config.initial_credits);
        let store = JobStore::new(pool.clone());
        let registry = Arc::new(WorkerRegistry::new());
        let (scheduler, signal_rx) = Scheduler::new(
            store.clone(),
            ledger.clone(),
            Arc::clone(&registry),
            config.worker_reward,
            config.requeue_attempts,
            config.cancel_ack_grace,
            config.max_capture_bytes,
        );
        let coordinator = Self {
            config,
            pool,
            ledger,
            store,
            registry,
            scheduler,
        };
        Ok((coordinator, signal_rx))
    }

    /// Run every subsystem until `shutdown` fires:
    /// 1. recover persisted queue state,
    /// 2. the dispatch loop,
    /// 3. the stale-session sweep,
    /// 4. the worker-stream server,
    /// 5. the HTTP API server.
    pub async fn run(
        self,
        signal_rx: mpsc::UnboundedReceiver<DispatchSignal>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        self.scheduler.recover().await?;

        let scheduler = Arc::clone(&self.scheduler);
        let scheduler_shutdown = shutdown.clone();
        tokio::spawn(async move {
            scheduler.run(signal_rx, scheduler_shutdown).await;
        });

        self.spawn_sweep_loop(shutdown.clone());

        let stream_addr = SocketAddr::from(([0, 0, 0, 0], self.config.stream_port));
        let stream_router = session::router(SessionState {
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
            ledger: self.ledger.clone(),
            pool: self.pool.clone(),
        });

        let http_addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let http_router = api::router(ApiState {
            ledger: self.ledger.clone(),
            store: self.store.clone(),
            registry: Arc::clone(&self.registry),
            scheduler: Arc::clone(&self.scheduler),
            job_cost: Credits::from_f64(self.config.job_cost),
            max_code_bytes: self.config.max_code_bytes,
            default_timeout_s: self.config.default_timeout.as_secs(),
        });

        let stream_listener = tokio::net::TcpListener::bind(stream_addr)
            .await
            .map_err(|e| GridError::Internal(format!("binding {stream_addr}: {e}")))?;
        let http_listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| GridError::Internal(format!("binding {http_addr}: {e}")))?;
        tracing::info!(addr = %stream_addr, "Worker stream listening (path /ws/worker)");
        tracing::info!(addr = %http_addr, "HTTP API listening");

        let stream_shutdown = shutdown.clone();
        let stream_server = axum::serve(stream_listener, stream_router)
            .with_graceful_shutdown(async move { stream_shutdown.cancelled().await });
        let http_shutdown = shutdown.clone();
        let http_server = axum::serve(http_listener, http_router)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await });

        let (stream_result, http_result) =
            tokio::join!(async { stream_server.await }, async { http_server.await });
        stream_result.map_err(|e| GridError::Internal(format!("stream server: {e}")))?;
        http_result.map_err(|e| GridError::Internal(format!("http server: {e}")))?;
        tracing::info!("Coordinator stopped");
        Ok(())
    }

    /// Background sweep: sessions silent past the stale threshold go
    /// offline (re-queueing anything they held); sessions silent past the
    /// reap threshold are removed.
    fn spawn_sweep_loop(&self, shutdown: CancellationToken) {
        let registry = Arc::clone(&self.registry);
        let scheduler = Arc::clone(&self.scheduler);
        let pool = self.pool.clone();
        let stale = self.config.stale_threshold;
        let reap = self.config.reap_threshold;
        let every = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let outcome = registry.sweep(stale, reap);
                for id in outcome.went_offline {
                    tracing::warn!(worker_id = %id, "Worker went stale; marked offline");
                    if let Err(e) = session::persist_worker_status(
                        &pool,
                        id,
                        crate::protocol::WorkerStatus::Offline,
                    )
                    .await
                    {
                        tracing::error!(worker_id = %id, error = %e, "Failed to persist offline status");
                    }
                    if let Err(e) = scheduler.on_worker_lost(id).await {
                        tracing::error!(worker_id = %id, error = %e, "Worker-loss handling failed");
                    }
                }
                for id in outcome.removed {
                    tracing::info!(worker_id = %id, "Stale worker session removed");
                }
            }
        });
    }
}
