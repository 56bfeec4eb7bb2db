//! # Unlock Service
//!
//! The facade the front-end talks to. Every method is a thin pass-through to
//! the scheduler, the orchestrator or the result store.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::{PersistenceError, ServiceError};
use super::evaluator::{HttpProber, Prober};
use super::lifecycle::{EngineControl, EngineManager};
use super::model::{EvaluationRun, RunSummary};
use super::orchestrator::RunOrchestrator;
use super::scheduler::Scheduler;
use super::store::ResultStore;
use crate::configs::app_config::{parse_cron, AppConfig};

/// Point-in-time view for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub scheduler_running: bool,
    pub run_in_progress: bool,
    pub next_fire: Option<DateTime<Utc>>,
    pub engine_healthy: bool,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub last_run_complete: Option<bool>,
    pub last_summary: Option<RunSummary>,
}

/// # Unlock Service
///
/// Built once at startup and shared behind an `Arc`.
pub struct UnlockService {
    engine: Arc<dyn EngineControl>,
    store: Arc<ResultStore>,
    scheduler: Scheduler,
    shutdown: CancellationToken,
}

impl UnlockService {
    /// Wires the real engine manager and HTTP prober.
    ///
    /// # Errors
    /// Invalid cron expression, unusable control-plane URL, or a results
    /// directory that cannot be created.
    pub fn build(config: Arc<AppConfig>, shutdown: CancellationToken) -> Result<Self, ServiceError> {
        let engine = Arc::new(EngineManager::new(config.engine.clone())?);
        let prober = Arc::new(HttpProber::new(
            config.probe.clone(),
            Some(config.engine.proxy.url()),
        ));
        Self::with_components(config, engine, prober, shutdown)
    }

    /// Wires the pipeline around the given engine and prober.
    pub fn with_components(
        config: Arc<AppConfig>,
        engine: Arc<dyn EngineControl>,
        prober: Arc<dyn Prober>,
        shutdown: CancellationToken,
    ) -> Result<Self, ServiceError> {
        let results_dir = &config.storage.results_dir;
        fs::create_dir_all(results_dir).map_err(|e| PersistenceError::io(results_dir, e))?;

        let schedule = parse_cron(&config.schedule.cron)?;
        let store = Arc::new(ResultStore::new(&config.storage));
        let orchestrator = Arc::new(RunOrchestrator::new(
            Arc::clone(&config),
            Arc::clone(&engine),
            prober,
            Arc::clone(&store),
        ));
        let scheduler = Scheduler::new(
            orchestrator,
            schedule,
            config.schedule.error_backoff(),
            shutdown.clone(),
        );

        Ok(Self {
            engine,
            store,
            scheduler,
            shutdown,
        })
    }

    pub async fn get_status(&self) -> ServiceStatus {
        let last = self.latest_run().unwrap_or_else(|e| {
            warn!("Could not read the last snapshot: {}", e);
            None
        });
        let state = self.scheduler.state();
        ServiceStatus {
            scheduler_running: self.scheduler.is_running(),
            run_in_progress: state.is_run_in_progress(),
            next_fire: state.next_fire(),
            engine_healthy: self.engine.is_healthy().await,
            last_run_started_at: last.as_ref().map(EvaluationRun::started_at),
            last_run_finished_at: last.as_ref().map(EvaluationRun::finished_at),
            last_run_complete: last.as_ref().map(EvaluationRun::is_complete),
            last_summary: last.map(|run| run.summary().clone()),
        }
    }

    pub fn start_scheduler(&self) -> bool {
        self.scheduler.start()
    }

    pub fn stop_scheduler(&self) -> bool {
        self.scheduler.stop()
    }

    /// `false` when a run is already in progress.
    pub fn run_now(&self) -> bool {
        self.scheduler.run_now()
    }

    pub fn latest_run(&self) -> Result<Option<EvaluationRun>, PersistenceError> {
        self.store.load()
    }

    pub fn downloadable_snapshot(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.store.downloadable_snapshot()
    }

    pub fn subscription(&self) -> Result<Option<String>, PersistenceError> {
        self.store.subscription()
    }

    /// Cancels the scheduler and any run (the current endpoint still
    /// finishes), waits up to `limit`, then stops the engine.
    pub async fn shutdown(&self, limit: Duration) {
        info!("Shutting down unlock service");
        self.shutdown.cancel();
        if !self.scheduler.wait_idle(limit).await {
            warn!("Run did not finish within {:?}, stopping engine anyway", limit);
        }
        self.engine.ensure_stopped().await;
        info!("Unlock service stopped");
    }
}
