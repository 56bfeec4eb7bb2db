//! # Run Orchestrator
//!
//! One run: aggregate the fleet, bring the engine up on the merged
//! configuration (reusing the running session when nothing changed), walk
//! every endpoint through the evaluator in list order, then persist the
//! snapshot and the subscription.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::aggregator::ConfigAggregator;
use super::error::{AggregateError, LifecycleError, PersistenceError, RunError};
use super::evaluator::{Evaluator, Prober};
use super::lifecycle::EngineControl;
use super::model::{Endpoint, EvaluationResult, EvaluationRun, RunTrigger, UnlockStatus};
use super::store::ResultStore;
use crate::configs::app_config::AppConfig;

/// Progress is logged every this many endpoints.
const PROGRESS_EVERY: usize = 10;

/// Executes one complete run. The scheduler only knows this seam.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    /// Runs the pipeline once.
    ///
    /// A cancelled run returns `Ok` with an incomplete snapshot. Aggregation
    /// and lifecycle failures return `Err`.
    async fn execute(
        &self,
        trigger: RunTrigger,
        cancel: &CancellationToken,
    ) -> Result<EvaluationRun, RunError>;
}

/// # Run Orchestrator
pub struct RunOrchestrator {
    config: Arc<AppConfig>,
    aggregator: ConfigAggregator,
    engine: Arc<dyn EngineControl>,
    evaluator: Evaluator,
    store: Arc<ResultStore>,
    /// Digest of the configuration the engine was last (re)started with.
    last_digest: Mutex<Option<String>>,
}

impl RunOrchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        engine: Arc<dyn EngineControl>,
        prober: Arc<dyn Prober>,
        store: Arc<ResultStore>,
    ) -> Self {
        Self {
            aggregator: ConfigAggregator::new(config.probe.fetch_timeout()),
            evaluator: Evaluator::new(engine.clone(), prober, &config.probe),
            config,
            engine,
            store,
            last_digest: Mutex::new(None),
        }
    }

    /// Aggregates, writes the merged document and makes sure the engine runs
    /// it. Returns the endpoints to evaluate.
    async fn prepare(&self) -> Result<Vec<Endpoint>, RunError> {
        let engine_cfg = &self.config.engine;
        let aggregated = self.aggregator.aggregate(&self.config.config_urls).await?;
        let rendered = aggregated.render(engine_cfg).map_err(|e| {
            AggregateError::Persist(PersistenceError::Yaml {
                path: engine_cfg.config_path.clone(),
                source: e,
            })
        })?;

        let mut last_digest = self.last_digest.lock().await;
        let changed = last_digest.as_deref() != Some(rendered.digest.as_str());
        if changed {
            rendered
                .write_to(&engine_cfg.config_path)
                .map_err(AggregateError::from)?;
            info!("Merged configuration changed, restarting engine");
            *last_digest = None;
            self.engine.restart(&engine_cfg.config_path).await?;
        } else if !self.engine.is_healthy().await {
            warn!("Engine is unhealthy, restarting with unchanged configuration");
            self.engine.restart(&engine_cfg.config_path).await?;
        } else {
            info!("Merged configuration unchanged, reusing running engine");
        }
        *last_digest = Some(rendered.digest);

        Ok(aggregated.into_endpoints())
    }

    /// Persistence failures are logged; they never fail the run.
    fn persist(&self, run: &EvaluationRun) {
        if !run.is_complete() && run.results().is_empty() {
            info!("Run stopped before any endpoint was evaluated, previous snapshot kept");
            return;
        }
        if let Err(e) = self.store.save(run) {
            error!("Could not save run snapshot: {}", e);
        }
        if run.is_complete() {
            if let Err(e) = self.store.save_subscription(run) {
                error!("Could not save subscription: {}", e);
            }
        } else {
            info!("Run incomplete, previous subscription left in place");
        }
    }

    fn log_summary(run: &EvaluationRun) {
        let summary = run.summary();
        info!(
            "Run finished ({}, complete: {}): {} endpoints, {} full, {} partial, {} blocked, {} failed",
            run.trigger(),
            run.is_complete(),
            summary.total,
            summary.counts.full,
            summary.counts.partial,
            summary.counts.blocked,
            summary.counts.failed
        );
        for (region, counts) in &summary.regions {
            info!(
                "  {}: {} full, {} partial",
                region, counts.full, counts.partial
            );
        }
    }
}

fn unlocked(results: &[EvaluationResult]) -> usize {
    results
        .iter()
        .filter(|r| matches!(r.status, UnlockStatus::Full | UnlockStatus::Partial))
        .count()
}

#[async_trait]
impl RunExecutor for RunOrchestrator {
    async fn execute(
        &self,
        trigger: RunTrigger,
        cancel: &CancellationToken,
    ) -> Result<EvaluationRun, RunError> {
        let started_at = Utc::now();
        info!("Run started ({})", trigger);

        let endpoints = self.prepare().await.inspect_err(|e| {
            error!("Run aborted before evaluation: {}", e);
        })?;

        let total = endpoints.len();
        info!("Evaluating {} endpoints", total);

        let mut results: Vec<EvaluationResult> = Vec::with_capacity(total);
        let mut fatal: Option<LifecycleError> = None;

        for (idx, endpoint) in endpoints.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let outcome = self.evaluator.evaluate(endpoint, cancel).await;
            let switch_failed = outcome.switch_error.is_some();
            results.push(outcome.result);

            if switch_failed && !self.engine.is_healthy().await {
                error!("Engine lost after '{}', aborting run", endpoint.name);
                fatal = Some(LifecycleError::Unhealthy);
                break;
            }

            let done = idx + 1;
            if done % PROGRESS_EVERY == 0 && done < total {
                info!(
                    "Progress: {}/{} evaluated, {} unlocked so far",
                    done,
                    total,
                    unlocked(&results)
                );
            }
        }

        let evaluated = results.len();
        let run = match &fatal {
            Some(e) => EvaluationRun::aborted(trigger, started_at, results, e.to_string()),
            None if evaluated < total => EvaluationRun::aborted(
                trigger,
                started_at,
                results,
                format!(
                    "shutdown requested after {} of {} endpoints",
                    evaluated, total
                ),
            ),
            None => EvaluationRun::completed(trigger, started_at, results),
        };

        self.persist(&run);
        Self::log_summary(&run);

        match fatal {
            Some(e) => Err(e.into()),
            None => Ok(run),
        }
    }
}
