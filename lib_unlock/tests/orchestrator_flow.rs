//! # Run Flow
//!
//! Whole runs against mock fleet documents, a scripted engine and a prober
//! whose answers depend on the active route.

mod common;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use lib_unlock::checker::error::{
    AggregateError, LifecycleError, ProbeError, RunError, SwitchError,
};
use lib_unlock::checker::evaluator::{ProbeOutcome, Prober};
use lib_unlock::checker::lifecycle::EngineControl;
use lib_unlock::checker::model::{RunTrigger, UnlockStatus};
use lib_unlock::checker::orchestrator::{RunExecutor, RunOrchestrator};
use lib_unlock::checker::store::ResultStore;
use lib_unlock::checker::UnlockService;
use lib_unlock::configs::app_config::{AppConfig, EngineConfig, ProbeConfig, StorageConfig};

const FLEET_A: &str = r#"
proxies:
  - { name: us-1, type: ss, server: 198.51.100.1, port: 8388, cipher: aes-256-gcm, password: a }
  - { name: jp-1, type: vmess, server: 198.51.100.2, port: "443", uuid: 11111111-2222-4333-8444-555555555555 }
rules:
  - MATCH,GLOBAL
"#;

const FLEET_B: &str = r#"
proxies:
  - { name: sg-1, type: trojan, server: 198.51.100.3, port: 443, password: c }
  - { name: hk-1, type: ss, server: 198.51.100.4, port: 8388, cipher: aes-128-gcm, password: d }
"#;

const PROBE_A: &str = "http://target.test/title/1";
const PROBE_B: &str = "http://target.test/title/2";

fn mock_fleet() -> Router {
    Router::new()
        .route("/a.yaml", get(|| async { FLEET_A }))
        .route("/b.yaml", get(|| async { FLEET_B }))
        .route(
            "/slow-a.yaml",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                FLEET_A
            }),
        )
}

/// Engine whose control plane is a few flags.
#[derive(Default)]
struct ScriptedEngine {
    healthy: AtomicBool,
    restarts: AtomicUsize,
    route: Arc<Mutex<Option<String>>>,
    reject: HashSet<String>,
    die_on_reject: bool,
}

impl ScriptedEngine {
    fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineControl for ScriptedEngine {
    async fn start(&self, config_path: &Path) -> Result<(), LifecycleError> {
        if !config_path.exists() {
            return Err(LifecycleError::ConfigMissing(config_path.to_path_buf()));
        }
        self.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self, config_path: &Path) -> Result<(), LifecycleError> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.ensure_stopped().await;
        self.start(config_path).await
    }

    async fn ensure_stopped(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn switch_route(&self, endpoint: &str) -> Result<(), SwitchError> {
        if self.reject.contains(endpoint) {
            if self.die_on_reject {
                self.healthy.store(false, Ordering::SeqCst);
            }
            return Err(SwitchError::Rejected {
                endpoint: endpoint.to_string(),
                group: "GLOBAL".to_string(),
                status: 400,
            });
        }
        *self.route.lock().unwrap() = Some(endpoint.to_string());
        Ok(())
    }

    async fn current_route(&self) -> Option<String> {
        self.route.lock().unwrap().clone()
    }
}

/// Answers according to the route the engine currently has selected.
struct RouteProber {
    route: Arc<Mutex<Option<String>>>,
    answers: HashMap<(&'static str, &'static str), ProbeOutcome>,
}

impl RouteProber {
    fn for_engine(engine: &ScriptedEngine) -> Self {
        let success = |region: &str| ProbeOutcome::Success {
            region: Some(region.to_string()),
        };
        let answers = HashMap::from([
            (("us-1", PROBE_A), success("US")),
            (("us-1", PROBE_B), success("US")),
            (("jp-1", PROBE_A), success("JP")),
            (("jp-1", PROBE_B), ProbeOutcome::Blocked),
            (("sg-1", PROBE_A), ProbeOutcome::Blocked),
            (("sg-1", PROBE_B), ProbeOutcome::Blocked),
        ]);
        Self {
            route: Arc::clone(&engine.route),
            answers,
        }
    }
}

#[async_trait]
impl Prober for RouteProber {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        let route = self.route.lock().unwrap().clone().unwrap_or_default();
        self.answers
            .iter()
            .find(|((name, target), _)| *name == route && *target == url)
            .map(|(_, outcome)| outcome.clone())
            .unwrap_or(ProbeOutcome::Error(ProbeError::Timeout))
    }
}

fn app_config(dir: &Path, fleet: SocketAddr, docs: &[&str]) -> Arc<AppConfig> {
    Arc::new(AppConfig {
        config_urls: docs
            .iter()
            .map(|d| format!("http://{}/{}", fleet, d))
            .collect(),
        engine: EngineConfig {
            config_path: dir.join("engine").join("config.yaml"),
            ..Default::default()
        },
        probe: ProbeConfig {
            target_urls: vec![PROBE_A.to_string(), PROBE_B.to_string()],
            settle_ms: 0,
            probe_gap_ms: 0,
            fetch_timeout_secs: 5,
            ..Default::default()
        },
        storage: StorageConfig {
            results_dir: dir.join("results"),
            ..Default::default()
        },
        ..Default::default()
    })
}

struct Harness {
    _dir: tempfile::TempDir,
    config: Arc<AppConfig>,
    engine: Arc<ScriptedEngine>,
    store: Arc<ResultStore>,
    orchestrator: RunOrchestrator,
}

async fn harness(docs: &[&str], engine: ScriptedEngine) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let fleet = common::serve(mock_fleet()).await;
    let config = app_config(dir.path(), fleet, docs);
    let engine = Arc::new(engine);
    let prober = Arc::new(RouteProber::for_engine(&engine));
    let store = Arc::new(ResultStore::new(&config.storage));
    let orchestrator = RunOrchestrator::new(
        Arc::clone(&config),
        engine.clone(),
        prober,
        Arc::clone(&store),
    );
    Harness {
        _dir: dir,
        config,
        engine,
        store,
        orchestrator,
    }
}

#[tokio::test]
async fn full_run_classifies_persists_and_exports() {
    let h = harness(&["a.yaml", "b.yaml"], ScriptedEngine::default()).await;

    let run = h
        .orchestrator
        .execute(RunTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap();

    assert!(run.is_complete());
    assert_eq!(run.trigger(), RunTrigger::Manual);
    let observed: Vec<(&str, UnlockStatus, Option<&str>)> = run
        .results()
        .iter()
        .map(|r| (r.name(), r.status, r.region.as_deref()))
        .collect();
    assert_eq!(
        observed,
        vec![
            ("us-1", UnlockStatus::Full, Some("US")),
            ("jp-1", UnlockStatus::Partial, Some("JP")),
            ("sg-1", UnlockStatus::Blocked, None),
            ("hk-1", UnlockStatus::Failed, None),
        ]
    );
    assert_eq!(run.results()[3].detail, "all probes failed: timeout");

    let summary = run.summary();
    assert_eq!(summary.total, 4);
    assert_eq!(summary.counts.full, 1);
    assert_eq!(summary.counts.partial, 1);
    assert_eq!(summary.counts.blocked, 1);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.regions.len(), 2);
    assert_eq!(summary.regions["US"].full, 1);
    assert_eq!(summary.regions["JP"].partial, 1);

    assert_eq!(h.store.load().unwrap(), Some(run));

    let subscription = h.store.subscription().unwrap().unwrap();
    assert!(subscription.contains("us-1-NF"));
    assert!(subscription.contains("aes-256-gcm"));
    assert!(!subscription.contains("jp-1"));

    let engine_config = std::fs::read_to_string(&h.config.engine.config_path).unwrap();
    assert!(engine_config.contains("hk-1"));
    assert!(engine_config.contains("MATCH,GLOBAL"));
    assert_eq!(h.engine.restarts(), 1);
}

#[tokio::test]
async fn unchanged_configuration_reuses_the_engine() {
    let h = harness(&["a.yaml"], ScriptedEngine::default()).await;
    let cancel = CancellationToken::new();

    h.orchestrator.execute(RunTrigger::Scheduled, &cancel).await.unwrap();
    h.orchestrator.execute(RunTrigger::Scheduled, &cancel).await.unwrap();
    assert_eq!(h.engine.restarts(), 1);

    // A dead engine is restarted even when nothing changed.
    h.engine.healthy.store(false, Ordering::SeqCst);
    h.orchestrator.execute(RunTrigger::Scheduled, &cancel).await.unwrap();
    assert_eq!(h.engine.restarts(), 2);
}

#[tokio::test]
async fn engine_loss_aborts_and_keeps_partial_snapshot() {
    let engine = ScriptedEngine {
        reject: HashSet::from(["jp-1".to_string()]),
        die_on_reject: true,
        ..Default::default()
    };
    let h = harness(&["a.yaml", "b.yaml"], engine).await;

    let err = h
        .orchestrator
        .execute(RunTrigger::Scheduled, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Lifecycle(LifecycleError::Unhealthy)));

    let snapshot = h.store.load().unwrap().unwrap();
    assert!(!snapshot.is_complete());
    assert!(snapshot.abort_reason().is_some());
    assert_eq!(snapshot.results().len(), 2);
    assert_eq!(snapshot.results()[1].status, UnlockStatus::Failed);
    assert!(snapshot.results()[1].detail.starts_with("route switch failed"));

    // Incomplete runs never replace the subscription.
    assert_eq!(h.store.subscription().unwrap(), None);
}

#[tokio::test]
async fn rejected_switch_with_live_engine_only_fails_the_endpoint() {
    let engine = ScriptedEngine {
        reject: HashSet::from(["us-1".to_string()]),
        ..Default::default()
    };
    let h = harness(&["a.yaml"], engine).await;

    let run = h
        .orchestrator
        .execute(RunTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap();
    assert!(run.is_complete());
    assert_eq!(run.results()[0].status, UnlockStatus::Failed);
    assert_eq!(run.results()[1].status, UnlockStatus::Partial);
}

#[tokio::test]
async fn no_usable_document_writes_nothing() {
    let closed = common::closed_addr().await;
    let dir = tempfile::tempdir().unwrap();
    let config = app_config(dir.path(), closed, &["a.yaml"]);
    let engine = Arc::new(ScriptedEngine::default());
    let prober = Arc::new(RouteProber::for_engine(&engine));
    let store = Arc::new(ResultStore::new(&config.storage));
    let orchestrator =
        RunOrchestrator::new(Arc::clone(&config), engine.clone(), prober, Arc::clone(&store));

    let err = orchestrator
        .execute(RunTrigger::Scheduled, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RunError::Aggregate(AggregateError::NoConfigAvailable { attempted: 1 })
    ));
    assert_eq!(store.load().unwrap(), None);
    assert!(!config.engine.config_path.exists());
    assert_eq!(engine.restarts(), 0);
}

#[tokio::test]
async fn cancelled_before_first_endpoint_keeps_previous_snapshot() {
    let h = harness(&["a.yaml", "b.yaml"], ScriptedEngine::default()).await;

    let first = h
        .orchestrator
        .execute(RunTrigger::Manual, &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let second = h
        .orchestrator
        .execute(RunTrigger::Scheduled, &cancel)
        .await
        .unwrap();

    assert!(!second.is_complete());
    assert!(second.results().is_empty());
    assert_eq!(
        second.abort_reason(),
        Some("shutdown requested after 0 of 4 endpoints")
    );
    assert_eq!(h.store.load().unwrap(), Some(first));
}

async fn wait_for_snapshot(service: &UnlockService) -> bool {
    for _ in 0..100 {
        if matches!(service.latest_run(), Ok(Some(_))) && !service.get_status().await.run_in_progress {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn service_runs_on_demand_and_reports_status() {
    let dir = tempfile::tempdir().unwrap();
    let fleet = common::serve(mock_fleet()).await;
    let config = app_config(dir.path(), fleet, &["slow-a.yaml"]);
    let engine = Arc::new(ScriptedEngine::default());
    let prober = Arc::new(RouteProber::for_engine(&engine));
    let shutdown = CancellationToken::new();

    let service =
        UnlockService::with_components(config, engine.clone(), prober, shutdown.clone()).unwrap();

    let before = service.get_status().await;
    assert!(!before.run_in_progress);
    assert_eq!(before.last_run_complete, None);
    assert!(service.downloadable_snapshot().unwrap().is_none());

    assert!(service.run_now());
    assert!(!service.run_now());
    assert!(wait_for_snapshot(&service).await);

    let status = service.get_status().await;
    assert_eq!(status.last_run_complete, Some(true));
    assert_eq!(status.last_summary.map(|s| s.total), Some(2));
    assert!(status.engine_healthy);
    assert!(!status.scheduler_running);

    let bytes = service.downloadable_snapshot().unwrap().unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["trigger"], "manual");
    assert!(service.subscription().unwrap().unwrap().contains("us-1-NF"));

    assert!(service.start_scheduler());
    assert!(!service.start_scheduler());
    assert!(service.get_status().await.scheduler_running);
    assert!(service.stop_scheduler());
    assert!(!service.stop_scheduler());

    service.shutdown(Duration::from_secs(2)).await;
    assert!(shutdown.is_cancelled());
    assert!(!engine.healthy.load(Ordering::SeqCst));
    assert!(!service.start_scheduler());
}

#[test]
fn invalid_cron_is_a_startup_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = (*app_config(dir.path(), "127.0.0.1:1".parse().unwrap(), &[])).clone();
    config.schedule.cron = "not a cron".to_string();
    let engine = Arc::new(ScriptedEngine::default());
    let prober = Arc::new(RouteProber::for_engine(&engine));

    let result = UnlockService::with_components(
        Arc::new(config),
        engine,
        prober,
        CancellationToken::new(),
    );
    assert!(result.is_err());
}
