//! # Endpoint Evaluation
//!
//! Per-endpoint state machine:
//!
//! ```text
//! Idle -> Switching -> Settling -> Probing(0..K) -> Classified
//!              \
//!               `-> failed ("route switch failed")
//! ```
//!
//! Probes run strictly one after another: the engine has a single active
//! route, so overlapping probes would measure the wrong endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, CACHE_CONTROL, EXPIRES, PRAGMA, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn, Level};

use super::error::{ProbeError, SwitchError};
use super::lifecycle::EngineControl;
use super::model::{Endpoint, EvaluationResult, UnlockStatus};
use super::region::{region_from_url, RegionExtractor};
use crate::configs::app_config::ProbeConfig;

/// What one probe showed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The content was served. Region as detected, never guessed.
    Success { region: Option<String> },
    /// HTTP 403 or the block marker in the body.
    Blocked,
    /// No evidence either way.
    Error(ProbeError),
}

/// Issues one probe against the target service through the active route.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;

    /// Egress address seen through the active route, for diagnostics.
    async fn exit_ip(&self) -> Option<String> {
        None
    }
}

/// # HTTP Prober
///
/// GETs a target URL through the engine's local proxy with caching disabled
/// and redirects followed.
#[derive(Debug, Clone)]
pub struct HttpProber {
    config: ProbeConfig,
    proxy_url: Option<String>,
    extractor: RegionExtractor,
}

impl HttpProber {
    /// `proxy_url` of `None` sends probes directly (used by tests).
    pub fn new(config: ProbeConfig, proxy_url: Option<String>) -> Self {
        Self {
            config,
            proxy_url,
            extractor: RegionExtractor::default(),
        }
    }

    pub fn with_extractor(mut self, extractor: RegionExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    fn headers(&self) -> Result<HeaderMap, ProbeError> {
        let value = |v: &str| {
            HeaderValue::from_str(v).map_err(|e| ProbeError::Other(format!("bad header value: {}", e)))
        };
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, value(&self.config.user_agent)?);
        headers.insert(ACCEPT_LANGUAGE, value(&self.config.accept_language)?);
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, must-revalidate"),
        );
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(EXPIRES, HeaderValue::from_static("0"));
        Ok(headers)
    }

    /// A fresh client per probe: pooled connections would outlive a route
    /// switch and keep the previous endpoint.
    fn client(&self) -> Result<reqwest::Client, ProbeError> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.config.timeout())
            .redirect(Policy::limited(10))
            .default_headers(self.headers()?);
        builder = match &self.proxy_url {
            Some(proxy) => builder.proxy(
                reqwest::Proxy::all(proxy)
                    .map_err(|e| ProbeError::Other(format!("bad proxy url: {}", e)))?,
            ),
            None => builder.no_proxy(),
        };
        builder
            .build()
            .map_err(|e| ProbeError::Other(format!("client setup failed: {}", e)))
    }

    async fn try_probe(&self, url: &str) -> Result<ProbeOutcome, ProbeError> {
        let response = self.client()?.get(url).send().await?;
        let status = response.status();
        let final_url = response.url().to_string();

        if status == StatusCode::FORBIDDEN {
            return Ok(ProbeOutcome::Blocked);
        }

        let body = response.text().await?;
        if !self.config.block_marker.is_empty() && body.contains(&self.config.block_marker) {
            return Ok(ProbeOutcome::Blocked);
        }
        if !status.is_success() {
            return Err(ProbeError::HttpStatus(status.as_u16()));
        }

        let region = region_from_url(&final_url).or_else(|| self.extractor.extract(&body));
        Ok(ProbeOutcome::Success { region })
    }

    async fn lookup_exit_ip(&self, url: &str) -> Result<String, ProbeError> {
        let response = self.client()?.get(url).send().await?.error_for_status()?;
        let body = response.text().await?;
        Ok(describe_exit_ip(&body))
    }
}

/// `ip-api.com` style JSON becomes `"<ip> (<country>)"`; any other body is
/// taken as the address itself.
fn describe_exit_ip(body: &str) -> String {
    let field = |value: &serde_json::Value, key: &str| {
        value.get(key).and_then(serde_json::Value::as_str).map(str::to_string)
    };
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => {
            let ip = field(&value, "query").or_else(|| field(&value, "ip"));
            match (ip, field(&value, "country")) {
                (Some(ip), Some(country)) => format!("{} ({})", ip, country),
                (Some(ip), None) => ip,
                _ => body.trim().to_string(),
            }
        }
        Err(_) => body.trim().to_string(),
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.try_probe(url).await {
            Ok(outcome) => {
                debug!("Probe {} -> {:?}", url, outcome);
                outcome
            }
            Err(e) => {
                debug!("Probe {} failed: {}", url, e);
                ProbeOutcome::Error(e)
            }
        }
    }

    async fn exit_ip(&self) -> Option<String> {
        let url = self.config.exit_ip_url.as_deref()?;
        match self.lookup_exit_ip(url).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!("Exit IP lookup via {} failed: {}", url, e);
                None
            }
        }
    }
}

/// Status, region and explanation derived from a probe sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: UnlockStatus,
    pub region: Option<String>,
    pub detail: String,
}

/// Fixed-threshold classification: `full` needs every probe to succeed.
pub fn classify(outcomes: &[ProbeOutcome]) -> Classification {
    let total = outcomes.len();
    let mut successes = 0;
    let mut blocked = 0;
    let mut region: Option<String> = None;
    let mut reasons: Vec<String> = Vec::new();

    for outcome in outcomes {
        match outcome {
            ProbeOutcome::Success { region: r } => {
                successes += 1;
                if region.is_none() {
                    region = r.clone().filter(|r| !r.is_empty());
                }
            }
            ProbeOutcome::Blocked => blocked += 1,
            ProbeOutcome::Error(e) => {
                let reason = e.to_string();
                if !reasons.contains(&reason) {
                    reasons.push(reason);
                }
            }
        }
    }

    if total == 0 {
        return Classification {
            status: UnlockStatus::Failed,
            region: None,
            detail: "no probes were issued".to_string(),
        };
    }

    if successes == total {
        Classification {
            status: UnlockStatus::Full,
            region,
            detail: format!("all {} probes succeeded", total),
        }
    } else if successes > 0 {
        Classification {
            status: UnlockStatus::Partial,
            region,
            detail: format!("{}/{} probes succeeded", successes, total),
        }
    } else if blocked > 0 {
        Classification {
            status: UnlockStatus::Blocked,
            region: None,
            detail: format!("{}/{} probes blocked", blocked, total),
        }
    } else {
        Classification {
            status: UnlockStatus::Failed,
            region: None,
            detail: format!("all probes failed: {}", reasons.join("; ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvalState {
    Idle,
    Switching,
    Settling,
    Probing(usize),
    Classified,
}

/// Result of one endpoint, plus the switch error when the route could not be
/// selected.
#[derive(Debug)]
pub struct EndpointOutcome {
    pub result: EvaluationResult,
    pub switch_error: Option<SwitchError>,
}

/// # Evaluator
///
/// Drives one endpoint through the state machine.
#[derive(Clone)]
pub struct Evaluator {
    engine: Arc<dyn EngineControl>,
    prober: Arc<dyn Prober>,
    target_urls: Vec<String>,
    settle: Duration,
    probe_gap: Duration,
}

impl Evaluator {
    pub fn new(engine: Arc<dyn EngineControl>, prober: Arc<dyn Prober>, config: &ProbeConfig) -> Self {
        Self {
            engine,
            prober,
            target_urls: config.target_urls.clone(),
            settle: config.settle(),
            probe_gap: config.probe_gap(),
        }
    }

    /// Evaluates `endpoint`. Cancellation only shortens the settle wait; the
    /// probes of this endpoint still run so its result is complete.
    pub async fn evaluate(&self, endpoint: &Endpoint, cancel: &CancellationToken) -> EndpointOutcome {
        let mut outcomes: Vec<ProbeOutcome> = Vec::with_capacity(self.target_urls.len());
        let mut state = EvalState::Idle;

        loop {
            trace!("{}: {:?}", endpoint.name, state);
            state = match state {
                EvalState::Idle => EvalState::Switching,
                EvalState::Switching => match self.engine.switch_route(&endpoint.name).await {
                    Ok(()) => EvalState::Settling,
                    Err(e) => {
                        warn!("Switching to '{}' failed: {}", endpoint.name, e);
                        let result = EvaluationResult::new(
                            endpoint.clone(),
                            UnlockStatus::Failed,
                            None,
                            format!("route switch failed: {}", e),
                        );
                        return EndpointOutcome {
                            result,
                            switch_error: Some(e),
                        };
                    }
                },
                EvalState::Settling => {
                    tokio::select! {
                        _ = cancel.cancelled() => debug!("Settle cut short by shutdown"),
                        _ = sleep(self.settle) => {}
                    }
                    self.verify_route(&endpoint.name).await;
                    if tracing::enabled!(Level::DEBUG) {
                        if let Some(ip) = self.prober.exit_ip().await {
                            debug!("{}: exit IP {}", endpoint.name, ip);
                        }
                    }
                    EvalState::Probing(0)
                }
                EvalState::Probing(idx) if idx < self.target_urls.len() => {
                    if idx > 0 && !self.probe_gap.is_zero() {
                        sleep(self.probe_gap).await;
                    }
                    outcomes.push(self.prober.probe(&self.target_urls[idx]).await);
                    EvalState::Probing(idx + 1)
                }
                EvalState::Probing(_) => EvalState::Classified,
                EvalState::Classified => {
                    let c = classify(&outcomes);
                    debug!("{}: {} {:?} ({})", endpoint.name, c.status, c.region, c.detail);
                    return EndpointOutcome {
                        result: EvaluationResult::new(endpoint.clone(), c.status, c.region, c.detail),
                        switch_error: None,
                    };
                }
            };
        }
    }

    /// The engine is authoritative; a mismatch is only reported.
    async fn verify_route(&self, expected: &str) {
        match self.engine.current_route().await {
            Some(active) if active == expected => {}
            Some(active) => warn!("Active route is '{}', expected '{}'", active, expected),
            None => debug!("Active route could not be queried"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::error::LifecycleError;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn success(region: Option<&str>) -> ProbeOutcome {
        ProbeOutcome::Success {
            region: region.map(str::to_string),
        }
    }

    #[test]
    fn all_success_is_full() {
        let c = classify(&[success(Some("US")), success(Some("US"))]);
        assert_eq!(c.status, UnlockStatus::Full);
        assert_eq!(c.region.as_deref(), Some("US"));
    }

    #[test]
    fn some_success_is_partial() {
        let c = classify(&[success(Some("US")), ProbeOutcome::Blocked]);
        assert_eq!(c.status, UnlockStatus::Partial);
        assert_eq!(c.region.as_deref(), Some("US"));

        let c = classify(&[ProbeOutcome::Error(ProbeError::Timeout), success(Some("JP"))]);
        assert_eq!(c.status, UnlockStatus::Partial);
        assert_eq!(c.region.as_deref(), Some("JP"));
    }

    #[test]
    fn no_success_with_block_is_blocked() {
        let c = classify(&[ProbeOutcome::Blocked, ProbeOutcome::Blocked]);
        assert_eq!(c.status, UnlockStatus::Blocked);
        assert_eq!(c.region, None);

        let c = classify(&[ProbeOutcome::Blocked, ProbeOutcome::Error(ProbeError::Timeout)]);
        assert_eq!(c.status, UnlockStatus::Blocked);
    }

    #[test]
    fn errors_only_is_failed_with_distinct_reasons() {
        let c = classify(&[
            ProbeOutcome::Error(ProbeError::Timeout),
            ProbeOutcome::Error(ProbeError::Connection),
            ProbeOutcome::Error(ProbeError::Timeout),
        ]);
        assert_eq!(c.status, UnlockStatus::Failed);
        assert_eq!(c.detail, "all probes failed: timeout; connection error");
    }

    #[test]
    fn first_non_empty_region_is_kept() {
        let c = classify(&[success(None), success(Some("GB")), success(Some("US"))]);
        assert_eq!(c.status, UnlockStatus::Full);
        assert_eq!(c.region.as_deref(), Some("GB"));

        let c = classify(&[success(None), success(None)]);
        assert_eq!(c.region, None);
    }

    #[test]
    fn classification_is_deterministic() {
        let outcomes = vec![success(Some("US")), ProbeOutcome::Blocked];
        assert_eq!(classify(&outcomes), classify(&outcomes));
    }

    struct FakeEngine {
        switch_ok: bool,
        switches: AtomicUsize,
        active: Mutex<Option<String>>,
    }

    impl FakeEngine {
        fn new(switch_ok: bool) -> Self {
            Self {
                switch_ok,
                switches: AtomicUsize::new(0),
                active: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl EngineControl for FakeEngine {
        async fn start(&self, _: &Path) -> Result<(), LifecycleError> {
            Ok(())
        }
        async fn restart(&self, _: &Path) -> Result<(), LifecycleError> {
            Ok(())
        }
        async fn ensure_stopped(&self) {}
        async fn is_healthy(&self) -> bool {
            true
        }
        async fn switch_route(&self, endpoint: &str) -> Result<(), SwitchError> {
            self.switches.fetch_add(1, Ordering::SeqCst);
            if self.switch_ok {
                *self.active.lock().unwrap() = Some(endpoint.to_string());
                Ok(())
            } else {
                Err(SwitchError::Rejected {
                    endpoint: endpoint.to_string(),
                    group: "GLOBAL".to_string(),
                    status: 404,
                })
            }
        }
        async fn current_route(&self) -> Option<String> {
            self.active.lock().unwrap().clone()
        }
    }

    struct ScriptedProber {
        outcomes: Mutex<Vec<ProbeOutcome>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _url: &str) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().remove(0)
        }
    }

    fn quick_config() -> ProbeConfig {
        ProbeConfig {
            target_urls: vec!["http://t/1".to_string(), "http://t/2".to_string()],
            settle_ms: 0,
            probe_gap_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn switch_failure_skips_probing() {
        let engine = Arc::new(FakeEngine::new(false));
        let prober = Arc::new(ScriptedProber {
            outcomes: Mutex::new(vec![]),
            calls: AtomicUsize::new(0),
        });
        let evaluator = Evaluator::new(engine.clone(), prober.clone(), &quick_config());

        let outcome = evaluator
            .evaluate(&Endpoint::new("x", "ss", "h", 1), &CancellationToken::new())
            .await;
        assert_eq!(outcome.result.status, UnlockStatus::Failed);
        assert!(outcome.result.detail.starts_with("route switch failed"));
        assert!(outcome.switch_error.is_some());
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probes_every_target_in_order() {
        let engine = Arc::new(FakeEngine::new(true));
        let prober = Arc::new(ScriptedProber {
            outcomes: Mutex::new(vec![success(Some("SG")), ProbeOutcome::Blocked]),
            calls: AtomicUsize::new(0),
        });
        let evaluator = Evaluator::new(engine.clone(), prober.clone(), &quick_config());

        let outcome = evaluator
            .evaluate(&Endpoint::new("sg-1", "ss", "h", 1), &CancellationToken::new())
            .await;
        assert_eq!(outcome.result.status, UnlockStatus::Partial);
        assert_eq!(outcome.result.region.as_deref(), Some("SG"));
        assert_eq!(outcome.result.name(), "sg-1");
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.switches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_still_finishes_the_endpoint() {
        let engine = Arc::new(FakeEngine::new(true));
        let prober = Arc::new(ScriptedProber {
            outcomes: Mutex::new(vec![success(None), success(None)]),
            calls: AtomicUsize::new(0),
        });
        let mut config = quick_config();
        config.settle_ms = 60_000;
        let evaluator = Evaluator::new(engine, prober.clone(), &config);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            evaluator.evaluate(&Endpoint::new("a", "ss", "h", 1), &cancel),
        )
        .await
        .expect("settle must not wait after cancellation");
        assert_eq!(outcome.result.status, UnlockStatus::Full);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 2);
    }
}
