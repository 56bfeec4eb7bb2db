//! # Data Model
//!
//! Endpoints as loaded from fleet documents, per-endpoint evaluation results,
//! and the run snapshot that aggregates them.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// # Endpoint
///
/// One proxy from a fleet document. Only `name` is interpreted; every other
/// key (`type`, `server`, `port`, `cipher`, `ws-opts`, ...) rides along in
/// `extra` exactly as the document wrote it, so the engine configuration and
/// the subscription carry the original values back out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Identity of the endpoint within a run.
    pub name: String,
    /// Engine-specific fields, passed through verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Endpoint {
    /// Minimal endpoint, mostly useful in tests.
    pub fn new(name: impl Into<String>, kind: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        let mut extra = Map::new();
        extra.insert("type".to_string(), Value::String(kind.into()));
        extra.insert("server".to_string(), Value::String(server.into()));
        extra.insert("port".to_string(), Value::from(port));
        Self {
            name: name.into(),
            extra,
        }
    }

    /// Transport type (`ss`, `vmess`, `trojan`, `relay`, ...).
    pub fn kind(&self) -> Option<&str> {
        self.extra.get("type").and_then(Value::as_str)
    }

    pub fn server(&self) -> Option<&str> {
        self.extra.get("server").and_then(Value::as_str)
    }

    /// Port as a number; some fleet documents quote it.
    pub fn port(&self) -> Option<u16> {
        match self.extra.get("port")? {
            Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Access level granted by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlockStatus {
    /// Every probe succeeded.
    Full,
    /// Some, but not all, probes succeeded.
    Partial,
    /// No probe succeeded and at least one was blocked by the target service.
    Blocked,
    /// No probe succeeded and none was blocked: errors only, or no switch.
    Failed,
}

impl UnlockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnlockStatus::Full => "full",
            UnlockStatus::Partial => "partial",
            UnlockStatus::Blocked => "blocked",
            UnlockStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UnlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome for one endpoint in one run. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub endpoint: Endpoint,
    pub status: UnlockStatus,
    /// Detected region code, e.g. `US` or `SG-EN`. Unset rather than guessed.
    pub region: Option<String>,
    /// Human-readable explanation.
    pub detail: String,
    pub checked_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn new(
        endpoint: Endpoint,
        status: UnlockStatus,
        region: Option<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            status,
            region,
            detail: detail.into(),
            checked_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.endpoint.name
    }
}

/// Per-status counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub full: usize,
    pub partial: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: UnlockStatus) {
        match status {
            UnlockStatus::Full => self.full += 1,
            UnlockStatus::Partial => self.partial += 1,
            UnlockStatus::Blocked => self.blocked += 1,
            UnlockStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.full + self.partial + self.blocked + self.failed
    }
}

/// # Run Summary
///
/// Derived entirely from a result list; see [`RunSummary::from_results`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    #[serde(flatten)]
    pub counts: StatusCounts,
    /// Region code -> status counts, for results that carry a region.
    pub regions: BTreeMap<String, StatusCounts>,
}

impl RunSummary {
    pub fn from_results(results: &[EvaluationResult]) -> Self {
        let mut summary = RunSummary {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            summary.counts.add(result.status);
            if let Some(region) = &result.region {
                summary
                    .regions
                    .entry(region.clone())
                    .or_default()
                    .add(result.status);
            }
        }
        summary
    }

    /// Full plus partial.
    pub fn unlocked(&self) -> usize {
        self.counts.full + self.counts.partial
    }
}

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunTrigger::Scheduled => f.write_str("scheduled"),
            RunTrigger::Manual => f.write_str("manual"),
        }
    }
}

/// # Evaluation Run
///
/// The snapshot of one pass over the fleet. Results keep evaluation order.
/// The summary is computed once from the results when the run is finalized,
/// and the fields are private so the two cannot drift apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRun {
    trigger: RunTrigger,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    /// False when the run stopped early (lifecycle failure or shutdown).
    complete: bool,
    abort_reason: Option<String>,
    summary: RunSummary,
    results: Vec<EvaluationResult>,
}

impl EvaluationRun {
    /// Finalizes a run that went through every endpoint.
    pub fn completed(
        trigger: RunTrigger,
        started_at: DateTime<Utc>,
        results: Vec<EvaluationResult>,
    ) -> Self {
        Self::finalize(trigger, started_at, results, None)
    }

    /// Finalizes a run that stopped early, keeping what was collected.
    pub fn aborted(
        trigger: RunTrigger,
        started_at: DateTime<Utc>,
        results: Vec<EvaluationResult>,
        reason: impl Into<String>,
    ) -> Self {
        Self::finalize(trigger, started_at, results, Some(reason.into()))
    }

    fn finalize(
        trigger: RunTrigger,
        started_at: DateTime<Utc>,
        results: Vec<EvaluationResult>,
        abort_reason: Option<String>,
    ) -> Self {
        Self {
            trigger,
            started_at,
            finished_at: Utc::now(),
            complete: abort_reason.is_none(),
            abort_reason,
            summary: RunSummary::from_results(&results),
            results,
        }
    }

    pub fn trigger(&self) -> RunTrigger {
        self.trigger
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn results(&self) -> &[EvaluationResult] {
        &self.results
    }

    /// Endpoints classified `full`, in evaluation order.
    pub fn full_endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.results
            .iter()
            .filter(|r| r.status == UnlockStatus::Full)
            .map(|r| &r.endpoint)
    }
}
