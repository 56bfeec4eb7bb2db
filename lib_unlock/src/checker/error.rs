//! Error taxonomy of the evaluation pipeline.
//!
//! Per-document, per-endpoint and per-probe errors are recoverable and get
//! folded into results. [`AggregateError`] and [`LifecycleError`] abort the
//! current run only; the scheduler survives them.

use std::path::PathBuf;

use thiserror::Error;

use crate::configs::app_config::ConfigError;
use crate::retrieve::ky_http::ApiError;

/// One fleet document could not be used. Logged, then skipped.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} is not a valid YAML document: {source}")]
    Yaml {
        url: String,
        #[source]
        source: serde_yml::Error,
    },

    #[error("{url} does not contain a mapping at the top level")]
    NotAMapping { url: String },
}

/// Run-fatal outcome of aggregation.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// Not a single document could be fetched and parsed.
    #[error("no configuration available: {attempted} document(s) attempted, none usable")]
    NoConfigAvailable { attempted: usize },

    /// The merged document could not be rendered or written.
    #[error("could not write merged configuration: {0}")]
    Persist(#[from] PersistenceError),
}

/// Start/stop/restart failures of the routing engine. Run-fatal.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("engine configuration {0} does not exist")]
    ConfigMissing(PathBuf),

    #[error("failed to spawn {binary}: {source}")]
    SpawnFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The process exited early or its control plane never became healthy.
    /// `output_tail` holds the last lines the process printed.
    #[error("engine failed to start: {reason}")]
    StartFailed {
        reason: String,
        output_tail: Vec<String>,
    },

    #[error("engine control plane is unhealthy")]
    Unhealthy,

    #[error("control-plane client setup failed: {0}")]
    Client(#[from] ApiError),
}

/// Selecting an endpoint on the control plane failed. Endpoint-scoped.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("no selector group found on the control plane")]
    NoSelector,

    #[error("control plane rejected selection of '{endpoint}' in '{group}': HTTP {status}")]
    Rejected {
        endpoint: String,
        group: String,
        status: u16,
    },

    #[error("control plane unreachable: {0}")]
    Api(#[from] ApiError),
}

/// Why a single probe produced no evidence. Folded into classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("timeout")]
    Timeout,

    #[error("connection error")]
    Connection,

    #[error("HTTP {0}")]
    HttpStatus(u16),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ProbeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProbeError::Timeout
        } else if e.is_connect() {
            ProbeError::Connection
        } else if let Some(status) = e.status() {
            ProbeError::HttpStatus(status.as_u16())
        } else {
            ProbeError::Other(e.to_string())
        }
    }
}

/// Snapshot, subscription or merged-config write/read failure.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("YAML error on {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yml::Error,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Why a whole run stopped before evaluating every endpoint.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Startup failures of the service. These are the only hard failures.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("results directory unusable: {0}")]
    Storage(#[from] PersistenceError),
}
