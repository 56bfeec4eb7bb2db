//! # Checker
//!
//! The proxy evaluation pipeline, leaves first:
//!
//! - [`region`]: region codes from URLs and response bodies.
//! - [`aggregator`]: fleet documents merged into one engine configuration.
//! - [`lifecycle`]: the routing-engine process and its control plane.
//! - [`evaluator`]: switch, settle, probe and classify one endpoint.
//! - [`orchestrator`]: one run over every endpoint.
//! - [`store`]: the latest snapshot and the subscription export.
//! - [`scheduler`]: cron loop, manual runs, mutual exclusion.
//! - [`service`]: the facade used by the front-end.

pub mod aggregator;
pub mod error;
pub mod evaluator;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod region;
pub mod scheduler;
pub mod service;
pub mod store;

pub use error::{
    AggregateError, FetchError, LifecycleError, PersistenceError, ProbeError, RunError,
    ServiceError, SwitchError,
};
pub use model::{Endpoint, EvaluationResult, EvaluationRun, RunSummary, RunTrigger, UnlockStatus};
pub use service::{ServiceStatus, UnlockService};
