//! # lib_unlock
//!
//! Shared library behind the unlock checker daemon. It decides, for every
//! proxy endpoint of a fleet, whether routing through it unlocks the
//! region-restricted catalogue of a target media service.
//!
//! Modules are gated by cargo features so that small tools can pull in only
//! what they need:
//!
//! - **`configs`**: the YAML application configuration.
//! - **`loggers`**: `tracing` subscriber setup (console + rolling JSON file).
//! - **`retrieve`**: the control-plane HTTP client.
//! - **`checker`**: the evaluation pipeline itself.

#![forbid(unsafe_code)]

#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "loggers")]
pub mod loggers;
#[cfg(feature = "retrieve")]
pub mod retrieve;
#[cfg(feature = "checker")]
pub mod checker;

#[cfg(feature = "configs")]
pub use configs::app_config::{load_config, AppConfig, ConfigError};
#[cfg(feature = "loggers")]
pub use loggers::tracing_setup::{setup_logging, LoggingOptions};
#[cfg(feature = "checker")]
pub use checker::service::UnlockService;
