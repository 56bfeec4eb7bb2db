//! # Configuration Modules
//!
//! The application configuration is a single YAML document. It is parsed once
//! at startup into an [`AppConfig`](app_config::AppConfig) which is then shared
//! read-only (behind an `Arc`) with every component that needs it.

/// YAML-backed application configuration with defaults and validation.
pub mod app_config;
