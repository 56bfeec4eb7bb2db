//! # Data Retrieval Module
//!
//! HTTP plumbing shared by the pipeline. The only client here talks to the
//! routing engine's control-plane API; fleet documents and probes use plain
//! `reqwest` clients with their own timeouts.

/// Control-plane API client with bearer auth and per-request timeouts.
pub mod ky_http;
