//! # Logging
//!
//! Process-wide `tracing` subscriber setup. Library code only ever emits
//! through the `tracing` macros; the binary decides where the events go.

/// Console + daily rolling JSON file subscriber.
pub mod tracing_setup;
