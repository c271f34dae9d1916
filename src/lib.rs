//! Page-allocation leak telemetry.
//!
//! The agent half samples a kernel-maintained per-process allocation map,
//! classifies each process against a leak heuristic and pushes reports to a
//! collector over newline-delimited JSON. The collector half accepts those
//! streams, queues records and persists them into a hierarchical document
//! store.

pub mod agent;
pub mod classify;
pub mod collector;
pub mod config;
pub mod export;
pub mod host;
pub mod report;
pub mod signal;
pub mod store;
pub mod tracer;
pub mod transport;
pub mod version;
