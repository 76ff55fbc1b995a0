//! Tooling around the BO cache allocator.
//!
//! This crate provides:
//! - Structured JSONL logging of allocator lifecycle records
//! - A seeded churn workload against the simulated backend
//! - Machine-readable churn reports and artifact indexes

#![forbid(unsafe_code)]

pub mod error;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use structured_log::{LogEmitter, LogEntry, LogLevel};
pub use workload::{ChurnConfig, ChurnReport, Workload};
