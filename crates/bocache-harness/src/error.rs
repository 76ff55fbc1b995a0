use std::path::PathBuf;

use bocache_core::BoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// An allocator error the workload cannot absorb (OOM is counted, not raised).
    #[error("allocator: {0}")]
    Alloc(#[from] BoError),
    #[error("{path}: {errors} invalid field(s) in {lines} line(s)")]
    InvalidLog {
        path: PathBuf,
        lines: usize,
        errors: usize,
    },
}
