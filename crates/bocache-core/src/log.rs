//! Structured BO lifecycle records.
//!
//! The device keeps a bounded ring of records describing allocation-path
//! decisions (cache hits, backend failures, evictions, shared-BO bypasses,
//! contract violations). Tooling drains the ring and exports it as JSONL.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::bo::bucket::bucket_index;

/// Lifecycle record severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BoLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl BoLogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoLogRecord {
    /// Monotonic decision id, unique per device.
    pub decision_id: u64,
    /// Correlation id: `bocache::<op>::<decision id>`.
    pub trace_id: String,
    pub level: BoLogLevel,
    /// Device operation (`create`, `unreference`, `evict_all`, ...).
    pub op: &'static str,
    /// Event kind within the operation (`cache_hit`, `backend_alloc_failed`, ...).
    pub event: &'static str,
    pub handle: Option<u32>,
    pub size: Option<usize>,
    /// Cache bucket of `size`, when a size is present.
    pub bucket: Option<usize>,
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: bytes held by the cache.
    pub cached_bytes: usize,
    /// Snapshot: first-attempt cache hits.
    pub hits: u64,
    /// Snapshot: first-attempt cache misses.
    pub misses: u64,
}

/// Counters copied into every record.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CounterSnapshot {
    pub cached_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

/// What a record is about.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Subject {
    pub handle: Option<u32>,
    pub size: Option<usize>,
}

impl Subject {
    pub(crate) const NONE: Self = Self {
        handle: None,
        size: None,
    };

    pub(crate) fn bo(handle: u32, size: usize) -> Self {
        Self {
            handle: Some(handle),
            size: Some(size),
        }
    }

    pub(crate) fn request(size: usize) -> Self {
        Self {
            handle: None,
            size: Some(size),
        }
    }
}

/// Bounded ring of lifecycle records.
pub(crate) struct LifecycleLog {
    records: Mutex<VecDeque<BoLogRecord>>,
    next_decision_id: AtomicU64,
    min_level: BoLogLevel,
    capacity: usize,
}

impl LifecycleLog {
    pub(crate) fn new(min_level: BoLogLevel, capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            next_decision_id: AtomicU64::new(1),
            min_level,
            capacity,
        }
    }

    /// Returns true if records at `level` are kept.
    pub(crate) fn enabled(&self, level: BoLogLevel) -> bool {
        self.capacity > 0 && level >= self.min_level
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record(
        &self,
        level: BoLogLevel,
        op: &'static str,
        event: &'static str,
        subject: Subject,
        outcome: &'static str,
        details: String,
        counters: CounterSnapshot,
    ) {
        if !self.enabled(level) {
            return;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let record = BoLogRecord {
            decision_id,
            trace_id: format!("bocache::{op}::{decision_id:016x}"),
            level,
            op,
            event,
            handle: subject.handle,
            size: subject.size,
            bucket: subject.size.map(bucket_index),
            outcome,
            details,
            cached_bytes: counters.cached_bytes,
            hits: counters.hits,
            misses: counters.misses,
        };

        let mut records = self.records.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub(crate) fn snapshot(&self) -> Vec<BoLogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub(crate) fn drain(&self) -> Vec<BoLogRecord> {
        self.records.lock().drain(..).collect()
    }
}
