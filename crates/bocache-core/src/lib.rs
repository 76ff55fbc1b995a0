//! Buffer-object allocator core.
//!
//! A size-bucketed, reference-counted, time-decayed cache in front of a kernel
//! memory allocator. It amortizes the cost of GPU memory allocation and mapping
//! across frames:
//! - [`bo::bucket`]: power-of-two size classes for the free lists
//! - [`bo::cache`]: per-bucket free lists plus one LRU list with age-based eviction
//! - [`bo::device`]: create/reference/unreference and the allocation retry ladder
//! - [`bo::diag`]: per-label accounting and the rate-limited dump
//!
//! The memory itself comes from a [`Backend`]. [`SimBackend`] is an in-process
//! stand-in used by tests, benchmarks and the harness.

pub mod backend;
pub mod bo;
pub mod clock;
pub mod config;
pub mod error;
pub mod log;

pub use backend::sim::SimBackend;
pub use backend::{Backend, BackendBo};
pub use bo::Bo;
pub use bo::bucket::{MAX_BO_CACHE_BUCKET, MIN_BO_CACHE_BUCKET, NR_BO_CACHE_BUCKETS, bucket_index};
pub use bo::cache::BoCache;
pub use bo::device::{CACHE_LABEL, CacheStats, Device};
pub use bo::diag::{BoReport, LabelStat, format_size};
pub use bo::flags::BoFlags;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{DebugFlags, DeviceConfig};
pub use error::{BackendError, BoError};
pub use log::{BoLogLevel, BoLogRecord};
