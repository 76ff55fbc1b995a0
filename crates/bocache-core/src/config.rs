//! Device configuration.
//!
//! Debug behavior is selected via the `BOCACHE_DEBUG` environment variable, a
//! comma-separated list of flags:
//! - `bodump`: after creates and final unreferences, print per-label BO usage
//!   (at most once per second).
//! - `bodumpverbose`: like `bodump`, and also list every live BO by handle.
//! - `trace`: map every new BO on creation and keep trace-level lifecycle records.
//!
//! Unknown tokens are ignored.

use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::log::BoLogLevel;

/// Debug flag set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugFlags(u32);

impl DebugFlags {
    pub const NONE: Self = Self(0);
    pub const BODUMP: Self = Self(1 << 0);
    pub const BODUMP_VERBOSE: Self = Self(1 << 1);
    pub const TRACE: Self = Self(1 << 2);

    const ALL_BITS: u32 = Self::BODUMP.0 | Self::BODUMP_VERBOSE.0 | Self::TRACE.0;

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, dropping unknown ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL_BITS)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if either dump flag is set.
    #[must_use]
    pub const fn dumps_enabled(self) -> bool {
        self.0 & (Self::BODUMP.0 | Self::BODUMP_VERBOSE.0) != 0
    }

    #[must_use]
    pub const fn verbose_dump(self) -> bool {
        self.contains(Self::BODUMP_VERBOSE)
    }

    #[must_use]
    pub const fn trace(self) -> bool {
        self.contains(Self::TRACE)
    }

    /// Parse a comma-separated flag list (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        let mut flags = Self::NONE;
        for token in s.split(',') {
            match token.trim().to_ascii_lowercase().as_str() {
                "bodump" => flags |= Self::BODUMP,
                "bodumpverbose" => flags |= Self::BODUMP_VERBOSE,
                "trace" => flags |= Self::TRACE,
                _ => {}
            }
        }
        flags
    }
}

impl BitOr for DebugFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DebugFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// Cached flags: 0=unresolved, RESOLVED|bits once read, RESOLVING while the
// resolving thread reads the environment.
static CACHED_FLAGS: AtomicU32 = AtomicU32::new(0);

const FLAGS_UNRESOLVED: u32 = 0;
const FLAGS_RESOLVED: u32 = 1 << 31;
const FLAGS_RESOLVING: u32 = u32::MAX;

/// Get the process-wide debug flags (reads `BOCACHE_DEBUG` on first call).
///
/// Concurrent callers that arrive while another thread is reading the
/// environment get no flags rather than blocking.
#[must_use]
pub fn debug_flags() -> DebugFlags {
    let cached = CACHED_FLAGS.load(Ordering::Acquire);

    if cached != FLAGS_UNRESOLVED && cached != FLAGS_RESOLVING {
        return DebugFlags::from_bits_truncate(cached & !FLAGS_RESOLVED);
    }
    if cached == FLAGS_RESOLVING {
        return DebugFlags::NONE;
    }

    if CACHED_FLAGS
        .compare_exchange(
            FLAGS_UNRESOLVED,
            FLAGS_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_FLAGS.load(Ordering::Acquire);
        return if v != FLAGS_UNRESOLVED && v != FLAGS_RESOLVING {
            DebugFlags::from_bits_truncate(v & !FLAGS_RESOLVED)
        } else {
            DebugFlags::NONE
        };
    }

    let flags = std::env::var("BOCACHE_DEBUG")
        .map(|v| DebugFlags::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_FLAGS.store(FLAGS_RESOLVED | flags.bits(), Ordering::Release);
    flags
}

/// Default age, in whole seconds, past which a cached BO is stale.
pub const DEFAULT_MAX_IDLE_SECS: u64 = 2;

/// Default capacity of the lifecycle record ring.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Per-device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub debug: DebugFlags,
    /// Cached BOs idle for strictly longer than this are evicted.
    ///
    /// Ages are whole seconds, so an entry may survive up to one extra second.
    pub max_idle_secs: u64,
    /// Lifecycle records below this level are not kept.
    pub log_level: BoLogLevel,
    /// Maximum retained lifecycle records; the oldest are dropped first.
    pub log_capacity: usize,
}

impl DeviceConfig {
    /// Configuration from `BOCACHE_DEBUG`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_debug(debug_flags())
    }

    /// Apply debug flags; `trace` also lowers the log level to `Trace`.
    #[must_use]
    pub fn with_debug(mut self, debug: DebugFlags) -> Self {
        self.debug = debug;
        if debug.trace() {
            self.log_level = BoLogLevel::Trace;
        }
        self
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            debug: DebugFlags::NONE,
            max_idle_secs: DEFAULT_MAX_IDLE_SECS,
            log_level: BoLogLevel::Info,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}
