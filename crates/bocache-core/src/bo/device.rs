//! Device-level BO allocator.
//!
//! Coordinates the cache, the BO table and the backend:
//! - `create`: cache lookup, fresh allocation, second cache lookup, full
//!   eviction and one last allocation, in that order.
//! - `unreference`: the final reference either returns the BO to the cache or
//!   frees it (shared BOs always bypass the cache).
//!
//! Two locks exist. The BO-table lock guards the handle table and every
//! commit of a zero-count transition; the cache lock guards the buckets, the
//! LRU and the cached byte count. When both are held the table lock is taken
//! first. Neither is held across a backend allocation.

use std::borrow::Cow;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::Bo;
use super::bucket::{NR_BO_CACHE_BUCKETS, bucket_index};
use super::cache::BoCache;
use super::diag::{BoReport, LabelStat};
use super::flags::BoFlags;
use super::table::BoTable;
use crate::backend::Backend;
use crate::clock::{Clock, MonotonicClock};
use crate::config::DeviceConfig;
use crate::error::{BackendError, BoError};
use crate::log::{BoLogLevel, BoLogRecord, CounterSnapshot, LifecycleLog, Subject};

/// Label carried by BOs while they sit in the cache.
pub const CACHE_LABEL: &str = "Unused (BO cache)";

/// No dump has happened yet.
const NEVER_DUMPED: u64 = u64::MAX;

/// Snapshot of cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_bytes: usize,
    pub cached_count: usize,
    /// First-attempt cache hits.
    pub hits: u64,
    /// First-attempt cache misses.
    pub misses: u64,
    pub bucket_counts: [usize; NR_BO_CACHE_BUCKETS],
    /// BOs known to the device, cached ones included.
    pub live_count: usize,
}

/// How `create` obtained its BO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreatePath {
    CacheHit,
    Fresh,
    CacheRetry,
    EvictRetry,
}

impl CreatePath {
    const fn as_str(self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::Fresh => "fresh",
            Self::CacheRetry => "cache_retry",
            Self::EvictRetry => "evict_retry",
        }
    }
}

/// Per-device allocator state.
///
/// Dropping the device frees every cached BO. BOs callers still reference are
/// not freed; their count goes to the diagnostics sink.
pub struct Device<B: Backend, C: Clock = MonotonicClock> {
    backend: B,
    clock: C,
    config: DeviceConfig,
    page_size: usize,
    table: Mutex<BoTable>,
    cache: Mutex<BoCache>,
    hits: AtomicU64,
    misses: AtomicU64,
    last_dump_time: AtomicU64,
    log: LifecycleLog,
    diag_sink: Mutex<Box<dyn Write + Send>>,
}

impl<B: Backend> Device<B, MonotonicClock> {
    /// Open a device on `backend` with the monotonic clock.
    pub fn new(backend: B, config: DeviceConfig) -> Self {
        Self::with_clock(backend, MonotonicClock::new(), config)
    }
}

impl<B: Backend, C: Clock> Device<B, C> {
    pub fn with_clock(backend: B, clock: C, config: DeviceConfig) -> Self {
        let page_size = backend.page_size();
        debug_assert!(page_size.is_power_of_two(), "page size {page_size}");
        Self {
            backend,
            clock,
            config,
            page_size,
            table: Mutex::new(BoTable::new()),
            cache: Mutex::new(BoCache::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            last_dump_time: AtomicU64::new(NEVER_DUMPED),
            log: LifecycleLog::new(config.log_level, config.log_capacity),
            diag_sink: Mutex::new(Box::new(io::stderr())),
        }
    }

    /// Redirect diagnostics (dumps and the creation-failure line).
    pub fn set_diagnostics_sink(&self, sink: Box<dyn Write + Send>) {
        *self.diag_sink.lock() = sink;
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Create a BO of at least `size` bytes.
    ///
    /// The size is rounded up to the page size and the alignment raised to at
    /// least the page size. On success the BO holds one reference.
    pub fn create(
        &self,
        size: usize,
        align: usize,
        flags: BoFlags,
        label: impl Into<Cow<'static, str>>,
    ) -> Result<Arc<Bo>, BoError> {
        let label = label.into();
        debug_assert!(!label.is_empty(), "BOs must be labeled");

        if size == 0 {
            self.record(
                BoLogLevel::Warn,
                "create",
                "invalid_size",
                Subject::request(size),
                "denied",
                String::new(),
            );
            return Err(BoError::InvalidSize { size });
        }
        if align != 0 && !align.is_power_of_two() {
            self.record(
                BoLogLevel::Warn,
                "create",
                "invalid_alignment",
                Subject::request(size),
                "denied",
                format!("align={align}"),
            );
            return Err(BoError::InvalidAlignment { align });
        }

        // BOs are allocated in pages.
        let Some(size) = size.checked_next_multiple_of(self.page_size) else {
            return Err(BoError::InvalidSize { size });
        };
        let align = align.max(self.page_size);

        let Some((bo, path)) = self.acquire(size, align, flags, &label) else {
            self.record(
                BoLogLevel::Warn,
                "create",
                "create_failed",
                Subject::request(size),
                "oom",
                format!("align={align} flags={:#x}", flags.bits()),
            );
            let _ = writeln!(self.diag_sink.lock(), "BO creation failed");
            return Err(BoError::OutOfMemory {
                size,
                align,
                flags: flags.bits(),
            });
        };

        if matches!(path, CreatePath::CacheHit | CreatePath::CacheRetry) {
            bo.set_label(label);
        }

        if self.config.debug.trace() {
            if let Err(err) = self.map(&bo) {
                self.record(
                    BoLogLevel::Warn,
                    "create",
                    "trace_map_failed",
                    Subject::bo(bo.handle(), bo.size()),
                    "ignored",
                    err.to_string(),
                );
            }
        }

        self.record(
            BoLogLevel::Trace,
            "create",
            path.as_str(),
            Subject::bo(bo.handle(), bo.size()),
            "success",
            format!("align={} flags={:#x}", bo.align(), bo.flags().bits()),
        );

        self.dump_all_periodic();
        Ok(bo)
    }

    /// The retry ladder. Only the first cache lookup counts as a hit or miss.
    fn acquire(
        &self,
        size: usize,
        align: usize,
        flags: BoFlags,
        label: &Cow<'static, str>,
    ) -> Option<(Arc<Bo>, CreatePath)> {
        if let Some(bo) = self.cache_fetch(size, align, flags, true) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some((bo, CreatePath::CacheHit));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        if let Some(bo) = self.alloc_fresh(size, align, flags, label) {
            return Some((bo, CreatePath::Fresh));
        }

        // Something suitable may have been released since the first lookup.
        if let Some(bo) = self.cache_fetch(size, align, flags, false) {
            return Some((bo, CreatePath::CacheRetry));
        }

        // Give the cached memory back to the backend and try once more.
        self.evict_all();
        self.alloc_fresh(size, align, flags, label)
            .map(|bo| (bo, CreatePath::EvictRetry))
    }

    /// Take a matching BO out of the cache, holding one reference.
    ///
    /// `dontwait` is forwarded for logging only; both lookups behave the same.
    fn cache_fetch(
        &self,
        size: usize,
        align: usize,
        flags: BoFlags,
        dontwait: bool,
    ) -> Option<Arc<Bo>> {
        let bo = {
            let mut cache = self.cache.lock();
            let bo = cache.fetch(size, align, flags)?;
            // Revive under the cache lock so an importer never sees a BO that
            // is neither cached nor referenced.
            bo.revive();
            bo
        };
        self.record(
            BoLogLevel::Trace,
            "create",
            "cache_fetch",
            Subject::bo(bo.handle(), bo.size()),
            "hit",
            format!("requested={size} dontwait={dontwait}"),
        );
        Some(bo)
    }

    fn alloc_fresh(
        &self,
        size: usize,
        align: usize,
        flags: BoFlags,
        label: &Cow<'static, str>,
    ) -> Option<Arc<Bo>> {
        let raw = match self.backend.bo_alloc(size, align, flags) {
            Ok(raw) => raw,
            Err(err) => {
                self.record_backend_failure(size, &err);
                return None;
            }
        };
        debug_assert!(raw.size >= size, "backend returned a short BO");
        debug_assert!(raw.size % self.page_size == 0, "backend size not page-aligned");

        let bo = Arc::new(Bo::from_backend(raw, label.clone()));
        self.table.lock().insert(Arc::clone(&bo));
        Some(bo)
    }

    fn record_backend_failure(&self, size: usize, err: &BackendError) {
        self.record(
            BoLogLevel::Info,
            "create",
            "backend_alloc_failed",
            Subject::request(size),
            "retry",
            err.to_string(),
        );
    }

    /// Drop one reference; a `None` BO is ignored.
    ///
    /// When the count reaches zero the BO goes back to the cache, or to the
    /// backend if it is shared.
    pub fn unreference<'a>(&self, bo: impl Into<Option<&'a Arc<Bo>>>) {
        let Some(bo) = bo.into() else {
            return;
        };

        match bo.release() {
            Some(0) => {}
            Some(_) => return,
            None => {
                debug_assert!(false, "BO {} unreferenced with a zero count", bo.handle());
                self.record(
                    BoLogLevel::Error,
                    "unreference",
                    "refcount_underflow",
                    Subject::bo(bo.handle(), bo.size()),
                    "ignored",
                    String::new(),
                );
                return;
            }
        }

        let mut table = self.table.lock();

        // An importer may have taken a new reference while we waited for the
        // lock, or another releaser may already have committed this BO.
        if bo.refcount() != 0 || !table.holds(bo) {
            self.record(
                BoLogLevel::Info,
                "unreference",
                "resurrected",
                Subject::bo(bo.handle(), bo.size()),
                "skipped",
                format!("refcnt={}", bo.refcount()),
            );
        } else if !self.cache_put(&mut table, bo) {
            self.free_locked(&mut table, bo, "unreference");
        }

        self.dump_all_periodic_locked(&table);
    }

    /// Try to cache an unreferenced BO. Returns false if it must be freed.
    fn cache_put(&self, table: &mut BoTable, bo: &Arc<Bo>) -> bool {
        if bo.is_shared() {
            return false;
        }

        let now = self.clock.now_secs();
        let stale = {
            let mut cache = self.cache.lock();
            if !cache.put(Arc::clone(bo), now) {
                drop(cache);
                self.record(
                    BoLogLevel::Warn,
                    "unreference",
                    "already_cached",
                    Subject::bo(bo.handle(), bo.size()),
                    "ignored",
                    String::new(),
                );
                return true;
            }
            bo.set_label(Cow::Borrowed(CACHE_LABEL));
            // Clean up while the lock is held anyway.
            cache.evict_stale(now, self.config.max_idle_secs)
        };

        self.record(
            BoLogLevel::Trace,
            "unreference",
            "cache_put",
            Subject::bo(bo.handle(), bo.size()),
            "cached",
            format!("now={now}"),
        );

        for entry in &stale {
            self.free_locked(table, entry, "evict_stale");
        }
        true
    }

    /// Return a BO to the backend. The caller holds the table lock.
    fn free_locked(&self, table: &mut BoTable, bo: &Arc<Bo>, op: &'static str) {
        let removed = table.remove(bo.handle());
        debug_assert!(
            removed.as_ref().is_some_and(|live| Arc::ptr_eq(live, bo)),
            "freeing BO {} that is not live",
            bo.handle()
        );
        self.backend.bo_free(bo);
        self.record(
            BoLogLevel::Debug,
            op,
            "free",
            Subject::bo(bo.handle(), bo.size()),
            if bo.is_shared() { "shared_bypass" } else { "freed" },
            String::new(),
        );
    }

    /// Free every cached BO regardless of age. Returns how many were freed.
    pub fn evict_all(&self) -> usize {
        let mut table = self.table.lock();
        let drained = self.cache.lock().drain();
        for bo in &drained {
            self.free_locked(&mut table, bo, "evict_all");
        }
        drop(table);

        self.record(
            BoLogLevel::Info,
            "evict_all",
            "evict_all",
            Subject::NONE,
            "drained",
            format!("count={}", drained.len()),
        );
        drained.len()
    }

    /// Look up a live BO by handle and take a reference on it.
    ///
    /// The BO becomes shared. A cached BO is pulled out of the cache; a BO
    /// whose last reference is being dropped concurrently is resurrected, and
    /// the releasing thread backs off when it re-checks the count.
    pub fn import(&self, handle: u32) -> Result<Arc<Bo>, BoError> {
        let table = self.table.lock();
        let Some(bo) = table.get(handle).cloned() else {
            return Err(BoError::UnknownHandle(handle));
        };

        let was_cached = {
            let mut cache = self.cache.lock();
            match cache.remove(handle) {
                Some(_) => {
                    bo.revive();
                    true
                }
                None => {
                    // Either referenced or mid-release; both are fine to bump.
                    bo.reacquire();
                    false
                }
            }
        };
        bo.mark_shared();
        drop(table);

        self.record(
            BoLogLevel::Debug,
            "import",
            "import",
            Subject::bo(bo.handle(), bo.size()),
            if was_cached { "from_cache" } else { "live" },
            format!("refcnt={}", bo.refcount()),
        );
        Ok(bo)
    }

    /// Mark a BO as shared with another process and return its handle.
    ///
    /// Shared BOs are freed rather than cached when released. The caller must
    /// hold a reference; a cached BO is never marked shared.
    pub fn export(&self, bo: &Bo) -> Result<u32, BoError> {
        let table = self.table.lock();
        if bo.refcount() == 0 || self.cache.lock().contains(bo.handle()) {
            drop(table);
            self.record(
                BoLogLevel::Error,
                "export",
                "export_unreferenced",
                Subject::bo(bo.handle(), bo.size()),
                "denied",
                String::new(),
            );
            return Err(BoError::Unreferenced(bo.handle()));
        }
        bo.mark_shared();
        drop(table);

        self.record(
            BoLogLevel::Debug,
            "export",
            "export",
            Subject::bo(bo.handle(), bo.size()),
            "shared",
            String::new(),
        );
        Ok(bo.handle())
    }

    /// CPU-map a BO, reusing an existing mapping.
    pub fn map(&self, bo: &Bo) -> Result<u64, BoError> {
        if let Some(addr) = bo.mapped_addr() {
            return Ok(addr);
        }
        let addr = self.backend.bo_map(bo)?;
        Ok(bo.set_mapped(addr))
    }

    /// Referenced BO by handle, without taking a reference.
    ///
    /// Cached BOs and BOs whose last reference is being dropped are skipped.
    pub fn lookup(&self, handle: u32) -> Option<Arc<Bo>> {
        self.table
            .lock()
            .get(handle)
            .filter(|bo| bo.refcount() != 0)
            .cloned()
    }

    /// BOs known to the device, cached ones included.
    pub fn live_count(&self) -> usize {
        self.table.lock().len()
    }

    /// One past the highest handle the device has seen.
    pub fn max_handle(&self) -> u32 {
        self.table.lock().max_handle()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let live_count = self.table.lock().len();
        let cache = self.cache.lock();
        let mut bucket_counts = [0; NR_BO_CACHE_BUCKETS];
        for (bucket, count) in bucket_counts.iter_mut().enumerate() {
            *count = cache.bucket_len(bucket);
        }
        CacheStats {
            cached_bytes: cache.size(),
            cached_count: cache.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            bucket_counts,
            live_count,
        }
    }

    /// Handles in the cache from oldest to newest release.
    pub fn cached_handles(&self) -> Vec<u32> {
        self.cache.lock().lru_handles()
    }

    /// Returns a snapshot of lifecycle records.
    pub fn lifecycle_logs(&self) -> Vec<BoLogRecord> {
        self.log.snapshot()
    }

    /// Drains lifecycle records.
    pub fn drain_lifecycle_logs(&self) -> Vec<BoLogRecord> {
        self.log.drain()
    }

    /// Per-label usage of every live BO.
    pub fn report(&self) -> BoReport {
        BoReport::collect(&self.table.lock())
    }

    pub fn label_stats(&self) -> Vec<LabelStat> {
        self.report().labels
    }

    /// Write the usage report, verbose if the device's debug flags ask for it.
    pub fn dump_all(&self, out: &mut dyn Write) -> io::Result<()> {
        self.report().write_to(out, self.config.debug.verbose_dump())
    }

    fn dump_all_periodic(&self) {
        if !self.config.debug.dumps_enabled() {
            return;
        }
        self.dump_all_periodic_locked(&self.table.lock());
    }

    /// Dump to the diagnostics sink at most once per clock second.
    fn dump_all_periodic_locked(&self, table: &BoTable) {
        if !self.config.debug.dumps_enabled() {
            return;
        }
        let now = self.clock.now_secs();
        if self.last_dump_time.swap(now, Ordering::AcqRel) == now {
            return;
        }

        let report = BoReport::collect(table);
        let mut sink = self.diag_sink.lock();
        let _ = report.write_to(&mut **sink, self.config.debug.verbose_dump());
        let _ = sink.flush();
    }

    fn record(
        &self,
        level: BoLogLevel,
        op: &'static str,
        event: &'static str,
        subject: Subject,
        outcome: &'static str,
        details: String,
    ) {
        if !self.log.enabled(level) {
            return;
        }
        let counters = CounterSnapshot {
            cached_bytes: self.cache.lock().size(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        };
        self.log.record(level, op, event, subject, outcome, details, counters);
    }
}

impl<B: Backend, C: Clock> Drop for Device<B, C> {
    fn drop(&mut self) {
        let drained = self.cache.get_mut().drain();
        let table = self.table.get_mut();
        for bo in &drained {
            table.remove(bo.handle());
            self.backend.bo_free(bo);
        }

        let leaked = table.len();
        if leaked != 0 {
            let _ = writeln!(
                self.diag_sink.get_mut(),
                "{leaked} BO(s) still referenced at teardown"
            );
        }
    }
}
