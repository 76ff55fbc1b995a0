//! Seeded churn workload against the simulated backend.
//!
//! A driver-shaped mix of labelled allocations (command buffers, shaders,
//! textures, ...) is created, shared, imported, mapped and released while a
//! manual clock ticks, so cache reuse, stale eviction and budget pressure all
//! show up in a reproducible run.

use std::sync::Arc;

use bocache_core::backend::sim::SIM_PAGE_SIZE;
use bocache_core::{
    Bo, BoError, BoFlags, BoLogLevel, BoLogRecord, CacheStats, DebugFlags, Device, DeviceConfig,
    ManualClock, SimBackend,
};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;

/// Deterministic generator; same sequence for the same seed on every platform.
#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift.
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }
}

struct LabelProfile {
    label: &'static str,
    min_pages: usize,
    max_pages: usize,
    flags: BoFlags,
}

const PROFILES: [LabelProfile; 5] = [
    LabelProfile {
        label: "Command buffer",
        min_pages: 1,
        max_pages: 4,
        flags: BoFlags::WRITEBACK,
    },
    LabelProfile {
        label: "Shader",
        min_pages: 1,
        max_pages: 8,
        flags: BoFlags::EXEC.union(BoFlags::LOW_VA),
    },
    LabelProfile {
        label: "Texture",
        min_pages: 16,
        max_pages: 512,
        flags: BoFlags::NONE,
    },
    LabelProfile {
        label: "Vertex buffer",
        min_pages: 2,
        max_pages: 64,
        flags: BoFlags::WRITEBACK,
    },
    LabelProfile {
        label: "Scratch",
        min_pages: 1,
        max_pages: 1024,
        flags: BoFlags::NONE,
    },
];

/// Workload parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChurnConfig {
    pub seed: u64,
    pub ops: usize,
    /// Backend byte budget; `None` is unlimited.
    pub budget_bytes: Option<usize>,
    /// Chance per create, out of 1000, that the BO is created shared.
    pub shared_permille: u32,
    /// The clock advances one second every this many ops.
    pub tick_every: usize,
    pub debug: DebugFlags,
    /// Keep drained lifecycle records for [`Workload::take_records`].
    pub keep_logs: bool,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            seed: 0xB0CA_C4E0,
            ops: 10_000,
            budget_bytes: None,
            shared_permille: 20,
            tick_every: 250,
            debug: DebugFlags::NONE,
            keep_logs: false,
        }
    }
}

/// Final cache and backend state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub cached_bytes: usize,
    pub cached_count: usize,
    pub live_count: usize,
    pub backend_live_bytes: usize,
    pub backend_alloc_attempts: u64,
    pub backend_frees: u64,
    pub bucket_counts: Vec<usize>,
}

impl StatsSnapshot {
    fn capture(stats: &CacheStats, sim: &SimBackend) -> Self {
        Self {
            cached_bytes: stats.cached_bytes,
            cached_count: stats.cached_count,
            live_count: stats.live_count,
            backend_live_bytes: sim.live_bytes(),
            backend_alloc_attempts: sim.alloc_attempts(),
            backend_frees: sim.frees(),
            bucket_counts: stats.bucket_counts.to_vec(),
        }
    }
}

/// Machine-readable summary of a churn run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChurnReport {
    pub seed: u64,
    pub ops: usize,
    pub creates: usize,
    pub hits: u64,
    pub misses: u64,
    pub ooms: usize,
    pub references: usize,
    pub releases: usize,
    pub imports: usize,
    pub exports: usize,
    pub maps: usize,
    /// BOs freed by stale or full eviction.
    pub evictions: usize,
    pub peak_cached_bytes: usize,
    /// References still held by the workload when the report was taken.
    pub held: usize,
    pub final_stats: StatsSnapshot,
    /// SHA-256 of the JSONL lifecycle log, when one was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_sha256: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    ops: usize,
    creates: usize,
    ooms: usize,
    references: usize,
    releases: usize,
    imports: usize,
    exports: usize,
    maps: usize,
    evictions: usize,
    peak_cached_bytes: usize,
}

pub type SimDevice = Device<Arc<SimBackend>, Arc<ManualClock>>;

/// A device, its backend and the references the workload holds.
pub struct Workload {
    config: ChurnConfig,
    device: SimDevice,
    sim: Arc<SimBackend>,
    clock: Arc<ManualClock>,
    rng: XorShift64,
    held: Vec<Arc<Bo>>,
    counters: Counters,
    records: Vec<BoLogRecord>,
}

impl Workload {
    #[must_use]
    pub fn new(config: ChurnConfig) -> Self {
        let mut sim = SimBackend::new();
        if let Some(budget) = config.budget_bytes {
            sim = sim.with_budget(budget);
        }
        let sim = Arc::new(sim);
        let clock = Arc::new(ManualClock::new(0));

        let mut device_config = DeviceConfig::default().with_debug(config.debug);
        // Frees are recorded at debug level and feed the eviction count.
        device_config.log_level = device_config.log_level.min(BoLogLevel::Debug);
        let device = Device::with_clock(Arc::clone(&sim), Arc::clone(&clock), device_config);

        Self {
            rng: XorShift64::new(config.seed),
            config,
            device,
            sim,
            clock,
            held: Vec::new(),
            counters: Counters::default(),
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn device(&self) -> &SimDevice {
        &self.device
    }

    #[must_use]
    pub fn backend(&self) -> &SimBackend {
        &self.sim
    }

    /// References currently held.
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Run the configured number of ops.
    pub fn run(&mut self) -> Result<(), HarnessError> {
        for _ in 0..self.config.ops {
            self.step()?;
        }
        Ok(())
    }

    /// Perform one randomly chosen operation.
    pub fn step(&mut self) -> Result<(), HarnessError> {
        let roll = self.rng.gen_range(0, 99);
        if self.held.is_empty() || roll < 50 {
            self.create()?;
        } else {
            let idx = self.rng.gen_range(0, self.held.len() - 1);
            match roll {
                50..=84 => {
                    let bo = self.held.swap_remove(idx);
                    self.device.unreference(&bo);
                    self.counters.releases += 1;
                }
                85..=89 => {
                    let bo = Arc::clone(&self.held[idx]);
                    bo.reference();
                    self.held.push(bo);
                    self.counters.references += 1;
                }
                90..=93 => {
                    self.device.export(&self.held[idx])?;
                    self.counters.exports += 1;
                }
                94..=96 => self.import()?,
                _ => {
                    self.device.map(&self.held[idx])?;
                    self.counters.maps += 1;
                }
            }
        }

        self.counters.ops += 1;
        if self.config.tick_every != 0 && self.counters.ops % self.config.tick_every == 0 {
            self.clock.advance(1);
        }
        self.absorb_logs();
        Ok(())
    }

    fn create(&mut self) -> Result<(), HarnessError> {
        let profile = &PROFILES[self.rng.gen_range(0, PROFILES.len() - 1)];
        let pages = self.rng.gen_range(profile.min_pages, profile.max_pages);
        let size = pages * SIM_PAGE_SIZE - self.rng.gen_range(0, SIM_PAGE_SIZE - 1);
        let mut flags = profile.flags;
        if (self.rng.gen_range(0, 999) as u32) < self.config.shared_permille {
            flags |= BoFlags::SHARED;
        }

        match self.device.create(size, 0, flags, profile.label) {
            Ok(bo) => {
                self.held.push(bo);
                self.counters.creates += 1;
                Ok(())
            }
            Err(BoError::OutOfMemory { .. }) => {
                self.counters.ooms += 1;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Import a random handle; handles that are not live are skipped.
    fn import(&mut self) -> Result<(), HarnessError> {
        let max_handle = self.device.max_handle();
        if max_handle <= 1 {
            return Ok(());
        }
        let handle = self.rng.gen_range(1, max_handle as usize - 1) as u32;
        match self.device.import(handle) {
            Ok(bo) => {
                self.held.push(bo);
                self.counters.imports += 1;
                Ok(())
            }
            Err(BoError::UnknownHandle(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Drop every held reference.
    pub fn release_all(&mut self) {
        for bo in self.held.drain(..) {
            self.device.unreference(&bo);
            self.counters.releases += 1;
        }
        self.absorb_logs();
    }

    /// Free everything left in the cache.
    pub fn evict_all(&mut self) -> usize {
        let evicted = self.device.evict_all();
        self.absorb_logs();
        evicted
    }

    fn absorb_logs(&mut self) {
        let stats = self.device.cache_stats();
        self.counters.peak_cached_bytes = self.counters.peak_cached_bytes.max(stats.cached_bytes);

        for record in self.device.drain_lifecycle_logs() {
            if record.event == "free" && matches!(record.op, "evict_stale" | "evict_all") {
                self.counters.evictions += 1;
            }
            if self.config.keep_logs {
                self.records.push(record);
            }
        }
    }

    /// Lifecycle records kept since the last call.
    pub fn take_records(&mut self) -> Vec<BoLogRecord> {
        std::mem::take(&mut self.records)
    }

    #[must_use]
    pub fn report(&self) -> ChurnReport {
        let stats = self.device.cache_stats();
        ChurnReport {
            seed: self.config.seed,
            ops: self.counters.ops,
            creates: self.counters.creates,
            hits: stats.hits,
            misses: stats.misses,
            ooms: self.counters.ooms,
            references: self.counters.references,
            releases: self.counters.releases,
            imports: self.counters.imports,
            exports: self.counters.exports,
            maps: self.counters.maps,
            evictions: self.counters.evictions,
            peak_cached_bytes: self.counters.peak_cached_bytes,
            held: self.held.len(),
            final_stats: StatsSnapshot::capture(&stats, &self.sim),
            log_sha256: None,
        }
    }
}

impl Drop for Workload {
    fn drop(&mut self) {
        self.release_all();
    }
}
