#![no_main]
use std::sync::Arc;

use bocache_core::{BoError, BoFlags, Device, DeviceConfig, ManualClock, SimBackend};
use libfuzzer_sys::fuzz_target;

const PAGE: usize = 4096;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: [op, a, b, c].
    if data.len() < 4 {
        return;
    }

    let sim = Arc::new(SimBackend::new().with_budget(256 * PAGE));
    let clock = Arc::new(ManualClock::new(0));
    let dev = Device::with_clock(Arc::clone(&sim), Arc::clone(&clock), DeviceConfig::default());
    dev.set_diagnostics_sink(Box::new(std::io::sink()));
    let mut held = Vec::new();

    for chunk in data.chunks_exact(4) {
        let (a, b, c) = (chunk[1], chunk[2], chunk[3]);
        match chunk[0] % 8 {
            0 => {
                let size = usize::from(u16::from_le_bytes([a, b])) * 16;
                let flags = BoFlags::from_bits(u32::from(c & 0x1f));
                match dev.create(size, 0, flags, "Fuzz") {
                    Ok(bo) => {
                        assert!(bo.size() >= size);
                        assert_eq!(bo.size() % PAGE, 0);
                        assert_eq!(bo.refcount(), 1);
                        held.push(bo);
                    }
                    Err(BoError::InvalidSize { .. }) => assert_eq!(size, 0),
                    Err(BoError::OutOfMemory { .. }) => {}
                    Err(err) => panic!("unexpected create error: {err}"),
                }
            }
            1 if !held.is_empty() => {
                let bo = held.swap_remove(usize::from(a) % held.len());
                dev.unreference(&bo);
            }
            2 if !held.is_empty() => {
                let bo = Arc::clone(&held[usize::from(a) % held.len()]);
                bo.reference();
                held.push(bo);
            }
            3 => {
                clock.advance(u64::from(a % 4));
            }
            4 => {
                dev.evict_all();
            }
            5 => match dev.import(u32::from(a)) {
                Ok(bo) => {
                    assert!(bo.is_shared());
                    held.push(bo);
                }
                Err(BoError::UnknownHandle(_)) => {}
                Err(err) => panic!("unexpected import error: {err}"),
            },
            6 if !held.is_empty() => {
                let bo = &held[usize::from(a) % held.len()];
                assert_eq!(dev.export(bo).ok(), Some(bo.handle()));
            }
            7 => sim.fail_next(u32::from(a % 3)),
            _ => {}
        }

        let stats = dev.cache_stats();
        assert_eq!(stats.bucket_counts.iter().sum::<usize>(), stats.cached_count);
        assert!(stats.cached_count <= stats.live_count);
        assert_eq!(dev.report().total.alloc_bytes, sim.live_bytes());
        assert_eq!(sim.unknown_frees(), 0);
    }

    for bo in held.drain(..) {
        dev.unreference(&bo);
    }
    dev.evict_all();
    assert_eq!(dev.live_count(), 0);
    assert_eq!(sim.live_bytes(), 0);
});
