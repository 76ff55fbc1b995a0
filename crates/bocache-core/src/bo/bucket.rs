//! Size-class bucketing for the BO cache.
//!
//! Buckets are power-of-two orders: every size in `[2^k, 2^(k+1))` shares a
//! bucket. Orders outside `[MIN_BO_CACHE_BUCKET, MAX_BO_CACHE_BUCKET]` clamp to
//! the boundary buckets, so huge BOs all land in the top bucket and rely on the
//! size check at lookup.

/// Order of the smallest bucket (4 KiB).
pub const MIN_BO_CACHE_BUCKET: u32 = 12;

/// Order of the largest bucket (4 MiB).
pub const MAX_BO_CACHE_BUCKET: u32 = 22;

/// Number of cache buckets.
pub const NR_BO_CACHE_BUCKETS: usize = (MAX_BO_CACHE_BUCKET - MIN_BO_CACHE_BUCKET + 1) as usize;

/// Bucket index (0-based) for a BO of `size` bytes.
#[inline]
#[must_use]
pub fn bucket_index(size: usize) -> usize {
    // Round down to a power of two.
    let order = size.checked_ilog2().unwrap_or(0);
    (order.clamp(MIN_BO_CACHE_BUCKET, MAX_BO_CACHE_BUCKET) - MIN_BO_CACHE_BUCKET) as usize
}

/// Smallest size that maps to `bucket` without clamping.
#[must_use]
pub const fn bucket_floor(bucket: usize) -> usize {
    1usize << (bucket as u32 + MIN_BO_CACHE_BUCKET)
}
