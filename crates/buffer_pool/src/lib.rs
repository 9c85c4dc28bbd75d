//! Fixed pool of zero-copy image surfaces.
//!
//! The pool is the only shared mutable structure in the recording engine;
//! acquire and release are O(1) under a single mutex and never touch IO.

use common_io::{ImageSurface, RecorderError, Result, SurfaceStorage};
use std::sync::Mutex;
use tracing::warn;

/// Storage class requested for pool surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Opaque vendor zero-copy handles.
    Device,
    /// Host memory, sized stride * height.
    Host,
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub num_buffers: usize,
    pub width: u32,
    pub height: u32,
    pub storage: StorageClass,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_buffers: 30,
            width: 4056,
            height: 3040,
            storage: StorageClass::Device,
        }
    }
}

/// O(1) snapshot of the free/in-flight partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub in_use: usize,
    pub free: usize,
}

/// What happened to a returned surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Returned,
    /// The slot was already free; the release was ignored.
    DoubleRelease,
    /// The surface does not belong to this pool; nothing changed.
    Foreign,
}

struct Inner {
    slots: Vec<Option<ImageSurface>>,
    in_use: usize,
}

/// Exclusive custodian of a fixed set of image surfaces.
pub struct BufferPool {
    inner: Mutex<Inner>,
    width: u32,
    height: u32,
    total: usize,
}

impl BufferPool {
    /// Allocate all surfaces up front. A failed allocation releases every
    /// partial allocation and reports `Resource`.
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.num_buffers == 0 {
            return Err(RecorderError::InvalidArgument("empty buffer pool".into()));
        }

        let mut slots = Vec::with_capacity(config.num_buffers);
        for slot in 0..config.num_buffers {
            let storage = match config.storage {
                // Device handles are minted by the vendor allocator; handle 0
                // is reserved as invalid.
                StorageClass::Device => SurfaceStorage::Device {
                    handle: slot as u64 + 1,
                },
                StorageClass::Host => {
                    let len = config.width as usize * config.height as usize;
                    let mut data = Vec::new();
                    data.try_reserve_exact(len).map_err(|_| {
                        RecorderError::Resource(format!(
                            "surface allocation failed at slot {} ({} bytes)",
                            slot, len
                        ))
                    })?;
                    data.resize(len, 0);
                    SurfaceStorage::Host { data }
                }
            };
            slots.push(Some(ImageSurface {
                slot,
                width: config.width,
                height: config.height,
                stride: config.width,
                storage,
                timestamp_ns: 0,
                camera_id: None,
            }));
        }

        Ok(Self {
            inner: Mutex::new(Inner { slots, in_use: 0 }),
            width: config.width,
            height: config.height,
            total: config.num_buffers,
        })
    }

    /// Take the lowest-indexed free surface, or `None` when exhausted.
    /// Never blocks; a starved caller records a drop instead of waiting.
    pub fn acquire(&self) -> Option<ImageSurface> {
        let mut inner = self.inner.lock().unwrap();
        for slot in inner.slots.iter_mut() {
            if let Some(surface) = slot.take() {
                inner.in_use += 1;
                return Some(surface);
            }
        }
        warn!(total = self.total, "buffer pool exhausted");
        None
    }

    /// Return a surface to the free set. Double releases and foreign
    /// surfaces are detected and reported without corrupting bookkeeping.
    pub fn release(&self, mut surface: ImageSurface) -> ReleaseOutcome {
        if surface.slot >= self.total
            || surface.width != self.width
            || surface.height != self.height
        {
            warn!(slot = surface.slot, "released surface does not belong to this pool");
            return ReleaseOutcome::Foreign;
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.slots[surface.slot].is_some() {
            warn!(slot = surface.slot, "double release of pool surface");
            return ReleaseOutcome::DoubleRelease;
        }

        surface.clear_stamp();
        let slot = surface.slot;
        inner.slots[slot] = Some(surface);
        inner.in_use -= 1;
        ReleaseOutcome::Returned
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().unwrap();
        PoolStats {
            total: self.total,
            in_use: inner.in_use,
            free: self.total - inner.in_use,
        }
    }

    /// Healthy while at least 20% of the pool remains free. This is the
    /// early-warning threshold consumed by the monitor, not a hard failure.
    pub fn is_healthy(&self) -> bool {
        let stats = self.stats();
        stats.free >= self.total.div_ceil(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(n: usize) -> BufferPool {
        BufferPool::new(PoolConfig {
            num_buffers: n,
            width: 64,
            height: 48,
            storage: StorageClass::Device,
        })
        .unwrap()
    }

    #[test]
    fn partition_is_exact() {
        let pool = small_pool(6);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 6);
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.free, 4);
        assert_eq!(stats.in_use + stats.free, stats.total);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn acquire_returns_lowest_index_first() {
        let pool = small_pool(6);
        let a = pool.acquire().unwrap();
        assert_eq!(a.slot, 0);
        let b = pool.acquire().unwrap();
        assert_eq!(b.slot, 1);
        pool.release(a);
        let c = pool.acquire().unwrap();
        assert_eq!(c.slot, 0);
        pool.release(b);
        pool.release(c);
    }

    #[test]
    fn exhaustion_then_recovery() {
        let pool = small_pool(6);
        let mut held = Vec::new();
        for _ in 0..6 {
            held.push(pool.acquire().expect("pool should yield all N surfaces"));
        }
        assert!(pool.acquire().is_none());

        pool.release(held.pop().unwrap());
        assert!(pool.acquire().is_some());
    }

    #[test]
    fn double_release_is_detected() {
        let pool = small_pool(6);
        let surface = pool.acquire().unwrap();
        let copy = surface.clone();
        assert_eq!(pool.release(surface), ReleaseOutcome::Returned);
        assert_eq!(pool.release(copy), ReleaseOutcome::DoubleRelease);
        // bookkeeping stays correct
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free, 6);
    }

    #[test]
    fn foreign_surface_is_rejected() {
        let pool = small_pool(6);
        let foreign = ImageSurface {
            slot: 99,
            width: 64,
            height: 48,
            stride: 64,
            storage: SurfaceStorage::Device { handle: 1234 },
            timestamp_ns: 0,
            camera_id: None,
        };
        assert_eq!(pool.release(foreign), ReleaseOutcome::Foreign);
        assert_eq!(pool.stats().free, 6);
    }

    #[test]
    fn release_clears_stamp() {
        let pool = small_pool(6);
        let mut surface = pool.acquire().unwrap();
        surface.stamp(1, 42);
        pool.release(surface);
        let again = pool.acquire().unwrap();
        assert!(!again.is_in_flight());
        pool.release(again);
    }

    #[test]
    fn health_needs_twenty_percent_headroom() {
        let pool = small_pool(10);
        let mut held = Vec::new();
        for _ in 0..8 {
            held.push(pool.acquire().unwrap());
        }
        // 2 of 10 free is exactly the threshold
        assert!(pool.is_healthy());
        held.push(pool.acquire().unwrap());
        assert!(!pool.is_healthy());
        for s in held {
            pool.release(s);
        }
    }

    #[test]
    fn host_storage_is_sized_for_frame() {
        let pool = BufferPool::new(PoolConfig {
            num_buffers: 6,
            width: 64,
            height: 48,
            storage: StorageClass::Host,
        })
        .unwrap();
        let surface = pool.acquire().unwrap();
        assert_eq!(surface.payload_len(), 64 * 48);
        pool.release(surface);
    }

    #[test]
    fn zero_buffers_rejected() {
        let result = BufferPool::new(PoolConfig {
            num_buffers: 0,
            width: 64,
            height: 48,
            storage: StorageClass::Device,
        });
        assert!(result.is_err());
    }
}
