// Host Memory Pool — Caching allocator for host buffer reuse
//
// Keeps per-size free lists of previously allocated host buffers. When the
// last `Memory` handle drops, its storage comes back here instead of being
// freed; the next allocation of the same byte size reuses it.
//
// Workspace memory is the main beneficiary: it is requested and released on
// every primitive execution, always with the same sizes for the same call
// signature.
//
//   let pool = HostMemoryPool::new(true);
//   let mem = pool.alloc(Device::cpu(), 1024)?;   // miss
//   drop(mem);                                    // cached
//   let mem = pool.alloc(Device::cpu(), 1024)?;   // hit
//   pool.empty_cache();

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ember_core::memory::{Memory, MemoryPool, Reclaim};
use ember_core::{Device, DeviceKind, Error, Result};
use parking_lot::Mutex;
use tracing::trace;

// Pool statistics

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total bytes currently held in the cache (not in use by any value).
    pub cached_bytes: usize,
    /// Number of individual buffers currently in the cache.
    pub cached_buffers: usize,
    /// Cumulative cache hits (allocations served from the cache).
    pub hits: u64,
    /// Cumulative cache misses (allocations that went to the system allocator).
    pub misses: u64,
}

// Free lists

/// Maps byte size → stack of free buffers.
struct FreeLists {
    buckets: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    caching: bool,
}

impl FreeLists {
    fn try_pop(&self, nbytes: usize) -> Option<Vec<u8>> {
        self.buckets.lock().get_mut(&nbytes).and_then(Vec::pop)
    }

    fn drain(&self) -> (usize, usize) {
        let mut map = self.buckets.lock();
        let mut count = 0usize;
        let mut bytes = 0usize;
        for (n, stack) in map.drain() {
            count += stack.len();
            bytes += n * stack.len();
        }
        (count, bytes)
    }

    fn stats(&self) -> (usize, usize) {
        let map = self.buckets.lock();
        map.iter()
            .fold((0, 0), |(c, b), (n, stack)| (c + stack.len(), b + n * stack.len()))
    }
}

impl Reclaim for FreeLists {
    fn reclaim(&self, _device: Device, storage: Vec<u8>) {
        if self.caching {
            self.buckets.lock().entry(storage.len()).or_default().push(storage);
        }
    }
}

// HostMemoryPool

/// A host memory caching allocator.
pub struct HostMemoryPool {
    lists: Arc<FreeLists>,
    // Atomic counters — no lock contention on the hot path
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HostMemoryPool {
    /// Create an empty pool. With `caching == false` released buffers are
    /// freed immediately.
    pub fn new(caching: bool) -> Self {
        HostMemoryPool {
            lists: Arc::new(FreeLists {
                buckets: Mutex::new(HashMap::new()),
                caching,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Release all cached buffers.
    pub fn empty_cache(&self) {
        let (count, bytes) = self.lists.drain();
        trace!(buffers = count, bytes, "host pool emptied");
    }

    /// Return a snapshot of pool statistics.
    pub fn stats(&self) -> PoolStats {
        let (cached_buffers, cached_bytes) = self.lists.stats();
        PoolStats {
            cached_bytes,
            cached_buffers,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Reset hit/miss counters.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for HostMemoryPool {
    fn default() -> Self {
        Self::new(true)
    }
}

impl MemoryPool for HostMemoryPool {
    fn alloc(&self, device: Device, nbytes: usize) -> Result<Arc<Memory>> {
        if device.kind != DeviceKind::Cpu {
            return Err(Error::msg(format!("host memory pool cannot allocate on {device}")));
        }
        let storage = match self.lists.try_pop(nbytes) {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; nbytes]
            }
        };
        let reclaim: Weak<dyn Reclaim> = Arc::downgrade(&self.lists) as Weak<dyn Reclaim>;
        Ok(Arc::new(Memory::with_reclaim(device, storage, reclaim)))
    }
}
