// Memory — device buffers and the allocation contract
//
// A `Memory` is one allocation handed out by a `MemoryPool`. Tensors hold
// their backing memory through `Arc<Memory>`, so views and pinned operator
// environments keep the buffer alive for exactly as long as something still
// references it.
//
// When the last handle is dropped the storage is offered back to the pool it
// came from (if the pool is still alive). The pool decides whether to cache
// it or release it.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::device::Device;
use crate::error::Result;

/// Receives storage back from a dropped [`Memory`].
pub trait Reclaim: Send + Sync {
    fn reclaim(&self, device: Device, storage: Vec<u8>);
}

/// A single device buffer.
pub struct Memory {
    device: Device,
    nbytes: usize,
    storage: RwLock<Vec<u8>>,
    reclaim: Option<Weak<dyn Reclaim>>,
}

impl Memory {
    /// Memory that is simply freed when dropped.
    pub fn new(device: Device, storage: Vec<u8>) -> Self {
        Memory {
            device,
            nbytes: storage.len(),
            storage: RwLock::new(storage),
            reclaim: None,
        }
    }

    /// Memory that returns its storage to `pool` when dropped.
    pub fn with_reclaim(device: Device, storage: Vec<u8>, pool: Weak<dyn Reclaim>) -> Self {
        Memory {
            device,
            nbytes: storage.len(),
            storage: RwLock::new(storage),
            reclaim: Some(pool),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.storage.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.storage.write()
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if let Some(pool) = self.reclaim.take().and_then(|w| w.upgrade()) {
            let storage = std::mem::take(self.storage.get_mut());
            pool.reclaim(self.device, storage);
        }
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("device", &self.device)
            .field("nbytes", &self.nbytes)
            .finish()
    }
}

/// Allocation contract consumed by the interpreter.
///
/// Output buffers and workspaces are both obtained here. Returned memory
/// content is unspecified.
pub trait MemoryPool: Send + Sync {
    fn alloc(&self, device: Device, nbytes: usize) -> Result<Arc<Memory>>;
}
