use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ember_core::stream::{Stream, StreamPool, StreamTag};
use ember_core::{Device, Result};
use parking_lot::Mutex;

/// A host "stream". Host kernels run synchronously, so waiting only records
/// that a synchronization point was reached.
#[derive(Debug)]
pub struct HostStream {
    device: Device,
    tag: StreamTag,
    index: usize,
    waits: AtomicU64,
}

impl HostStream {
    pub fn index(&self) -> usize {
        self.index
    }

    /// How many times `wait` was called.
    pub fn waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }
}

impl Stream for HostStream {
    fn device(&self) -> Device {
        self.device
    }

    fn tag(&self) -> StreamTag {
        self.tag
    }

    fn wait(&self) -> Result<()> {
        self.waits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Streams keyed by (device, tag, index), created on first use.
#[derive(Default)]
pub struct HostStreamPool {
    streams: Mutex<HashMap<(Device, StreamTag, usize), Arc<HostStream>>>,
}

impl HostStreamPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stream for a key, if it was ever acquired.
    pub fn get(&self, device: Device, tag: StreamTag, index: usize) -> Option<Arc<HostStream>> {
        self.streams.lock().get(&(device, tag, index)).cloned()
    }

    /// Total waits across all streams.
    pub fn total_waits(&self) -> u64 {
        self.streams.lock().values().map(|s| s.waits()).sum()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamPool for HostStreamPool {
    fn acquire(&self, device: Device, tag: StreamTag, index: usize) -> Result<Arc<dyn Stream>> {
        let stream = self
            .streams
            .lock()
            .entry((device, tag, index))
            .or_insert_with(|| {
                Arc::new(HostStream {
                    device,
                    tag,
                    index,
                    waits: AtomicU64::new(0),
                })
            })
            .clone();
        Ok(stream)
    }
}
