use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ember_core::comm::{Communicator, CommunicatorRegistry};
use ember_core::Result;

/// Single-process communicator: rank 0 of a group of 1.
#[derive(Debug, Default)]
pub struct LocalCommunicator;

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    // one participant: the sum is the input
    fn all_reduce_f64(&self, _data: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

/// Always hands out the same local communicator.
#[derive(Debug, Default)]
pub struct LocalCommRegistry {
    comm: Arc<LocalCommunicator>,
    handed_out: AtomicU64,
}

impl LocalCommRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many handles were requested so far.
    pub fn handed_out(&self) -> u64 {
        self.handed_out.load(Ordering::Relaxed)
    }
}

impl CommunicatorRegistry for LocalCommRegistry {
    fn current(&self) -> Result<Arc<dyn Communicator>> {
        self.handed_out.fetch_add(1, Ordering::Relaxed);
        Ok(self.comm.clone())
    }
}
