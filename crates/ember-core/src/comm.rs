use std::sync::Arc;

use crate::error::Result;

/// A handle to a distributed communication group.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    /// Sum `data` element-wise across every rank, in place.
    fn all_reduce_f64(&self, data: &mut [f64]) -> Result<()>;
}

/// Yields the communicator that distributed operators should use right now.
pub trait CommunicatorRegistry: Send + Sync {
    fn current(&self) -> Result<Arc<dyn Communicator>>;
}
