use std::fmt;
use std::sync::Arc;

use crate::device::Device;
use crate::error::Result;

/// Purpose of an execution stream. Streams with different tags never alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamTag {
    Compute,
    Copy,
    Communicate,
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamTag::Compute => write!(f, "compute"),
            StreamTag::Copy => write!(f, "copy"),
            StreamTag::Communicate => write!(f, "communicate"),
        }
    }
}

/// An execution stream on a device.
pub trait Stream: Send + Sync {
    fn device(&self) -> Device;
    fn tag(&self) -> StreamTag;
    /// Block until all work queued on this stream has finished.
    fn wait(&self) -> Result<()>;
}

/// Stream acquisition contract consumed by the interpreter.
pub trait StreamPool: Send + Sync {
    /// The same `(device, tag, index)` triple always yields the same stream.
    fn acquire(&self, device: Device, tag: StreamTag, index: usize) -> Result<Arc<dyn Stream>>;
}
