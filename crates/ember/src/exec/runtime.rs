use std::sync::Arc;

use ember_core::comm::CommunicatorRegistry;
use ember_core::memory::MemoryPool;
use ember_core::op::DispatchRegistry;
use ember_core::stream::{StreamPool, StreamTag};
use ember_core::{BindingTable, Device};
use ember_cpu::{HostMemoryPool, HostStreamPool, LocalCommRegistry};

// Runtime configuration

/// Configuration for the interpreter's runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Device calls target unless an operator's declare step says otherwise.
    pub device: Device,
    /// Whether the host memory pool caches released buffers (default: true).
    pub cache_host_memory: bool,
    /// Stream tag for stream requests that do not name one.
    pub default_stream_tag: StreamTag,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: Device::cpu(),
            cache_host_memory: true,
            default_stream_tag: StreamTag::Compute,
        }
    }
}

impl RuntimeConfig {
    /// Set the default target device.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Enable or disable host buffer caching.
    pub fn with_host_cache(mut self, cache: bool) -> Self {
        self.cache_host_memory = cache;
        self
    }

    /// Set the default stream tag.
    pub fn with_stream_tag(mut self, tag: StreamTag) -> Self {
        self.default_stream_tag = tag;
        self
    }
}

// Runtime

/// The collaborators an interpreter evaluates against.
#[derive(Clone)]
pub struct Runtime {
    memory: Arc<dyn MemoryPool>,
    streams: Arc<dyn StreamPool>,
    comms: Arc<dyn CommunicatorRegistry>,
    dispatch: Arc<DispatchRegistry>,
    bindings: BindingTable,
    config: RuntimeConfig,
}

impl Runtime {
    /// Host pools, the reference operator implementations and the global
    /// binding table.
    pub fn host() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let dispatch = DispatchRegistry::new();
        ember_cpu::ops::install(&dispatch);
        Runtime {
            memory: Arc::new(HostMemoryPool::new(config.cache_host_memory)),
            streams: Arc::new(HostStreamPool::new()),
            comms: Arc::new(LocalCommRegistry::new()),
            dispatch: Arc::new(dispatch),
            bindings: BindingTable::global().clone(),
            config,
        }
    }

    pub fn new(
        memory: Arc<dyn MemoryPool>,
        streams: Arc<dyn StreamPool>,
        comms: Arc<dyn CommunicatorRegistry>,
        dispatch: Arc<DispatchRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        Runtime {
            memory,
            streams,
            comms,
            dispatch,
            bindings: BindingTable::global().clone(),
            config,
        }
    }

    /// Use `bindings` instead of the process-wide binding table.
    pub fn with_bindings(mut self, bindings: BindingTable) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn memory(&self) -> &Arc<dyn MemoryPool> {
        &self.memory
    }

    pub fn streams(&self) -> &Arc<dyn StreamPool> {
        &self.streams
    }

    pub fn comms(&self) -> &Arc<dyn CommunicatorRegistry> {
        &self.comms
    }

    pub fn dispatch(&self) -> &Arc<DispatchRegistry> {
        &self.dispatch
    }

    pub fn bindings(&self) -> &BindingTable {
        &self.bindings
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}
