use std::fmt;

/// Kind of device a tensor or stream lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda => write!(f, "cuda"),
        }
    }
}

/// A concrete device: kind plus ordinal (e.g. `cuda(1)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub kind: DeviceKind,
    pub id: u32,
}

impl Device {
    pub const fn cpu() -> Self {
        Device {
            kind: DeviceKind::Cpu,
            id: 0,
        }
    }

    pub const fn cuda(id: u32) -> Self {
        Device {
            kind: DeviceKind::Cuda,
            id,
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.id)
    }
}
