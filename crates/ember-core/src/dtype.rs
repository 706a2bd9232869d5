use std::fmt;

use half::{bf16, f16};

// DType: element types of tensors and scalars
//
// Every tensor value and every tensor type carries a DType. Scalars carry one
// too so that a scalar can be reified as a rank-0 tensor type during
// inference.

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    F16,
    BF16,
    F32,
    F64,
    U8,
    U32,
    I32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::Bool | DType::U8 => 1,
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::U32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    /// Decode one element stored little-endian at the start of `bytes`.
    pub fn read_f64(&self, bytes: &[u8]) -> f64 {
        match self {
            DType::Bool => (bytes[0] != 0) as u8 as f64,
            DType::U8 => bytes[0] as f64,
            DType::F16 => f16::from_le_bytes([bytes[0], bytes[1]]).to_f64(),
            DType::BF16 => bf16::from_le_bytes([bytes[0], bytes[1]]).to_f64(),
            DType::F32 => f32::from_le_bytes(bytes[..4].try_into().unwrap_or_default()) as f64,
            DType::U32 => u32::from_le_bytes(bytes[..4].try_into().unwrap_or_default()) as f64,
            DType::I32 => i32::from_le_bytes(bytes[..4].try_into().unwrap_or_default()) as f64,
            DType::F64 => f64::from_le_bytes(bytes[..8].try_into().unwrap_or_default()),
            DType::I64 => i64::from_le_bytes(bytes[..8].try_into().unwrap_or_default()) as f64,
        }
    }

    /// Encode `v` little-endian into the start of `bytes`.
    pub fn write_f64(&self, bytes: &mut [u8], v: f64) {
        match self {
            DType::Bool => bytes[0] = (v != 0.0) as u8,
            DType::U8 => bytes[0] = v as u8,
            DType::F16 => bytes[..2].copy_from_slice(&f16::from_f64(v).to_le_bytes()),
            DType::BF16 => bytes[..2].copy_from_slice(&bf16::from_f64(v).to_le_bytes()),
            DType::F32 => bytes[..4].copy_from_slice(&(v as f32).to_le_bytes()),
            DType::U32 => bytes[..4].copy_from_slice(&(v as u32).to_le_bytes()),
            DType::I32 => bytes[..4].copy_from_slice(&(v as i32).to_le_bytes()),
            DType::F64 => bytes[..8].copy_from_slice(&v.to_le_bytes()),
            DType::I64 => bytes[..8].copy_from_slice(&(v as i64).to_le_bytes()),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Bool => "bool",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I32 => "i32",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

// WithDType: connects Rust element types to the DType enum

/// Trait implemented by Rust types that can be stored in a host tensor.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64 {
        num_traits::cast(self).unwrap_or(f64::NAN)
    }

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        f16::from_f64(v)
    }
}

impl WithDType for bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }
    fn from_f64(v: f64) -> Self {
        bf16::from_f64(v)
    }
}

impl WithDType for u8 {
    const DTYPE: DType = DType::U8;
    fn from_f64(v: f64) -> Self {
        v as u8
    }
}

impl WithDType for u32 {
    const DTYPE: DType = DType::U32;
    fn from_f64(v: f64) -> Self {
        v as u32
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_roundtrip_through_bytes() {
        let mut buf = [0u8; 8];
        for dtype in [DType::F32, DType::F64, DType::I32, DType::I64, DType::F16] {
            dtype.write_f64(&mut buf, -3.0);
            assert_eq!(dtype.read_f64(&buf), -3.0, "{dtype}");
        }
        DType::Bool.write_f64(&mut buf, 5.0);
        assert_eq!(DType::Bool.read_f64(&buf), 1.0);
    }

    #[test]
    fn test_sizes() {
        assert_eq!(DType::Bool.size_in_bytes(), 1);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::I64.size_in_bytes(), 8);
        assert_eq!(<f16 as WithDType>::DTYPE, DType::F16);
    }
}
