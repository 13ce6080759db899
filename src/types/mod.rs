use serde::{Deserialize, Serialize};

/// Unique name of a primitive within a topology.
pub type PrimitiveId = String;

/// Element type stored in a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl DataType {
    /// Size of a single element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DataType::I8 => 1,
            DataType::I16 | DataType::F16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F16 | DataType::F32 | DataType::F64)
    }

    /// Type name as spelled in kernel source.
    pub fn code_name(&self) -> &'static str {
        match self {
            DataType::I8 => "char",
            DataType::I16 => "short",
            DataType::I32 => "int",
            DataType::I64 => "long",
            DataType::F16 => "half",
            DataType::F32 => "float",
            DataType::F64 => "double",
        }
    }

    /// Largest finite value representable, as f64.
    pub fn max_value(&self) -> f64 {
        match self {
            DataType::I8 => i8::MAX as f64,
            DataType::I16 => i16::MAX as f64,
            DataType::I32 => i32::MAX as f64,
            DataType::I64 => i64::MAX as f64,
            DataType::F16 => f64::from(half::f16::MAX),
            DataType::F32 => f32::MAX as f64,
            DataType::F64 => f64::MAX,
        }
    }

    pub fn min_value(&self) -> f64 {
        match self {
            DataType::I8 => i8::MIN as f64,
            DataType::I16 => i16::MIN as f64,
            DataType::I32 => i32::MIN as f64,
            DataType::I64 => i64::MIN as f64,
            DataType::F16 => f64::from(half::f16::MIN),
            DataType::F32 => f32::MIN as f64,
            DataType::F64 => f64::MIN,
        }
    }
}

/// A scalar kernel argument resolved at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    U32(u32),
    I32(i32),
    F32(f32),
}

impl ScalarValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            ScalarValue::U32(v) => *v as f64,
            ScalarValue::I32(v) => *v as f64,
            ScalarValue::F32(v) => *v as f64,
        }
    }
}
