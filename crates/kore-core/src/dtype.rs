use std::fmt;

/// Element types a leaf tensor can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE 754 single-precision float
    F32,
    /// 64-bit IEEE 754 double-precision float
    F64,
    /// 64-bit signed integer (indices, token ids, counters)
    I64,
    /// Boolean (masks, done flags)
    Bool,
}

impl DType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Number of bytes needed to store `n` elements of this dtype.
    pub fn storage_bytes(&self, n: usize) -> usize {
        self.element_size() * n
    }

    /// Whether this dtype is a floating-point type.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Whether this dtype is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::I64)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, DType::Bool)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F64 => write!(f, "f64"),
            DType::I64 => write!(f, "i64"),
            DType::Bool => write!(f, "bool"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::F32.element_size(), 4);
        assert_eq!(DType::F64.element_size(), 8);
        assert_eq!(DType::I64.element_size(), 8);
        assert_eq!(DType::Bool.element_size(), 1);
    }

    #[test]
    fn test_storage_bytes() {
        assert_eq!(DType::F32.storage_bytes(10), 40);
        assert_eq!(DType::Bool.storage_bytes(3), 3);
    }

    #[test]
    fn test_dtype_categories() {
        assert!(DType::F32.is_float());
        assert!(!DType::F32.is_integer());
        assert!(DType::I64.is_integer());
        assert!(DType::Bool.is_bool());
        assert!(!DType::Bool.is_float());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", DType::F32), "f32");
        assert_eq!(format!("{}", DType::Bool), "bool");
    }
}
