use kore_core::{DType, Device, KoreError, Shape};

/// Errors raised by container operations.
///
/// Every variant is raised at the call that would break an invariant;
/// nothing is deferred to a later access.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TensorDictError {
    #[error("key \"{0}\" not found")]
    KeyNotFound(String),

    #[error("batch size mismatch for \"{key}\": expected a shape starting with {expected}, got {got}")]
    BatchSizeMismatch {
        key: String,
        expected: Shape,
        got: Shape,
    },

    #[error("device mismatch for \"{key}\": container is on {expected}, value is on {got}")]
    DeviceMismatch {
        key: String,
        expected: Device,
        got: Device,
    },

    #[error("dtype mismatch for \"{key}\": expected {expected}, got {got}")]
    DTypeMismatch {
        key: String,
        expected: DType,
        got: DType,
    },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("key mismatch: {0}")]
    KeyMismatch(String),

    #[error("index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("entry \"{key}\" is a {found}, expected a {expected}")]
    KindMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("stale reference: {0}")]
    StaleReference(String),

    #[error(transparent)]
    Tensor(KoreError),
}

impl From<KoreError> for TensorDictError {
    fn from(err: KoreError) -> Self {
        match err {
            KoreError::InvalidIndex(msg) => TensorDictError::IndexOutOfRange(msg),
            KoreError::InvalidAxis { axis, ndim } => TensorDictError::IndexOutOfRange(format!(
                "dimension {axis} out of range for {ndim} batch dimension(s)"
            )),
            other => TensorDictError::Tensor(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorDictError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_errors_are_remapped() {
        let err: TensorDictError = KoreError::InvalidIndex("index 5".into()).into();
        assert_eq!(err, TensorDictError::IndexOutOfRange("index 5".into()));
        let err: TensorDictError = KoreError::InvalidAxis { axis: 3, ndim: 2 }.into();
        assert!(matches!(err, TensorDictError::IndexOutOfRange(_)));
        let err: TensorDictError = KoreError::StorageError("x".into()).into();
        assert!(matches!(err, TensorDictError::Tensor(_)));
    }

    #[test]
    fn test_messages_name_the_key() {
        let err = TensorDictError::BatchSizeMismatch {
            key: "obs".into(),
            expected: Shape::new(&[4, 4]),
            got: Shape::new(&[3, 4, 5]),
        };
        let msg = err.to_string();
        assert!(msg.contains("\"obs\""));
        assert!(msg.contains("[4, 4]"));
        assert!(msg.contains("[3, 4, 5]"));
    }
}
