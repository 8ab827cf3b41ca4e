use kore_tensordict::TensorDictError;

/// Errors raised while building or iterating batches.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("invalid loader configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse loader configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Container(#[from] TensorDictError),
}

impl From<kore_core::KoreError> for DataError {
    fn from(err: kore_core::KoreError) -> Self {
        DataError::Container(err.into())
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
