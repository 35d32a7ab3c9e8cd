use thiserror::Error;

use crate::native::NativeError;

#[derive(Error, Debug)]
pub enum PoolError {
    /// Failure reported by the native client library. Always carries the
    /// original error code and message.
    #[error("Native protocol error {code}: {message}")]
    Native { code: i32, message: String },

    /// Pool at maximum capacity and the acquisition timeout elapsed.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Operation attempted on a disposed/passivated session, or dispose
    /// attempted while a transaction is active. A usage bug, not a
    /// runtime condition to recover from.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Requested table, layer, version or state does not exist.
    #[error("'{0}' not found")]
    NotFound(String),

    /// Invalid pool bounds or connection parameters.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

impl From<NativeError> for PoolError {
    fn from(err: NativeError) -> Self {
        Self::Native {
            code: err.code,
            message: err.message,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for PoolError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl PoolError {
    /// Remaps a native lookup failure onto [`PoolError::NotFound`] so callers
    /// of the metadata accessors see a uniform not-found kind. Every other
    /// native failure keeps its protocol error shape.
    pub(crate) fn for_lookup(name: &str, err: NativeError) -> Self {
        if err.is_not_found() {
            Self::NotFound(name.to_string())
        } else {
            err.into()
        }
    }
}
