//! Persistence errors.

use common::BridgeError;
use thiserror::Error;

/// Failure reading or writing a preference or permission store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for BridgeError {
    fn from(err: StoreError) -> Self {
        BridgeError::storage(err.to_string())
    }
}
