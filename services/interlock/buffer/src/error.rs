//! Buffer error types.

use thiserror::Error;

/// Buffer errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    /// Capacity must be non-zero
    #[error("buffer capacity must be non-zero")]
    ZeroCapacity,

    /// Capacity above the supported maximum
    #[error("buffer capacity {requested} exceeds maximum {max}")]
    TooLarge {
        /// Requested capacity
        requested: usize,
        /// Supported maximum
        max: usize,
    },
}
