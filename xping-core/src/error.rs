//! Error types for xping-core
//!
//! These errors cover construction, identity generation and offline queue
//! operations. Delivery outcomes are never reported through this type; they
//! are returned as [`crate::types::UploadResult`] values.

use thiserror::Error;

/// Main error type for the xping-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller supplied an argument that cannot be used
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Offline queue is full
    #[error("offline queue capacity exceeded: {queued} queued + {incoming} incoming > {capacity}")]
    CapacityExceeded {
        queued: usize,
        incoming: usize,
        capacity: usize,
    },

    /// Delivery client could not be constructed
    #[error("delivery error: {0}")]
    Delivery(String),
}

/// Result type alias for xping-core
pub type Result<T> = std::result::Result<T, Error>;
