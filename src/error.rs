//! Error types shared by the runtime and the server.

use crate::config::ConfigError;
use std::io;

/// Errors produced while building or running the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// No freed slice and no room left to carve a new one.
    #[error("buffer arena exhausted ({capacity} bytes in {slice_size}-byte slices)")]
    ArenaExhausted { capacity: usize, slice_size: usize },

    /// Checkout requested with no context available.
    #[error("operation context pool exhausted ({total} contexts)")]
    PoolExhausted { total: usize },

    /// Handler produced a response that does not fit in one buffer slice.
    #[error("response of {len} bytes exceeds buffer slice of {capacity} bytes")]
    ResponseTooLarge { len: usize, capacity: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
