//! Buffer pool error types.

use thiserror::Error;

/// Errors surfaced by the buffer pool manager.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("buffer pool is full: no free frame and no evictable page")]
    PoolExhausted,

    #[error("disk I/O failed: {0}")]
    Disk(anyhow::Error),
}

/// Result type for buffer pool operations.
pub type BufferResult<T> = Result<T, BufferError>;
