//! Error handling module following Rust best practices
//!
//! Uses `thiserror` for library errors with detailed error types
//! that consumers can match on and handle appropriately.

use std::io;

use nix::errno::Errno;
use thiserror::Error;

use crate::stream::StreamKind;

/// Custom error type for spawn operations
#[derive(Error, Debug)]
pub enum SpawnError {
    /// A stdio binding targeted a stream that is not pipe-backed
    #[error("stdio binding must target a pipe stream, got {kind:?}")]
    InvalidStdio { kind: StreamKind },

    /// Invalid spawn configuration
    #[error("invalid spawn configuration: {0}")]
    InvalidConfig(String),

    /// OS call failed; the errno is preserved verbatim
    #[error("OS error: {0}")]
    Os(#[from] Errno),

    /// IO operation failed
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),

    /// A capture buffer would overflow; never silently truncated
    #[error("{stream} capture buffer overflow")]
    BufferOverflow { stream: &'static str },

    /// Signal delivery on a handle without a live process identifier
    #[error("process handle has no live pid")]
    NoProcess,
}

/// Result type alias for spawn operations
pub type SpawnResult<T> = Result<T, SpawnError>;
