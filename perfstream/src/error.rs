use std::io;
use thiserror::Error;

/// Failures of the socket connecting producer and viewer. These end the
/// session but never the process.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("already running")]
    AlreadyRunning,
}

/// The buffer pool has no idle buffer and may not allocate another one.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("buffer pool exhausted ({allocated} of {max} buffers in use)")]
pub struct CapacityError {
    pub allocated: usize,
    pub max: usize,
}
