use std::io;

use cryo_device::DriverError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CopyError>;

/// Task failures are delivered through each request's completion callback,
/// never as a synchronous return; only construction, `wait()` and `reset()`
/// report errors directly.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("staging allocation of {bytes} bytes failed")]
    Exhausted { bytes: u64 },

    #[error("malformed request: {0}")]
    Precondition(&'static str),
}
