use cryo_types::RawHandle;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriverError>;

/// Failure reported by the underlying driver, mapped from its result code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("device lost")]
    DeviceLost,

    #[error("out of device memory")]
    OutOfDeviceMemory,

    #[error("out of host memory")]
    OutOfHostMemory,

    #[error("timed out waiting for fence {0}")]
    FenceTimeout(RawHandle),

    #[error("invalid handle {0}")]
    InvalidHandle(RawHandle),

    #[error("validation failure: {0}")]
    Validation(&'static str),
}
