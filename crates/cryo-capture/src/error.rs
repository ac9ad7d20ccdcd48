use std::io;
use std::sync::Mutex;

use cryo_copy::CopyError;
use cryo_device::DriverError;
use cryo_track::TrackError;
use cryo_types::ContextHandle;
use thiserror::Error;
use tracing::warn;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("not a restore point file")]
    InvalidMagic,

    #[error("unsupported restore point version {0}")]
    UnsupportedVersion(u16),

    #[error("unsupported endianness marker {0:#04x}")]
    InvalidEndianness(u8),

    #[error("corrupt restore point: {0}")]
    Corrupt(&'static str),

    #[error("no target context mapped for {0}")]
    MissingContext(ContextHandle),
}

/// Keeps the first error of a best-effort pass; later ones are logged and
/// dropped so every object still gets its chance.
#[derive(Debug, Default)]
pub(crate) struct ErrorLatch {
    first: Mutex<Option<CaptureError>>,
}

impl ErrorLatch {
    pub(crate) fn record(&self, err: CaptureError) {
        let mut slot = match self.first.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() {
            *slot = Some(err);
        } else {
            warn!("suppressing follow-up error: {err}");
        }
    }

    pub(crate) fn latch<T>(&self, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.record(err);
                None
            }
        }
    }

    pub(crate) fn finish(&self) -> Result<()> {
        let first = match self.first.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match first {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
