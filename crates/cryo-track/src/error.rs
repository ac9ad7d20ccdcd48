use cryo_types::{RawHandle, Subresource};
use thiserror::Error;

use crate::stream::LifecycleState;

pub type Result<T> = std::result::Result<T, TrackError>;

/// Tracker calls fail only on malformed input; the trackers never talk to
/// the driver or the filesystem.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("invalid grid dimensions {layers}x{levels}")]
    InvalidDimensions { layers: u32, levels: u32 },

    #[error("subresource out of bounds: {0}")]
    OutOfBounds(Subresource),

    #[error("subresource count overflows: base {base} + count {count}")]
    RangeOverflow { base: u32, count: u32 },

    #[error("unknown handle {0}")]
    UnknownHandle(RawHandle),

    #[error("stale state key")]
    StaleKey,

    #[error("handle {0} is already registered")]
    AlreadyRegistered(RawHandle),

    #[error("wrong kind for handle {handle}: expected {expected}")]
    WrongKind {
        handle: RawHandle,
        expected: &'static str,
    },

    #[error("{op} is not legal in the {state} state")]
    InvalidLifecycle {
        op: &'static str,
        state: LifecycleState,
    },

    #[error("malformed operation: {0}")]
    MalformedOp(&'static str),
}
