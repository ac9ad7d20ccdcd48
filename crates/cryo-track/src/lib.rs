//! State trackers for capture sessions.
//!
//! Three layers: [`SubresourceGrid`] is the dense per-image layout grid,
//! [`StateTable`] is the authoritative registry those grids live in, and
//! [`CommandStream`] derives the transitions a recorded command stream
//! implies, holding them in a side table until the submission that makes
//! them authoritative. Nothing in this crate performs I/O or talks to the
//! driver.

mod error;
mod grid;
mod stream;
mod table;

pub use crate::error::{Result, TrackError};
pub use crate::grid::SubresourceGrid;
pub use crate::stream::{
    CommandStream, ImageBarrier, LifecycleState, RecordedOp, ScopeAttachment,
};
pub use crate::table::{BufferDesc, ImageDesc, ObjectEntry, ObjectState, StateKey, StateTable};
