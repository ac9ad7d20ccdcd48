//! Restore points for live graphics object graphs.
//!
//! A restore point is a directory: a manifest naming every reachable object
//! in dependency order, one metadata file per object with its creation
//! parameters, raw payload files for buffers, images and acceleration
//! structures, and a table of captured device addresses. [`CapturePass`]
//! writes one from a live graph; [`RestorePass`] walks it back into freshly
//! created objects. Both lean on the embedder through the [`ObjectCodec`]
//! and [`ObjectGraph`] traits, since only the embedder can talk to its own
//! driver.

mod capture;
mod codec;
mod error;
mod format;
mod graph;
mod manifest;
mod record;
mod restore;
mod wire;

pub use crate::capture::{CaptureOptions, CapturePass, CaptureStats};
pub use crate::codec::{HandleMap, ObjectCodec, RestoredObject};
pub use crate::error::{CaptureError, Result};
pub use crate::format::{
    metadata_path, payload_path, SectionId, ADDRESSES_FILE, LITTLE_ENDIAN, MAGIC, MANIFEST_FILE,
    VERSION,
};
pub use crate::graph::{enumerate, EnumeratedObject, Enumeration, ObjectGraph};
pub use crate::manifest::{read_addresses, read_manifest, write_addresses, write_manifest};
pub use crate::record::RestoreObjectRecord;
pub use crate::restore::{RestoreOptions, RestorePass, RestoreStats};
