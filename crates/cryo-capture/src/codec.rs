use std::collections::HashMap;
use std::io::{Read, Write};

use cryo_track::StateTable;
use cryo_types::{ContextHandle, ImageLayout, RawHandle, ResolvedRange, TrackedObject};

use crate::record::RestoreObjectRecord;

/// Captured handle to restored handle.
pub type HandleMap = HashMap<RawHandle, RawHandle>;

/// Result of re-creating one object during a restore.
#[derive(Debug, Clone)]
pub struct RestoredObject {
    /// Handle of the freshly created object.
    pub handle: RawHandle,
    /// For images: the range covering the whole image and the per-cell
    /// layouts (layer-major) the uploaded contents must end up in.
    pub image: Option<(ResolvedRange, Vec<ImageLayout>)>,
}

impl RestoredObject {
    pub fn opaque(handle: RawHandle) -> Self {
        Self {
            handle,
            image: None,
        }
    }
}

/// Serializes creation parameters at capture time and re-creates objects
/// from them at restore time.
///
/// The capture pass stores whatever `encode` writes as the object's
/// metadata file; bulk contents travel separately through the copy engine.
/// Implementations live with the embedder, which is the only party that
/// knows how to call its own driver's create functions.
pub trait ObjectCodec {
    fn encode(
        &self,
        object: &TrackedObject,
        table: &StateTable,
        w: &mut dyn Write,
    ) -> std::io::Result<()>;

    /// Re-creates `record`'s object inside `ctx`. `remap` resolves the
    /// record's dependency handles to their already restored counterparts;
    /// manifest order guarantees they are present. `address` is the device
    /// address captured for the object (buffers created with a device-address
    /// usage, acceleration structures), so the implementation can re-create
    /// it in place or record the old-to-new mapping for replay.
    fn decode(
        &mut self,
        record: &RestoreObjectRecord,
        ctx: ContextHandle,
        address: Option<u64>,
        remap: &HandleMap,
        r: &mut dyn Read,
    ) -> std::io::Result<RestoredObject>;
}
