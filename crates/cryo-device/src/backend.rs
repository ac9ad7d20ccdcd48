use cryo_types::{BufferUsage, ContextHandle, ImageLayout, RawHandle, ResolvedRange};

use crate::error::Result;

/// A host-visible staging allocation: the buffer object plus the memory it
/// is bound to. Mapping and unmapping stay inside the backend; callers only
/// see whole-allocation reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingAlloc {
    pub buffer: RawHandle,
    pub memory: RawHandle,
    pub bytes: u64,
}

/// The driver entry points the copy engine and the capture pass call.
///
/// Every method is an opaque, fallible call into the underlying API; no
/// method blocks except [`DeviceBackend::wait_fence`] and
/// [`DeviceBackend::wait_idle`]. Implementations must be safe to call from
/// several threads at once; the engine serializes only `queue_submit`.
pub trait DeviceBackend: Send + Sync {
    // Command buffers.
    fn create_command_buffer(&self, ctx: ContextHandle) -> Result<RawHandle>;
    fn destroy_command_buffer(&self, ctx: ContextHandle, cb: RawHandle) -> Result<()>;
    /// Begins a one-time-submit recording, implicitly resetting `cb`.
    fn begin_commands(&self, cb: RawHandle) -> Result<()>;
    fn end_commands(&self, cb: RawHandle) -> Result<()>;

    // Fences.
    fn create_fence(&self, ctx: ContextHandle) -> Result<RawHandle>;
    fn destroy_fence(&self, ctx: ContextHandle, fence: RawHandle) -> Result<()>;
    /// Blocks until `fence` signals.
    fn wait_fence(&self, fence: RawHandle) -> Result<()>;
    fn reset_fence(&self, fence: RawHandle) -> Result<()>;

    // Host-visible staging memory.
    fn allocate_staging(&self, ctx: ContextHandle, bytes: u64) -> Result<StagingAlloc>;
    fn free_staging(&self, ctx: ContextHandle, alloc: StagingAlloc) -> Result<()>;
    fn read_staging(&self, memory: RawHandle, len: usize) -> Result<Vec<u8>>;
    fn write_staging(&self, memory: RawHandle, data: &[u8]) -> Result<()>;

    // Device-local buffers (serialization scratch).
    fn create_device_buffer(
        &self,
        ctx: ContextHandle,
        bytes: u64,
        usage: BufferUsage,
    ) -> Result<RawHandle>;
    fn destroy_device_buffer(&self, ctx: ContextHandle, buffer: RawHandle) -> Result<()>;

    // Recorded transfer commands.
    fn cmd_copy_buffer(
        &self,
        cb: RawHandle,
        src: RawHandle,
        src_offset: u64,
        dst: RawHandle,
        dst_offset: u64,
        bytes: u64,
    ) -> Result<()>;
    fn cmd_copy_image_to_buffer(
        &self,
        cb: RawHandle,
        image: RawHandle,
        range: ResolvedRange,
        buffer: RawHandle,
        buffer_offset: u64,
    ) -> Result<()>;
    fn cmd_copy_buffer_to_image(
        &self,
        cb: RawHandle,
        buffer: RawHandle,
        buffer_offset: u64,
        image: RawHandle,
        range: ResolvedRange,
    ) -> Result<()>;
    /// Transitions every subresource in `range` from `from` to `to`.
    /// `from == Undefined` matches any current layout and discards contents.
    fn cmd_transition_image(
        &self,
        cb: RawHandle,
        image: RawHandle,
        range: ResolvedRange,
        from: ImageLayout,
        to: ImageLayout,
    ) -> Result<()>;
    /// Writes `accel`'s driver-opaque serialized blob into `scratch`.
    fn cmd_serialize_accel(&self, cb: RawHandle, accel: RawHandle, scratch: RawHandle)
        -> Result<()>;
    /// Rebuilds `accel` from the serialized blob previously copied into
    /// `scratch`.
    fn cmd_deserialize_accel(
        &self,
        cb: RawHandle,
        scratch: RawHandle,
        accel: RawHandle,
    ) -> Result<()>;

    // Queue and device state.
    fn queue_submit(&self, ctx: ContextHandle, cb: RawHandle, fence: RawHandle) -> Result<()>;
    /// Blocks until every submission against `ctx` has completed.
    fn wait_idle(&self, ctx: ContextHandle) -> Result<()>;

    // Capture-time queries.
    fn accel_serialized_size(&self, accel: RawHandle) -> Result<u64>;
    fn buffer_device_address(&self, buffer: RawHandle) -> Result<u64>;
    fn accel_device_address(&self, accel: RawHandle) -> Result<u64>;
}
