use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use cryo_types::{BufferUsage, ContextHandle, ImageLayout, RawHandle, ResolvedRange};

use crate::backend::{DeviceBackend, StagingAlloc};
use crate::error::{DriverError, Result};

const BASE_ADDRESS: u64 = 0x4000_0000;

/// Pure software implementation of [`DeviceBackend`].
///
/// Object contents live in host memory and every recorded command executes
/// synchronously inside `queue_submit`, after which the fence is signaled.
/// Validation mirrors what a debug layer enforces: layout mismatches,
/// out-of-bounds copies and cross-device handles all fail the submission.
/// `fail_next_submit` and `fail_next_staging_alloc` inject driver errors
/// for failure-path tests.
#[derive(Debug, Default)]
pub struct SoftDevice {
    next: AtomicU64,
    inner: Mutex<SoftState>,
}

#[derive(Debug, Default)]
struct SoftState {
    contexts: HashSet<ContextHandle>,
    buffers: HashMap<RawHandle, SoftBuffer>,
    /// Staging memory handle -> backing buffer handle.
    memories: HashMap<RawHandle, RawHandle>,
    images: HashMap<RawHandle, SoftImage>,
    accels: HashMap<RawHandle, SoftAccel>,
    commands: HashMap<RawHandle, SoftCommands>,
    fences: HashMap<RawHandle, SoftFence>,
    submits: u64,
    staging_allocs: usize,
    device_buffer_allocs: usize,
    fail_next_submit: Option<DriverError>,
    fail_next_staging_alloc: Option<DriverError>,
}

#[derive(Debug)]
struct SoftBuffer {
    ctx: ContextHandle,
    data: Vec<u8>,
    address: u64,
}

#[derive(Debug)]
struct SoftImage {
    ctx: ContextHandle,
    layers: u32,
    levels: u32,
    /// Per-subresource contents, indexed `layer * levels + level`.
    subresources: Vec<Vec<u8>>,
    layouts: Vec<ImageLayout>,
}

#[derive(Debug)]
struct SoftAccel {
    ctx: ContextHandle,
    blob: Vec<u8>,
    address: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdPhase {
    Idle,
    Recording,
    Ready,
}

#[derive(Debug)]
struct SoftCommands {
    ctx: ContextHandle,
    phase: CmdPhase,
    cmds: Vec<SoftCmd>,
}

#[derive(Debug)]
struct SoftFence {
    ctx: ContextHandle,
    signaled: bool,
}

#[derive(Debug, Clone)]
enum SoftCmd {
    CopyBuffer {
        src: RawHandle,
        src_offset: u64,
        dst: RawHandle,
        dst_offset: u64,
        bytes: u64,
    },
    CopyImageToBuffer {
        image: RawHandle,
        range: ResolvedRange,
        buffer: RawHandle,
        buffer_offset: u64,
    },
    CopyBufferToImage {
        buffer: RawHandle,
        buffer_offset: u64,
        image: RawHandle,
        range: ResolvedRange,
    },
    Transition {
        image: RawHandle,
        range: ResolvedRange,
        from: ImageLayout,
        to: ImageLayout,
    },
    SerializeAccel {
        accel: RawHandle,
        scratch: RawHandle,
    },
    DeserializeAccel {
        scratch: RawHandle,
        accel: RawHandle,
    },
}

impl SoftDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SoftState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn fresh_handle(&self) -> RawHandle {
        RawHandle(self.next.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn fresh_address(&self, handle: RawHandle) -> u64 {
        BASE_ADDRESS + (handle.0 << 8)
    }

    /// Registers a new device context and returns its handle.
    pub fn create_context(&self) -> ContextHandle {
        let ctx = ContextHandle(self.fresh_handle().0);
        self.state().contexts.insert(ctx);
        ctx
    }

    /// Creates a device-local buffer holding `data`.
    pub fn seed_buffer(&self, ctx: ContextHandle, data: Vec<u8>) -> Result<RawHandle> {
        let handle = self.fresh_handle();
        let address = self.fresh_address(handle);
        let mut state = self.state();
        state.check_context(ctx)?;
        state.buffers.insert(handle, SoftBuffer { ctx, data, address });
        Ok(handle)
    }

    /// Creates an image from per-subresource contents, every subresource in
    /// `layout`. `subresources.len()` must equal `layers * levels`.
    pub fn seed_image(
        &self,
        ctx: ContextHandle,
        layers: u32,
        levels: u32,
        subresources: Vec<Vec<u8>>,
        layout: ImageLayout,
    ) -> Result<RawHandle> {
        if subresources.len() != (layers as usize) * (levels as usize) || subresources.is_empty() {
            return Err(DriverError::Validation("subresource count mismatch"));
        }
        let handle = self.fresh_handle();
        let mut state = self.state();
        state.check_context(ctx)?;
        let cells = subresources.len();
        state.images.insert(
            handle,
            SoftImage {
                ctx,
                layers,
                levels,
                subresources,
                layouts: vec![layout; cells],
            },
        );
        Ok(handle)
    }

    /// Creates an acceleration structure whose serialized payload is `blob`.
    pub fn seed_accel(&self, ctx: ContextHandle, blob: Vec<u8>) -> Result<RawHandle> {
        let handle = self.fresh_handle();
        let address = self.fresh_address(handle);
        let mut state = self.state();
        state.check_context(ctx)?;
        state.accels.insert(handle, SoftAccel { ctx, blob, address });
        Ok(handle)
    }

    /// Makes the next `queue_submit` fail with `err` instead of executing.
    pub fn fail_next_submit(&self, err: DriverError) {
        self.state().fail_next_submit = Some(err);
    }

    /// Makes the next `allocate_staging` fail with `err`.
    pub fn fail_next_staging_alloc(&self, err: DriverError) {
        self.state().fail_next_staging_alloc = Some(err);
    }

    pub fn submit_count(&self) -> u64 {
        self.state().submits
    }

    pub fn staging_alloc_count(&self) -> usize {
        self.state().staging_allocs
    }

    pub fn device_buffer_alloc_count(&self) -> usize {
        self.state().device_buffer_allocs
    }

    /// Buffers currently alive, staging and scratch included.
    pub fn live_buffer_count(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn buffer_bytes(&self, buffer: RawHandle) -> Result<Vec<u8>> {
        let state = self.state();
        Ok(state
            .buffers
            .get(&buffer)
            .ok_or(DriverError::InvalidHandle(buffer))?
            .data
            .clone())
    }

    pub fn image_bytes(&self, image: RawHandle) -> Result<Vec<Vec<u8>>> {
        let state = self.state();
        Ok(state
            .images
            .get(&image)
            .ok_or(DriverError::InvalidHandle(image))?
            .subresources
            .clone())
    }

    pub fn image_layouts(&self, image: RawHandle) -> Result<Vec<ImageLayout>> {
        let state = self.state();
        Ok(state
            .images
            .get(&image)
            .ok_or(DriverError::InvalidHandle(image))?
            .layouts
            .clone())
    }

    pub fn accel_blob(&self, accel: RawHandle) -> Result<Vec<u8>> {
        let state = self.state();
        Ok(state
            .accels
            .get(&accel)
            .ok_or(DriverError::InvalidHandle(accel))?
            .blob
            .clone())
    }
}

impl SoftState {
    fn check_context(&self, ctx: ContextHandle) -> Result<()> {
        if self.contexts.contains(&ctx) {
            Ok(())
        } else {
            Err(DriverError::InvalidHandle(RawHandle(ctx.0)))
        }
    }

    fn buffer(&self, h: RawHandle) -> Result<&SoftBuffer> {
        self.buffers.get(&h).ok_or(DriverError::InvalidHandle(h))
    }

    fn buffer_mut(&mut self, h: RawHandle) -> Result<&mut SoftBuffer> {
        self.buffers.get_mut(&h).ok_or(DriverError::InvalidHandle(h))
    }

    fn image(&self, h: RawHandle) -> Result<&SoftImage> {
        self.images.get(&h).ok_or(DriverError::InvalidHandle(h))
    }

    fn commands_mut(&mut self, h: RawHandle) -> Result<&mut SoftCommands> {
        self.commands.get_mut(&h).ok_or(DriverError::InvalidHandle(h))
    }

    fn record(&mut self, cb: RawHandle, cmd: SoftCmd) -> Result<()> {
        let commands = self.commands_mut(cb)?;
        if commands.phase != CmdPhase::Recording {
            return Err(DriverError::Validation("command buffer is not recording"));
        }
        commands.cmds.push(cmd);
        Ok(())
    }

    fn run(&mut self, ctx: ContextHandle, cmd: &SoftCmd) -> Result<()> {
        match *cmd {
            SoftCmd::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                bytes,
            } => {
                let src_buf = self.buffer(src)?;
                same_context(ctx, src_buf.ctx)?;
                let data = read_span(&src_buf.data, src_offset, bytes)?.to_vec();
                let dst_buf = self.buffer_mut(dst)?;
                same_context(ctx, dst_buf.ctx)?;
                write_span(&mut dst_buf.data, dst_offset, &data)
            }
            SoftCmd::CopyImageToBuffer {
                image,
                range,
                buffer,
                buffer_offset,
            } => {
                let img = self.image(image)?;
                same_context(ctx, img.ctx)?;
                check_range(img, range)?;
                let mut out = Vec::new();
                for sub in range.iter() {
                    let i = (sub.layer * img.levels + sub.level) as usize;
                    if img.layouts[i] != ImageLayout::TransferSrc {
                        return Err(DriverError::Validation(
                            "source subresource is not in transfer-src layout",
                        ));
                    }
                    out.extend_from_slice(&img.subresources[i]);
                }
                let dst = self.buffer_mut(buffer)?;
                same_context(ctx, dst.ctx)?;
                write_span(&mut dst.data, buffer_offset, &out)
            }
            SoftCmd::CopyBufferToImage {
                buffer,
                buffer_offset,
                image,
                range,
            } => {
                let src = self.buffer(buffer)?;
                same_context(ctx, src.ctx)?;
                let data = src.data.clone();
                let img = self
                    .images
                    .get_mut(&image)
                    .ok_or(DriverError::InvalidHandle(image))?;
                same_context(ctx, img.ctx)?;
                check_range(img, range)?;
                let mut offset = buffer_offset;
                for sub in range.iter() {
                    let i = (sub.layer * img.levels + sub.level) as usize;
                    if img.layouts[i] != ImageLayout::TransferDst {
                        return Err(DriverError::Validation(
                            "destination subresource is not in transfer-dst layout",
                        ));
                    }
                    let len = img.subresources[i].len() as u64;
                    let span = read_span(&data, offset, len)?.to_vec();
                    img.subresources[i].copy_from_slice(&span);
                    offset += len;
                }
                Ok(())
            }
            SoftCmd::Transition {
                image,
                range,
                from,
                to,
            } => {
                let img = self
                    .images
                    .get_mut(&image)
                    .ok_or(DriverError::InvalidHandle(image))?;
                same_context(ctx, img.ctx)?;
                check_range(img, range)?;
                for sub in range.iter() {
                    let i = (sub.layer * img.levels + sub.level) as usize;
                    if from != ImageLayout::Undefined && img.layouts[i] != from {
                        return Err(DriverError::Validation("layout mismatch on transition"));
                    }
                    img.layouts[i] = to;
                }
                Ok(())
            }
            SoftCmd::SerializeAccel { accel, scratch } => {
                let acc = self.accels.get(&accel).ok_or(DriverError::InvalidHandle(accel))?;
                same_context(ctx, acc.ctx)?;
                let mut blob = (acc.blob.len() as u64).to_le_bytes().to_vec();
                blob.extend_from_slice(&acc.blob);
                let dst = self.buffer_mut(scratch)?;
                same_context(ctx, dst.ctx)?;
                if (dst.data.len() as u64) < blob.len() as u64 {
                    return Err(DriverError::Validation("serialization scratch too small"));
                }
                dst.data[..blob.len()].copy_from_slice(&blob);
                Ok(())
            }
            SoftCmd::DeserializeAccel { scratch, accel } => {
                let src = self.buffer(scratch)?;
                same_context(ctx, src.ctx)?;
                let header = read_span(&src.data, 0, 8)?;
                let len = u64::from_le_bytes([
                    header[0], header[1], header[2], header[3], header[4], header[5], header[6],
                    header[7],
                ]);
                let blob = read_span(&src.data, 8, len)?.to_vec();
                let acc = self
                    .accels
                    .get_mut(&accel)
                    .ok_or(DriverError::InvalidHandle(accel))?;
                same_context(ctx, acc.ctx)?;
                acc.blob = blob;
                Ok(())
            }
        }
    }
}

fn same_context(expected: ContextHandle, actual: ContextHandle) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(DriverError::Validation("handle belongs to another device"))
    }
}

fn check_range(img: &SoftImage, range: ResolvedRange) -> Result<()> {
    let layers_ok = range.base_layer as u64 + range.layer_count as u64 <= img.layers as u64;
    let levels_ok = range.base_level as u64 + range.level_count as u64 <= img.levels as u64;
    if layers_ok && levels_ok && !range.is_empty() {
        Ok(())
    } else {
        Err(DriverError::Validation("subresource range out of bounds"))
    }
}

fn read_span(data: &[u8], offset: u64, bytes: u64) -> Result<&[u8]> {
    let end = offset
        .checked_add(bytes)
        .filter(|end| *end <= data.len() as u64)
        .ok_or(DriverError::Validation("copy reads out of bounds"))?;
    Ok(&data[offset as usize..end as usize])
}

fn write_span(data: &mut [u8], offset: u64, src: &[u8]) -> Result<()> {
    let end = offset
        .checked_add(src.len() as u64)
        .filter(|end| *end <= data.len() as u64)
        .ok_or(DriverError::Validation("copy writes out of bounds"))?;
    data[offset as usize..end as usize].copy_from_slice(src);
    Ok(())
}

impl DeviceBackend for SoftDevice {
    fn create_command_buffer(&self, ctx: ContextHandle) -> Result<RawHandle> {
        let handle = self.fresh_handle();
        let mut state = self.state();
        state.check_context(ctx)?;
        state.commands.insert(
            handle,
            SoftCommands {
                ctx,
                phase: CmdPhase::Idle,
                cmds: Vec::new(),
            },
        );
        Ok(handle)
    }

    fn destroy_command_buffer(&self, ctx: ContextHandle, cb: RawHandle) -> Result<()> {
        let mut state = self.state();
        let commands = state.commands.remove(&cb).ok_or(DriverError::InvalidHandle(cb))?;
        same_context(ctx, commands.ctx)
    }

    fn begin_commands(&self, cb: RawHandle) -> Result<()> {
        let mut state = self.state();
        let commands = state.commands_mut(cb)?;
        if commands.phase == CmdPhase::Recording {
            return Err(DriverError::Validation("command buffer already recording"));
        }
        commands.cmds.clear();
        commands.phase = CmdPhase::Recording;
        Ok(())
    }

    fn end_commands(&self, cb: RawHandle) -> Result<()> {
        let mut state = self.state();
        let commands = state.commands_mut(cb)?;
        if commands.phase != CmdPhase::Recording {
            return Err(DriverError::Validation("command buffer is not recording"));
        }
        commands.phase = CmdPhase::Ready;
        Ok(())
    }

    fn create_fence(&self, ctx: ContextHandle) -> Result<RawHandle> {
        let handle = self.fresh_handle();
        let mut state = self.state();
        state.check_context(ctx)?;
        state.fences.insert(
            handle,
            SoftFence {
                ctx,
                signaled: false,
            },
        );
        Ok(handle)
    }

    fn destroy_fence(&self, ctx: ContextHandle, fence: RawHandle) -> Result<()> {
        let mut state = self.state();
        let f = state.fences.remove(&fence).ok_or(DriverError::InvalidHandle(fence))?;
        same_context(ctx, f.ctx)
    }

    fn wait_fence(&self, fence: RawHandle) -> Result<()> {
        // Submissions complete synchronously, so a fence that is going to
        // signal already has.
        let state = self.state();
        let f = state.fences.get(&fence).ok_or(DriverError::InvalidHandle(fence))?;
        if f.signaled {
            Ok(())
        } else {
            Err(DriverError::FenceTimeout(fence))
        }
    }

    fn reset_fence(&self, fence: RawHandle) -> Result<()> {
        let mut state = self.state();
        let f = state
            .fences
            .get_mut(&fence)
            .ok_or(DriverError::InvalidHandle(fence))?;
        f.signaled = false;
        Ok(())
    }

    fn allocate_staging(&self, ctx: ContextHandle, bytes: u64) -> Result<StagingAlloc> {
        let buffer = self.fresh_handle();
        let memory = self.fresh_handle();
        let address = self.fresh_address(buffer);
        let mut state = self.state();
        if let Some(err) = state.fail_next_staging_alloc.take() {
            return Err(err);
        }
        state.check_context(ctx)?;
        state.buffers.insert(
            buffer,
            SoftBuffer {
                ctx,
                data: vec![0; bytes as usize],
                address,
            },
        );
        state.memories.insert(memory, buffer);
        state.staging_allocs += 1;
        Ok(StagingAlloc {
            buffer,
            memory,
            bytes,
        })
    }

    fn free_staging(&self, ctx: ContextHandle, alloc: StagingAlloc) -> Result<()> {
        let mut state = self.state();
        state
            .memories
            .remove(&alloc.memory)
            .ok_or(DriverError::InvalidHandle(alloc.memory))?;
        let buf = state
            .buffers
            .remove(&alloc.buffer)
            .ok_or(DriverError::InvalidHandle(alloc.buffer))?;
        same_context(ctx, buf.ctx)
    }

    fn read_staging(&self, memory: RawHandle, len: usize) -> Result<Vec<u8>> {
        let state = self.state();
        let buffer = *state
            .memories
            .get(&memory)
            .ok_or(DriverError::InvalidHandle(memory))?;
        let buf = state.buffer(buffer)?;
        Ok(read_span(&buf.data, 0, len as u64)?.to_vec())
    }

    fn write_staging(&self, memory: RawHandle, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let buffer = *state
            .memories
            .get(&memory)
            .ok_or(DriverError::InvalidHandle(memory))?;
        let buf = state.buffer_mut(buffer)?;
        write_span(&mut buf.data, 0, data)
    }

    fn create_device_buffer(
        &self,
        ctx: ContextHandle,
        bytes: u64,
        _usage: BufferUsage,
    ) -> Result<RawHandle> {
        let handle = self.fresh_handle();
        let address = self.fresh_address(handle);
        let mut state = self.state();
        state.check_context(ctx)?;
        state.buffers.insert(
            handle,
            SoftBuffer {
                ctx,
                data: vec![0; bytes as usize],
                address,
            },
        );
        state.device_buffer_allocs += 1;
        Ok(handle)
    }

    fn destroy_device_buffer(&self, ctx: ContextHandle, buffer: RawHandle) -> Result<()> {
        let mut state = self.state();
        let buf = state
            .buffers
            .remove(&buffer)
            .ok_or(DriverError::InvalidHandle(buffer))?;
        same_context(ctx, buf.ctx)
    }

    fn cmd_copy_buffer(
        &self,
        cb: RawHandle,
        src: RawHandle,
        src_offset: u64,
        dst: RawHandle,
        dst_offset: u64,
        bytes: u64,
    ) -> Result<()> {
        self.state().record(
            cb,
            SoftCmd::CopyBuffer {
                src,
                src_offset,
                dst,
                dst_offset,
                bytes,
            },
        )
    }

    fn cmd_copy_image_to_buffer(
        &self,
        cb: RawHandle,
        image: RawHandle,
        range: ResolvedRange,
        buffer: RawHandle,
        buffer_offset: u64,
    ) -> Result<()> {
        self.state().record(
            cb,
            SoftCmd::CopyImageToBuffer {
                image,
                range,
                buffer,
                buffer_offset,
            },
        )
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cb: RawHandle,
        buffer: RawHandle,
        buffer_offset: u64,
        image: RawHandle,
        range: ResolvedRange,
    ) -> Result<()> {
        self.state().record(
            cb,
            SoftCmd::CopyBufferToImage {
                buffer,
                buffer_offset,
                image,
                range,
            },
        )
    }

    fn cmd_transition_image(
        &self,
        cb: RawHandle,
        image: RawHandle,
        range: ResolvedRange,
        from: ImageLayout,
        to: ImageLayout,
    ) -> Result<()> {
        self.state().record(
            cb,
            SoftCmd::Transition {
                image,
                range,
                from,
                to,
            },
        )
    }

    fn cmd_serialize_accel(
        &self,
        cb: RawHandle,
        accel: RawHandle,
        scratch: RawHandle,
    ) -> Result<()> {
        self.state().record(cb, SoftCmd::SerializeAccel { accel, scratch })
    }

    fn cmd_deserialize_accel(
        &self,
        cb: RawHandle,
        scratch: RawHandle,
        accel: RawHandle,
    ) -> Result<()> {
        self.state().record(cb, SoftCmd::DeserializeAccel { scratch, accel })
    }

    fn queue_submit(&self, ctx: ContextHandle, cb: RawHandle, fence: RawHandle) -> Result<()> {
        let mut state = self.state();
        if let Some(err) = state.fail_next_submit.take() {
            return Err(err);
        }
        state.check_context(ctx)?;
        let (cmd_ctx, phase, cmds) = {
            let commands = state.commands.get(&cb).ok_or(DriverError::InvalidHandle(cb))?;
            (commands.ctx, commands.phase, commands.cmds.clone())
        };
        same_context(ctx, cmd_ctx)?;
        if phase != CmdPhase::Ready {
            return Err(DriverError::Validation("command buffer is not executable"));
        }
        for cmd in &cmds {
            state.run(ctx, cmd)?;
        }
        let f = state
            .fences
            .get_mut(&fence)
            .ok_or(DriverError::InvalidHandle(fence))?;
        same_context(ctx, f.ctx)?;
        f.signaled = true;
        state.submits += 1;
        Ok(())
    }

    fn wait_idle(&self, ctx: ContextHandle) -> Result<()> {
        // Work never outlives queue_submit here, so idling is a validity
        // check on the context alone.
        self.state().check_context(ctx)
    }

    fn accel_serialized_size(&self, accel: RawHandle) -> Result<u64> {
        let state = self.state();
        let acc = state.accels.get(&accel).ok_or(DriverError::InvalidHandle(accel))?;
        Ok(8 + acc.blob.len() as u64)
    }

    fn buffer_device_address(&self, buffer: RawHandle) -> Result<u64> {
        let state = self.state();
        Ok(state.buffer(buffer)?.address)
    }

    fn accel_device_address(&self, accel: RawHandle) -> Result<u64> {
        let state = self.state();
        let acc = state.accels.get(&accel).ok_or(DriverError::InvalidHandle(accel))?;
        Ok(acc.address)
    }
}
