use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use cryo_copy::{ByteSource, CopyEngine, EngineOptions, UploadRequest, UploadTarget};
use cryo_device::DeviceBackend;
use cryo_types::{BufferUsage, ContextHandle, ObjectKind, RawHandle};
use tracing::info;

use crate::codec::{HandleMap, ObjectCodec};
use crate::error::{CaptureError, ErrorLatch, Result};
use crate::format::{metadata_path, payload_path, ADDRESSES_FILE, MANIFEST_FILE};
use crate::manifest::{read_addresses, read_manifest};
use crate::record::RestoreObjectRecord;

#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreOptions {
    pub engine: EngineOptions,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreStats {
    pub objects: usize,
    pub payloads: usize,
    pub payload_bytes: u64,
}

/// Rebuilds the captured object graph from a restore point directory.
///
/// The manifest stores objects in dependency order, so one forward walk
/// suffices: each record is decoded through the embedder's [`ObjectCodec`],
/// which sees the already restored handles of everything it references plus
/// the device address the object had at capture. Bulk contents are then
/// uploaded through a [`CopyEngine`].
///
/// A structural failure (unreadable manifest, failed decode) stops the walk;
/// upload failures are collected and the first one becomes the result.
pub struct RestorePass<B: DeviceBackend + 'static> {
    backend: Arc<B>,
    /// Captured owner context to the context objects are restored into.
    contexts: HashMap<ContextHandle, ContextHandle>,
    options: RestoreOptions,
}

impl<B: DeviceBackend + 'static> RestorePass<B> {
    pub fn new(
        backend: Arc<B>,
        contexts: HashMap<ContextHandle, ContextHandle>,
        options: RestoreOptions,
    ) -> Self {
        Self {
            backend,
            contexts,
            options,
        }
    }

    pub fn run<C: ObjectCodec>(
        &self,
        codec: &mut C,
        dir: &Path,
    ) -> Result<(RestoreStats, HandleMap)> {
        let manifest = File::open(dir.join(MANIFEST_FILE))?;
        let records = read_manifest(BufReader::new(manifest))?;
        let addresses: HashMap<RawHandle, u64> = {
            let table = File::open(dir.join(ADDRESSES_FILE))?;
            read_addresses(BufReader::new(table))?.into_iter().collect()
        };
        info!(
            objects = records.len(),
            addresses = addresses.len(),
            "restoring restore point"
        );

        let engine = CopyEngine::new(Arc::clone(&self.backend), self.options.engine)?;
        let latch = Arc::new(ErrorLatch::default());

        // Acceleration structure uploads share one scratch per target
        // context, sized for the largest blob in that context.
        let mut scratch_sizes: HashMap<ContextHandle, u64> = HashMap::new();
        for record in &records {
            if record.kind == ObjectKind::AccelerationStructure {
                let ctx = self.context_for(record.owner)?;
                let len = fs::metadata(payload_path(dir, record.kind, record.handle))?.len();
                let largest = scratch_sizes.entry(ctx).or_insert(0);
                *largest = (*largest).max(len);
            }
        }

        let mut remap = HandleMap::new();
        let mut scratches: HashMap<ContextHandle, RawHandle> = HashMap::new();
        let mut stats = RestoreStats {
            objects: records.len(),
            ..RestoreStats::default()
        };

        let walked = self.walk_records(
            codec,
            dir,
            &records,
            &addresses,
            &engine,
            &latch,
            &scratch_sizes,
            &mut scratches,
            &mut remap,
            &mut stats,
        );

        // Uploads must land before the scratches they use go away.
        latch.latch(engine.wait().map_err(CaptureError::from));
        for (ctx, scratch) in scratches {
            latch.latch(
                self.backend
                    .destroy_device_buffer(ctx, scratch)
                    .map_err(CaptureError::from),
            );
        }
        if let Err(err) = walked {
            latch.record(err);
        }
        latch.finish()?;
        info!(
            payloads = stats.payloads,
            bytes = stats.payload_bytes,
            "restore point applied"
        );
        Ok((stats, remap))
    }

    #[allow(clippy::too_many_arguments)]
    fn walk_records<C: ObjectCodec>(
        &self,
        codec: &mut C,
        dir: &Path,
        records: &[RestoreObjectRecord],
        addresses: &HashMap<RawHandle, u64>,
        engine: &CopyEngine<B>,
        latch: &Arc<ErrorLatch>,
        scratch_sizes: &HashMap<ContextHandle, u64>,
        scratches: &mut HashMap<ContextHandle, RawHandle>,
        remap: &mut HandleMap,
        stats: &mut RestoreStats,
    ) -> Result<()> {
        for record in records {
            let ctx = self.context_for(record.owner)?;
            let meta = File::open(metadata_path(dir, record.kind, record.handle))?;
            let mut reader = BufReader::new(meta);
            let address = addresses.get(&record.handle).copied();
            let restored = codec.decode(record, ctx, address, remap, &mut reader)?;
            remap.insert(record.handle, restored.handle);

            match record.kind {
                ObjectKind::Buffer => {
                    let path = payload_path(dir, record.kind, record.handle);
                    let bytes = fs::metadata(&path)?.len();
                    let latch = Arc::clone(latch);
                    engine.upload(UploadRequest {
                        context: ctx,
                        target: UploadTarget::Buffer {
                            buffer: restored.handle,
                            offset: 0,
                        },
                        source: ByteSource::File(path),
                        on_done: Box::new(move |res| {
                            if let Err(err) = res {
                                latch.record(err.into());
                            }
                        }),
                    });
                    stats.payloads += 1;
                    stats.payload_bytes += bytes;
                }
                ObjectKind::Image => {
                    let (range, final_layouts) = restored
                        .image
                        .ok_or(CaptureError::Corrupt("image record without layout metadata"))?;
                    // Fully undefined contents were never downloaded; the
                    // freshly created image is already in that state.
                    if final_layouts.iter().all(|l| l.is_undefined()) {
                        continue;
                    }
                    let path = payload_path(dir, record.kind, record.handle);
                    let bytes = fs::metadata(&path)?.len();
                    let latch = Arc::clone(latch);
                    engine.upload(UploadRequest {
                        context: ctx,
                        target: UploadTarget::Image {
                            image: restored.handle,
                            range,
                            final_layouts,
                        },
                        source: ByteSource::File(path),
                        on_done: Box::new(move |res| {
                            if let Err(err) = res {
                                latch.record(err.into());
                            }
                        }),
                    });
                    stats.payloads += 1;
                    stats.payload_bytes += bytes;
                }
                ObjectKind::AccelerationStructure => {
                    let path = payload_path(dir, record.kind, record.handle);
                    let bytes = fs::metadata(&path)?.len();
                    let scratch = match scratches.entry(ctx) {
                        Entry::Occupied(slot) => *slot.get(),
                        Entry::Vacant(slot) => {
                            let size = scratch_sizes.get(&ctx).copied().unwrap_or(bytes);
                            *slot.insert(self.backend.create_device_buffer(
                                ctx,
                                size,
                                BufferUsage::ACCEL_STRUCTURE_STORAGE | BufferUsage::TRANSFER_DST,
                            )?)
                        }
                    };
                    let latch_cb = Arc::clone(latch);
                    engine.upload(UploadRequest {
                        context: ctx,
                        target: UploadTarget::Accel {
                            accel: restored.handle,
                            scratch,
                        },
                        source: ByteSource::File(path),
                        on_done: Box::new(move |res| {
                            if let Err(err) = res {
                                latch_cb.record(err.into());
                            }
                        }),
                    });
                    // Deserializations through a shared scratch cannot
                    // overlap.
                    engine.wait()?;
                    stats.payloads += 1;
                    stats.payload_bytes += bytes;
                }
                _ => {}
            }
        }
        engine.wait()?;
        Ok(())
    }

    fn context_for(&self, owner: ContextHandle) -> Result<ContextHandle> {
        self.contexts
            .get(&owner)
            .copied()
            .ok_or(CaptureError::MissingContext(owner))
    }
}
