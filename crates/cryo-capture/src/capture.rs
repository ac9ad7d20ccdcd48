use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use cryo_copy::{ByteSink, CopyEngine, DownloadRequest, DownloadTarget, EngineOptions};
use cryo_device::DeviceBackend;
use cryo_track::StateTable;
use cryo_types::{
    BufferUsage, ContextHandle, ObjectKind, RawHandle, ResolvedRange, TrackedObject,
};
use tracing::{debug, info};

use crate::codec::ObjectCodec;
use crate::error::{CaptureError, ErrorLatch, Result};
use crate::format::{metadata_path, payload_path, ADDRESSES_FILE, MANIFEST_FILE};
use crate::graph::{enumerate, Enumeration, ObjectGraph};
use crate::manifest::{write_addresses, write_manifest};
use crate::record::RestoreObjectRecord;

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureOptions {
    pub engine: EngineOptions,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    /// Objects in the manifest, diagnostics excluded.
    pub objects: usize,
    pub diagnostics_skipped: usize,
    /// Bulk payload files written (or attempted).
    pub payloads: usize,
    pub payload_bytes: u64,
    /// Device addresses recorded in `addresses.bin`.
    pub addresses: usize,
}

/// Writes a restore point for a live object graph.
///
/// The pass walks the graph, serializes every object's creation metadata
/// through the embedder's [`ObjectCodec`], writes the manifest, then pulls
/// bulk contents (buffers, images, acceleration structures) through a
/// [`CopyEngine`]. It is best-effort end to end: the first failure becomes
/// the pass result, everything after it is still attempted, and whatever
/// was written stays on disk.
pub struct CapturePass<'a, B: DeviceBackend + 'static, C: ObjectCodec> {
    backend: Arc<B>,
    table: &'a StateTable,
    codec: &'a C,
    options: CaptureOptions,
}

impl<'a, B: DeviceBackend + 'static, C: ObjectCodec> CapturePass<'a, B, C> {
    pub fn new(
        backend: Arc<B>,
        table: &'a StateTable,
        codec: &'a C,
        options: CaptureOptions,
    ) -> Self {
        Self {
            backend,
            table,
            codec,
            options,
        }
    }

    pub fn run<G: ObjectGraph + ?Sized>(
        &self,
        graph: &G,
        roots: &[TrackedObject],
        out_dir: &Path,
    ) -> Result<CaptureStats> {
        let walk = enumerate(graph, roots);
        info!(
            objects = walk.objects.len(),
            skipped = walk.diagnostics.len(),
            "capturing restore point"
        );
        let result = self.run_walk(&walk, out_dir);
        // The walk duplicated a reference to everything it visited; hand
        // every one back, capture outcome notwithstanding. The application's
        // own references stay where they are.
        walk.release_all(graph);
        result
    }

    fn run_walk(&self, walk: &Enumeration, out_dir: &Path) -> Result<CaptureStats> {
        // Everything up to here must succeed outright; past this point the
        // pass degrades to best-effort with a first-error latch.
        fs::create_dir_all(out_dir)?;
        let kinds: HashSet<ObjectKind> = walk.objects.iter().map(|e| e.object.kind).collect();
        for kind in &kinds {
            fs::create_dir_all(out_dir.join(kind.type_dir()))?;
        }
        let engine = CopyEngine::new(Arc::clone(&self.backend), self.options.engine)?;

        let latch = Arc::new(ErrorLatch::default());
        let mut stats = CaptureStats {
            objects: walk.objects.len(),
            diagnostics_skipped: walk.diagnostics.len(),
            ..CaptureStats::default()
        };

        // Creation metadata and the manifest first, so a restore can start
        // walking even when a later payload fails.
        let mut records = Vec::with_capacity(walk.objects.len());
        for entry in &walk.objects {
            records.push(RestoreObjectRecord {
                kind: entry.object.kind,
                handle: entry.object.handle,
                owner: entry.object.owner,
                deps: entry.deps.clone(),
            });
            latch.latch(self.write_metadata(&entry.object, out_dir));
        }
        latch.latch(self.write_manifest_file(out_dir, &records));

        // Bulk payloads ride the engine; failures arrive through the
        // completion callbacks.
        let addresses: Arc<Mutex<Vec<(RawHandle, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let mut accels: Vec<TrackedObject> = Vec::new();
        for entry in &walk.objects {
            let object = entry.object;
            match object.kind {
                ObjectKind::Buffer => {
                    if let Some(bytes) =
                        latch.latch(self.post_buffer(&engine, object, out_dir, &latch, &addresses))
                    {
                        stats.payloads += 1;
                        stats.payload_bytes += bytes;
                    }
                }
                ObjectKind::Image => {
                    if let Some(bytes) = latch
                        .latch(self.post_image(&engine, object, out_dir, &latch))
                        .flatten()
                    {
                        stats.payloads += 1;
                        stats.payload_bytes += bytes;
                    }
                }
                ObjectKind::AccelerationStructure => accels.push(object),
                _ => {}
            }
        }

        let (accel_count, accel_bytes) =
            self.capture_accels(&engine, &accels, out_dir, &latch, &addresses);
        stats.payloads += accel_count;
        stats.payload_bytes += accel_bytes;

        latch.latch(engine.wait().map_err(CaptureError::from));

        // All callbacks have run; the address table is complete. Sorting
        // keeps the file stable across captures of the same graph.
        let mut recorded = lock(&addresses).clone();
        recorded.sort_by_key(|&(handle, _)| handle);
        stats.addresses = recorded.len();
        latch.latch(self.write_addresses_file(out_dir, &recorded));

        latch.finish()?;
        info!(
            payloads = stats.payloads,
            bytes = stats.payload_bytes,
            "restore point sealed"
        );
        Ok(stats)
    }

    fn write_metadata(&self, object: &TrackedObject, out_dir: &Path) -> Result<()> {
        let path = metadata_path(out_dir, object.kind, object.handle);
        let mut file = BufWriter::new(File::create(path)?);
        self.codec.encode(object, self.table, &mut file)?;
        file.flush()?;
        Ok(())
    }

    fn write_manifest_file(&self, out_dir: &Path, records: &[RestoreObjectRecord]) -> Result<()> {
        let file = File::create(out_dir.join(MANIFEST_FILE))?;
        write_manifest(BufWriter::new(file), records)
    }

    fn write_addresses_file(&self, out_dir: &Path, addresses: &[(RawHandle, u64)]) -> Result<()> {
        let file = File::create(out_dir.join(ADDRESSES_FILE))?;
        write_addresses(BufWriter::new(file), addresses)
    }

    fn post_buffer(
        &self,
        engine: &CopyEngine<B>,
        object: TrackedObject,
        out_dir: &Path,
        latch: &Arc<ErrorLatch>,
        addresses: &Arc<Mutex<Vec<(RawHandle, u64)>>>,
    ) -> Result<u64> {
        let desc = self.table.buffer_desc(object.handle)?;
        let wants_address = desc.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS);
        let handle = object.handle;
        let backend = Arc::clone(&self.backend);
        let latch = Arc::clone(latch);
        let addresses = Arc::clone(addresses);
        engine.download(DownloadRequest {
            context: object.owner,
            target: DownloadTarget::Buffer {
                buffer: handle,
                offset: 0,
                bytes: desc.bytes,
            },
            sink: ByteSink::File(payload_path(out_dir, object.kind, handle)),
            on_done: Box::new(move |res| match res {
                Ok(_) if wants_address => match backend.buffer_device_address(handle) {
                    Ok(address) => lock(&addresses).push((handle, address)),
                    Err(err) => latch.record(err.into()),
                },
                Ok(_) => {}
                Err(err) => latch.record(err.into()),
            }),
        });
        Ok(desc.bytes)
    }

    /// Posts the image's download, or returns `Ok(None)` when every
    /// subresource sits in an undefined-content layout: there is nothing
    /// meaningful to read, and the restore side re-creates the image in
    /// exactly that state.
    fn post_image(
        &self,
        engine: &CopyEngine<B>,
        object: TrackedObject,
        out_dir: &Path,
        latch: &Arc<ErrorLatch>,
    ) -> Result<Option<u64>> {
        let desc = self.table.image_desc(object.handle)?;
        // The authoritative grid tells the engine what layout each cell is
        // in now and must be put back into afterwards.
        let layouts = self.table.image_grid(object.handle)?.cells().to_vec();
        if layouts.iter().all(|l| l.is_undefined()) {
            debug!(image = %object.handle, "contents undefined, no payload");
            return Ok(None);
        }
        let range = ResolvedRange {
            base_layer: 0,
            layer_count: desc.layers,
            base_level: 0,
            level_count: desc.levels,
        };
        let latch = Arc::clone(latch);
        engine.download(DownloadRequest {
            context: object.owner,
            target: DownloadTarget::Image {
                image: object.handle,
                range,
                layouts,
                bytes: desc.bytes,
            },
            sink: ByteSink::File(payload_path(out_dir, object.kind, object.handle)),
            on_done: Box::new(move |res| {
                if let Err(err) = res {
                    latch.record(err.into());
                }
            }),
        });
        Ok(Some(desc.bytes))
    }

    /// Serializes acceleration structures one context at a time, through a
    /// single scratch buffer sized for the context's largest blob. Each
    /// serialization finishes before the next reuses the scratch.
    fn capture_accels(
        &self,
        engine: &CopyEngine<B>,
        accels: &[TrackedObject],
        out_dir: &Path,
        latch: &Arc<ErrorLatch>,
        addresses: &Arc<Mutex<Vec<(RawHandle, u64)>>>,
    ) -> (usize, u64) {
        if accels.is_empty() {
            return (0, 0);
        }
        let mut by_ctx: BTreeMap<ContextHandle, Vec<(TrackedObject, u64)>> = BTreeMap::new();
        for object in accels {
            match self.backend.accel_serialized_size(object.handle) {
                Ok(size) => by_ctx.entry(object.owner).or_default().push((*object, size)),
                Err(err) => latch.record(err.into()),
            }
        }

        let mut count = 0usize;
        let mut total = 0u64;
        for (ctx, group) in by_ctx {
            match self.capture_accel_group(engine, ctx, &group, out_dir, latch, addresses) {
                Ok((group_count, group_bytes)) => {
                    count += group_count;
                    total += group_bytes;
                }
                Err(err) => latch.record(err),
            }
        }
        (count, total)
    }

    fn capture_accel_group(
        &self,
        engine: &CopyEngine<B>,
        ctx: ContextHandle,
        group: &[(TrackedObject, u64)],
        out_dir: &Path,
        latch: &Arc<ErrorLatch>,
        addresses: &Arc<Mutex<Vec<(RawHandle, u64)>>>,
    ) -> Result<(usize, u64)> {
        let largest = group.iter().map(|&(_, size)| size).max().unwrap_or(0);
        let scratch = self.backend.create_device_buffer(
            ctx,
            largest,
            BufferUsage::ACCEL_STRUCTURE_STORAGE | BufferUsage::TRANSFER_SRC,
        )?;
        let result = self.serialize_group(engine, ctx, scratch, group, out_dir, latch, addresses);
        let destroyed = self.backend.destroy_device_buffer(ctx, scratch);
        let counts = result?;
        destroyed?;
        Ok(counts)
    }

    #[allow(clippy::too_many_arguments)]
    fn serialize_group(
        &self,
        engine: &CopyEngine<B>,
        ctx: ContextHandle,
        scratch: RawHandle,
        group: &[(TrackedObject, u64)],
        out_dir: &Path,
        latch: &Arc<ErrorLatch>,
        addresses: &Arc<Mutex<Vec<(RawHandle, u64)>>>,
    ) -> Result<(usize, u64)> {
        let mut count = 0usize;
        let mut total = 0u64;
        for &(object, size) in group {
            let handle = object.handle;
            let backend = Arc::clone(&self.backend);
            let latch_cb = Arc::clone(latch);
            let addresses = Arc::clone(addresses);
            engine.download(DownloadRequest {
                context: ctx,
                target: DownloadTarget::Accel {
                    accel: handle,
                    scratch,
                    bytes: size,
                },
                sink: ByteSink::File(payload_path(out_dir, object.kind, handle)),
                on_done: Box::new(move |res| match res {
                    Ok(_) => match backend.accel_device_address(handle) {
                        Ok(address) => lock(&addresses).push((handle, address)),
                        Err(err) => latch_cb.record(err.into()),
                    },
                    Err(err) => latch_cb.record(err.into()),
                }),
            });
            // The scratch is shared, so this blob must land before the
            // next serialization starts.
            engine.wait()?;
            count += 1;
            total += size;
        }
        Ok((count, total))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
