use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::sync::{Arc, Mutex};

use cryo_capture::{
    metadata_path, payload_path, read_addresses, read_manifest, CaptureError, CaptureOptions,
    CapturePass, HandleMap, ObjectCodec, ObjectGraph, RestoreObjectRecord, RestoreOptions,
    RestorePass, RestoredObject,
};
use cryo_copy::{CopyError, EngineOptions};
use cryo_device::{DeviceBackend, DriverError, SoftDevice};
use cryo_track::{BufferDesc, ImageDesc, StateTable};
use cryo_types::{
    BufferUsage, ContextHandle, ImageLayout, ObjectKind, RawHandle, ResolvedRange, Subresource,
    TrackedObject,
};

struct TestGraph {
    edges: HashMap<RawHandle, Vec<TrackedObject>>,
    released: Mutex<Vec<RawHandle>>,
}

impl TestGraph {
    fn new(edges: HashMap<RawHandle, Vec<TrackedObject>>) -> Self {
        Self {
            edges,
            released: Mutex::new(Vec::new()),
        }
    }
}

impl ObjectGraph for TestGraph {
    fn visit_dependencies(&self, object: &TrackedObject, visit: &mut dyn FnMut(TrackedObject)) {
        if let Some(deps) = self.edges.get(&object.handle) {
            for dep in deps {
                visit(*dep);
            }
        }
    }

    fn release(&self, object: &TrackedObject) {
        self.released.lock().unwrap().push(object.handle);
    }
}

/// Minimal codec: buffers store their size and usage, images their shape
/// and per-cell layouts, everything else nothing. Device addresses handed
/// to `decode` are kept so tests can check what arrived.
struct TestCodec {
    dev: Arc<SoftDevice>,
    seen_addresses: HashMap<RawHandle, u64>,
}

impl TestCodec {
    fn new(dev: &Arc<SoftDevice>) -> Self {
        Self {
            dev: Arc::clone(dev),
            seen_addresses: HashMap::new(),
        }
    }
}

fn io_err(err: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut dyn Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

impl ObjectCodec for TestCodec {
    fn encode(
        &self,
        object: &TrackedObject,
        table: &StateTable,
        w: &mut dyn Write,
    ) -> io::Result<()> {
        match object.kind {
            ObjectKind::Buffer => {
                let desc = table.buffer_desc(object.handle).map_err(io_err)?;
                w.write_all(&desc.bytes.to_le_bytes())?;
                w.write_all(&desc.usage.bits().to_le_bytes())?;
            }
            ObjectKind::Image => {
                let desc = table.image_desc(object.handle).map_err(io_err)?;
                let grid = table.image_grid(object.handle).map_err(io_err)?;
                w.write_all(&desc.layers.to_le_bytes())?;
                w.write_all(&desc.levels.to_le_bytes())?;
                w.write_all(&desc.bytes.to_le_bytes())?;
                for layout in grid.cells() {
                    w.write_all(&[layout.as_u8()])?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn decode(
        &mut self,
        record: &RestoreObjectRecord,
        ctx: ContextHandle,
        address: Option<u64>,
        _remap: &HandleMap,
        r: &mut dyn Read,
    ) -> io::Result<RestoredObject> {
        if let Some(address) = address {
            self.seen_addresses.insert(record.handle, address);
        }
        match record.kind {
            ObjectKind::Device => Ok(RestoredObject::opaque(RawHandle(ctx.0))),
            ObjectKind::Buffer => {
                let bytes = read_u64(r)?;
                let _usage = read_u32(r)?;
                let handle = self
                    .dev
                    .seed_buffer(ctx, vec![0; bytes as usize])
                    .map_err(io_err)?;
                Ok(RestoredObject::opaque(handle))
            }
            ObjectKind::Image => {
                let layers = read_u32(r)?;
                let levels = read_u32(r)?;
                let total = read_u64(r)?;
                let cells = (layers * levels) as usize;
                let cell_bytes = (total / cells as u64) as usize;
                let mut layouts = Vec::with_capacity(cells);
                for _ in 0..cells {
                    let mut b = [0u8; 1];
                    r.read_exact(&mut b)?;
                    layouts.push(
                        ImageLayout::from_u8(b[0])
                            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "bad layout"))?,
                    );
                }
                let handle = self
                    .dev
                    .seed_image(
                        ctx,
                        layers,
                        levels,
                        vec![vec![0; cell_bytes]; cells],
                        ImageLayout::Undefined,
                    )
                    .map_err(io_err)?;
                let range = ResolvedRange {
                    base_layer: 0,
                    layer_count: layers,
                    base_level: 0,
                    level_count: levels,
                };
                Ok(RestoredObject {
                    handle,
                    image: Some((range, layouts)),
                })
            }
            ObjectKind::AccelerationStructure => {
                let handle = self.dev.seed_accel(ctx, Vec::new()).map_err(io_err)?;
                Ok(RestoredObject::opaque(handle))
            }
            _ => Ok(RestoredObject::opaque(record.handle)),
        }
    }
}

fn transition_cell(
    dev: &SoftDevice,
    ctx: ContextHandle,
    image: RawHandle,
    layer: u32,
    level: u32,
    from: ImageLayout,
    to: ImageLayout,
) {
    let cb = dev.create_command_buffer(ctx).unwrap();
    let fence = dev.create_fence(ctx).unwrap();
    dev.begin_commands(cb).unwrap();
    dev.cmd_transition_image(
        cb,
        image,
        ResolvedRange {
            base_layer: layer,
            layer_count: 1,
            base_level: level,
            level_count: 1,
        },
        from,
        to,
    )
    .unwrap();
    dev.end_commands(cb).unwrap();
    dev.queue_submit(ctx, cb, fence).unwrap();
    dev.wait_fence(fence).unwrap();
    dev.destroy_fence(ctx, fence).unwrap();
    dev.destroy_command_buffer(ctx, cb).unwrap();
}

#[test]
fn capture_then_restore_round_trips() {
    let dev = Arc::new(SoftDevice::new());
    let src_ctx = dev.create_context();

    let plain = dev.seed_buffer(src_ctx, (0u8..64).collect()).unwrap();
    let addressed = dev.seed_buffer(src_ctx, vec![0x5a; 32]).unwrap();
    let cells = vec![vec![10u8; 8], vec![11u8; 8], vec![12u8; 8], vec![13u8; 8]];
    let image = dev
        .seed_image(src_ctx, 2, 2, cells.clone(), ImageLayout::ShaderReadOnly)
        .unwrap();
    let accel_a = dev.seed_accel(src_ctx, vec![0xa1; 100]).unwrap();
    let accel_b = dev.seed_accel(src_ctx, vec![0xb2; 40]).unwrap();
    // One subresource sits in a different layout than the rest.
    transition_cell(
        &dev,
        src_ctx,
        image,
        0,
        1,
        ImageLayout::ShaderReadOnly,
        ImageLayout::ColorAttachment,
    );

    let device_obj = TrackedObject::new(ObjectKind::Device, RawHandle(src_ctx.0), src_ctx);
    let queue_obj = TrackedObject::new(ObjectKind::Queue, RawHandle(0x9000), src_ctx);
    let messenger_obj =
        TrackedObject::new(ObjectKind::DebugMessenger, RawHandle(0x9001), src_ctx);
    let plain_obj = TrackedObject::new(ObjectKind::Buffer, plain, src_ctx);
    let addressed_obj = TrackedObject::new(ObjectKind::Buffer, addressed, src_ctx);
    let image_obj = TrackedObject::new(ObjectKind::Image, image, src_ctx);
    let accel_a_obj =
        TrackedObject::new(ObjectKind::AccelerationStructure, accel_a, src_ctx);
    let accel_b_obj =
        TrackedObject::new(ObjectKind::AccelerationStructure, accel_b, src_ctx);

    let mut table = StateTable::new();
    table.register_opaque(device_obj).unwrap();
    table.register_opaque(queue_obj).unwrap();
    table.register_opaque(messenger_obj).unwrap();
    table
        .register_buffer(
            plain_obj,
            BufferDesc {
                bytes: 64,
                usage: BufferUsage::STORAGE,
            },
        )
        .unwrap();
    table
        .register_buffer(
            addressed_obj,
            BufferDesc {
                bytes: 32,
                usage: BufferUsage::STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
            },
        )
        .unwrap();
    table
        .register_image(
            image_obj,
            ImageDesc {
                layers: 2,
                levels: 2,
                bytes: 32,
                initial_layout: ImageLayout::ShaderReadOnly,
            },
        )
        .unwrap();
    table
        .image_grid_mut(image)
        .unwrap()
        .set(
            Subresource { layer: 0, level: 1 },
            ImageLayout::ColorAttachment,
        )
        .unwrap();
    table.register_opaque(accel_a_obj).unwrap();
    table.register_opaque(accel_b_obj).unwrap();

    let graph = TestGraph::new(HashMap::from([(
        device_obj.handle,
        vec![
            queue_obj,
            plain_obj,
            addressed_obj,
            image_obj,
            accel_a_obj,
            accel_b_obj,
            messenger_obj,
        ],
    )]));

    let codec = TestCodec::new(&dev);
    let pass = CapturePass::new(
        Arc::clone(&dev),
        &table,
        &codec,
        CaptureOptions::default(),
    );
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("point");
    let stats = pass.run(&graph, &[device_obj], &out).unwrap();

    assert_eq!(stats.objects, 7);
    assert_eq!(stats.diagnostics_skipped, 1);
    assert_eq!(stats.payloads, 5);
    // Accel payloads carry an 8-byte size header in front of the blob.
    assert_eq!(stats.payload_bytes, 64 + 32 + 32 + 108 + 48);
    assert_eq!(stats.addresses, 3);
    // Both accel blobs went through a single scratch allocation.
    assert_eq!(dev.device_buffer_alloc_count(), 1);
    // Engine and scratch resources were all returned.
    assert_eq!(dev.live_buffer_count(), 2);
    // The pass dropped its walk references, the filtered messenger's too.
    {
        let released = graph.released.lock().unwrap();
        assert_eq!(released.len(), 8);
        assert!(released.contains(&messenger_obj.handle));
    }

    assert!(out.join("manifest.bin").is_file());
    assert!(out.join("addresses.bin").is_file());
    assert!(metadata_path(&out, ObjectKind::Queue, queue_obj.handle).is_file());
    assert!(!payload_path(&out, ObjectKind::Queue, queue_obj.handle).exists());
    assert!(!out.join("DebugMessenger").exists());
    assert_eq!(
        fs::read(payload_path(&out, ObjectKind::Buffer, plain)).unwrap(),
        (0u8..64).collect::<Vec<u8>>()
    );
    let accel_file = fs::read(payload_path(
        &out,
        ObjectKind::AccelerationStructure,
        accel_a,
    ))
    .unwrap();
    assert_eq!(accel_file.len(), 108);
    assert_eq!(&accel_file[8..], vec![0xa1; 100].as_slice());

    // Downloads put every subresource back into its recorded layout.
    let mut expected_layouts = vec![ImageLayout::ShaderReadOnly; 4];
    expected_layouts[1] = ImageLayout::ColorAttachment;
    assert_eq!(dev.image_layouts(image).unwrap(), expected_layouts);

    let records =
        read_manifest(BufReader::new(File::open(out.join("manifest.bin")).unwrap())).unwrap();
    assert_eq!(records.len(), 7);
    assert_eq!(records[0].kind, ObjectKind::Device);
    assert_eq!(records[0].deps.len(), 6);
    assert!(records.iter().all(|r| r.kind != ObjectKind::DebugMessenger));

    let addrs =
        read_addresses(BufReader::new(File::open(out.join("addresses.bin")).unwrap())).unwrap();
    assert_eq!(addrs.len(), 3);
    assert!(addrs.iter().any(|&(h, _)| h == addressed));
    assert!(addrs.windows(2).all(|w| w[0].0 <= w[1].0));

    // Restore into a fresh context and compare object by object.
    let dst_ctx = dev.create_context();
    let mut codec2 = TestCodec::new(&dev);
    let restore = RestorePass::new(
        Arc::clone(&dev),
        HashMap::from([(src_ctx, dst_ctx)]),
        RestoreOptions::default(),
    );
    let (rstats, remap) = restore.run(&mut codec2, &out).unwrap();
    assert_eq!(rstats.objects, 7);
    assert_eq!(rstats.payloads, 5);
    assert_eq!(rstats.payload_bytes, 64 + 32 + 32 + 108 + 48);
    // One more scratch for the restore side, nothing leaked.
    assert_eq!(dev.device_buffer_alloc_count(), 2);
    assert_eq!(dev.live_buffer_count(), 4);

    assert_eq!(
        dev.buffer_bytes(remap[&plain]).unwrap(),
        (0u8..64).collect::<Vec<u8>>()
    );
    assert_eq!(dev.buffer_bytes(remap[&addressed]).unwrap(), vec![0x5a; 32]);
    assert_eq!(dev.image_bytes(remap[&image]).unwrap(), cells);
    assert_eq!(dev.image_layouts(remap[&image]).unwrap(), expected_layouts);
    assert_eq!(dev.accel_blob(remap[&accel_a]).unwrap(), vec![0xa1; 100]);
    assert_eq!(dev.accel_blob(remap[&accel_b]).unwrap(), vec![0xb2; 40]);

    // Decode saw exactly the addresses the capture recorded.
    assert_eq!(codec2.seen_addresses.len(), 3);
    assert_eq!(
        codec2.seen_addresses[&addressed],
        dev.buffer_device_address(addressed).unwrap()
    );
    assert_eq!(
        codec2.seen_addresses[&accel_a],
        dev.accel_device_address(accel_a).unwrap()
    );
    assert!(!codec2.seen_addresses.contains_key(&plain));
}

#[test]
fn undefined_image_contents_skip_payload_and_restore() {
    let dev = Arc::new(SoftDevice::new());
    let src_ctx = dev.create_context();
    // Both subresources still hold whatever the allocator left there.
    let image = dev
        .seed_image(
            src_ctx,
            1,
            2,
            vec![vec![0xee; 8], vec![0xee; 8]],
            ImageLayout::Preinitialized,
        )
        .unwrap();

    let device_obj = TrackedObject::new(ObjectKind::Device, RawHandle(src_ctx.0), src_ctx);
    let image_obj = TrackedObject::new(ObjectKind::Image, image, src_ctx);
    let mut table = StateTable::new();
    table.register_opaque(device_obj).unwrap();
    table
        .register_image(
            image_obj,
            ImageDesc {
                layers: 1,
                levels: 2,
                bytes: 16,
                initial_layout: ImageLayout::Preinitialized,
            },
        )
        .unwrap();
    let graph = TestGraph::new(HashMap::from([(device_obj.handle, vec![image_obj])]));

    let codec = TestCodec::new(&dev);
    let pass = CapturePass::new(
        Arc::clone(&dev),
        &table,
        &codec,
        CaptureOptions::default(),
    );
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("point");
    let stats = pass.run(&graph, &[device_obj], &out).unwrap();

    // Nothing meaningful to download: metadata only, no payload file.
    assert_eq!(stats.objects, 2);
    assert_eq!(stats.payloads, 0);
    assert_eq!(stats.payload_bytes, 0);
    assert!(metadata_path(&out, ObjectKind::Image, image).is_file());
    assert!(!payload_path(&out, ObjectKind::Image, image).exists());
    // No download was posted, so the source image was never touched.
    assert_eq!(dev.submit_count(), 0);
    assert_eq!(
        dev.image_layouts(image).unwrap(),
        vec![ImageLayout::Preinitialized; 2]
    );

    let dst_ctx = dev.create_context();
    let mut codec2 = TestCodec::new(&dev);
    let restore = RestorePass::new(
        Arc::clone(&dev),
        HashMap::from([(src_ctx, dst_ctx)]),
        RestoreOptions::default(),
    );
    let (rstats, remap) = restore.run(&mut codec2, &out).unwrap();
    assert_eq!(rstats.objects, 2);
    assert_eq!(rstats.payloads, 0);
    assert!(codec2.seen_addresses.is_empty());
    // The re-created image keeps its fresh undefined state.
    assert_eq!(
        dev.image_layouts(remap[&image]).unwrap(),
        vec![ImageLayout::Undefined; 2]
    );
}

#[test]
fn capture_reports_first_failure_and_keeps_going() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let first = dev.seed_buffer(ctx, vec![1u8; 16]).unwrap();
    let second = dev.seed_buffer(ctx, vec![2u8; 16]).unwrap();

    let device_obj = TrackedObject::new(ObjectKind::Device, RawHandle(ctx.0), ctx);
    let first_obj = TrackedObject::new(ObjectKind::Buffer, first, ctx);
    let second_obj = TrackedObject::new(ObjectKind::Buffer, second, ctx);

    let mut table = StateTable::new();
    table.register_opaque(device_obj).unwrap();
    for obj in [first_obj, second_obj] {
        table
            .register_buffer(
                obj,
                BufferDesc {
                    bytes: 16,
                    usage: BufferUsage::STORAGE,
                },
            )
            .unwrap();
    }
    let graph = TestGraph::new(HashMap::from([(
        device_obj.handle,
        vec![first_obj, second_obj],
    )]));

    dev.fail_next_submit(DriverError::DeviceLost);
    let codec = TestCodec::new(&dev);
    // One worker makes the failing submission the first download's.
    let pass = CapturePass::new(
        Arc::clone(&dev),
        &table,
        &codec,
        CaptureOptions {
            engine: EngineOptions {
                workers: 1,
                ..EngineOptions::default()
            },
        },
    );
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("point");
    let err = pass.run(&graph, &[device_obj], &out).unwrap_err();
    assert!(matches!(
        err,
        CaptureError::Copy(CopyError::Driver(DriverError::DeviceLost))
    ));

    // Everything after the failure was still attempted.
    assert!(out.join("manifest.bin").is_file());
    assert!(out.join("addresses.bin").is_file());
    assert!(!payload_path(&out, ObjectKind::Buffer, first).exists());
    assert_eq!(
        fs::read(payload_path(&out, ObjectKind::Buffer, second)).unwrap(),
        vec![2u8; 16]
    );
    let records =
        read_manifest(BufReader::new(File::open(out.join("manifest.bin")).unwrap())).unwrap();
    assert_eq!(records.len(), 3);
    // Walk references are handed back on the failure path as well.
    assert_eq!(graph.released.lock().unwrap().len(), 3);
}

#[test]
fn restore_requires_a_target_context() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let buffer = dev.seed_buffer(ctx, vec![9u8; 8]).unwrap();

    let device_obj = TrackedObject::new(ObjectKind::Device, RawHandle(ctx.0), ctx);
    let buffer_obj = TrackedObject::new(ObjectKind::Buffer, buffer, ctx);
    let mut table = StateTable::new();
    table.register_opaque(device_obj).unwrap();
    table
        .register_buffer(
            buffer_obj,
            BufferDesc {
                bytes: 8,
                usage: BufferUsage::STORAGE,
            },
        )
        .unwrap();
    let graph = TestGraph::new(HashMap::from([(device_obj.handle, vec![buffer_obj])]));

    let codec = TestCodec::new(&dev);
    let pass = CapturePass::new(
        Arc::clone(&dev),
        &table,
        &codec,
        CaptureOptions::default(),
    );
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("point");
    pass.run(&graph, &[device_obj], &out).unwrap();

    let mut codec2 = TestCodec::new(&dev);
    let restore = RestorePass::new(Arc::clone(&dev), HashMap::new(), RestoreOptions::default());
    let err = restore.run(&mut codec2, &out).unwrap_err();
    assert!(matches!(err, CaptureError::MissingContext(owner) if owner == ctx));
}
