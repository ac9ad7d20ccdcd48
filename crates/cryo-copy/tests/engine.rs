use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use cryo_copy::{
    ByteSink, ByteSource, Completion, CopyEngine, CopyError, DownloadRequest, DownloadTarget,
    EngineOptions, StagingOptions, TransitionRequest, UploadRequest, UploadTarget,
};
use cryo_device::{DriverError, SoftDevice};
use cryo_types::{ContextHandle, ImageLayout, RawHandle, ResolvedRange};

fn engine(dev: &Arc<SoftDevice>, workers: usize) -> CopyEngine<SoftDevice> {
    CopyEngine::new(
        Arc::clone(dev),
        EngineOptions {
            workers,
            ..EngineOptions::default()
        },
    )
    .unwrap()
}

fn whole(layers: u32, levels: u32) -> ResolvedRange {
    ResolvedRange {
        base_layer: 0,
        layer_count: layers,
        base_level: 0,
        level_count: levels,
    }
}

fn buffer_download(
    ctx: ContextHandle,
    buffer: RawHandle,
    bytes: u64,
    on_done: impl FnOnce(cryo_copy::Result<Completion>) + Send + 'static,
) -> DownloadRequest {
    DownloadRequest {
        context: ctx,
        target: DownloadTarget::Buffer {
            buffer,
            offset: 0,
            bytes,
        },
        sink: ByteSink::Memory,
        on_done: Box::new(on_done),
    }
}

#[test]
fn hundred_downloads_on_four_workers() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let mut buffers = Vec::new();
    for i in 0..100usize {
        let fill = (i % 251) as u8;
        buffers.push(dev.seed_buffer(ctx, vec![fill; 4096]).unwrap());
    }

    let pool = engine(&dev, 4);
    let results: Arc<Mutex<Vec<(usize, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    for (i, &buffer) in buffers.iter().enumerate() {
        let results = Arc::clone(&results);
        pool.download(buffer_download(ctx, buffer, 4096, move |res| {
            let completion = res.unwrap();
            let bytes = completion.bytes.unwrap();
            results.lock().unwrap().push((i, bytes));
        }));
    }
    pool.wait().unwrap();

    let mut seen = results.lock().unwrap().clone();
    seen.sort_by_key(|(i, _)| *i);
    assert_eq!(seen.len(), 100);
    for (i, bytes) in seen {
        assert_eq!(bytes, vec![(i % 251) as u8; 4096], "buffer {i}");
    }

    let stats = pool.stats();
    assert_eq!(stats.posted, 100);
    assert_eq!(stats.completed, 100);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.bytes_downloaded, 100 * 4096);
    assert_eq!(dev.submit_count(), 100);

    // Nothing outstanding: a second wait returns at once.
    pool.wait().unwrap();
}

#[test]
fn download_then_upload_round_trip() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let pattern: Vec<u8> = (0..=255).collect();
    let src = dev.seed_buffer(ctx, pattern.clone()).unwrap();
    let dst = dev.seed_buffer(ctx, vec![0; 256]).unwrap();

    let pool = engine(&dev, 2);
    let grabbed: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let grabbed = Arc::clone(&grabbed);
        pool.download(buffer_download(ctx, src, 256, move |res| {
            *grabbed.lock().unwrap() = res.unwrap().bytes;
        }));
    }
    pool.wait().unwrap();
    let bytes = grabbed.lock().unwrap().take().unwrap();
    assert_eq!(bytes, pattern);

    let done = Arc::new(AtomicUsize::new(0));
    {
        let done = Arc::clone(&done);
        pool.upload(UploadRequest {
            context: ctx,
            target: UploadTarget::Buffer {
                buffer: dst,
                offset: 0,
            },
            source: ByteSource::Memory(bytes),
            on_done: Box::new(move |res| {
                res.unwrap();
                done.fetch_add(1, Ordering::SeqCst);
            }),
        });
    }
    pool.wait().unwrap();
    assert_eq!(done.load(Ordering::SeqCst), 1);
    assert_eq!(dev.buffer_bytes(dst).unwrap(), pattern);
    assert_eq!(pool.stats().bytes_uploaded, 256);
}

#[test]
fn file_sink_and_source_round_trip() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let pattern = vec![0xabu8; 1024];
    let src = dev.seed_buffer(ctx, pattern.clone()).unwrap();
    let dst = dev.seed_buffer(ctx, vec![0; 1024]).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buffer.bin");

    let pool = engine(&dev, 1);
    let transferred = Arc::new(AtomicUsize::new(0));
    {
        let transferred = Arc::clone(&transferred);
        pool.download(DownloadRequest {
            context: ctx,
            target: DownloadTarget::Buffer {
                buffer: src,
                offset: 0,
                bytes: 1024,
            },
            sink: ByteSink::File(path.clone()),
            on_done: Box::new(move |res| {
                let completion = res.unwrap();
                // File sinks do not hand the bytes back.
                assert!(completion.bytes.is_none());
                transferred.fetch_add(completion.transferred as usize, Ordering::SeqCst);
            }),
        });
    }
    pool.wait().unwrap();
    assert_eq!(transferred.load(Ordering::SeqCst), 1024);
    assert_eq!(std::fs::read(&path).unwrap(), pattern);

    pool.upload(UploadRequest {
        context: ctx,
        target: UploadTarget::Buffer {
            buffer: dst,
            offset: 0,
        },
        source: ByteSource::File(path),
        on_done: Box::new(|res| {
            res.unwrap();
        }),
    });
    pool.wait().unwrap();
    assert_eq!(dev.buffer_bytes(dst).unwrap(), pattern);
}

#[test]
fn image_round_trip_preserves_bytes_and_layouts() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let cells = vec![vec![1u8; 8], vec![2u8; 8], vec![3u8; 8], vec![4u8; 8]];
    let src = dev
        .seed_image(ctx, 2, 2, cells.clone(), ImageLayout::ShaderReadOnly)
        .unwrap();
    let dst = dev
        .seed_image(ctx, 2, 2, vec![vec![0u8; 8]; 4], ImageLayout::General)
        .unwrap();
    let layouts = vec![ImageLayout::ShaderReadOnly; 4];

    let pool = engine(&dev, 2);
    let grabbed: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let grabbed = Arc::clone(&grabbed);
        pool.download(DownloadRequest {
            context: ctx,
            target: DownloadTarget::Image {
                image: src,
                range: whole(2, 2),
                layouts: layouts.clone(),
                bytes: 32,
            },
            sink: ByteSink::Memory,
            on_done: Box::new(move |res| {
                *grabbed.lock().unwrap() = res.unwrap().bytes;
            }),
        });
    }
    pool.wait().unwrap();

    let bytes = grabbed.lock().unwrap().take().unwrap();
    let expected: Vec<u8> = cells.iter().flatten().copied().collect();
    assert_eq!(bytes, expected);
    // The download put every subresource back in its recorded layout.
    assert_eq!(dev.image_layouts(src).unwrap(), layouts);

    pool.upload(UploadRequest {
        context: ctx,
        target: UploadTarget::Image {
            image: dst,
            range: whole(2, 2),
            final_layouts: layouts.clone(),
        },
        source: ByteSource::Memory(bytes),
        on_done: Box::new(|res| {
            res.unwrap();
        }),
    });
    pool.wait().unwrap();
    assert_eq!(dev.image_bytes(dst).unwrap(), cells);
    assert_eq!(dev.image_layouts(dst).unwrap(), layouts);
}

#[test]
fn transition_state_applies_new_layout() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let image = dev
        .seed_image(ctx, 1, 3, vec![vec![0u8; 4]; 3], ImageLayout::General)
        .unwrap();

    let pool = engine(&dev, 1);
    pool.transition_state(TransitionRequest {
        context: ctx,
        image,
        range: whole(1, 3),
        from: vec![ImageLayout::General; 3],
        to: ImageLayout::TransferSrc,
        on_done: Box::new(|res| {
            res.unwrap();
        }),
    });
    pool.wait().unwrap();
    assert_eq!(
        dev.image_layouts(image).unwrap(),
        vec![ImageLayout::TransferSrc; 3]
    );
}

#[test]
fn failed_task_reports_error_and_engine_recovers() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let buffer = dev.seed_buffer(ctx, vec![7u8; 64]).unwrap();

    let pool = engine(&dev, 1);
    dev.fail_next_submit(DriverError::DeviceLost);

    let failure: Arc<Mutex<Option<cryo_copy::Result<Completion>>>> =
        Arc::new(Mutex::new(None));
    {
        let failure = Arc::clone(&failure);
        pool.download(buffer_download(ctx, buffer, 64, move |res| {
            *failure.lock().unwrap() = Some(res);
        }));
    }
    // Failures surface through the callback; wait() itself stays clean.
    pool.wait().unwrap();
    let res = failure.lock().unwrap().take().unwrap();
    assert!(matches!(
        res,
        Err(CopyError::Driver(DriverError::DeviceLost))
    ));

    // The same worker and bundle carry the next task.
    let grabbed: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let grabbed = Arc::clone(&grabbed);
        pool.download(buffer_download(ctx, buffer, 64, move |res| {
            *grabbed.lock().unwrap() = res.unwrap().bytes;
        }));
    }
    pool.wait().unwrap();
    assert_eq!(grabbed.lock().unwrap().take().unwrap(), vec![7u8; 64]);

    let stats = pool.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(dev.submit_count(), 1);
}

#[test]
fn undefined_cells_keep_transfer_layout_after_copy() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let cells = vec![vec![0x11u8; 8], vec![0x22u8; 8]];
    let src = dev
        .seed_image(ctx, 1, 2, cells.clone(), ImageLayout::General)
        .unwrap();
    let dst = dev
        .seed_image(ctx, 1, 2, vec![vec![0u8; 8]; 2], ImageLayout::General)
        .unwrap();
    // The second cell's contents are undefined as far as the tracker knows.
    let layouts = vec![ImageLayout::General, ImageLayout::Undefined];

    let pool = engine(&dev, 1);
    let grabbed: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let grabbed = Arc::clone(&grabbed);
        pool.download(DownloadRequest {
            context: ctx,
            target: DownloadTarget::Image {
                image: src,
                range: whole(1, 2),
                layouts: layouts.clone(),
                bytes: 16,
            },
            sink: ByteSink::Memory,
            on_done: Box::new(move |res| {
                *grabbed.lock().unwrap() = res.unwrap().bytes;
            }),
        });
    }
    pool.wait().unwrap();
    let bytes = grabbed.lock().unwrap().take().unwrap();
    let expected: Vec<u8> = cells.iter().flatten().copied().collect();
    assert_eq!(bytes, expected);
    // No barrier targets an undefined layout: the defined cell is put back,
    // the undefined one stays where the transfer left it.
    assert_eq!(
        dev.image_layouts(src).unwrap(),
        vec![ImageLayout::General, ImageLayout::TransferSrc]
    );

    pool.upload(UploadRequest {
        context: ctx,
        target: UploadTarget::Image {
            image: dst,
            range: whole(1, 2),
            final_layouts: layouts,
        },
        source: ByteSource::Memory(bytes),
        on_done: Box::new(|res| {
            res.unwrap();
        }),
    });
    pool.wait().unwrap();
    assert_eq!(dev.image_bytes(dst).unwrap(), cells);
    assert_eq!(
        dev.image_layouts(dst).unwrap(),
        vec![ImageLayout::General, ImageLayout::TransferDst]
    );
}

#[test]
fn transition_into_undefined_is_rejected() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let image = dev
        .seed_image(ctx, 1, 1, vec![vec![0u8; 4]], ImageLayout::General)
        .unwrap();

    let pool = engine(&dev, 1);
    let failure: Arc<Mutex<Option<cryo_copy::Result<Completion>>>> =
        Arc::new(Mutex::new(None));
    {
        let failure = Arc::clone(&failure);
        pool.transition_state(TransitionRequest {
            context: ctx,
            image,
            range: whole(1, 1),
            from: vec![ImageLayout::General],
            to: ImageLayout::Undefined,
            on_done: Box::new(move |res| {
                *failure.lock().unwrap() = Some(res);
            }),
        });
    }
    pool.wait().unwrap();
    let res = failure.lock().unwrap().take().unwrap();
    assert!(matches!(res, Err(CopyError::Precondition(_))));
    // Rejected before anything was recorded or submitted.
    assert_eq!(dev.submit_count(), 0);
    assert_eq!(dev.image_layouts(image).unwrap(), vec![ImageLayout::General]);
}

#[test]
fn staging_exhaustion_reaches_the_callback() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let buffer = dev.seed_buffer(ctx, vec![9u8; 64]).unwrap();

    let pool = CopyEngine::new(
        Arc::clone(&dev),
        EngineOptions {
            workers: 1,
            staging: StagingOptions {
                initial_bytes: 16,
                round_up_pow2: true,
            },
        },
    )
    .unwrap();
    dev.fail_next_staging_alloc(DriverError::OutOfDeviceMemory);

    let failure: Arc<Mutex<Option<cryo_copy::Result<Completion>>>> =
        Arc::new(Mutex::new(None));
    {
        let failure = Arc::clone(&failure);
        pool.download(buffer_download(ctx, buffer, 64, move |res| {
            *failure.lock().unwrap() = Some(res);
        }));
    }
    pool.wait().unwrap();
    // Out-of-memory on the staging allocation surfaces as exhaustion, with
    // the size the engine tried to allocate.
    let res = failure.lock().unwrap().take().unwrap();
    assert!(matches!(res, Err(CopyError::Exhausted { bytes: 64 })));
    assert_eq!(dev.staging_alloc_count(), 0);
    // Nothing reached the queue.
    assert_eq!(dev.submit_count(), 0);

    // The worker and its bundle stay usable; the retry allocates and lands.
    let grabbed: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let grabbed = Arc::clone(&grabbed);
        pool.download(buffer_download(ctx, buffer, 64, move |res| {
            *grabbed.lock().unwrap() = res.unwrap().bytes;
        }));
    }
    pool.wait().unwrap();
    assert_eq!(grabbed.lock().unwrap().take().unwrap(), vec![9u8; 64]);
    assert_eq!(dev.staging_alloc_count(), 1);

    let stats = pool.stats();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
}

#[test]
fn wait_with_nothing_outstanding_is_a_noop() {
    let dev = Arc::new(SoftDevice::new());
    let pool = engine(&dev, 2);
    pool.wait().unwrap();
    pool.wait().unwrap();
    assert_eq!(dev.submit_count(), 0);
    assert_eq!(pool.stats().posted, 0);
}

#[test]
fn single_thread_mode_runs_on_the_caller() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let buffer = dev.seed_buffer(ctx, vec![1u8; 16]).unwrap();

    let pool = engine(&dev, 2);

    // Pool mode first: the task lands on a named worker thread.
    let worker_name: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    {
        let worker_name = Arc::clone(&worker_name);
        pool.download(buffer_download(ctx, buffer, 16, move |res| {
            res.unwrap();
            *worker_name.lock().unwrap() = thread::current().name().map(String::from);
        }));
    }
    pool.wait().unwrap();
    let name = worker_name.lock().unwrap().take().unwrap();
    assert!(name.starts_with("cryo-copy-"), "ran on {name}");

    pool.disable_multithreading();
    let ran_on: Arc<Mutex<Option<ThreadId>>> = Arc::new(Mutex::new(None));
    {
        let ran_on = Arc::clone(&ran_on);
        pool.download(buffer_download(ctx, buffer, 16, move |res| {
            res.unwrap();
            *ran_on.lock().unwrap() = Some(thread::current().id());
        }));
    }
    // Synchronous now, complete before wait.
    assert_eq!(ran_on.lock().unwrap().take().unwrap(), thread::current().id());
    pool.wait().unwrap();
}

#[test]
fn staging_reuse_across_tasks_on_one_worker() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let small = dev.seed_buffer(ctx, vec![1u8; 16]).unwrap();
    let large = dev.seed_buffer(ctx, vec![2u8; 100]).unwrap();
    let medium = dev.seed_buffer(ctx, vec![3u8; 32]).unwrap();

    let pool = CopyEngine::new(
        Arc::clone(&dev),
        EngineOptions {
            workers: 1,
            staging: StagingOptions {
                initial_bytes: 64,
                round_up_pow2: true,
            },
        },
    )
    .unwrap();

    let ok = |res: cryo_copy::Result<Completion>| {
        res.unwrap();
    };
    pool.download(buffer_download(ctx, small, 16, ok));
    pool.wait().unwrap();
    assert_eq!(dev.staging_alloc_count(), 1);

    // 100 bytes exceeds the 64-byte floor: grown once, to 128.
    pool.download(buffer_download(ctx, large, 100, ok));
    pool.wait().unwrap();
    assert_eq!(dev.staging_alloc_count(), 2);

    // Smaller again: the grown buffer is reused, never shrunk.
    pool.download(buffer_download(ctx, medium, 32, ok));
    pool.wait().unwrap();
    assert_eq!(dev.staging_alloc_count(), 2);
}

#[test]
fn reset_frees_bundles_and_engine_stays_usable() {
    let dev = Arc::new(SoftDevice::new());
    let ctx = dev.create_context();
    let buffer = dev.seed_buffer(ctx, vec![5u8; 32]).unwrap();

    let pool = engine(&dev, 1);
    pool.download(buffer_download(ctx, buffer, 32, |res| {
        res.unwrap();
    }));
    pool.wait().unwrap();
    // Seeded buffer plus the worker's staging buffer.
    assert_eq!(dev.live_buffer_count(), 2);

    pool.reset().unwrap();
    assert_eq!(dev.live_buffer_count(), 1);

    let grabbed: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    {
        let grabbed = Arc::clone(&grabbed);
        pool.download(buffer_download(ctx, buffer, 32, move |res| {
            *grabbed.lock().unwrap() = res.unwrap().bytes;
        }));
    }
    pool.wait().unwrap();
    assert_eq!(grabbed.lock().unwrap().take().unwrap(), vec![5u8; 32]);
    assert_eq!(dev.live_buffer_count(), 2);
}

#[test]
fn downloads_span_multiple_contexts() {
    let dev = Arc::new(SoftDevice::new());
    let ctx_a = dev.create_context();
    let ctx_b = dev.create_context();
    let buf_a = dev.seed_buffer(ctx_a, vec![0xaau8; 64]).unwrap();
    let buf_b = dev.seed_buffer(ctx_b, vec![0xbbu8; 64]).unwrap();

    let pool = engine(&dev, 2);
    let hits = Arc::new(AtomicUsize::new(0));
    for (ctx, buffer, fill) in [(ctx_a, buf_a, 0xaau8), (ctx_b, buf_b, 0xbbu8)] {
        let hits = Arc::clone(&hits);
        pool.download(buffer_download(ctx, buffer, 64, move |res| {
            assert_eq!(res.unwrap().bytes.unwrap(), vec![fill; 64]);
            hits.fetch_add(1, Ordering::SeqCst);
        }));
    }
    pool.wait().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
