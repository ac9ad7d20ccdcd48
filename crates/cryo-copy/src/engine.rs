use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};

use cryo_device::{DeviceBackend, DriverError, StagingAlloc};
use cryo_types::{ContextHandle, ImageLayout, RawHandle, ResolvedRange};
use tracing::{debug, warn};

use crate::error::{CopyError, Result};
use crate::request::{
    ByteSink, ByteSource, Completion, CompletionFn, CopyStats, DownloadRequest, DownloadTarget,
    EngineOptions, StagingOptions, TransitionRequest, UploadRequest, UploadTarget,
};

/// Moves bytes between host and device memory on a fixed pool of worker
/// threads.
///
/// Each worker owns one [`TaskResourceBundle`] per device context it has
/// served; a bundle is taken out of the shared map for the duration of a
/// task, so no lock is held while it is in use. Queue submission is the one
/// step shared across workers and is serialized behind a per-engine mutex.
/// Every worker genuinely blocks on its bundle's fence, which makes the pool
/// size the hard cap on concurrently in-flight submissions.
///
/// Task failures are delivered through completion callbacks; the engine
/// itself keeps running and the failing task's bundle stays reusable.
pub struct CopyEngine<B: DeviceBackend + 'static> {
    backend: Arc<B>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    staging: StagingOptions,
}

struct Shared {
    queue: Mutex<TaskQueue>,
    work_ready: Condvar,
    drained: Condvar,
    /// Serializes `queue_submit` across workers; the device queue is the
    /// single shared resource.
    submit_lock: Mutex<()>,
    /// Parked bundles, keyed by (worker thread, target context).
    bundles: Mutex<HashMap<(ThreadId, ContextHandle), TaskResourceBundle>>,
    /// Contexts touched since the last reset; `wait()` device-idles them all.
    touched: Mutex<HashSet<ContextHandle>>,
    stats: Mutex<CopyStats>,
    single_thread: AtomicBool,
}

#[derive(Default)]
struct TaskQueue {
    tasks: VecDeque<Task>,
    /// Posted but not yet completed, queued tasks included.
    in_flight: usize,
    shutdown: bool,
}

enum Task {
    Download(DownloadRequest),
    Upload(UploadRequest),
    Transition(TransitionRequest),
}

impl Task {
    fn context(&self) -> ContextHandle {
        match self {
            Task::Download(req) => req.context,
            Task::Upload(req) => req.context,
            Task::Transition(req) => req.context,
        }
    }
}

/// Command buffer, fence and staging memory for one (worker, context) pair.
///
/// Exclusively owned by the thread that took it while a task runs. The
/// staging allocation only ever grows; [`CopyEngine::reset`] releases it.
struct TaskResourceBundle {
    cmd: RawHandle,
    fence: RawHandle,
    staging: Option<StagingAlloc>,
}

impl TaskResourceBundle {
    fn create<B: DeviceBackend>(backend: &B, ctx: ContextHandle) -> Result<Self> {
        let cmd = backend.create_command_buffer(ctx)?;
        let fence = match backend.create_fence(ctx) {
            Ok(fence) => fence,
            Err(err) => {
                let _ = backend.destroy_command_buffer(ctx, cmd);
                return Err(err.into());
            }
        };
        Ok(Self {
            cmd,
            fence,
            staging: None,
        })
    }

    /// Returns a staging allocation of at least `bytes`, growing (never
    /// shrinking) the current one when it is too small.
    fn ensure_staging<B: DeviceBackend>(
        &mut self,
        backend: &B,
        ctx: ContextHandle,
        options: StagingOptions,
        bytes: u64,
    ) -> Result<StagingAlloc> {
        if let Some(alloc) = self.staging {
            if alloc.bytes >= bytes {
                return Ok(alloc);
            }
        }
        let mut target = bytes.max(options.initial_bytes).max(1);
        if options.round_up_pow2 {
            target = target.next_power_of_two();
        }
        if let Some(old) = self.staging.take() {
            debug!(old = old.bytes, new = target, "growing staging buffer");
            backend.free_staging(ctx, old)?;
        }
        let alloc = backend
            .allocate_staging(ctx, target)
            .map_err(|err| match err {
                DriverError::OutOfHostMemory | DriverError::OutOfDeviceMemory => {
                    CopyError::Exhausted { bytes: target }
                }
                other => other.into(),
            })?;
        self.staging = Some(alloc);
        Ok(alloc)
    }

    /// Clears whatever a failed task may have left behind (an open
    /// recording, a signaled fence) so the next task can reuse the bundle.
    fn recover<B: DeviceBackend>(&self, backend: &B) {
        let _ = backend.end_commands(self.cmd);
        let _ = backend.reset_fence(self.fence);
    }

    fn destroy<B: DeviceBackend>(self, backend: &B, ctx: ContextHandle) -> Result<()> {
        let mut first: Option<DriverError> = None;
        if let Some(alloc) = self.staging {
            if let Err(err) = backend.free_staging(ctx, alloc) {
                first.get_or_insert(err);
            }
        }
        if let Err(err) = backend.destroy_fence(ctx, self.fence) {
            first.get_or_insert(err);
        }
        if let Err(err) = backend.destroy_command_buffer(ctx, self.cmd) {
            first.get_or_insert(err);
        }
        match first {
            None => Ok(()),
            Some(err) => Err(err.into()),
        }
    }
}

impl<B: DeviceBackend + 'static> CopyEngine<B> {
    pub fn new(backend: Arc<B>, options: EngineOptions) -> Result<Self> {
        if options.workers == 0 {
            return Err(CopyError::Precondition("worker pool size must be nonzero"));
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(TaskQueue::default()),
            work_ready: Condvar::new(),
            drained: Condvar::new(),
            submit_lock: Mutex::new(()),
            bundles: Mutex::new(HashMap::new()),
            touched: Mutex::new(HashSet::new()),
            stats: Mutex::new(CopyStats::default()),
            single_thread: AtomicBool::new(false),
        });
        let mut workers = Vec::with_capacity(options.workers);
        for i in 0..options.workers {
            let worker_backend = Arc::clone(&backend);
            let worker_shared = Arc::clone(&shared);
            let staging = options.staging;
            let spawned = thread::Builder::new()
                .name(format!("cryo-copy-{i}"))
                .spawn(move || worker_loop(worker_backend, worker_shared, staging));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    // Unwind the part of the pool that did start.
                    lock(&shared.queue).shutdown = true;
                    shared.work_ready.notify_all();
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(Self {
            backend,
            shared,
            workers,
            staging: options.staging,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> CopyStats {
        *lock(&self.shared.stats)
    }

    /// Posts a device-to-host transfer and returns immediately; the result
    /// arrives through the request's callback.
    pub fn download(&self, req: DownloadRequest) {
        self.post(Task::Download(req));
    }

    /// Posts a host-to-device transfer and returns immediately.
    pub fn upload(&self, req: UploadRequest) {
        self.post(Task::Upload(req));
    }

    /// Posts a standalone layout transition and returns immediately.
    pub fn transition_state(&self, req: TransitionRequest) {
        self.post(Task::Transition(req));
    }

    fn post(&self, task: Task) {
        lock(&self.shared.touched).insert(task.context());
        lock(&self.shared.stats).posted += 1;
        if self.shared.single_thread.load(Ordering::Acquire) {
            lock(&self.shared.queue).in_flight += 1;
            run_task(&*self.backend, &self.shared, self.staging, task);
            let mut queue = lock(&self.shared.queue);
            queue.in_flight -= 1;
            if queue.in_flight == 0 {
                self.shared.drained.notify_all();
            }
            return;
        }
        let mut queue = lock(&self.shared.queue);
        queue.in_flight += 1;
        queue.tasks.push_back(task);
        drop(queue);
        self.shared.work_ready.notify_one();
    }

    /// Blocks until every posted task has completed and every context
    /// touched since the last [`CopyEngine::reset`] reports device-idle.
    /// With nothing outstanding this returns immediately.
    pub fn wait(&self) -> Result<()> {
        let mut queue = lock(&self.shared.queue);
        while queue.in_flight > 0 {
            queue = wait_on(&self.shared.drained, queue);
        }
        drop(queue);
        let touched: Vec<ContextHandle> = lock(&self.shared.touched).iter().copied().collect();
        for ctx in touched {
            self.backend.wait_idle(ctx)?;
        }
        Ok(())
    }

    /// Makes every subsequent post execute synchronously on the calling
    /// thread. Tasks already queued still drain on the pool.
    pub fn disable_multithreading(&self) {
        self.shared.single_thread.store(true, Ordering::Release);
    }

    /// Drains outstanding work, frees every parked bundle and forgets the
    /// touched-context set. The engine stays usable afterwards; bundles are
    /// recreated lazily on the next post.
    pub fn reset(&self) -> Result<()> {
        self.wait()?;
        let drained: Vec<((ThreadId, ContextHandle), TaskResourceBundle)> =
            lock(&self.shared.bundles).drain().collect();
        let mut first: Option<CopyError> = None;
        for ((_, ctx), bundle) in drained {
            if let Err(err) = bundle.destroy(&*self.backend, ctx) {
                warn!(%ctx, "failed to destroy a task resource bundle: {err}");
                if first.is_none() {
                    first = Some(err);
                }
            }
        }
        lock(&self.shared.touched).clear();
        match first {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

impl<B: DeviceBackend + 'static> Drop for CopyEngine<B> {
    fn drop(&mut self) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.shutdown = true;
        }
        self.shared.work_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("copy engine worker panicked");
            }
        }
        let drained: Vec<_> = lock(&self.shared.bundles).drain().collect();
        for ((_, ctx), bundle) in drained {
            if let Err(err) = bundle.destroy(&*self.backend, ctx) {
                warn!(%ctx, "leaked task resources at engine drop: {err}");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn wait_on<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    match cv.wait(guard) {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn worker_loop<B: DeviceBackend>(backend: Arc<B>, shared: Arc<Shared>, staging: StagingOptions) {
    loop {
        let task = {
            let mut queue = lock(&shared.queue);
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break Some(task);
                }
                if queue.shutdown {
                    break None;
                }
                queue = wait_on(&shared.work_ready, queue);
            }
        };
        // Posted tasks always run to completion; shutdown only stops an
        // empty queue.
        let Some(task) = task else { return };
        run_task(&*backend, &shared, staging, task);
        let mut queue = lock(&shared.queue);
        queue.in_flight -= 1;
        if queue.in_flight == 0 {
            shared.drained.notify_all();
        }
    }
}

fn run_task<B: DeviceBackend>(backend: &B, shared: &Shared, staging: StagingOptions, task: Task) {
    match task {
        Task::Download(DownloadRequest {
            context,
            target,
            sink,
            on_done,
        }) => {
            let result = with_bundle(backend, shared, context, |bundle| {
                execute_download(backend, shared, staging, context, bundle, &target, &sink)
            });
            finish(shared, result, on_done, |stats, c| {
                stats.bytes_downloaded += c.transferred;
            });
        }
        Task::Upload(UploadRequest {
            context,
            target,
            source,
            on_done,
        }) => {
            let result = with_bundle(backend, shared, context, |bundle| {
                execute_upload(backend, shared, staging, context, bundle, &target, source)
            });
            finish(shared, result, on_done, |stats, c| {
                stats.bytes_uploaded += c.transferred;
            });
        }
        Task::Transition(TransitionRequest {
            context,
            image,
            range,
            from,
            to,
            on_done,
        }) => {
            let result = with_bundle(backend, shared, context, |bundle| {
                execute_transition(backend, shared, context, bundle, image, range, &from, to)
            });
            finish(shared, result, on_done, |_, _| {});
        }
    }
}

/// Takes the calling thread's bundle for `ctx` (creating it lazily), runs
/// `f`, then parks the bundle again. The map lock is held only for the
/// take and the put-back.
fn with_bundle<B: DeviceBackend, F>(
    backend: &B,
    shared: &Shared,
    ctx: ContextHandle,
    f: F,
) -> Result<Completion>
where
    F: FnOnce(&mut TaskResourceBundle) -> Result<Completion>,
{
    let key = (thread::current().id(), ctx);
    let parked = lock(&shared.bundles).remove(&key);
    let mut bundle = match parked {
        Some(bundle) => bundle,
        None => TaskResourceBundle::create(backend, ctx)?,
    };
    let result = f(&mut bundle);
    if result.is_err() {
        bundle.recover(backend);
    }
    let mut bundles = lock(&shared.bundles);
    match bundles.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(bundle);
        }
        Entry::Occupied(_) => {
            // A nested post on this thread re-created a bundle for the same
            // context while ours was out; keep that one, free ours.
            drop(bundles);
            if let Err(err) = bundle.destroy(backend, ctx) {
                warn!(%ctx, "failed to destroy a duplicate bundle: {err}");
            }
        }
    }
    result
}

fn finish(
    shared: &Shared,
    result: Result<Completion>,
    on_done: CompletionFn,
    on_ok: impl FnOnce(&mut CopyStats, &Completion),
) {
    {
        let mut stats = lock(&shared.stats);
        match &result {
            Ok(completion) => {
                stats.completed += 1;
                on_ok(&mut stats, completion);
            }
            Err(_) => stats.failed += 1,
        }
    }
    on_done(result);
}

fn execute_download<B: DeviceBackend>(
    backend: &B,
    shared: &Shared,
    staging: StagingOptions,
    ctx: ContextHandle,
    bundle: &mut TaskResourceBundle,
    target: &DownloadTarget,
    sink: &ByteSink,
) -> Result<Completion> {
    let bytes = target.bytes();
    let alloc = bundle.ensure_staging(backend, ctx, staging, bytes)?;
    backend.begin_commands(bundle.cmd)?;
    match target {
        DownloadTarget::Buffer {
            buffer,
            offset,
            bytes,
        } => {
            backend.cmd_copy_buffer(bundle.cmd, *buffer, *offset, alloc.buffer, 0, *bytes)?;
        }
        DownloadTarget::Image {
            image,
            range,
            layouts,
            ..
        } => {
            check_layouts(*range, layouts)?;
            transition_runs(
                backend,
                bundle.cmd,
                *image,
                *range,
                layouts,
                ImageLayout::TransferSrc,
                true,
            )?;
            backend.cmd_copy_image_to_buffer(bundle.cmd, *image, *range, alloc.buffer, 0)?;
            transition_runs(
                backend,
                bundle.cmd,
                *image,
                *range,
                layouts,
                ImageLayout::TransferSrc,
                false,
            )?;
        }
        DownloadTarget::Accel {
            accel,
            scratch,
            bytes,
        } => {
            backend.cmd_serialize_accel(bundle.cmd, *accel, *scratch)?;
            backend.cmd_copy_buffer(bundle.cmd, *scratch, 0, alloc.buffer, 0, *bytes)?;
        }
    }
    backend.end_commands(bundle.cmd)?;
    submit_and_wait(backend, shared, ctx, bundle)?;
    let data = backend.read_staging(alloc.memory, bytes as usize)?;
    deliver(sink, data)
}

fn execute_upload<B: DeviceBackend>(
    backend: &B,
    shared: &Shared,
    staging: StagingOptions,
    ctx: ContextHandle,
    bundle: &mut TaskResourceBundle,
    target: &UploadTarget,
    source: ByteSource,
) -> Result<Completion> {
    let data = match source {
        ByteSource::Memory(data) => data,
        ByteSource::File(path) => std::fs::read(path)?,
    };
    let alloc = bundle.ensure_staging(backend, ctx, staging, data.len() as u64)?;
    backend.write_staging(alloc.memory, &data)?;
    backend.begin_commands(bundle.cmd)?;
    match target {
        UploadTarget::Buffer { buffer, offset } => {
            backend.cmd_copy_buffer(
                bundle.cmd,
                alloc.buffer,
                0,
                *buffer,
                *offset,
                data.len() as u64,
            )?;
        }
        UploadTarget::Image {
            image,
            range,
            final_layouts,
        } => {
            check_layouts(*range, final_layouts)?;
            // Contents are about to be overwritten, so the old layout can
            // be discarded.
            backend.cmd_transition_image(
                bundle.cmd,
                *image,
                *range,
                ImageLayout::Undefined,
                ImageLayout::TransferDst,
            )?;
            backend.cmd_copy_buffer_to_image(bundle.cmd, alloc.buffer, 0, *image, *range)?;
            transition_runs(
                backend,
                bundle.cmd,
                *image,
                *range,
                final_layouts,
                ImageLayout::TransferDst,
                false,
            )?;
        }
        UploadTarget::Accel { accel, scratch } => {
            backend.cmd_copy_buffer(
                bundle.cmd,
                alloc.buffer,
                0,
                *scratch,
                0,
                data.len() as u64,
            )?;
            backend.cmd_deserialize_accel(bundle.cmd, *scratch, *accel)?;
        }
    }
    backend.end_commands(bundle.cmd)?;
    submit_and_wait(backend, shared, ctx, bundle)?;
    Ok(Completion {
        bytes: None,
        transferred: data.len() as u64,
    })
}

#[allow(clippy::too_many_arguments)]
fn execute_transition<B: DeviceBackend>(
    backend: &B,
    shared: &Shared,
    ctx: ContextHandle,
    bundle: &mut TaskResourceBundle,
    image: RawHandle,
    range: ResolvedRange,
    from: &[ImageLayout],
    to: ImageLayout,
) -> Result<Completion> {
    if to.is_undefined() {
        return Err(CopyError::Precondition(
            "cannot transition into an undefined-content layout",
        ));
    }
    check_layouts(range, from)?;
    backend.begin_commands(bundle.cmd)?;
    transition_runs(backend, bundle.cmd, image, range, from, to, true)?;
    backend.end_commands(bundle.cmd)?;
    submit_and_wait(backend, shared, ctx, bundle)?;
    Ok(Completion::default())
}

fn submit_and_wait<B: DeviceBackend>(
    backend: &B,
    shared: &Shared,
    ctx: ContextHandle,
    bundle: &TaskResourceBundle,
) -> Result<()> {
    {
        let _serialized = lock(&shared.submit_lock);
        backend.queue_submit(ctx, bundle.cmd, bundle.fence)?;
    }
    // A genuine block: the pool size caps in-flight submissions.
    backend.wait_fence(bundle.fence)?;
    backend.reset_fence(bundle.fence)?;
    Ok(())
}

fn check_layouts(range: ResolvedRange, layouts: &[ImageLayout]) -> Result<()> {
    if !range.is_empty() && layouts.len() == range.cell_count() {
        Ok(())
    } else {
        Err(CopyError::Precondition(
            "layout count does not match subresource range",
        ))
    }
}

/// Records one barrier per run of equal layouts along each layer row.
/// `into_transfer` picks the direction: cell layout to `transfer` before a
/// copy, or `transfer` back to cell layout afterwards. Runs that would be
/// no-ops are skipped, as are runs whose cell layout has undefined contents:
/// no barrier may target such a layout, and a cell recorded as undefined
/// stays wherever the transfer left it.
fn transition_runs<B: DeviceBackend>(
    backend: &B,
    cmd: RawHandle,
    image: RawHandle,
    range: ResolvedRange,
    layouts: &[ImageLayout],
    transfer: ImageLayout,
    into_transfer: bool,
) -> Result<()> {
    let mut idx = 0usize;
    for layer in range.base_layer..range.base_layer + range.layer_count {
        let mut level = range.base_level;
        let row_end = range.base_level + range.level_count;
        while level < row_end {
            let layout = layouts[idx];
            let mut run = 1u32;
            while level + run < row_end && layouts[idx + run as usize] == layout {
                run += 1;
            }
            let (from, to) = if into_transfer {
                (layout, transfer)
            } else {
                (transfer, layout)
            };
            if from != to && !to.is_undefined() {
                let piece = ResolvedRange {
                    base_layer: layer,
                    layer_count: 1,
                    base_level: level,
                    level_count: run,
                };
                backend.cmd_transition_image(cmd, image, piece, from, to)?;
            }
            idx += run as usize;
            level += run;
        }
    }
    Ok(())
}

fn deliver(sink: &ByteSink, data: Vec<u8>) -> Result<Completion> {
    let transferred = data.len() as u64;
    match sink {
        ByteSink::Memory => Ok(Completion {
            bytes: Some(data),
            transferred,
        }),
        ByteSink::File(path) => {
            std::fs::write(path, &data)?;
            Ok(Completion {
                bytes: None,
                transferred,
            })
        }
    }
}
