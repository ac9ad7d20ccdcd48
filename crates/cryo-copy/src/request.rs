use std::path::PathBuf;

use cryo_types::{ContextHandle, ImageLayout, RawHandle, ResolvedRange};

use crate::error::Result;

/// Completion callback of one posted task. Runs on the worker thread that
/// executed the task (or the posting thread when multithreading is off) and
/// is the only place task failures surface.
pub type CompletionFn = Box<dyn FnOnce(Result<Completion>) + Send + 'static>;

/// What a finished task hands to its completion callback.
#[derive(Debug, Default)]
pub struct Completion {
    /// Downloaded bytes, for requests that asked for in-memory delivery.
    pub bytes: Option<Vec<u8>>,
    /// Bytes moved across the host/device boundary by this task.
    pub transferred: u64,
}

/// Where downloaded bytes end up.
#[derive(Debug, Clone)]
pub enum ByteSink {
    /// Deliver in [`Completion::bytes`].
    Memory,
    /// Write to this file, created or truncated by the worker.
    File(PathBuf),
}

/// Where uploaded bytes come from.
#[derive(Debug, Clone)]
pub enum ByteSource {
    Memory(Vec<u8>),
    /// Read by the worker when the task runs.
    File(PathBuf),
}

/// Device-side source of a download.
///
/// Ranges are exact ([`ResolvedRange`]); the caller clips sentinels against
/// the tracker's grids before posting. Layout slices run parallel to the
/// range in layer-major order.
#[derive(Debug, Clone)]
pub enum DownloadTarget {
    Buffer {
        buffer: RawHandle,
        offset: u64,
        bytes: u64,
    },
    Image {
        image: RawHandle,
        range: ResolvedRange,
        /// Current layout of every cell; each is transitioned to
        /// transfer-src for the copy and back afterwards.
        layouts: Vec<ImageLayout>,
        bytes: u64,
    },
    /// Serialize the structure through the driver blob into `scratch`, then
    /// download `bytes` from it. The scratch buffer is caller-owned and
    /// shared, so accel downloads must be serialized by the caller.
    Accel {
        accel: RawHandle,
        scratch: RawHandle,
        bytes: u64,
    },
}

impl DownloadTarget {
    pub(crate) fn bytes(&self) -> u64 {
        match self {
            DownloadTarget::Buffer { bytes, .. }
            | DownloadTarget::Image { bytes, .. }
            | DownloadTarget::Accel { bytes, .. } => *bytes,
        }
    }
}

pub struct DownloadRequest {
    pub context: ContextHandle,
    pub target: DownloadTarget,
    pub sink: ByteSink,
    pub on_done: CompletionFn,
}

/// Device-side destination of an upload.
#[derive(Debug, Clone)]
pub enum UploadTarget {
    Buffer {
        buffer: RawHandle,
        offset: u64,
    },
    Image {
        image: RawHandle,
        range: ResolvedRange,
        /// Layout every cell is left in once the copy lands; the upload
        /// itself goes through transfer-dst.
        final_layouts: Vec<ImageLayout>,
    },
    /// Stage the serialized blob into `scratch`, then rebuild the structure
    /// from it.
    Accel {
        accel: RawHandle,
        scratch: RawHandle,
    },
}

pub struct UploadRequest {
    pub context: ContextHandle,
    pub target: UploadTarget,
    pub source: ByteSource,
    pub on_done: CompletionFn,
}

/// Standalone layout transition, no data movement.
pub struct TransitionRequest {
    pub context: ContextHandle,
    pub image: RawHandle,
    pub range: ResolvedRange,
    /// Current layout of every cell, layer-major.
    pub from: Vec<ImageLayout>,
    pub to: ImageLayout,
    pub on_done: CompletionFn,
}

/// Staging-buffer growth policy.
///
/// A bundle's staging buffer only ever grows within a session; `reset()`
/// is the high-water-mark release.
#[derive(Debug, Clone, Copy)]
pub struct StagingOptions {
    /// Capacity given to a bundle's first staging buffer.
    pub initial_bytes: u64,
    /// Round every growth to the next power of two to curb reallocation
    /// churn under mixed request sizes.
    pub round_up_pow2: bool,
}

impl Default for StagingOptions {
    fn default() -> Self {
        Self {
            initial_bytes: 1 << 20,
            round_up_pow2: true,
        }
    }
}

/// Copy engine construction parameters.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Fixed worker pool size; also the upper bound on concurrently
    /// in-flight device submissions from this engine.
    pub workers: usize,
    pub staging: StagingOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            staging: StagingOptions::default(),
        }
    }
}

/// Counters accumulated since engine construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub posted: u64,
    pub completed: u64,
    pub failed: u64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}
