//! Concurrent staging-copy engine.
//!
//! A [`CopyEngine`] owns a fixed pool of worker threads and moves bytes
//! between host memory (or files) and device objects through per-worker
//! staging buffers. Posting is fire-and-forget; results and failures come
//! back through per-task callbacks, and [`CopyEngine::wait`] provides the
//! full barrier a capture pass needs before sealing its output.

mod engine;
mod error;
mod request;

pub use crate::engine::CopyEngine;
pub use crate::error::{CopyError, Result};
pub use crate::request::{
    ByteSink, ByteSource, Completion, CompletionFn, CopyStats, DownloadRequest, DownloadTarget,
    EngineOptions, StagingOptions, TransitionRequest, UploadRequest, UploadTarget,
};
