use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use cryo_types::{ImageLayout, RawHandle, SubresourceRange};
use tracing::warn;

use crate::error::{Result, TrackError};
use crate::grid::SubresourceGrid;
use crate::table::StateTable;

/// Command-buffer lifecycle, as the host API defines it.
///
/// `Pending` is only ever observed mid-submission; [`CommandStream::on_submit`]
/// leaves the stream in `Executable` or `Invalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

impl core::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            LifecycleState::Initial => "initial",
            LifecycleState::Recording => "recording",
            LifecycleState::Executable => "executable",
            LifecycleState::Pending => "pending",
            LifecycleState::Invalid => "invalid",
        };
        f.write_str(name)
    }
}

/// An image bound to the active scope, with the layout the scope leaves it
/// in when it ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeAttachment {
    pub image: RawHandle,
    pub range: SubresourceRange,
    pub final_layout: ImageLayout,
}

/// One explicit layout transition on an image subresource range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: RawHandle,
    pub range: SubresourceRange,
    pub new_layout: ImageLayout,
}

/// Closed set of state-relevant operations a recording can contain.
///
/// State deltas are derived in exactly one place ([`CommandStream::record`]);
/// adding a kind means extending that match, which the compiler enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedOp {
    BeginScope { attachments: Vec<ScopeAttachment> },
    EndScope,
    Barrier(ImageBarrier),
    WaitForSignal { event: RawHandle, barriers: Vec<ImageBarrier> },
    CopyBuffer { src: RawHandle, dst: RawHandle, bytes: u64 },
    CopyImage { src: RawHandle, dst: RawHandle, range: SubresourceRange },
    BlitImage { src: RawHandle, dst: RawHandle, dst_range: SubresourceRange },
    ClearImage { image: RawHandle, range: SubresourceRange },
}

/// Staged, not-yet-authoritative effects of one recording.
#[derive(Debug, Default)]
struct SideTable {
    /// Per-image layout deltas; `None` cells were not touched.
    layouts: HashMap<RawHandle, SubresourceGrid<Option<ImageLayout>>>,
    /// Objects whose contents the recording overwrites.
    writes: HashSet<RawHandle>,
}

impl SideTable {
    fn clear(&mut self) {
        self.layouts.clear();
        self.writes.clear();
    }
}

/// Records the state-relevant operations of one command buffer and derives
/// the layout transitions they imply.
///
/// Derived effects accumulate in a session-local side table and reach the
/// authoritative [`StateTable`] only in [`CommandStream::on_submit`]; a
/// recording that is never submitted leaves no externally visible trace.
#[derive(Debug)]
pub struct CommandStream {
    handle: RawHandle,
    state: LifecycleState,
    ops: Vec<RecordedOp>,
    scope: Option<Vec<ScopeAttachment>>,
    side: SideTable,
}

impl CommandStream {
    pub fn new(handle: RawHandle) -> Self {
        Self {
            handle,
            state: LifecycleState::Initial,
            ops: Vec::new(),
            scope: None,
            side: SideTable::default(),
        }
    }

    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The recorded operations, in order. Frozen once `end()` succeeds.
    pub fn ops(&self) -> &[RecordedOp] {
        &self.ops
    }

    /// Starts a new recording, discarding any previous one. Legal from
    /// `Initial`, `Executable` (re-record) and `Invalid` (implicit reset).
    pub fn begin(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Initial | LifecycleState::Executable | LifecycleState::Invalid => {
                self.clear();
                self.state = LifecycleState::Recording;
                Ok(())
            }
            state => Err(TrackError::InvalidLifecycle { op: "begin", state }),
        }
    }

    /// Appends `op` and stages the state deltas it implies.
    ///
    /// `table` resolves image dimensions for delta grids; recording against
    /// a handle the table does not know is a caller error.
    pub fn record(&mut self, table: &StateTable, op: RecordedOp) -> Result<()> {
        if self.state != LifecycleState::Recording {
            return Err(TrackError::InvalidLifecycle {
                op: "record",
                state: self.state,
            });
        }
        match &op {
            RecordedOp::BeginScope { attachments } => {
                if self.scope.is_some() {
                    return Err(TrackError::MalformedOp("scope already active"));
                }
                self.scope = Some(attachments.clone());
            }
            RecordedOp::EndScope => {
                let attachments = self
                    .scope
                    .take()
                    .ok_or(TrackError::MalformedOp("end-scope without begin-scope"))?;
                for a in &attachments {
                    self.stage_layout(table, a.image, a.range, a.final_layout)?;
                }
            }
            RecordedOp::Barrier(b) => {
                self.stage_layout(table, b.image, b.range, b.new_layout)?;
            }
            RecordedOp::WaitForSignal { barriers, .. } => {
                for b in barriers {
                    self.stage_layout(table, b.image, b.range, b.new_layout)?;
                }
            }
            RecordedOp::CopyBuffer { dst, .. } => {
                self.side.writes.insert(*dst);
            }
            RecordedOp::CopyImage { dst, .. } | RecordedOp::BlitImage { dst, .. } => {
                self.side.writes.insert(*dst);
            }
            RecordedOp::ClearImage { image, .. } => {
                self.side.writes.insert(*image);
            }
        }
        self.ops.push(op);
        Ok(())
    }

    fn stage_layout(
        &mut self,
        table: &StateTable,
        image: RawHandle,
        range: SubresourceRange,
        layout: ImageLayout,
    ) -> Result<()> {
        let authoritative = table.image_grid(image)?;
        let delta = match self.side.layouts.entry(image) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(SubresourceGrid::new(
                authoritative.layers(),
                authoritative.levels(),
                None,
            )?),
        };
        delta.set_range(range, Some(layout))
    }

    /// Ends the recording. Fails if a scope is still open.
    pub fn end(&mut self) -> Result<()> {
        if self.state != LifecycleState::Recording {
            return Err(TrackError::InvalidLifecycle {
                op: "end",
                state: self.state,
            });
        }
        if self.scope.is_some() {
            return Err(TrackError::MalformedOp("end with a scope still active"));
        }
        self.state = LifecycleState::Executable;
        Ok(())
    }

    /// Merges staged effects into the authoritative table and flips the
    /// signaled bit of every semaphore in `waits` (to unsignaled) and
    /// `signals` (to signaled).
    ///
    /// The caller invokes this only after the driver accepted the real queue
    /// submission; this merge is the single point where authoritative state
    /// changes. Objects unregistered since recording are skipped with a
    /// warning rather than failing the whole merge.
    pub fn on_submit(
        &mut self,
        table: &mut StateTable,
        waits: &[RawHandle],
        signals: &[RawHandle],
        one_time: bool,
    ) -> Result<()> {
        if self.state != LifecycleState::Executable {
            return Err(TrackError::InvalidLifecycle {
                op: "submit",
                state: self.state,
            });
        }
        self.state = LifecycleState::Pending;

        for (image, delta) in &self.side.layouts {
            let grid = match table.image_grid_mut(*image) {
                Ok(grid) => grid,
                Err(_) => {
                    warn!(image = %image, "layout merge skipped: image no longer registered");
                    continue;
                }
            };
            if delta.layers() != grid.layers() || delta.levels() != grid.levels() {
                // The handle was reused for a differently shaped image.
                warn!(image = %image, "layout merge skipped: image dimensions changed");
                continue;
            }
            for (sub, staged) in delta.iter() {
                if let Some(layout) = staged {
                    grid.set(sub, layout)?;
                }
            }
        }
        for handle in &self.side.writes {
            if table.bump_content_epoch(*handle).is_err() {
                warn!(handle = %handle, "write merge skipped: object no longer registered");
            }
        }
        for sem in waits {
            if table.set_semaphore_signaled(*sem, false).is_err() {
                warn!(semaphore = %sem, "wait flip skipped: unknown semaphore");
            }
        }
        for sem in signals {
            if table.set_semaphore_signaled(*sem, true).is_err() {
                warn!(semaphore = %sem, "signal flip skipped: unknown semaphore");
            }
        }

        if one_time {
            self.clear();
            self.state = LifecycleState::Invalid;
        } else {
            self.state = LifecycleState::Executable;
        }
        Ok(())
    }

    /// Returns to `Initial` from any state, discarding the recording and its
    /// staged effects.
    pub fn reset(&mut self) {
        self.clear();
        self.state = LifecycleState::Initial;
    }

    fn clear(&mut self) {
        self.ops.clear();
        self.scope = None;
        self.side.clear();
    }
}
