use std::collections::HashMap;

use cryo_types::{BufferUsage, ImageLayout, RawHandle, TrackedObject};
use slotmap::{new_key_type, SlotMap};

use crate::error::{Result, TrackError};
use crate::grid::SubresourceGrid;

new_key_type! {
    /// Generational key into a [`StateTable`] row.
    pub struct StateKey;
}

/// Creation-time facts about an image the trackers and the capture pass need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub layers: u32,
    pub levels: u32,
    /// Total payload size across all subresources, in bytes.
    pub bytes: u64,
    pub initial_layout: ImageLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub bytes: u64,
    pub usage: BufferUsage,
}

/// Authoritative state held for one object, by category.
#[derive(Debug, Clone)]
pub enum ObjectState {
    Image {
        desc: ImageDesc,
        grid: SubresourceGrid<ImageLayout>,
    },
    Buffer {
        desc: BufferDesc,
    },
    Fence {
        signaled: bool,
    },
    Semaphore {
        signaled: bool,
    },
    /// Kinds tracked for identity only.
    Opaque,
}

#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub object: TrackedObject,
    pub state: ObjectState,
    /// Bumped each time a submitted operation stream wrote the object's
    /// contents.
    pub content_epoch: u64,
}

/// The single authoritative registry of tracked-object state.
///
/// Rows are addressed by generational [`StateKey`]; raw API handles resolve
/// through a secondary index. Other components hold keys or handles, never
/// references, so object destruction is a plain [`StateTable::unregister`]
/// and anything stale simply fails lookup.
#[derive(Debug, Default)]
pub struct StateTable {
    rows: SlotMap<StateKey, ObjectEntry>,
    by_handle: HashMap<RawHandle, StateKey>,
}

impl StateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_image(&mut self, object: TrackedObject, desc: ImageDesc) -> Result<StateKey> {
        let grid = SubresourceGrid::new(desc.layers, desc.levels, desc.initial_layout)?;
        self.insert(object, ObjectState::Image { desc, grid })
    }

    pub fn register_buffer(&mut self, object: TrackedObject, desc: BufferDesc) -> Result<StateKey> {
        self.insert(object, ObjectState::Buffer { desc })
    }

    pub fn register_fence(&mut self, object: TrackedObject, signaled: bool) -> Result<StateKey> {
        self.insert(object, ObjectState::Fence { signaled })
    }

    pub fn register_semaphore(
        &mut self,
        object: TrackedObject,
        signaled: bool,
    ) -> Result<StateKey> {
        self.insert(object, ObjectState::Semaphore { signaled })
    }

    pub fn register_opaque(&mut self, object: TrackedObject) -> Result<StateKey> {
        self.insert(object, ObjectState::Opaque)
    }

    fn insert(&mut self, object: TrackedObject, state: ObjectState) -> Result<StateKey> {
        if self.by_handle.contains_key(&object.handle) {
            return Err(TrackError::AlreadyRegistered(object.handle));
        }
        let key = self.rows.insert(ObjectEntry {
            object,
            state,
            content_epoch: 0,
        });
        self.by_handle.insert(object.handle, key);
        Ok(key)
    }

    /// Removes the row for `handle`. Keys held elsewhere become stale and
    /// fail subsequent lookups; they are never reused for another object.
    pub fn unregister(&mut self, handle: RawHandle) -> Result<TrackedObject> {
        let key = self
            .by_handle
            .remove(&handle)
            .ok_or(TrackError::UnknownHandle(handle))?;
        let entry = self.rows.remove(key).ok_or(TrackError::StaleKey)?;
        Ok(entry.object)
    }

    pub fn contains(&self, handle: RawHandle) -> bool {
        self.by_handle.contains_key(&handle)
    }

    pub fn key_of(&self, handle: RawHandle) -> Result<StateKey> {
        self.by_handle
            .get(&handle)
            .copied()
            .ok_or(TrackError::UnknownHandle(handle))
    }

    pub fn entry(&self, key: StateKey) -> Result<&ObjectEntry> {
        self.rows.get(key).ok_or(TrackError::StaleKey)
    }

    pub fn entry_by_handle(&self, handle: RawHandle) -> Result<&ObjectEntry> {
        self.entry(self.key_of(handle)?)
    }

    fn entry_mut(&mut self, handle: RawHandle) -> Result<&mut ObjectEntry> {
        let key = self.key_of(handle)?;
        self.rows.get_mut(key).ok_or(TrackError::StaleKey)
    }

    pub fn object(&self, handle: RawHandle) -> Result<TrackedObject> {
        Ok(self.entry_by_handle(handle)?.object)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (StateKey, &ObjectEntry)> {
        self.rows.iter()
    }

    pub fn image_desc(&self, handle: RawHandle) -> Result<ImageDesc> {
        match &self.entry_by_handle(handle)?.state {
            ObjectState::Image { desc, .. } => Ok(*desc),
            _ => Err(TrackError::WrongKind {
                handle,
                expected: "image",
            }),
        }
    }

    pub fn image_grid(&self, handle: RawHandle) -> Result<&SubresourceGrid<ImageLayout>> {
        match &self.entry_by_handle(handle)?.state {
            ObjectState::Image { grid, .. } => Ok(grid),
            _ => Err(TrackError::WrongKind {
                handle,
                expected: "image",
            }),
        }
    }

    pub fn image_grid_mut(
        &mut self,
        handle: RawHandle,
    ) -> Result<&mut SubresourceGrid<ImageLayout>> {
        match &mut self.entry_mut(handle)?.state {
            ObjectState::Image { grid, .. } => Ok(grid),
            _ => Err(TrackError::WrongKind {
                handle,
                expected: "image",
            }),
        }
    }

    pub fn buffer_desc(&self, handle: RawHandle) -> Result<BufferDesc> {
        match &self.entry_by_handle(handle)?.state {
            ObjectState::Buffer { desc } => Ok(*desc),
            _ => Err(TrackError::WrongKind {
                handle,
                expected: "buffer",
            }),
        }
    }

    pub fn fence_signaled(&self, handle: RawHandle) -> Result<bool> {
        match self.entry_by_handle(handle)?.state {
            ObjectState::Fence { signaled } => Ok(signaled),
            _ => Err(TrackError::WrongKind {
                handle,
                expected: "fence",
            }),
        }
    }

    pub fn set_fence_signaled(&mut self, handle: RawHandle, value: bool) -> Result<()> {
        match &mut self.entry_mut(handle)?.state {
            ObjectState::Fence { signaled } => {
                *signaled = value;
                Ok(())
            }
            _ => Err(TrackError::WrongKind {
                handle,
                expected: "fence",
            }),
        }
    }

    pub fn semaphore_signaled(&self, handle: RawHandle) -> Result<bool> {
        match self.entry_by_handle(handle)?.state {
            ObjectState::Semaphore { signaled } => Ok(signaled),
            _ => Err(TrackError::WrongKind {
                handle,
                expected: "semaphore",
            }),
        }
    }

    pub fn set_semaphore_signaled(&mut self, handle: RawHandle, value: bool) -> Result<()> {
        match &mut self.entry_mut(handle)?.state {
            ObjectState::Semaphore { signaled } => {
                *signaled = value;
                Ok(())
            }
            _ => Err(TrackError::WrongKind {
                handle,
                expected: "semaphore",
            }),
        }
    }

    pub fn content_epoch(&self, handle: RawHandle) -> Result<u64> {
        Ok(self.entry_by_handle(handle)?.content_epoch)
    }

    pub(crate) fn bump_content_epoch(&mut self, handle: RawHandle) -> Result<()> {
        let entry = self.entry_mut(handle)?;
        entry.content_epoch += 1;
        Ok(())
    }
}
