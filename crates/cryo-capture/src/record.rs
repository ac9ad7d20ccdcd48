use std::io::{Read, Write};

use cryo_types::{ContextHandle, ObjectKind, RawHandle};

use crate::error::{CaptureError, Result};
use crate::wire::{ReadLe, WriteLe};

/// One row of the manifest: enough to re-create an object shell before its
/// metadata and payload are consulted.
///
/// Rows are stored in dependency order, parents ahead of the objects that
/// reference them, so a restore can walk the manifest front to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreObjectRecord {
    pub kind: ObjectKind,
    pub handle: RawHandle,
    pub owner: ContextHandle,
    /// Handles of the objects this one references, as captured.
    pub deps: Vec<RawHandle>,
}

impl RestoreObjectRecord {
    pub(crate) fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_u32_le(self.kind.as_u32())?;
        w.write_u64_le(self.handle.0)?;
        w.write_u64_le(self.owner.0)?;
        let count = u32::try_from(self.deps.len())
            .map_err(|_| CaptureError::Corrupt("dependency list too long"))?;
        w.write_u32_le(count)?;
        for dep in &self.deps {
            w.write_u64_le(dep.0)?;
        }
        Ok(())
    }

    pub(crate) fn read_from(r: &mut impl Read) -> Result<Self> {
        let kind = ObjectKind::from_u32(r.read_u32_le()?)
            .ok_or(CaptureError::Corrupt("unknown object kind"))?;
        let handle = RawHandle(r.read_u64_le()?);
        let owner = ContextHandle(r.read_u64_le()?);
        let count = r.read_u32_le()? as usize;
        // Deps are parsed one by one, so a corrupt count fails on read
        // instead of reserving a huge vector up front.
        let mut deps = Vec::new();
        for _ in 0..count {
            deps.push(RawHandle(r.read_u64_le()?));
        }
        Ok(Self {
            kind,
            handle,
            owner,
            deps,
        })
    }
}
