//! Shared vocabulary for the cryo restore-point toolkit.
//!
//! Everything here is plain data: opaque handles, object categories, image
//! layout states and subresource addressing. No I/O and no driver calls —
//! those live behind the `cryo-device` seam.

mod flags;
mod subresource;

pub use crate::flags::BufferUsage;
pub use crate::subresource::{
    ImageLayout, ResolvedRange, Subresource, SubresourceRange, REMAINING_LAYERS, REMAINING_LEVELS,
};

/// Opaque identity of one API object within a capture session.
///
/// The value is whatever the underlying API hands out (a dispatchable or
/// non-dispatchable 64-bit handle); cryo never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Fixed-width hex form used for per-object file names.
    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }
}

impl core::fmt::Display for RawHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Identity of the dispatchable context (device) that owns an object.
///
/// Used as the grouping key for tracked objects and per-worker resource
/// bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle(pub u64);

impl ContextHandle {
    pub const NULL: ContextHandle = ContextHandle(0);
}

impl core::fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ctx:0x{:016x}", self.0)
    }
}

/// Closed set of object categories a capture session can encounter.
///
/// Extending the capture to a new category means adding a variant here and
/// updating every exhaustive match; there is deliberately no catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ObjectKind {
    Device = 1,
    Queue = 2,
    DeviceMemory = 3,
    Buffer = 4,
    Image = 5,
    ImageView = 6,
    Sampler = 7,
    ShaderModule = 8,
    Pipeline = 9,
    DescriptorSet = 10,
    CommandBuffer = 11,
    Semaphore = 12,
    Fence = 13,
    QueryPool = 14,
    AccelerationStructure = 15,
    DebugMessenger = 16,
}

impl ObjectKind {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => ObjectKind::Device,
            2 => ObjectKind::Queue,
            3 => ObjectKind::DeviceMemory,
            4 => ObjectKind::Buffer,
            5 => ObjectKind::Image,
            6 => ObjectKind::ImageView,
            7 => ObjectKind::Sampler,
            8 => ObjectKind::ShaderModule,
            9 => ObjectKind::Pipeline,
            10 => ObjectKind::DescriptorSet,
            11 => ObjectKind::CommandBuffer,
            12 => ObjectKind::Semaphore,
            13 => ObjectKind::Fence,
            14 => ObjectKind::QueryPool,
            15 => ObjectKind::AccelerationStructure,
            16 => ObjectKind::DebugMessenger,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Directory name under which this kind's per-object files are written.
    pub fn type_dir(self) -> &'static str {
        match self {
            ObjectKind::Device => "Device",
            ObjectKind::Queue => "Queue",
            ObjectKind::DeviceMemory => "DeviceMemory",
            ObjectKind::Buffer => "Buffer",
            ObjectKind::Image => "Image",
            ObjectKind::ImageView => "ImageView",
            ObjectKind::Sampler => "Sampler",
            ObjectKind::ShaderModule => "ShaderModule",
            ObjectKind::Pipeline => "Pipeline",
            ObjectKind::DescriptorSet => "DescriptorSet",
            ObjectKind::CommandBuffer => "CommandBuffer",
            ObjectKind::Semaphore => "Semaphore",
            ObjectKind::Fence => "Fence",
            ObjectKind::QueryPool => "QueryPool",
            ObjectKind::AccelerationStructure => "AccelerationStructure",
            ObjectKind::DebugMessenger => "DebugMessenger",
        }
    }

    /// Diagnostic-only kinds exist at capture time but are meaningless to
    /// restore; the orchestrator drops them from the manifest.
    pub fn is_diagnostic(self) -> bool {
        matches!(self, ObjectKind::DebugMessenger)
    }

    /// Kinds whose device-resident contents are downloaded as a bulk payload
    /// (`<TypeName>/<hex(handle)>.bin`).
    pub fn has_bulk_payload(self) -> bool {
        matches!(
            self,
            ObjectKind::Buffer | ObjectKind::Image | ObjectKind::AccelerationStructure
        )
    }
}

impl core::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.type_dir())
    }
}

/// One object discovered while walking the live graph.
///
/// Immutable once created; the capture session, not the application, owns
/// these descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackedObject {
    pub kind: ObjectKind,
    pub handle: RawHandle,
    pub owner: ContextHandle,
}

impl TrackedObject {
    pub fn new(kind: ObjectKind, handle: RawHandle, owner: ContextHandle) -> Self {
        Self {
            kind,
            handle,
            owner,
        }
    }
}

impl core::fmt::Display for TrackedObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.kind, self.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_kind_round_trips_through_u32() {
        for v in 0..64u32 {
            if let Some(kind) = ObjectKind::from_u32(v) {
                assert_eq!(kind.as_u32(), v);
            }
        }
        assert_eq!(ObjectKind::from_u32(0), None);
        assert_eq!(ObjectKind::from_u32(9999), None);
    }

    #[test]
    fn diagnostic_kinds_never_carry_payloads() {
        for v in 0..64u32 {
            if let Some(kind) = ObjectKind::from_u32(v) {
                if kind.is_diagnostic() {
                    assert!(!kind.has_bulk_payload(), "{kind} is diagnostic but has payload");
                }
            }
        }
    }

    #[test]
    fn handle_hex_is_fixed_width() {
        assert_eq!(RawHandle(0x1a).to_hex(), "000000000000001a");
        assert_eq!(RawHandle(u64::MAX).to_hex(), "ffffffffffffffff");
    }
}
