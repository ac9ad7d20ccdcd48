//! On-disk layout of a restore point directory.
//!
//! A restore point is a directory: `manifest.bin` lists every captured
//! object in dependency order, `addresses.bin` records the device addresses
//! opaque payloads may embed, and each object contributes a metadata file
//! `<Kind>/<handle>` plus, for bulk-payload kinds, a raw `<Kind>/<handle>.bin`
//! next to it.

use std::fmt;
use std::path::{Path, PathBuf};

use cryo_types::{ObjectKind, RawHandle};

/// First eight bytes of every sectioned file.
pub const MAGIC: [u8; 8] = *b"CRYORSTP";

/// Bumped on any incompatible change to the sectioned files.
pub const VERSION: u16 = 1;

/// Byte order marker; only little-endian files are produced or accepted.
pub const LITTLE_ENDIAN: u8 = 0x01;

pub const MANIFEST_FILE: &str = "manifest.bin";
pub const ADDRESSES_FILE: &str = "addresses.bin";

/// Identifies one section of a sectioned file. Readers skip ids they do not
/// know, so new sections can be added without a version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionId(pub u32);

impl SectionId {
    pub const OBJECTS: SectionId = SectionId(1);
    pub const ADDRESSES: SectionId = SectionId(2);

    pub fn name(self) -> &'static str {
        match self {
            SectionId::OBJECTS => "objects",
            SectionId::ADDRESSES => "addresses",
            _ => "unknown",
        }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Where an object's creation metadata lives inside a restore point.
pub fn metadata_path(dir: &Path, kind: ObjectKind, handle: RawHandle) -> PathBuf {
    dir.join(kind.type_dir()).join(handle.to_hex())
}

/// Where an object's raw contents live, for kinds that carry any.
pub fn payload_path(dir: &Path, kind: ObjectKind, handle: RawHandle) -> PathBuf {
    dir.join(kind.type_dir()).join(format!("{}.bin", handle.to_hex()))
}
