/// Sentinel meaning "every array layer from `base_layer` to the end".
pub const REMAINING_LAYERS: u32 = u32::MAX;
/// Sentinel meaning "every mip level from `base_level` to the end".
pub const REMAINING_LEVELS: u32 = u32::MAX;

/// Address of a single (array layer, mip level) cell of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subresource {
    pub layer: u32,
    pub level: u32,
}

impl Subresource {
    pub fn new(layer: u32, level: u32) -> Self {
        Self { layer, level }
    }
}

impl core::fmt::Display for Subresource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "layer {} level {}", self.layer, self.level)
    }
}

/// Rectangular window over an image's layer/level grid.
///
/// Counts may be the `REMAINING_*` sentinels, which resolve against the
/// image's actual dimensions at the point of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_layer: u32,
    pub layer_count: u32,
    pub base_level: u32,
    pub level_count: u32,
}

impl SubresourceRange {
    /// One cell.
    pub fn single(layer: u32, level: u32) -> Self {
        Self {
            base_layer: layer,
            layer_count: 1,
            base_level: level,
            level_count: 1,
        }
    }

    /// Every layer and level, whatever the image's dimensions.
    pub fn all() -> Self {
        Self {
            base_layer: 0,
            layer_count: REMAINING_LAYERS,
            base_level: 0,
            level_count: REMAINING_LEVELS,
        }
    }
}

impl Default for SubresourceRange {
    fn default() -> Self {
        Self::all()
    }
}

/// A subresource range with exact counts, already clipped against a known
/// image's bounds. Counts are never sentinels; the range may be empty.
///
/// Produced by resolving a [`SubresourceRange`] against a grid; consumed by
/// anything that needs to walk concrete cells, such as transfer requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub base_layer: u32,
    pub layer_count: u32,
    pub base_level: u32,
    pub level_count: u32,
}

impl ResolvedRange {
    pub fn is_empty(&self) -> bool {
        self.layer_count == 0 || self.level_count == 0
    }

    pub fn cell_count(&self) -> usize {
        self.layer_count as usize * self.level_count as usize
    }

    pub fn contains(&self, sub: Subresource) -> bool {
        sub.layer >= self.base_layer
            && sub.layer - self.base_layer < self.layer_count
            && sub.level >= self.base_level
            && sub.level - self.base_level < self.level_count
    }

    /// Layer-major traversal of every covered cell.
    pub fn iter(&self) -> impl Iterator<Item = Subresource> + '_ {
        let layers = self.base_layer..self.base_layer + self.layer_count;
        let levels = self.base_level..self.base_level + self.level_count;
        layers.flat_map(move |layer| levels.clone().map(move |level| Subresource::new(layer, level)))
    }
}

/// The layout state a subresource can be in on the device.
///
/// Transfers require `TransferSrc`/`TransferDst`; everything else is an
/// application-visible state the tracker records and the copy engine
/// restores after its own transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ImageLayout {
    Undefined = 0,
    General = 1,
    ColorAttachment = 2,
    DepthStencilAttachment = 3,
    ShaderReadOnly = 4,
    TransferSrc = 5,
    TransferDst = 6,
    Preinitialized = 7,
    Present = 8,
}

impl ImageLayout {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ImageLayout::Undefined,
            1 => ImageLayout::General,
            2 => ImageLayout::ColorAttachment,
            3 => ImageLayout::DepthStencilAttachment,
            4 => ImageLayout::ShaderReadOnly,
            5 => ImageLayout::TransferSrc,
            6 => ImageLayout::TransferDst,
            7 => ImageLayout::Preinitialized,
            8 => ImageLayout::Present,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Layouts whose contents are unspecified. A cell in one of these has
    /// nothing meaningful to copy out, and no barrier may name one as its
    /// destination; transfers skip such cells instead of restoring them.
    pub fn is_undefined(self) -> bool {
        matches!(self, ImageLayout::Undefined | ImageLayout::Preinitialized)
    }
}

impl core::fmt::Display for ImageLayout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ImageLayout::Undefined => "undefined",
            ImageLayout::General => "general",
            ImageLayout::ColorAttachment => "color-attachment",
            ImageLayout::DepthStencilAttachment => "depth-stencil-attachment",
            ImageLayout::ShaderReadOnly => "shader-read-only",
            ImageLayout::TransferSrc => "transfer-src",
            ImageLayout::TransferDst => "transfer-dst",
            ImageLayout::Preinitialized => "preinitialized",
            ImageLayout::Present => "present",
        };
        f.write_str(name)
    }
}
