use cryo_types::{
    ResolvedRange, Subresource, SubresourceRange, REMAINING_LAYERS, REMAINING_LEVELS,
};

use crate::error::{Result, TrackError};

/// Dense per-subresource state grid for one image-like object.
///
/// Cell `(layer, level)` lives at index `layer * levels + level`. Point
/// access is strict, range access clips: a range reaching past either
/// dimension quietly covers only the in-bounds part, mirroring the host
/// API's "remaining layers/levels" sentinel semantics. Only arithmetic
/// overflow in `base + count` is an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubresourceGrid<S> {
    layers: u32,
    levels: u32,
    cells: Vec<S>,
}

impl<S: Copy> SubresourceGrid<S> {
    pub fn new(layers: u32, levels: u32, initial: S) -> Result<Self> {
        let len = (layers as usize)
            .checked_mul(levels as usize)
            .filter(|len| *len > 0)
            .ok_or(TrackError::InvalidDimensions { layers, levels })?;
        Ok(Self {
            layers,
            levels,
            cells: vec![initial; len],
        })
    }

    pub fn layers(&self) -> u32 {
        self.layers
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        // Construction rejects zero dimensions, so a grid always has cells.
        self.cells.is_empty()
    }

    fn index(&self, sub: Subresource) -> Result<usize> {
        if sub.layer >= self.layers || sub.level >= self.levels {
            return Err(TrackError::OutOfBounds(sub));
        }
        Ok(sub.layer as usize * self.levels as usize + sub.level as usize)
    }

    pub fn get(&self, sub: Subresource) -> Result<S> {
        Ok(self.cells[self.index(sub)?])
    }

    pub fn set(&mut self, sub: Subresource, value: S) -> Result<()> {
        let i = self.index(sub)?;
        self.cells[i] = value;
        Ok(())
    }

    /// Clips `range` to this grid's bounds, resolving the remaining-count
    /// sentinels against the actual dimensions. The result may be empty.
    pub fn resolve(&self, range: SubresourceRange) -> Result<ResolvedRange> {
        let (base_layer, layer_count) =
            resolve_axis(range.base_layer, range.layer_count, self.layers, REMAINING_LAYERS)?;
        let (base_level, level_count) =
            resolve_axis(range.base_level, range.level_count, self.levels, REMAINING_LEVELS)?;
        Ok(ResolvedRange {
            base_layer,
            layer_count,
            base_level,
            level_count,
        })
    }

    /// Sets every cell the clipped `range` covers; a fully out-of-bounds or
    /// zero-sized range is a no-op, not an error.
    pub fn set_range(&mut self, range: SubresourceRange, value: S) -> Result<()> {
        let resolved = self.resolve(range)?;
        for sub in resolved.iter() {
            let i = sub.layer as usize * self.levels as usize + sub.level as usize;
            self.cells[i] = value;
        }
        Ok(())
    }

    /// Reads every cell the clipped `range` covers, in layer-major order.
    pub fn get_range(&self, range: SubresourceRange) -> Result<Vec<S>> {
        let resolved = self.resolve(range)?;
        let mut out = Vec::with_capacity(resolved.cell_count());
        for sub in resolved.iter() {
            out.push(self.cells[sub.layer as usize * self.levels as usize + sub.level as usize]);
        }
        Ok(out)
    }

    /// Visits every cell the clipped `range` covers, each exactly once, in
    /// layer-major order.
    pub fn for_each_in(
        &self,
        range: SubresourceRange,
        mut f: impl FnMut(Subresource, S),
    ) -> Result<()> {
        let resolved = self.resolve(range)?;
        for sub in resolved.iter() {
            f(
                sub,
                self.cells[sub.layer as usize * self.levels as usize + sub.level as usize],
            );
        }
        Ok(())
    }

    pub fn fill(&mut self, value: S) {
        self.cells.fill(value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Subresource, S)> + '_ {
        self.cells.iter().enumerate().map(move |(i, s)| {
            let layer = (i / self.levels as usize) as u32;
            let level = (i % self.levels as usize) as u32;
            (Subresource::new(layer, level), *s)
        })
    }

    pub fn cells(&self) -> &[S] {
        &self.cells
    }
}

impl<S: Copy + PartialEq> SubresourceGrid<S> {
    /// The single state every cell holds, if the grid is uniform.
    pub fn uniform(&self) -> Option<S> {
        let first = *self.cells.first()?;
        self.cells.iter().all(|s| *s == first).then_some(first)
    }
}

fn resolve_axis(base: u32, count: u32, dim: u32, sentinel: u32) -> Result<(u32, u32)> {
    if count == sentinel {
        return Ok((base.min(dim), dim.saturating_sub(base)));
    }
    let end = base
        .checked_add(count)
        .ok_or(TrackError::RangeOverflow { base, count })?;
    let lo = base.min(dim);
    let hi = end.min(dim);
    Ok((lo, hi - lo))
}
