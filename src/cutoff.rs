use nalgebra::Vector3;
use thiserror::Error;
use tracing::{debug, info_span};

use crate::cell::SimulationCell;
use crate::config;

/// List terminator for the per-bin linked lists.
const NIL: u32 = u32::MAX;

#[derive(Error, Debug)]
pub enum CutoffError {
    #[error("neighbor cutoff radius must be positive")]
    InvalidCutoff,
    #[error("periodic simulation cell is too small or the cutoff radius is too large")]
    CellTooSmall,
}

/// One binned particle: its position wrapped into the home image and the
/// whole-cell shifts that wrapping applied.
#[derive(Clone, Debug)]
struct BinEntry {
    pos: Vector3<f64>,
    bin: Vector3<i32>,
    wrap: Vector3<i8>,
}

/// A neighbor within the cutoff radius.
///
/// `delta` points from the query position to the neighbor image and satisfies
/// `delta == positions[index] + h * pbc_shift - query` in the caller's
/// original (unwrapped) coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CutoffNeighbor {
    pub index: usize,
    pub delta: Vector3<f64>,
    pub distance_sq: f64,
    pub pbc_shift: Vector3<i32>,
}

/// Grid-based neighbor finder for fixed-radius queries.
///
/// Particles are sorted into a 3D grid of bins sized relative to the cutoff
/// radius. Periodic images are never materialized; instead each query walks a
/// stencil of bin offsets wide enough to cover the cutoff sphere, wrapping
/// bin coordinates (and accumulating image shifts) on periodic axes.
pub struct CutoffNeighborFinder {
    cutoff: f64,
    cutoff_sq: f64,
    cell: SimulationCell,
    num_bins: Vector3<i32>,
    stencil: Vec<Vector3<i32>>,
    /// bin_heads[bx + nx*(by + ny*bz)] = first entry index or NIL.
    bin_heads: Vec<u32>,
    /// next[i] = next entry in the same bin, NIL at the tail.
    next: Vec<u32>,
    entries: Vec<BinEntry>,
}

impl CutoffNeighborFinder {
    /// Builds the bin grid. Fails if the cutoff is not positive or if a
    /// periodic axis would need a wider stencil than the configured cap.
    pub fn prepare(
        cutoff: f64,
        positions: &[Vector3<f64>],
        cell: &SimulationCell,
    ) -> Result<Self, CutoffError> {
        let _span = info_span!("CutoffNeighborFinder::prepare", n_atoms = positions.len()).entered();
        if cutoff <= 0.0 {
            return Err(CutoffError::InvalidCutoff);
        }

        // 1. Size the grid: one bin per cutoff length along each axis where
        // possible, capped per axis and in total bin count.
        let bin_limit = config::get_bin_count_limit();
        let widths = cell.perpendicular_widths();
        let mut num_bins = Vector3::new(0i32, 0i32, 0i32);
        for dim in 0..3 {
            num_bins[dim] = ((widths[dim] / cutoff).floor() as i64)
                .clamp(1, bin_limit as i64) as i32;
        }
        let total_limit = bin_limit * bin_limit * bin_limit;
        let total = num_bins.x as usize * num_bins.y as usize * num_bins.z as usize;
        if total > total_limit {
            let factor = (total_limit as f64 / total as f64).cbrt();
            for dim in 0..3 {
                num_bins[dim] = ((num_bins[dim] as f64 * factor) as i32).max(1);
            }
        }

        // 2. Derive the stencil extent: enough bin layers along each cell
        // face normal to cover the cutoff sphere from anywhere in a home bin.
        let mut stencil_radius = Vector3::new(0i32, 0i32, 0i32);
        for dim in 0..3 {
            let bin_thickness = widths[dim] / num_bins[dim] as f64;
            let needed = (cutoff / bin_thickness).ceil() as i64;
            if cell.is_periodic(dim) {
                if needed > config::get_max_stencil_radius() as i64 {
                    return Err(CutoffError::CellTooSmall);
                }
                stencil_radius[dim] = needed as i32;
            } else {
                // Offsets past the last bin can never land in a populated bin.
                stencil_radius[dim] = needed.min(num_bins[dim] as i64) as i32;
            }
        }
        let mut stencil = Vec::with_capacity(
            ((2 * stencil_radius.x + 1)
                * (2 * stencil_radius.y + 1)
                * (2 * stencil_radius.z + 1)) as usize,
        );
        for dx in -stencil_radius.x..=stencil_radius.x {
            for dy in -stencil_radius.y..=stencil_radius.y {
                for dz in -stencil_radius.z..=stencil_radius.z {
                    stencil.push(Vector3::new(dx, dy, dz));
                }
            }
        }

        // 3. Wrap and bin every particle, threading the per-bin lists.
        let total_bins = num_bins.x as usize * num_bins.y as usize * num_bins.z as usize;
        let mut bin_heads = vec![NIL; total_bins];
        let mut next = vec![NIL; positions.len()];
        let mut entries = Vec::with_capacity(positions.len());
        for (i, pos) in positions.iter().enumerate() {
            let frac = cell.to_fractional(pos);
            let mut bin = Vector3::new(0i32, 0i32, 0i32);
            let mut wrap = Vector3::new(0i8, 0i8, 0i8);
            let mut wrapped = *pos;
            for dim in 0..3 {
                let raw = (frac[dim] * num_bins[dim] as f64).floor() as i64;
                if cell.is_periodic(dim) {
                    let n = num_bins[dim] as i64;
                    let shift = -raw.div_euclid(n);
                    if shift < i8::MIN as i64 || shift > i8::MAX as i64 {
                        return Err(CutoffError::CellTooSmall);
                    }
                    bin[dim] = raw.rem_euclid(n) as i32;
                    wrap[dim] = shift as i8;
                    if shift != 0 {
                        wrapped += shift as f64 * cell.h().column(dim);
                    }
                } else {
                    bin[dim] = raw.clamp(0, num_bins[dim] as i64 - 1) as i32;
                }
            }
            next[i] = bin_heads[Self::bin_index(&num_bins, &bin)];
            bin_heads[Self::bin_index(&num_bins, &bin)] = i as u32;
            entries.push(BinEntry {
                pos: wrapped,
                bin,
                wrap,
            });
        }

        debug!(
            bins = ?num_bins.as_slice(),
            stencil = stencil.len(),
            "cutoff grid ready"
        );
        Ok(Self {
            cutoff,
            cutoff_sq: cutoff * cutoff,
            cell: cell.clone(),
            num_bins,
            stencil,
            bin_heads,
            next,
            entries,
        })
    }

    fn bin_index(num_bins: &Vector3<i32>, bin: &Vector3<i32>) -> usize {
        bin.x as usize
            + num_bins.x as usize * (bin.y as usize + num_bins.y as usize * bin.z as usize)
    }

    pub fn cutoff_radius(&self) -> f64 {
        self.cutoff
    }

    pub fn cutoff_radius_squared(&self) -> f64 {
        self.cutoff_sq
    }

    pub fn num_particles(&self) -> usize {
        self.entries.len()
    }

    /// Lazily iterates all neighbors of particle `index` within the cutoff.
    /// The particle itself appears only as a periodic image (nonzero shift).
    pub fn neighbors_of(&self, index: usize) -> CutoffNeighborIter<'_> {
        let entry = &self.entries[index];
        CutoffNeighborIter::new(
            self,
            entry.pos,
            entry.bin,
            Vector3::new(
                entry.wrap.x as i32,
                entry.wrap.y as i32,
                entry.wrap.z as i32,
            ),
            Some(index),
        )
    }

    /// Lazily iterates all particles within the cutoff of an arbitrary point.
    /// A particle exactly at the query point is reported with distance zero.
    pub fn neighbors_of_point(&self, point: Vector3<f64>) -> CutoffNeighborIter<'_> {
        let frac = self.cell.to_fractional(&point);
        let mut bin = Vector3::new(0i32, 0i32, 0i32);
        let mut wrap = Vector3::new(0i32, 0i32, 0i32);
        let mut wrapped = point;
        for dim in 0..3 {
            let raw = (frac[dim] * self.num_bins[dim] as f64).floor() as i64;
            if self.cell.is_periodic(dim) {
                let n = self.num_bins[dim] as i64;
                let shift = -raw.div_euclid(n);
                bin[dim] = raw.rem_euclid(n) as i32;
                wrap[dim] = shift.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                if shift != 0 {
                    wrapped += shift as f64 * self.cell.h().column(dim);
                }
            } else {
                bin[dim] = raw.clamp(0, self.num_bins[dim] as i64 - 1) as i32;
            }
        }
        CutoffNeighborIter::new(self, wrapped, bin, wrap, None)
    }
}

/// Lazy walk over the stencil offsets around one query point, then over the
/// linked list inside each offset bin.
pub struct CutoffNeighborIter<'a> {
    finder: &'a CutoffNeighborFinder,
    center: Vector3<f64>,
    center_bin: Vector3<i32>,
    center_wrap: Vector3<i32>,
    exclude: Option<usize>,
    stencil_pos: usize,
    // State of the bin currently being walked.
    cursor: u32,
    shifted_center: Vector3<f64>,
    stencil_shift: Vector3<i32>,
}

impl<'a> CutoffNeighborIter<'a> {
    fn new(
        finder: &'a CutoffNeighborFinder,
        center: Vector3<f64>,
        center_bin: Vector3<i32>,
        center_wrap: Vector3<i32>,
        exclude: Option<usize>,
    ) -> Self {
        Self {
            finder,
            center,
            center_bin,
            center_wrap,
            exclude,
            stencil_pos: 0,
            cursor: NIL,
            shifted_center: center,
            stencil_shift: Vector3::zeros(),
        }
    }

    /// Advances to the next stencil offset that maps to a real bin. Returns
    /// false once the stencil is exhausted.
    fn advance_bin(&mut self) -> bool {
        let finder = self.finder;
        'stencil: while self.stencil_pos < finder.stencil.len() {
            let offset = finder.stencil[self.stencil_pos];
            self.stencil_pos += 1;

            let mut bin = Vector3::new(0i32, 0i32, 0i32);
            let mut shift = Vector3::new(0i32, 0i32, 0i32);
            for dim in 0..3 {
                let raw = self.center_bin[dim] + offset[dim];
                if finder.cell.is_periodic(dim) {
                    let (b, s) = fold_bin(raw, finder.num_bins[dim]);
                    bin[dim] = b;
                    shift[dim] = s;
                } else {
                    if raw < 0 || raw >= finder.num_bins[dim] {
                        continue 'stencil;
                    }
                    bin[dim] = raw;
                }
            }

            let head = finder.bin_heads[CutoffNeighborFinder::bin_index(&finder.num_bins, &bin)];
            if head == NIL {
                continue;
            }
            self.cursor = head;
            self.stencil_shift = shift;
            // Shifting the query center by whole cells makes neighbor deltas
            // exact without touching the stored positions.
            self.shifted_center = self.center;
            for dim in 0..3 {
                if shift[dim] != 0 {
                    self.shifted_center -= shift[dim] as f64 * finder.cell.h().column(dim);
                }
            }
            return true;
        }
        false
    }
}

impl Iterator for CutoffNeighborIter<'_> {
    type Item = CutoffNeighbor;

    fn next(&mut self) -> Option<CutoffNeighbor> {
        let finder = self.finder;
        loop {
            if self.cursor == NIL && !self.advance_bin() {
                return None;
            }
            let index = self.cursor as usize;
            let entry = &finder.entries[index];
            self.cursor = finder.next[index];

            let delta = entry.pos - self.shifted_center;
            let distance_sq = delta.norm_squared();
            if distance_sq > finder.cutoff_sq {
                continue;
            }
            if self.exclude == Some(index) && self.stencil_shift == Vector3::zeros() {
                continue;
            }
            let pbc_shift = Vector3::new(
                entry.wrap.x as i32 + self.stencil_shift.x - self.center_wrap.x,
                entry.wrap.y as i32 + self.stencil_shift.y - self.center_wrap.y,
                entry.wrap.z as i32 + self.stencil_shift.z - self.center_wrap.z,
            );
            return Some(CutoffNeighbor {
                index,
                delta,
                distance_sq,
                pbc_shift,
            });
        }
    }
}

/// Folds a raw bin coordinate into [0, count) and reports how many whole
/// cells the fold crossed.
fn fold_bin(raw: i32, count: i32) -> (i32, i32) {
    (raw.rem_euclid(count), raw.div_euclid(count))
}
