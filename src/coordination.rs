//! Coordination numbers and the radial distribution function.
//!
//! Counts the neighbors of every particle within a cutoff radius and
//! accumulates the pair distances into a histogram, normalized to the
//! radial distribution function g(r) of an ideal gas at the same density.

use nalgebra::Vector3;
use rayon::prelude::*;
use tracing::info_span;

use crate::cell::SimulationCell;
use crate::config;
use crate::cutoff::{CutoffError, CutoffNeighborFinder};
use crate::task::{ComputeContext, Outcome};

/// Default number of histogram bins between zero and the cutoff.
pub const DEFAULT_RDF_BIN_COUNT: usize = 400;

/// Parameters of a coordination analysis run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CoordinationAnalysis {
    /// Neighbor counting radius.
    pub cutoff: f64,
    /// Resolution of the distance histogram.
    pub rdf_bin_count: usize,
}

/// Per-particle coordination numbers plus the sampled g(r) table.
/// `rdf_r[i]` is the lower edge of bin `i`, `rdf_g[i]` its normalized value.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoordinationResults {
    pub coordination_numbers: Vec<u32>,
    pub rdf_r: Vec<f64>,
    pub rdf_g: Vec<f64>,
}

impl CoordinationAnalysis {
    pub fn new(cutoff: f64) -> Self {
        Self {
            cutoff,
            rdf_bin_count: DEFAULT_RDF_BIN_COUNT,
        }
    }

    /// Counts neighbors and samples g(r) in one pass over the particles.
    /// Each thread accumulates a private histogram; the partials are summed
    /// at the end.
    pub fn evaluate(
        &self,
        positions: &[Vector3<f64>],
        cell: &SimulationCell,
        ctx: &ComputeContext,
    ) -> Result<Outcome<CoordinationResults>, CutoffError> {
        let _span = info_span!(
            "coordination::evaluate",
            n_atoms = positions.len(),
            cutoff = self.cutoff
        )
        .entered();
        let finder = CutoffNeighborFinder::prepare(self.cutoff, positions, cell)?;
        let bins = self.rdf_bin_count.max(1);
        // The epsilon keeps distances exactly at the cutoff inside the last
        // bin.
        let bin_size = (self.cutoff + 1e-12) / bins as f64;

        let batch = config::get_progress_batch_size();
        let num_batches = positions.len().div_ceil(batch);
        let num_threads = rayon::current_num_threads();
        let batches_per_task =
            (num_batches / (num_threads * config::get_parallel_tasks_per_thread())).max(1);

        let mut coordination = vec![0u32; positions.len()];
        let histogram = coordination
            .par_chunks_mut(batch)
            .enumerate()
            .with_min_len(batches_per_task)
            .fold(
                || vec![0u64; bins],
                |mut hist, (batch_idx, chunk)| {
                    if ctx.is_canceled() {
                        return hist;
                    }
                    let start = batch_idx * batch;
                    for (k, slot) in chunk.iter_mut().enumerate() {
                        let mut count = 0u32;
                        for nb in finder.neighbors_of(start + k) {
                            count += 1;
                            let bin = ((nb.distance_sq.sqrt() / bin_size) as usize).min(bins - 1);
                            hist[bin] += 1;
                        }
                        *slot = count;
                    }
                    ctx.add_progress(chunk.len());
                    hist
                },
            )
            .reduce(
                || vec![0u64; bins],
                |mut acc, partial| {
                    for (total, value) in acc.iter_mut().zip(partial) {
                        *total += value;
                    }
                    acc
                },
            );

        if ctx.is_canceled() {
            return Ok(Outcome::Canceled);
        }

        // Normalize against an ideal gas of the same density: the expected
        // pair count in a spherical shell is 4/3 pi rho N (r2^3 - r1^3).
        let num_particles = positions.len() as f64;
        let density = num_particles / cell.volume();
        let normalization = 4.0 / 3.0 * std::f64::consts::PI * density * num_particles;
        let step = self.cutoff / bins as f64;
        let mut rdf_r = Vec::with_capacity(bins);
        let mut rdf_g = Vec::with_capacity(bins);
        for (i, &count) in histogram.iter().enumerate() {
            let r1 = step * i as f64;
            let r2 = r1 + step;
            rdf_r.push(r1);
            rdf_g.push(count as f64 / (normalization * (r2.powi(3) - r1.powi(3))));
        }

        Ok(Outcome::Completed(CoordinationResults {
            coordination_numbers: coordination,
            rdf_r,
            rdf_g,
        }))
    }
}
