//! Centrosymmetry parameter calculation.
//!
//! The centrosymmetry parameter of Kelchner, Plimpton & Hamilton (Phys. Rev.
//! B 58, 11085) measures the local loss of inversion symmetry around a
//! particle. For a perfect centrosymmetric crystal (FCC, BCC) it is zero;
//! defects such as stacking faults, surfaces and dislocation cores raise it.

use std::cmp::Ordering;

use nalgebra::Vector3;
use thiserror::Error;
use tracing::info_span;

use crate::cell::SimulationCell;
use crate::nearest::{NearestNeighborFinder, NeighborQuery};
use crate::task::{par_map_particles, ComputeContext, Outcome};

/// Largest supported neighbor count.
pub const MAX_CSP_NEIGHBORS: usize = 32;

/// Conventional neighbor count for FCC crystals.
pub const DEFAULT_CSP_NEIGHBORS: usize = 12;

const MAX_PAIR_TERMS: usize = MAX_CSP_NEIGHBORS * (MAX_CSP_NEIGHBORS - 1) / 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CentroSymmetryError {
    #[error("neighbor count for centrosymmetry must be an even number between 2 and 32, got {0}")]
    InvalidNeighborCount(usize),
}

/// Computes the centrosymmetry parameter of every particle using its
/// `num_neighbors` nearest neighbors. `num_neighbors` must be even; 12 is
/// the conventional choice for FCC, 8 for BCC.
pub fn compute(
    num_neighbors: usize,
    positions: &[Vector3<f64>],
    cell: &SimulationCell,
    ctx: &ComputeContext,
) -> Result<Outcome<Vec<f64>>, CentroSymmetryError> {
    if num_neighbors < 2 || num_neighbors > MAX_CSP_NEIGHBORS || num_neighbors % 2 != 0 {
        return Err(CentroSymmetryError::InvalidNeighborCount(num_neighbors));
    }
    let _span = info_span!(
        "centrosymmetry::compute",
        n_atoms = positions.len(),
        num_neighbors
    )
    .entered();
    let finder = NearestNeighborFinder::prepare(num_neighbors, positions, cell);
    Ok(par_map_particles(positions.len(), ctx, |index| {
        compute_csp(&finder, index)
    }))
}

/// Single-particle kernel. Pairs up the neighbors found around `index` so
/// that the sum over |r_i + r_j|^2 is minimized, which the classic greedy
/// selection of the smallest pair terms achieves, and returns that sum.
/// Under-coordinated particles are scored with the pairs that exist; an
/// isolated particle scores zero.
pub fn compute_csp(finder: &NearestNeighborFinder, index: usize) -> f64 {
    let mut query: NeighborQuery<MAX_CSP_NEIGHBORS> = NeighborQuery::new(finder);
    query.find_neighbors(finder.particle_pos(index));
    let results = query.results();
    let num_found = results.len();

    let mut pair_terms = [0.0f64; MAX_PAIR_TERMS];
    let mut num_pairs = 0;
    for i in 0..num_found {
        for j in (i + 1)..num_found {
            pair_terms[num_pairs] = (results[i].delta + results[j].delta).norm_squared();
            num_pairs += 1;
        }
    }

    let num_opposite_pairs = num_found / 2;
    if num_opposite_pairs == 0 {
        return 0.0;
    }
    let terms = &mut pair_terms[..num_pairs];
    if num_opposite_pairs < terms.len() {
        terms.select_nth_unstable_by(num_opposite_pairs - 1, |a, b| {
            a.partial_cmp(b).unwrap_or(Ordering::Equal)
        });
    }
    terms[..num_opposite_pairs].iter().sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fcc_fixture(a: f64, reps: usize) -> (SimulationCell, Vec<Vector3<f64>>) {
        let cell = SimulationCell::orthorhombic(
            Vector3::new(a * reps as f64, a * reps as f64, a * reps as f64),
            Vector3::new(true, true, true),
        )
        .unwrap();
        let basis = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.5, 0.5, 0.0),
            Vector3::new(0.5, 0.0, 0.5),
            Vector3::new(0.0, 0.5, 0.5),
        ];
        let mut positions = Vec::new();
        for i in 0..reps {
            for j in 0..reps {
                for k in 0..reps {
                    for b in &basis {
                        positions.push(Vector3::new(
                            (i as f64 + b.x) * a,
                            (j as f64 + b.y) * a,
                            (k as f64 + b.z) * a,
                        ));
                    }
                }
            }
        }
        (cell, positions)
    }

    #[test]
    fn test_rejects_invalid_neighbor_counts() {
        let (cell, positions) = fcc_fixture(3.6, 2);
        let ctx = ComputeContext::new();
        for bad in [0, 1, 7, 33, 34] {
            assert_eq!(
                compute(bad, &positions, &cell, &ctx).unwrap_err(),
                CentroSymmetryError::InvalidNeighborCount(bad)
            );
        }
    }

    #[test]
    fn test_perfect_fcc_scores_zero() {
        let (cell, positions) = fcc_fixture(3.6, 3);
        let ctx = ComputeContext::new();
        let csp = compute(DEFAULT_CSP_NEIGHBORS, &positions, &cell, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(csp.len(), positions.len());
        for value in csp {
            assert!(value.abs() < 1e-18);
        }
    }

    #[test]
    fn test_perfect_bcc_scores_zero() {
        let a = 2.85;
        let reps = 3;
        let cell = SimulationCell::orthorhombic(
            Vector3::new(a * reps as f64, a * reps as f64, a * reps as f64),
            Vector3::new(true, true, true),
        )
        .unwrap();
        let mut positions = Vec::new();
        for i in 0..reps {
            for j in 0..reps {
                for k in 0..reps {
                    positions.push(Vector3::new(i as f64 * a, j as f64 * a, k as f64 * a));
                    positions.push(Vector3::new(
                        (i as f64 + 0.5) * a,
                        (j as f64 + 0.5) * a,
                        (k as f64 + 0.5) * a,
                    ));
                }
            }
        }
        let ctx = ComputeContext::new();
        let csp = compute(8, &positions, &cell, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        for value in csp {
            assert!(value.abs() < 1e-18);
        }
    }

    #[test]
    fn test_displaced_atom_scores_positive() {
        let (cell, mut positions) = fcc_fixture(3.6, 3);
        positions[17] += Vector3::new(0.4, 0.0, 0.0);
        let ctx = ComputeContext::new();
        let csp = compute(DEFAULT_CSP_NEIGHBORS, &positions, &cell, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        assert!(csp[17] > 0.01);
    }

    #[test]
    fn test_isolated_particle_scores_zero() {
        let cell = SimulationCell::orthorhombic(
            Vector3::new(10.0, 10.0, 10.0),
            Vector3::new(false, false, false),
        )
        .unwrap();
        let positions = vec![Vector3::new(5.0, 5.0, 5.0), Vector3::new(8.0, 5.0, 5.0)];
        let ctx = ComputeContext::new();
        let csp = compute(2, &positions, &cell, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        // One neighbor makes no pairs.
        assert_eq!(csp, vec![0.0, 0.0]);
    }

    #[test]
    fn test_cancellation() {
        let (cell, positions) = fcc_fixture(3.6, 2);
        let ctx = ComputeContext::new();
        ctx.cancel();
        assert!(compute(12, &positions, &cell, &ctx).unwrap().is_canceled());
    }
}
