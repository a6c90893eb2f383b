//! Ackland-Jones bond-angle analysis.
//!
//! Classifies each particle as FCC, HCP, BCC, icosahedral or "other" from a
//! histogram of bond angles among its nearest neighbors (Ackland & Jones,
//! Phys. Rev. B 73, 054104). The histogram cut points and weighting factors
//! are empirical published constants and the arithmetic deliberately runs in
//! `f32` to reproduce the reference results bit for bit.

use nalgebra::Vector3;
use tracing::info_span;

use crate::cell::SimulationCell;
use crate::nearest::{NearestNeighborFinder, NeighborQuery};
use crate::task::{par_map_particles, ComputeContext, Outcome};

/// Nearest neighbors examined per particle.
const MAX_NEIGHBORS: usize = 14;

/// Structure categories assigned by the bond-angle classifier, in output
/// order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BondAngleStructureType {
    #[default]
    Other = 0,
    Fcc = 1,
    Hcp = 2,
    Bcc = 3,
    Ico = 4,
}

/// Classifies every particle. Cancelable through `ctx`; never fails.
pub fn analyze(
    positions: &[Vector3<f64>],
    cell: &SimulationCell,
    ctx: &ComputeContext,
) -> Outcome<Vec<BondAngleStructureType>> {
    let _span = info_span!("bond_angle::analyze", n_atoms = positions.len()).entered();
    let finder = NearestNeighborFinder::prepare(MAX_NEIGHBORS, positions, cell);
    par_map_particles(positions.len(), ctx, |index| {
        determine_structure(&finder, index)
    })
}

/// Decision procedure for a single particle.
pub fn determine_structure(
    finder: &NearestNeighborFinder,
    index: usize,
) -> BondAngleStructureType {
    let mut query: NeighborQuery<MAX_NEIGHBORS> = NeighborQuery::new(finder);
    query.find_neighbors(finder.particle_pos(index));
    let results = query.results();

    // Reject under-coordinated particles.
    if results.len() < 6 {
        return BondAngleStructureType::Other;
    }

    // Mean squared distance of the 6 nearest neighbors.
    let mut r0_sq = 0.0f32;
    for nb in &results[..6] {
        r0_sq += nb.distance_sq as f32;
    }
    r0_sq /= 6.0;

    // Two growing neighbor shells:
    //   n0 counts neighbors with distsq <= 1.45 * r0_sq,
    //   n1 additionally admits distsq < 1.55 * r0_sq.
    let n0_dist_sq = 1.45f32 * r0_sq;
    let n1_dist_sq = 1.55f32 * r0_sq;
    let mut n0 = 0;
    while n0 < results.len() && results[n0].distance_sq as f32 <= n0_dist_sq {
        n0 += 1;
    }
    let mut n1 = n0;
    while n1 < results.len() && (results[n1].distance_sq as f32) < n1_dist_sq {
        n1 += 1;
    }

    // Histogram of bond-angle cosines over all pairs in the first shell.
    let mut chi = [0i32; 8];
    for j in 0..n0 {
        let delta_j = results[j].delta.cast::<f32>();
        let norm_j = (results[j].distance_sq as f32).sqrt();
        for k in (j + 1)..n0 {
            let norm_k = (results[k].distance_sq as f32).sqrt();
            let bond_angle = delta_j.dot(&results[k].delta.cast::<f32>()) / (norm_j * norm_k);

            if bond_angle < -0.945 {
                chi[0] += 1;
            } else if bond_angle < -0.915 {
                chi[1] += 1;
            } else if bond_angle < -0.755 {
                chi[2] += 1;
            } else if bond_angle < -0.195 {
                chi[3] += 1;
            } else if bond_angle < 0.195 {
                chi[4] += 1;
            } else if bond_angle < 0.245 {
                chi[5] += 1;
            } else if bond_angle < 0.795 {
                chi[6] += 1;
            } else if bond_angle >= 0.795 {
                chi[7] += 1;
            }
        }
    }

    // Deviations from the candidate lattice structures.
    let mut delta_bcc = 0.35f32 * chi[4] as f32 / (chi[5] + chi[6] - chi[4]) as f32;
    let delta_cp = (1.0f32 - chi[6] as f32 / 24.0).abs();
    let mut delta_fcc = 0.61f32 * ((chi[0] + chi[1] - 6).abs() + chi[2]) as f32 / 6.0;
    let mut delta_hcp =
        ((chi[0] - 3).abs() + (chi[0] + chi[1] + chi[2] + chi[3] - 9).abs()) as f32 / 12.0;

    // Exact-count overrides from the published method.
    if chi[0] == 7 {
        delta_bcc = 0.0;
    } else if chi[0] == 6 {
        delta_fcc = 0.0;
    } else if chi[0] <= 3 {
        delta_hcp = 0.0;
    }

    if chi[7] > 0 {
        BondAngleStructureType::Other
    } else if chi[4] < 3 {
        if n1 > 13 || n1 < 11 {
            BondAngleStructureType::Other
        } else {
            BondAngleStructureType::Ico
        }
    } else if delta_bcc <= delta_cp {
        if n1 < 11 {
            BondAngleStructureType::Other
        } else {
            BondAngleStructureType::Bcc
        }
    } else if n1 > 12 || n1 < 11 {
        BondAngleStructureType::Other
    } else if delta_fcc < delta_hcp {
        BondAngleStructureType::Fcc
    } else {
        BondAngleStructureType::Hcp
    }
}
