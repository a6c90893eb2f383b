//! Cubic and hexagonal diamond structure identification.
//!
//! Diamond lattices cannot be told apart by first-shell bond topology alone,
//! so each particle is characterized through the 12 second-shell vectors
//! reached via its 4 covalent neighbors. Those 12 vectors form an FCC-like
//! (cubic diamond) or HCP-like (hexagonal diamond) arrangement that the
//! common-neighbor signatures from [`crate::cna`] can discriminate. Two
//! follow-up passes label the first and second neighbors of identified
//! diamond atoms, so a defect-free crystal surface still reports its
//! diamond-lattice membership.

use nalgebra::Vector3;
use tracing::info_span;

use crate::cell::SimulationCell;
use crate::cna::{calc_max_chain_length, find_common_neighbors, find_neighbor_bonds, NeighborBondArray};
use crate::nearest::{NearestNeighborFinder, NeighborQuery};
use crate::task::{par_map_particles, ComputeContext, Outcome};

/// Covalent neighbors per atom in a diamond lattice.
const FIRST_SHELL_SIZE: usize = 4;

/// Second-shell vectors characterized per atom.
const SECOND_SHELL_SIZE: usize = 12;

/// Second-shell vectors shorter than this are the walk back to the central
/// atom and are discarded.
const BACK_VECTOR_THRESHOLD: f64 = 1e-2;

/// Structure categories assigned by the identifier, in output order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DiamondStructureType {
    #[default]
    Other = 0,
    CubicDiamond = 1,
    CubicDiamondFirstNeighbor = 2,
    CubicDiamondSecondNeighbor = 3,
    HexDiamond = 4,
    HexDiamondFirstNeighbor = 5,
    HexDiamondSecondNeighbor = 6,
}

/// One covalent neighbor recorded in pass one. `index` is `None` when the
/// finder returned fewer than four neighbors; the vector is then zero.
#[derive(Clone, Copy, Debug, Default)]
struct FirstShellNeighbor {
    delta: Vector3<f64>,
    index: Option<u32>,
}

/// Classifies every particle of a (possibly defective) diamond crystal.
pub fn identify(
    positions: &[Vector3<f64>],
    cell: &SimulationCell,
    ctx: &ComputeContext,
) -> Outcome<Vec<DiamondStructureType>> {
    let _span = info_span!("diamond::identify", n_atoms = positions.len()).entered();
    let n = positions.len();
    let finder = NearestNeighborFinder::prepare(FIRST_SHELL_SIZE, positions, cell);

    // Pass 1: record the four nearest neighbors of every atom.
    let first_shell = match par_map_particles(n, ctx, |index| find_first_shell(&finder, index)) {
        Outcome::Completed(lists) => lists,
        Outcome::Canceled => return Outcome::Canceled,
    };

    // Pass 2: classify each atom from its second-shell geometry.
    let mut types =
        match par_map_particles(n, ctx, |index| determine_structure(index, &first_shell)) {
            Outcome::Completed(types) => types,
            Outcome::Canceled => return Outcome::Canceled,
        };

    // Pass 3: atoms bonded to a diamond atom become first neighbors.
    for index in 0..n {
        let promoted = match types[index] {
            DiamondStructureType::CubicDiamond => DiamondStructureType::CubicDiamondFirstNeighbor,
            DiamondStructureType::HexDiamond => DiamondStructureType::HexDiamondFirstNeighbor,
            _ => continue,
        };
        for entry in &first_shell[index] {
            if let Some(ni) = entry.index {
                if types[ni as usize] == DiamondStructureType::Other {
                    types[ni as usize] = promoted;
                }
            }
        }
    }

    // Pass 4: atoms bonded to a first neighbor become second neighbors.
    for index in 0..n {
        let promoted = match types[index] {
            DiamondStructureType::CubicDiamondFirstNeighbor => {
                DiamondStructureType::CubicDiamondSecondNeighbor
            }
            DiamondStructureType::HexDiamondFirstNeighbor => {
                DiamondStructureType::HexDiamondSecondNeighbor
            }
            _ => continue,
        };
        for entry in &first_shell[index] {
            if let Some(ni) = entry.index {
                if types[ni as usize] == DiamondStructureType::Other {
                    types[ni as usize] = promoted;
                }
            }
        }
    }

    Outcome::Completed(types)
}

fn find_first_shell(
    finder: &NearestNeighborFinder,
    index: usize,
) -> [FirstShellNeighbor; FIRST_SHELL_SIZE] {
    let mut query: NeighborQuery<FIRST_SHELL_SIZE> = NeighborQuery::new(finder);
    query.find_neighbors(finder.particle_pos(index));
    let mut shell = [FirstShellNeighbor::default(); FIRST_SHELL_SIZE];
    for (slot, nb) in shell.iter_mut().zip(query.results()) {
        slot.delta = nb.delta;
        slot.index = Some(nb.index as u32);
    }
    shell
}

/// Classifies one atom from the 12 vectors to its second-shell sites.
/// Every structural anomaly resolves to `Other`.
fn determine_structure(
    index: usize,
    first_shell: &[[FirstShellNeighbor; FIRST_SHELL_SIZE]],
) -> DiamondStructureType {
    let mut second_shell = [Vector3::zeros(); SECOND_SHELL_SIZE];
    let mut num_vectors = 0;
    for (i, entry) in first_shell[index].iter().enumerate() {
        let Some(ni) = entry.index else {
            return DiamondStructureType::Other;
        };
        for onward in &first_shell[ni as usize] {
            let v = entry.delta + onward.delta;
            if v.amax() <= BACK_VECTOR_THRESHOLD {
                continue;
            }
            if num_vectors == SECOND_SHELL_SIZE {
                return DiamondStructureType::Other;
            }
            second_shell[num_vectors] = v;
            num_vectors += 1;
        }
        // Each covalent neighbor must contribute exactly three onward sites.
        if num_vectors != i * 3 + 3 {
            return DiamondStructureType::Other;
        }
    }

    // CNA over the second-shell vectors with a local cutoff halfway between
    // their nearest-neighbor and next-nearest-neighbor separations.
    let local_scaling: f64 = second_shell.iter().map(|v| v.norm()).sum();
    let local_cutoff = local_scaling / SECOND_SHELL_SIZE as f64 * 1.2071068;
    let cutoff_sq = local_cutoff * local_cutoff;

    let mut bonds = NeighborBondArray::new();
    for ni1 in 0..SECOND_SHELL_SIZE {
        for ni2 in (ni1 + 1)..SECOND_SHELL_SIZE {
            let bonded = (second_shell[ni1] - second_shell[ni2]).norm_squared() <= cutoff_sq;
            bonds.set_bond(ni1, ni2, bonded);
        }
    }
    let mut n421 = 0;
    let mut n422 = 0;
    for ni in 0..SECOND_SHELL_SIZE {
        let (common, num_common) = find_common_neighbors(&bonds, ni);
        if num_common != 4 {
            return DiamondStructureType::Other;
        }
        let mut bond_list = [0u32; 32];
        let num_bonds = find_neighbor_bonds(&bonds, common, SECOND_SHELL_SIZE, &mut bond_list);
        if num_bonds != 2 {
            return DiamondStructureType::Other;
        }
        match calc_max_chain_length(&mut bond_list[..num_bonds]) {
            1 => n421 += 1,
            2 => n422 += 1,
            _ => return DiamondStructureType::Other,
        }
    }
    if n421 == 12 {
        DiamondStructureType::CubicDiamond
    } else if n421 == 6 && n422 == 6 {
        DiamondStructureType::HexDiamond
    } else {
        DiamondStructureType::Other
    }
}
