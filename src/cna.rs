//! Common neighbor analysis.
//!
//! Classifies the local crystal structure around each particle from the bond
//! topology among its nearest neighbors (Honeycutt & Andersen, J. Phys. Chem.
//! 95, 4950). Two variants are provided: the adaptive mode derives a local
//! cutoff per particle from the observed neighbor distances, the fixed mode
//! bonds neighbors with a single global cutoff radius. The bond-matrix
//! machinery in this module is also used by the diamond-structure identifier.

use nalgebra::Vector3;
use tracing::info_span;

use crate::cell::SimulationCell;
use crate::cutoff::{CutoffError, CutoffNeighborFinder};
use crate::nearest::{NearestNeighborFinder, NeighborQuery};
use crate::task::{par_map_particles, ComputeContext, Outcome};

/// Nearest neighbors examined per particle in adaptive mode; also the upper
/// bound accepted from the cutoff finder in fixed mode.
const MAX_NEIGHBORS: usize = 16;

/// Structure categories assigned by common neighbor analysis, in output
/// order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CnaStructureType {
    #[default]
    Other = 0,
    Fcc = 1,
    Hcp = 2,
    Bcc = 3,
    Ico = 4,
    Dia = 5,
}

/// Neighbor-bond criterion for the analysis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CnaMode {
    /// Per-particle cutoffs scaled from the observed neighbor distances.
    Adaptive,
    /// One global cutoff radius; particles whose neighbor count is not 12,
    /// 14 or 16 are classified `Other` outright.
    FixedCutoff(f64),
}

/// Symmetric bond matrix over up to 32 neighbors, one bit per pair.
#[derive(Clone, Copy, Debug)]
pub(crate) struct NeighborBondArray {
    rows: [u32; 32],
}

impl NeighborBondArray {
    pub(crate) fn new() -> Self {
        Self { rows: [0; 32] }
    }

    pub(crate) fn bond(&self, i: usize, j: usize) -> bool {
        self.rows[i] & (1 << j) != 0
    }

    pub(crate) fn set_bond(&mut self, i: usize, j: usize, bonded: bool) {
        if bonded {
            self.rows[i] |= 1 << j;
            self.rows[j] |= 1 << i;
        } else {
            self.rows[i] &= !(1 << j);
            self.rows[j] &= !(1 << i);
        }
    }
}

/// Neighbors common to the central particle and its neighbor `ni`. Every
/// entry of the bond matrix is a neighbor of the center by construction, so
/// the common neighbors are exactly the row of `ni`. Returns the bitmask and
/// its population count.
pub(crate) fn find_common_neighbors(bonds: &NeighborBondArray, ni: usize) -> (u32, u32) {
    let common = bonds.rows[ni];
    (common, common.count_ones())
}

/// Enumerates the bonds between the common neighbors selected by `common`.
/// Each bond is encoded as the OR of the two neighbors' bitmasks. Returns the
/// number of bonds written to `out`.
pub(crate) fn find_neighbor_bonds(
    bonds: &NeighborBondArray,
    common: u32,
    num_neighbors: usize,
    out: &mut [u32],
) -> usize {
    let mut num_bonds = 0;
    let mut nib = [0u32; 32];
    let mut nibn = 0;
    let mut ni1b = 1u32;
    for ni1 in 0..num_neighbors {
        if common & ni1b != 0 {
            let b = common & bonds.rows[ni1];
            for bonded in &nib[..nibn] {
                if b & bonded != 0 {
                    out[num_bonds] = ni1b | bonded;
                    num_bonds += 1;
                }
            }
            nib[nibn] = ni1b;
            nibn += 1;
        }
        ni1b <<= 1;
    }
    num_bonds
}

/// Length of the longest connected chain of bonds, counted in bonds.
/// Consumes the bond list.
pub(crate) fn calc_max_chain_length(bond_list: &mut [u32]) -> usize {
    let mut num_bonds = bond_list.len();
    let mut max_chain_length = 0;
    while num_bonds > 0 {
        // Seed a new cluster with the last remaining bond.
        num_bonds -= 1;
        let mut atoms_to_process = bond_list[num_bonds];
        let mut atoms_processed = 0u32;
        let mut cluster_size = 1;
        loop {
            let next_atom = 1u32 << atoms_to_process.trailing_zeros();
            atoms_processed |= next_atom;
            atoms_to_process &= !next_atom;
            cluster_size += take_adjacent_bonds(
                next_atom,
                bond_list,
                &mut num_bonds,
                &mut atoms_to_process,
                &mut atoms_processed,
            );
            if atoms_to_process == 0 {
                break;
            }
        }
        max_chain_length = max_chain_length.max(cluster_size);
    }
    max_chain_length
}

/// Removes every remaining bond incident to `atom`, queueing the atoms at
/// their far ends. Returns the number of bonds removed.
fn take_adjacent_bonds(
    atom: u32,
    bond_list: &mut [u32],
    num_bonds: &mut usize,
    atoms_to_process: &mut u32,
    atoms_processed: &mut u32,
) -> usize {
    let mut adjacent_bonds = 0;
    let mut b = 0;
    while b < *num_bonds {
        if bond_list[b] & atom != 0 {
            adjacent_bonds += 1;
            *atoms_to_process |= bond_list[b] & !*atoms_processed;
            bond_list.copy_within(b + 1..*num_bonds, b);
            *num_bonds -= 1;
        } else {
            b += 1;
        }
    }
    adjacent_bonds
}

/// Classifies every particle. Fixed-cutoff mode fails up front if the cutoff
/// is invalid for the cell; per-particle anomalies always fold into `Other`.
pub fn analyze(
    mode: CnaMode,
    positions: &[Vector3<f64>],
    cell: &SimulationCell,
    ctx: &ComputeContext,
) -> Result<Outcome<Vec<CnaStructureType>>, CutoffError> {
    let _span = info_span!("cna::analyze", n_atoms = positions.len(), ?mode).entered();
    match mode {
        CnaMode::Adaptive => {
            let finder = NearestNeighborFinder::prepare(MAX_NEIGHBORS, positions, cell);
            Ok(par_map_particles(positions.len(), ctx, |index| {
                determine_structure_adaptive(&finder, index)
            }))
        }
        CnaMode::FixedCutoff(cutoff) => {
            let finder = CutoffNeighborFinder::prepare(cutoff, positions, cell)?;
            Ok(par_map_particles(positions.len(), ctx, |index| {
                determine_structure_fixed(&finder, index)
            }))
        }
    }
}

/// Adaptive decision procedure for a single particle: the 12-neighbor
/// signatures (FCC/HCP/ICO) are tried first, then the 14-neighbor BCC
/// signatures, then the 16-neighbor diamond signatures.
pub fn determine_structure_adaptive(
    finder: &NearestNeighborFinder,
    index: usize,
) -> CnaStructureType {
    let mut query: NeighborQuery<MAX_NEIGHBORS> = NeighborQuery::new(finder);
    query.find_neighbors(finder.particle_pos(index));
    let results = query.results();
    let num_neighbors = results.len();

    // 12 neighbors: FCC, HCP and icosahedral ordering.
    if num_neighbors < 12 {
        return CnaStructureType::Other;
    }
    let mut local_scaling = 0.0;
    for nb in &results[..12] {
        local_scaling += nb.distance_sq.sqrt();
    }
    let local_cutoff = local_scaling / 12.0 * (1.0 + std::f64::consts::SQRT_2) * 0.5;
    let cutoff_sq = local_cutoff * local_cutoff;

    let mut bonds = NeighborBondArray::new();
    for ni1 in 0..12 {
        for ni2 in (ni1 + 1)..12 {
            let bonded = (results[ni1].delta - results[ni2].delta).norm_squared() <= cutoff_sq;
            bonds.set_bond(ni1, ni2, bonded);
        }
    }
    let mut n421 = 0;
    let mut n422 = 0;
    let mut n555 = 0;
    for ni in 0..12 {
        let (common, num_common) = find_common_neighbors(&bonds, ni);
        if num_common != 4 && num_common != 5 {
            break;
        }
        let mut bond_list = [0u32; 32];
        let num_bonds = find_neighbor_bonds(&bonds, common, 12, &mut bond_list);
        if num_bonds != 2 && num_bonds != 5 {
            break;
        }
        let max_chain = calc_max_chain_length(&mut bond_list[..num_bonds]);
        if num_common == 4 && num_bonds == 2 {
            match max_chain {
                1 => n421 += 1,
                2 => n422 += 1,
                _ => break,
            }
        } else if num_common == 5 && num_bonds == 5 && max_chain == 5 {
            n555 += 1;
        } else {
            break;
        }
    }
    if n421 == 12 {
        return CnaStructureType::Fcc;
    } else if n421 == 6 && n422 == 6 {
        return CnaStructureType::Hcp;
    } else if n555 == 12 {
        return CnaStructureType::Ico;
    }

    // 14 neighbors: BCC. The 8 first-shell distances are rescaled onto the
    // second shell before averaging.
    if num_neighbors < 14 {
        return CnaStructureType::Other;
    }
    let mut local_scaling = 0.0;
    for nb in &results[..8] {
        local_scaling += (nb.distance_sq / (3.0 / 4.0)).sqrt();
    }
    for nb in &results[8..14] {
        local_scaling += nb.distance_sq.sqrt();
    }
    let local_cutoff = local_scaling / 14.0 * 1.207;
    let cutoff_sq = local_cutoff * local_cutoff;

    let mut bonds = NeighborBondArray::new();
    for ni1 in 0..14 {
        for ni2 in (ni1 + 1)..14 {
            let bonded = (results[ni1].delta - results[ni2].delta).norm_squared() <= cutoff_sq;
            bonds.set_bond(ni1, ni2, bonded);
        }
    }
    let mut n444 = 0;
    let mut n666 = 0;
    for ni in 0..14 {
        let (common, num_common) = find_common_neighbors(&bonds, ni);
        if num_common != 4 && num_common != 6 {
            break;
        }
        let mut bond_list = [0u32; 32];
        let num_bonds = find_neighbor_bonds(&bonds, common, 14, &mut bond_list);
        if num_bonds != 4 && num_bonds != 6 {
            break;
        }
        let max_chain = calc_max_chain_length(&mut bond_list[..num_bonds]);
        if num_common == 4 && num_bonds == 4 && max_chain == 4 {
            n444 += 1;
        } else if num_common == 6 && num_bonds == 6 && max_chain == 6 {
            n666 += 1;
        } else {
            break;
        }
    }
    if n444 == 6 && n666 == 8 {
        return CnaStructureType::Bcc;
    }

    // 16 neighbors: cubic/hexagonal diamond. The 4 covalent bonds and the 12
    // second-shell distances are rescaled separately.
    if num_neighbors < 16 {
        return CnaStructureType::Other;
    }
    let mut local_scaling = 0.0;
    for nb in &results[..4] {
        local_scaling += (nb.distance_sq / (3.0 / 16.0)).sqrt();
    }
    for nb in &results[4..16] {
        local_scaling += (nb.distance_sq / 0.5).sqrt();
    }
    let local_cutoff = local_scaling / 16.0 * 0.7681;
    let cutoff_sq = local_cutoff * local_cutoff;

    let mut bonds = NeighborBondArray::new();
    for ni1 in 0..16 {
        for ni2 in (ni1 + 1)..16 {
            let bonded = (results[ni1].delta - results[ni2].delta).norm_squared() <= cutoff_sq;
            bonds.set_bond(ni1, ni2, bonded);
        }
    }
    let mut n543 = 0;
    let mut n663 = 0;
    for ni in 0..16 {
        let (common, num_common) = find_common_neighbors(&bonds, ni);
        if num_common != 5 && num_common != 6 {
            break;
        }
        let mut bond_list = [0u32; 32];
        let num_bonds = find_neighbor_bonds(&bonds, common, 16, &mut bond_list);
        if num_bonds != 4 && num_bonds != 6 {
            break;
        }
        let max_chain = calc_max_chain_length(&mut bond_list[..num_bonds]);
        if num_common == 5 && num_bonds == 4 && max_chain == 3 {
            n543 += 1;
        } else if num_common == 6 && num_bonds == 6 && max_chain == 3 {
            n663 += 1;
        } else {
            break;
        }
    }
    if n543 == 12 && n663 == 4 {
        return CnaStructureType::Dia;
    }

    CnaStructureType::Other
}

/// Fixed-cutoff decision procedure for a single particle. The neighbor count
/// selects the candidate family; any signature mismatch is final.
pub fn determine_structure_fixed(
    finder: &CutoffNeighborFinder,
    index: usize,
) -> CnaStructureType {
    let mut deltas = [Vector3::zeros(); MAX_NEIGHBORS];
    let mut num_neighbors = 0;
    for nb in finder.neighbors_of(index) {
        if num_neighbors == MAX_NEIGHBORS {
            return CnaStructureType::Other;
        }
        deltas[num_neighbors] = nb.delta;
        num_neighbors += 1;
    }
    if num_neighbors != 12 && num_neighbors != 14 && num_neighbors != 16 {
        return CnaStructureType::Other;
    }

    let cutoff_sq = finder.cutoff_radius_squared();
    let mut bonds = NeighborBondArray::new();
    for ni1 in 0..num_neighbors {
        for ni2 in (ni1 + 1)..num_neighbors {
            let bonded = (deltas[ni1] - deltas[ni2]).norm_squared() <= cutoff_sq;
            bonds.set_bond(ni1, ni2, bonded);
        }
    }

    if num_neighbors == 12 {
        let mut n421 = 0;
        let mut n422 = 0;
        let mut n555 = 0;
        for ni in 0..12 {
            let (common, num_common) = find_common_neighbors(&bonds, ni);
            if num_common != 4 && num_common != 5 {
                return CnaStructureType::Other;
            }
            let mut bond_list = [0u32; 32];
            let num_bonds = find_neighbor_bonds(&bonds, common, 12, &mut bond_list);
            if num_bonds != 2 && num_bonds != 5 {
                return CnaStructureType::Other;
            }
            let max_chain = calc_max_chain_length(&mut bond_list[..num_bonds]);
            if num_common == 4 && num_bonds == 2 {
                match max_chain {
                    1 => n421 += 1,
                    2 => n422 += 1,
                    _ => return CnaStructureType::Other,
                }
            } else if num_common == 5 && num_bonds == 5 && max_chain == 5 {
                n555 += 1;
            } else {
                return CnaStructureType::Other;
            }
        }
        if n421 == 12 {
            CnaStructureType::Fcc
        } else if n421 == 6 && n422 == 6 {
            CnaStructureType::Hcp
        } else if n555 == 12 {
            CnaStructureType::Ico
        } else {
            CnaStructureType::Other
        }
    } else if num_neighbors == 14 {
        let mut n444 = 0;
        let mut n666 = 0;
        for ni in 0..14 {
            let (common, num_common) = find_common_neighbors(&bonds, ni);
            if num_common != 4 && num_common != 6 {
                return CnaStructureType::Other;
            }
            let mut bond_list = [0u32; 32];
            let num_bonds = find_neighbor_bonds(&bonds, common, 14, &mut bond_list);
            if num_bonds != 4 && num_bonds != 6 {
                return CnaStructureType::Other;
            }
            let max_chain = calc_max_chain_length(&mut bond_list[..num_bonds]);
            if num_common == 4 && num_bonds == 4 && max_chain == 4 {
                n444 += 1;
            } else if num_common == 6 && num_bonds == 6 && max_chain == 6 {
                n666 += 1;
            } else {
                return CnaStructureType::Other;
            }
        }
        if n444 == 6 && n666 == 8 {
            CnaStructureType::Bcc
        } else {
            CnaStructureType::Other
        }
    } else {
        let mut n543 = 0;
        let mut n663 = 0;
        for ni in 0..16 {
            let (common, num_common) = find_common_neighbors(&bonds, ni);
            if num_common != 5 && num_common != 6 {
                return CnaStructureType::Other;
            }
            let mut bond_list = [0u32; 32];
            let num_bonds = find_neighbor_bonds(&bonds, common, 16, &mut bond_list);
            if num_bonds != 4 && num_bonds != 6 {
                return CnaStructureType::Other;
            }
            let max_chain = calc_max_chain_length(&mut bond_list[..num_bonds]);
            if num_common == 5 && num_bonds == 4 && max_chain == 3 {
                n543 += 1;
            } else if num_common == 6 && num_bonds == 6 && max_chain == 3 {
                n663 += 1;
            } else {
                return CnaStructureType::Other;
            }
        }
        if n543 == 12 && n663 == 4 {
            CnaStructureType::Dia
        } else {
            CnaStructureType::Other
        }
    }
}
