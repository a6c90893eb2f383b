#![allow(dead_code)]

use nalgebra::Vector3;
use structid_rs::SimulationCell;

/// Cubic simulation cell of edge `a * reps`.
pub fn cubic_cell(a: f64, reps: usize, periodic: bool) -> SimulationCell {
    let length = a * reps as f64;
    SimulationCell::orthorhombic(
        Vector3::new(length, length, length),
        Vector3::new(periodic, periodic, periodic),
    )
    .unwrap()
}

fn fill_cubic(
    a: f64,
    reps: usize,
    basis: &[Vector3<f64>],
) -> Vec<Vector3<f64>> {
    let mut positions = Vec::with_capacity(reps * reps * reps * basis.len());
    for i in 0..reps {
        for j in 0..reps {
            for k in 0..reps {
                for b in basis {
                    positions.push(Vector3::new(
                        (i as f64 + b.x) * a,
                        (j as f64 + b.y) * a,
                        (k as f64 + b.z) * a,
                    ));
                }
            }
        }
    }
    positions
}

/// Simple cubic lattice, one atom per cell corner.
pub fn sc_lattice(a: f64, reps: usize, periodic: bool) -> (SimulationCell, Vec<Vector3<f64>>) {
    let basis = [Vector3::new(0.0, 0.0, 0.0)];
    (cubic_cell(a, reps, periodic), fill_cubic(a, reps, &basis))
}

/// FCC lattice from the four-atom conventional cell.
pub fn fcc_lattice(a: f64, reps: usize, periodic: bool) -> (SimulationCell, Vec<Vector3<f64>>) {
    let basis = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(0.5, 0.5, 0.0),
        Vector3::new(0.5, 0.0, 0.5),
        Vector3::new(0.0, 0.5, 0.5),
    ];
    (cubic_cell(a, reps, periodic), fill_cubic(a, reps, &basis))
}

/// BCC lattice from the two-atom conventional cell.
pub fn bcc_lattice(a: f64, reps: usize, periodic: bool) -> (SimulationCell, Vec<Vector3<f64>>) {
    let basis = [Vector3::new(0.0, 0.0, 0.0), Vector3::new(0.5, 0.5, 0.5)];
    (cubic_cell(a, reps, periodic), fill_cubic(a, reps, &basis))
}

/// Cubic diamond lattice, FCC with a two-atom basis.
pub fn diamond_lattice(a: f64, reps: usize, periodic: bool) -> (SimulationCell, Vec<Vector3<f64>>) {
    let fcc = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(0.5, 0.5, 0.0),
        Vector3::new(0.5, 0.0, 0.5),
        Vector3::new(0.0, 0.5, 0.5),
    ];
    let mut basis = Vec::with_capacity(8);
    for site in &fcc {
        basis.push(*site);
        basis.push(site + Vector3::new(0.25, 0.25, 0.25));
    }
    (cubic_cell(a, reps, periodic), fill_cubic(a, reps, &basis))
}

/// Ideal HCP lattice in an orthorhombic four-atom representation with
/// c/a = sqrt(8/3). Nearest-neighbor distance is `a`.
pub fn hcp_lattice(a: f64, reps: usize, periodic: bool) -> (SimulationCell, Vec<Vector3<f64>>) {
    let b = a * 3.0f64.sqrt();
    let c = a * (8.0f64 / 3.0).sqrt();
    let cell = SimulationCell::orthorhombic(
        Vector3::new(a * reps as f64, b * reps as f64, c * reps as f64),
        Vector3::new(periodic, periodic, periodic),
    )
    .unwrap();
    let basis = [
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(0.5 * a, 0.5 * b, 0.0),
        Vector3::new(0.5 * a, b / 6.0, 0.5 * c),
        Vector3::new(0.0, 2.0 * b / 3.0, 0.5 * c),
    ];
    let mut positions = Vec::with_capacity(reps * reps * reps * 4);
    for i in 0..reps {
        for j in 0..reps {
            for k in 0..reps {
                let corner = Vector3::new(i as f64 * a, j as f64 * b, k as f64 * c);
                for site in &basis {
                    positions.push(corner + site);
                }
            }
        }
    }
    (cell, positions)
}

/// A 13-atom icosahedral cluster (center plus 12 vertices) in an open cell.
/// The center-to-vertex distance is `bond`.
pub fn icosahedron_cluster(bond: f64) -> (SimulationCell, Vec<Vector3<f64>>) {
    let phi = (1.0 + 5.0f64.sqrt()) / 2.0;
    let scale = bond / (1.0 + phi * phi).sqrt();
    let cell = SimulationCell::orthorhombic(
        Vector3::new(10.0 * bond, 10.0 * bond, 10.0 * bond),
        Vector3::new(false, false, false),
    )
    .unwrap();
    let center = Vector3::new(5.0 * bond, 5.0 * bond, 5.0 * bond);
    let mut positions = vec![center];
    for &s0 in &[-1.0, 1.0] {
        for &s1 in &[-1.0, 1.0] {
            positions.push(center + scale * Vector3::new(0.0, s0, s1 * phi));
            positions.push(center + scale * Vector3::new(s0, s1 * phi, 0.0));
            positions.push(center + scale * Vector3::new(s0 * phi, 0.0, s1));
        }
    }
    (cell, positions)
}

/// Low-discrepancy filler cloud for cancellation and scaling tests.
pub fn quasirandom_cloud(n: usize, size: f64) -> Vec<Vector3<f64>> {
    const A1: f64 = 0.8191725133961645;
    const A2: f64 = 0.6710436067037893;
    const A3: f64 = 0.5497004779019703;
    (0..n)
        .map(|i| {
            let f = i as f64;
            Vector3::new(
                (0.5 + A1 * f).fract() * size,
                (0.5 + A2 * f).fract() * size,
                (0.5 + A3 * f).fract() * size,
            )
        })
        .collect()
}

/// Minimum-image distance between two points.
pub fn min_image_distance(cell: &SimulationCell, a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
    cell.wrap_vector(&(b - a)).norm()
}
