use nalgebra::{Matrix3, Vector3};
use thiserror::Error;

/// Basis determinants with an absolute value below this are rejected as degenerate.
const DEGENERACY_THRESHOLD: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum CellError {
    #[error("simulation cell is degenerate (basis matrix determinant is zero)")]
    Degenerate,
}

/// Geometry and boundary conditions of a simulation box.
///
/// The box is a parallelepiped spanned by the three column vectors of `h`,
/// anchored at `origin`. Each axis can independently be periodic. The inverse
/// basis is cached at construction time; a cell whose basis cannot be
/// inverted is rejected.
#[derive(Clone, Debug)]
pub struct SimulationCell {
    h: Matrix3<f64>,
    h_inv: Matrix3<f64>,
    origin: Vector3<f64>,
    pbc: Vector3<bool>,
}

impl SimulationCell {
    pub fn new(
        h: Matrix3<f64>,
        origin: Vector3<f64>,
        pbc: Vector3<bool>,
    ) -> Result<Self, CellError> {
        if h.determinant().abs() < DEGENERACY_THRESHOLD {
            return Err(CellError::Degenerate);
        }
        let h_inv = h.try_inverse().ok_or(CellError::Degenerate)?;
        Ok(Self {
            h,
            h_inv,
            origin,
            pbc,
        })
    }

    /// Axis-aligned box with the given edge lengths, anchored at the origin.
    pub fn orthorhombic(lengths: Vector3<f64>, pbc: Vector3<bool>) -> Result<Self, CellError> {
        Self::new(
            Matrix3::from_diagonal(&lengths),
            Vector3::zeros(),
            pbc,
        )
    }

    pub fn h(&self) -> &Matrix3<f64> {
        &self.h
    }

    pub fn h_inv(&self) -> &Matrix3<f64> {
        &self.h_inv
    }

    pub fn origin(&self) -> &Vector3<f64> {
        &self.origin
    }

    pub fn pbc(&self) -> &Vector3<bool> {
        &self.pbc
    }

    pub fn is_periodic(&self, dim: usize) -> bool {
        self.pbc[dim]
    }

    pub fn volume(&self) -> f64 {
        self.h.determinant().abs()
    }

    /// True if the three edge vectors are parallel to the coordinate axes.
    pub fn is_axis_aligned(&self) -> bool {
        self.h[(1, 0)] == 0.0
            && self.h[(2, 0)] == 0.0
            && self.h[(0, 1)] == 0.0
            && self.h[(2, 1)] == 0.0
            && self.h[(0, 2)] == 0.0
            && self.h[(1, 2)] == 0.0
    }

    /// Converts a point from absolute to fractional cell coordinates.
    pub fn to_fractional(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.h_inv * (p - self.origin)
    }

    /// Converts a point from fractional to absolute coordinates.
    pub fn to_cartesian(&self, f: &Vector3<f64>) -> Vector3<f64> {
        self.h * f + self.origin
    }

    /// Converts a direction vector from absolute to fractional coordinates
    /// (no origin translation).
    pub fn to_fractional_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        self.h_inv * v
    }

    pub fn to_cartesian_vector(&self, f: &Vector3<f64>) -> Vector3<f64> {
        self.h * f
    }

    /// Perpendicular distances between parallel cell faces, d_i = 1 / |h_inv.row(i)|.
    pub fn perpendicular_widths(&self) -> Vector3<f64> {
        Vector3::new(
            self.perpendicular_width(0),
            self.perpendicular_width(1),
            self.perpendicular_width(2),
        )
    }

    pub fn perpendicular_width(&self, dim: usize) -> f64 {
        1.0 / self.h_inv.row(dim).norm()
    }

    /// Unit normal of the cell face spanned by the two edges other than `dim`,
    /// oriented to point along edge `dim`.
    pub fn cell_normal_vector(&self, dim: usize) -> Vector3<f64> {
        let a = self.h.column((dim + 1) % 3);
        let b = self.h.column((dim + 2) % 3);
        let normal = a.cross(&b);
        if normal.dot(&self.h.column(dim)) < 0.0 {
            -normal.normalize()
        } else {
            normal.normalize()
        }
    }

    /// Folds a point back into the box on all periodic axes.
    pub fn wrap_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        let frac = self.to_fractional(p);
        let mut out = *p;
        for dim in 0..3 {
            if self.pbc[dim] {
                let s = frac[dim].floor();
                if s != 0.0 {
                    out -= s * self.h.column(dim);
                }
            }
        }
        out
    }

    /// Replaces a vector by its minimum image under the periodic boundary
    /// conditions.
    pub fn wrap_vector(&self, v: &Vector3<f64>) -> Vector3<f64> {
        let frac = self.h_inv * v;
        let mut out = *v;
        for dim in 0..3 {
            if self.pbc[dim] {
                let s = (frac[dim] + 0.5).floor();
                if s != 0.0 {
                    out -= s * self.h.column(dim);
                }
            }
        }
        out
    }

    /// True if the vector is long enough to be folded by the minimum image
    /// convention on some periodic axis.
    pub fn is_wrapped_vector(&self, v: &Vector3<f64>) -> bool {
        let frac = self.h_inv * v;
        (0..3).any(|dim| self.pbc[dim] && frac[dim].abs() >= 0.5)
    }
}
