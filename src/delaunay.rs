//! Delaunay tessellation of a particle system.
//!
//! Incremental Bowyer-Watson construction with exact geometric predicates
//! from the `robust` crate, so no conflict-region decision ever suffers from
//! floating-point rounding. The convex hull is closed off by cells sharing a
//! symbolic infinite vertex, which lets point location and cavity retriangulation
//! treat hull facets like any other facet. Periodic boundary conditions are
//! handled by inserting ghost images of the input points from a slab of
//! configurable thickness around the cell; cells are afterwards classified as
//! local or ghost so that iterating the local cells covers each periodic
//! tetrahedron exactly once.
//!
//! Input points are jittered by a tiny deterministic perturbation before
//! insertion. Degenerate point groups (cospherical, coplanar) otherwise show
//! up frequently in crystalline inputs and would stall the insertion walk.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use robust::{insphere, orient2d, orient3d, Coord, Coord3D};
use thiserror::Error;
use tracing::{debug, info_span};

use crate::cell::SimulationCell;
use crate::config;
use crate::task::{ComputeContext, Outcome};

pub type CellHandle = u32;
pub type VertexHandle = u32;

/// Vertex handle of the symbolic point at infinity.
const INFINITE_VERTEX: u32 = 0;

const NO_CELL: u32 = u32::MAX;

/// Magnitude of the random displacement applied to every input point.
const PERTURBATION_MAGNITUDE: f64 = 1e-8;

/// Fixed seed so repeated runs tessellate identically.
const PERTURBATION_SEED: u64 = 4;

/// Vertices of the facet opposite each cell corner, wound counter-clockwise
/// when viewed from outside a positively oriented cell. A point lies strictly
/// outside facet `f` exactly when `orient3d` of its triple and the point is
/// negative.
const FACET_VERTICES: [[usize; 3]; 4] = [[1, 3, 2], [0, 2, 3], [0, 3, 1], [0, 1, 2]];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TessellationError {
    #[error("ghost layer size must be positive and finite")]
    InvalidGhostLayer,
    #[error("tessellation needs at least four affinely independent points")]
    Degenerate,
}

/// One facet of a tessellation cell, identified by the cell and the index of
/// the opposite corner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Facet {
    pub cell: CellHandle,
    pub facet: usize,
}

/// A vertex of the tessellation. Ghost vertices are periodic images; their
/// `input_index` refers to the source point.
#[derive(Clone, Copy, Debug)]
pub struct VertexPoint {
    pub pos: Vector3<f64>,
    /// Index into the input point list, -1 for the infinite vertex.
    pub input_index: i32,
    pub is_ghost: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct CellInfo {
    is_ghost: bool,
    flag: bool,
    index: i32,
}

#[derive(Clone, Debug)]
struct CellData {
    verts: [u32; 4],
    neighbors: [u32; 4],
    info: CellInfo,
}

/// Tetrahedral Delaunay tessellation of a point set in a simulation cell.
#[derive(Clone, Debug)]
pub struct DelaunayTessellation {
    cell: SimulationCell,
    verts: Vec<VertexPoint>,
    cells: Vec<CellData>,
    /// One incident cell per vertex, the entry point for `incident_cells`.
    vertex_cell: Vec<u32>,
    num_input_points: usize,
}

impl DelaunayTessellation {
    /// Tessellates the given points. Ghost images of the points are created
    /// within `ghost_layer_size` of every periodic cell boundary, so the
    /// layer must be at least as thick as the longest expected cell edge for
    /// the local cells to come out correct.
    pub fn generate(
        cell: &SimulationCell,
        positions: &[Vector3<f64>],
        ghost_layer_size: f64,
        ctx: &ComputeContext,
    ) -> Result<Outcome<Self>, TessellationError> {
        let _span =
            info_span!("DelaunayTessellation::generate", n_input = positions.len()).entered();
        if !ghost_layer_size.is_finite() || ghost_layer_size <= 0.0 {
            return Err(TessellationError::InvalidGhostLayer);
        }

        // Wrap the input into the cell and jitter it. Ghost images are exact
        // lattice translates of the jittered points, never jittered twice.
        let mut rng = StdRng::seed_from_u64(PERTURBATION_SEED);
        let mut verts = Vec::with_capacity(positions.len() + 1);
        verts.push(VertexPoint {
            pos: Vector3::zeros(),
            input_index: -1,
            is_ghost: true,
        });
        let mut perturbed = Vec::with_capacity(positions.len());
        for (i, p) in positions.iter().enumerate() {
            let jitter = Vector3::new(
                rng.gen_range(-PERTURBATION_MAGNITUDE..PERTURBATION_MAGNITUDE),
                rng.gen_range(-PERTURBATION_MAGNITUDE..PERTURBATION_MAGNITUDE),
                rng.gen_range(-PERTURBATION_MAGNITUDE..PERTURBATION_MAGNITUDE),
            );
            let pos = cell.wrap_point(p) + jitter;
            perturbed.push(pos);
            verts.push(VertexPoint {
                pos,
                input_index: i as i32,
                is_ghost: false,
            });
        }

        // Image replication: enough lattice shifts per periodic axis to cover
        // the ghost layer, clipped against the padded slab of the cell.
        let mut stencil = [0i32; 3];
        for dim in 0..3 {
            if cell.is_periodic(dim) {
                let layers = (ghost_layer_size / cell.perpendicular_width(dim)).ceil() as i32;
                stencil[dim] = layers.max(1);
            }
        }
        let mut normals = [Vector3::zeros(); 3];
        let mut slab_low = [0.0f64; 3];
        let mut slab_high = [0.0f64; 3];
        for dim in 0..3 {
            normals[dim] = cell.cell_normal_vector(dim);
            let origin_proj = normals[dim].dot(cell.origin());
            slab_low[dim] = origin_proj - ghost_layer_size;
            slab_high[dim] = origin_proj + cell.perpendicular_width(dim) + ghost_layer_size;
        }
        for (i, pos) in perturbed.iter().enumerate() {
            for sx in -stencil[0]..=stencil[0] {
                for sy in -stencil[1]..=stencil[1] {
                    for sz in -stencil[2]..=stencil[2] {
                        if sx == 0 && sy == 0 && sz == 0 {
                            continue;
                        }
                        let shift = Vector3::new(sx as f64, sy as f64, sz as f64);
                        let image = pos + cell.to_cartesian_vector(&shift);
                        let inside = (0..3).all(|dim| {
                            let proj = normals[dim].dot(&image);
                            proj >= slab_low[dim] && proj <= slab_high[dim]
                        });
                        if inside {
                            verts.push(VertexPoint {
                                pos: image,
                                input_index: i as i32,
                                is_ghost: true,
                            });
                        }
                    }
                }
            }
        }
        debug!(
            input = positions.len(),
            ghosts = verts.len() - 1 - positions.len(),
            "tessellation vertex set ready"
        );
        if ctx.is_canceled() {
            return Ok(Outcome::Canceled);
        }

        let num_vertices = verts.len() as u32;
        let mut tri = Triangulator::new(verts);
        let initial = tri.build_first_cell()?;

        let batch = config::get_progress_batch_size();
        let mut since_poll = 0usize;
        for v in 1..num_vertices {
            if initial.contains(&v) {
                continue;
            }
            tri.insert(v)?;
            since_poll += 1;
            if since_poll == batch {
                if ctx.is_canceled() {
                    return Ok(Outcome::Canceled);
                }
                ctx.add_progress(batch);
                since_poll = 0;
            }
        }
        ctx.add_progress(since_poll);
        if ctx.is_canceled() {
            return Ok(Outcome::Canceled);
        }

        let tess = tri.finish(cell.clone(), positions.len());
        debug!(
            cells = tess.num_cells(),
            vertices = tess.num_vertices(),
            "tessellation finished"
        );
        Ok(Outcome::Completed(tess))
    }

    pub fn simulation_cell(&self) -> &SimulationCell {
        &self.cell
    }

    pub fn num_input_points(&self) -> usize {
        self.num_input_points
    }

    /// Number of finite vertices, input points and ghost images together.
    pub fn num_vertices(&self) -> usize {
        self.verts.len() - 1
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cells(&self) -> impl Iterator<Item = CellHandle> {
        0..self.cells.len() as u32
    }

    /// Iterates the finite vertices.
    pub fn vertices(&self) -> impl Iterator<Item = VertexHandle> {
        1..self.verts.len() as u32
    }

    pub fn vertex(&self, v: VertexHandle) -> &VertexPoint {
        &self.verts[v as usize]
    }

    pub fn is_infinite_vertex(&self, v: VertexHandle) -> bool {
        v == INFINITE_VERTEX
    }

    pub fn cell_vertex(&self, cell: CellHandle, corner: usize) -> VertexHandle {
        self.cells[cell as usize].verts[corner]
    }

    pub fn cell_vertices(&self, cell: CellHandle) -> [VertexHandle; 4] {
        self.cells[cell as usize].verts
    }

    pub fn cell_neighbor(&self, cell: CellHandle, facet: usize) -> CellHandle {
        self.cells[cell as usize].neighbors[facet]
    }

    /// Position of `neighbor` in the neighbor list of `cell`.
    pub fn neighbor_index(&self, cell: CellHandle, neighbor: CellHandle) -> usize {
        self.cells[cell as usize]
            .neighbors
            .iter()
            .position(|&n| n == neighbor)
            .unwrap_or_else(|| panic!("cells {cell} and {neighbor} are not adjacent"))
    }

    /// A cell is valid when all four vertices are finite.
    pub fn is_valid_cell(&self, cell: CellHandle) -> bool {
        !self.cells[cell as usize].verts.contains(&INFINITE_VERTEX)
    }

    /// Ghost cells duplicate a local cell through the periodic boundary, or
    /// touch the infinite vertex.
    pub fn is_ghost_cell(&self, cell: CellHandle) -> bool {
        self.cells[cell as usize].info.is_ghost
    }

    pub fn cell_flag(&self, cell: CellHandle) -> bool {
        self.cells[cell as usize].info.flag
    }

    pub fn set_cell_flag(&mut self, cell: CellHandle, flag: bool) {
        self.cells[cell as usize].info.flag = flag;
    }

    /// User-assigned cell index, zero until set.
    pub fn cell_index(&self, cell: CellHandle) -> i32 {
        self.cells[cell as usize].info.index
    }

    pub fn set_cell_index(&mut self, cell: CellHandle, index: i32) {
        self.cells[cell as usize].info.index = index;
    }

    pub fn facet_vertex(&self, facet: Facet, corner: usize) -> VertexHandle {
        self.cells[facet.cell as usize].verts[FACET_VERTICES[facet.facet][corner]]
    }

    /// The same facet seen from the adjacent cell.
    pub fn mirror_facet(&self, facet: Facet) -> Facet {
        let neighbor = self.cell_neighbor(facet.cell, facet.facet);
        Facet {
            cell: neighbor,
            facet: self.neighbor_index(neighbor, facet.cell),
        }
    }

    /// Volume of a valid cell.
    pub fn cell_volume(&self, cell: CellHandle) -> f64 {
        debug_assert!(self.is_valid_cell(cell));
        let [a, b, c, d] = self.cells[cell as usize]
            .verts
            .map(|v| self.verts[v as usize].pos);
        (b - a).cross(&(c - a)).dot(&(d - a)).abs() / 6.0
    }

    /// Finds a cell containing the point, walking from an arbitrary start
    /// cell. Points outside the convex hull land in an infinite cell.
    pub fn locate_point(&self, p: &Vector3<f64>) -> CellHandle {
        let mut cur = 0u32;
        let max_steps = self.cells.len() + 32;
        'walk: for _ in 0..max_steps {
            match self.infinite_slot(cur) {
                Some(slot) => {
                    if self.facet_orient(cur, slot, p) > 0.0 {
                        return cur;
                    }
                    cur = self.cells[cur as usize].neighbors[slot];
                }
                None => {
                    for f in 0..4 {
                        if self.facet_orient(cur, f, p) < 0.0 {
                            cur = self.cells[cur as usize].neighbors[f];
                            continue 'walk;
                        }
                    }
                    return cur;
                }
            }
        }
        // The walk exceeded its budget; scan instead.
        for c in self.cells() {
            match self.infinite_slot(c) {
                Some(slot) => {
                    if self.facet_orient(c, slot, p) >= 0.0 {
                        return c;
                    }
                }
                None => {
                    if (0..4).all(|f| self.facet_orient(c, f, p) >= 0.0) {
                        return c;
                    }
                }
            }
        }
        cur
    }

    /// All cells incident to a vertex, gathered by flooding across the
    /// facets that contain it.
    pub fn incident_cells(&self, v: VertexHandle) -> Vec<CellHandle> {
        let start = self.vertex_cell[v as usize];
        if start == NO_CELL {
            return Vec::new();
        }
        let mut found = vec![start];
        let mut seen = HashSet::from([start]);
        let mut stack = vec![start];
        while let Some(c) = stack.pop() {
            for f in 0..4 {
                // The neighbor across facet f shares all corners but f.
                if self.cells[c as usize].verts[f] == v {
                    continue;
                }
                let n = self.cells[c as usize].neighbors[f];
                if seen.insert(n) {
                    found.push(n);
                    stack.push(n);
                }
            }
        }
        found
    }

    fn infinite_slot(&self, cell: CellHandle) -> Option<usize> {
        self.cells[cell as usize]
            .verts
            .iter()
            .position(|&v| v == INFINITE_VERTEX)
    }

    fn facet_orient(&self, cell: CellHandle, facet: usize, p: &Vector3<f64>) -> f64 {
        let t = FACET_VERTICES[facet].map(|k| self.cells[cell as usize].verts[k]);
        debug_assert!(!t.contains(&INFINITE_VERTEX));
        orient3d(
            coord(&self.verts[t[0] as usize].pos),
            coord(&self.verts[t[1] as usize].pos),
            coord(&self.verts[t[2] as usize].pos),
            coord(p),
        )
    }
}

fn coord(p: &Vector3<f64>) -> Coord3D<f64> {
    Coord3D {
        x: p.x,
        y: p.y,
        z: p.z,
    }
}

fn coord2(x: f64, y: f64) -> Coord<f64> {
    Coord { x, y }
}

/// Exact collinearity test via the three axis-plane projections of the
/// cross product.
fn collinear(a: &Vector3<f64>, b: &Vector3<f64>, c: &Vector3<f64>) -> bool {
    orient2d(coord2(a.y, a.z), coord2(b.y, b.z), coord2(c.y, c.z)) == 0.0
        && orient2d(coord2(a.z, a.x), coord2(b.z, b.x), coord2(c.z, c.x)) == 0.0
        && orient2d(coord2(a.x, a.y), coord2(b.x, b.y), coord2(c.x, c.y)) == 0.0
}

struct BuildCell {
    verts: [u32; 4],
    neighbors: [u32; 4],
    alive: bool,
    mark_stamp: u32,
    mark_conflict: bool,
}

/// Incremental construction state. Cells are stored positively oriented;
/// for cells with the infinite vertex that holds after substituting any
/// point inside the hull region they border.
struct Triangulator {
    verts: Vec<VertexPoint>,
    cells: Vec<BuildCell>,
    free: Vec<u32>,
    stamp: u32,
    last_cell: u32,
    conflict_buf: Vec<u32>,
    boundary_buf: Vec<(u32, usize)>,
    queue_buf: Vec<u32>,
    ridge_map: HashMap<(u32, u32), (u32, usize)>,
}

impl Triangulator {
    fn new(verts: Vec<VertexPoint>) -> Self {
        Self {
            verts,
            cells: Vec::new(),
            free: Vec::new(),
            stamp: 0,
            last_cell: 0,
            conflict_buf: Vec::new(),
            boundary_buf: Vec::new(),
            queue_buf: Vec::new(),
            ridge_map: HashMap::new(),
        }
    }

    fn alloc_cell(&mut self, verts: [u32; 4]) -> u32 {
        if let Some(idx) = self.free.pop() {
            let cell = &mut self.cells[idx as usize];
            cell.verts = verts;
            cell.neighbors = [NO_CELL; 4];
            cell.alive = true;
            cell.mark_stamp = 0;
            cell.mark_conflict = false;
            idx
        } else {
            self.cells.push(BuildCell {
                verts,
                neighbors: [NO_CELL; 4],
                alive: true,
                mark_stamp: 0,
                mark_conflict: false,
            });
            (self.cells.len() - 1) as u32
        }
    }

    fn infinite_slot(&self, cell: u32) -> Option<usize> {
        self.cells[cell as usize]
            .verts
            .iter()
            .position(|&v| v == INFINITE_VERTEX)
    }

    fn facet_orient(&self, cell: u32, facet: usize, p: &Vector3<f64>) -> f64 {
        let t = FACET_VERTICES[facet].map(|k| self.cells[cell as usize].verts[k]);
        debug_assert!(!t.contains(&INFINITE_VERTEX));
        orient3d(
            coord(&self.verts[t[0] as usize].pos),
            coord(&self.verts[t[1] as usize].pos),
            coord(&self.verts[t[2] as usize].pos),
            coord(p),
        )
    }

    fn circumsphere_contains(&self, cell: u32, p: &Vector3<f64>) -> bool {
        let vs = self.cells[cell as usize]
            .verts
            .map(|v| self.verts[v as usize].pos);
        insphere(
            coord(&vs[0]),
            coord(&vs[1]),
            coord(&vs[2]),
            coord(&vs[3]),
            coord(p),
        ) > 0.0
    }

    /// Conflict test for the Bowyer-Watson cavity. A finite cell conflicts
    /// when the point lies strictly inside its circumsphere. An infinite
    /// cell conflicts when the point lies strictly outside its hull facet;
    /// on the facet plane, the mirror finite cell decides, which keeps
    /// coplanar hull points from producing flat cells.
    fn in_conflict(&self, cell: u32, p: &Vector3<f64>) -> bool {
        match self.infinite_slot(cell) {
            Some(slot) => {
                let o = self.facet_orient(cell, slot, p);
                if o > 0.0 {
                    true
                } else if o < 0.0 {
                    false
                } else {
                    let mirror = self.cells[cell as usize].neighbors[slot];
                    debug_assert!(self.infinite_slot(mirror).is_none());
                    self.circumsphere_contains(mirror, p)
                }
            }
            None => self.circumsphere_contains(cell, p),
        }
    }

    /// Walks from `hint` toward the cell containing `p`. Each step crosses a
    /// facet the point lies strictly outside of. Falls back to the caller's
    /// conflict scan if the walk exceeds its budget.
    fn locate(&self, p: &Vector3<f64>, hint: u32) -> u32 {
        debug_assert!(self.cells[hint as usize].alive);
        let mut cur = hint;
        let max_steps = self.cells.len() + 32;
        'walk: for _ in 0..max_steps {
            match self.infinite_slot(cur) {
                Some(slot) => {
                    if self.facet_orient(cur, slot, p) > 0.0 {
                        return cur;
                    }
                    cur = self.cells[cur as usize].neighbors[slot];
                }
                None => {
                    for f in 0..4 {
                        if self.facet_orient(cur, f, p) < 0.0 {
                            cur = self.cells[cur as usize].neighbors[f];
                            continue 'walk;
                        }
                    }
                    return cur;
                }
            }
        }
        cur
    }

    fn find_global_conflict(&self, p: &Vector3<f64>) -> Option<u32> {
        (0..self.cells.len() as u32)
            .find(|&c| self.cells[c as usize].alive && self.in_conflict(c, p))
    }

    /// Picks the first four usable vertices, orients them positively and
    /// closes the hull with four infinite cells.
    fn build_first_cell(&mut self) -> Result<[u32; 4], TessellationError> {
        let n = self.verts.len() as u32;
        if n < 5 {
            return Err(TessellationError::Degenerate);
        }
        let i0 = 1u32;
        let p0 = self.verts[i0 as usize].pos;
        let i1 = (i0 + 1..n)
            .find(|&v| self.verts[v as usize].pos != p0)
            .ok_or(TessellationError::Degenerate)?;
        let p1 = self.verts[i1 as usize].pos;
        let i2 = (i1 + 1..n)
            .find(|&v| !collinear(&p0, &p1, &self.verts[v as usize].pos))
            .ok_or(TessellationError::Degenerate)?;
        let p2 = self.verts[i2 as usize].pos;
        let i3 = (i2 + 1..n)
            .find(|&v| {
                orient3d(
                    coord(&p0),
                    coord(&p1),
                    coord(&p2),
                    coord(&self.verts[v as usize].pos),
                ) != 0.0
            })
            .ok_or(TessellationError::Degenerate)?;
        let p3 = self.verts[i3 as usize].pos;

        let o = orient3d(coord(&p0), coord(&p1), coord(&p2), coord(&p3));
        let initial = if o > 0.0 {
            [i0, i1, i2, i3]
        } else {
            [i0, i1, i3, i2]
        };
        let first = self.alloc_cell(initial);

        // One infinite cell per hull facet, positively oriented under
        // substitution of the infinite vertex.
        let mut created = [first; 5];
        for f in 0..4 {
            let t = FACET_VERTICES[f].map(|k| self.cells[first as usize].verts[k]);
            created[f + 1] = self.alloc_cell([t[0], t[2], t[1], INFINITE_VERTEX]);
        }

        // Wire all 20 facets by their sorted vertex triples.
        let mut facet_map: HashMap<[u32; 3], (u32, usize)> = HashMap::new();
        for &cell in &created {
            for f in 0..4 {
                let mut key = FACET_VERTICES[f].map(|k| self.cells[cell as usize].verts[k]);
                key.sort_unstable();
                match facet_map.entry(key) {
                    Entry::Occupied(e) => {
                        let (other, other_f) = e.remove();
                        self.cells[cell as usize].neighbors[f] = other;
                        self.cells[other as usize].neighbors[other_f] = cell;
                    }
                    Entry::Vacant(e) => {
                        e.insert((cell, f));
                    }
                }
            }
        }
        debug_assert!(facet_map.is_empty());

        self.last_cell = first;
        Ok(initial)
    }

    /// Inserts one vertex: finds the conflict region around it, removes it
    /// and stitches a fan of new cells from the cavity boundary to the
    /// vertex.
    fn insert(&mut self, vertex: u32) -> Result<(), TessellationError> {
        let p = self.verts[vertex as usize].pos;
        let mut seed = self.locate(&p, self.last_cell);
        if !self.in_conflict(seed, &p) {
            // Walk stalled on a degenerate configuration; scan for any
            // conflicting cell instead. A point with an empty conflict
            // region duplicates an existing vertex.
            seed = self
                .find_global_conflict(&p)
                .ok_or(TessellationError::Degenerate)?;
        }

        self.stamp += 1;
        let stamp = self.stamp;
        let mut conflict = std::mem::take(&mut self.conflict_buf);
        let mut boundary = std::mem::take(&mut self.boundary_buf);
        let mut queue = std::mem::take(&mut self.queue_buf);
        let mut ridges = std::mem::take(&mut self.ridge_map);
        conflict.clear();
        boundary.clear();
        queue.clear();
        ridges.clear();

        // Flood the conflict region, recording its boundary facets.
        self.cells[seed as usize].mark_stamp = stamp;
        self.cells[seed as usize].mark_conflict = true;
        conflict.push(seed);
        queue.push(seed);
        while let Some(c) = queue.pop() {
            for f in 0..4 {
                let n = self.cells[c as usize].neighbors[f];
                let ncell = &self.cells[n as usize];
                let (seen, was_conflict) = (ncell.mark_stamp == stamp, ncell.mark_conflict);
                if seen {
                    if !was_conflict {
                        boundary.push((c, f));
                    }
                } else if self.in_conflict(n, &p) {
                    let ncell = &mut self.cells[n as usize];
                    ncell.mark_stamp = stamp;
                    ncell.mark_conflict = true;
                    conflict.push(n);
                    queue.push(n);
                } else {
                    let ncell = &mut self.cells[n as usize];
                    ncell.mark_stamp = stamp;
                    ncell.mark_conflict = false;
                    boundary.push((c, f));
                }
            }
        }

        // Retriangulate the cavity: one new cell per boundary facet, glued
        // to its siblings through the shared ridges.
        let mut last = NO_CELL;
        for &(c, f) in &boundary {
            let outside = self.cells[c as usize].neighbors[f];
            let outside_f = self.cells[outside as usize]
                .neighbors
                .iter()
                .position(|&x| x == c)
                .unwrap_or(usize::MAX);
            debug_assert!(outside_f < 4);
            let t = FACET_VERTICES[f].map(|k| self.cells[c as usize].verts[k]);
            let fresh = self.alloc_cell([t[0], t[1], t[2], vertex]);
            self.cells[fresh as usize].neighbors[3] = outside;
            self.cells[outside as usize].neighbors[outside_f] = fresh;
            for (slot, (a, b)) in [(t[1], t[2]), (t[0], t[2]), (t[0], t[1])]
                .into_iter()
                .enumerate()
            {
                let key = if a < b { (a, b) } else { (b, a) };
                match ridges.entry(key) {
                    Entry::Occupied(e) => {
                        let (sibling, sibling_slot) = e.remove();
                        self.cells[fresh as usize].neighbors[slot] = sibling;
                        self.cells[sibling as usize].neighbors[sibling_slot] = fresh;
                    }
                    Entry::Vacant(e) => {
                        e.insert((fresh, slot));
                    }
                }
            }
            last = fresh;
        }
        debug_assert!(last != NO_CELL);
        debug_assert!(ridges.is_empty());

        for &c in &conflict {
            self.cells[c as usize].alive = false;
            self.free.push(c);
        }
        self.last_cell = last;

        self.conflict_buf = conflict;
        self.boundary_buf = boundary;
        self.queue_buf = queue;
        self.ridge_map = ridges;
        Ok(())
    }

    /// Compacts the cell storage and classifies ghost cells. A finite cell
    /// is local when its head vertex is a non-ghost copy, where the head is
    /// the vertex with the smallest input index, non-ghost copies winning
    /// ties. Each periodic image of a cell picks the same head atom, so
    /// exactly one image is local.
    fn finish(self, cell: SimulationCell, num_input_points: usize) -> DelaunayTessellation {
        let mut remap = vec![NO_CELL; self.cells.len()];
        let mut cells = Vec::with_capacity(self.cells.len() - self.free.len());
        for (i, bc) in self.cells.iter().enumerate() {
            if bc.alive {
                remap[i] = cells.len() as u32;
                cells.push(CellData {
                    verts: bc.verts,
                    neighbors: bc.neighbors,
                    info: CellInfo::default(),
                });
            }
        }
        for cd in &mut cells {
            for nb in &mut cd.neighbors {
                *nb = remap[*nb as usize];
                debug_assert!(*nb != NO_CELL);
            }
        }

        let verts = self.verts;
        let mut vertex_cell = vec![NO_CELL; verts.len()];
        for (ci, cd) in cells.iter().enumerate() {
            for &v in &cd.verts {
                vertex_cell[v as usize] = ci as u32;
            }
        }

        for cd in &mut cells {
            cd.info.is_ghost = if cd.verts.contains(&INFINITE_VERTEX) {
                true
            } else {
                let mut head = &verts[cd.verts[0] as usize];
                for &v in &cd.verts[1..] {
                    let cand = &verts[v as usize];
                    if cand.input_index < head.input_index
                        || (cand.input_index == head.input_index && !cand.is_ghost)
                    {
                        head = cand;
                    }
                }
                head.is_ghost
            };
        }

        DelaunayTessellation {
            cell,
            verts,
            cells,
            vertex_cell,
            num_input_points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn open_cell(size: f64) -> SimulationCell {
        SimulationCell::orthorhombic(
            Vector3::new(size, size, size),
            Vector3::new(false, false, false),
        )
        .unwrap()
    }

    /// Low-discrepancy point cloud, no collinear runs.
    fn quasirandom_cloud(n: usize, size: f64) -> Vec<Vector3<f64>> {
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

    #[test]
    fn test_structural_validity_open_cell() {
        let cell = open_cell(10.0);
        let points = quasirandom_cloud(60, 10.0);
        let ctx = ComputeContext::new();
        let tess = DelaunayTessellation::generate(&cell, &points, 1.0, &ctx)
            .unwrap()
            .completed()
            .unwrap();

        // No periodic axis, no ghost vertices.
        assert_eq!(tess.num_vertices(), points.len());
        assert_eq!(tess.num_input_points(), points.len());

        let mut valid_cells = 0;
        for c in tess.cells() {
            for f in 0..4 {
                let facet = Facet { cell: c, facet: f };
                let mirror = tess.mirror_facet(facet);
                assert_eq!(tess.cell_neighbor(mirror.cell, mirror.facet), c);
                assert_eq!(tess.mirror_facet(mirror), facet);
            }
            if !tess.is_valid_cell(c) {
                assert!(tess.is_ghost_cell(c));
                continue;
            }
            assert!(!tess.is_ghost_cell(c));
            valid_cells += 1;

            let vs = tess.cell_vertices(c).map(|v| tess.vertex(v).pos);
            assert!(
                orient3d(coord(&vs[0]), coord(&vs[1]), coord(&vs[2]), coord(&vs[3])) > 0.0,
                "cell {c} is not positively oriented"
            );
            // Delaunay property: no other vertex strictly inside the
            // circumsphere.
            for w in tess.vertices() {
                let q = tess.vertex(w).pos;
                assert!(
                    insphere(
                        coord(&vs[0]),
                        coord(&vs[1]),
                        coord(&vs[2]),
                        coord(&vs[3]),
                        coord(&q)
                    ) <= 0.0,
                    "vertex {w} violates the empty circumsphere of cell {c}"
                );
            }
        }
        assert!(valid_cells > 0);
    }

    #[test]
    fn test_vertices_track_input_points() {
        let cell = open_cell(10.0);
        let points = quasirandom_cloud(25, 10.0);
        let ctx = ComputeContext::new();
        let tess = DelaunayTessellation::generate(&cell, &points, 1.0, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        for (i, v) in tess.vertices().enumerate() {
            let vp = tess.vertex(v);
            assert_eq!(vp.input_index, i as i32);
            assert!(!vp.is_ghost);
            assert!((vp.pos - points[i]).norm() <= 2.0 * PERTURBATION_MAGNITUDE);
        }
    }

    #[test]
    fn test_locate_point_containment() {
        let cell = open_cell(8.0);
        let points = quasirandom_cloud(40, 8.0);
        let ctx = ComputeContext::new();
        let tess = DelaunayTessellation::generate(&cell, &points, 1.0, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        for probe in quasirandom_cloud(15, 6.0) {
            let probe = probe + Vector3::new(1.0, 1.0, 1.0);
            let c = tess.locate_point(&probe);
            if tess.is_valid_cell(c) {
                let vs = tess.cell_vertices(c).map(|v| tess.vertex(v).pos);
                for f in 0..4 {
                    let t = FACET_VERTICES[f];
                    assert!(
                        orient3d(
                            coord(&vs[t[0]]),
                            coord(&vs[t[1]]),
                            coord(&vs[t[2]]),
                            coord(&probe)
                        ) >= 0.0
                    );
                }
            }
        }
    }

    #[test]
    fn test_incident_cells_consistency() {
        let cell = open_cell(10.0);
        let points = quasirandom_cloud(30, 10.0);
        let ctx = ComputeContext::new();
        let tess = DelaunayTessellation::generate(&cell, &points, 1.0, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        for v in tess.vertices() {
            let incident = tess.incident_cells(v);
            assert!(!incident.is_empty());
            for &c in &incident {
                assert!(tess.cell_vertices(c).contains(&v));
            }
            // Exhaustive cross-check.
            let expected = tess
                .cells()
                .filter(|&c| tess.cell_vertices(c).contains(&v))
                .count();
            assert_eq!(incident.len(), expected);
        }
    }

    #[test]
    fn test_single_point_periodic_cell() {
        let cell = SimulationCell::orthorhombic(
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(true, true, true),
        )
        .unwrap();
        let points = vec![Vector3::new(0.3, 0.4, 0.6)];
        let ctx = ComputeContext::new();
        let tess = DelaunayTessellation::generate(&cell, &points, 0.9, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(tess.num_input_points(), 1);
        assert!(tess.num_vertices() > 1);
        let mut valid = 0;
        for c in tess.cells() {
            if tess.is_valid_cell(c) {
                valid += 1;
                assert!(tess.cell_volume(c) > 0.0);
                for v in tess.cell_vertices(c) {
                    assert_eq!(tess.vertex(v).input_index, 0);
                }
            }
        }
        assert!(valid > 0);
    }

    #[test]
    fn test_cell_flags_and_indices() {
        let cell = open_cell(5.0);
        let points = quasirandom_cloud(10, 5.0);
        let ctx = ComputeContext::new();
        let mut tess = DelaunayTessellation::generate(&cell, &points, 1.0, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        let c = tess.cells().find(|&c| tess.is_valid_cell(c)).unwrap();
        assert!(!tess.cell_flag(c));
        assert_eq!(tess.cell_index(c), 0);
        tess.set_cell_flag(c, true);
        tess.set_cell_index(c, 42);
        assert!(tess.cell_flag(c));
        assert_eq!(tess.cell_index(c), 42);
    }

    #[test]
    fn test_degenerate_and_invalid_inputs() {
        let cell = open_cell(10.0);
        let ctx = ComputeContext::new();
        let too_few = quasirandom_cloud(3, 10.0);
        assert_eq!(
            DelaunayTessellation::generate(&cell, &too_few, 1.0, &ctx).unwrap_err(),
            TessellationError::Degenerate
        );
        let points = quasirandom_cloud(10, 10.0);
        assert_eq!(
            DelaunayTessellation::generate(&cell, &points, 0.0, &ctx).unwrap_err(),
            TessellationError::InvalidGhostLayer
        );
        assert_eq!(
            DelaunayTessellation::generate(&cell, &points, f64::NAN, &ctx).unwrap_err(),
            TessellationError::InvalidGhostLayer
        );
    }

    #[test]
    fn test_tetrahedra_tile_the_hull() {
        // The valid cells of an open cloud partition its convex hull; for a
        // cloud with known hull, volumes must add up.
        let cell = open_cell(4.0);
        // Cube corners plus interior points: the hull is the cube itself.
        let mut points = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(4.0, 0.0, 0.0),
            Vector3::new(0.0, 4.0, 0.0),
            Vector3::new(0.0, 0.0, 4.0),
            Vector3::new(4.0, 4.0, 0.0),
            Vector3::new(4.0, 0.0, 4.0),
            Vector3::new(0.0, 4.0, 4.0),
            Vector3::new(4.0, 4.0, 4.0),
        ];
        points.extend(quasirandom_cloud(20, 2.0).iter().map(|p| p + Vector3::new(1.0, 1.0, 1.0)));
        let ctx = ComputeContext::new();
        let tess = DelaunayTessellation::generate(&cell, &points, 1.0, &ctx)
            .unwrap()
            .completed()
            .unwrap();
        let total: f64 = tess
            .cells()
            .filter(|&c| tess.is_valid_cell(c))
            .map(|c| tess.cell_volume(c))
            .sum();
        // The perturbation moves the hull corners by up to 1e-8.
        assert_relative_eq!(total, 64.0, epsilon = 1e-5);
    }

    #[test]
    fn test_cancellation() {
        let cell = open_cell(10.0);
        let points = quasirandom_cloud(50, 10.0);
        let ctx = ComputeContext::new();
        ctx.cancel();
        assert!(DelaunayTessellation::generate(&cell, &points, 1.0, &ctx)
            .unwrap()
            .is_canceled());
    }
}
