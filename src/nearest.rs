use nalgebra::Vector3;
use tracing::{debug, info_span};

use crate::cell::SimulationCell;

/// Leaves stop splitting at this depth no matter how full they get.
const MAX_TREE_DEPTH: usize = 17;

/// Child/list terminator.
const NIL: u32 = u32::MAX;

/// A neighbor produced by a k-NN query: displacement from the query point to
/// the neighbor image, its squared length, and the particle index.
#[derive(Clone, Copy, Debug)]
pub struct Neighbor {
    pub delta: Vector3<f64>,
    pub distance_sq: f64,
    pub index: usize,
}

impl Default for Neighbor {
    fn default() -> Self {
        Self {
            delta: Vector3::zeros(),
            distance_sq: f64::INFINITY,
            index: usize::MAX,
        }
    }
}

/// Fixed-capacity max-heap keeping the `k` smallest items seen so far.
///
/// While not full, inserts sift up; once full, an insert either bounces off
/// the current worst entry or replaces it and sifts down. `K` bounds the
/// runtime capacity `k` at compile time so queries never allocate.
pub struct BoundedPriorityQueue<const K: usize> {
    items: [Neighbor; K],
    len: usize,
    k: usize,
}

impl<const K: usize> BoundedPriorityQueue<K> {
    pub fn new(k: usize) -> Self {
        debug_assert!(k >= 1 && k <= K, "queue capacity out of range");
        Self {
            items: [Neighbor::default(); K],
            len: 0,
            k,
        }
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn full(&self) -> bool {
        self.len == self.k
    }

    /// Current k-th best squared distance (the heap maximum).
    pub fn top_distance_sq(&self) -> f64 {
        debug_assert!(self.len > 0);
        self.items[0].distance_sq
    }

    pub fn insert(&mut self, item: Neighbor) {
        if self.len < self.k {
            self.items[self.len] = item;
            self.len += 1;
            self.sift_up(self.len - 1);
        } else if item.distance_sq < self.items[0].distance_sq {
            self.items[0] = item;
            self.sift_down(0);
        }
    }

    fn sift_up(&mut self, mut child: usize) {
        while child > 0 {
            let parent = (child - 1) / 2;
            if self.items[parent].distance_sq >= self.items[child].distance_sq {
                break;
            }
            self.items.swap(parent, child);
            child = parent;
        }
    }

    fn sift_down(&mut self, mut parent: usize) {
        loop {
            let left = 2 * parent + 1;
            if left >= self.len {
                break;
            }
            let right = left + 1;
            let mut largest = parent;
            if self.items[left].distance_sq > self.items[largest].distance_sq {
                largest = left;
            }
            if right < self.len && self.items[right].distance_sq > self.items[largest].distance_sq
            {
                largest = right;
            }
            if largest == parent {
                break;
            }
            self.items.swap(parent, largest);
            parent = largest;
        }
    }

    /// Orders the kept items ascending by distance. Call once after the last
    /// insert; the heap shape is not maintained afterwards.
    pub fn sort_ascending(&mut self) {
        self.items[..self.len].sort_unstable_by(|a, b| {
            a.distance_sq
                .partial_cmp(&b.distance_sq)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    pub fn as_slice(&self) -> &[Neighbor] {
        &self.items[..self.len]
    }
}

#[derive(Clone, Copy, Debug)]
struct FracBox {
    min: Vector3<f64>,
    max: Vector3<f64>,
}

impl FracBox {
    fn size(&self, dim: usize) -> f64 {
        self.max[dim] - self.min[dim]
    }
}

struct TreeNode {
    bounds: FracBox,
    /// NIL for leaves; otherwise the two children are at `children[0..2]`.
    children: [u32; 2],
    split_dim: usize,
    split_pos: f64,
    /// Head of the particle list (leaves only).
    head: u32,
    count: u32,
}

impl TreeNode {
    fn leaf(bounds: FracBox) -> Self {
        Self {
            bounds,
            children: [NIL, NIL],
            split_dim: 0,
            split_pos: 0.0,
            head: NIL,
            count: 0,
        }
    }

    fn is_leaf(&self) -> bool {
        self.children[0] == NIL
    }
}

struct TreeAtom {
    /// Position wrapped into the home image (absolute coordinates).
    pos: Vector3<f64>,
    next: u32,
}

/// Binary space partition over fractional coordinates answering k-nearest-
/// neighbor queries under periodic boundary conditions.
///
/// Periodic images are never inserted into the tree; instead every query is
/// replayed for each relevant whole-cell shift, with a bounding-box distance
/// bound pruning shifts and subtrees that cannot beat the current k-th best.
pub struct NearestNeighborFinder {
    num_neighbors: usize,
    bucket_size: usize,
    cell: SimulationCell,
    plane_normals: [Vector3<f64>; 3],
    /// Whole-cell shift vectors to replay queries over, nearest image first.
    pbc_images: Vec<Vector3<f64>>,
    nodes: Vec<TreeNode>,
    atoms: Vec<TreeAtom>,
}

impl NearestNeighborFinder {
    /// Builds the tree for `k`-nearest queries over the given particle set.
    /// `num_neighbors` sizes the leaf buckets; queries request up to that
    /// many results.
    pub fn prepare(
        num_neighbors: usize,
        positions: &[Vector3<f64>],
        cell: &SimulationCell,
    ) -> Self {
        let _span =
            info_span!("NearestNeighborFinder::prepare", n_atoms = positions.len()).entered();
        debug_assert!(num_neighbors >= 1);
        let bucket_size = (num_neighbors * 2).max(16);

        let plane_normals = [
            cell.cell_normal_vector(0),
            cell.cell_normal_vector(1),
            cell.cell_normal_vector(2),
        ];

        // 1. Periodic image shifts, nearest first. The home image (zero
        // shift) always leads.
        let mut pbc_images = Vec::new();
        let rx = cell.is_periodic(0) as i32;
        let ry = cell.is_periodic(1) as i32;
        let rz = cell.is_periodic(2) as i32;
        for ix in -rx..=rx {
            for iy in -ry..=ry {
                for iz in -rz..=rz {
                    pbc_images.push(cell.to_cartesian_vector(&Vector3::new(
                        ix as f64, iy as f64, iz as f64,
                    )));
                }
            }
        }
        pbc_images.sort_by(|a, b| {
            a.norm_squared()
                .partial_cmp(&b.norm_squared())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        // 2. Root box: the unit cube, widened along non-periodic axes to
        // cover particles lying outside the cell.
        let mut bounds = FracBox {
            min: Vector3::zeros(),
            max: Vector3::new(1.0, 1.0, 1.0),
        };
        for pos in positions {
            let frac = cell.to_fractional(pos);
            for dim in 0..3 {
                if !cell.is_periodic(dim) {
                    bounds.min[dim] = bounds.min[dim].min(frac[dim]);
                    bounds.max[dim] = bounds.max[dim].max(frac[dim]);
                }
            }
        }

        let mut finder = Self {
            num_neighbors,
            bucket_size,
            cell: cell.clone(),
            plane_normals,
            pbc_images,
            nodes: vec![TreeNode::leaf(bounds)],
            atoms: Vec::with_capacity(positions.len()),
        };

        // 3. Pre-split the root three levels (X, Y, Z) for balance.
        finder.split_leaf(0, 0);
        for child in finder.nodes[0].children {
            finder.split_leaf(child as usize, 1);
        }
        for level1 in finder.nodes[0].children {
            for child in finder.nodes[level1 as usize].children {
                finder.split_leaf(child as usize, 2);
            }
        }

        // 4. Insert particles one at a time, wrapping periodic coordinates.
        for pos in positions {
            let frac = cell.to_fractional(pos);
            let mut wrapped = *pos;
            let mut frac_wrapped = frac;
            for dim in 0..3 {
                if cell.is_periodic(dim) {
                    let s = frac[dim].floor();
                    if s != 0.0 {
                        frac_wrapped[dim] -= s;
                        wrapped -= s * cell.h().column(dim);
                    }
                }
            }
            finder.insert(wrapped, frac_wrapped);
        }

        debug!(
            nodes = finder.nodes.len(),
            atoms = finder.atoms.len(),
            images = finder.pbc_images.len(),
            "neighbor tree ready"
        );
        finder
    }

    pub fn num_neighbors(&self) -> usize {
        self.num_neighbors
    }

    pub fn num_particles(&self) -> usize {
        self.atoms.len()
    }

    /// The stored (periodicity-wrapped) position of a particle, the natural
    /// query point for per-particle analysis loops.
    pub fn particle_pos(&self, index: usize) -> Vector3<f64> {
        self.atoms[index].pos
    }

    fn insert(&mut self, pos: Vector3<f64>, frac: Vector3<f64>) {
        let atom_index = self.atoms.len() as u32;
        self.atoms.push(TreeAtom { pos, next: NIL });

        let mut node = 0usize;
        let mut depth = 0usize;
        loop {
            if self.nodes[node].is_leaf() {
                let head = self.nodes[node].head;
                self.atoms[atom_index as usize].next = head;
                self.nodes[node].head = atom_index;
                self.nodes[node].count += 1;
                if self.nodes[node].count as usize > self.bucket_size && depth < MAX_TREE_DEPTH {
                    let dim = self.largest_extent_dim(node);
                    self.split_leaf(node, dim);
                }
                return;
            }
            let split_dim = self.nodes[node].split_dim;
            let split_pos = self.nodes[node].split_pos;
            node = self.nodes[node].children[(frac[split_dim] >= split_pos) as usize] as usize;
            depth += 1;
        }
    }

    /// Axis with the largest physical extent of a leaf's box.
    fn largest_extent_dim(&self, node: usize) -> usize {
        let bounds = &self.nodes[node].bounds;
        let mut best = 0;
        let mut best_extent = 0.0;
        for dim in 0..3 {
            let size = bounds.size(dim);
            let extent = self.cell.h().column(dim).norm_squared() * size * size;
            if extent > best_extent {
                best_extent = extent;
                best = dim;
            }
        }
        best
    }

    fn split_leaf(&mut self, node: usize, dim: usize) {
        let bounds = self.nodes[node].bounds;
        let split_pos = (bounds.min[dim] + bounds.max[dim]) * 0.5;

        let mut lower_bounds = bounds;
        lower_bounds.max[dim] = split_pos;
        let mut upper_bounds = bounds;
        upper_bounds.min[dim] = split_pos;

        let lower = self.nodes.len() as u32;
        self.nodes.push(TreeNode::leaf(lower_bounds));
        let upper = self.nodes.len() as u32;
        self.nodes.push(TreeNode::leaf(upper_bounds));

        // Re-thread the particle list onto the two children.
        let mut cursor = self.nodes[node].head;
        while cursor != NIL {
            let atom = cursor as usize;
            let next = self.atoms[atom].next;
            let frac_d = self.cell.to_fractional(&self.atoms[atom].pos)[dim];
            let child = if frac_d < split_pos { lower } else { upper } as usize;
            self.atoms[atom].next = self.nodes[child].head;
            self.nodes[child].head = cursor;
            self.nodes[child].count += 1;
            cursor = next;
        }

        let parent = &mut self.nodes[node];
        parent.children = [lower, upper];
        parent.split_dim = dim;
        parent.split_pos = split_pos;
        parent.head = NIL;
        parent.count = 0;
    }

    /// Lower bound on the squared distance from `q` to any point inside a
    /// node's box, from the signed distances to the six bounding planes.
    fn minimum_distance(&self, bounds: &FracBox, q: &Vector3<f64>) -> f64 {
        let p1 = self.cell.to_cartesian(&bounds.min) - q;
        let p2 = q - self.cell.to_cartesian(&bounds.max);
        let mut min_distance = 0.0f64;
        for dim in 0..3 {
            let t_min = self.plane_normals[dim].dot(&p1);
            if t_min > min_distance {
                min_distance = t_min;
            }
            let t_max = self.plane_normals[dim].dot(&p2);
            if t_max > min_distance {
                min_distance = t_max;
            }
        }
        min_distance * min_distance
    }
}

/// Reusable k-NN query scratch. `K` is the compile-time cap on `k`; build one
/// per worker thread and call [`find_neighbors`](Self::find_neighbors) for
/// each particle.
pub struct NeighborQuery<'a, const K: usize> {
    finder: &'a NearestNeighborFinder,
    queue: BoundedPriorityQueue<K>,
}

impl<'a, const K: usize> NeighborQuery<'a, K> {
    pub fn new(finder: &'a NearestNeighborFinder) -> Self {
        debug_assert!(
            finder.num_neighbors <= K,
            "query type parameter K must cover the finder's neighbor count"
        );
        Self {
            queue: BoundedPriorityQueue::new(finder.num_neighbors.min(K)),
            finder,
        }
    }

    /// Finds up to `k` nearest neighbors of a point. A particle lying exactly
    /// on the query point (the particle itself, under the zero shift) is
    /// skipped. Results come out sorted ascending by distance.
    pub fn find_neighbors(&mut self, query: Vector3<f64>) {
        self.queue.clear();
        let root = &self.finder.nodes[0];
        for image in &self.finder.pbc_images {
            let q = query - image;
            if self.queue.full()
                && self.queue.top_distance_sq() <= self.finder.minimum_distance(&root.bounds, &q)
            {
                continue;
            }
            let qr = self.finder.cell.to_fractional(&q);
            self.visit(0, &q, &qr);
        }
        self.queue.sort_ascending();
    }

    /// Found neighbors, ascending by distance. Valid until the next call to
    /// `find_neighbors`.
    pub fn results(&self) -> &[Neighbor] {
        self.queue.as_slice()
    }

    fn visit(&mut self, node: usize, q: &Vector3<f64>, qr: &Vector3<f64>) {
        let finder = self.finder;
        let n = &finder.nodes[node];
        if n.is_leaf() {
            let mut cursor = n.head;
            while cursor != NIL {
                let atom = &finder.atoms[cursor as usize];
                let delta = atom.pos - q;
                let distance_sq = delta.norm_squared();
                if distance_sq != 0.0 {
                    self.queue.insert(Neighbor {
                        delta,
                        distance_sq,
                        index: cursor as usize,
                    });
                }
                cursor = atom.next;
            }
            return;
        }

        let in_lower = qr[n.split_dim] < n.split_pos;
        let (nearer, farther) = if in_lower {
            (n.children[0] as usize, n.children[1] as usize)
        } else {
            (n.children[1] as usize, n.children[0] as usize)
        };
        self.visit(nearer, q, qr);
        if !self.queue.full()
            || self.queue.top_distance_sq()
                > finder.minimum_distance(&finder.nodes[farther].bounds, q)
        {
            self.visit(farther, q, qr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    fn cubic_cell(length: f64, pbc: bool) -> SimulationCell {
        SimulationCell::orthorhombic(
            Vector3::new(length, length, length),
            Vector3::new(pbc, pbc, pbc),
        )
        .unwrap()
    }

    /// Brute-force k-NN over the same +-1 image convention the tree uses.
    fn reference_knn(
        cell: &SimulationCell,
        positions: &[Vector3<f64>],
        query: Vector3<f64>,
        k: usize,
    ) -> Vec<(usize, f64)> {
        let rx = cell.is_periodic(0) as i32;
        let ry = cell.is_periodic(1) as i32;
        let rz = cell.is_periodic(2) as i32;
        let mut all = Vec::new();
        for (j, pos) in positions.iter().enumerate() {
            let wrapped = cell.wrap_point(pos);
            for ix in -rx..=rx {
                for iy in -ry..=ry {
                    for iz in -rz..=rz {
                        let image = wrapped
                            + cell.to_cartesian_vector(&Vector3::new(
                                ix as f64, iy as f64, iz as f64,
                            ));
                        let d2 = (image - query).norm_squared();
                        if d2 != 0.0 {
                            all.push((j, d2));
                        }
                    }
                }
            }
        }
        all.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
        all.truncate(k);
        all
    }

    #[test]
    fn test_queue_keeps_k_smallest() {
        let mut queue: BoundedPriorityQueue<8> = BoundedPriorityQueue::new(4);
        for (i, d) in [9.0, 1.0, 7.0, 3.0, 5.0, 2.0, 8.0, 0.5].iter().enumerate() {
            queue.insert(Neighbor {
                delta: Vector3::zeros(),
                distance_sq: *d,
                index: i,
            });
            assert!(queue.len() <= 4);
        }
        assert!(queue.full());
        queue.sort_ascending();
        let kept: Vec<f64> = queue.as_slice().iter().map(|n| n.distance_sq).collect();
        assert_eq!(kept, vec![0.5, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_queue_top_tracks_worst() {
        let mut queue: BoundedPriorityQueue<4> = BoundedPriorityQueue::new(3);
        for d in [4.0, 2.0, 6.0] {
            queue.insert(Neighbor {
                distance_sq: d,
                ..Neighbor::default()
            });
        }
        assert_relative_eq!(queue.top_distance_sq(), 6.0);
        // Worse than the current worst: bounces off.
        queue.insert(Neighbor {
            distance_sq: 7.0,
            ..Neighbor::default()
        });
        assert_relative_eq!(queue.top_distance_sq(), 6.0);
        // Better: replaces the worst.
        queue.insert(Neighbor {
            distance_sq: 1.0,
            ..Neighbor::default()
        });
        assert_relative_eq!(queue.top_distance_sq(), 4.0);
    }

    #[test]
    fn test_simple_cubic_neighbors() {
        // Simple cubic lattice: 6 first neighbors at distance 1.
        let cell = cubic_cell(4.0, true);
        let mut positions = Vec::new();
        for x in 0..4 {
            for y in 0..4 {
                for z in 0..4 {
                    positions.push(Vector3::new(x as f64, y as f64, z as f64));
                }
            }
        }
        let finder = NearestNeighborFinder::prepare(6, &positions, &cell);
        let mut query: NeighborQuery<6> = NeighborQuery::new(&finder);
        for i in 0..positions.len() {
            query.find_neighbors(finder.particle_pos(i));
            let results = query.results();
            assert_eq!(results.len(), 6);
            for nb in results {
                assert_relative_eq!(nb.distance_sq, 1.0, epsilon = 1e-12);
                assert_ne!(nb.index, i);
            }
        }
    }

    #[test]
    fn test_results_sorted_and_match_reference() {
        let cell = cubic_cell(8.0, true);
        let positions: Vec<_> = (0..120)
            .map(|i| {
                let f = i as f64;
                Vector3::new(
                    (f * 0.937).rem_euclid(8.0),
                    (f * 1.741).rem_euclid(8.0),
                    (f * 2.393).rem_euclid(8.0),
                )
            })
            .collect();
        let finder = NearestNeighborFinder::prepare(10, &positions, &cell);
        let mut query: NeighborQuery<10> = NeighborQuery::new(&finder);

        for i in (0..positions.len()).step_by(7) {
            query.find_neighbors(finder.particle_pos(i));
            let results = query.results();
            let expected = reference_knn(&cell, &positions, finder.particle_pos(i), 10);
            assert_eq!(results.len(), expected.len());
            for (got, want) in results.iter().zip(&expected) {
                assert_eq!(got.index, want.0);
                assert_relative_eq!(got.distance_sq, want.1, epsilon = 1e-9);
                assert_relative_eq!(got.delta.norm_squared(), got.distance_sq, epsilon = 1e-9);
            }
            let mut prev = 0.0;
            for nb in results {
                assert!(nb.distance_sq >= prev);
                prev = nb.distance_sq;
            }
        }
    }

    #[test]
    fn test_open_and_mixed_boundaries() {
        let h = Matrix3::new(6.0, 0.5, 0.0, 0.0, 6.0, 0.0, 0.0, 0.0, 6.0);
        for pbc in [
            Vector3::new(false, false, false),
            Vector3::new(true, false, true),
        ] {
            let cell = SimulationCell::new(h, Vector3::new(1.0, -2.0, 0.0), pbc).unwrap();
            let positions: Vec<_> = (0..80)
                .map(|i| {
                    let f = i as f64;
                    Vector3::new(
                        1.0 + (f * 0.811).rem_euclid(6.0),
                        -2.0 + (f * 1.129).rem_euclid(6.0),
                        (f * 1.989).rem_euclid(6.0),
                    )
                })
                .collect();
            let finder = NearestNeighborFinder::prepare(8, &positions, &cell);
            let mut query: NeighborQuery<8> = NeighborQuery::new(&finder);
            for i in (0..positions.len()).step_by(11) {
                query.find_neighbors(finder.particle_pos(i));
                let expected = reference_knn(&cell, &positions, finder.particle_pos(i), 8);
                let got: Vec<(usize, f64)> = query
                    .results()
                    .iter()
                    .map(|nb| (nb.index, nb.distance_sq))
                    .collect();
                for (g, w) in got.iter().zip(&expected) {
                    assert_eq!(g.0, w.0);
                    assert_relative_eq!(g.1, w.1, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_query_reuse_is_idempotent() {
        let cell = cubic_cell(5.0, true);
        let positions: Vec<_> = (0..60)
            .map(|i| {
                let f = i as f64;
                Vector3::new(
                    (f * 0.731).rem_euclid(5.0),
                    (f * 1.213).rem_euclid(5.0),
                    (f * 1.671).rem_euclid(5.0),
                )
            })
            .collect();
        let finder = NearestNeighborFinder::prepare(5, &positions, &cell);
        let mut query: NeighborQuery<5> = NeighborQuery::new(&finder);

        query.find_neighbors(finder.particle_pos(3));
        let first: Vec<(usize, f64)> = query
            .results()
            .iter()
            .map(|nb| (nb.index, nb.distance_sq))
            .collect();
        query.find_neighbors(finder.particle_pos(17));
        query.find_neighbors(finder.particle_pos(3));
        let second: Vec<(usize, f64)> = query
            .results()
            .iter()
            .map(|nb| (nb.index, nb.distance_sq))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fewer_particles_than_k() {
        let cell = cubic_cell(10.0, false);
        let positions = vec![
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::new(2.0, 1.0, 1.0),
            Vector3::new(1.0, 2.5, 1.0),
        ];
        let finder = NearestNeighborFinder::prepare(8, &positions, &cell);
        let mut query: NeighborQuery<8> = NeighborQuery::new(&finder);
        query.find_neighbors(finder.particle_pos(0));
        assert_eq!(query.results().len(), 2);
    }

    #[cfg(test)]
    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn test_knn_matches_reference(
                pbc in prop::array::uniform3(any::<bool>()),
                k in 1usize..12,
                positions_data in prop::collection::vec(prop::collection::vec(0.0..7.0f64, 3), 13..50)
            ) {
                let cell = SimulationCell::orthorhombic(
                    Vector3::new(7.0, 7.0, 7.0),
                    Vector3::new(pbc[0], pbc[1], pbc[2]),
                )
                .unwrap();
                let positions: Vec<Vector3<f64>> = positions_data
                    .iter()
                    .map(|p| Vector3::new(p[0], p[1], p[2]))
                    .collect();

                let finder = NearestNeighborFinder::prepare(k, &positions, &cell);
                let mut query: NeighborQuery<12> = NeighborQuery::new(&finder);
                for i in 0..positions.len().min(10) {
                    query.find_neighbors(finder.particle_pos(i));
                    let expected = reference_knn(&cell, &positions, finder.particle_pos(i), k);
                    let got: Vec<usize> = query.results().iter().map(|nb| nb.index).collect();
                    let want: Vec<usize> = expected.iter().map(|e| e.0).collect();
                    prop_assert_eq!(got, want);
                }
            }
        }
    }
}
