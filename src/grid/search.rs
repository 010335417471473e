use std::cmp::Ordering;

use crate::geom::boxes::Box3;
use crate::{Point, Vector};

/// Compares two points along the given split axis (0, 1, 2), breaking ties
/// lexicographically on the remaining coordinates with axis cycling.
pub fn compare_on_axis(p1: &Point, p2: &Point, axis: usize) -> Ordering {
    for i in 0..3 {
        let a = (axis + i) % 3;
        match p1.axis(a).partial_cmp(&p2.axis(a)).unwrap_or(Ordering::Equal) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

#[derive(Debug, Clone, Copy)]
struct Node {
    /// Index into the site list of the point defining the split.
    site: usize,
    left: i32,
    right: i32,
}

/// A median-split k-d tree over a subset of site positions, stored as an
/// arena of nodes indexed by integer id (no parent pointers).
#[derive(Debug, Clone)]
pub struct KdTree {
    nodes: Vec<Node>,
    root: i32,
}

impl KdTree {
    /// Builds a tree over the sites selected by `ids`. The id slice is
    /// reordered in place.
    pub fn build(sites: &[Point], ids: &mut [usize]) -> Self {
        let mut nodes = Vec::with_capacity(ids.len());
        let root = Self::build_node(sites, ids, 0, &mut nodes);
        Self { nodes, root }
    }

    fn build_node(sites: &[Point], ids: &mut [usize], depth: usize, nodes: &mut Vec<Node>) -> i32 {
        if ids.is_empty() {
            return -1;
        }
        let median = ids.len() / 2;
        let axis = depth % 3;
        ids.select_nth_unstable_by(median, |&a, &b| {
            compare_on_axis(&sites[a], &sites[b], axis)
        });
        let site = ids[median];
        let (lo, rest) = ids.split_at_mut(median);
        let left = Self::build_node(sites, lo, depth + 1, nodes);
        let right = Self::build_node(sites, &mut rest[1..], depth + 1, nodes);
        nodes.push(Node { site, left, right });
        (nodes.len() - 1) as i32
    }

    /// Returns the site nearest to the query point, or None for an empty
    /// tree.
    pub fn nearest(&self, sites: &[Point], p: Point) -> Option<usize> {
        if self.root < 0 {
            return None;
        }
        let mut best = (usize::MAX, f64::MAX);
        self.nearest_below(sites, self.root, 0, p, &mut best);
        Some(best.0)
    }

    fn nearest_below(
        &self,
        sites: &[Point],
        node: i32,
        depth: usize,
        p: Point,
        best: &mut (usize, f64),
    ) {
        let n = self.nodes[node as usize];
        let axis = depth % 3;
        let split = sites[n.site].axis(axis);

        let d2 = sites[n.site].squared_distance_to(&p);
        if d2 < best.1 {
            *best = (n.site, d2);
        }

        let (near, far) = if p.axis(axis) < split {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };
        if near >= 0 {
            self.nearest_below(sites, near, depth + 1, p, best);
        }
        // only cross the split plane when the other side can hold a closer site
        let plane_d2 = (p.axis(axis) - split) * (p.axis(axis) - split);
        if far >= 0 && plane_d2 < best.1 {
            self.nearest_below(sites, far, depth + 1, p, best);
        }
    }

    /// Collects the `k` sites nearest to the query point, sorted by
    /// increasing squared distance.
    pub fn nearest_k(&self, sites: &[Point], p: Point, k: usize) -> Vec<(usize, f64)> {
        let mut best = KBest::new(k);
        if self.root >= 0 && k > 0 {
            self.nearest_k_below(sites, self.root, 0, p, &mut best);
        }
        best.items
    }

    fn nearest_k_below(
        &self,
        sites: &[Point],
        node: i32,
        depth: usize,
        p: Point,
        best: &mut KBest,
    ) {
        let n = self.nodes[node as usize];
        let axis = depth % 3;
        let split = sites[n.site].axis(axis);

        best.offer(n.site, sites[n.site].squared_distance_to(&p));

        let (near, far) = if p.axis(axis) < split {
            (n.left, n.right)
        } else {
            (n.right, n.left)
        };
        if near >= 0 {
            self.nearest_k_below(sites, near, depth + 1, p, best);
        }
        let plane_d2 = (p.axis(axis) - split) * (p.axis(axis) - split);
        if far >= 0 && plane_d2 < best.worst() {
            self.nearest_k_below(sites, far, depth + 1, p, best);
        }
    }
}

/// Bounded collection of the k smallest (distance, site) pairs, kept sorted.
struct KBest {
    k: usize,
    items: Vec<(usize, f64)>,
}

impl KBest {
    fn new(k: usize) -> Self {
        Self {
            k,
            items: Vec::with_capacity(k),
        }
    }

    fn worst(&self) -> f64 {
        if self.items.len() < self.k {
            f64::MAX
        } else {
            self.items.last().map_or(f64::MAX, |it| it.1)
        }
    }

    fn offer(&mut self, site: usize, d2: f64) {
        if d2 >= self.worst() {
            return;
        }
        let pos = self
            .items
            .partition_point(|it| it.1 < d2 || (it.1 == d2 && it.0 < site));
        self.items.insert(pos, (site, d2));
        if self.items.len() > self.k {
            self.items.pop();
        }
    }
}

/// A uniform nb x nb x nb subdivision of the domain box; each block lists
/// the ids of the cells whose (expanded) bounding box overlaps it.
#[derive(Debug, Clone)]
pub struct BlockGrid {
    nb: usize,
    lists: Vec<Vec<usize>>,
}

impl BlockGrid {
    /// The block count per axis for a mesh with `num_cells` cells.
    pub fn blocks_per_axis(num_cells: usize) -> usize {
        let nb = (3. * (num_cells as f64).powf(1. / 3.)).round() as usize;
        nb.clamp(3, 1000)
    }

    /// Builds the block lists from per-cell bounding boxes expanded by eps.
    pub fn build(extent: Box3, nb: usize, bboxes: &[Box3], eps: f64) -> Self {
        let mut lists = vec![Vec::new(); nb * nb * nb];
        for (m, bbox) in bboxes.iter().enumerate() {
            let margin = Vector::new(eps, eps, eps);
            let (i1, j1, k1) = extent.block_indices(bbox.min + (-margin), nb);
            let (i2, j2, k2) = extent.block_indices(bbox.max + margin, nb);
            for i in i1..=i2 {
                for j in j1..=j2 {
                    for k in k1..=k2 {
                        lists[(i * nb + j) * nb + k].push(m);
                    }
                }
            }
        }
        Self { nb, lists }
    }

    pub fn nb(&self) -> usize {
        self.nb
    }

    pub fn num_blocks(&self) -> usize {
        self.lists.len()
    }

    /// Flat index of the block containing the point.
    pub fn block_of(&self, extent: Box3, p: Point) -> usize {
        let (i, j, k) = extent.block_indices(p, self.nb);
        (i * self.nb + j) * self.nb + k
    }

    pub fn cells_in(&self, block: usize) -> &[usize] {
        &self.lists[block]
    }

    pub fn lists(&self) -> &[Vec<usize>] {
        &self.lists
    }
}
