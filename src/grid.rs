//! Voronoi mesh spatial grid: construction, point location and ray walks.

pub mod cell;
pub mod path;
pub mod search;
pub mod tessellation;

use anyhow::{bail, ensure, Result};
use log::{info, warn};
use rand::Rng;
use rayon::prelude::*;

use crate::geom::boxes::Box3;
use crate::grid::cell::VoronoiCell;
use crate::grid::path::GridPath;
use crate::grid::search::{BlockGrid, KdTree};
use crate::sim::random;
use crate::{Point, Vector};

/// Blocks holding more than this many cells get a k-d search tree.
const TREE_THRESHOLD: usize = 5;

/// Attempts at rejection-sampling a position inside a cell before giving up.
const MAX_POSITION_ATTEMPTS: usize = 10_000;

/// An immutable Voronoi tessellation of a box-shaped domain, with
/// acceleration structures for point location and ray traversal, and an
/// optional mass distribution for sampling emission positions.
pub struct VoronoiMesh {
    extent: Box3,
    eps: f64,
    cells: Vec<VoronoiCell>,
    sites: Vec<Point>,
    blocks: BlockGrid,
    trees: Vec<Option<KdTree>>,
    density: Vec<f64>,
    mass_cdf: Vec<f64>,
    total_mass: f64,
}

impl VoronoiMesh {
    /// Builds the tessellation of `extent` generated by `sites`.
    ///
    /// With `ignore_nearby_and_outliers` set, sites outside the domain and
    /// sites within a small tolerance of an earlier site are dropped;
    /// otherwise the caller guarantees the sites are distinct and interior.
    pub fn new(extent: Box3, sites: &[Point], ignore_nearby_and_outliers: bool) -> Result<Self> {
        Self::build(extent, sites, None, ignore_nearby_and_outliers)
    }

    /// Same as [`VoronoiMesh::new`] but also assigns a mass to every input
    /// site, enabling density queries and mass-weighted position sampling.
    pub fn with_masses(
        extent: Box3,
        sites: &[Point],
        masses: &[f64],
        ignore_nearby_and_outliers: bool,
    ) -> Result<Self> {
        ensure!(
            masses.len() == sites.len(),
            "site and mass lists differ in length ({} vs {})",
            sites.len(),
            masses.len()
        );
        Self::build(extent, sites, Some(masses), ignore_nearby_and_outliers)
    }

    fn build(
        extent: Box3,
        input_sites: &[Point],
        masses: Option<&[f64]>,
        ignore_nearby_and_outliers: bool,
    ) -> Result<Self> {
        let eps = 1e-12 * extent.widths().length();
        let num_input = input_sites.len();

        // select the sites that generate cells
        let retained = if ignore_nearby_and_outliers {
            filter_sites(extent, input_sites, eps)
        } else {
            (0..num_input).collect::<Vec<_>>()
        };
        let num_ignored = num_input - retained.len();
        if num_ignored == 0 {
            info!("Number of sites: {num_input}");
        } else {
            info!("Number of sites ignored: {num_ignored}");
            info!("Number of sites retained: {}", retained.len());
        }

        let sites: Vec<Point> = retained.iter().map(|&i| input_sites[i]).collect();
        let num_cells = sites.len();

        // compute the cell geometry, one cell per retained site
        let cells: Vec<VoronoiCell> = if num_cells > 0 {
            let mut ids: Vec<usize> = (0..num_cells).collect();
            let site_tree = KdTree::build(&sites, &mut ids);
            (0..num_cells)
                .into_par_iter()
                .map(|m| tessellation::compute_cell(m, &sites, &site_tree, extent, eps))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        if num_cells > 0 {
            let counts: Vec<usize> = cells.iter().map(|c| c.neighbors().len()).collect();
            info!("Computed Voronoi tessellation with {num_cells} cells");
            info!(
                "  Neighbors per cell: min {} avg {:.1} max {}",
                counts.iter().min().unwrap(),
                counts.iter().sum::<usize>() as f64 / num_cells as f64,
                counts.iter().max().unwrap()
            );
        }

        // block lists and per-block search trees
        let nb = BlockGrid::blocks_per_axis(num_cells);
        let bboxes: Vec<Box3> = cells.iter().map(|c| c.bbox()).collect();
        let blocks = BlockGrid::build(extent, nb, &bboxes, eps);
        let trees: Vec<Option<KdTree>> = blocks
            .lists()
            .iter()
            .map(|ids| {
                (ids.len() > TREE_THRESHOLD).then(|| {
                    let mut ids = ids.clone();
                    KdTree::build(&sites, &mut ids)
                })
            })
            .collect();

        let refs: Vec<usize> = blocks.lists().iter().map(|l| l.len()).collect();
        let num_trees = trees.iter().filter(|t| t.is_some()).count();
        info!(
            "Search grid: {} blocks ({nb}^3), {} with trees; cells per block: min {} avg {:.1} max {}",
            blocks.num_blocks(),
            num_trees,
            refs.iter().min().unwrap_or(&0),
            refs.iter().sum::<usize>() as f64 / refs.len().max(1) as f64,
            refs.iter().max().unwrap_or(&0),
        );

        // optional mass distribution
        let mut density = Vec::new();
        let mut mass_cdf = Vec::new();
        let mut total_mass = 0.;
        if let Some(all_masses) = masses {
            let cell_masses: Vec<f64> =
                retained.iter().map(|&i| all_masses[i].max(0.)).collect();
            total_mass = cell_masses.iter().sum();
            if total_mass > 0. {
                density = cell_masses
                    .iter()
                    .zip(cells.iter())
                    .map(|(&m, c)| m / c.volume())
                    .collect();
                mass_cdf = random::cdf(&cell_masses).unwrap();
                info!("Total mass: {total_mass:.4e}");
            } else {
                warn!("Total mass is not positive; suppressing the mass distribution");
                total_mass = 0.;
            }
        }

        Ok(Self {
            extent,
            eps,
            cells,
            sites,
            blocks,
            trees,
            density,
            mass_cdf,
            total_mass,
        })
    }

    pub fn extent(&self) -> Box3 {
        self.extent
    }

    /// Numerical tolerance used throughout the mesh, relative to the domain
    /// diagonal.
    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cell(&self, m: usize) -> &VoronoiCell {
        &self.cells[m]
    }

    /// Mass density of cell `m`, or zero without a mass distribution.
    pub fn density(&self, m: usize) -> f64 {
        self.density.get(m).copied().unwrap_or(0.)
    }

    pub fn total_mass(&self) -> f64 {
        self.total_mass
    }

    /// Index of the cell containing the point: the cell whose site is
    /// nearest. Returns None for points outside the domain (or an empty
    /// mesh).
    pub fn cell_index(&self, p: Point) -> Option<usize> {
        if !self.extent.contains(p) {
            return None;
        }
        let b = self.blocks.block_of(self.extent, p);
        if let Some(tree) = &self.trees[b] {
            return tree.nearest(&self.sites, p);
        }
        let mut best: Option<(usize, f64)> = None;
        for &m in self.blocks.cells_in(b) {
            let d2 = self.cells[m].squared_distance_to(p);
            if best.map_or(true, |(_, bd2)| d2 < bd2) {
                best = Some((m, d2));
            }
        }
        best.map(|(m, _)| m)
    }

    /// Walks a ray through the mesh, producing the ordered list of
    /// (cell, length) segments until the ray leaves the domain.
    ///
    /// For a ray that starts outside the box, the first segment carries no
    /// cell and records the distance travelled before entry.
    pub fn walk(&self, origin: Point, direction: Vector) -> Result<GridPath> {
        let mut path = GridPath::new(origin, direction);
        let Some(k) = direction.normalize() else {
            return Ok(path);
        };

        // move the starting point inside the domain
        let Some((mut r, outside)) = self.extent.clip_to_entry(origin, k, self.eps) else {
            return Ok(path);
        };
        path.add_segment(None, outside);

        let Some(mut m) = self.cell_index(r) else {
            return Ok(path);
        };

        loop {
            let pr = self.cells[m].site();

            // find the nearest forward crossing among the cell's faces
            let mut sq = f64::MAX;
            let mut mq: Option<i32> = None;
            for &mi in self.cells[m].neighbors() {
                let si = if mi >= 0 {
                    // bisecting plane between our site and the neighbor's
                    let pi = self.sites[mi as usize];
                    let n = pi - pr;
                    let ndotk = n.dot(k);
                    if ndotk > 0. {
                        let p = Point::midpoint(pi, pr);
                        n.dot(p - r) / ndotk
                    } else {
                        continue;
                    }
                } else {
                    match mi {
                        cell::WALL_XMIN => (self.extent.min.x - r.x) / k.dx,
                        cell::WALL_XMAX => (self.extent.max.x - r.x) / k.dx,
                        cell::WALL_YMIN => (self.extent.min.y - r.y) / k.dy,
                        cell::WALL_YMAX => (self.extent.max.y - r.y) / k.dy,
                        cell::WALL_ZMIN => (self.extent.min.z - r.z) / k.dz,
                        cell::WALL_ZMAX => (self.extent.max.z - r.z) / k.dz,
                        _ => bail!("invalid neighbor id {mi} in cell {m}"),
                    }
                };
                if si > 0. && si < sq {
                    sq = si;
                    mq = Some(mi);
                }
            }

            match mq {
                // numerical degeneracy: nudge the point and relocate
                None => {
                    r = r + k * self.eps;
                    match self.cell_index(r) {
                        Some(next) => m = next,
                        None => return Ok(path),
                    }
                }
                Some(mi) => {
                    path.add_segment(Some(m), sq);
                    r = r + k * (sq + self.eps);
                    if mi < 0 {
                        return Ok(path); // exited through a domain wall
                    }
                    m = mi as usize;
                }
            }
        }
    }

    /// Draws a uniformly distributed random position inside cell `m` by
    /// rejection sampling from the cell's bounding box.
    pub fn generate_position_in<R: Rng>(&self, m: usize, rng: &mut R) -> Result<Point> {
        let cell = &self.cells[m];
        let bbox = cell.bbox();
        for _ in 0..MAX_POSITION_ATTEMPTS {
            let p = Point::new(
                rng.gen_range(bbox.min.x..=bbox.max.x),
                rng.gen_range(bbox.min.y..=bbox.max.y),
                rng.gen_range(bbox.min.z..=bbox.max.z),
            );
            if self.is_point_closest_to(p, m) {
                return Ok(p);
            }
        }
        bail!("can't find random position in cell {m}")
    }

    /// Draws a random position from the mass distribution: selects a cell
    /// with probability proportional to its mass, then samples uniformly
    /// within it. Without a mass distribution the origin is returned.
    pub fn generate_position<R: Rng>(&self, rng: &mut R) -> Result<Point> {
        if self.mass_cdf.is_empty() {
            return Ok(Point::origin());
        }
        let m = random::locate_clip(&self.mass_cdf, rng.gen::<f64>());
        self.generate_position_in(m, rng)
    }

    fn is_point_closest_to(&self, p: Point, m: usize) -> bool {
        let target = self.cells[m].squared_distance_to(p);
        self.cells[m]
            .neighbors()
            .iter()
            .filter(|&&id| id >= 0)
            .all(|&id| self.cells[id as usize].squared_distance_to(p) >= target)
    }
}

/// Selects the sites that survive filtering: inside the domain and not
/// within `eps` of an earlier-kept site. Returned indices are in input
/// order.
fn filter_sites(extent: Box3, sites: &[Point], eps: f64) -> Vec<usize> {
    let n = sites.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| sites[a].x.partial_cmp(&sites[b].x).unwrap());

    let mut keep = vec![false; n];
    let eps2 = eps * eps;
    for i in 0..n {
        let mi = order[i];
        if !extent.contains(sites[mi]) {
            continue;
        }
        // compare against earlier-kept sorted neighbors within eps on x
        let mut duplicate = false;
        for j in (0..i).rev() {
            let mj = order[j];
            if sites[mi].x - sites[mj].x >= eps {
                break;
            }
            if keep[mj] && sites[mi].squared_distance_to(&sites[mj]) < eps2 {
                duplicate = true;
                break;
            }
        }
        keep[mi] = !duplicate;
    }
    (0..n).filter(|&i| keep[i]).collect()
}
