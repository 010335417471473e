//! Voronoi cell geometry by half-space clipping.
//!
//! Each cell starts out as the full domain box and is clipped by the
//! perpendicular bisector plane of every nearby site, visiting candidates in
//! order of increasing distance. A candidate farther away than twice the
//! distance from the site to its farthest remaining vertex can no longer cut
//! the cell, so the loop terminates without inspecting all sites.

use anyhow::{ensure, Result};

use crate::geom::boxes::Box3;
use crate::grid::cell::{
    VoronoiCell, WALL_XMAX, WALL_XMIN, WALL_YMAX, WALL_YMIN, WALL_ZMAX, WALL_ZMIN,
};
use crate::grid::search::KdTree;
use crate::{Point, Vector};

/// Initial number of neighbor candidates fetched per cell; doubled until the
/// termination criterion is met.
const INITIAL_CANDIDATES: usize = 16;

#[derive(Debug, Clone)]
struct Face {
    label: i32,
    verts: Vec<Point>,
}

/// A convex polyhedron represented by its faces, each an ordered vertex loop
/// tagged with the id of the neighbor (or wall) that generated it.
#[derive(Debug, Clone)]
pub struct ConvexPolyhedron {
    faces: Vec<Face>,
    eps: f64,
}

#[derive(Clone, Copy, PartialEq)]
enum Side {
    Inside,
    On,
    Outside,
}

impl ConvexPolyhedron {
    /// The full domain box, with faces labeled by wall id.
    pub fn from_box(b: Box3, eps: f64) -> Self {
        let corner = |i: usize, j: usize, k: usize| {
            Point::new(
                if i == 0 { b.min.x } else { b.max.x },
                if j == 0 { b.min.y } else { b.max.y },
                if k == 0 { b.min.z } else { b.max.z },
            )
        };
        let face = |label: i32, vs: [Point; 4]| Face {
            label,
            verts: vs.to_vec(),
        };
        let faces = vec![
            face(
                WALL_XMIN,
                [corner(0, 0, 0), corner(0, 0, 1), corner(0, 1, 1), corner(0, 1, 0)],
            ),
            face(
                WALL_XMAX,
                [corner(1, 0, 0), corner(1, 1, 0), corner(1, 1, 1), corner(1, 0, 1)],
            ),
            face(
                WALL_YMIN,
                [corner(0, 0, 0), corner(1, 0, 0), corner(1, 0, 1), corner(0, 0, 1)],
            ),
            face(
                WALL_YMAX,
                [corner(0, 1, 0), corner(0, 1, 1), corner(1, 1, 1), corner(1, 1, 0)],
            ),
            face(
                WALL_ZMIN,
                [corner(0, 0, 0), corner(0, 1, 0), corner(1, 1, 0), corner(1, 0, 0)],
            ),
            face(
                WALL_ZMAX,
                [corner(0, 0, 1), corner(1, 0, 1), corner(1, 1, 1), corner(0, 1, 1)],
            ),
        ];
        Self { faces, eps }
    }

    /// True when the polyhedron has degenerated to (near) nothing.
    pub fn is_empty(&self) -> bool {
        self.faces.len() < 4
    }

    /// Clips the polyhedron by the perpendicular bisector plane between
    /// `site` and `other`, keeping the half closer to `site`. The new face,
    /// if any, is tagged with `label`.
    pub fn clip_bisector(&mut self, site: Point, other: Point, label: i32) {
        let Some(normal) = (other - site).normalize() else {
            return; // coincident sites cannot define a plane
        };
        let p0 = Point::midpoint(site, other);
        self.clip_halfspace(normal, p0, label);
    }

    /// Clips by the half-space `normal . (x - p0) <= 0`.
    fn clip_halfspace(&mut self, normal: Vector, p0: Point, label: i32) {
        let eps = self.eps;
        let side = |p: &Point| -> (f64, Side) {
            let d = normal.dot(*p - p0);
            let s = if d > eps {
                Side::Outside
            } else if d < -eps {
                Side::Inside
            } else {
                Side::On
            };
            (d, s)
        };

        // quick scan: nothing to cut, or everything gone
        let mut any_inside = false;
        let mut any_outside = false;
        for face in &self.faces {
            for v in &face.verts {
                match side(v).1 {
                    Side::Inside => any_inside = true,
                    Side::Outside => any_outside = true,
                    Side::On => {}
                }
            }
        }
        if !any_outside {
            return;
        }
        if !any_inside {
            self.faces.clear();
            return;
        }

        let mut cut_points: Vec<Point> = Vec::new();
        let mut kept: Vec<Face> = Vec::new();
        for face in self.faces.drain(..) {
            let n = face.verts.len();
            let mut out: Vec<Point> = Vec::with_capacity(n + 2);
            for i in 0..n {
                let a = face.verts[i];
                let b = face.verts[(i + 1) % n];
                let (da, sa) = side(&a);
                let (db, sb) = side(&b);
                if sa != Side::Outside {
                    out.push(a);
                    if sa == Side::On {
                        cut_points.push(a);
                    }
                }
                // a genuine crossing introduces a new vertex on the plane
                if (sa == Side::Inside && sb == Side::Outside)
                    || (sa == Side::Outside && sb == Side::Inside)
                {
                    let t = da / (da - db);
                    let p = a + (b - a) * t;
                    out.push(p);
                    cut_points.push(p);
                }
            }
            if out.len() >= 3 {
                kept.push(Face {
                    label: face.label,
                    verts: out,
                });
            }
        }
        self.faces = kept;

        // assemble the cap face from the accumulated cut points
        let cap = order_loop(cut_points, normal, eps);
        if cap.len() >= 3 {
            self.faces.push(Face { label, verts: cap });
        }
    }

    /// Squared distance from `site` to the farthest vertex.
    pub fn max_squared_radius(&self, site: Point) -> f64 {
        let mut max = 0.0_f64;
        for face in &self.faces {
            for v in &face.verts {
                max = max.max(site.squared_distance_to(v));
            }
        }
        max
    }

    /// Axis-aligned bounding box over all vertices.
    pub fn bbox(&self) -> Box3 {
        let mut min = Point::new(f64::MAX, f64::MAX, f64::MAX);
        let mut max = Point::new(f64::MIN, f64::MIN, f64::MIN);
        for face in &self.faces {
            for v in &face.verts {
                min = Point::new(min.x.min(v.x), min.y.min(v.y), min.z.min(v.z));
                max = Point::new(max.x.max(v.x), max.y.max(v.y), max.z.max(v.z));
            }
        }
        Box3::new(min, max)
    }

    /// Volume and centroid via a tetrahedral fan from an interior point.
    pub fn volume_centroid(&self, interior: Point) -> (f64, Point) {
        let mut volume = 0.;
        let mut cx = 0.;
        let mut cy = 0.;
        let mut cz = 0.;
        for face in &self.faces {
            for i in 1..face.verts.len() - 1 {
                let v1 = face.verts[0];
                let v2 = face.verts[i];
                let v3 = face.verts[i + 1];
                let vol = ((v1 - interior).cross(v2 - interior))
                    .dot(v3 - interior)
                    .abs()
                    / 6.;
                let c = Point::new(
                    0.25 * (interior.x + v1.x + v2.x + v3.x),
                    0.25 * (interior.y + v1.y + v2.y + v3.y),
                    0.25 * (interior.z + v1.z + v2.z + v3.z),
                );
                volume += vol;
                cx += vol * c.x;
                cy += vol * c.y;
                cz += vol * c.z;
            }
        }
        let centroid = if volume > 0. {
            Point::new(cx / volume, cy / volume, cz / volume)
        } else {
            interior
        };
        (volume, centroid)
    }

    /// Ids of the neighbors and walls that bound the polyhedron.
    pub fn labels(&self) -> Vec<i32> {
        self.faces.iter().map(|f| f.label).collect()
    }
}

/// Deduplicates the points and orders them into a simple loop around their
/// centroid within the plane with the given normal.
fn order_loop(points: Vec<Point>, normal: Vector, eps: f64) -> Vec<Point> {
    let mut unique: Vec<Point> = Vec::with_capacity(points.len());
    let merge_d2 = (10. * eps) * (10. * eps);
    for p in points {
        if !unique.iter().any(|q| q.squared_distance_to(&p) < merge_d2) {
            unique.push(p);
        }
    }
    if unique.len() < 3 {
        return unique;
    }

    let n = unique.len() as f64;
    let center = Point::new(
        unique.iter().map(|p| p.x).sum::<f64>() / n,
        unique.iter().map(|p| p.y).sum::<f64>() / n,
        unique.iter().map(|p| p.z).sum::<f64>() / n,
    );
    let (u, v) = normal.orthogonal_basis();
    unique.sort_by(|a, b| {
        let pa = (*a - center).dot(v).atan2((*a - center).dot(u));
        let pb = (*b - center).dot(v).atan2((*b - center).dot(u));
        pa.partial_cmp(&pb).unwrap_or(std::cmp::Ordering::Equal)
    });
    unique
}

/// Computes the Voronoi cell of site `m` by progressive bisector clipping
/// against its nearest neighbors.
pub fn compute_cell(
    m: usize,
    sites: &[Point],
    tree: &KdTree,
    extent: Box3,
    eps: f64,
) -> Result<VoronoiCell> {
    let site = sites[m];
    let mut poly = ConvexPolyhedron::from_box(extent, eps);
    let num_others = sites.len() - 1;

    let mut fetch = INITIAL_CANDIDATES.min(num_others);
    let mut processed = 0;
    'clipping: while processed < num_others {
        let found = tree.nearest_k(sites, site, fetch + 1);
        let candidates: Vec<(usize, f64)> =
            found.into_iter().filter(|&(j, _)| j != m).collect();

        for &(j, d2) in &candidates[processed..] {
            // a site beyond twice the farthest vertex cannot cut the cell
            if d2 > 4. * poly.max_squared_radius(site) {
                break 'clipping;
            }
            poly.clip_bisector(site, sites[j], j as i32);
            ensure!(
                !poly.is_empty(),
                "Voronoi cell of site {m} degenerated during clipping"
            );
        }
        processed = candidates.len();
        if fetch >= num_others {
            break;
        }
        fetch = (fetch * 2).min(num_others);
    }

    let (volume, centroid) = poly.volume_centroid(site);
    ensure!(volume > 0., "Voronoi cell of site {m} has zero volume");
    Ok(VoronoiCell::new(
        site,
        centroid,
        volume,
        poly.bbox(),
        poly.labels(),
    ))
}
