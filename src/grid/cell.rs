use crate::geom::boxes::Box3;
use crate::Point;

/// Neighbor ids below zero denote the six domain walls.
pub const WALL_XMIN: i32 = -1;
pub const WALL_XMAX: i32 = -2;
pub const WALL_YMIN: i32 = -3;
pub const WALL_YMAX: i32 = -4;
pub const WALL_ZMIN: i32 = -5;
pub const WALL_ZMAX: i32 = -6;

/// Properties of a single Voronoi cell relevant for path calculation and
/// density interpolation. Immutable after mesh construction.
#[derive(Debug, Clone)]
pub struct VoronoiCell {
    site: Point,
    centroid: Point,
    volume: f64,
    bbox: Box3,
    neighbors: Vec<i32>,
}

impl VoronoiCell {
    pub fn new(site: Point, centroid: Point, volume: f64, bbox: Box3, neighbors: Vec<i32>) -> Self {
        Self {
            site,
            centroid,
            volume,
            bbox,
            neighbors,
        }
    }

    /// The site (generator) position of this cell.
    pub fn site(&self) -> Point {
        self.site
    }

    /// The geometric centroid of the cell polyhedron.
    pub fn centroid(&self) -> Point {
        self.centroid
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Axis-aligned box enclosing the cell polyhedron.
    pub fn bbox(&self) -> Box3 {
        self.bbox
    }

    /// Ids of adjacent cells; negative values are domain walls.
    pub fn neighbors(&self) -> &[i32] {
        &self.neighbors
    }

    /// Squared distance from the cell site to the given point.
    pub fn squared_distance_to(&self, p: Point) -> f64 {
        self.site.squared_distance_to(&p)
    }
}
