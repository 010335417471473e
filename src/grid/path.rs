use crate::{Point, Vector};

/// One straight piece of a ray's traversal through the mesh.
///
/// `cell` is None for the part of the path outside the domain box (before
/// entry). `ds` is the segment length and `s` the cumulative distance from
/// the original ray origin to the end of the segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub cell: Option<usize>,
    pub ds: f64,
    pub s: f64,
}

/// The ordered list of segments a ray traverses through the mesh, from its
/// origin until it leaves the domain.
#[derive(Debug, Clone)]
pub struct GridPath {
    origin: Point,
    direction: Vector,
    segments: Vec<Segment>,
}

impl GridPath {
    pub fn new(origin: Point, direction: Vector) -> Self {
        Self {
            origin,
            direction,
            segments: Vec::new(),
        }
    }

    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn direction(&self) -> Vector {
        self.direction
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Appends a segment; zero-length or negative segments are ignored.
    pub fn add_segment(&mut self, cell: Option<usize>, ds: f64) {
        if ds > 0. {
            let s = self.segments.last().map_or(0., |seg| seg.s) + ds;
            self.segments.push(Segment { cell, ds, s });
        }
    }

    /// Total length of the path inside the domain (segments with a cell).
    pub fn in_grid_length(&self) -> f64 {
        self.segments
            .iter()
            .filter(|seg| seg.cell.is_some())
            .map(|seg| seg.ds)
            .sum()
    }

    /// Position on the ray at cumulative distance `s` from the origin.
    pub fn position_at(&self, s: f64) -> Point {
        self.origin + self.direction * s
    }
}
