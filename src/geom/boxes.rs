use crate::{Point, Vector};

/// Axis-aligned box, used for the simulation domain and for cell bounding
/// boxes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Box3 {
    pub min: Point,
    pub max: Point,
}

impl Box3 {
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    /// Cube centered on the origin with the given half-width.
    pub fn cube(half_width: f64) -> Self {
        Self::new(
            Point::new(-half_width, -half_width, -half_width),
            Point::new(half_width, half_width, half_width),
        )
    }

    /// Box widths along the three axes.
    pub fn widths(&self) -> Vector {
        self.max - self.min
    }

    /// Length of the box diagonal.
    pub fn diagonal(&self) -> f64 {
        self.widths().length()
    }

    pub fn volume(&self) -> f64 {
        let w = self.widths();
        w.dx * w.dy * w.dz
    }

    /// Returns true if the point lies inside the box (faces included).
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    /// Lower bound of the box along the given axis.
    pub fn lower(&self, axis: usize) -> f64 {
        self.min.axis(axis)
    }

    /// Upper bound of the box along the given axis.
    pub fn upper(&self, axis: usize) -> f64 {
        self.max.axis(axis)
    }

    /// Indices of the block containing the point in a uniform nb x nb x nb
    /// subdivision of the box, clamped to the valid range.
    pub fn block_indices(&self, p: Point, nb: usize) -> (usize, usize, usize) {
        let w = self.widths();
        let index = |coord: f64, lo: f64, width: f64| -> usize {
            let frac = if width > 0. { (coord - lo) / width } else { 0. };
            ((frac * nb as f64).floor() as isize).clamp(0, nb as isize - 1) as usize
        };
        (
            index(p.x, self.min.x, w.dx),
            index(p.y, self.min.y, w.dy),
            index(p.z, self.min.z, w.dz),
        )
    }

    /// Advances a ray origin to its first intersection with the box.
    ///
    /// Returns the entry point and the distance travelled outside the box,
    /// or None when the ray misses the box. An origin already inside is
    /// returned unchanged with zero distance. The entry point is pulled
    /// inward by `eps` along each axis so that it tests as contained.
    pub fn clip_to_entry(&self, r: Point, k: Vector, eps: f64) -> Option<(Point, f64)> {
        if self.contains(r) {
            return Some((r, 0.));
        }

        let mut t_enter = f64::NEG_INFINITY;
        let mut t_exit = f64::INFINITY;
        for axis in 0..3 {
            let dir = k.axis(axis);
            let lo = self.lower(axis) - r.axis(axis);
            let hi = self.upper(axis) - r.axis(axis);
            if dir.abs() < f64::MIN_POSITIVE {
                // parallel to these faces: must already be within the slab
                if lo > 0. || hi < 0. {
                    return None;
                }
            } else {
                let (t0, t1) = if dir > 0. {
                    (lo / dir, hi / dir)
                } else {
                    (hi / dir, lo / dir)
                };
                t_enter = t_enter.max(t0);
                t_exit = t_exit.min(t1);
            }
        }
        if t_enter >= t_exit || t_exit <= 0. {
            return None;
        }

        let entry = r + k * t_enter;
        Some((self.pull_inside(entry, eps), t_enter))
    }

    fn pull_inside(&self, p: Point, eps: f64) -> Point {
        Point::new(
            p.x.clamp(self.min.x + eps, self.max.x - eps),
            p.y.clamp(self.min.y + eps, self.max.y - eps),
            p.z.clamp(self.min.z + eps, self.max.z - eps),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let b = Box3::cube(1.);
        assert!(b.contains(Point::new(0., 0., 0.)));
        assert!(b.contains(Point::new(1., 1., 1.)));
        assert!(!b.contains(Point::new(1.0001, 0., 0.)));
    }

    #[test]
    fn test_volume_and_diagonal() {
        let b = Box3::new(Point::new(0., 0., 0.), Point::new(1., 2., 3.));
        assert!((b.volume() - 6.).abs() < 1e-12);
        assert!((b.diagonal() - 14.0_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_block_indices() {
        let b = Box3::cube(1.);
        assert_eq!(b.block_indices(Point::new(-1., -1., -1.), 4), (0, 0, 0));
        assert_eq!(b.block_indices(Point::new(0.999, 0.999, 0.999), 4), (3, 3, 3));
        // out-of-box points clamp to the border blocks
        assert_eq!(b.block_indices(Point::new(5., 0., -5.), 4), (3, 2, 0));
    }

    #[test]
    fn test_clip_to_entry_from_outside() {
        let b = Box3::cube(1.);
        let (entry, dist) = b
            .clip_to_entry(Point::new(-3., 0.1, 0.), Vector::new(1., 0., 0.), 1e-12)
            .unwrap();
        assert!((dist - 2.).abs() < 1e-9);
        assert!((entry.x + 1.).abs() < 1e-9);
        assert!(b.contains(entry));
    }

    #[test]
    fn test_clip_to_entry_inside_and_miss() {
        let b = Box3::cube(1.);
        let r = Point::new(0.2, 0.3, -0.4);
        let (entry, dist) = b.clip_to_entry(r, Vector::new(0., 0., 1.), 1e-12).unwrap();
        assert_eq!(dist, 0.);
        assert!(entry.is_close(&r));

        // pointing away from the box
        assert!(b
            .clip_to_entry(Point::new(-3., 0., 0.), Vector::new(-1., 0., 0.), 1e-12)
            .is_none());
        // parallel to the box but outside the slab
        assert!(b
            .clip_to_entry(Point::new(-3., 2., 0.), Vector::new(1., 0., 0.), 1e-12)
            .is_none());
    }
}
