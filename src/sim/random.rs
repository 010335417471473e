//! The random number source used by the photon cycle.

use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::geom::boxes::Box3;
use crate::{Point, Vector};

/// A seedable uniform random generator with the sampling helpers needed by
/// the transfer loop. Each photon history gets its own deterministically
/// seeded instance, so results do not depend on the thread schedule.
pub struct Random {
    rng: ChaCha8Rng,
}

impl Random {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Uniform deviate in [0, 1).
    pub fn uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Exponential deviate with unit mean (an optical depth to the next
    /// interaction).
    pub fn exponential(&mut self) -> f64 {
        -(1. - self.uniform()).ln()
    }

    /// Uniformly distributed point inside the box.
    pub fn position_in_box(&mut self, b: Box3) -> Point {
        Point::new(
            self.rng.gen_range(b.min.x..=b.max.x),
            self.rng.gen_range(b.min.y..=b.max.y),
            self.rng.gen_range(b.min.z..=b.max.z),
        )
    }

    /// Isotropically distributed unit vector.
    pub fn isotropic_direction(&mut self) -> Vector {
        let z = self.rng.gen_range(-1.0..=1.0_f64);
        let phi = self.rng.gen_range(0.0..std::f64::consts::TAU);
        let s = (1. - z * z).max(0.).sqrt();
        Vector::new(s * phi.cos(), s * phi.sin(), z)
    }
}

impl RngCore for Random {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

/// Builds the normalized cumulative distribution of the given non-negative
/// weights. The result has one more entry than the input, starting at zero
/// and ending at one. Returns None when the weights do not add up to a
/// positive total.
pub fn cdf(weights: &[f64]) -> Option<Vec<f64>> {
    let mut cum = Vec::with_capacity(weights.len() + 1);
    cum.push(0.);
    let mut running = 0.;
    for &w in weights {
        running += w.max(0.);
        cum.push(running);
    }
    if running <= 0. {
        return None;
    }
    for c in cum.iter_mut() {
        *c /= running;
    }
    Some(cum)
}

/// Inverts a cumulative distribution produced by [`cdf`]: returns the bin
/// index for a deviate `u` in [0, 1), clipped to the valid range.
pub fn locate_clip(cdf: &[f64], u: f64) -> usize {
    let n = cdf.len() - 1;
    cdf[1..].partition_point(|&c| c <= u).min(n - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_range_and_mean() {
        let mut rng = Random::with_seed(1);
        let mut sum = 0.;
        for _ in 0..10_000 {
            let u = rng.uniform();
            assert!((0. ..1.).contains(&u));
            sum += u;
        }
        assert!((sum / 10_000. - 0.5).abs() < 0.02);
    }

    #[test]
    fn test_isotropic_direction_statistics() {
        let mut rng = Random::with_seed(2);
        let mut mean = Vector::new(0., 0., 0.);
        for _ in 0..20_000 {
            let k = rng.isotropic_direction();
            assert!((k.length() - 1.).abs() < 1e-12);
            mean = mean + k;
        }
        mean = mean * (1. / 20_000.);
        assert!(mean.length() < 0.02, "directions are biased: {mean}");
    }

    #[test]
    fn test_exponential_mean() {
        let mut rng = Random::with_seed(3);
        let mean: f64 = (0..20_000).map(|_| rng.exponential()).sum::<f64>() / 20_000.;
        assert!((mean - 1.).abs() < 0.05);
    }

    #[test]
    fn test_cdf_and_locate() {
        let cum = cdf(&[1., 3., 0., 4.]).unwrap();
        assert_eq!(cum.len(), 5);
        assert!((cum[0] - 0.).abs() < 1e-12);
        assert!((cum[1] - 0.125).abs() < 1e-12);
        assert!((cum[2] - 0.5).abs() < 1e-12);
        assert!((cum[3] - 0.5).abs() < 1e-12);
        assert!((cum[4] - 1.).abs() < 1e-12);

        assert_eq!(locate_clip(&cum, 0.), 0);
        assert_eq!(locate_clip(&cum, 0.2), 1);
        // the zero-weight bin is never selected
        assert_eq!(locate_clip(&cum, 0.5), 3);
        assert_eq!(locate_clip(&cum, 0.999), 3);
    }

    #[test]
    fn test_cdf_rejects_non_positive_totals() {
        assert!(cdf(&[0., 0.]).is_none());
        assert!(cdf(&[-1., -2.]).is_none());
        assert!(cdf(&[]).is_none());
    }

    #[test]
    fn test_position_in_box() {
        let b = Box3::new(Point::new(0., 1., 2.), Point::new(1., 2., 3.));
        let mut rng = Random::with_seed(4);
        for _ in 0..100 {
            assert!(b.contains(rng.position_in_box(b)));
        }
    }
}
