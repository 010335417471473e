//! Wavelength discretization for instruments.

use anyhow::{ensure, Result};

/// A logarithmic wavelength grid: `n` bins with log-spaced borders between
/// a shortest and a longest wavelength (in meters).
#[derive(Debug, Clone)]
pub struct WavelengthGrid {
    borders: Vec<f64>,
    lambdas: Vec<f64>,
}

impl WavelengthGrid {
    pub fn log(min: f64, max: f64, num_bins: usize) -> Result<Self> {
        ensure!(min > 0. && max > min, "invalid wavelength range {min}..{max}");
        ensure!(num_bins >= 1, "wavelength grid needs at least one bin");

        let ratio = max / min;
        let borders: Vec<f64> = (0..=num_bins)
            .map(|i| min * ratio.powf(i as f64 / num_bins as f64))
            .collect();
        // characteristic wavelength of a bin is the geometric mean of its
        // borders
        let lambdas: Vec<f64> = (0..num_bins)
            .map(|i| (borders[i] * borders[i + 1]).sqrt())
            .collect();
        Ok(Self { borders, lambdas })
    }

    pub fn num_bins(&self) -> usize {
        self.lambdas.len()
    }

    /// Characteristic wavelength of the given bin.
    pub fn lambda(&self, ell: usize) -> f64 {
        self.lambdas[ell]
    }

    /// Width of the given bin.
    pub fn bin_width(&self, ell: usize) -> f64 {
        self.borders[ell + 1] - self.borders[ell]
    }

    /// Shortest and longest wavelength covered by the grid.
    pub fn range(&self) -> (f64, f64) {
        (self.borders[0], *self.borders.last().unwrap())
    }

    /// Index of the bin containing the given wavelength, or None when the
    /// wavelength falls outside the grid.
    pub fn bin(&self, lambda: f64) -> Option<usize> {
        let n = self.num_bins();
        let (min, max) = self.range();
        if lambda < min || lambda > max {
            return None;
        }
        let frac = (lambda / min).ln() / (max / min).ln();
        Some(((frac * n as f64) as usize).min(n - 1))
    }
}
