//! Output unit conversion for calibrated fluxes.
//!
//! Internally the engine works in SI: wavelengths in meters, luminosities
//! in watts. The unit layer converts calibrated values to the user-selected
//! output convention at write time.

/// Speed of light (m/s), used to convert per-wavelength bins to
/// per-frequency flux densities.
const C_LIGHT: f64 = 2.997_924_58e8;

/// One jansky in SI units (W/m2/Hz).
const JANSKY: f64 = 1e-26;

/// Wavelength unit for output tables and headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WavelengthUnit {
    Meter,
    Micron,
}

impl WavelengthUnit {
    pub fn factor(self) -> f64 {
        match self {
            WavelengthUnit::Meter => 1.,
            WavelengthUnit::Micron => 1e6,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            WavelengthUnit::Meter => "m",
            WavelengthUnit::Micron => "micron",
        }
    }
}

/// Output convention for flux-valued columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxConvention {
    /// Flux per wavelength bin (W/m2); no spectral division is applied.
    PerBin,
    /// Spectral flux density (W/m2/m); bin values are divided by the bin
    /// width.
    SpectralDensity,
    /// Spectral flux density per unit frequency in janskys; bin values are
    /// divided by the frequency width of the bin.
    Jansky,
}

#[derive(Debug, Clone, Copy)]
pub struct Units {
    pub wavelength: WavelengthUnit,
    pub flux: FluxConvention,
}

impl Units {
    /// Meters and per-bin fluxes; calibrated values pass through unchanged.
    pub fn neutral() -> Self {
        Self {
            wavelength: WavelengthUnit::Meter,
            flux: FluxConvention::PerBin,
        }
    }

    /// Microns and spectral flux densities.
    pub fn spectral() -> Self {
        Self {
            wavelength: WavelengthUnit::Micron,
            flux: FluxConvention::SpectralDensity,
        }
    }

    /// Microns and per-frequency flux densities in janskys.
    pub fn jansky() -> Self {
        Self {
            wavelength: WavelengthUnit::Micron,
            flux: FluxConvention::Jansky,
        }
    }

    pub fn wavelength_output(&self, lambda: f64) -> f64 {
        lambda * self.wavelength.factor()
    }

    /// Conversion factor applied to a calibrated flux-density value in the
    /// bin at the given wavelength and with the given width.
    pub fn flux_factor(&self, lambda: f64, bin_width: f64) -> f64 {
        match self.flux {
            FluxConvention::PerBin => 1.,
            FluxConvention::SpectralDensity => 1. / bin_width,
            FluxConvention::Jansky => {
                // frequency width of the wavelength bin
                let nu_width = C_LIGHT * bin_width / (lambda * lambda);
                1. / nu_width / JANSKY
            }
        }
    }

    /// Conversion factor applied to a calibrated surface-brightness value.
    pub fn surface_brightness_factor(&self, lambda: f64, bin_width: f64) -> f64 {
        self.flux_factor(lambda, bin_width)
    }

    pub fn flux_unit_name(&self) -> &'static str {
        match self.flux {
            FluxConvention::PerBin => "W/m2",
            FluxConvention::SpectralDensity => "W/m2/m",
            FluxConvention::Jansky => "Jy",
        }
    }

    pub fn surface_brightness_unit_name(&self) -> &'static str {
        match self.flux {
            FluxConvention::PerBin => "W/m2/sr",
            FluxConvention::SpectralDensity => "W/m2/m/sr",
            FluxConvention::Jansky => "Jy/sr",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_units_pass_through() {
        let u = Units::neutral();
        assert_eq!(u.wavelength_output(1e-6), 1e-6);
        assert_eq!(u.flux_factor(1e-6, 1e-7), 1.);
    }

    #[test]
    fn test_spectral_units() {
        let u = Units::spectral();
        assert!((u.wavelength_output(1e-6) - 1.).abs() < 1e-12);
        assert!((u.flux_factor(1e-6, 2e-7) - 5e6).abs() < 1.);
        assert_eq!(u.flux_unit_name(), "W/m2/m");
    }

    #[test]
    fn test_jansky_units() {
        let u = Units::jansky();
        // a 1e-7 m bin at 1e-6 m spans c * 1e-7 / 1e-12 = 2.998e13 Hz, so
        // 1 W/m2 in the bin is 1/2.998e13 W/m2/Hz = 3.336e12 Jy
        let expected = 1. / (2.997_924_58e8 * 1e-7 / 1e-12) / 1e-26;
        let factor = u.flux_factor(1e-6, 1e-7);
        assert!((factor - expected).abs() / expected < 1e-12);
        assert_eq!(u.flux_unit_name(), "Jy");
        assert_eq!(u.surface_brightness_unit_name(), "Jy/sr");
    }
}
