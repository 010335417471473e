//! Synthetic instruments observing the simulated model from far away.

use std::path::Path;

use anyhow::{ensure, Result};

use crate::sim::packet::PhotonPacket;
use crate::sim::recorder::FluxRecorder;
use crate::sim::units::Units;
use crate::sim::wavelengths::WavelengthGrid;
use crate::{Point, Vector};

/// Pixel frame geometry for IFU recording.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    pub num_pixels_x: usize,
    pub num_pixels_y: usize,
    pub pixel_size_x: f64,
    pub pixel_size_y: f64,
    pub center_x: f64,
    pub center_y: f64,
}

/// Configuration of a distant instrument.
#[derive(Debug, Clone)]
pub struct InstrumentConfig {
    pub name: String,
    /// Distance from the model to the observer.
    pub distance: f64,
    /// Inclination of the line of sight, measured from the +z axis.
    pub inclination: f64,
    /// Azimuth of the line of sight in the xy plane.
    pub azimuth: f64,
    /// Rotation of the frame around the line of sight.
    pub roll: f64,
    /// Record a spatially integrated SED.
    pub record_sed: bool,
    /// Record an IFU data cube with this frame geometry.
    pub frame: Option<FrameConfig>,
    pub record_components: bool,
    pub num_scattering_levels: usize,
    pub record_polarization: bool,
    pub record_statistics: bool,
}

impl InstrumentConfig {
    /// An SED-only instrument along the -z axis at the given distance.
    pub fn sed(name: &str, distance: f64) -> Self {
        Self {
            name: name.to_string(),
            distance,
            inclination: 0.,
            azimuth: 0.,
            roll: 0.,
            record_sed: true,
            frame: None,
            record_components: false,
            num_scattering_levels: 0,
            record_polarization: false,
            record_statistics: false,
        }
    }
}

/// An instrument at a distance much larger than the model extent, so that
/// all photon packets travel parallel towards it. Projects packet positions
/// onto its pixel frame and forwards detections to its flux recorder.
pub struct DistantInstrument {
    config: InstrumentConfig,
    /// Direction towards the observer.
    bfk_obs: Vector,
    /// Frame axis directions.
    bfk_x: Vector,
    bfk_y: Vector,
    recorder: FluxRecorder,
}

impl DistantInstrument {
    pub fn new(
        config: InstrumentConfig,
        lambda_grid: WavelengthGrid,
        units: Units,
        has_medium: bool,
        has_medium_emission: bool,
    ) -> Result<Self> {
        ensure!(config.distance > 0., "instrument distance must be positive");
        ensure!(
            config.record_sed || config.frame.is_some(),
            "instrument {} records neither SED nor IFU output",
            config.name
        );

        let costheta = config.inclination.cos();
        let sintheta = config.inclination.sin();
        let cosphi = config.azimuth.cos();
        let sinphi = config.azimuth.sin();
        let cosomega = config.roll.cos();
        let sinomega = config.roll.sin();

        let bfk_obs = Vector::from_spherical(config.inclination, config.azimuth);
        let bfk_x = Vector::new(
            cosphi * costheta * sinomega - sinphi * cosomega,
            sinphi * costheta * sinomega + cosphi * cosomega,
            -sintheta * sinomega,
        );
        let bfk_y = Vector::new(
            -cosphi * costheta * cosomega - sinphi * sinomega,
            -sinphi * costheta * cosomega + cosphi * sinomega,
            sintheta * cosomega,
        );

        let mut recorder = FluxRecorder::new(&config.name, lambda_grid, units);
        recorder.set_simulation_info(has_medium, has_medium_emission);
        recorder.set_user_flags(
            config.record_components,
            config.num_scattering_levels,
            config.record_polarization,
            config.record_statistics,
        );
        if config.record_sed {
            recorder.include_flux_density(config.distance);
        }
        if let Some(frame) = &config.frame {
            recorder.include_surface_brightness(
                config.distance,
                frame.num_pixels_x,
                frame.num_pixels_y,
                frame.pixel_size_x,
                frame.pixel_size_y,
                frame.center_x,
                frame.center_y,
            );
        }
        recorder.finalize_configuration();

        Ok(Self {
            config,
            bfk_obs,
            bfk_x,
            bfk_y,
            recorder,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Direction from the model towards the observer.
    pub fn line_of_sight(&self) -> Vector {
        self.bfk_obs
    }

    /// The IFU pixel index for a packet at the given position, or -1 when
    /// the projection misses the field of view.
    pub fn pixel_of(&self, position: Point) -> i32 {
        let Some(frame) = &self.config.frame else {
            return -1;
        };
        let r = position - Point::origin();
        let xp = self.bfk_x.dot(r) - frame.center_x;
        let yp = self.bfk_y.dot(r) - frame.center_y;
        let i = (xp / frame.pixel_size_x + 0.5 * frame.num_pixels_x as f64).floor();
        let j = (yp / frame.pixel_size_y + 0.5 * frame.num_pixels_y as f64).floor();
        if i < 0. || i >= frame.num_pixels_x as f64 || j < 0. || j >= frame.num_pixels_y as f64 {
            return -1;
        }
        (i as usize + j as usize * frame.num_pixels_x) as i32
    }

    /// Records a peel-off packet arriving at the instrument with the given
    /// optical depth along its path.
    pub fn detect(&self, pp: &PhotonPacket, tau: f64) {
        self.recorder.detect(pp, self.pixel_of(pp.position()), tau);
    }

    /// Drains pending per-thread statistics; call after the photon loop.
    pub fn flush(&self) {
        self.recorder.flush();
    }

    /// Calibrates the detector arrays and writes this instrument's output
    /// files into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        self.recorder.calibrate_and_write(dir)
    }

    pub fn recorder(&self) -> &FluxRecorder {
        &self.recorder
    }
}
