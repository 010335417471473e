//! The Monte Carlo transfer loop: launch photon packets, walk them through
//! the medium, scatter, and peel off towards the instruments.

use std::path::Path;
use std::sync::Arc;

use anyhow::{ensure, Result};
use log::info;

use crate::parallel::WorkerPool;
use crate::sim::instruments::DistantInstrument;
use crate::sim::medium::MediumSystem;
use crate::sim::packet::{PacketOrigin, PhotonPacket};
use crate::sim::random::Random;
use crate::sim::wavelengths::WavelengthGrid;
use crate::Point;

/// A primary source of photon packets. Wavelengths are drawn log-uniformly
/// over the instrument wavelength range; every packet carries an equal
/// share of the source luminosity.
pub enum Source {
    /// A point source at a fixed position.
    Point { position: Point, luminosity: f64 },
    /// Emission distributed over the mesh cells proportional to their mass.
    Cells { luminosity: f64 },
}

impl Source {
    fn luminosity(&self) -> f64 {
        match self {
            Source::Point { luminosity, .. } | Source::Cells { luminosity } => *luminosity,
        }
    }

    fn position(&self, medium: &MediumSystem, rng: &mut Random) -> Result<Point> {
        match self {
            Source::Point { position, .. } => Ok(*position),
            Source::Cells { .. } => medium.mesh().generate_position(rng),
        }
    }
}

/// Settings for a simulation run.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Number of photon packet histories to launch.
    pub num_packets: usize,
    /// Number of threads in the worker pool, including the calling thread.
    pub num_threads: usize,
    /// Base seed; each history derives its own random stream from it.
    pub seed: u64,
    /// A packet is terminated once biasing reduced its luminosity below
    /// this fraction of its launch luminosity.
    pub min_weight_fraction: f64,
    /// Hard cap on the number of scatterings per packet.
    pub max_scatterings: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_packets: 10_000,
            num_threads: 4,
            seed: 0,
            min_weight_fraction: 1e-4,
            max_scatterings: 1_000,
        }
    }
}

/// Ties the mesh, the media, a source and the instruments together and
/// runs the photon packet life cycles over a worker pool.
pub struct MonteCarloSimulation {
    medium: Arc<MediumSystem>,
    source: Arc<Source>,
    instruments: Vec<Arc<DistantInstrument>>,
    lambda_grid: WavelengthGrid,
    config: SimulationConfig,
}

impl MonteCarloSimulation {
    pub fn new(
        medium: Arc<MediumSystem>,
        source: Source,
        instruments: Vec<Arc<DistantInstrument>>,
        lambda_grid: WavelengthGrid,
        config: SimulationConfig,
    ) -> Result<Self> {
        ensure!(!instruments.is_empty(), "a simulation needs at least one instrument");
        ensure!(config.num_packets > 0, "a simulation needs photon packets");
        Ok(Self {
            medium,
            source: Arc::new(source),
            instruments,
            lambda_grid,
            config,
        })
    }

    /// Launches all photon packet histories and drains the instruments.
    pub fn run(&self) -> Result<()> {
        info!(
            "Launching {} photon packets on {} threads",
            self.config.num_packets, self.config.num_threads
        );
        let pool = WorkerPool::new(self.config.num_threads)?;

        let medium = Arc::clone(&self.medium);
        let source = Arc::clone(&self.source);
        let instruments = self.instruments.clone();
        let lambda_grid = self.lambda_grid.clone();
        let config = self.config.clone();
        let packet_luminosity = source.luminosity() / self.config.num_packets as f64;

        pool.call(
            move |first_index, num_indices| {
                for history in first_index..first_index + num_indices {
                    life_cycle(
                        history as u64,
                        packet_luminosity,
                        &medium,
                        &source,
                        &instruments,
                        &lambda_grid,
                        &config,
                    )?;
                }
                Ok(())
            },
            self.config.num_packets,
        )?;

        for instrument in &self.instruments {
            instrument.flush();
        }
        Ok(())
    }

    /// Runs the simulation and writes the calibrated instrument output
    /// files into `dir`.
    pub fn run_and_write(&self, dir: &Path) -> Result<()> {
        self.run()?;
        std::fs::create_dir_all(dir)?;
        for instrument in &self.instruments {
            instrument.write(dir)?;
        }
        Ok(())
    }
}

/// One full photon packet history: emission, repeated scattering, and a
/// peel-off to every instrument at each event.
fn life_cycle(
    history: u64,
    packet_luminosity: f64,
    medium: &MediumSystem,
    source: &Source,
    instruments: &[Arc<DistantInstrument>],
    lambda_grid: &WavelengthGrid,
    config: &SimulationConfig,
) -> Result<()> {
    // a per-history random stream, independent of the thread schedule
    let mut rng = Random::with_seed(
        config
            .seed
            .wrapping_add(history.wrapping_mul(0x9E37_79B9_7F4A_7C15)),
    );

    // launch: log-uniform wavelength, isotropic direction
    let (lambda_min, lambda_max) = lambda_grid.range();
    let lambda = lambda_min * (lambda_max / lambda_min).powf(rng.uniform());
    let position = source.position(medium, &mut rng)?;
    let direction = rng.isotropic_direction();
    let mut pp = PhotonPacket::launch(
        history,
        lambda,
        packet_luminosity,
        position,
        direction,
        PacketOrigin::Primary,
    );
    let min_luminosity = packet_luminosity * config.min_weight_fraction;

    // peel off the emission towards every instrument
    for instrument in instruments {
        let towards = instrument.line_of_sight();
        let ppp = pp.launch_emission_peel_off(towards, 1.);
        let tau = medium.optical_depth_along(lambda, ppp.position(), towards)?;
        instrument.detect(&ppp, tau);
    }
    if !medium.has_media() {
        return Ok(());
    }

    // the random walk through the medium
    while pp.num_scatt() < config.max_scatterings {
        let path = medium.mesh().walk(pp.position(), pp.direction())?;
        let tau_target = rng.exponential();
        let Some((s, m)) = medium.sample_interaction(lambda, &path, tau_target) else {
            break; // escaped through the domain boundary
        };
        pp.propagate(s);

        // continuous absorption: survival weight is the albedo
        pp.apply_bias(medium.albedo(lambda, m));
        if pp.luminosity() < min_luminosity {
            break;
        }

        // peel off the scattering towards every instrument
        for instrument in instruments {
            let towards = instrument.line_of_sight();
            let peel = medium.peel_off(lambda, &pp, m, towards);
            let mut ppp = pp.launch_scattering_peel_off(towards, peel.weight);
            if let Some((q, u, v, normal)) = peel.stokes {
                ppp.set_polarized(q, u, v, normal);
            }
            let tau = medium.optical_depth_along(lambda, ppp.position(), towards)?;
            instrument.detect(&ppp, tau);
        }

        // scatter the packet itself into a new direction
        medium.perform_scattering(lambda, &mut rng, &mut pp, m);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::boxes::Box3;
    use crate::grid::VoronoiMesh;
    use crate::sim::instruments::{FrameConfig, InstrumentConfig};
    use crate::sim::materials::{ElectronMix, SIGMA_THOMSON};
    use crate::sim::medium::MediumComponent;
    use crate::sim::recorder::Channel;
    use crate::sim::units::Units;
    use tempfile::tempdir;

    fn electron_cloud(num_density: f64) -> Arc<MediumSystem> {
        let sites = vec![
            Point::new(-0.4, 0., 0.),
            Point::new(0.4, 0., 0.),
            Point::new(0., 0.5, -0.2),
            Point::new(0., -0.5, 0.2),
        ];
        let mesh = Arc::new(VoronoiMesh::new(Box3::cube(1.), &sites, true).unwrap());
        let n = mesh.num_cells();
        let electrons =
            MediumComponent::new(Arc::new(ElectronMix::new(false)), vec![num_density; n]);
        Arc::new(MediumSystem::new(mesh, vec![electrons]).unwrap())
    }

    fn instrument(medium: &MediumSystem, grid: &WavelengthGrid) -> Arc<DistantInstrument> {
        let config = InstrumentConfig {
            name: "obs".into(),
            distance: 1000.,
            inclination: 0.3,
            azimuth: 0.8,
            roll: 0.,
            record_sed: true,
            frame: Some(FrameConfig {
                num_pixels_x: 8,
                num_pixels_y: 8,
                pixel_size_x: 0.5,
                pixel_size_y: 0.5,
                center_x: 0.,
                center_y: 0.,
            }),
            record_components: true,
            num_scattering_levels: 2,
            record_polarization: false,
            record_statistics: true,
        };
        Arc::new(
            DistantInstrument::new(
                config,
                grid.clone(),
                Units::neutral(),
                medium.has_media(),
                false,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_transparent_run_conserves_luminosity() -> Result<()> {
        let mesh = Arc::new(
            VoronoiMesh::new(Box3::cube(1.), &[Point::origin()], false).unwrap(),
        );
        let medium = Arc::new(MediumSystem::transparent(mesh));
        let grid = WavelengthGrid::log(1e-7, 1e-5, 4).unwrap();
        let instrument = instrument(&medium, &grid);

        let simulation = MonteCarloSimulation::new(
            Arc::clone(&medium),
            Source::Point {
                position: Point::origin(),
                luminosity: 100.,
            },
            vec![Arc::clone(&instrument)],
            grid,
            SimulationConfig {
                num_packets: 500,
                num_threads: 3,
                ..Default::default()
            },
        )?;
        simulation.run()?;

        // without media every packet lands once in the total channel, so
        // the raw detector sum equals the source luminosity
        let total: f64 = instrument
            .recorder()
            .sed_values(Channel::Total)
            .iter()
            .sum();
        assert!((total - 100.).abs() < 1e-9, "detected {total}");
        Ok(())
    }

    #[test]
    fn test_scattering_run_populates_component_channels() -> Result<()> {
        // optical depth through the cloud of order unity
        let medium = electron_cloud(0.5 / SIGMA_THOMSON);
        let grid = WavelengthGrid::log(1e-7, 1e-5, 4).unwrap();
        let instrument = instrument(&medium, &grid);

        let simulation = MonteCarloSimulation::new(
            Arc::clone(&medium),
            Source::Point {
                position: Point::new(0.1, 0., 0.),
                luminosity: 1.,
            },
            vec![Arc::clone(&instrument)],
            grid,
            SimulationConfig {
                num_packets: 400,
                num_threads: 4,
                seed: 7,
                ..Default::default()
            },
        )?;
        simulation.run()?;

        let recorder = instrument.recorder();
        let transparent: f64 = recorder.sed_values(Channel::Transparent).iter().sum();
        let direct: f64 = recorder.sed_values(Channel::PrimaryDirect).iter().sum();
        let scattered: f64 = recorder.sed_values(Channel::PrimaryScattered).iter().sum();
        assert!((transparent - 1.).abs() < 1e-9, "transparent {transparent}");
        assert!(direct > 0. && direct < transparent);
        assert!(scattered > 0., "no scattered flux recorded");

        // per-order channels decompose part of the scattered flux
        let level1: f64 = recorder.sed_values(Channel::ScatteredLevel(0)).iter().sum();
        let level2: f64 = recorder.sed_values(Channel::ScatteredLevel(1)).iter().sum();
        assert!(level1 > 0.);
        assert!(level1 + level2 <= scattered + 1e-9);

        // statistics were recorded for every history
        let m1: f64 = recorder.sed_moment(0).iter().sum();
        assert!(m1 > 0.);
        Ok(())
    }

    #[test]
    fn test_deterministic_given_seed() -> Result<()> {
        let run = || -> Result<Vec<f64>> {
            let medium = electron_cloud(0.5 / SIGMA_THOMSON);
            let grid = WavelengthGrid::log(1e-7, 1e-5, 4).unwrap();
            let instrument = instrument(&medium, &grid);
            let simulation = MonteCarloSimulation::new(
                Arc::clone(&medium),
                Source::Point {
                    position: Point::origin(),
                    luminosity: 1.,
                },
                vec![Arc::clone(&instrument)],
                grid,
                SimulationConfig {
                    num_packets: 100,
                    num_threads: 1,
                    seed: 99,
                    ..Default::default()
                },
            )?;
            simulation.run()?;
            Ok(instrument.recorder().sed_values(Channel::PrimaryScattered))
        };
        // per-history random streams make repeated runs reproducible
        assert_eq!(run()?, run()?);
        Ok(())
    }

    #[test]
    fn test_run_and_write_produces_output_files() -> Result<()> {
        let medium = electron_cloud(0.2 / SIGMA_THOMSON);
        let grid = WavelengthGrid::log(1e-7, 1e-5, 4).unwrap();
        let instrument = instrument(&medium, &grid);
        let simulation = MonteCarloSimulation::new(
            Arc::clone(&medium),
            Source::Point {
                position: Point::origin(),
                luminosity: 1.,
            },
            vec![instrument],
            grid,
            SimulationConfig {
                num_packets: 200,
                num_threads: 2,
                ..Default::default()
            },
        )?;

        let dir = tempdir()?;
        simulation.run_and_write(dir.path())?;
        assert!(dir.path().join("obs_sed.dat").exists());
        assert!(dir.path().join("obs_sed_stats.dat").exists());
        assert!(dir.path().join("obs_total.cube").exists());
        assert!(dir.path().join("obs_primaryscattered.cube").exists());
        Ok(())
    }

    #[test]
    fn test_emission_from_mesh_mass_distribution() -> Result<()> {
        let sites = vec![Point::new(-0.4, 0., 0.), Point::new(0.4, 0., 0.)];
        let masses = vec![1., 3.];
        let mesh = Arc::new(
            VoronoiMesh::with_masses(Box3::cube(1.), &sites, &masses, false).unwrap(),
        );
        let n = mesh.num_cells();
        let electrons = MediumComponent::new(Arc::new(ElectronMix::new(false)), vec![0.; n]);
        let medium = Arc::new(MediumSystem::new(mesh, vec![electrons]).unwrap());
        let grid = WavelengthGrid::log(1e-7, 1e-5, 4).unwrap();
        let instrument = instrument(&medium, &grid);

        let simulation = MonteCarloSimulation::new(
            Arc::clone(&medium),
            Source::Cells { luminosity: 10. },
            vec![Arc::clone(&instrument)],
            grid,
            SimulationConfig {
                num_packets: 300,
                num_threads: 2,
                ..Default::default()
            },
        )?;
        simulation.run()?;

        let transparent: f64 = instrument
            .recorder()
            .sed_values(Channel::Transparent)
            .iter()
            .sum();
        assert!((transparent - 10.).abs() < 1e-9);
        Ok(())
    }
}
