use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use photon3d::grid::VoronoiMesh;
use photon3d::sim::instruments::{DistantInstrument, FrameConfig, InstrumentConfig};
use photon3d::sim::materials::{ElectronMix, GrayDustMix, SIGMA_THOMSON};
use photon3d::sim::medium::{MediumComponent, MediumSystem};
use photon3d::sim::simulation::{MonteCarloSimulation, SimulationConfig, Source};
use photon3d::sim::units::Units;
use photon3d::sim::wavelengths::WavelengthGrid;
use photon3d::{Box3, Point};

/// Demo run: a clumpy electron/dust cloud around a central point source,
/// observed edge-on by one instrument with all recording options on.
fn main() -> Result<()> {
    env_logger::init();

    // a random cloud of Voronoi sites in a unit box
    let extent = Box3::cube(1.);
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let sites: Vec<Point> = (0..500)
        .map(|_| {
            Point::new(
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            )
        })
        .collect();
    let mesh = Arc::new(VoronoiMesh::new(extent, &sites, true)?);

    // electrons plus gray dust, denser towards the center
    let num_cells = mesh.num_cells();
    let electron_density: Vec<f64> = (0..num_cells)
        .map(|m| {
            let r = mesh.cell(m).site().distance_to(&Point::origin());
            0.4 / SIGMA_THOMSON * (-2. * r).exp()
        })
        .collect();
    let dust_density: Vec<f64> = (0..num_cells).map(|_| 0.05 / SIGMA_THOMSON).collect();
    let medium = Arc::new(MediumSystem::new(
        Arc::clone(&mesh),
        vec![
            MediumComponent::new(Arc::new(ElectronMix::new(true)), electron_density),
            MediumComponent::new(
                Arc::new(GrayDustMix::new(SIGMA_THOMSON, 0.6)),
                dust_density,
            ),
        ],
    )?);

    let lambda_grid = WavelengthGrid::log(1e-7, 1e-5, 25)?;
    let instrument = Arc::new(DistantInstrument::new(
        InstrumentConfig {
            name: "edgeon".into(),
            distance: 1e4,
            inclination: std::f64::consts::FRAC_PI_2,
            azimuth: 0.,
            roll: 0.,
            record_sed: true,
            frame: Some(FrameConfig {
                num_pixels_x: 50,
                num_pixels_y: 50,
                pixel_size_x: 0.05,
                pixel_size_y: 0.05,
                center_x: 0.,
                center_y: 0.,
            }),
            record_components: true,
            num_scattering_levels: 3,
            record_polarization: true,
            record_statistics: true,
        },
        lambda_grid.clone(),
        Units::spectral(),
        medium.has_media(),
        false,
    )?);

    let simulation = MonteCarloSimulation::new(
        medium,
        Source::Point {
            position: Point::origin(),
            luminosity: 3.8e26,
        },
        vec![instrument],
        lambda_grid,
        SimulationConfig {
            num_packets: 100_000,
            num_threads: std::thread::available_parallelism()?.get(),
            seed: 42,
            ..Default::default()
        },
    )?;
    simulation.run_and_write(Path::new("output"))?;
    println!("output written to ./output");
    Ok(())
}
