//! The medium system: material mixes distributed over the mesh cells.

use std::sync::Arc;

use anyhow::{ensure, Result};

use crate::grid::path::GridPath;
use crate::grid::VoronoiMesh;
use crate::sim::materials::{MaterialMix, PeelOff};
use crate::sim::packet::PhotonPacket;
use crate::sim::random::Random;
use crate::{Point, Vector};

/// One material component: a mix plus its number density in every cell.
pub struct MediumComponent {
    mix: Arc<dyn MaterialMix>,
    number_density: Vec<f64>,
}

impl MediumComponent {
    pub fn new(mix: Arc<dyn MaterialMix>, number_density: Vec<f64>) -> Self {
        Self {
            mix,
            number_density,
        }
    }

    pub fn mix(&self) -> &Arc<dyn MaterialMix> {
        &self.mix
    }

    pub fn number_density(&self, m: usize) -> f64 {
        self.number_density[m]
    }
}

/// All media in the simulation, bound to the cells of a Voronoi mesh.
/// Read-only after construction and safe for concurrent queries.
pub struct MediumSystem {
    mesh: Arc<VoronoiMesh>,
    components: Vec<MediumComponent>,
}

impl MediumSystem {
    pub fn new(mesh: Arc<VoronoiMesh>, components: Vec<MediumComponent>) -> Result<Self> {
        for (h, component) in components.iter().enumerate() {
            ensure!(
                component.number_density.len() == mesh.num_cells(),
                "component {h} has {} cell densities for {} cells",
                component.number_density.len(),
                mesh.num_cells()
            );
        }
        Ok(Self { mesh, components })
    }

    /// A system without any media: every opacity is zero.
    pub fn transparent(mesh: Arc<VoronoiMesh>) -> Self {
        Self {
            mesh,
            components: Vec::new(),
        }
    }

    pub fn mesh(&self) -> &Arc<VoronoiMesh> {
        &self.mesh
    }

    pub fn has_media(&self) -> bool {
        !self.components.is_empty()
    }

    pub fn has_polarized_scattering(&self) -> bool {
        self.components
            .iter()
            .any(|c| c.mix.has_polarized_scattering())
    }

    pub fn opacity_abs(&self, lambda: f64, m: usize) -> f64 {
        self.components
            .iter()
            .map(|c| c.mix.opacity_abs(lambda, c.number_density[m]))
            .sum()
    }

    pub fn opacity_sca(&self, lambda: f64, m: usize) -> f64 {
        self.components
            .iter()
            .map(|c| c.mix.opacity_sca(lambda, c.number_density[m]))
            .sum()
    }

    pub fn opacity_ext(&self, lambda: f64, m: usize) -> f64 {
        self.components
            .iter()
            .map(|c| c.mix.opacity_ext(lambda, c.number_density[m]))
            .sum()
    }

    /// Scattering albedo in cell `m`: the fraction of extinction that is
    /// scattering.
    pub fn albedo(&self, lambda: f64, m: usize) -> f64 {
        let ext = self.opacity_ext(lambda, m);
        if ext > 0. {
            self.opacity_sca(lambda, m) / ext
        } else {
            0.
        }
    }

    /// Optical depth accumulated along a grid path.
    pub fn optical_depth(&self, lambda: f64, path: &GridPath) -> f64 {
        path.segments()
            .iter()
            .filter_map(|seg| seg.cell.map(|m| self.opacity_ext(lambda, m) * seg.ds))
            .sum()
    }

    /// Optical depth from a position towards infinity along a direction.
    pub fn optical_depth_along(
        &self,
        lambda: f64,
        position: Point,
        direction: Vector,
    ) -> Result<f64> {
        let path = self.mesh.walk(position, direction)?;
        Ok(self.optical_depth(lambda, &path))
    }

    /// Locates the interaction point where the accumulated optical depth
    /// along the path reaches `tau_target`. Returns the distance from the
    /// path origin and the cell of the interaction, or None when the packet
    /// escapes the grid first.
    pub fn sample_interaction(
        &self,
        lambda: f64,
        path: &GridPath,
        tau_target: f64,
    ) -> Option<(f64, usize)> {
        let mut tau = 0.;
        for seg in path.segments() {
            let Some(m) = seg.cell else { continue };
            let k_ext = self.opacity_ext(lambda, m);
            let tau_segment = k_ext * seg.ds;
            if tau + tau_segment > tau_target {
                let s = seg.s - seg.ds + (tau_target - tau) / k_ext;
                return Some((s, m));
            }
            tau += tau_segment;
        }
        None
    }

    /// Performs a scattering event in cell `m`, delegating to a component
    /// chosen with probability proportional to its scattering opacity.
    pub fn perform_scattering(
        &self,
        lambda: f64,
        rng: &mut Random,
        pp: &mut PhotonPacket,
        m: usize,
    ) {
        let weights: Vec<f64> = self
            .components
            .iter()
            .map(|c| c.mix.opacity_sca(lambda, c.number_density[m]))
            .collect();
        let total: f64 = weights.iter().sum();
        if total <= 0. {
            return;
        }
        let mut pick = rng.uniform() * total;
        for (component, w) in self.components.iter().zip(&weights) {
            pick -= w;
            if pick <= 0. {
                component.mix.perform_scattering(lambda, rng, pp);
                return;
            }
        }
        if let Some(component) = self.components.last() {
            component.mix.perform_scattering(lambda, rng, pp);
        }
    }

    /// Peel-off for a scattering event in cell `m` towards an instrument:
    /// the component contributions are combined weighted by scattering
    /// opacity.
    pub fn peel_off(
        &self,
        lambda: f64,
        pp: &PhotonPacket,
        m: usize,
        direction: Vector,
    ) -> PeelOff {
        let mut total_w = 0.;
        let mut weight = 0.;
        let mut pol_w = 0.;
        let mut acc = (0., 0., 0.);
        let mut frame: Option<Vector> = None;
        for component in &self.components {
            let w = component.mix.opacity_sca(lambda, component.number_density[m]);
            if w <= 0. {
                continue;
            }
            let peel = component.mix.peel_off(lambda, pp, direction);
            weight += w * peel.weight;
            total_w += w;
            if let Some((q, u, v, normal)) = peel.stokes {
                acc.0 += w * q;
                acc.1 += w * u;
                acc.2 += w * v;
                pol_w += w;
                frame = Some(normal);
            }
        }
        if total_w > 0. {
            weight /= total_w;
        }
        PeelOff {
            weight,
            stokes: frame.map(|n| (acc.0 / pol_w, acc.1 / pol_w, acc.2 / pol_w, n)),
        }
    }
}
