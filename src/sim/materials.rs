//! Material mixes: the optical properties of the media.
//!
//! A mix exposes cross sections per wavelength, opacities for a given
//! number density, and the scattering operations used by the photon cycle.
//! The engine talks to mixes only through the [`MaterialMix`] trait.

use crate::sim::packet::PhotonPacket;
use crate::sim::random::Random;
use crate::Vector;

/// Thomson cross section for scattering off free electrons (m2).
pub const SIGMA_THOMSON: f64 = 6.6524587321e-29;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialType {
    Dust,
    Electrons,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScatteringMode {
    /// Sample the scattering angle from the mix's phase function.
    MaterialPhaseFunction,
    /// Sample both angles and track the Stokes vector through the event.
    SphericalPolarization,
}

/// The result of peeling off a scattering event towards an instrument: the
/// weight bias from the phase function, and the polarization state of the
/// peel-off packet if the mix tracks it.
pub struct PeelOff {
    pub weight: f64,
    pub stokes: Option<(f64, f64, f64, Vector)>,
}

/// Capability set required from a material by the transfer loop.
pub trait MaterialMix: Send + Sync {
    fn material_type(&self) -> MaterialType;

    fn scattering_mode(&self) -> ScatteringMode;

    fn has_polarized_scattering(&self) -> bool {
        self.scattering_mode() == ScatteringMode::SphericalPolarization
    }

    /// Absorption cross section per entity (m2).
    fn section_abs(&self, lambda: f64) -> f64;

    /// Scattering cross section per entity (m2).
    fn section_sca(&self, lambda: f64) -> f64;

    fn section_ext(&self, lambda: f64) -> f64 {
        self.section_abs(lambda) + self.section_sca(lambda)
    }

    /// Absorption opacity (1/m) for the given number density (1/m3).
    fn opacity_abs(&self, lambda: f64, number_density: f64) -> f64 {
        number_density * self.section_abs(lambda)
    }

    fn opacity_sca(&self, lambda: f64, number_density: f64) -> f64 {
        number_density * self.section_sca(lambda)
    }

    fn opacity_ext(&self, lambda: f64, number_density: f64) -> f64 {
        number_density * self.section_ext(lambda)
    }

    /// Value of the phase function for scattering the packet into the given
    /// direction, normalized to unit average over the sphere.
    fn phase_function_value(&self, lambda: f64, pp: &PhotonPacket, direction: Vector) -> f64;

    /// Updates the packet's direction (and polarization state, if tracked)
    /// for a scattering event.
    fn perform_scattering(&self, lambda: f64, rng: &mut Random, pp: &mut PhotonPacket);

    /// Weight and polarization state for a peel-off towards `direction`.
    fn peel_off(&self, lambda: f64, pp: &PhotonPacket, direction: Vector) -> PeelOff {
        PeelOff {
            weight: self.phase_function_value(lambda, pp, direction),
            stokes: None,
        }
    }
}

// ------- dipole phase function -------

/// Dipole phase function value for a scattering cosine, normalized to unit
/// average over the sphere.
pub fn dipole_phase_value(costheta: f64) -> f64 {
    0.75 * (1. + costheta * costheta)
}

/// Draws a scattering cosine from the dipole phase function by inverting
/// its cumulative distribution in closed form (a depressed cubic).
pub fn dipole_cosine(rng: &mut Random) -> f64 {
    let q = 4. - 8. * rng.uniform();
    let d = (0.25 * q * q + 1.).sqrt();
    (-0.5 * q + d).cbrt() + (-0.5 * q - d).cbrt()
}

/// New propagation direction from the old one, a scattering cosine, and an
/// azimuth measured from `reference` (which must be perpendicular to `k`).
fn scattered_direction(k: Vector, reference: Vector, costheta: f64, phi: f64) -> Vector {
    let sintheta = (1. - costheta * costheta).max(0.).sqrt();
    let binormal = k.cross(reference);
    let dir = k * costheta + (reference * phi.cos() + binormal * phi.sin()) * sintheta;
    dir.normalize().unwrap_or(k)
}

// ------- free electrons -------

/// Thomson scattering off free electrons: no absorption, a constant
/// scattering cross section, and a dipole phase function. With polarization
/// enabled, the Stokes vector is tracked through the Thomson Mueller
/// matrix.
pub struct ElectronMix {
    include_polarization: bool,
}

impl ElectronMix {
    pub fn new(include_polarization: bool) -> Self {
        Self {
            include_polarization,
        }
    }

    /// Mueller matrix elements for Thomson scattering over a cosine.
    fn mueller(costheta: f64) -> (f64, f64, f64, f64) {
        let c2 = costheta * costheta;
        (0.5 * (c2 + 1.), 0.5 * (c2 - 1.), costheta, 0.)
    }

    /// Azimuth density around the propagation axis for a polarized packet,
    /// relative to the packet's reference normal (unnormalized).
    fn azimuth_density(costheta: f64, q: f64, u: f64, phi: f64) -> f64 {
        let c2 = costheta * costheta;
        (1. + c2) + (c2 - 1.) * (q * (2. * phi).cos() + u * (2. * phi).sin())
    }

    fn reference_for(pp: &PhotonPacket) -> Vector {
        if pp.is_polarized() {
            pp.polarization_normal()
        } else {
            pp.direction().orthogonal_basis().0
        }
    }

    /// Azimuth of `direction` around the packet axis, measured from the
    /// given reference normal.
    fn azimuth_of(pp: &PhotonPacket, reference: Vector, direction: Vector) -> f64 {
        let k = pp.direction();
        let perp = direction - k * k.dot(direction);
        perp.dot(k.cross(reference)).atan2(perp.dot(reference))
    }
}

impl MaterialMix for ElectronMix {
    fn material_type(&self) -> MaterialType {
        MaterialType::Electrons
    }

    fn scattering_mode(&self) -> ScatteringMode {
        if self.include_polarization {
            ScatteringMode::SphericalPolarization
        } else {
            ScatteringMode::MaterialPhaseFunction
        }
    }

    fn section_abs(&self, _lambda: f64) -> f64 {
        0.
    }

    fn section_sca(&self, _lambda: f64) -> f64 {
        SIGMA_THOMSON
    }

    fn phase_function_value(&self, _lambda: f64, pp: &PhotonPacket, direction: Vector) -> f64 {
        let costheta = pp.direction().dot(direction);
        if !self.include_polarization || !pp.is_polarized() {
            return dipole_phase_value(costheta);
        }
        let reference = pp.polarization_normal();
        let phi = Self::azimuth_of(pp, reference, direction);
        0.75 * Self::azimuth_density(costheta, pp.stokes_q(), pp.stokes_u(), phi)
    }

    fn perform_scattering(&self, _lambda: f64, rng: &mut Random, pp: &mut PhotonPacket) {
        let k = pp.direction();
        let costheta = dipole_cosine(rng);

        if !self.include_polarization {
            let phi = rng.uniform() * std::f64::consts::TAU;
            let reference = k.orthogonal_basis().0;
            pp.scatter(scattered_direction(k, reference, costheta, phi));
            return;
        }

        // sample the azimuth from the polarization-dependent density by
        // rejection against a flat envelope
        let reference = Self::reference_for(pp);
        let (q, u) = (pp.stokes_q(), pp.stokes_u());
        let c2 = costheta * costheta;
        let envelope = (1. + c2) + (1. - c2) * (q * q + u * u).sqrt();
        let phi = loop {
            let phi = rng.uniform() * std::f64::consts::TAU;
            if rng.uniform() * envelope <= Self::azimuth_density(costheta, q, u, phi) {
                break phi;
            }
        };

        let new_direction = scattered_direction(k, reference, costheta, phi);

        // rotate the Stokes frame into the scattering plane, apply the
        // Mueller matrix, and leave the frame normal to that plane
        if !pp.is_polarized() {
            pp.set_polarized(0., 0., 0., reference);
        }
        pp.rotate_stokes(phi);
        let (s11, s12, s33, s34) = Self::mueller(costheta);
        pp.apply_mueller(s11, s12, s33, s34);
        let plane_normal = k
            .cross(new_direction)
            .normalize()
            .unwrap_or(pp.polarization_normal());
        let (q, u, v) = (pp.stokes_q(), pp.stokes_u(), pp.stokes_v());
        pp.set_polarized(q, u, v, plane_normal);
        pp.scatter(new_direction);
    }

    fn peel_off(&self, lambda: f64, pp: &PhotonPacket, direction: Vector) -> PeelOff {
        let weight = self.phase_function_value(lambda, pp, direction);
        if !self.include_polarization {
            return PeelOff {
                weight,
                stokes: None,
            };
        }

        let k = pp.direction();
        let costheta = k.dot(direction);
        let reference = Self::reference_for(pp);

        // Stokes state seen by the observer: rotate into the scattering
        // plane towards the instrument, then apply the Mueller matrix
        let mut ppp = pp.clone();
        if !ppp.is_polarized() {
            ppp.set_polarized(0., 0., 0., reference);
        }
        let phi = Self::azimuth_of(&ppp, ppp.polarization_normal(), direction);
        ppp.rotate_stokes(phi);
        let (s11, s12, s33, s34) = Self::mueller(costheta);
        ppp.apply_mueller(s11, s12, s33, s34);
        let plane_normal = k.cross(direction).normalize().unwrap_or(reference);
        PeelOff {
            weight,
            stokes: Some((ppp.stokes_q(), ppp.stokes_u(), ppp.stokes_v(), plane_normal)),
        }
    }
}

// ------- gray dust -------

/// A dust population with wavelength-independent cross sections and
/// isotropic scattering. Useful as a stand-in medium and in tests.
pub struct GrayDustMix {
    section_ext: f64,
    albedo: f64,
}

impl GrayDustMix {
    pub fn new(section_ext: f64, albedo: f64) -> Self {
        Self {
            section_ext,
            albedo,
        }
    }
}

impl MaterialMix for GrayDustMix {
    fn material_type(&self) -> MaterialType {
        MaterialType::Dust
    }

    fn scattering_mode(&self) -> ScatteringMode {
        ScatteringMode::MaterialPhaseFunction
    }

    fn section_abs(&self, _lambda: f64) -> f64 {
        self.section_ext * (1. - self.albedo)
    }

    fn section_sca(&self, _lambda: f64) -> f64 {
        self.section_ext * self.albedo
    }

    fn phase_function_value(&self, _lambda: f64, _pp: &PhotonPacket, _direction: Vector) -> f64 {
        1.
    }

    fn perform_scattering(&self, _lambda: f64, rng: &mut Random, pp: &mut PhotonPacket) {
        pp.scatter(rng.isotropic_direction());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::packet::PacketOrigin;
    use crate::Point;

    fn packet_along_z() -> PhotonPacket {
        PhotonPacket::launch(
            0,
            5e-7,
            1.,
            Point::origin(),
            Vector::new(0., 0., 1.),
            PacketOrigin::Primary,
        )
    }

    #[test]
    fn test_thomson_cross_sections() {
        let mix = ElectronMix::new(false);
        assert_eq!(mix.section_abs(5e-7), 0.);
        assert_eq!(mix.section_sca(5e-7), SIGMA_THOMSON);
        assert_eq!(mix.section_ext(1e-5), SIGMA_THOMSON);
        // wavelength independence
        assert_eq!(mix.section_sca(1e-7), mix.section_sca(1e-4));
    }

    #[test]
    fn test_dipole_cosine_bounds_and_moments() {
        let mut rng = Random::with_seed(11);
        let n = 50_000;
        let mut m1 = 0.;
        let mut m2 = 0.;
        for _ in 0..n {
            let c = dipole_cosine(&mut rng);
            assert!((-1.0..=1.0).contains(&c), "cosine {c} out of range");
            m1 += c;
            m2 += c * c;
        }
        m1 /= n as f64;
        m2 /= n as f64;
        // for the dipole density (3/8)(1+c^2): mean 0, second moment 2/5
        assert!(m1.abs() < 0.01, "mean {m1}");
        assert!((m2 - 0.4).abs() < 0.01, "second moment {m2}");
    }

    #[test]
    fn test_dipole_phase_value_normalization() {
        // the average of the phase function over isotropic directions is 1
        let mut rng = Random::with_seed(13);
        let mix = ElectronMix::new(false);
        let pp = packet_along_z();
        let n = 50_000;
        let avg: f64 = (0..n)
            .map(|_| mix.phase_function_value(5e-7, &pp, rng.isotropic_direction()))
            .sum::<f64>()
            / n as f64;
        assert!((avg - 1.).abs() < 0.01, "average phase value {avg}");
    }

    #[test]
    fn test_unpolarized_scattering_updates_direction_only() {
        let mix = ElectronMix::new(false);
        let mut rng = Random::with_seed(17);
        let mut pp = packet_along_z();
        mix.perform_scattering(5e-7, &mut rng, &mut pp);
        assert_eq!(pp.num_scatt(), 1);
        assert!((pp.direction().length() - 1.).abs() < 1e-12);
        assert!(!pp.is_polarized());
    }

    #[test]
    fn test_polarized_scattering_tracks_stokes() {
        let mix = ElectronMix::new(true);
        let mut rng = Random::with_seed(19);
        let mut pp = packet_along_z();
        mix.perform_scattering(5e-7, &mut rng, &mut pp);
        assert!(pp.is_polarized());
        let degree = (pp.stokes_q().powi(2) + pp.stokes_u().powi(2) + pp.stokes_v().powi(2)).sqrt();
        assert!(degree <= 1. + 1e-12, "polarization degree {degree}");
        // the reference normal is perpendicular to the direction
        assert!(pp.polarization_normal().dot(pp.direction()).abs() < 1e-9);
    }

    #[test]
    fn test_right_angle_peel_off_is_fully_polarized() {
        let mix = ElectronMix::new(true);
        let pp = packet_along_z();
        let peel = mix.peel_off(5e-7, &pp, Vector::new(1., 0., 0.));
        let (q, u, v, _normal) = peel.stokes.unwrap();
        // Thomson scattering of unpolarized light at right angles yields
        // complete linear polarization perpendicular to the plane
        assert!((q.abs() - 1.).abs() < 1e-9, "q = {q}");
        assert!(u.abs() < 1e-9);
        assert!(v.abs() < 1e-9);
        // and the peel-off weight is half the forward-scattering value
        assert!((peel.weight - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_gray_dust_albedo_split() {
        let mix = GrayDustMix::new(2e-26, 0.25);
        assert!((mix.section_sca(1e-6) - 0.5e-26).abs() < 1e-40);
        assert!((mix.section_abs(1e-6) - 1.5e-26).abs() < 1e-40);
        assert!((mix.opacity_ext(1e-6, 1e20) - 2e-6).abs() < 1e-18);
    }
}
