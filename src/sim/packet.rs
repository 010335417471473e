//! Photon packets: the entities transported by the simulation.

use crate::{Point, Vector};

/// Which kind of source emitted the packet's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOrigin {
    /// Emitted by a primary source (stars, AGN, ...).
    Primary,
    /// Emitted by the medium itself.
    Secondary,
}

/// A monochromatic photon packet.
///
/// The luminosity is the number of photons carried per unit time expressed
/// as a power; it can be fractional and is adjusted by biasing factors
/// during the packet's life. The Stokes components are stored relative to
/// unit intensity, together with the reference normal that fixes their
/// frame. The history index identifies the full emission-and-scatter chain
/// the packet belongs to and is stable across all its peel-offs.
#[derive(Debug, Clone)]
pub struct PhotonPacket {
    lambda: f64,
    luminosity: f64,
    position: Point,
    direction: Vector,
    num_scatt: u32,
    origin: PacketOrigin,
    history: u64,
    polarized: bool,
    q: f64,
    u: f64,
    v: f64,
    normal: Vector,
}

impl PhotonPacket {
    /// Initializes a packet for a new life cycle, unpolarized and with zero
    /// scatterings.
    pub fn launch(
        history: u64,
        lambda: f64,
        luminosity: f64,
        position: Point,
        direction: Vector,
        origin: PacketOrigin,
    ) -> Self {
        Self {
            lambda,
            luminosity,
            position,
            direction,
            num_scatt: 0,
            origin,
            history,
            polarized: false,
            q: 0.,
            u: 0.,
            v: 0.,
            normal: Vector::new(0., 0., 0.),
        }
    }

    /// A peel-off packet sent to an instrument for the emission event, with
    /// the given direction and weight bias.
    pub fn launch_emission_peel_off(&self, direction: Vector, w: f64) -> Self {
        let mut pp = self.clone();
        pp.direction = direction;
        pp.luminosity *= w;
        pp.set_unpolarized();
        pp
    }

    /// A peel-off packet sent to an instrument for a scattering event: the
    /// scattering counter is incremented and the weight bias applied. The
    /// polarization state starts out unpolarized and should be updated by
    /// the scattering code.
    pub fn launch_scattering_peel_off(&self, direction: Vector, w: f64) -> Self {
        let mut pp = self.clone();
        pp.direction = direction;
        pp.luminosity *= w;
        pp.num_scatt += 1;
        pp.set_unpolarized();
        pp
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn luminosity(&self) -> f64 {
        self.luminosity
    }

    pub fn position(&self) -> Point {
        self.position
    }

    pub fn direction(&self) -> Vector {
        self.direction
    }

    pub fn num_scatt(&self) -> u32 {
        self.num_scatt
    }

    pub fn has_primary_origin(&self) -> bool {
        self.origin == PacketOrigin::Primary
    }

    pub fn history_index(&self) -> u64 {
        self.history
    }

    /// Moves the packet over a distance `s` along its direction.
    pub fn propagate(&mut self, s: f64) {
        self.position = self.position + self.direction * s;
    }

    /// Scatters the packet into a new direction, incrementing the
    /// scattering counter. The polarization state is left untouched.
    pub fn scatter(&mut self, direction: Vector) {
        self.num_scatt += 1;
        self.direction = direction;
    }

    /// Applies a weight bias as a multiplication factor.
    pub fn apply_bias(&mut self, w: f64) {
        self.luminosity *= w;
    }

    // ------- polarization state -------

    pub fn is_polarized(&self) -> bool {
        self.polarized
    }

    pub fn stokes_q(&self) -> f64 {
        self.q
    }

    pub fn stokes_u(&self) -> f64 {
        self.u
    }

    pub fn stokes_v(&self) -> f64 {
        self.v
    }

    /// The reference normal fixing the frame of the Stokes components.
    pub fn polarization_normal(&self) -> Vector {
        self.normal
    }

    pub fn set_unpolarized(&mut self) {
        self.polarized = false;
        self.q = 0.;
        self.u = 0.;
        self.v = 0.;
        self.normal = Vector::new(0., 0., 0.);
    }

    pub fn set_polarized(&mut self, q: f64, u: f64, v: f64, normal: Vector) {
        self.polarized = true;
        self.q = q;
        self.u = u;
        self.v = v;
        self.normal = normal;
    }

    /// Rotates the polarization reference frame about the propagation
    /// direction over angle `phi`.
    pub fn rotate_stokes(&mut self, phi: f64) {
        if !self.polarized {
            return;
        }
        let (sin2, cos2) = (2. * phi).sin_cos();
        let q = self.q * cos2 + self.u * sin2;
        let u = -self.q * sin2 + self.u * cos2;
        self.q = q;
        self.u = u;

        let (sinp, cosp) = phi.sin_cos();
        let k = self.direction;
        self.normal = (self.normal * cosp + k.cross(self.normal) * sinp)
            .normalize()
            .unwrap_or(self.normal);
    }

    /// Applies a Mueller matrix for scattering off a spherically symmetric
    /// scatterer, specified by its independent elements, and renormalizes
    /// the Stokes components to unit intensity.
    pub fn apply_mueller(&mut self, s11: f64, s12: f64, s33: f64, s34: f64) {
        let i = s11 + s12 * self.q;
        let q = s12 + s11 * self.q;
        let u = s33 * self.u + s34 * self.v;
        let v = -s34 * self.u + s33 * self.v;
        if i > 0. {
            self.polarized = true;
            self.q = q / i;
            self.u = u / i;
            self.v = v / i;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_packet() -> PhotonPacket {
        PhotonPacket::launch(
            42,
            5e-7,
            2.,
            Point::origin(),
            Vector::new(0., 0., 1.),
            PacketOrigin::Primary,
        )
    }

    #[test]
    fn test_launch_defaults() {
        let pp = test_packet();
        assert_eq!(pp.num_scatt(), 0);
        assert!(pp.has_primary_origin());
        assert!(!pp.is_polarized());
        assert_eq!(pp.history_index(), 42);
        assert_eq!(pp.luminosity(), 2.);
    }

    #[test]
    fn test_propagate_and_scatter() {
        let mut pp = test_packet();
        pp.propagate(3.);
        assert!(pp.position().is_close(&Point::new(0., 0., 3.)));
        pp.scatter(Vector::new(1., 0., 0.));
        assert_eq!(pp.num_scatt(), 1);
        pp.propagate(2.);
        assert!(pp.position().is_close(&Point::new(2., 0., 3.)));
    }

    #[test]
    fn test_peel_off_keeps_history_and_counts_scattering() {
        let mut pp = test_packet();
        pp.scatter(Vector::new(1., 0., 0.));

        let ppp = pp.launch_scattering_peel_off(Vector::new(0., 1., 0.), 0.5);
        assert_eq!(ppp.history_index(), 42);
        assert_eq!(ppp.num_scatt(), 2);
        assert_eq!(ppp.luminosity(), 1.);
        // the original packet is unchanged
        assert_eq!(pp.num_scatt(), 1);
        assert_eq!(pp.luminosity(), 2.);

        let direct = pp.launch_emission_peel_off(Vector::new(0., 1., 0.), 1.);
        assert_eq!(direct.num_scatt(), 1);
        assert_eq!(direct.luminosity(), 2.);
    }

    #[test]
    fn test_rotate_stokes_preserves_linear_polarization_degree() {
        let mut pp = test_packet();
        pp.set_polarized(0.3, 0.4, 0.1, Vector::new(1., 0., 0.));
        let before = (pp.stokes_q().powi(2) + pp.stokes_u().powi(2)).sqrt();
        pp.rotate_stokes(0.7);
        let after = (pp.stokes_q().powi(2) + pp.stokes_u().powi(2)).sqrt();
        assert!((before - after).abs() < 1e-12);
        // the normal stays perpendicular to the direction
        assert!(pp.polarization_normal().dot(pp.direction()).abs() < 1e-12);
    }

    #[test]
    fn test_rotate_stokes_full_turn_is_identity() {
        let mut pp = test_packet();
        pp.set_polarized(0.3, -0.2, 0.05, Vector::new(1., 0., 0.));
        pp.rotate_stokes(std::f64::consts::TAU);
        assert!((pp.stokes_q() - 0.3).abs() < 1e-12);
        assert!((pp.stokes_u() + 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_apply_mueller_normalizes_intensity() {
        let mut pp = test_packet();
        pp.set_polarized(0.5, 0., 0., Vector::new(1., 0., 0.));
        // right-angle Thomson scattering fully polarizes the packet
        let c: f64 = 0.;
        let half = 0.5;
        pp.apply_mueller(
            half * (c * c + 1.),
            half * (c * c - 1.),
            c,
            0.,
        );
        assert!(pp.is_polarized());
        assert!((pp.stokes_q() + 1.).abs() < 1e-12);
        assert!(pp.stokes_u().abs() < 1e-12);
    }
}
