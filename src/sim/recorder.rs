//! The flux recorder: accumulates photon packet detections into binned
//! detector arrays and calibrates and writes them at the end of the run.
//!
//! Detections arrive concurrently from all worker threads; the detector
//! arrays are lock-free accumulators. Per-history statistics are queued in
//! thread-local contribution lists and folded into the moment arrays when a
//! thread moves on to the next history, relying on the guarantee that all
//! detections of one history happen consecutively on one thread.

use std::path::Path;

use anyhow::Result;
use log::info;

use crate::io::cube::{self, CubeMeta};
use crate::io::table::TextTable;
use crate::parallel::PerThread;
use crate::sim::lockfree::AtomicArray;
use crate::sim::packet::PhotonPacket;
use crate::sim::process;
use crate::sim::units::Units;
use crate::sim::wavelengths::WavelengthGrid;

/// Number of statistics moment arrays (sums of w^1 .. w^4).
pub const NUM_STAT_MOMENTS: usize = 4;

// indices of the detector arrays that need calibration
const TOTAL: usize = 0;
const TRANSPARENT: usize = 1;
const PRIMARY_DIRECT: usize = 2;
const PRIMARY_SCATTERED: usize = 3;
const SECONDARY_DIRECT: usize = 4;
const SECONDARY_SCATTERED: usize = 5;
const STOKES_Q: usize = 6;
const STOKES_U: usize = 7;
const STOKES_V: usize = 8;
const SCATTERED_LEVEL: usize = 9;

/// Publicly addressable detector channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Total,
    Transparent,
    PrimaryDirect,
    PrimaryScattered,
    SecondaryDirect,
    SecondaryScattered,
    StokesQ,
    StokesU,
    StokesV,
    /// Contributions from packets scattered exactly `level + 1` times.
    ScatteredLevel(usize),
}

impl Channel {
    fn index(self) -> usize {
        match self {
            Channel::Total => TOTAL,
            Channel::Transparent => TRANSPARENT,
            Channel::PrimaryDirect => PRIMARY_DIRECT,
            Channel::PrimaryScattered => PRIMARY_SCATTERED,
            Channel::SecondaryDirect => SECONDARY_DIRECT,
            Channel::SecondaryScattered => SECONDARY_SCATTERED,
            Channel::StokesQ => STOKES_Q,
            Channel::StokesU => STOKES_U,
            Channel::StokesV => STOKES_V,
            Channel::ScatteredLevel(level) => SCATTERED_LEVEL + level,
        }
    }
}

/// One queued statistics contribution: wavelength bin, pixel bin, weight.
#[derive(Debug, Clone, Copy)]
struct Contribution {
    ell: usize,
    l: i32,
    w: f64,
}

/// The contributions of the photon packet history currently handled by one
/// thread. Recycled when the thread sees a packet with a new history index.
#[derive(Default)]
struct ContributionList {
    history: u64,
    contributions: Vec<Contribution>,
}

impl ContributionList {
    fn has_history(&self, history: u64) -> bool {
        self.history == history
    }

    fn add(&mut self, ell: usize, l: i32, w: f64) {
        self.contributions.push(Contribution { ell, l, w });
    }

    fn reset(&mut self, history: u64) {
        self.history = history;
        self.contributions.clear();
    }

    fn sort(&mut self) {
        self.contributions.sort_by_key(|c| (c.ell, c.l));
    }
}

/// Records the fluxes detected by one instrument into SED and/or IFU
/// detector arrays, with optional components, polarization, per-order and
/// statistics channels.
pub struct FluxRecorder {
    instrument_name: String,
    lambda_grid: WavelengthGrid,
    units: Units,

    has_medium: bool,
    has_medium_emission: bool,
    record_components: bool,
    num_scattering_levels: usize,
    record_polarization: bool,
    record_statistics: bool,

    include_flux_density: bool,
    include_surface_brightness: bool,
    distance: f64,
    num_pixels_x: usize,
    num_pixels_y: usize,
    pixel_size_x: f64,
    pixel_size_y: f64,
    center_x: f64,
    center_y: f64,

    record_total_only: bool,
    num_pixels_in_frame: usize,

    sed: Vec<AtomicArray>,
    ifu: Vec<AtomicArray>,
    wsed: Vec<AtomicArray>,
    wifu: Vec<AtomicArray>,
    contribution_lists: PerThread<ContributionList>,
}

impl FluxRecorder {
    pub fn new(instrument_name: &str, lambda_grid: WavelengthGrid, units: Units) -> Self {
        Self {
            instrument_name: instrument_name.to_string(),
            lambda_grid,
            units,
            has_medium: false,
            has_medium_emission: false,
            record_components: false,
            num_scattering_levels: 0,
            record_polarization: false,
            record_statistics: false,
            include_flux_density: false,
            include_surface_brightness: false,
            distance: 0.,
            num_pixels_x: 0,
            num_pixels_y: 0,
            pixel_size_x: 0.,
            pixel_size_y: 0.,
            center_x: 0.,
            center_y: 0.,
            record_total_only: true,
            num_pixels_in_frame: 0,
            sed: Vec::new(),
            ifu: Vec::new(),
            wsed: Vec::new(),
            wifu: Vec::new(),
            contribution_lists: PerThread::new(),
        }
    }

    /// Tells the recorder about the media in the simulation.
    pub fn set_simulation_info(&mut self, has_medium: bool, has_medium_emission: bool) {
        self.has_medium = has_medium;
        self.has_medium_emission = has_medium_emission;
    }

    /// Sets the user-configurable recording options.
    pub fn set_user_flags(
        &mut self,
        record_components: bool,
        num_scattering_levels: usize,
        record_polarization: bool,
        record_statistics: bool,
    ) {
        self.record_components = record_components;
        self.num_scattering_levels = num_scattering_levels;
        self.record_polarization = record_polarization;
        self.record_statistics = record_statistics;
    }

    /// Enables SED recording for an instrument at the given distance.
    pub fn include_flux_density(&mut self, distance: f64) {
        self.include_flux_density = true;
        self.distance = distance;
    }

    /// Enables IFU recording with the given frame geometry.
    #[allow(clippy::too_many_arguments)]
    pub fn include_surface_brightness(
        &mut self,
        distance: f64,
        num_pixels_x: usize,
        num_pixels_y: usize,
        pixel_size_x: f64,
        pixel_size_y: f64,
        center_x: f64,
        center_y: f64,
    ) {
        self.include_surface_brightness = true;
        self.distance = distance;
        self.num_pixels_x = num_pixels_x;
        self.num_pixels_y = num_pixels_y;
        self.pixel_size_x = pixel_size_x;
        self.pixel_size_y = pixel_size_y;
        self.center_x = center_x;
        self.center_y = center_y;
    }

    /// Allocates the detector arrays according to the configuration. Must
    /// be called once, before the first detection.
    pub fn finalize_configuration(&mut self) {
        self.num_pixels_in_frame = self.num_pixels_x * self.num_pixels_y;
        let len_sed = if self.include_flux_density {
            self.lambda_grid.num_bins()
        } else {
            0
        };
        let len_ifu = if self.include_surface_brightness {
            self.num_pixels_in_frame * self.lambda_grid.num_bins()
        } else {
            0
        };

        // there are no components to record without a medium
        self.record_total_only = !self.record_components || !self.has_medium;

        let num_arrays = SCATTERED_LEVEL + self.num_scattering_levels;
        self.sed = (0..num_arrays).map(|_| AtomicArray::empty()).collect();
        self.ifu = (0..num_arrays).map(|_| AtomicArray::empty()).collect();

        if self.record_total_only {
            self.sed[TOTAL] = AtomicArray::new(len_sed);
            self.ifu[TOTAL] = AtomicArray::new(len_ifu);
        } else {
            for i in [TRANSPARENT, PRIMARY_DIRECT, PRIMARY_SCATTERED] {
                self.sed[i] = AtomicArray::new(len_sed);
                self.ifu[i] = AtomicArray::new(len_ifu);
            }
            for i in 0..self.num_scattering_levels {
                self.sed[SCATTERED_LEVEL + i] = AtomicArray::new(len_sed);
                self.ifu[SCATTERED_LEVEL + i] = AtomicArray::new(len_ifu);
            }
            if self.has_medium_emission {
                for i in [SECONDARY_DIRECT, SECONDARY_SCATTERED] {
                    self.sed[i] = AtomicArray::new(len_sed);
                    self.ifu[i] = AtomicArray::new(len_ifu);
                }
            }
        }
        if self.record_polarization {
            for i in [STOKES_Q, STOKES_U, STOKES_V] {
                self.sed[i] = AtomicArray::new(len_sed);
                self.ifu[i] = AtomicArray::new(len_ifu);
            }
        }

        if self.record_statistics {
            self.wsed = (0..NUM_STAT_MOMENTS).map(|_| AtomicArray::new(len_sed)).collect();
            self.wifu = (0..NUM_STAT_MOMENTS).map(|_| AtomicArray::new(len_ifu)).collect();
        }

        let allocated: usize = self
            .sed
            .iter()
            .chain(&self.ifu)
            .chain(&self.wsed)
            .chain(&self.wifu)
            .map(AtomicArray::len)
            .sum();
        info!(
            "Instrument {} allocated {} detector bins",
            self.instrument_name, allocated
        );
    }

    /// Number of allocated SED channels (excluding statistics).
    pub fn num_allocated_sed_channels(&self) -> usize {
        self.sed.iter().filter(|a| !a.is_empty()).count()
    }

    /// Number of allocated IFU channels (excluding statistics).
    pub fn num_allocated_ifu_channels(&self) -> usize {
        self.ifu.iter().filter(|a| !a.is_empty()).count()
    }

    /// Snapshot of an SED channel; empty when the channel is not allocated.
    pub fn sed_values(&self, channel: Channel) -> Vec<f64> {
        self.sed
            .get(channel.index())
            .map(AtomicArray::to_vec)
            .unwrap_or_default()
    }

    /// Snapshot of an IFU channel; empty when the channel is not allocated.
    pub fn ifu_values(&self, channel: Channel) -> Vec<f64> {
        self.ifu
            .get(channel.index())
            .map(AtomicArray::to_vec)
            .unwrap_or_default()
    }

    /// Snapshot of the SED statistics moment array for `w^(k+1)`.
    pub fn sed_moment(&self, k: usize) -> Vec<f64> {
        self.wsed.get(k).map(AtomicArray::to_vec).unwrap_or_default()
    }

    /// Snapshot of the IFU statistics moment array for `w^(k+1)`.
    pub fn ifu_moment(&self, k: usize) -> Vec<f64> {
        self.wifu.get(k).map(AtomicArray::to_vec).unwrap_or_default()
    }

    fn add_sed(&self, index: usize, ell: usize, value: f64) {
        if !self.sed[index].is_empty() {
            self.sed[index].add(ell, value);
        }
    }

    fn add_ifu(&self, index: usize, lell: usize, value: f64) {
        if !self.ifu[index].is_empty() {
            self.ifu[index].add(lell, value);
        }
    }

    /// Records the detection of a photon packet at IFU pixel `l` (negative
    /// when the packet misses the frame) with optical depth `tau` between
    /// its last interaction and the instrument.
    pub fn detect(&self, pp: &PhotonPacket, l: i32, tau: f64) {
        let Some(ell) = self.lambda_grid.bin(pp.lambda()) else {
            return;
        };
        let num_scatt = pp.num_scatt() as usize;
        let luminosity = pp.luminosity();
        let lext = luminosity * (-tau).exp();

        // record in SED arrays
        if self.include_flux_density {
            if self.record_total_only {
                self.add_sed(TOTAL, ell, luminosity);
            } else if pp.has_primary_origin() {
                if num_scatt == 0 {
                    self.add_sed(TRANSPARENT, ell, luminosity);
                    self.add_sed(PRIMARY_DIRECT, ell, lext);
                } else {
                    self.add_sed(PRIMARY_SCATTERED, ell, lext);
                    if num_scatt <= self.num_scattering_levels {
                        self.add_sed(SCATTERED_LEVEL + num_scatt - 1, ell, lext);
                    }
                }
            } else if num_scatt == 0 {
                self.add_sed(SECONDARY_DIRECT, ell, lext);
            } else {
                self.add_sed(SECONDARY_SCATTERED, ell, lext);
            }
            if self.record_polarization {
                self.add_sed(STOKES_Q, ell, lext * pp.stokes_q());
                self.add_sed(STOKES_U, ell, lext * pp.stokes_u());
                self.add_sed(STOKES_V, ell, lext * pp.stokes_v());
            }
        }

        // record in IFU arrays
        if self.include_surface_brightness && l >= 0 {
            let lell = l as usize + ell * self.num_pixels_in_frame;
            if self.record_total_only {
                self.add_ifu(TOTAL, lell, luminosity);
            } else if pp.has_primary_origin() {
                if num_scatt == 0 {
                    self.add_ifu(TRANSPARENT, lell, luminosity);
                    self.add_ifu(PRIMARY_DIRECT, lell, lext);
                } else {
                    self.add_ifu(PRIMARY_SCATTERED, lell, lext);
                    if num_scatt <= self.num_scattering_levels {
                        self.add_ifu(SCATTERED_LEVEL + num_scatt - 1, lell, lext);
                    }
                }
            } else if num_scatt == 0 {
                self.add_ifu(SECONDARY_DIRECT, lell, lext);
            } else {
                self.add_ifu(SECONDARY_SCATTERED, lell, lext);
            }
            if self.record_polarization {
                self.add_ifu(STOKES_Q, lell, lext * pp.stokes_q());
                self.add_ifu(STOKES_U, lell, lext * pp.stokes_u());
                self.add_ifu(STOKES_V, lell, lext * pp.stokes_v());
            }
        }

        // queue statistics per history; fold the previous history first
        if self.record_statistics {
            let slot = self.contribution_lists.local();
            let mut list = slot.lock().unwrap();
            if !list.has_history(pp.history_index()) {
                self.record_contributions(&mut list);
                list.reset(pp.history_index());
            }
            list.add(ell, l, lext);
        }
    }

    /// Folds the dangling contribution lists of all threads into the moment
    /// arrays. Must be called after the photon loop and before calibration.
    /// Calling it again without new detections changes nothing.
    pub fn flush(&self) {
        for slot in self.contribution_lists.all() {
            let mut list = slot.lock().unwrap();
            self.record_contributions(&mut list);
            list.reset(0);
        }
    }

    /// Folds one history's contributions: consecutive weights for the same
    /// bin are summed, and the powers of each per-bin total are added to
    /// the moment arrays.
    fn record_contributions(&self, list: &mut ContributionList) {
        list.sort();
        let contributions = &list.contributions;
        let n = contributions.len();

        // for SEDs, group contributions on wavelength bin
        if self.include_flux_density && !self.wsed.is_empty() {
            let mut w = 0.;
            for i in 0..n {
                w += contributions[i].w;
                if i + 1 == n || contributions[i].ell != contributions[i + 1].ell {
                    let ell = contributions[i].ell;
                    let mut wn = 1.;
                    for k in 0..NUM_STAT_MOMENTS {
                        wn *= w;
                        self.wsed[k].add(ell, wn);
                    }
                    w = 0.;
                }
            }
        }

        // for IFUs, group on wavelength and pixel bins; contributions that
        // missed the frame carry no pixel and are skipped
        if self.include_surface_brightness && !self.wifu.is_empty() {
            let framed: Vec<&Contribution> =
                contributions.iter().filter(|c| c.l >= 0).collect();
            let n = framed.len();
            let mut w = 0.;
            for i in 0..n {
                w += framed[i].w;
                if i + 1 == n
                    || framed[i].ell != framed[i + 1].ell
                    || framed[i].l != framed[i + 1].l
                {
                    let lell = framed[i].l as usize + framed[i].ell * self.num_pixels_in_frame;
                    let mut wn = 1.;
                    for k in 0..NUM_STAT_MOMENTS {
                        wn *= w;
                        self.wifu[k].add(lell, wn);
                    }
                    w = 0.;
                }
            }
        }
    }

    /// Sums the detector arrays across processes, calibrates them on the
    /// root, and writes the output files into `dir`.
    pub fn calibrate_and_write(&self, dir: &Path) -> Result<()> {
        // collect recorded data from all processes
        let mut sed: Vec<Vec<f64>> = self.sed.iter().map(AtomicArray::to_vec).collect();
        let mut ifu: Vec<Vec<f64>> = self.ifu.iter().map(AtomicArray::to_vec).collect();
        let mut wsed: Vec<Vec<f64>> = self.wsed.iter().map(AtomicArray::to_vec).collect();
        let mut wifu: Vec<Vec<f64>> = self.wifu.iter().map(AtomicArray::to_vec).collect();
        for array in sed
            .iter_mut()
            .chain(ifu.iter_mut())
            .chain(wsed.iter_mut())
            .chain(wifu.iter_mut())
        {
            process::sum_to_root(array);
        }

        // calibrate and write only in the root process
        if !process::is_root() {
            return Ok(());
        }

        // front factors converting detected power to flux density and to
        // surface brightness
        let fourpid2 = 4. * std::f64::consts::PI * self.distance * self.distance;
        let omega = 4.
            * (0.5 * self.pixel_size_x / self.distance).atan()
            * (0.5 * self.pixel_size_y / self.distance).atan();
        let c_flux = 1. / fourpid2;
        let c_surface_brightness = c_flux / omega;

        let num_wavelengths = self.lambda_grid.num_bins();
        for ell in 0..num_wavelengths {
            let lambda = self.lambda_grid.lambda(ell);
            let width = self.lambda_grid.bin_width(ell);
            if self.include_flux_density {
                let factor = c_flux * self.units.flux_factor(lambda, width);
                for array in sed.iter_mut().filter(|a| !a.is_empty()) {
                    array[ell] *= factor;
                }
            }
            if self.include_surface_brightness {
                let factor =
                    c_surface_brightness * self.units.surface_brightness_factor(lambda, width);
                let begin = ell * self.num_pixels_in_frame;
                let end = begin + self.num_pixels_in_frame;
                for array in ifu.iter_mut().filter(|a| !a.is_empty()) {
                    for value in &mut array[begin..end] {
                        *value *= factor;
                    }
                }
            }
        }

        if self.include_flux_density {
            self.write_sed(dir, &sed)?;
            if self.record_statistics {
                self.write_sed_statistics(dir, &wsed)?;
            }
        }
        if self.include_surface_brightness {
            self.write_ifu(dir, &ifu)?;
        }
        Ok(())
    }

    /// Sums the component channels into the total, for configurations that
    /// do not record the total directly.
    fn synthesize_total(&self, arrays: &[Vec<f64>]) -> Vec<f64> {
        let mut total = arrays[PRIMARY_DIRECT].clone();
        for (i, v) in arrays[PRIMARY_SCATTERED].iter().enumerate() {
            total[i] += v;
        }
        if self.has_medium_emission {
            for source in [SECONDARY_DIRECT, SECONDARY_SCATTERED] {
                for (i, v) in arrays[source].iter().enumerate() {
                    total[i] += v;
                }
            }
        }
        total
    }

    fn write_sed(&self, dir: &Path, sed: &[Vec<f64>]) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        let mut columns: Vec<Vec<f64>> = Vec::new();

        // the total flux; if it was not recorded directly, calculate it now
        names.push("total flux".into());
        if self.record_total_only {
            columns.push(sed[TOTAL].clone());
        } else {
            columns.push(self.synthesize_total(sed));
        }

        // the flux components; we always add all of them, even if zero
        if self.record_components {
            // without media the transparent flux equals the total flux
            names.push("transparent flux".into());
            columns.push(if self.record_total_only {
                sed[TOTAL].clone()
            } else {
                sed[TRANSPARENT].clone()
            });
            for (name, index) in [
                ("direct primary flux", PRIMARY_DIRECT),
                ("scattered primary flux", PRIMARY_SCATTERED),
                ("direct secondary flux", SECONDARY_DIRECT),
                ("scattered secondary flux", SECONDARY_SCATTERED),
            ] {
                names.push(name.into());
                columns.push(sed[index].clone());
            }
        }

        if self.record_polarization {
            for (name, index) in [
                ("total Stokes Q", STOKES_Q),
                ("total Stokes U", STOKES_U),
                ("total Stokes V", STOKES_V),
            ] {
                names.push(name.into());
                columns.push(sed[index].clone());
            }
        }

        if !self.record_total_only {
            for i in 0..self.num_scattering_levels {
                names.push(format!("{}-times scattered primary flux", i + 1));
                columns.push(sed[SCATTERED_LEVEL + i].clone());
            }
        }

        let path = dir.join(format!("{}_sed.dat", self.instrument_name));
        let mut table = TextTable::create(&path, &format!("SED for {}", self.instrument_name))?;
        table.add_column(&format!("lambda ({})", self.units.wavelength.name()))?;
        for name in &names {
            table.add_column(&format!("{name} ({})", self.units.flux_unit_name()))?;
        }
        for ell in 0..self.lambda_grid.num_bins() {
            let mut row = vec![self.units.wavelength_output(self.lambda_grid.lambda(ell))];
            for column in &columns {
                row.push(column.get(ell).copied().unwrap_or(0.));
            }
            table.write_row(&row)?;
        }
        table.finish()?;
        info!("Wrote {}", path.display());
        Ok(())
    }

    fn write_sed_statistics(&self, dir: &Path, wsed: &[Vec<f64>]) -> Result<()> {
        let path = dir.join(format!("{}_sed_stats.dat", self.instrument_name));
        let mut table = TextTable::create(
            &path,
            &format!("per-history moments for {}", self.instrument_name),
        )?;
        table.add_column(&format!("lambda ({})", self.units.wavelength.name()))?;
        for k in 0..NUM_STAT_MOMENTS {
            table.add_column(&format!("sum of w^{}", k + 1))?;
        }
        for ell in 0..self.lambda_grid.num_bins() {
            let mut row = vec![self.units.wavelength_output(self.lambda_grid.lambda(ell))];
            for moments in wsed {
                row.push(moments.get(ell).copied().unwrap_or(0.));
            }
            table.write_row(&row)?;
        }
        table.finish()?;
        info!("Wrote {}", path.display());
        Ok(())
    }

    fn write_ifu(&self, dir: &Path, ifu: &[Vec<f64>]) -> Result<()> {
        let mut names: Vec<String> = Vec::new();
        let mut cubes: Vec<Vec<f64>> = Vec::new();

        names.push("total".into());
        if self.record_total_only {
            cubes.push(ifu[TOTAL].clone());
        } else {
            cubes.push(self.synthesize_total(ifu));
        }

        if self.record_components {
            // the transparent frame is only meaningful with media present
            if !self.record_total_only {
                names.push("transparent".into());
                cubes.push(ifu[TRANSPARENT].clone());
            }
            for (name, index) in [
                ("primarydirect", PRIMARY_DIRECT),
                ("primaryscattered", PRIMARY_SCATTERED),
                ("secondarydirect", SECONDARY_DIRECT),
                ("secondaryscattered", SECONDARY_SCATTERED),
            ] {
                names.push(name.into());
                cubes.push(ifu[index].clone());
            }
        }

        if self.record_polarization {
            for (name, index) in [
                ("stokesQ", STOKES_Q),
                ("stokesU", STOKES_U),
                ("stokesV", STOKES_V),
            ] {
                names.push(name.into());
                cubes.push(ifu[index].clone());
            }
        }

        if !self.record_total_only {
            for i in 0..self.num_scattering_levels {
                names.push(format!("primaryscatteredlevel{}", i + 1));
                cubes.push(ifu[SCATTERED_LEVEL + i].clone());
            }
        }

        // write one file per channel, ignoring empty ones
        for (name, data) in names.iter().zip(&cubes) {
            if data.is_empty() {
                continue;
            }
            let meta = CubeMeta {
                description: format!("{name} flux"),
                nx: self.num_pixels_x,
                ny: self.num_pixels_y,
                nz: self.lambda_grid.num_bins(),
                pixel_size_x: self.pixel_size_x,
                pixel_size_y: self.pixel_size_y,
                center_x: self.center_x,
                center_y: self.center_y,
                value_unit: self.units.surface_brightness_unit_name().into(),
                length_unit: "m".into(),
            };
            let path = dir.join(format!("{}_{name}.cube", self.instrument_name));
            cube::write_cube(&path, &meta, data)?;
            info!("Wrote {}", path.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::packet::{PacketOrigin, PhotonPacket};
    use crate::{Point, Vector};
    use tempfile::tempdir;

    fn grid() -> WavelengthGrid {
        WavelengthGrid::log(1e-7, 1e-5, 8).unwrap()
    }

    fn packet(history: u64, ell: usize, luminosity: f64, num_scatt: u32) -> PhotonPacket {
        let lambda = grid().lambda(ell);
        let mut pp = PhotonPacket::launch(
            history,
            lambda,
            luminosity,
            Point::origin(),
            Vector::new(0., 0., 1.),
            PacketOrigin::Primary,
        );
        for _ in 0..num_scatt {
            pp.scatter(Vector::new(0., 0., 1.));
        }
        pp
    }

    fn total_only_recorder(record_statistics: bool) -> FluxRecorder {
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(true, false);
        recorder.set_user_flags(false, 0, false, record_statistics);
        recorder.include_flux_density(10.);
        recorder.include_surface_brightness(10., 4, 4, 1., 1., 0., 0.);
        recorder.finalize_configuration();
        recorder
    }

    #[test]
    fn test_allocated_channel_count() {
        // total only
        let recorder = total_only_recorder(false);
        assert_eq!(recorder.num_allocated_sed_channels(), 1);
        assert_eq!(recorder.num_allocated_ifu_channels(), 1);

        // components with two scattering levels, polarization, no emission
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(true, false);
        recorder.set_user_flags(true, 2, true, false);
        recorder.include_flux_density(10.);
        recorder.finalize_configuration();
        // transparent + primary direct/scattered + 3 stokes + 2 levels
        assert_eq!(recorder.num_allocated_sed_channels(), 8);

        // adding medium emission brings the two secondary channels
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(true, true);
        recorder.set_user_flags(true, 2, true, false);
        recorder.include_flux_density(10.);
        recorder.finalize_configuration();
        assert_eq!(recorder.num_allocated_sed_channels(), 10);

        // components requested without a medium collapse to total only
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(false, false);
        recorder.set_user_flags(true, 2, false, false);
        recorder.include_flux_density(10.);
        recorder.finalize_configuration();
        assert_eq!(recorder.num_allocated_sed_channels(), 1);
    }

    #[test]
    fn test_total_only_detection_and_history_statistics() {
        let recorder = total_only_recorder(true);
        let tau = (2.0_f64).ln();

        // two detections on the same history, then one on a new history
        let pp1 = packet(1, 3, 2.0, 0);
        recorder.detect(&pp1, 7, tau);
        recorder.detect(&pp1, 7, tau);
        let pp2 = packet(2, 3, 1.0, 0);
        recorder.detect(&pp2, 7, 0.);
        recorder.flush();

        // the total channel records unattenuated luminosities
        let total = recorder.sed_values(Channel::Total);
        assert!((total[3] - 5.0).abs() < 1e-12);

        // statistics see the attenuated weights summed per history:
        // history 1 contributes w = 1 + 1, history 2 contributes w = 1
        let m1 = recorder.sed_moment(0);
        let m2 = recorder.sed_moment(1);
        assert!((m1[3] - 3.0).abs() < 1e-12, "sum w = {}", m1[3]);
        assert!((m2[3] - 5.0).abs() < 1e-12, "sum w^2 = {}", m2[3]);

        // the same totals appear in the IFU pixel bin
        let ifu1 = recorder.ifu_moment(0);
        let lell = 7 + 3 * 16;
        assert!((ifu1[lell] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let recorder = total_only_recorder(true);
        recorder.detect(&packet(5, 2, 1.5, 0), 0, 0.);
        recorder.flush();
        let before = recorder.sed_moment(0);
        recorder.flush();
        let after = recorder.sed_moment(0);
        assert_eq!(before, after);
    }

    #[test]
    fn test_scattering_level_channels() {
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(true, false);
        recorder.set_user_flags(true, 2, false, false);
        recorder.include_flux_density(10.);
        recorder.finalize_configuration();

        // a twice-scattered primary packet lands in the scattered channel
        // and in the second level, but not the first
        let pp = packet(1, 4, 1.0, 2);
        recorder.detect(&pp, -1, 0.);
        assert!((recorder.sed_values(Channel::PrimaryScattered)[4] - 1.).abs() < 1e-12);
        assert_eq!(recorder.sed_values(Channel::ScatteredLevel(0))[4], 0.);
        assert!((recorder.sed_values(Channel::ScatteredLevel(1))[4] - 1.).abs() < 1e-12);

        // a three-times scattered packet exceeds the levels
        let pp = packet(2, 4, 1.0, 3);
        recorder.detect(&pp, -1, 0.);
        assert_eq!(recorder.sed_values(Channel::ScatteredLevel(0))[4], 0.);
        assert!((recorder.sed_values(Channel::ScatteredLevel(1))[4] - 1.).abs() < 1e-12);
        assert!((recorder.sed_values(Channel::PrimaryScattered)[4] - 2.).abs() < 1e-12);
    }

    #[test]
    fn test_transparent_and_direct_channels() {
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(true, false);
        recorder.set_user_flags(true, 0, false, false);
        recorder.include_flux_density(10.);
        recorder.finalize_configuration();

        let tau = 1.0_f64;
        recorder.detect(&packet(1, 0, 2.0, 0), -1, tau);
        let transparent = recorder.sed_values(Channel::Transparent);
        let direct = recorder.sed_values(Channel::PrimaryDirect);
        assert!((transparent[0] - 2.0).abs() < 1e-12);
        assert!((direct[0] - 2.0 * (-tau).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_secondary_origin_channels() {
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(true, true);
        recorder.set_user_flags(true, 0, false, false);
        recorder.include_flux_density(10.);
        recorder.include_surface_brightness(10., 4, 4, 1., 1., 0., 0.);
        recorder.finalize_configuration();

        let tau = 1.0_f64;
        let lext = 2.0 * (-tau).exp();
        let mut pp = PhotonPacket::launch(
            1,
            grid().lambda(2),
            2.0,
            Point::origin(),
            Vector::new(0., 0., 1.),
            PacketOrigin::Secondary,
        );

        // an unscattered secondary packet lands in the direct channel,
        // attenuated, and touches no primary channel
        recorder.detect(&pp, 3, tau);
        assert!((recorder.sed_values(Channel::SecondaryDirect)[2] - lext).abs() < 1e-12);
        assert_eq!(recorder.sed_values(Channel::SecondaryScattered)[2], 0.);
        assert_eq!(recorder.sed_values(Channel::Transparent)[2], 0.);
        assert_eq!(recorder.sed_values(Channel::PrimaryDirect)[2], 0.);

        // after a scattering it moves to the scattered channel
        pp.scatter(Vector::new(1., 0., 0.));
        recorder.detect(&pp, 3, tau);
        assert!((recorder.sed_values(Channel::SecondaryScattered)[2] - lext).abs() < 1e-12);
        assert!((recorder.sed_values(Channel::SecondaryDirect)[2] - lext).abs() < 1e-12);

        // the IFU pixel bin mirrors both detections
        let lell = 3 + 2 * 16;
        assert!((recorder.ifu_values(Channel::SecondaryDirect)[lell] - lext).abs() < 1e-12);
        assert!((recorder.ifu_values(Channel::SecondaryScattered)[lell] - lext).abs() < 1e-12);
    }

    #[test]
    fn test_missed_frame_updates_sed_but_not_ifu() {
        let recorder = total_only_recorder(false);
        recorder.detect(&packet(1, 2, 1.0, 0), -1, 0.);
        assert!((recorder.sed_values(Channel::Total)[2] - 1.).abs() < 1e-12);
        let ifu = recorder.ifu_values(Channel::Total);
        assert!(ifu.iter().all(|&v| v == 0.));
    }

    #[test]
    fn test_polarization_channels() {
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(true, false);
        recorder.set_user_flags(false, 0, true, false);
        recorder.include_flux_density(10.);
        recorder.finalize_configuration();
        assert_eq!(recorder.num_allocated_sed_channels(), 4);

        let mut pp = packet(1, 5, 2.0, 0);
        pp.set_polarized(0.5, -0.25, 0.125, Vector::new(1., 0., 0.));
        recorder.detect(&pp, -1, 0.);
        assert!((recorder.sed_values(Channel::StokesQ)[5] - 1.0).abs() < 1e-12);
        assert!((recorder.sed_values(Channel::StokesU)[5] + 0.5).abs() < 1e-12);
        assert!((recorder.sed_values(Channel::StokesV)[5] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_out_of_grid_wavelength_is_ignored() {
        let recorder = total_only_recorder(false);
        let pp = PhotonPacket::launch(
            1,
            1e-3, // far beyond the grid
            1.,
            Point::origin(),
            Vector::new(0., 0., 1.),
            PacketOrigin::Primary,
        );
        recorder.detect(&pp, 0, 0.);
        assert!(recorder.sed_values(Channel::Total).iter().all(|&v| v == 0.));
    }

    #[test]
    fn test_component_sum_reproduces_total() {
        let mut recorder = FluxRecorder::new("inst", grid(), Units::neutral());
        recorder.set_simulation_info(true, false);
        recorder.set_user_flags(true, 1, false, false);
        recorder.include_flux_density(10.);
        recorder.finalize_configuration();

        for history in 0..20u64 {
            let n = (history % 3) as u32;
            let pp = packet(history, (history % 8) as usize, 1.0 + history as f64 * 0.1, n);
            recorder.detect(&pp, -1, 0.1 * history as f64);
        }

        let direct = recorder.sed_values(Channel::PrimaryDirect);
        let scattered = recorder.sed_values(Channel::PrimaryScattered);
        let total = recorder.synthesize_total(
            &recorder.sed.iter().map(AtomicArray::to_vec).collect::<Vec<_>>(),
        );
        for ell in 0..8 {
            assert!((total[ell] - direct[ell] - scattered[ell]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_calibration_factors() -> Result<()> {
        // distance 10, pixel size 1x1: omega = 4 atan(0.05)^2, and a bin
        // holding 4*pi*100 calibrates to 1/omega with neutral units
        let recorder = total_only_recorder(false);
        let value = 4. * std::f64::consts::PI * 100.;
        let pp = packet(1, 3, value, 0);
        recorder.detect(&pp, 5, 0.);

        let dir = tempdir()?;
        recorder.calibrate_and_write(dir.path())?;

        let (meta, data) = crate::io::cube::read_cube(&dir.path().join("inst_total.cube"))?;
        assert_eq!(meta.nx, 4);
        let omega = 4. * (0.05_f64).atan() * (0.05_f64).atan();
        let lell = 5 + 3 * 16;
        assert!(
            (data[lell] - 1. / omega).abs() / (1. / omega) < 1e-9,
            "calibrated value {} vs {}",
            data[lell],
            1. / omega
        );

        // the sed file holds the flux-calibrated value in the same bin
        let rows = crate::io::table::read_table(&dir.path().join("inst_sed.dat"))?;
        assert_eq!(rows.len(), 8);
        let expected = value / (4. * std::f64::consts::PI * 100.);
        assert!((rows[3][1] - expected).abs() / expected < 1e-7);
        Ok(())
    }

    #[test]
    fn test_sed_file_round_trip() -> Result<()> {
        let mut recorder = FluxRecorder::new("rt", grid(), Units::neutral());
        recorder.set_simulation_info(true, false);
        recorder.set_user_flags(true, 1, true, true);
        recorder.include_flux_density(1.);
        recorder.finalize_configuration();

        for history in 0..10u64 {
            let pp = packet(history, (history % 8) as usize, 1.0, (history % 2) as u32);
            recorder.detect(&pp, -1, 0.2);
        }
        recorder.flush();

        let dir = tempdir()?;
        recorder.calibrate_and_write(dir.path())?;

        let rows = crate::io::table::read_table(&dir.path().join("rt_sed.dat"))?;
        assert_eq!(rows.len(), 8);
        // lambda, total, transparent, 4 components, 3 stokes, 1 level
        assert_eq!(rows[0].len(), 1 + 1 + 5 + 3 + 1);

        let stats = crate::io::table::read_table(&dir.path().join("rt_sed_stats.dat"))?;
        assert_eq!(stats.len(), 8);
        assert_eq!(stats[0].len(), 1 + NUM_STAT_MOMENTS);
        Ok(())
    }
}
