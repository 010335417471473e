//! Image cube files for IFU output.
//!
//! A cube file holds a 3-D (x, y, wavelength) data block for one detector
//! channel: a magic tag, a JSON metadata header, and the raw values as
//! little-endian doubles in `pixel + wavelength * (nx * ny)` layout.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"p3dcube1";

/// Metadata stored in the cube header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CubeMeta {
    pub description: String,
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub pixel_size_x: f64,
    pub pixel_size_y: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub value_unit: String,
    pub length_unit: String,
}

/// Writes a cube file; the data length must equal `nx * ny * nz`.
pub fn write_cube(path: &Path, meta: &CubeMeta, data: &[f64]) -> Result<()> {
    if data.len() != meta.nx * meta.ny * meta.nz {
        bail!(
            "cube data has {} values for shape {}x{}x{}",
            data.len(),
            meta.nx,
            meta.ny,
            meta.nz
        );
    }

    let file = File::create(path)
        .with_context(|| format!("Failed to create file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);

    let header = serde_json::to_vec(meta).context("Failed to serialize cube metadata")?;
    writer.write_all(MAGIC)?;
    writer.write_all(&(header.len() as u64).to_le_bytes())?;
    writer.write_all(&header)?;
    for v in data {
        writer.write_all(&v.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads a cube file written by [`write_cube`].
pub fn read_cube(path: &Path) -> Result<(CubeMeta, Vec<f64>)> {
    let file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        bail!("{} is not a cube file", path.display());
    }

    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let header_len = u64::from_le_bytes(len_bytes) as usize;
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let meta: CubeMeta =
        serde_json::from_slice(&header).context("Failed to parse cube metadata")?;

    let num_values = meta.nx * meta.ny * meta.nz;
    let mut data = Vec::with_capacity(num_values);
    let mut buf = [0u8; 8];
    for _ in 0..num_values {
        reader.read_exact(&mut buf)?;
        data.push(f64::from_le_bytes(buf));
    }
    Ok((meta, data))
}
