//! Column-oriented plain text tables.
//!
//! The format is one `#` header line per column followed by whitespace
//! separated rows in scientific notation with 8 significant digits.

use anyhow::{ensure, Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Writes a text table column by column, then row by row.
pub struct TextTable {
    writer: BufWriter<File>,
    num_columns: usize,
    rows_started: bool,
}

impl TextTable {
    /// Creates the output file and writes a description line.
    pub fn create(path: &Path, description: &str) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "# {description}")?;
        Ok(Self {
            writer,
            num_columns: 0,
            rows_started: false,
        })
    }

    /// Declares the next column; must be called before any rows are
    /// written.
    pub fn add_column(&mut self, title: &str) -> Result<()> {
        ensure!(
            !self.rows_started,
            "columns must be declared before the first row"
        );
        self.num_columns += 1;
        writeln!(self.writer, "# column {}: {title}", self.num_columns)?;
        Ok(())
    }

    /// Writes one data row; the value count must match the column count.
    pub fn write_row(&mut self, values: &[f64]) -> Result<()> {
        ensure!(
            values.len() == self.num_columns,
            "row has {} values for {} columns",
            values.len(),
            self.num_columns
        );
        self.rows_started = true;
        let mut line = String::with_capacity(values.len() * 16);
        for (i, v) in values.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            line.push_str(&format!("{v:.7e}"));
        }
        writeln!(self.writer, "{line}")?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Reads all data rows of a table written by [`TextTable`], skipping
/// comment lines.
pub fn read_table(path: &Path) -> Result<Vec<Vec<f64>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open file: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let row = trimmed
            .split_whitespace()
            .map(|tok| {
                tok.parse::<f64>()
                    .with_context(|| format!("Invalid number '{tok}' in {}", path.display()))
            })
            .collect::<Result<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok(rows)
}
