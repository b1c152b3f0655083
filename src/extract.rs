//! Metadata scraping from solver and client output.
//!
//! The ground-state output reports the FFT grid used for the wavefunctions on
//! a single line such as
//!
//! ```text
//!   <np0v> 40 </np0v> <np1v> 40 </np1v> <np2v> 60 </np2v>
//! ```
//!
//! [`extract_grid`] finds the last line containing the marker and reads the
//! three axis values from the 8th-, 5th- and 2nd-from-last whitespace fields.
//! [`parse_coupling`] reads the electronic coupling printed by the client.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

lazy_static! {
    static ref HAB_RE: Regex =
        Regex::new(r"\|Hab\|\s*\((H|mH|eV)\)\s*:\s*([-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?)")
            .unwrap();
}

/// Errors raised while scraping output files.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// The file to scan does not exist
    #[error("output file not found: {}", .0.display())]
    MissingArtifact(PathBuf),
    /// No line contains the marker
    #[error("marker '{marker}' not found in {}", .path.display())]
    MarkerNotFound {
        /// Marker searched for
        marker: String,
        /// File scanned
        path: PathBuf,
    },
    /// The last marker line does not carry three positive integers
    #[error("malformed marker line {line_number} in {}: '{line}'", .path.display())]
    MalformedMarkerLine {
        /// File scanned
        path: PathBuf,
        /// 1-based line number
        line_number: usize,
        /// Offending line, trimmed
        line: String,
    },
    /// I/O error while reading
    #[error("IO error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
}

/// FFT grid dimensions of a ground-state run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridMetadata {
    /// First axis
    pub n1: u32,
    /// Second axis
    pub n2: u32,
    /// Third axis
    pub n3: u32,
}

impl fmt::Display for GridMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.n1, self.n2, self.n3)
    }
}

/// Solver output may carry bytes that are not UTF-8 (host names, banners);
/// they are replaced rather than rejected.
fn read(path: &Path) -> Result<String, ExtractError> {
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ExtractError::MissingArtifact(path.to_path_buf())
        } else {
            ExtractError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_grid_line(line: &str) -> Option<GridMetadata> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let n = fields.len();
    if n < 8 {
        return None;
    }
    let axis = |from_end: usize| -> Option<u32> {
        fields[n - from_end].parse::<u32>().ok().filter(|v| *v > 0)
    };
    Some(GridMetadata {
        n1: axis(8)?,
        n2: axis(5)?,
        n3: axis(2)?,
    })
}

/// Extracts the grid dimensions from the last line of `path` containing `marker`.
///
/// # Errors
///
/// - [`ExtractError::MissingArtifact`] if the file does not exist.
/// - [`ExtractError::MarkerNotFound`] if no line contains `marker`.
/// - [`ExtractError::MalformedMarkerLine`] if that last line has fewer than
///   eight fields or a non-positive or non-integer axis value.
pub fn extract_grid(path: &Path, marker: &str) -> Result<GridMetadata, ExtractError> {
    let text = read(path)?;
    let (index, line) = text
        .lines()
        .enumerate()
        .filter(|(_, line)| line.contains(marker))
        .last()
        .ok_or_else(|| ExtractError::MarkerNotFound {
            marker: marker.to_string(),
            path: path.to_path_buf(),
        })?;

    parse_grid_line(line).ok_or_else(|| ExtractError::MalformedMarkerLine {
        path: path.to_path_buf(),
        line_number: index + 1,
        line: line.trim().to_string(),
    })
}

/// Electronic coupling reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coupling {
    /// |Hab| in hartree
    pub hartree: f64,
    /// |Hab| in millihartree, when printed
    pub millihartree: Option<f64>,
    /// |Hab| in electronvolt, when printed
    pub ev: Option<f64>,
}

/// Parses the `|Hab| (H): ...` lines of a coupling result file.
///
/// Returns `Ok(None)` when no hartree value is present; the last occurrence
/// of each unit wins.
pub fn parse_coupling(path: &Path) -> Result<Option<Coupling>, ExtractError> {
    let text = read(path)?;
    let mut hartree = None;
    let mut millihartree = None;
    let mut ev = None;
    for caps in HAB_RE.captures_iter(&text) {
        let Ok(value) = caps[2].parse::<f64>() else {
            continue;
        };
        match &caps[1] {
            "H" => hartree = Some(value),
            "mH" => millihartree = Some(value),
            _ => ev = Some(value),
        }
    }
    Ok(hartree.map(|hartree| Coupling {
        hartree,
        millihartree,
        ev,
    }))
}
