//! Sweep description parsed from a cdftsweep input file.
//!
//! This module defines the configuration structures of a single sweep:
//!
//! - [`SweepConfig`]: templates, assets, worker count, policy and constraint parameters
//! - [`PointSource`]: where the sweep points come from
//! - [`FailurePolicy`]: what happens to the remaining points after a failure
//! - [`ConstraintParams`]: constrained-DFT parameters rendered into the client script
//!
//! See [`parser`](crate::parser) for the input file format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Unit conversion constant: Angstrom to Bohr
pub const ANGSTROM_TO_BOHR: f64 = 1.8897259886;

/// Reaction of the sweep driver to a failed point.
///
/// Failures are listed in the final summary and turn the exit status
/// non-zero under either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the sweep at the first failed point
    #[default]
    FailFast,
    /// Attempt every point and report failures at the end
    Continue,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "fail_fast" | "failfast" | "stop" => Ok(FailurePolicy::FailFast),
            "continue" | "keep_going" => Ok(FailurePolicy::Continue),
            other => Err(format!(
                "unknown failure policy '{}' (expected fail_fast or continue)",
                other
            )),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail_fast"),
            FailurePolicy::Continue => write!(f, "continue"),
        }
    }
}

/// Where the sweep points come from.
#[derive(Debug, Clone, PartialEq)]
pub enum PointSource {
    /// Explicit labels from the `*POINTS` section, usually distances in angstrom
    Labels(Vec<String>),
    /// Every `<stem>.<extension>` deck in the input file's directory
    Discover {
        /// Deck file extension without the dot (e.g. "in")
        extension: String,
    },
}

impl Default for PointSource {
    fn default() -> Self {
        PointSource::Labels(Vec::new())
    }
}

/// Constrained-DFT parameters handed to the coupling client.
///
/// Defaults follow the charge-transfer constraint of the client library:
/// initial potential 0, bracket (-1, 1), electron tolerance 1e-3 and density
/// cutoff 1e-6. `n0` has no sensible default and stays unset unless given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintParams {
    /// Optimizer used by the client to solve for the constraint potential
    pub optimizer: String,
    /// Target electron number difference
    pub n0: Option<f64>,
    /// Initial constraint potential
    pub v_init: f64,
    /// Bracket for the constraint potential (low, high)
    pub v_brak: (f64, f64),
    /// Convergence tolerance on the electron number
    pub n_tol: f64,
    /// Density cutoff below which the weight function is zeroed
    pub eps: f64,
}

impl Default for ConstraintParams {
    fn default() -> Self {
        Self {
            optimizer: "secant".to_string(),
            n0: None,
            v_init: 0.0,
            v_brak: (-1.0, 1.0),
            n_tol: 1.0e-3,
            eps: 1.0e-6,
        }
    }
}

/// Complete description of one sweep.
///
/// Paths are absolute or relative to the process working directory; the
/// parser resolves them against the input file's directory.
#[derive(Debug, Clone, Default)]
pub struct SweepConfig {
    /// Directory containing the input file; decks are discovered here
    pub base_dir: PathBuf,
    /// Sweep points
    pub source: PointSource,
    /// Directory under which one working directory per point is created
    pub work_root: PathBuf,
    /// Template for the geometry file (optional)
    pub geometry_template: Option<PathBuf>,
    /// Name of the rendered geometry file inside each point directory
    pub geometry_file: String,
    /// Template for the ground-state input deck (required unless decks are discovered)
    pub input_template: Option<PathBuf>,
    /// Template for the coupling client script
    pub client_template: Option<PathBuf>,
    /// Template for the server input file (optional, empty file otherwise)
    pub server_template: Option<PathBuf>,
    /// Rendered client script name inside each point directory
    pub client_script: String,
    /// Files copied verbatim into every point directory (pseudopotentials etc.)
    pub shared_assets: Vec<PathBuf>,
    /// Worker count; settings default when unset
    pub nprocs: Option<usize>,
    /// Failure policy; settings default when unset
    pub policy: Option<FailurePolicy>,
    /// Cell length along the displacement axis, bohr. Enables `FRACTIONAL`.
    pub cell_length: Option<f64>,
    /// Constraint parameters for the client script
    pub constraint: ConstraintParams,
    /// User placeholders from the `*VARS` section
    pub variables: BTreeMap<String, String>,
}
