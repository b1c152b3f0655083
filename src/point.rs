//! Sweep points and their substitution values.

use crate::config::{PointSource, SweepConfig, ANGSTROM_TO_BOHR};
use crate::naming::label_dir_name;
use crate::template;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One sweep point with its own working directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPoint {
    /// Label as given in the input (or the deck's file stem)
    pub label: String,
    /// Working directory, `work_root/<label>`
    pub working_dir: PathBuf,
    /// Distance in angstrom when the label is numeric
    pub distance: Option<f64>,
    /// Distance in bohr
    pub distance_bohr: Option<f64>,
    /// Distance as a fraction of the cell length
    pub fractional: Option<f64>,
    /// Discovered deck used instead of the input template
    pub deck: Option<PathBuf>,
}

impl SweepPoint {
    /// Creates a point for `label` below `work_root`.
    pub fn new(label: &str, work_root: &Path, cell_length: Option<f64>) -> Self {
        let distance = label.trim().parse::<f64>().ok().filter(|d| d.is_finite());
        let distance_bohr = distance.map(|d| d * ANGSTROM_TO_BOHR);
        let fractional = match (distance_bohr, cell_length) {
            (Some(b), Some(l)) if l > 0.0 => Some(b / l),
            _ => None,
        };
        Self {
            label: label.trim().to_string(),
            working_dir: work_root.join(label_dir_name(label)),
            distance,
            distance_bohr,
            fractional,
            deck: None,
        }
    }
}

/// Lists the points of a sweep.
///
/// Explicit labels keep their input order. Discovered decks are sorted by
/// file name; files used as templates or assets by the sweep are skipped.
pub fn build_points(config: &SweepConfig) -> io::Result<Vec<SweepPoint>> {
    match &config.source {
        PointSource::Labels(labels) => Ok(labels
            .iter()
            .map(|l| SweepPoint::new(l, &config.work_root, config.cell_length))
            .collect()),
        PointSource::Discover { extension } => {
            let excluded: Vec<PathBuf> = [
                config.geometry_template.as_ref(),
                config.input_template.as_ref(),
                config.client_template.as_ref(),
                config.server_template.as_ref(),
            ]
            .into_iter()
            .flatten()
            .chain(config.shared_assets.iter())
            .filter_map(|p| fs::canonicalize(p).ok())
            .collect();

            let mut decks: Vec<PathBuf> = fs::read_dir(&config.base_dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(extension.as_str()))
                .filter(|p| {
                    fs::canonicalize(p)
                        .map(|c| !excluded.contains(&c))
                        .unwrap_or(true)
                })
                .collect();
            decks.sort();

            Ok(decks
                .into_iter()
                .filter_map(|deck| {
                    let stem = deck.file_stem()?.to_str()?.to_string();
                    let mut point = SweepPoint::new(&stem, &config.work_root, config.cell_length);
                    point.deck = Some(deck);
                    Some(point)
                })
                .collect())
        }
    }
}

fn number(value: f64) -> String {
    format!("{:.8}", value)
}

/// Substitution values known before the ground-state run.
///
/// User variables come first so that built-in names always win.
pub fn substitutions(point: &SweepPoint, config: &SweepConfig, nprocs: usize) -> HashMap<String, String> {
    let mut values: HashMap<String, String> = config
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    values.insert(template::LABEL.into(), point.label.clone());
    if point.distance.is_some() {
        values.insert(template::DISTANCE.into(), point.label.clone());
    }
    if let Some(b) = point.distance_bohr {
        values.insert(template::DISTANCE_BOHR.into(), number(b));
    }
    if let Some(f) = point.fractional {
        values.insert(template::FRACTIONAL.into(), number(f));
    }
    values.insert(template::GEOMETRY_FILE.into(), config.geometry_file.clone());
    values.insert(template::NPROCS.into(), nprocs.to_string());

    let c = &config.constraint;
    values.insert(template::OPTIMIZER.into(), c.optimizer.clone());
    if let Some(n0) = c.n0 {
        values.insert(template::N0.into(), n0.to_string());
    }
    values.insert(template::V_INIT.into(), c.v_init.to_string());
    values.insert(template::V_BRAK_LOW.into(), c.v_brak.0.to_string());
    values.insert(template::V_BRAK_HIGH.into(), c.v_brak.1.to_string());
    values.insert(template::N_TOL.into(), format!("{:e}", c.n_tol));
    values.insert(template::EPS.into(), format!("{:e}", c.eps));
    values
}
