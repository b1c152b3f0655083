//! Pre-flight validation of a sweep.
//!
//! A sweep can run for days, so everything that can be checked without
//! launching a program is checked before the first point starts:
//!
//! - the sweep has points and their working directories are distinct
//! - required templates and shared assets exist
//! - every placeholder used by a template is one the sweep can fill
//! - grid placeholders only appear where the grid is known (the client script
//!   and server input, which are rendered after the ground-state run)
//!
//! Errors carry a category, a message and a suggestion so `main` can print
//! actionable output.

use crate::config::SweepConfig;
use crate::point::SweepPoint;
use crate::template::{self, Template};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error with user guidance.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Error category for programmatic handling
    pub category: ErrorCategory,
    /// Human-readable error message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
}

/// Categories of validation errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// The sweep has no points
    EmptySweep,
    /// Invalid or contradictory sweep parameters
    InvalidConfiguration,
    /// A template or asset file is missing
    MissingDependencies,
    /// A template uses a placeholder nobody provides
    UnknownPlaceholder,
    /// A placeholder is known but has no value for this template or point
    UnavailablePlaceholder,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n\nSuggestion: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

const GRID_NAMES: [&str; 3] = [template::GRID_N1, template::GRID_N2, template::GRID_N3];

const BUILTIN_NAMES: [&str; 16] = [
    template::LABEL,
    template::DISTANCE,
    template::DISTANCE_BOHR,
    template::FRACTIONAL,
    template::GEOMETRY_FILE,
    template::GRID_N1,
    template::GRID_N2,
    template::GRID_N3,
    template::NPROCS,
    template::OPTIMIZER,
    template::N0,
    template::V_INIT,
    template::V_BRAK_LOW,
    template::V_BRAK_HIGH,
    template::N_TOL,
    template::EPS,
];

/// Which stage renders a template, and therefore whether the grid is known.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Stage {
    GroundState,
    Coupling,
}

/// Validates a sweep and its points before anything runs.
///
/// # Errors
///
/// Returns the first [`ValidationError`] found.
pub fn validate_sweep(config: &SweepConfig, points: &[SweepPoint]) -> ValidationResult<()> {
    validate_points(points)?;
    validate_files(config, points)?;
    validate_placeholders(config, points)?;
    Ok(())
}

fn validate_points(points: &[SweepPoint]) -> ValidationResult<()> {
    if points.is_empty() {
        return Err(ValidationError {
            category: ErrorCategory::EmptySweep,
            message: "the sweep has no points".to_string(),
            suggestion: Some(
                "List distances in a *POINTS section, or set 'discover' to a deck extension present next to the input file"
                    .to_string(),
            ),
        });
    }
    let mut seen = HashSet::new();
    for p in points {
        if !seen.insert(&p.working_dir) {
            return Err(ValidationError {
                category: ErrorCategory::InvalidConfiguration,
                message: format!(
                    "point '{}' maps to working directory {} used by another point",
                    p.label,
                    p.working_dir.display()
                ),
                suggestion: Some("Remove duplicate labels from *POINTS".to_string()),
            });
        }
    }
    Ok(())
}

fn require_file(path: &Path, what: &str) -> ValidationResult<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ValidationError {
            category: ErrorCategory::MissingDependencies,
            message: format!("{} not found: {}", what, path.display()),
            suggestion: Some("Paths are relative to the directory of the input file".to_string()),
        })
    }
}

fn validate_files(config: &SweepConfig, points: &[SweepPoint]) -> ValidationResult<()> {
    let discovered = points.iter().any(|p| p.deck.is_some());
    match &config.input_template {
        Some(path) => require_file(path, "input template")?,
        None if !discovered => {
            return Err(ValidationError {
                category: ErrorCategory::InvalidConfiguration,
                message: "no ground-state input: 'input_template' is not set".to_string(),
                suggestion: Some(
                    "Set 'input_template', or use 'discover' to run existing decks".to_string(),
                ),
            })
        }
        None => {}
    }
    match &config.client_template {
        Some(path) => require_file(path, "client template")?,
        None => {
            return Err(ValidationError {
                category: ErrorCategory::InvalidConfiguration,
                message: "'client_template' is not set".to_string(),
                suggestion: Some(
                    "Point 'client_template' to the coupling script template (see 'cdftsweep ci')"
                        .to_string(),
                ),
            })
        }
    }
    if let Some(path) = &config.geometry_template {
        require_file(path, "geometry template")?;
    }
    if let Some(path) = &config.server_template {
        require_file(path, "server template")?;
    }
    for asset in &config.shared_assets {
        require_file(asset, "shared asset")?;
    }
    Ok(())
}

fn load(path: &Path) -> ValidationResult<Template> {
    Template::from_file(path).map_err(|e| ValidationError {
        category: ErrorCategory::MissingDependencies,
        message: e.to_string(),
        suggestion: None,
    })
}

fn check_template(
    template: &Template,
    stage: Stage,
    config: &SweepConfig,
    points: &[SweepPoint],
) -> ValidationResult<()> {
    let known: BTreeSet<&str> = BUILTIN_NAMES
        .iter()
        .copied()
        .chain(config.variables.keys().map(String::as_str))
        .collect();

    for name in template.placeholders() {
        if !known.contains(name) {
            return Err(ValidationError {
                category: ErrorCategory::UnknownPlaceholder,
                message: format!(
                    "template '{}' uses unknown placeholder {{{{{}}}}}",
                    template.name(),
                    name
                ),
                suggestion: Some(format!(
                    "Define it in the *VARS section, or use one of: {}",
                    BUILTIN_NAMES.join(", ")
                )),
            });
        }
        if config.variables.contains_key(name) && !BUILTIN_NAMES.contains(&name) {
            continue;
        }

        let unavailable = |why: String, fix: &str| ValidationError {
            category: ErrorCategory::UnavailablePlaceholder,
            message: format!(
                "template '{}' uses {{{{{}}}}} but {}",
                template.name(),
                name,
                why
            ),
            suggestion: Some(fix.to_string()),
        };

        if GRID_NAMES.contains(&name) && stage == Stage::GroundState {
            return Err(unavailable(
                "the grid is only known after the ground-state run".to_string(),
                "Use grid placeholders only in the client script or server input",
            ));
        }
        match name {
            template::DISTANCE | template::DISTANCE_BOHR => {
                if let Some(p) = points.iter().find(|p| p.distance.is_none()) {
                    return Err(unavailable(
                        format!("point '{}' is not a number", p.label),
                        "Use numeric labels (distances in angstrom) or {{LABEL}}",
                    ));
                }
            }
            template::FRACTIONAL => {
                if config.cell_length.is_none() {
                    return Err(unavailable(
                        "'cell_length' is not set".to_string(),
                        "Set 'cell_length' to the cell length along the displacement axis in bohr",
                    ));
                }
                if let Some(p) = points.iter().find(|p| p.distance.is_none()) {
                    return Err(unavailable(
                        format!("point '{}' is not a number", p.label),
                        "Use numeric labels (distances in angstrom)",
                    ));
                }
            }
            template::N0 => {
                if config.constraint.n0.is_none() {
                    return Err(unavailable(
                        "'n0' is not set".to_string(),
                        "Set 'n0' to the target electron number difference",
                    ));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_placeholders(config: &SweepConfig, points: &[SweepPoint]) -> ValidationResult<()> {
    if let Some(path) = &config.geometry_template {
        check_template(&load(path)?, Stage::GroundState, config, points)?;
    }
    if points.iter().all(|p| p.deck.is_none()) {
        if let Some(path) = &config.input_template {
            check_template(&load(path)?, Stage::GroundState, config, points)?;
        }
    }
    for point in points {
        if let Some(deck) = &point.deck {
            check_template(&load(deck)?, Stage::GroundState, config, std::slice::from_ref(point))?;
        }
    }
    if let Some(path) = &config.client_template {
        let client = load(path)?;
        check_template(&client, Stage::Coupling, config, points)?;
        if !GRID_NAMES.iter().all(|n| client.uses(n)) {
            log::warn!(
                "client template '{}' does not use all of GRID_N1, GRID_N2, GRID_N3",
                client.name()
            );
        }
    }
    if let Some(path) = &config.server_template {
        check_template(&load(path)?, Stage::Coupling, config, points)?;
    }
    Ok(())
}

/// Logs a short description of the sweep about to run.
pub fn provide_user_guidance(config: &SweepConfig, points: &[SweepPoint], nprocs: usize) {
    log::info!(
        "Sweep of {} point(s) with {} workers per run",
        points.len(),
        nprocs
    );
    if points.iter().any(|p| p.working_dir.exists()) {
        log::info!("Existing point directories are reused; previous artifacts will be overwritten");
    }
    if config.constraint.n0.is_none() {
        log::debug!("n0 is not set; the client script must define the constraint target itself");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PointSource;
    use std::fs;
    use tempfile::TempDir;

    fn setup(input: &str, client: &str) -> (TempDir, SweepConfig) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("gs.in.tmpl"), input).unwrap();
        fs::write(dir.path().join("cdft.py.tmpl"), client).unwrap();
        let config = SweepConfig {
            base_dir: dir.path().to_path_buf(),
            work_root: dir.path().to_path_buf(),
            source: PointSource::Labels(vec!["3.5".into()]),
            input_template: Some(dir.path().join("gs.in.tmpl")),
            client_template: Some(dir.path().join("cdft.py.tmpl")),
            geometry_file: "geometry.xyz".into(),
            ..SweepConfig::default()
        };
        (dir, config)
    }

    fn points(config: &SweepConfig, labels: &[&str]) -> Vec<SweepPoint> {
        labels
            .iter()
            .map(|l| SweepPoint::new(l, &config.work_root, config.cell_length))
            .collect()
    }

    #[test]
    fn test_valid_sweep() {
        let (_dir, config) = setup(
            "load {{GEOMETRY_FILE}}\nset d {{DISTANCE_BOHR}}\n",
            "grid = ({{GRID_N1}}, {{GRID_N2}}, {{GRID_N3}})\n",
        );
        assert!(validate_sweep(&config, &points(&config, &["3.5", "4.0"])).is_ok());
    }

    #[test]
    fn test_empty_and_duplicate_points() {
        let (_dir, config) = setup("", "");
        let err = validate_sweep(&config, &[]).unwrap_err();
        assert_eq!(err.category, ErrorCategory::EmptySweep);
        let err = validate_sweep(&config, &points(&config, &["3.5", "3.5"])).unwrap_err();
        assert_eq!(err.category, ErrorCategory::InvalidConfiguration);
    }

    #[test]
    fn test_missing_template_file() {
        let (dir, mut config) = setup("", "");
        config.shared_assets = vec![dir.path().join("C.xml")];
        let err = validate_sweep(&config, &points(&config, &["3.5"])).unwrap_err();
        assert_eq!(err.category, ErrorCategory::MissingDependencies);
        assert!(err.message.contains("C.xml"));
    }

    #[test]
    fn test_unknown_and_user_placeholders() {
        let (_dir, mut config) = setup("ecut {{ECUT}}\n", "");
        let err = validate_sweep(&config, &points(&config, &["3.5"])).unwrap_err();
        assert_eq!(err.category, ErrorCategory::UnknownPlaceholder);
        config.variables.insert("ECUT".into(), "60".into());
        assert!(validate_sweep(&config, &points(&config, &["3.5"])).is_ok());
    }

    #[test]
    fn test_grid_in_ground_state_deck() {
        let (_dir, config) = setup("set grid {{GRID_N1}}\n", "");
        let err = validate_sweep(&config, &points(&config, &["3.5"])).unwrap_err();
        assert_eq!(err.category, ErrorCategory::UnavailablePlaceholder);
    }

    #[test]
    fn test_conditional_placeholders() {
        let (_dir, config) = setup("{{DISTANCE}}\n", "");
        let err = validate_sweep(&config, &points(&config, &["anti"])).unwrap_err();
        assert_eq!(err.category, ErrorCategory::UnavailablePlaceholder);

        let (_dir, mut config) = setup("{{FRACTIONAL}}\n", "n0 = {{N0}}\n");
        let err = validate_sweep(&config, &points(&config, &["3.5"])).unwrap_err();
        assert!(err.message.contains("cell_length"));
        config.cell_length = Some(40.0);
        let err = validate_sweep(&config, &points(&config, &["3.5"])).unwrap_err();
        assert!(err.message.contains("n0"));
        config.constraint.n0 = Some(1.0);
        assert!(validate_sweep(&config, &points(&config, &["3.5"])).is_ok());
    }
}
