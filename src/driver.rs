//! Parameter sweep driver.
//!
//! The driver walks the sweep points in order and pushes each one through the
//! two-stage pipeline:
//!
//! 1. **Prepare**: create (or reuse) the point directory and copy shared assets
//! 2. **Stage 1**: render geometry and deck, run the ground-state calculation
//! 3. **Extract**: read the FFT grid from the ground-state output
//! 4. **Stage 2**: run the server/client coupling calculation
//!
//! The stages are reached through the [`PointPipeline`] trait. [`ProcessPipeline`]
//! is the implementation that launches real programs; tests substitute their
//! own.
//!
//! # Failure Policy
//!
//! Under [`FailurePolicy::FailFast`] the first failing point stops the sweep
//! and every later point is reported as `not_run`. Under
//! [`FailurePolicy::Continue`] every point is attempted. In both cases the
//! returned [`SweepReport`] lists one outcome per point.

use crate::config::{FailurePolicy, SweepConfig};
use crate::coupling::{run_coupling, CouplingRequest};
use crate::extract::{extract_grid, parse_coupling, Coupling, ExtractError, GridMetadata};
use crate::ground_state::run_ground_state;
use crate::naming::PointLayout;
use crate::point::{substitutions, SweepPoint};
use crate::process::{ReadinessProbe, RunError, RunResult, SolverCommand};
use crate::settings::Settings;
use crate::template::{self, Template, TemplateError};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error raised by one stage of a point.
#[derive(Error, Debug)]
pub enum StageError {
    /// External program failure
    #[error(transparent)]
    Run(#[from] RunError),
    /// Output scraping failure
    #[error(transparent)]
    Extract(#[from] ExtractError),
    /// Rendering failure
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// Working directory preparation failure
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// The sweep description is incomplete for this point
    #[error("configuration error: {0}")]
    Config(String),
}

/// Final status of one point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointStatus {
    /// Both stages completed
    Ok,
    /// Preparation or the ground-state run failed
    Stage1Failed,
    /// The grid could not be read from the ground-state output
    ExtractionFailed,
    /// The coupling calculation failed
    Stage2Failed,
    /// Skipped after an earlier failure
    NotRun,
}

impl PointStatus {
    /// Short name used in the summary table and JSON
    pub fn as_str(&self) -> &'static str {
        match self {
            PointStatus::Ok => "ok",
            PointStatus::Stage1Failed => "stage1_failed",
            PointStatus::ExtractionFailed => "extraction_failed",
            PointStatus::Stage2Failed => "stage2_failed",
            PointStatus::NotRun => "not_run",
        }
    }

    /// True for the three failure states
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PointStatus::Stage1Failed | PointStatus::ExtractionFailed | PointStatus::Stage2Failed
        )
    }
}

/// Outcome of one point.
#[derive(Debug, Clone, Serialize)]
pub struct PointOutcome {
    /// Point label
    pub label: String,
    /// Point working directory
    pub working_dir: PathBuf,
    /// Final status
    pub status: PointStatus,
    /// Grid, once extracted
    pub grid: Option<GridMetadata>,
    /// Coupling read from the client output, if any
    pub coupling: Option<Coupling>,
    /// Error message of the failing stage
    pub error: Option<String>,
    /// Wall time spent on the point in seconds
    pub seconds: f64,
}

impl PointOutcome {
    fn new(point: &SweepPoint, status: PointStatus) -> Self {
        Self {
            label: point.label.clone(),
            working_dir: point.working_dir.clone(),
            status,
            grid: None,
            coupling: None,
            error: None,
            seconds: 0.0,
        }
    }
}

/// Result of a whole sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    /// Policy the sweep ran under
    pub policy: FailurePolicy,
    /// One outcome per point, in sweep order
    pub points: Vec<PointOutcome>,
}

impl SweepReport {
    /// Number of failed points
    pub fn failures(&self) -> usize {
        self.points.iter().filter(|p| p.status.is_failure()).count()
    }

    /// True when every point finished with `ok`
    pub fn is_success(&self) -> bool {
        self.points.iter().all(|p| p.status == PointStatus::Ok)
    }

    /// Writes the report as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<(), StageError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StageError::Config(format!("cannot serialise summary: {}", e)))?;
        template::write_artifact(path, &json)?;
        Ok(())
    }

    /// Prints the summary table to stdout.
    pub fn print_summary(&self) {
        println!();
        println!(" Point            Status              Grid            |Hab| (mH)      Time (s)");
        println!("--------------------------------------------------------------------------------");
        for p in &self.points {
            let grid = p.grid.map(|g| g.to_string()).unwrap_or_else(|| "-".into());
            let hab = p
                .coupling
                .map(|c| format!("{:.6}", c.millihartree.unwrap_or(c.hartree * 1000.0)))
                .unwrap_or_else(|| "-".into());
            println!(
                " {:<16} {:<19} {:<15} {:<15} {:>9.1}",
                p.label,
                p.status.as_str(),
                grid,
                hab,
                p.seconds
            );
        }
        println!("--------------------------------------------------------------------------------");
        for p in self.points.iter().filter(|p| p.status.is_failure()) {
            if let Some(err) = &p.error {
                println!(" {}: {}", p.label, err);
            }
        }
        println!(
            " {} point(s), {} ok, {} failed",
            self.points.len(),
            self.points.iter().filter(|p| p.status == PointStatus::Ok).count(),
            self.failures()
        );
    }
}

/// The stages of one point.
pub trait PointPipeline {
    /// Creates the working directory and copies shared assets into it
    fn prepare(&mut self, point: &SweepPoint) -> Result<(), StageError>;

    /// Renders the inputs and runs the ground-state calculation
    fn ground_state(&mut self, point: &SweepPoint) -> Result<RunResult, StageError>;

    /// Reads the grid from the ground-state output
    fn extract(&mut self, point: &SweepPoint) -> Result<GridMetadata, StageError>;

    /// Runs the coupling calculation; returns the parsed coupling if printed
    fn coupling(
        &mut self,
        point: &SweepPoint,
        grid: GridMetadata,
    ) -> Result<Option<Coupling>, StageError>;
}

fn run_point<P: PointPipeline + ?Sized>(pipeline: &mut P, point: &SweepPoint) -> PointOutcome {
    let mut outcome = PointOutcome::new(point, PointStatus::Ok);

    let stage1 = pipeline.prepare(point).and_then(|_| {
        let run = pipeline.ground_state(point)?;
        if !run.output.exists() {
            return Err(StageError::Run(RunError::MissingArtifact(run.output)));
        }
        Ok(run)
    });
    if let Err(e) = stage1 {
        log::error!("[{}] ground-state stage failed: {}", point.label, e);
        outcome.status = PointStatus::Stage1Failed;
        outcome.error = Some(e.to_string());
        return outcome;
    }

    let grid = match pipeline.extract(point) {
        Ok(grid) => grid,
        Err(e) => {
            log::error!("[{}] grid extraction failed: {}", point.label, e);
            outcome.status = PointStatus::ExtractionFailed;
            outcome.error = Some(e.to_string());
            return outcome;
        }
    };
    log::info!("[{}] grid {}", point.label, grid);
    outcome.grid = Some(grid);

    match pipeline.coupling(point, grid) {
        Ok(coupling) => outcome.coupling = coupling,
        Err(e) => {
            log::error!("[{}] coupling stage failed: {}", point.label, e);
            outcome.status = PointStatus::Stage2Failed;
            outcome.error = Some(e.to_string());
        }
    }
    outcome
}

/// Runs every point through `pipeline` according to `policy`.
pub fn run_sweep<P: PointPipeline + ?Sized>(
    points: &[SweepPoint],
    pipeline: &mut P,
    policy: FailurePolicy,
) -> SweepReport {
    let mut outcomes = Vec::with_capacity(points.len());
    let mut halted = false;

    for (i, point) in points.iter().enumerate() {
        if halted {
            outcomes.push(PointOutcome::new(point, PointStatus::NotRun));
            continue;
        }
        log::info!("Point {}/{}: {}", i + 1, points.len(), point.label);
        let start = Instant::now();
        let mut outcome = run_point(pipeline, point);
        outcome.seconds = start.elapsed().as_secs_f64();
        if outcome.status.is_failure() && policy == FailurePolicy::FailFast {
            log::warn!("stopping sweep after failure of point {}", point.label);
            halted = true;
        }
        outcomes.push(outcome);
    }

    SweepReport {
        policy,
        points: outcomes,
    }
}

/// Creates `dir` if needed and copies every asset into it.
///
/// Existing directories are reused; assets already present are overwritten.
pub fn prepare_working_dir(dir: &Path, assets: &[PathBuf]) -> Result<(), StageError> {
    fs::create_dir_all(dir).map_err(|source| StageError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for asset in assets {
        let name = asset
            .file_name()
            .ok_or_else(|| StageError::Config(format!("invalid asset path {}", asset.display())))?;
        fs::copy(asset, dir.join(name)).map_err(|source| StageError::Io {
            path: asset.clone(),
            source,
        })?;
    }
    Ok(())
}

/// Pipeline that runs the real solver and client programs.
#[derive(Debug)]
pub struct ProcessPipeline<'a> {
    config: &'a SweepConfig,
    nprocs: usize,
    marker: String,
    solver: SolverCommand,
    interpreter: String,
    probe: ReadinessProbe,
    shutdown_grace: Duration,
    geometry: Option<Template>,
    input: Option<Template>,
    client: Template,
    server: Option<Template>,
}

impl<'a> ProcessPipeline<'a> {
    /// Loads every template of `config` and captures the program settings.
    pub fn new(config: &'a SweepConfig, settings: &Settings, nprocs: usize) -> Result<Self, StageError> {
        let load = |p: &Option<PathBuf>| -> Result<Option<Template>, StageError> {
            p.as_deref().map(Template::from_file).transpose().map_err(StageError::from)
        };
        let client = load(&config.client_template)?
            .ok_or_else(|| StageError::Config("client_template is required".into()))?;
        Ok(Self {
            config,
            nprocs,
            marker: settings.extraction.marker.clone(),
            solver: settings.solver_command(),
            interpreter: settings.client.interpreter.clone(),
            probe: settings.readiness_probe(),
            shutdown_grace: settings.shutdown_grace(),
            geometry: load(&config.geometry_template)?,
            input: load(&config.input_template)?,
            client,
            server: load(&config.server_template)?,
        })
    }

    fn layout(&self, point: &SweepPoint) -> PointLayout {
        PointLayout::new(&point.working_dir, &self.config.client_script)
    }
}

impl PointPipeline for ProcessPipeline<'_> {
    fn prepare(&mut self, point: &SweepPoint) -> Result<(), StageError> {
        prepare_working_dir(&point.working_dir, &self.config.shared_assets)
    }

    fn ground_state(&mut self, point: &SweepPoint) -> Result<RunResult, StageError> {
        let layout = self.layout(point);
        let values = substitutions(point, self.config, self.nprocs);

        if let Some(geometry) = &self.geometry {
            let text = geometry.render(&values)?;
            template::write_artifact(&layout.file(&self.config.geometry_file), &text)?;
        }

        let deck = match (&point.deck, &self.input) {
            (Some(path), _) => Template::from_file(path)?,
            (None, Some(t)) => t.clone(),
            (None, None) => {
                return Err(StageError::Config(
                    "no input_template and no discovered deck".into(),
                ))
            }
        };
        let text = deck.render(&values)?;
        template::write_artifact(&layout.ground_state_input(), &text)?;

        log::info!("[{}] running ground state with {} workers", point.label, self.nprocs);
        let run = run_ground_state(
            &self.solver,
            &layout.ground_state_input(),
            &layout.ground_state_output(),
            self.nprocs,
        )?;
        log::info!("[{}] ground state finished in {:.1} s", point.label, run.seconds);
        Ok(run)
    }

    fn extract(&mut self, point: &SweepPoint) -> Result<GridMetadata, StageError> {
        Ok(extract_grid(
            &self.layout(point).ground_state_output(),
            &self.marker,
        )?)
    }

    fn coupling(
        &mut self,
        point: &SweepPoint,
        grid: GridMetadata,
    ) -> Result<Option<Coupling>, StageError> {
        let layout = self.layout(point);
        let values = substitutions(point, self.config, self.nprocs);
        let run = run_coupling(&CouplingRequest {
            grid,
            geometry_file: &self.config.geometry_file,
            layout: &layout,
            nprocs: self.nprocs,
            client_template: &self.client,
            server_template: self.server.as_ref(),
            substitutions: &values,
            solver: &self.solver,
            interpreter: &self.interpreter,
            probe: &self.probe,
            shutdown_grace: self.shutdown_grace,
        })?;
        log::info!("[{}] coupling finished in {:.1} s", point.label, run.seconds);

        match parse_coupling(&run.output) {
            Ok(Some(c)) => {
                log::info!("[{}] |Hab| = {:.6e} H", point.label, c.hartree);
                Ok(Some(c))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                log::warn!("[{}] could not read coupling value: {}", point.label, e);
                Ok(None)
            }
        }
    }
}
