#![deny(missing_docs)]

//! cdftsweep - Ground-state and constrained-DFT coupling sweeps
//!
//! cdftsweep drives a two-stage plane-wave calculation over a series of
//! geometries, typically a donor/acceptor pair at increasing separations,
//! and collects the electronic coupling of every point.
//!
//! # Overview
//!
//! For each sweep point the driver
//!
//! 1. creates the point directory `work_root/<label>` and copies shared assets
//!    (pseudopotentials, restart files) into it,
//! 2. renders the geometry and the ground-state deck from templates and runs
//!    the solver once (`gs.in` on stdin, `gs.out` as output),
//! 3. reads the FFT grid the solver chose from `gs.out`,
//! 4. starts the solver in server mode, waits until it is ready, runs the
//!    constrained-DFT client script against it and stops the server again.
//!
//! The client writes its result to `coupling.out`; the sweep ends with a
//! summary table and `sweep_summary.json`.
//!
//! # Templates
//!
//! Templates are plain text with `{{NAME}}` placeholders (see [`template`]).
//! Grid placeholders only exist after the ground-state run, so they are only
//! valid in the client script and server input. Every template is checked
//! before the first program starts ([`validation`]).
//!
//! # Quick Start
//!
//! ```no_run
//! use cdftsweep::driver::{run_sweep, ProcessPipeline};
//! use cdftsweep::parser::parse_input;
//! use cdftsweep::point::build_points;
//! use cdftsweep::settings::SettingsManager;
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = parse_input(Path::new("sweep.inp"))?;
//!     let settings = SettingsManager::load()?;
//!     let points = build_points(&config)?;
//!
//!     let mut pipeline = ProcessPipeline::new(&config, settings.settings(), 16)?;
//!     let report = run_sweep(&points, &mut pipeline, settings.sweep().policy);
//!     report.print_summary();
//!     Ok(())
//! }
//! ```
//!
//! # Failure Handling
//!
//! Nothing is retried. A failed point is reported with the stage that failed
//! (`stage1_failed`, `extraction_failed`, `stage2_failed`). By default the sweep
//! stops at the first failure; with `policy = continue` every point is
//! attempted. The server of a failed coupling run is always stopped.
//!
//! # License
//!
//! MIT License

/// Sweep description
pub mod config;
/// Coupling stage (server/client)
pub mod coupling;
/// Sweep driver and point pipeline
pub mod driver;
/// Grid and coupling scraping
pub mod extract;
/// Ground-state stage
pub mod ground_state;
/// Built-in help system
pub mod help;
/// Per-point file names
pub mod naming;
pub mod parser;
/// Sweep points and substitution values
pub mod point;
/// External program plumbing
pub mod process;
/// Configuration management system
pub mod settings;
pub mod template;
/// Starter sweep files
pub mod template_generator;
/// Pre-flight validation
pub mod validation;

pub use config::SweepConfig;
pub use driver::{run_sweep, SweepReport};
