//! cdftsweep Command-Line Interface
//!
//! Entry point of the sweep driver: argument parsing, settings and logger
//! initialisation, and dispatch to the sweep or template commands.
//!
//! # Usage
//!
//! ```bash
//! # Create a starter sweep input plus templates
//! cdftsweep ci sweep.inp
//!
//! # Create a settings template
//! cdftsweep ci cdftsweep_config.cfg
//!
//! # Validate and list the points without launching anything
//! cdftsweep sweep.inp --check
//!
//! # Run the sweep
//! cdftsweep sweep.inp
//! ```
//!
//! The process exits with status 1 if any point failed or the sweep could not
//! start.

use cdftsweep::config::{FailurePolicy, SweepConfig};
use cdftsweep::driver::{run_sweep, ProcessPipeline};
use cdftsweep::naming::SWEEP_SUMMARY;
use cdftsweep::point::{build_points, SweepPoint};
use cdftsweep::process::install_interrupt_handler;
use cdftsweep::settings::{Settings, SettingsManager, CONFIG_FILE_NAME};
use cdftsweep::{parser, template_generator, validation};
use std::env;
use std::fs::File;
use std::path::Path;
use std::process;
use std::str::FromStr;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage(&args[0]);
        process::exit(1);
    }

    check_help_flags(&args);

    let command = &args[1];

    match command.as_str() {
        "ci" => {
            init_console_logger(log::LevelFilter::Info);
            if args.len() < 3 {
                eprintln!("Error: Missing file argument");
                eprintln!("Usage:");
                eprintln!("  {} ci <file|dir>          - Create starter sweep input", args[0]);
                eprintln!("  {} ci {}  - Create settings template", args[0], CONFIG_FILE_NAME);
                process::exit(1);
            }

            let file_arg = &args[2];
            if file_arg == CONFIG_FILE_NAME {
                match run_create_settings_template() {
                    Ok(()) => {
                        println!("✓ Settings template created successfully!");
                        println!("  Output file: {}", CONFIG_FILE_NAME);
                        println!("\nNext steps:");
                        println!("  1. Set the solver executable and launcher for this machine");
                        println!("  2. Adjust the server readiness marker and timeouts if needed");
                        println!("  3. The settings will be automatically loaded by cdftsweep");
                    }
                    Err(e) => {
                        eprintln!("Error creating settings template: {}", e);
                        process::exit(1);
                    }
                }
            } else {
                let target = template_generator::get_default_output_path(file_arg);
                match template_generator::write_starter_files(&target) {
                    Ok(written) => {
                        println!("✓ Starter sweep created successfully!");
                        for file in &written {
                            println!("  Created: {}", file.display());
                        }
                        println!("\nNext steps:");
                        println!("  1. Edit the templates for your system");
                        println!("  2. Check the inputs: {} {} --check", args[0], target.display());
                        println!("  3. Run the sweep:    {} {}", args[0], target.display());
                    }
                    Err(e) => {
                        eprintln!("Error creating starter files: {}", e);
                        process::exit(1);
                    }
                }
            }
        }
        _ => {
            if command.starts_with('-') {
                eprintln!("Error: Unknown command: {}", command);
                print_usage(&args[0]);
                process::exit(1);
            }
            let check_only = args[2..].iter().any(|a| a == "--check");
            if let Some(unknown) = args[2..].iter().find(|a| *a != "--check") {
                eprintln!("Error: Unknown option: {}", unknown);
                print_usage(&args[0]);
                process::exit(1);
            }

            match run(Path::new(command), check_only) {
                Ok(true) => {}
                Ok(false) => process::exit(1),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    process::exit(1);
                }
            }
        }
    }
}

/// Check for help flags and print appropriate help
fn check_help_flags(args: &[String]) {
    use cdftsweep::help::*;

    if args[1] == "--help" || args[1] == "-h" {
        match args.get(2).map(String::as_str) {
            Some("keywords") => print_keyword_help(),
            Some("placeholders") => print_placeholder_help(),
            Some("settings") => print_settings_help(),
            _ => print_global_help(),
        }
        process::exit(0);
    }

    if args.len() >= 3 && (args[2] == "--help" || args[2] == "-h") {
        if args[1] == "ci" {
            print_global_help();
        } else {
            print_keyword_help();
        }
        process::exit(0);
    }
}

fn print_usage(program_name: &str) {
    eprintln!("cdftsweep - constrained-DFT coupling sweeps");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  {} ci <file|dir>", program_name);
    eprintln!("                    Create a starter sweep input and templates");
    eprintln!();
    eprintln!("  {} ci {}", program_name, CONFIG_FILE_NAME);
    eprintln!("                    Create a settings template file");
    eprintln!();
    eprintln!("  {} <input_file> [--check]", program_name);
    eprintln!("                    Run (or only validate) the sweep");
    eprintln!();
    eprintln!("  {} --help [keywords|placeholders|settings]", program_name);
}

fn init_console_logger(level: log::LevelFilter) {
    let mut builder = env_logger::Builder::from_default_env();
    if env::var_os("RUST_LOG").is_none() {
        builder.filter_level(level);
    }
    builder
        .target(env_logger::Target::Stdout)
        .format_timestamp_millis()
        .init();
}

fn init_logger(settings: &Settings, input_path: &Path) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let level = log::LevelFilter::from_str(&settings.logging.level).unwrap_or(log::LevelFilter::Info);
    if !settings.logging.file_logging {
        init_console_logger(level);
        return Ok(None);
    }

    let input_stem = input_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("sweep");
    let log_file = format!("cdftsweep_debug_{}.log", input_stem);
    let file = File::create(&log_file)
        .map_err(|e| format!("Failed to create log file {}: {}", log_file, e))?;

    let mut builder = env_logger::Builder::from_default_env();
    if env::var_os("RUST_LOG").is_none() {
        builder.filter_level(level);
    }
    builder
        .target(env_logger::Target::Pipe(Box::new(file)))
        .format_timestamp_millis()
        .init();
    Ok(Some(log_file))
}

fn run_create_settings_template() -> Result<(), Box<dyn std::error::Error>> {
    let settings_path = Path::new(CONFIG_FILE_NAME);

    if settings_path.exists() {
        return Err(format!(
            "{} already exists. Please remove it first or choose a different location.",
            CONFIG_FILE_NAME
        )
        .into());
    }

    SettingsManager::create_template(settings_path)?;
    Ok(())
}

/// Prints the parameters the sweep will run with and where they come from.
fn print_configuration(
    config: &SweepConfig,
    settings: &SettingsManager,
    points: &[SweepPoint],
    nprocs: usize,
    policy: FailurePolicy,
    debug_log_file: Option<&str>,
) {
    let s = settings.settings();
    let opt = |p: &Option<std::path::PathBuf>| {
        p.as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    println!("{}", "=".repeat(76));
    println!("CONFIGURATION AND SETTINGS");
    println!("{}", "=".repeat(76));
    println!("Settings source:               {}", settings.config_source());
    println!();
    println!("Sweep:");
    println!("  Points:                      {}", points.len());
    println!("  Work root:                   {}", config.work_root.display());
    println!("  Workers per run:             {}", nprocs);
    println!("  Failure policy:              {}", policy);
    println!("  Geometry template:           {}", opt(&config.geometry_template));
    println!("  Input template:              {}", opt(&config.input_template));
    println!("  Client template:             {}", opt(&config.client_template));
    println!("  Server template:             {}", opt(&config.server_template));
    println!("  Shared assets:               {}", config.shared_assets.len());
    println!();
    println!("Programs:");
    println!("  Solver:                      {}", s.solver_command().program_name());
    println!("  Server flag:                 {}", s.solver.server_flag);
    println!("  Client interpreter:          {}", s.client.interpreter);
    println!("  Grid marker:                 {}", s.extraction.marker);
    println!(
        "  Server readiness:            marker '{}', timeout {} s",
        s.server.ready_marker, s.server.readiness_timeout
    );
    println!();
    println!("Constraint:");
    println!("  Optimizer:                   {}", config.constraint.optimizer);
    match config.constraint.n0 {
        Some(n0) => println!("  N0:                          {}", n0),
        None => println!("  N0:                          -"),
    }
    println!(
        "  V_init / V_brak:             {} / ({}, {})",
        config.constraint.v_init, config.constraint.v_brak.0, config.constraint.v_brak.1
    );
    println!(
        "  N_tol / eps:                 {:e} / {:e}",
        config.constraint.n_tol, config.constraint.eps
    );
    if let Some(log_file) = debug_log_file {
        println!();
        println!("Debug log file:                {}", log_file);
    }
    println!("{}", "=".repeat(76));
    println!();
}

/// Runs (or with `check_only`, validates) the sweep. Returns whether every point succeeded.
fn run(input_path: &Path, check_only: bool) -> Result<bool, Box<dyn std::error::Error>> {
    println!("**** cdftsweep: ground-state / constrained-DFT coupling sweeps ****");
    println!("              Version {}\n", env!("CARGO_PKG_VERSION"));

    let (settings, load_error) = match SettingsManager::load() {
        Ok(settings) => (settings, None),
        Err(e) => (SettingsManager::from_settings(Settings::default()), Some(e)),
    };
    let debug_log_file = init_logger(settings.settings(), input_path)?;
    if let Some(e) = load_error {
        log::warn!("{}; using built-in settings", e);
    }
    for rejected in settings.rejected_files() {
        log::warn!("{}", rejected);
    }

    let config = parser::parse_input(input_path)?;

    let points = build_points(&config)?;
    let nprocs = config.nprocs.unwrap_or(settings.sweep().default_nprocs);
    let policy = config.policy.unwrap_or(settings.sweep().policy);

    print_configuration(
        &config,
        &settings,
        &points,
        nprocs,
        policy,
        debug_log_file.as_deref(),
    );

    if let Err(e) = validation::validate_sweep(&config, &points) {
        eprintln!("Configuration Error: {}", e);
        return Err(e.into());
    }
    validation::provide_user_guidance(&config, &points, nprocs);

    if check_only {
        println!("Input is valid. Points:");
        for p in &points {
            match &p.deck {
                Some(deck) => println!("  {:<12} {} (deck {})", p.label, p.working_dir.display(), deck.display()),
                None => println!("  {:<12} {}", p.label, p.working_dir.display()),
            }
        }
        return Ok(true);
    }

    if let Err(e) = install_interrupt_handler() {
        log::warn!("Ctrl-C will not be forwarded to servers: {}", e);
    }
    let mut pipeline = ProcessPipeline::new(&config, settings.settings(), nprocs)?;
    let report = run_sweep(&points, &mut pipeline, policy);
    report.print_summary();

    let summary_path = config.work_root.join(SWEEP_SUMMARY);
    match report.write_json(&summary_path) {
        Ok(()) => println!("\nSummary written to {}", summary_path.display()),
        Err(e) => log::error!("Failed to write {}: {}", summary_path.display(), e),
    }

    if report.is_success() {
        println!("\n****All {} points completed****", report.points.len());
    }
    Ok(report.is_success())
}
