//! Process-wide configuration for cdftsweep.
//!
//! Everything that depends on the machine rather than on a particular sweep
//! (solver executable, MPI launcher, worker count, server readiness timing,
//! the marker used to find grid metadata, logging) lives in INI-format
//! configuration files. Files are resolved once at startup with the
//! following precedence:
//!
//! 1. Local configuration (`./cdftsweep_config.cfg`)
//! 2. User configuration (`~/.config/cdftsweep/cdftsweep_config.cfg`)
//! 3. System configuration (`/etc/cdftsweep/cdftsweep_config.cfg`)
//! 4. Built-in defaults
//!
//! # Configuration File Format
//!
//! ```ini
//! [solver]
//! executable = qb
//! launcher = mpirun
//! np_flag = -np
//! server_flag = -server
//!
//! [client]
//! interpreter = python3
//!
//! [server]
//! readiness_timeout = 120
//! poll_interval_ms = 500
//! ready_marker =
//! min_warmup = 0
//! shutdown_grace = 10
//!
//! [extraction]
//! marker = np0v
//!
//! [sweep]
//! policy = fail_fast
//! default_nprocs = auto
//!
//! [logging]
//! level = info
//! file_logging = false
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use cdftsweep::settings::SettingsManager;
//!
//! let settings = SettingsManager::load()?;
//! println!("solver: {}", settings.solver().executable);
//! # Ok::<(), cdftsweep::settings::ConfigError>(())
//! ```

use crate::config::FailurePolicy;
use crate::process::{ReadinessProbe, SolverCommand};
use configparser::ini::Ini;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Name of the configuration file searched for in every location
pub const CONFIG_FILE_NAME: &str = "cdftsweep_config.cfg";

/// Errors that can occur during configuration loading and processing.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// I/O error when reading configuration files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// INI parsing error
    #[error("INI parsing error: {0}")]
    IniParse(String),
    /// Invalid configuration value
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Main configuration structure containing all program settings.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// External solver invocation
    pub solver: SolverSettings,
    /// Coupling client invocation
    pub client: ClientSettings,
    /// Server readiness and shutdown timing
    pub server: ServerSettings,
    /// Output scraping
    pub extraction: ExtractionSettings,
    /// Sweep-wide defaults
    pub sweep: SweepSettings,
    /// Logging configuration
    pub logging: LoggingSettings,
}

/// How the external solver is launched.
#[derive(Debug, Clone)]
pub struct SolverSettings {
    /// Solver executable (default: "qb")
    pub executable: String,
    /// Parallel launcher, empty to run the solver directly (default: "mpirun")
    pub launcher: String,
    /// Launcher flag preceding the worker count (default: "-np")
    pub np_flag: String,
    /// Flag that switches the solver into server mode (default: "-server")
    pub server_flag: String,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            executable: "qb".to_string(),
            launcher: "mpirun".to_string(),
            np_flag: "-np".to_string(),
            server_flag: "-server".to_string(),
        }
    }
}

/// How the coupling client script is launched.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Interpreter for the client script, empty to execute it directly (default: "python3")
    pub interpreter: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

/// Server readiness polling and shutdown.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Upper bound on the wait for the server to become ready, seconds (default: 120)
    pub readiness_timeout: f64,
    /// Interval between readiness checks, milliseconds (default: 500)
    pub poll_interval_ms: u64,
    /// Text whose appearance in the server log/output marks readiness.
    /// Empty means "the server has written anything" (default: empty)
    pub ready_marker: String,
    /// Minimum settle time before polling starts, seconds (default: 0)
    pub min_warmup: f64,
    /// Time the server gets to exit on its own after the client finished, seconds (default: 10)
    pub shutdown_grace: f64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            readiness_timeout: 120.0,
            poll_interval_ms: 500,
            ready_marker: String::new(),
            min_warmup: 0.0,
            shutdown_grace: 10.0,
        }
    }
}

/// Output scraping settings.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    /// Token identifying the grid report line (default: "np0v")
    pub marker: String,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            marker: "np0v".to_string(),
        }
    }
}

/// Sweep-wide defaults, overridable from the sweep input file.
#[derive(Debug, Clone)]
pub struct SweepSettings {
    /// What to do after a point fails (default: fail_fast)
    pub policy: FailurePolicy,
    /// Worker count when the input does not set `nprocs`.
    /// Resolved from the scheduler environment when configured as `auto`.
    pub default_nprocs: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::FailFast,
            default_nprocs: 4,
        }
    }
}

/// Logging configuration settings.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    /// Log level (default: "info")
    pub level: String,
    /// Send log records to `cdftsweep_debug_<input_basename>.log` (default: false)
    pub file_logging: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_logging: false,
        }
    }
}

impl Settings {
    /// Solver command line builder for these settings
    pub fn solver_command(&self) -> SolverCommand {
        SolverCommand {
            executable: self.solver.executable.clone(),
            launcher: self.solver.launcher.clone(),
            np_flag: self.solver.np_flag.clone(),
            server_flag: self.solver.server_flag.clone(),
        }
    }

    /// Readiness probe parameters for these settings
    pub fn readiness_probe(&self) -> ReadinessProbe {
        let marker = self.server.ready_marker.trim();
        ReadinessProbe {
            timeout: Duration::from_secs_f64(self.server.readiness_timeout.max(0.0)),
            poll_interval: Duration::from_millis(self.server.poll_interval_ms.max(1)),
            min_warmup: Duration::from_secs_f64(self.server.min_warmup.max(0.0)),
            marker: if marker.is_empty() {
                None
            } else {
                Some(marker.to_string())
            },
        }
    }

    /// Grace period granted to the server before it is killed
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.server.shutdown_grace.max(0.0))
    }
}

/// Configuration manager that handles loading and accessing program settings.
pub struct SettingsManager {
    settings: Settings,
    config_source: String,
    rejected: Vec<String>,
}

type IniSection = HashMap<String, Option<String>>;

impl SettingsManager {
    /// Loads configuration from available configuration files.
    ///
    /// Searches for configuration files in the following order, later files
    /// overriding earlier ones:
    /// 1. `/etc/cdftsweep/cdftsweep_config.cfg` (system configuration)
    /// 2. `~/.config/cdftsweep/cdftsweep_config.cfg` (user configuration)
    /// 3. `./cdftsweep_config.cfg` (current working directory)
    ///
    /// A file that fails to parse is skipped as a whole and listed in
    /// [`SettingsManager::rejected_files`].
    pub fn load() -> Result<Self, ConfigError> {
        let (settings, source, rejected) = Self::load_from_files()?;
        debug!("Configuration loaded from: {}", source);
        Ok(Self {
            settings,
            config_source: source,
            rejected,
        })
    }

    /// Loads a single configuration file on top of the built-in defaults.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let mut settings = Settings::default();
        Self::apply_file(&mut settings, path)?;
        Ok(Self {
            settings,
            config_source: format!("config file ({})", path.display()),
            rejected: Vec::new(),
        })
    }

    /// Wraps already-built settings (used by tests and embedding callers).
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings,
            config_source: "built-in defaults".to_string(),
            rejected: Vec::new(),
        }
    }

    /// Returns the source of the loaded configuration.
    pub fn config_source(&self) -> &str {
        &self.config_source
    }

    /// Configuration files that were found but skipped, with the reason.
    pub fn rejected_files(&self) -> &[String] {
        &self.rejected
    }

    /// Gets a reference to the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Gets the solver settings.
    pub fn solver(&self) -> &SolverSettings {
        &self.settings.solver
    }

    /// Gets the client settings.
    pub fn client(&self) -> &ClientSettings {
        &self.settings.client
    }

    /// Gets the server settings.
    pub fn server(&self) -> &ServerSettings {
        &self.settings.server
    }

    /// Gets the extraction settings.
    pub fn extraction(&self) -> &ExtractionSettings {
        &self.settings.extraction
    }

    /// Gets the sweep settings.
    pub fn sweep(&self) -> &SweepSettings {
        &self.settings.sweep
    }

    /// Gets the logging settings.
    pub fn logging(&self) -> &LoggingSettings {
        &self.settings.logging
    }

    fn load_from_files() -> Result<(Settings, String, Vec<String>), ConfigError> {
        let candidates = [
            ("system", Self::get_system_config_path()),
            ("user", Self::get_user_config_path()),
            ("local", Some(PathBuf::from(CONFIG_FILE_NAME))),
        ];
        let existing = candidates
            .into_iter()
            .filter_map(|(kind, path)| path.filter(|p| p.exists()).map(|p| (kind, p)));
        Ok(Self::layer_files(existing))
    }

    /// Layers the given files over the defaults, in order.
    ///
    /// Each file is applied to a copy that replaces the current settings only
    /// if the whole file was accepted; a rejected file changes nothing.
    fn layer_files<'a>(
        files: impl IntoIterator<Item = (&'a str, PathBuf)>,
    ) -> (Settings, String, Vec<String>) {
        let mut settings = Settings::default();
        let mut config_source = "built-in defaults".to_string();
        let mut rejected = Vec::new();

        for (kind, path) in files {
            let mut candidate = settings.clone();
            match Self::apply_file(&mut candidate, &path) {
                Ok(()) => {
                    settings = candidate;
                    config_source = format!("{} config ({})", kind, path.display());
                    debug!("Loaded {} configuration from: {}", kind, path.display());
                }
                Err(e) => {
                    let message =
                        format!("Failed to load {} config from {}: {}", kind, path.display(), e);
                    warn!("{}", message);
                    rejected.push(message);
                }
            }
        }

        (settings, config_source, rejected)
    }

    /// Applies the keys present in one INI file on top of `settings`.
    ///
    /// Only keys that appear in the file are changed, so a partial local file
    /// refines a user or system file instead of resetting it.
    fn apply_file(settings: &mut Settings, path: &Path) -> Result<(), ConfigError> {
        let content = fs::read_to_string(path)?;
        let mut ini = Ini::new();
        let map = ini
            .read(content)
            .map_err(|e| ConfigError::IniParse(format!("Failed to parse INI: {}", e)))?;

        if let Some(section) = map.get("solver") {
            Self::parse_solver(section, &mut settings.solver);
        }
        if let Some(section) = map.get("client") {
            if let Some(interpreter) = value(section, "interpreter") {
                settings.client.interpreter = interpreter.to_string();
            }
        }
        if let Some(section) = map.get("server") {
            Self::parse_server(section, &mut settings.server)?;
        }
        if let Some(section) = map.get("extraction") {
            if let Some(marker) = value(section, "marker") {
                if marker.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "extraction marker must not be empty".into(),
                    ));
                }
                settings.extraction.marker = marker.to_string();
            }
        }
        if let Some(section) = map.get("sweep") {
            Self::parse_sweep(section, &mut settings.sweep)?;
        }
        if let Some(section) = map.get("logging") {
            if let Some(level) = value(section, "level") {
                settings.logging.level = level.to_string();
            }
            if let Some(file_logging) = value(section, "file_logging") {
                settings.logging.file_logging = parse_bool("file_logging", file_logging)?;
            }
        }
        Ok(())
    }

    fn parse_solver(section: &IniSection, solver: &mut SolverSettings) {
        // Empty values are meaningful here (e.g. no launcher)
        if let Some(Some(executable)) = section.get("executable") {
            solver.executable = executable.trim().to_string();
        }
        if let Some(launcher) = section.get("launcher") {
            solver.launcher = launcher.as_deref().unwrap_or("").trim().to_string();
        }
        if let Some(np_flag) = section.get("np_flag") {
            solver.np_flag = np_flag.as_deref().unwrap_or("").trim().to_string();
        }
        if let Some(Some(server_flag)) = section.get("server_flag") {
            solver.server_flag = server_flag.trim().to_string();
        }
    }

    fn parse_server(section: &IniSection, server: &mut ServerSettings) -> Result<(), ConfigError> {
        if let Some(v) = value(section, "readiness_timeout") {
            server.readiness_timeout = parse_seconds("readiness_timeout", v)?;
        }
        if let Some(v) = value(section, "poll_interval_ms") {
            server.poll_interval_ms = v.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("Invalid poll_interval_ms: {}", v))
            })?;
        }
        if let Some(marker) = section.get("ready_marker") {
            server.ready_marker = marker.as_deref().unwrap_or("").trim().to_string();
        }
        if let Some(v) = value(section, "min_warmup") {
            server.min_warmup = parse_seconds("min_warmup", v)?;
        }
        if let Some(v) = value(section, "shutdown_grace") {
            server.shutdown_grace = parse_seconds("shutdown_grace", v)?;
        }
        Ok(())
    }

    fn parse_sweep(section: &IniSection, sweep: &mut SweepSettings) -> Result<(), ConfigError> {
        if let Some(v) = value(section, "policy") {
            sweep.policy = v
                .parse()
                .map_err(|e: String| ConfigError::InvalidValue(e))?;
        }
        if let Some(v) = value(section, "default_nprocs") {
            sweep.default_nprocs = if v.eq_ignore_ascii_case("auto") {
                scheduler_task_count().unwrap_or_else(|| {
                    warn!("default_nprocs = auto but no scheduler allocation found; using 1");
                    1
                })
            } else {
                match v.parse::<usize>() {
                    Ok(n) if n > 0 => n,
                    _ => {
                        return Err(ConfigError::InvalidValue(format!(
                            "Invalid default_nprocs: {}",
                            v
                        )))
                    }
                }
            };
        }
        Ok(())
    }

    /// Gets the system configuration file path.
    fn get_system_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            Some(PathBuf::from("/etc/cdftsweep").join(CONFIG_FILE_NAME))
        }
        #[cfg(windows)]
        {
            std::env::var("PROGRAMDATA")
                .ok()
                .map(|pd| PathBuf::from(pd).join("cdftsweep").join(CONFIG_FILE_NAME))
        }
    }

    /// Gets the user configuration file path.
    fn get_user_config_path() -> Option<PathBuf> {
        #[cfg(unix)]
        {
            std::env::var("HOME").ok().map(|home| {
                PathBuf::from(home)
                    .join(".config")
                    .join("cdftsweep")
                    .join(CONFIG_FILE_NAME)
            })
        }
        #[cfg(windows)]
        {
            std::env::var("APPDATA")
                .ok()
                .map(|appdata| PathBuf::from(appdata).join("cdftsweep").join(CONFIG_FILE_NAME))
        }
    }
}

fn value<'a>(section: &'a IniSection, key: &str) -> Option<&'a str> {
    section
        .get(key)
        .and_then(|v| v.as_deref())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_bool(key: &str, v: &str) -> Result<bool, ConfigError> {
    match v.to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue(format!("Invalid {} value: {}", key, v))),
    }
}

fn parse_seconds(key: &str, v: &str) -> Result<f64, ConfigError> {
    match v.parse::<f64>() {
        Ok(s) if s >= 0.0 && s.is_finite() => Ok(s),
        _ => Err(ConfigError::InvalidValue(format!("Invalid {}: {}", key, v))),
    }
}

/// Worker count granted by the batch scheduler, if any.
///
/// Reads `SLURM_NTASKS`, falling back to `SLURM_NNODES * SLURM_NTASKS_PER_NODE`.
pub fn scheduler_task_count() -> Option<usize> {
    let read = |name: &str| {
        std::env::var(name)
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
    };
    read("SLURM_NTASKS").or_else(|| {
        let nodes = read("SLURM_NNODES")?;
        // SLURM reports e.g. "16(x2)" for heterogeneous allocations; take the leading count
        let per_node = std::env::var("SLURM_NTASKS_PER_NODE")
            .ok()
            .and_then(|v| v.split('(').next().and_then(|n| n.trim().parse::<usize>().ok()))
            .filter(|n| *n > 0)?;
        Some(nodes * per_node)
    })
}

impl SettingsManager {
    /// Creates a default cdftsweep_config.cfg file with all available options.
    pub fn create_template(path: &Path) -> Result<(), ConfigError> {
        fs::write(path, Self::generate_template_content())?;
        info!("Created settings template at: {}", path.display());
        Ok(())
    }

    fn generate_template_content() -> String {
        let solver = SolverSettings::default();
        let client = ClientSettings::default();
        let server = ServerSettings::default();
        let extraction = ExtractionSettings::default();
        let sweep = SweepSettings::default();
        let logging = LoggingSettings::default();
        format!(
            r#"# cdftsweep configuration file
#
# Machine-level settings for the ground-state / coupling sweep driver.
# Files are read in this order, later ones overriding earlier ones:
#
# 1. /etc/cdftsweep/cdftsweep_config.cfg (system)
# 2. ~/.config/cdftsweep/cdftsweep_config.cfg (user)
# 3. ./cdftsweep_config.cfg (local, highest priority)
#
# Keys that are absent keep their built-in defaults shown below.

[solver]
# Solver executable, used both for the ground-state run and in server mode
executable = {}

# Parallel launcher; leave empty to run the solver directly
launcher = {}

# Launcher flag followed by the worker count
np_flag = {}

# Flag that starts the solver as a server: <executable> <server_flag> <input> <output>
server_flag = {}

[client]
# Interpreter for the rendered client script; leave empty to execute the script itself
interpreter = {}

[server]
# Upper bound (seconds) on the wait for the server to become ready
readiness_timeout = {}

# Interval between readiness checks (milliseconds)
poll_interval_ms = {}

# Text that marks the server as ready when it appears in server.log or the
# server output file. Empty: ready as soon as either file has content.
ready_marker = {}

# Minimum settle time (seconds) before readiness polling starts
min_warmup = {}

# Seconds the server gets to exit on its own after the client finished
shutdown_grace = {}

[extraction]
# Token of the ground-state output line reporting the FFT grid
marker = {}

[sweep]
# fail_fast: stop at the first failed point
# continue:  run every point and report failures at the end
policy = {}

# Worker count when the sweep input does not set nprocs.
# 'auto' reads SLURM_NTASKS (or SLURM_NNODES x SLURM_NTASKS_PER_NODE)
default_nprocs = {}

[logging]
# Log level: debug, info, warn, error
level = {}

# Write log records to cdftsweep_debug_<input_basename>.log instead of stdout
file_logging = {}
"#,
            solver.executable,
            solver.launcher,
            solver.np_flag,
            solver.server_flag,
            client.interpreter,
            server.readiness_timeout,
            server.poll_interval_ms,
            server.ready_marker,
            server.min_warmup,
            server.shutdown_grace,
            extraction.marker,
            sweep.policy,
            sweep.default_nprocs,
            logging.level,
            logging.file_logging,
        )
    }
}
