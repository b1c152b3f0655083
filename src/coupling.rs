//! Stage 2: constrained-DFT coupling with a server/client pair.
//!
//! The solver is started in server mode and a client script drives it through
//! the shared server input/output files. The coordinator renders both inputs,
//! starts the server, waits until it is ready, runs the client to completion
//! and always stops the server afterwards.

use crate::extract::GridMetadata;
use crate::naming::PointLayout;
use crate::process::{
    describe, io_error, non_empty, spawn_error, ReadinessProbe, RunError, RunResult, ServerHandle,
    SolverCommand,
};
use crate::template::{self, Template, GEOMETRY_FILE, GRID_N1, GRID_N2, GRID_N3};
use std::collections::HashMap;
use std::fs::File;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Everything needed to run the coupling stage of one point.
#[derive(Debug, Clone)]
pub struct CouplingRequest<'a> {
    /// Grid extracted from the ground-state output
    pub grid: GridMetadata,
    /// Rendered geometry file name, relative to the working directory
    pub geometry_file: &'a str,
    /// Working directory layout of the point
    pub layout: &'a PointLayout,
    /// Worker count for the server
    pub nprocs: usize,
    /// Client script template
    pub client_template: &'a Template,
    /// Server input template; an empty input file is created when `None`
    pub server_template: Option<&'a Template>,
    /// Point substitutions (grid values and the geometry file are added here)
    pub substitutions: &'a HashMap<String, String>,
    /// Solver invocation
    pub solver: &'a SolverCommand,
    /// Client interpreter; the script is executed directly when empty
    pub interpreter: &'a str,
    /// Server readiness poll
    pub probe: &'a ReadinessProbe,
    /// Time the server gets to exit on its own before it is killed
    pub shutdown_grace: Duration,
}

/// Adds the grid dimensions and the geometry file name to a substitution map.
pub fn with_grid(
    values: &HashMap<String, String>,
    grid: GridMetadata,
    geometry_file: &str,
) -> HashMap<String, String> {
    let mut values = values.clone();
    values.insert(GEOMETRY_FILE.to_string(), geometry_file.to_string());
    values.insert(GRID_N1.to_string(), grid.n1.to_string());
    values.insert(GRID_N2.to_string(), grid.n2.to_string());
    values.insert(GRID_N3.to_string(), grid.n3.to_string());
    values
}

/// Runs the coupling stage for one point.
///
/// Returns the client's run record once the result file has been written.
///
/// # Errors
///
/// - [`RunError::Template`] if the client script or server input cannot be rendered.
/// - [`RunError::ServerCrashed`] / [`RunError::ServerNotReady`] from the readiness poll.
/// - [`RunError::ExternalProcessFailed`] if the client exits non-zero.
/// - [`RunError::MissingArtifact`] if the result file is missing or empty.
pub fn run_coupling(request: &CouplingRequest<'_>) -> Result<RunResult, RunError> {
    let layout = request.layout;
    let values = with_grid(request.substitutions, request.grid, request.geometry_file);

    let script = request.client_template.render(&values)?;
    template::write_artifact(&layout.client_script(), &script)?;

    let server_input = match request.server_template {
        Some(t) => t.render(&values)?,
        None => String::new(),
    };
    template::write_artifact(&layout.server_input(), &server_input)?;

    let server_cmd = request.solver.server(
        request.nprocs,
        crate::naming::SERVER_INPUT,
        crate::naming::SERVER_OUTPUT,
    );
    log::info!(
        "starting server ({} workers, grid {}, geometry {})",
        request.nprocs,
        request.grid,
        request.geometry_file
    );
    let mut server = ServerHandle::spawn(
        server_cmd,
        layout.dir(),
        &layout.server_log(),
        &layout.server_output(),
    )?;

    let client = server
        .wait_ready(request.probe)
        .and_then(|_| server.ensure_alive())
        .and_then(|_| run_client(request));

    match server.shutdown(request.shutdown_grace) {
        Ok(Some(status)) => log::debug!("server finished: {}", status),
        Ok(None) => {}
        Err(e) => log::warn!("failed to stop server cleanly: {}", e),
    }

    client
}

fn run_client(request: &CouplingRequest<'_>) -> Result<RunResult, RunError> {
    let layout = request.layout;
    let result_path = layout.coupling_result();
    let stderr_path = layout.coupling_stderr();
    let out = File::create(&result_path).map_err(io_error(&result_path))?;
    let err = File::create(&stderr_path).map_err(io_error(&stderr_path))?;

    let mut cmd = if request.interpreter.is_empty() {
        Command::new(layout.client_script())
    } else {
        let mut cmd = Command::new(request.interpreter);
        cmd.arg(layout.client_script_name());
        cmd
    };
    cmd.current_dir(layout.dir())
        .stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));

    let program = format!("{} {}", request.interpreter, layout.client_script_name())
        .trim()
        .to_string();
    log::info!("running client {}", program);
    let start = Instant::now();
    let status = cmd.status().map_err(spawn_error(&cmd))?;
    let seconds = start.elapsed().as_secs_f64();

    if !status.success() {
        return Err(RunError::ExternalProcessFailed {
            program,
            status: describe(&status),
            log: stderr_path,
        });
    }
    if !non_empty(&result_path) {
        return Err(RunError::MissingArtifact(result_path));
    }

    Ok(RunResult {
        program,
        output: result_path,
        exit_code: status.code(),
        seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_grid_overrides_nothing_else() {
        let mut base = HashMap::new();
        base.insert("LABEL".to_string(), "3.5".to_string());
        let values = with_grid(&base, GridMetadata { n1: 40, n2: 40, n3: 60 }, "geometry.xyz");
        assert_eq!(values["GRID_N3"], "60");
        assert_eq!(values["GEOMETRY_FILE"], "geometry.xyz");
        assert_eq!(values["LABEL"], "3.5");
        assert_eq!(base.len(), 1);
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use tempfile::TempDir;

        const SERVER: &str = "echo $$ > server.pid\necho ready\nexec sleep 30";

        /// Stands in for a launcher that forks the real workers.
        const FORKING_SERVER: &str =
            "echo $$ > server.pid\nsleep 30 &\necho $! > rank.pid\necho ready\nwait";

        fn fake_server(dir: &Path, body: &str) -> SolverCommand {
            let path = dir.join("fake_qb.sh");
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            SolverCommand {
                executable: path.to_string_lossy().into_owned(),
                launcher: String::new(),
                ..SolverCommand::default()
            }
        }

        fn probe() -> ReadinessProbe {
            ReadinessProbe {
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(20),
                min_warmup: Duration::ZERO,
                marker: Some("ready".into()),
            }
        }

        fn alive(pid: &str) -> bool {
            Command::new("kill")
                .arg("-0")
                .arg(pid.trim())
                .status()
                .map(|s| s.success())
                .unwrap_or(false)
        }

        /// Like `alive`, but zombies count as dead and orphans get time to be reaped.
        fn still_running(pid: &str) -> bool {
            let stat = Path::new("/proc").join(pid.trim()).join("stat");
            let deadline = Instant::now() + Duration::from_secs(3);
            loop {
                let running = match fs::read_to_string(&stat) {
                    Ok(text) => !text
                        .rsplit(')')
                        .next()
                        .map(|rest| rest.trim_start().starts_with('Z'))
                        .unwrap_or(false),
                    Err(_) => false,
                };
                if !running || Instant::now() >= deadline {
                    return running;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }

        fn request_run(dir: &Path, client: &str) -> Result<RunResult, RunError> {
            run_against(dir, SERVER, client)
        }

        fn run_against(dir: &Path, server: &str, client: &str) -> Result<RunResult, RunError> {
            let layout = PointLayout::new(dir, "cdft.sh");
            let solver = fake_server(dir, server);
            let client_template = Template::new("cdft.sh", client);
            let values = HashMap::new();
            let probe = probe();
            run_coupling(&CouplingRequest {
                grid: GridMetadata { n1: 40, n2: 40, n3: 60 },
                geometry_file: "geometry.xyz",
                layout: &layout,
                nprocs: 2,
                client_template: &client_template,
                server_template: None,
                substitutions: &values,
                solver: &solver,
                interpreter: "/bin/sh",
                probe: &probe,
                shutdown_grace: Duration::from_millis(100),
            })
        }

        #[test]
        fn test_client_output_and_server_stopped() {
            let dir = TempDir::new().unwrap();
            let result =
                request_run(dir.path(), "echo grid {{GRID_N1}} {{GRID_N2}} {{GRID_N3}}\n").unwrap();
            assert_eq!(result.exit_code, Some(0));
            let out = fs::read_to_string(dir.path().join("coupling.out")).unwrap();
            assert_eq!(out.trim(), "grid 40 40 60");
            assert!(dir.path().join("qb_cdft.in").exists());
            let pid = fs::read_to_string(dir.path().join("server.pid")).unwrap();
            assert!(!alive(&pid));
        }

        #[test]
        fn test_failing_client_still_stops_server() {
            let dir = TempDir::new().unwrap();
            let err = request_run(dir.path(), "echo boom >&2\nexit 1\n").unwrap_err();
            assert!(matches!(err, RunError::ExternalProcessFailed { .. }));
            let stderr = fs::read_to_string(dir.path().join("coupling.err")).unwrap();
            assert!(stderr.contains("boom"));
            let pid = fs::read_to_string(dir.path().join("server.pid")).unwrap();
            assert!(!alive(&pid));
        }

        #[test]
        fn test_failing_client_stops_forked_server_workers() {
            let dir = TempDir::new().unwrap();
            let err = run_against(dir.path(), FORKING_SERVER, "exit 1\n").unwrap_err();
            assert!(matches!(err, RunError::ExternalProcessFailed { .. }));
            let rank = fs::read_to_string(dir.path().join("rank.pid")).unwrap();
            assert!(!still_running(&rank));
            let pid = fs::read_to_string(dir.path().join("server.pid")).unwrap();
            assert!(!still_running(&pid));
        }

        #[test]
        fn test_client_sees_geometry_file() {
            let dir = TempDir::new().unwrap();
            request_run(dir.path(), "echo {{GEOMETRY_FILE}}\n").unwrap();
            let out = fs::read_to_string(dir.path().join("coupling.out")).unwrap();
            assert_eq!(out.trim(), "geometry.xyz");
        }

        #[test]
        fn test_empty_result_is_missing_artifact() {
            let dir = TempDir::new().unwrap();
            let err = request_run(dir.path(), "exit 0\n").unwrap_err();
            assert!(matches!(err, RunError::MissingArtifact(_)));
        }

        #[test]
        fn test_render_failure_starts_nothing() {
            let dir = TempDir::new().unwrap();
            let err = request_run(dir.path(), "{{UNKNOWN}}").unwrap_err();
            assert!(matches!(err, RunError::Template(_)));
            assert!(!dir.path().join("server.pid").exists());
            assert!(!dir.path().join("cdft.sh").exists());
        }
    }
}
