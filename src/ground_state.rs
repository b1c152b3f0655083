//! Stage 1: ground-state run of the solver.

use crate::process::{describe, io_error, non_empty, spawn_error, RunError, RunResult, SolverCommand};
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

/// Runs one blocking ground-state calculation.
///
/// The solver reads the rendered deck from stdin; stdout and stderr are both
/// written to `output`. The process runs in the deck's directory so relative
/// references inside the deck (geometry, pseudopotentials) resolve against
/// the point directory.
///
/// # Errors
///
/// - [`RunError::Spawn`] if the solver cannot be started.
/// - [`RunError::ExternalProcessFailed`] on a non-zero exit.
/// - [`RunError::MissingArtifact`] if `output` is missing or empty afterwards.
pub fn run_ground_state(
    command: &SolverCommand,
    input: &Path,
    output: &Path,
    nprocs: usize,
) -> Result<RunResult, RunError> {
    let deck = File::open(input).map_err(io_error(input))?;
    let out = File::create(output).map_err(io_error(output))?;
    let err = out.try_clone().map_err(io_error(output))?;

    let mut cmd = command.batch(nprocs);
    if let Some(dir) = input.parent().filter(|p| !p.as_os_str().is_empty()) {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::from(deck))
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));

    log::debug!("running {:?}", cmd);
    let start = Instant::now();
    let status = cmd.status().map_err(spawn_error(&cmd))?;
    let seconds = start.elapsed().as_secs_f64();

    if !status.success() {
        return Err(RunError::ExternalProcessFailed {
            program: command.program_name(),
            status: describe(&status),
            log: output.to_path_buf(),
        });
    }
    if !non_empty(output) {
        return Err(RunError::MissingArtifact(output.to_path_buf()));
    }

    Ok(RunResult {
        program: command.program_name(),
        output: output.to_path_buf(),
        exit_code: status.code(),
        seconds,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, body: &str) -> String {
        let path = dir.join("fake_qb.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn serial(executable: String) -> SolverCommand {
        SolverCommand {
            executable,
            launcher: String::new(),
            ..SolverCommand::default()
        }
    }

    #[test]
    fn test_deck_on_stdin_and_output_combined() {
        let dir = TempDir::new().unwrap();
        let exe = script(dir.path(), "cat; echo warning >&2; pwd");
        let input = dir.path().join("gs.in");
        let output = dir.path().join("gs.out");
        fs::write(&input, "set ecut 60\n").unwrap();

        let result = run_ground_state(&serial(exe), &input, &output, 4).unwrap();
        assert_eq!(result.exit_code, Some(0));
        let text = fs::read_to_string(&output).unwrap();
        assert!(text.contains("set ecut 60"));
        assert!(text.contains("warning"));
        let cwd = fs::canonicalize(dir.path()).unwrap();
        assert!(text.contains(cwd.to_str().unwrap()));
    }

    #[test]
    fn test_non_zero_exit() {
        let dir = TempDir::new().unwrap();
        let exe = script(dir.path(), "echo partial; exit 2");
        let input = dir.path().join("gs.in");
        fs::write(&input, "").unwrap();
        let err = run_ground_state(&serial(exe), &input, &dir.path().join("gs.out"), 1)
            .unwrap_err();
        assert!(matches!(err, RunError::ExternalProcessFailed { ref status, .. } if status == "exit code 2"));
    }

    #[test]
    fn test_silent_solver_is_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let exe = script(dir.path(), "exit 0");
        let input = dir.path().join("gs.in");
        fs::write(&input, "").unwrap();
        let err = run_ground_state(&serial(exe), &input, &dir.path().join("gs.out"), 1)
            .unwrap_err();
        assert!(matches!(err, RunError::MissingArtifact(_)));
    }

    #[test]
    fn test_missing_deck() {
        let dir = TempDir::new().unwrap();
        let err = run_ground_state(
            &serial("true".into()),
            &dir.path().join("absent.in"),
            &dir.path().join("gs.out"),
            1,
        )
        .unwrap_err();
        assert!(matches!(err, RunError::Io { .. }));
    }
}
