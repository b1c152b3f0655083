//! External program plumbing shared by both stages.
//!
//! This module builds solver command lines, describes finished runs and owns
//! the long-lived server process of the coupling stage.
//!
//! # Command Lines
//!
//! [`SolverCommand`] produces the two solver invocations used by a sweep:
//!
//! - batch: `[launcher np_flag N] executable` (deck on stdin)
//! - server: `[launcher np_flag N] executable server_flag <input> <output>`
//!
//! An empty launcher drops the `launcher np_flag N` prefix, which is how a
//! serial build or a wrapper script is run.
//!
//! # Server Lifecycle
//!
//! [`ServerHandle`] wraps the spawned server. Readiness is decided by bounded
//! polling ([`ServerHandle::wait_ready`]) rather than a fixed sleep; the
//! handle is shut down explicitly with [`ServerHandle::shutdown`], and the
//! `Drop` implementation kills the server's process group on every other exit
//! path so no server outlives its point. [`install_interrupt_handler`]
//! forwards Ctrl-C to running servers.

use crate::template::TemplateError;
use lazy_static::lazy_static;
#[cfg(unix)]
use nix::errno::Errno;
#[cfg(unix)]
use nix::sys::signal::{killpg, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use serde::Serialize;
use std::fs::{self, File};
use std::io;
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors raised while running external programs.
#[derive(Error, Debug)]
pub enum RunError {
    /// File system error around a run
    #[error("IO error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },
    /// The program could not be started at all
    #[error("failed to start '{program}': {source}")]
    Spawn {
        /// Program name
        program: String,
        /// Underlying error
        source: io::Error,
    },
    /// The program exited unsuccessfully
    #[error("'{program}' exited with {status} (see {})", .log.display())]
    ExternalProcessFailed {
        /// Program name
        program: String,
        /// Exit status description
        status: String,
        /// Where its output went
        log: PathBuf,
    },
    /// An expected output file is missing or empty
    #[error("expected artifact missing or empty: {}", .0.display())]
    MissingArtifact(PathBuf),
    /// The server did not signal readiness in time
    #[error("server not ready after {timeout:?} (see {})", .log.display())]
    ServerNotReady {
        /// Readiness timeout that elapsed
        timeout: Duration,
        /// Server log
        log: PathBuf,
    },
    /// The server exited while it was expected to serve requests
    #[error("server exited unexpectedly with {status} (see {})", .log.display())]
    ServerCrashed {
        /// Exit status description
        status: String,
        /// Server log
        log: PathBuf,
    },
    /// Rendering the client script or server input failed
    #[error(transparent)]
    Template(#[from] TemplateError),
}

type Result<T> = std::result::Result<T, RunError>;

/// Solver invocation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverCommand {
    /// Solver executable (e.g. `qb`)
    pub executable: String,
    /// Parallel launcher (e.g. `mpirun`, `srun`); empty for none
    pub launcher: String,
    /// Launcher flag taking the process count (e.g. `-np`)
    pub np_flag: String,
    /// Solver flag selecting server mode (e.g. `-server`)
    pub server_flag: String,
}

impl Default for SolverCommand {
    fn default() -> Self {
        Self {
            executable: "qb".to_string(),
            launcher: "mpirun".to_string(),
            np_flag: "-np".to_string(),
            server_flag: "-server".to_string(),
        }
    }
}

impl SolverCommand {
    /// Command for a blocking batch run with `nprocs` workers.
    pub fn batch(&self, nprocs: usize) -> Command {
        self.base(nprocs)
    }

    /// Command for a server run reading `input` and writing `output`.
    pub fn server(&self, nprocs: usize, input: &str, output: &str) -> Command {
        let mut cmd = self.base(nprocs);
        if !self.server_flag.is_empty() {
            cmd.arg(&self.server_flag);
        }
        cmd.arg(input).arg(output);
        cmd
    }

    /// Name used for this program in diagnostics.
    pub fn program_name(&self) -> String {
        if self.launcher.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.launcher, self.executable)
        }
    }

    fn base(&self, nprocs: usize) -> Command {
        if self.launcher.is_empty() {
            Command::new(&self.executable)
        } else {
            let mut cmd = Command::new(&self.launcher);
            if !self.np_flag.is_empty() {
                cmd.arg(&self.np_flag).arg(nprocs.to_string());
            }
            cmd.arg(&self.executable);
            cmd
        }
    }
}

/// Parameters of the server readiness poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessProbe {
    /// Maximum time to wait for readiness after the warm-up
    pub timeout: Duration,
    /// Delay between two checks
    pub poll_interval: Duration,
    /// Unconditional wait before polling starts
    pub min_warmup: Duration,
    /// Text whose appearance signals readiness; any output when `None`
    pub marker: Option<String>,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            poll_interval: Duration::from_millis(500),
            min_warmup: Duration::ZERO,
            marker: None,
        }
    }
}

/// Record of one finished external run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// Program description
    pub program: String,
    /// Primary output file
    pub output: PathBuf,
    /// Exit code, `None` when terminated by a signal
    pub exit_code: Option<i32>,
    /// Wall time in seconds
    pub seconds: f64,
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> RunError + '_ {
    move |source| RunError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub(crate) fn spawn_error(cmd: &Command) -> impl FnOnce(io::Error) -> RunError + '_ {
    move |source| RunError::Spawn {
        program: cmd.get_program().to_string_lossy().into_owned(),
        source,
    }
}

/// Returns true when `path` exists and has a non-zero length.
pub fn non_empty(path: &Path) -> bool {
    fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

pub(crate) fn describe(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => status.to_string(),
    }
}

lazy_static! {
    /// Process groups of servers that are currently running.
    static ref SERVER_GROUPS: Mutex<Vec<u32>> = Mutex::new(Vec::new());
}

fn register_group(pgid: u32) {
    if let Ok(mut groups) = SERVER_GROUPS.lock() {
        groups.push(pgid);
    }
}

fn unregister_group(pgid: u32) {
    if let Ok(mut groups) = SERVER_GROUPS.lock() {
        groups.retain(|&g| g != pgid);
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) {
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::debug!("{:?} to process group {} failed: {}", signal, pgid, e),
    }
}

/// Forwards Ctrl-C to every running server, then exits with status 130.
///
/// Servers run in their own process group, so a terminal interrupt does not
/// reach them by itself. Call once at start-up.
pub fn install_interrupt_handler() -> std::result::Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| {
        let groups = SERVER_GROUPS
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default();
        log::warn!("interrupted, stopping {} server(s)", groups.len());
        #[cfg(unix)]
        {
            for &pgid in &groups {
                signal_group(pgid, Signal::SIGTERM);
            }
            if !groups.is_empty() {
                thread::sleep(Duration::from_millis(500));
            }
            for &pgid in &groups {
                signal_group(pgid, Signal::SIGKILL);
            }
        }
        std::process::exit(130);
    })
}

/// A running solver server.
///
/// On Unix the server leads its own process group and every signal goes to
/// the whole group, which also reaches processes forked by a launcher such as
/// `mpirun`.
#[derive(Debug)]
pub struct ServerHandle {
    child: Option<Child>,
    pgid: u32,
    log: PathBuf,
    output: PathBuf,
}

impl ServerHandle {
    /// Spawns `cmd` in `working_dir` with stdout and stderr appended to `log`.
    ///
    /// `output` is the file the server writes its own results to; it is
    /// watched during the readiness poll alongside the log.
    pub fn spawn(mut cmd: Command, working_dir: &Path, log: &Path, output: &Path) -> Result<Self> {
        let log_file = File::create(log).map_err(io_error(log))?;
        let err_file = log_file.try_clone().map_err(io_error(log))?;
        cmd.current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(err_file));
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(spawn_error(&cmd))?;
        let pgid = child.id();
        register_group(pgid);
        log::debug!("server started with pid {}", pgid);
        Ok(Self {
            child: Some(child),
            pgid,
            log: log.to_path_buf(),
            output: output.to_path_buf(),
        })
    }

    /// Process id of the server, if it has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Server log path
    pub fn log(&self) -> &Path {
        &self.log
    }

    /// Non-blocking exit check. `Some(status)` once the server has exited.
    pub fn try_status(&mut self) -> Result<Option<ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child.try_wait().map_err(io_error(&self.log)),
            None => Ok(None),
        }
    }

    /// Fails with [`RunError::ServerCrashed`] if the server has exited.
    pub fn ensure_alive(&mut self) -> Result<()> {
        match self.try_status()? {
            Some(status) => Err(RunError::ServerCrashed {
                status: describe(&status),
                log: self.log.clone(),
            }),
            None => Ok(()),
        }
    }

    fn ready_marker_seen(&self, marker: Option<&str>) -> bool {
        [&self.log, &self.output].iter().any(|path| match marker {
            Some(marker) => fs::read(path)
                .map(|bytes| String::from_utf8_lossy(&bytes).contains(marker))
                .unwrap_or(false),
            None => non_empty(path),
        })
    }

    /// Waits until the server signals readiness.
    ///
    /// After the probe's warm-up the server log and output file are polled
    /// every `poll_interval` until the marker appears (any output when no
    /// marker is configured), the server exits, or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - [`RunError::ServerCrashed`] if the server exits while waiting.
    /// - [`RunError::ServerNotReady`] on timeout.
    pub fn wait_ready(&mut self, probe: &ReadinessProbe) -> Result<()> {
        if !probe.min_warmup.is_zero() {
            thread::sleep(probe.min_warmup);
        }
        let deadline = Instant::now() + probe.timeout;
        loop {
            self.ensure_alive()?;
            if self.ready_marker_seen(probe.marker.as_deref()) {
                log::debug!("server reported ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(RunError::ServerNotReady {
                    timeout: probe.timeout,
                    log: self.log.clone(),
                });
            }
            thread::sleep(probe.poll_interval);
        }
    }

    /// Stops the server.
    ///
    /// The server gets `grace` to exit on its own (it normally stops once the
    /// client has closed the session). After that its process group receives
    /// SIGTERM, then SIGKILL once another `grace` has passed. Processes left
    /// in the group after the leader exited are killed too. The leader is
    /// reaped before this returns.
    pub fn shutdown(mut self, grace: Duration) -> Result<Option<ExitStatus>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        let result = self.stop(&mut child, grace);
        self.kill_group();
        unregister_group(self.pgid);
        result
    }

    fn stop(&self, child: &mut Child, grace: Duration) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.wait_for_exit(child, grace)? {
            log::debug!("server exited with {}", describe(&status));
            return Ok(Some(status));
        }
        log::info!("server still running after {:?}, terminating", grace);
        self.terminate_group(child);
        if let Some(status) = self.wait_for_exit(child, grace)? {
            return Ok(Some(status));
        }
        log::info!("server ignored termination, killing");
        self.kill_group();
        if let Err(e) = child.kill() {
            // already gone between the last poll and the kill
            log::debug!("kill failed: {}", e);
        }
        let status = child.wait().map_err(io_error(&self.log))?;
        Ok(Some(status))
    }

    fn wait_for_exit(&self, child: &mut Child, grace: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = child.try_wait().map_err(io_error(&self.log))? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    #[cfg(unix)]
    fn terminate_group(&self, _child: &mut Child) {
        signal_group(self.pgid, Signal::SIGTERM);
    }

    #[cfg(not(unix))]
    fn terminate_group(&self, child: &mut Child) {
        let _ = child.kill();
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        signal_group(self.pgid, Signal::SIGKILL);
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            log::warn!("terminating server pid {} on abnormal exit", child.id());
            self.kill_group();
            let _ = child.kill();
            let _ = child.wait();
            unregister_group(self.pgid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_batch_command_with_launcher() {
        let solver = SolverCommand::default();
        let cmd = solver.batch(16);
        assert_eq!(cmd.get_program(), OsStr::new("mpirun"));
        assert_eq!(args(&cmd), vec!["-np", "16", "qb"]);
    }

    #[test]
    fn test_server_command_with_launcher() {
        let solver = SolverCommand::default();
        let cmd = solver.server(4, "qb_cdft.in", "qb_cdft.out");
        assert_eq!(
            args(&cmd),
            vec!["-np", "4", "qb", "-server", "qb_cdft.in", "qb_cdft.out"]
        );
    }

    #[test]
    fn test_commands_without_launcher() {
        let solver = SolverCommand {
            executable: "/opt/qbox/bin/qb".into(),
            launcher: String::new(),
            ..SolverCommand::default()
        };
        let cmd = solver.server(8, "in", "out");
        assert_eq!(cmd.get_program(), OsStr::new("/opt/qbox/bin/qb"));
        assert_eq!(args(&cmd), vec!["-server", "in", "out"]);
        assert!(args(&solver.batch(8)).is_empty());
        assert_eq!(solver.program_name(), "/opt/qbox/bin/qb");
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use tempfile::TempDir;

        fn sh(script: &str) -> Command {
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c").arg(script);
            cmd
        }

        fn fast_probe(marker: Option<&str>) -> ReadinessProbe {
            ReadinessProbe {
                timeout: Duration::from_secs(5),
                poll_interval: Duration::from_millis(20),
                min_warmup: Duration::ZERO,
                marker: marker.map(str::to_string),
            }
        }

        #[test]
        fn test_ready_on_marker_then_shutdown_kills() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("server.log");
            let out = dir.path().join("qb_cdft.out");
            let mut server = ServerHandle::spawn(
                sh("echo starting; sleep 0.1; echo listening; exec sleep 30"),
                dir.path(),
                &log,
                &out,
            )
            .unwrap();
            server.wait_ready(&fast_probe(Some("listening"))).unwrap();
            assert!(server.pid().is_some());
            let status = server.shutdown(Duration::from_millis(100)).unwrap();
            assert!(!status.unwrap().success());
        }

        /// Alive and not a zombie. Polls briefly so orphans can be reaped.
        fn still_running(pid_file: &Path) -> bool {
            let pid = fs::read_to_string(pid_file).unwrap();
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
                thread::sleep(Duration::from_millis(50));
            }
        }

        const FORKING_SERVER: &str = "sleep 30 & echo $! > rank.pid; echo listening; wait";

        #[test]
        fn test_shutdown_kills_forked_children() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("server.log");
            let out = dir.path().join("qb_cdft.out");
            let mut server = ServerHandle::spawn(sh(FORKING_SERVER), dir.path(), &log, &out).unwrap();
            server.wait_ready(&fast_probe(Some("listening"))).unwrap();
            server.shutdown(Duration::from_millis(100)).unwrap();
            assert!(!still_running(&dir.path().join("rank.pid")));
        }

        #[test]
        fn test_drop_kills_forked_children() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("server.log");
            let out = dir.path().join("qb_cdft.out");
            {
                let mut server =
                    ServerHandle::spawn(sh(FORKING_SERVER), dir.path(), &log, &out).unwrap();
                server.wait_ready(&fast_probe(Some("listening"))).unwrap();
            }
            assert!(!still_running(&dir.path().join("rank.pid")));
        }

        #[test]
        fn test_children_left_by_exited_leader_are_killed() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("server.log");
            let out = dir.path().join("qb_cdft.out");
            let server = ServerHandle::spawn(
                sh("sleep 30 > /dev/null 2>&1 & echo $! > rank.pid; echo done > qb_cdft.out"),
                dir.path(),
                &log,
                &out,
            )
            .unwrap();
            let status = server.shutdown(Duration::from_secs(5)).unwrap();
            assert!(status.unwrap().success());
            assert!(!still_running(&dir.path().join("rank.pid")));
        }

        #[test]
        fn test_crash_during_poll() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("server.log");
            let out = dir.path().join("qb_cdft.out");
            let mut server =
                ServerHandle::spawn(sh("exit 3"), dir.path(), &log, &out).unwrap();
            let err = server.wait_ready(&fast_probe(Some("never"))).unwrap_err();
            assert!(matches!(err, RunError::ServerCrashed { .. }));
        }

        #[test]
        fn test_not_ready_times_out() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("server.log");
            let out = dir.path().join("qb_cdft.out");
            let mut server =
                ServerHandle::spawn(sh("exec sleep 30"), dir.path(), &log, &out).unwrap();
            let probe = ReadinessProbe {
                timeout: Duration::from_millis(200),
                ..fast_probe(None)
            };
            let err = server.wait_ready(&probe).unwrap_err();
            assert!(matches!(err, RunError::ServerNotReady { .. }));
        }

        #[test]
        fn test_voluntary_exit_within_grace() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("server.log");
            let out = dir.path().join("qb_cdft.out");
            let server =
                ServerHandle::spawn(sh("echo done > qb_cdft.out"), dir.path(), &log, &out)
                    .unwrap();
            let status = server.shutdown(Duration::from_secs(5)).unwrap();
            assert!(status.unwrap().success());
            assert!(non_empty(&out));
        }

        #[test]
        fn test_spawn_failure() {
            let dir = TempDir::new().unwrap();
            let log = dir.path().join("server.log");
            let out = dir.path().join("qb_cdft.out");
            let err = ServerHandle::spawn(
                Command::new("/nonexistent/solver"),
                dir.path(),
                &log,
                &out,
            )
            .unwrap_err();
            assert!(matches!(err, RunError::Spawn { .. }));
        }
    }
}
