//! End-to-end sweeps against a fake solver written in shell.
#![cfg(unix)]

use cdftsweep::driver::{run_sweep, PointStatus, ProcessPipeline};
use cdftsweep::parser::parse_input;
use cdftsweep::point::build_points;
use cdftsweep::settings::Settings;
use cdftsweep::validation::validate_sweep;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

/// Batch mode prints the grid report unless the deck asks for silence;
/// server mode records its pid, reports readiness and blocks.
const FAKE_SOLVER: &str = r#"#!/bin/sh
if [ "$1" = "-server" ]; then
    echo $$ > server.pid
    echo "server ready"
    exec sleep 60
fi
deck=$(cat)
case "$deck" in
    *SILENT*) exit 0 ;;
esac
echo "$deck"
echo "  <np0v> 40 </np0v> <np1v> 40 </np1v> <np2v> 60 </np2v>"
echo "  <etotal> -31.9 </etotal>"
"#;

const CLIENT_OK: &str = r#"echo "sample grid {{GRID_N1}} {{GRID_N2}} {{GRID_N3}}"
echo "|Hab| (H): 1.5e-3"
echo "|Hab| (mH): 1.5"
"#;

const CLIENT_FAIL: &str = "echo 'solver diverged' >&2\nexit 1\n";

struct Sweep {
    dir: TempDir,
    settings: Settings,
}

fn setup(points: &str, deck: &str, client: &str, policy: &str) -> Sweep {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    let solver = root.join("fake_qb.sh");
    fs::write(&solver, FAKE_SOLVER).unwrap();
    fs::set_permissions(&solver, fs::Permissions::from_mode(0o755)).unwrap();

    fs::write(root.join("geometry.tmpl"), "C 0 0 0\nC 0 0 {{LABEL}}\n").unwrap();
    fs::write(root.join("gs.in.tmpl"), deck).unwrap();
    fs::write(root.join("cdft.sh.tmpl"), client).unwrap();
    fs::write(root.join("C_ONCV_PBE-1.0.xml"), "<pseudo/>").unwrap();
    fs::write(
        root.join("sweep.inp"),
        format!(
            "*POINTS\n{}\n*\n\
             geometry_template = geometry.tmpl\n\
             input_template = gs.in.tmpl\n\
             client_template = cdft.sh.tmpl\n\
             client_script = cdft.sh\n\
             shared_assets = C_ONCV_PBE-1.0.xml\n\
             work_root = runs\n\
             nprocs = 2\n\
             policy = {}\n",
            points, policy
        ),
    )
    .unwrap();

    let mut settings = Settings::default();
    settings.solver.executable = solver.to_string_lossy().into_owned();
    settings.solver.launcher = String::new();
    settings.client.interpreter = "/bin/sh".to_string();
    settings.server.ready_marker = "server ready".to_string();
    settings.server.poll_interval_ms = 20;
    settings.server.readiness_timeout = 10.0;
    settings.server.shutdown_grace = 0.2;

    Sweep { dir, settings }
}

fn alive(pid_file: &Path) -> bool {
    let pid = fs::read_to_string(pid_file).unwrap();
    Command::new("kill")
        .arg("-0")
        .arg(pid.trim())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

const DECK: &str = "load {{GEOMETRY_FILE}}\nset d {{DISTANCE_BOHR}}\nrun 0 100 5\n";

#[test]
fn test_single_point_end_to_end() {
    let sweep = setup("5.0", DECK, CLIENT_OK, "fail_fast");
    let config = parse_input(&sweep.dir.path().join("sweep.inp")).unwrap();
    let points = build_points(&config).unwrap();
    validate_sweep(&config, &points).unwrap();

    let mut pipeline = ProcessPipeline::new(&config, &sweep.settings, 2).unwrap();
    let report = run_sweep(&points, &mut pipeline, config.policy.unwrap());
    assert!(report.is_success(), "{:?}", report.points[0].error);

    let point_dir = sweep.dir.path().join("runs").join("5.0");
    let script = fs::read_to_string(point_dir.join("cdft.sh")).unwrap();
    assert!(script.contains("sample grid 40 40 60"));

    let geometry = fs::read_to_string(point_dir.join("geometry.xyz")).unwrap();
    assert_eq!(geometry, "C 0 0 0\nC 0 0 5.0\n");
    let deck = fs::read_to_string(point_dir.join("gs.in")).unwrap();
    assert!(deck.contains("load geometry.xyz"));
    assert!(deck.contains("set d 9.44862994"));
    assert!(point_dir.join("C_ONCV_PBE-1.0.xml").exists());
    assert!(point_dir.join("qb_cdft.in").exists());

    let result = fs::read_to_string(point_dir.join("coupling.out")).unwrap();
    assert!(!result.is_empty());
    let outcome = &report.points[0];
    assert_eq!(outcome.grid.map(|g| (g.n1, g.n2, g.n3)), Some((40, 40, 60)));
    assert_eq!(outcome.coupling.map(|c| c.hartree), Some(1.5e-3));

    assert!(!alive(&point_dir.join("server.pid")));
}

#[test]
fn test_failing_client_terminates_server() {
    let sweep = setup("4.0", DECK, CLIENT_FAIL, "fail_fast");
    let config = parse_input(&sweep.dir.path().join("sweep.inp")).unwrap();
    let points = build_points(&config).unwrap();

    let mut pipeline = ProcessPipeline::new(&config, &sweep.settings, 2).unwrap();
    let report = run_sweep(&points, &mut pipeline, config.policy.unwrap());
    assert_eq!(report.points[0].status, PointStatus::Stage2Failed);

    let point_dir = sweep.dir.path().join("runs").join("4.0");
    let stderr = fs::read_to_string(point_dir.join("coupling.err")).unwrap();
    assert!(stderr.contains("solver diverged"));
    assert!(!alive(&point_dir.join("server.pid")));
}

#[test]
fn test_fail_fast_skips_later_points() {
    let deck = "{{LABEL}}\n";
    let sweep = setup("SILENT\n4.0", deck, CLIENT_OK, "fail_fast");
    let config = parse_input(&sweep.dir.path().join("sweep.inp")).unwrap();
    let points = build_points(&config).unwrap();

    let mut pipeline = ProcessPipeline::new(&config, &sweep.settings, 2).unwrap();
    let report = run_sweep(&points, &mut pipeline, config.policy.unwrap());
    let statuses: Vec<PointStatus> = report.points.iter().map(|p| p.status).collect();
    assert_eq!(statuses, vec![PointStatus::Stage1Failed, PointStatus::NotRun]);
    assert!(!sweep.dir.path().join("runs").join("4.0").exists());
}

#[test]
fn test_continue_runs_remaining_points() {
    let deck = "{{LABEL}}\n";
    let sweep = setup("SILENT\n4.0", deck, CLIENT_OK, "continue");
    let config = parse_input(&sweep.dir.path().join("sweep.inp")).unwrap();
    let points = build_points(&config).unwrap();

    let mut pipeline = ProcessPipeline::new(&config, &sweep.settings, 2).unwrap();
    let report = run_sweep(&points, &mut pipeline, config.policy.unwrap());
    let statuses: Vec<PointStatus> = report.points.iter().map(|p| p.status).collect();
    assert_eq!(statuses, vec![PointStatus::Stage1Failed, PointStatus::Ok]);
    assert_eq!(report.failures(), 1);
    assert!(sweep
        .dir
        .path()
        .join("runs")
        .join("4.0")
        .join("coupling.out")
        .exists());
}
