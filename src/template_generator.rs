//! Starter files for a new sweep
//!
//! `cdftsweep ci <file>` writes a commented sweep input plus the three
//! templates it refers to, so a new user has a working skeleton to edit.
//! Existing files are never overwritten.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Starter geometry template (XYZ, angstrom)
pub const GEOMETRY_TEMPLATE_NAME: &str = "geometry.tmpl";
/// Starter ground-state deck template
pub const INPUT_TEMPLATE_NAME: &str = "gs.in.tmpl";
/// Starter coupling client template
pub const CLIENT_TEMPLATE_NAME: &str = "cdft.py.tmpl";

/// Generates the starter sweep input text.
pub fn generate_sweep_input() -> String {
    format!(
        r#"# cdftsweep input file
#
# Each point below gets its own working directory (work_root/<label>).
# Labels are distances in angstrom; {{{{DISTANCE}}}} and {{{{DISTANCE_BOHR}}}}
# are available in every template.

*POINTS
3.5
4.0
4.5
5.0
*

# User placeholders, available as {{{{name}}}} in every template
*VARS
ecut = 60
*

# Templates (paths relative to this file)
geometry_template = {geometry}
geometry_file = geometry.xyz
input_template = {input}
client_template = {client}
# server_template = qb_cdft.in.tmpl
# client_script = cdft.py

# Pseudopotentials and other files copied into every point directory
# shared_assets = C_ONCV_PBE-1.0.xml

# Alternative to *POINTS: run every <name>.in deck in this directory
# discover = in

work_root = .
nprocs = 4
policy = fail_fast
cell_length = 60.0

# Constraint parameters rendered into the client script
optimizer = secant
n0 = 1.0
v_init = 0.0
v_brak = -1.0, 1.0
n_tol = 1e-3
eps = 1e-6
"#,
        geometry = GEOMETRY_TEMPLATE_NAME,
        input = INPUT_TEMPLATE_NAME,
        client = CLIENT_TEMPLATE_NAME,
    )
}

/// Generates the starter geometry template: an ethylene dimer separated along z.
pub fn generate_geometry_template() -> String {
    r#"12
ethylene dimer, d = {{DISTANCE}} A
C    -0.66500   0.00000   0.00000
C     0.66500   0.00000   0.00000
H    -1.23700   0.92500   0.00000
H    -1.23700  -0.92500   0.00000
H     1.23700   0.92500   0.00000
H     1.23700  -0.92500   0.00000
C    -0.66500   0.00000   {{DISTANCE}}
C     0.66500   0.00000   {{DISTANCE}}
H    -1.23700   0.92500   {{DISTANCE}}
H    -1.23700  -0.92500   {{DISTANCE}}
H     1.23700   0.92500   {{DISTANCE}}
H     1.23700  -0.92500   {{DISTANCE}}
"#
    .to_string()
}

/// Generates the starter ground-state deck template.
pub fn generate_input_template() -> String {
    r#"# ground state for point {{LABEL}} ({{NPROCS}} workers)
set cell 40 0 0  0 40 0  0 0 60
species carbon C_ONCV_PBE-1.0.xml
species hydrogen H_ONCV_PBE-1.0.xml
# edit: one 'atom' command per atom, coordinates in bohr
atom C1 carbon -1.25666 0.0 0.0
atom C2 carbon  1.25666 0.0 0.0
atom C3 carbon -1.25666 0.0 {{DISTANCE_BOHR}}
atom C4 carbon  1.25666 0.0 {{DISTANCE_BOHR}}
set ecut {{ecut}}
set xc PBE
set wf_dyn PSDA
set scf_tol 1.0e-8
randomize_wf
run 0 100 5
save gs.xml
"#
    .to_string()
}

/// Generates the starter coupling client template.
pub fn generate_client_template() -> String {
    r#"from ase.io import read
from pycdft import *

cell = read("{{GEOMETRY_FILE}}")
sample = Sample(ase_cell=cell, n1={{GRID_N1}}, n2={{GRID_N2}}, n3={{GRID_N3}}, vspin=1)

qboxdriver = QboxDriver(
    sample=sample,
    init_cmd="load gs.xml\nset xc PBE\nset wf_dyn PSDA\nset scf_tol 1.0E-8\n",
    scf_cmd="run 0 50 5",
)

solver1 = CDFTSolver(job="scf", optimizer="{{OPTIMIZER}}", sample=sample, dft_driver=qboxdriver)
solver2 = solver1.copy()

# edit: donor and acceptor atoms
for solver, n0 in ((solver1, {{N0}}), (solver2, -{{N0}})):
    ChargeTransferConstraint(
        sample=solver.sample,
        donor=Fragment(solver.sample, solver.sample.atoms[0:6]),
        acceptor=Fragment(solver.sample, solver.sample.atoms[6:12]),
        V_init={{V_INIT}},
        V_brak=({{V_BRAK_LOW}}, {{V_BRAK_HIGH}}),
        N0=n0,
        N_tol={{N_TOL}},
        eps={{EPS}},
    )

solver1.solve()
solver2.solve()
compute_elcoupling(solver1, solver2)
"#
    .to_string()
}

fn write_new(path: &Path, content: &str) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    fs::write(path, content)?;
    Ok(true)
}

/// Writes the starter sweep input to `path` and the templates next to it.
///
/// Returns the files actually written. Fails if `path` already exists;
/// templates that already exist are left alone.
pub fn write_starter_files<P: AsRef<Path>>(path: P) -> io::Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", path.display()),
        ));
    }
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut written = Vec::new();
    let files = [
        (path.to_path_buf(), generate_sweep_input()),
        (dir.join(GEOMETRY_TEMPLATE_NAME), generate_geometry_template()),
        (dir.join(INPUT_TEMPLATE_NAME), generate_input_template()),
        (dir.join(CLIENT_TEMPLATE_NAME), generate_client_template()),
    ];
    for (file, content) in files {
        if write_new(&file, &content)? {
            written.push(file);
        }
    }
    Ok(written)
}

/// Returns the default starter file name when `ci` is given a directory.
pub fn get_default_output_path<P: AsRef<Path>>(target: P) -> PathBuf {
    let target = target.as_ref();
    if target.is_dir() {
        target.join("sweep.inp")
    } else {
        target.to_path_buf()
    }
}
