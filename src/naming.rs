//! Per-point file layout
//!
//! Every sweep point owns one working directory. This module centralises the
//! names of the files that live in it so that the stage runners, the driver
//! and the summary writer agree on where each artifact is.
//!
//! # Example
//!
//! ```
//! use std::path::Path;
//! use cdftsweep::naming::PointLayout;
//!
//! let layout = PointLayout::new(Path::new("sweep/3.5"), "cdft.py");
//! assert_eq!(layout.ground_state_input(), Path::new("sweep/3.5/gs.in"));
//! assert_eq!(layout.coupling_result(), Path::new("sweep/3.5/coupling.out"));
//! ```

use std::path::{Path, PathBuf};

/// Rendered ground-state input deck
pub const GROUND_STATE_INPUT: &str = "gs.in";
/// Combined stdout/stderr of the ground-state run
pub const GROUND_STATE_OUTPUT: &str = "gs.out";
/// Input file handed to the server process
pub const SERVER_INPUT: &str = "qb_cdft.in";
/// Output file written by the server process
pub const SERVER_OUTPUT: &str = "qb_cdft.out";
/// Stdout/stderr of the server process
pub const SERVER_LOG: &str = "server.log";
/// Stdout of the coupling client
pub const COUPLING_RESULT: &str = "coupling.out";
/// Stderr of the coupling client
pub const COUPLING_STDERR: &str = "coupling.err";
/// Default client script name
pub const DEFAULT_CLIENT_SCRIPT: &str = "cdft.py";
/// Sweep summary written to the work root
pub const SWEEP_SUMMARY: &str = "sweep_summary.json";

/// Paths of all artifacts inside one point's working directory.
#[derive(Debug, Clone)]
pub struct PointLayout {
    dir: PathBuf,
    client_script: String,
}

impl PointLayout {
    /// Creates the layout for `dir`, naming the rendered client `client_script`.
    pub fn new(dir: &Path, client_script: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            client_script: client_script.to_string(),
        }
    }

    /// The working directory itself
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a file named `name` inside the working directory
    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// `{dir}/gs.in`
    pub fn ground_state_input(&self) -> PathBuf {
        self.file(GROUND_STATE_INPUT)
    }

    /// `{dir}/gs.out`
    pub fn ground_state_output(&self) -> PathBuf {
        self.file(GROUND_STATE_OUTPUT)
    }

    /// Client script name (relative to the working directory)
    pub fn client_script_name(&self) -> &str {
        &self.client_script
    }

    /// `{dir}/{client_script}`
    pub fn client_script(&self) -> PathBuf {
        self.file(&self.client_script)
    }

    /// `{dir}/qb_cdft.in`
    pub fn server_input(&self) -> PathBuf {
        self.file(SERVER_INPUT)
    }

    /// `{dir}/qb_cdft.out`
    pub fn server_output(&self) -> PathBuf {
        self.file(SERVER_OUTPUT)
    }

    /// `{dir}/server.log`
    pub fn server_log(&self) -> PathBuf {
        self.file(SERVER_LOG)
    }

    /// `{dir}/coupling.out`
    pub fn coupling_result(&self) -> PathBuf {
        self.file(COUPLING_RESULT)
    }

    /// `{dir}/coupling.err`
    pub fn coupling_stderr(&self) -> PathBuf {
        self.file(COUPLING_STDERR)
    }
}

/// Turns a sweep label into a directory name.
///
/// Labels are used verbatim except for path separators and whitespace, which
/// are replaced by `_` so a label can never escape the work root.
pub fn label_dir_name(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c == '/' || c == '\\' || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("point_{}", cleaned.replace('.', "_")),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = PointLayout::new(Path::new("/scratch/4.0"), "run_cdft.py");
        assert_eq!(layout.dir(), Path::new("/scratch/4.0"));
        assert_eq!(layout.ground_state_output(), Path::new("/scratch/4.0/gs.out"));
        assert_eq!(layout.client_script(), Path::new("/scratch/4.0/run_cdft.py"));
        assert_eq!(layout.client_script_name(), "run_cdft.py");
        assert_eq!(layout.server_input(), Path::new("/scratch/4.0/qb_cdft.in"));
        assert_eq!(layout.server_output(), Path::new("/scratch/4.0/qb_cdft.out"));
        assert_eq!(layout.server_log(), Path::new("/scratch/4.0/server.log"));
        assert_eq!(layout.coupling_stderr(), Path::new("/scratch/4.0/coupling.err"));
    }

    #[test]
    fn test_label_dir_name() {
        assert_eq!(label_dir_name("3.5"), "3.5");
        assert_eq!(label_dir_name(" rot 30 "), "rot_30");
        assert_eq!(label_dir_name("../evil"), ".._evil");
        assert_eq!(label_dir_name(".."), "point___");
        assert_eq!(label_dir_name(""), "point_");
    }
}
