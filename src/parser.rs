//! Sweep input file parsing.
//!
//! cdftsweep input files use a section-based format: sections open with a
//! `*NAME` line and close with a lone `*`; everything outside sections is a
//! `key = value` parameter. `#` starts a comment anywhere on a line.
//!
//! ```text
//! *POINTS
//! 3.5
//! 4.0 4.5
//! 5.0
//! *
//!
//! *VARS
//! ecut = 60
//! *
//!
//! geometry_template = geometry.tmpl
//! geometry_file = geometry.xyz
//! input_template = gs.in.tmpl
//! client_template = cdft.py.tmpl
//! shared_assets = C_ONCV_PBE.xml, H_ONCV_PBE.xml
//! nprocs = 32
//! policy = fail_fast
//! n0 = 1.0
//! ```
//!
//! Instead of `*POINTS`, `discover = in` turns every `<stem>.in` file in the
//! input file's directory into a point labelled `<stem>`.
//!
//! Relative paths are resolved against the directory of the input file, so a
//! sweep can be launched from anywhere.

use crate::config::{ConstraintParams, FailurePolicy, PointSource, SweepConfig};
use crate::naming::DEFAULT_CLIENT_SCRIPT;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

lazy_static! {
    static ref VAR_NAME_RE: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Error type for parsing operations.
#[derive(Error, Debug)]
pub enum ParseError {
    /// I/O error when reading files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Parse error with line number and message
    #[error("line {line}: {message}")]
    Line {
        /// 1-based line number
        line: usize,
        /// What is wrong
        message: String,
    },
    /// Parse error not tied to one line
    #[error("Parse error: {0}")]
    Parse(String),
}

type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    None,
    Points,
    Vars,
}

/// Parses a sweep input file.
///
/// # Errors
///
/// Returns [`ParseError`] if the file cannot be read, a value is malformed,
/// a section is left open, or both `*POINTS` and `discover` are given.
pub fn parse_input(path: &Path) -> Result<SweepConfig> {
    let content = fs::read_to_string(path)?;
    let base_dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parse_str(&content, &base_dir)
}

/// Parses sweep input text, resolving relative paths against `base_dir`.
pub fn parse_str(content: &str, base_dir: &Path) -> Result<SweepConfig> {
    let mut config = SweepConfig {
        base_dir: base_dir.to_path_buf(),
        work_root: base_dir.to_path_buf(),
        geometry_file: "geometry.xyz".to_string(),
        client_script: DEFAULT_CLIENT_SCRIPT.to_string(),
        constraint: ConstraintParams::default(),
        ..SweepConfig::default()
    };
    let mut labels: Vec<String> = Vec::new();
    let mut saw_points = false;
    let mut discover: Option<String> = None;
    let mut variables = BTreeMap::new();

    let mut section = Section::None;
    let mut section_start = 0;

    for (idx, raw) in content.lines().enumerate() {
        let line_no = idx + 1;
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }

        if line == "*" {
            section = Section::None;
            continue;
        }
        if let Some(name) = line.strip_prefix('*') {
            if section != Section::None {
                return Err(ParseError::Line {
                    line: line_no,
                    message: format!("section *{} opened before the previous one was closed", name.trim()),
                });
            }
            section_start = line_no;
            section = match name.trim().to_lowercase().as_str() {
                "points" => {
                    saw_points = true;
                    Section::Points
                }
                "vars" => Section::Vars,
                other => {
                    return Err(ParseError::Line {
                        line: line_no,
                        message: format!("unknown section *{}", other),
                    })
                }
            };
            continue;
        }

        match section {
            Section::Points => {
                for token in line.split(|c: char| c.is_whitespace() || c == ',') {
                    if !token.is_empty() {
                        labels.push(token.to_string());
                    }
                }
            }
            Section::Vars => {
                let (key, value) = split_key_value(line, line_no)?;
                if !VAR_NAME_RE.is_match(key) {
                    return Err(ParseError::Line {
                        line: line_no,
                        message: format!("invalid placeholder name '{}'", key),
                    });
                }
                variables.insert(key.to_string(), value.to_string());
            }
            Section::None => {
                let (key, value) = split_key_value(line, line_no)?;
                parse_parameter(&key.to_lowercase(), value, line_no, &mut config, &mut discover)?;
            }
        }
    }

    if section != Section::None {
        return Err(ParseError::Line {
            line: section_start,
            message: "section is not closed with '*'".into(),
        });
    }

    config.source = match (saw_points, discover) {
        (true, Some(_)) => {
            return Err(ParseError::Parse(
                "give either a *POINTS section or 'discover', not both".into(),
            ))
        }
        (_, Some(extension)) => PointSource::Discover { extension },
        (_, None) => PointSource::Labels(labels),
    };
    config.variables = variables;
    Ok(config)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn split_key_value(line: &str, line_no: usize) -> Result<(&str, &str)> {
    match line.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim(), v.trim())),
        _ => Err(ParseError::Line {
            line: line_no,
            message: format!("expected 'key = value', found '{}'", line),
        }),
    }
}

fn parse_parameter(
    key: &str,
    value: &str,
    line_no: usize,
    config: &mut SweepConfig,
    discover: &mut Option<String>,
) -> Result<()> {
    let invalid = |what: &str| ParseError::Line {
        line: line_no,
        message: format!("invalid {} '{}'", what, value),
    };
    let base = config.base_dir.clone();
    let path = |v: &str| resolve(&base, v);

    match key {
        "geometry_template" => config.geometry_template = Some(path(value)),
        "geometry_file" => {
            if value.is_empty() || value.contains('/') {
                return Err(invalid("geometry file name"));
            }
            config.geometry_file = value.to_string();
        }
        "input_template" => config.input_template = Some(path(value)),
        "client_template" => config.client_template = Some(path(value)),
        "server_template" => config.server_template = Some(path(value)),
        "client_script" => {
            if value.is_empty() || value.contains('/') {
                return Err(invalid("client script name"));
            }
            config.client_script = value.to_string();
        }
        "shared_assets" => {
            config.shared_assets = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(path)
                .collect();
        }
        "discover" => {
            let ext = value.trim_start_matches('.');
            if ext.is_empty() {
                return Err(invalid("deck extension"));
            }
            *discover = Some(ext.to_string());
        }
        "work_root" => config.work_root = path(value),
        "nprocs" => {
            let n: usize = value.parse().map_err(|_| invalid("nprocs"))?;
            if n == 0 {
                return Err(invalid("nprocs"));
            }
            config.nprocs = Some(n);
        }
        "policy" => {
            let policy: FailurePolicy = value.parse().map_err(|message| ParseError::Line {
                line: line_no,
                message,
            })?;
            config.policy = Some(policy);
        }
        "cell_length" => {
            let l: f64 = value.parse().map_err(|_| invalid("cell_length"))?;
            if !(l > 0.0) {
                return Err(invalid("cell_length"));
            }
            config.cell_length = Some(l);
        }
        "optimizer" => config.constraint.optimizer = value.to_string(),
        "n0" => config.constraint.n0 = Some(value.parse().map_err(|_| invalid("n0"))?),
        "v_init" => config.constraint.v_init = value.parse().map_err(|_| invalid("v_init"))?,
        "v_brak" => {
            let bounds: Vec<f64> = value
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|s| !s.is_empty())
                .map(|s| s.trim_matches(|c: char| c == '(' || c == ')').parse::<f64>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| invalid("v_brak"))?;
            match bounds.as_slice() {
                [low, high] if low < high => config.constraint.v_brak = (*low, *high),
                _ => return Err(invalid("v_brak")),
            }
        }
        "n_tol" => config.constraint.n_tol = value.parse().map_err(|_| invalid("n_tol"))?,
        "eps" => config.constraint.eps = value.parse().map_err(|_| invalid("eps"))?,
        _ => {
            return Err(ParseError::Line {
                line: line_no,
                message: format!("unknown parameter '{}'", key),
            })
        }
    }
    Ok(())
}

fn resolve(base: &Path, value: &str) -> PathBuf {
    let p = Path::new(value);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_points_and_parameters() {
        let input = r#"
# dimer sweep
*POINTS
3.5 4.0
4.5, 5.0   # last one
*
input_template = templates/gs.in.tmpl
client_template = /abs/cdft.py.tmpl
shared_assets = C.xml, H.xml
nprocs = 8
policy = continue
v_brak = -2.0, 2.0
n0 = 1
"#;
        let config = parse_str(input, Path::new("/runs/dimer")).unwrap();
        assert_eq!(
            config.source,
            PointSource::Labels(vec!["3.5".into(), "4.0".into(), "4.5".into(), "5.0".into()])
        );
        assert_eq!(
            config.input_template.as_deref(),
            Some(Path::new("/runs/dimer/templates/gs.in.tmpl"))
        );
        assert_eq!(config.client_template.as_deref(), Some(Path::new("/abs/cdft.py.tmpl")));
        assert_eq!(config.shared_assets.len(), 2);
        assert_eq!(config.nprocs, Some(8));
        assert_eq!(config.policy, Some(FailurePolicy::Continue));
        assert_eq!(config.constraint.v_brak, (-2.0, 2.0));
        assert_eq!(config.constraint.n0, Some(1.0));
        assert_eq!(config.work_root, Path::new("/runs/dimer"));
        assert_eq!(config.client_script, "cdft.py");
    }

    #[test]
    fn test_discover_mode() {
        let config = parse_str("discover = .in\nclient_template = c.tmpl\n", Path::new(".")).unwrap();
        assert_eq!(
            config.source,
            PointSource::Discover {
                extension: "in".into()
            }
        );
    }

    #[test]
    fn test_points_and_discover_conflict() {
        let err = parse_str("*POINTS\n3.5\n*\ndiscover = in\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, ParseError::Parse(_)));
    }

    #[test]
    fn test_unclosed_section() {
        let err = parse_str("*POINTS\n3.5\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, ParseError::Line { line: 1, .. }));
    }

    #[test]
    fn test_vars_section() {
        let config = parse_str("*VARS\necut = 60\nCELL = 40.0 40.0 60.0\n*\n", Path::new(".")).unwrap();
        assert_eq!(config.variables.get("ecut").map(String::as_str), Some("60"));
        assert_eq!(config.variables.get("CELL").map(String::as_str), Some("40.0 40.0 60.0"));

        let err = parse_str("*VARS\nbad-name = 1\n*\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, ParseError::Line { line: 2, .. }));
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse_str("nprocs = 0\n", Path::new(".")).is_err());
        assert!(parse_str("nprocs = many\n", Path::new(".")).is_err());
        assert!(parse_str("v_brak = 1.0, -1.0\n", Path::new(".")).is_err());
        assert!(parse_str("cell_length = -4\n", Path::new(".")).is_err());
        assert!(parse_str("policy = sometimes\n", Path::new(".")).is_err());
        assert!(parse_str("geometry_file = a/b.xyz\n", Path::new(".")).is_err());
        assert!(parse_str("just some words\n", Path::new(".")).is_err());
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let err = parse_str("nprocs = 4
plicy = continue
", Path::new(".")).unwrap_err();
        assert!(matches!(err, ParseError::Line { line: 2, .. }));
        assert!(err.to_string().contains("plicy"));

        let err = parse_str("*POINT
3.5
*
", Path::new(".")).unwrap_err();
        assert!(matches!(err, ParseError::Line { line: 1, .. }));
    }
}
