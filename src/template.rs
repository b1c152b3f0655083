//! Placeholder substitution for geometry files, solver decks and client scripts.
//!
//! Templates are plain text with named placeholders of the form `{{NAME}}`,
//! where `NAME` matches `[A-Za-z_][A-Za-z0-9_]*`. Rendering replaces every
//! placeholder with the string form of its mapped value and leaves all other
//! bytes untouched, so numeric formatting elsewhere in a solver deck survives
//! verbatim.
//!
//! # Checks
//!
//! Rendering fails before producing any text when a placeholder present in the
//! template has no value ([`TemplateError::MissingPlaceholderValue`]). After
//! substitution the output is scanned for anything that still looks like a
//! placeholder (`{{...}}`); a survivor, typically a typo such as
//! `{{ GRID_N1 }}` or `{{GRID-N1}}`, fails with
//! [`TemplateError::UnresolvedPlaceholder`].
//!
//! Rendering never touches the filesystem. Writing the result is done
//! separately with [`write_artifact`], which only runs after a successful
//! render, so a failed render leaves no partial file behind.
//!
//! # Example
//!
//! ```
//! use cdftsweep::template::Template;
//! use std::collections::HashMap;
//!
//! let template = Template::new("geometry", "C 0.0 0.0 {{DISTANCE}}\n");
//! let mut values = HashMap::new();
//! values.insert("DISTANCE".to_string(), "3.5".to_string());
//! assert_eq!(template.render(&values).unwrap(), "C 0.0 0.0 3.5\n");
//! ```

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Placeholder for the raw sweep label (e.g. `3.5` or a deck base name).
pub const LABEL: &str = "LABEL";
/// Placeholder for the distance as written in the sweep input (angstrom).
pub const DISTANCE: &str = "DISTANCE";
/// Placeholder for the distance in the solver's native unit (bohr).
pub const DISTANCE_BOHR: &str = "DISTANCE_BOHR";
/// Placeholder for the fractional displacement along the cell axis.
pub const FRACTIONAL: &str = "FRACTIONAL";
/// Placeholder for the rendered geometry file name.
pub const GEOMETRY_FILE: &str = "GEOMETRY_FILE";
/// Placeholder for the first FFT grid dimension.
pub const GRID_N1: &str = "GRID_N1";
/// Placeholder for the second FFT grid dimension.
pub const GRID_N2: &str = "GRID_N2";
/// Placeholder for the third FFT grid dimension.
pub const GRID_N3: &str = "GRID_N3";
/// Placeholder for the worker process count.
pub const NPROCS: &str = "NPROCS";
/// Placeholder for the constraint optimizer name.
pub const OPTIMIZER: &str = "OPTIMIZER";
/// Placeholder for the constraint target electron number.
pub const N0: &str = "N0";
/// Placeholder for the initial constraint potential.
pub const V_INIT: &str = "V_INIT";
/// Placeholder for the lower bracket of the constraint potential.
pub const V_BRAK_LOW: &str = "V_BRAK_LOW";
/// Placeholder for the upper bracket of the constraint potential.
pub const V_BRAK_HIGH: &str = "V_BRAK_HIGH";
/// Placeholder for the electron-number convergence tolerance.
pub const N_TOL: &str = "N_TOL";
/// Placeholder for the weight-function density cutoff.
pub const EPS: &str = "EPS";

lazy_static! {
    // Well-formed placeholder: {{NAME}}
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").unwrap();

    // Anything that still looks like a placeholder after rendering
    static ref LEFTOVER_RE: Regex = Regex::new(r"\{\{[^{}\n]*\}\}").unwrap();
}

/// Errors raised while loading, rendering or writing templates.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// The template references placeholders that have no value
    #[error("template '{template}' has no value for placeholder(s): {}", .names.join(", "))]
    MissingPlaceholderValue {
        /// Template name (usually its file name)
        template: String,
        /// Every placeholder without a value, sorted
        names: Vec<String>,
    },
    /// A placeholder-looking token survived substitution
    #[error("template '{template}' left unresolved placeholder '{token}' after rendering")]
    UnresolvedPlaceholder {
        /// Template name (usually its file name)
        template: String,
        /// The first surviving token
        token: String,
    },
    /// Template file could not be read or the artifact could not be written
    #[error("IO error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
}

type Result<T> = std::result::Result<T, TemplateError>;

/// Immutable template text with its set of placeholder names.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    text: String,
    placeholders: BTreeSet<String>,
}

impl Template {
    /// Creates a template from in-memory text.
    ///
    /// `name` only shows up in error messages.
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let placeholders = PLACEHOLDER_RE
            .captures_iter(&text)
            .map(|caps| caps[1].to_string())
            .collect();
        Self {
            name: name.into(),
            text,
            placeholders,
        }
    }

    /// Reads a template from disk. The file name becomes the template name.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("template")
            .to_string();
        Ok(Self::new(name, text))
    }

    /// Template name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw template text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Placeholder names referenced by the template, sorted and unique.
    pub fn placeholders(&self) -> impl Iterator<Item = &str> {
        self.placeholders.iter().map(String::as_str)
    }

    /// Returns true when the template references `name`.
    pub fn uses(&self, name: &str) -> bool {
        self.placeholders.contains(name)
    }

    /// Renders the template with `values`. See [`render`].
    pub fn render(&self, values: &HashMap<String, String>) -> Result<String> {
        render(self, values)
    }
}

/// Substitutes every placeholder of `template` with its value from `values`.
///
/// Entries of `values` that the template does not reference are ignored.
///
/// # Errors
///
/// - [`TemplateError::MissingPlaceholderValue`] if any placeholder has no entry.
/// - [`TemplateError::UnresolvedPlaceholder`] if a `{{...}}` token remains in the output.
pub fn render(template: &Template, values: &HashMap<String, String>) -> Result<String> {
    let missing: Vec<String> = template
        .placeholders
        .iter()
        .filter(|name| !values.contains_key(*name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(TemplateError::MissingPlaceholderValue {
            template: template.name.clone(),
            names: missing,
        });
    }

    let rendered = PLACEHOLDER_RE.replace_all(&template.text, |caps: &Captures| {
        // presence checked above
        values[&caps[1]].clone()
    });

    if let Some(token) = LEFTOVER_RE.find(&rendered) {
        return Err(TemplateError::UnresolvedPlaceholder {
            template: template.name.clone(),
            token: token.as_str().to_string(),
        });
    }

    Ok(rendered.into_owned())
}

/// Writes a rendered artifact to `path`.
///
/// The text goes to a hidden temporary file in the same directory first and is
/// then renamed into place, so readers never observe a half-written artifact.
/// Parent directories are created as needed.
pub fn write_artifact(path: &Path, text: &str) -> Result<()> {
    let io_err = |source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    let mut file = fs::File::create(&tmp).map_err(io_err)?;
    file.write_all(text.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_replaces_every_occurrence() {
        let t = Template::new("deck", "a={{X}} b={{Y}} again={{X}}");
        let out = t.render(&values(&[("X", "1.50"), ("Y", "abc")])).unwrap();
        assert_eq!(out, "a=1.50 b=abc again=1.50");
    }

    #[test]
    fn test_render_without_placeholders_is_identity() {
        let text = "ecutwfc = 60.0\n  celldm(1) = 1.0E+01 {not a placeholder}\n";
        let t = Template::new("plain", text);
        assert_eq!(t.placeholders().count(), 0);
        assert_eq!(t.render(&HashMap::new()).unwrap(), text);
    }

    #[test]
    fn test_excess_values_are_ignored() {
        let t = Template::new("geom", "z = {{DISTANCE_BOHR}}");
        let out = t
            .render(&values(&[("DISTANCE_BOHR", "6.61404096"), ("GRID_N1", "40")]))
            .unwrap();
        assert_eq!(out, "z = 6.61404096");
    }

    #[test]
    fn test_missing_value_reports_all_names() {
        let t = Template::new("cdft.py", "{{GRID_N1}} {{GRID_N2}} {{GRID_N3}}");
        let err = t.render(&values(&[("GRID_N2", "40")])).unwrap_err();
        match err {
            TemplateError::MissingPlaceholderValue { template, names } => {
                assert_eq!(template, "cdft.py");
                assert_eq!(names, vec!["GRID_N1".to_string(), "GRID_N3".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_misspelled_token_is_unresolved() {
        let t = Template::new("cdft.py", "n1 = {{GRID_N1}}\nn2 = {{ GRID_N2 }}\n");
        let err = t
            .render(&values(&[("GRID_N1", "40"), ("GRID_N2", "40")]))
            .unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UnresolvedPlaceholder { ref token, .. } if token == "{{ GRID_N2 }}"
        ));
    }

    #[test]
    fn test_placeholders_are_unique_and_sorted() {
        let t = Template::new("t", "{{B}}{{A}}{{B}}");
        let names: Vec<&str> = t.placeholders().collect();
        assert_eq!(names, vec!["A", "B"]);
        assert!(t.uses("A"));
        assert!(!t.uses("C"));
    }

    #[test]
    fn test_failed_render_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("gs.in");
        let t = Template::new("gs.in", "{{DISTANCE}}");
        let result = t.render(&HashMap::new()).and_then(|text| write_artifact(&target, &text));
        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_artifact_creates_parents_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("3.5").join("gs.in");
        write_artifact(&target, "first").unwrap();
        write_artifact(&target, "second").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "second");
        assert_eq!(fs::read_dir(target.parent().unwrap()).unwrap().count(), 1);
    }
}
