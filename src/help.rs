//! Built-in help for cdftsweep
//!
//! This module documents the sweep input keywords, the template placeholders
//! and the settings file, printed by `cdftsweep --help [topic]`.

use crate::settings::CONFIG_FILE_NAME;
use std::collections::HashMap;

/// Category for organizing keywords in the help system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeywordCategory {
    /// Where the sweep points come from
    Points,
    /// Template and asset files
    Templates,
    /// Worker count, failure policy and directories
    Run,
    /// Constraint parameters handed to the client script
    Constraint,
}

const CATEGORY_ORDER: [KeywordCategory; 4] = [
    KeywordCategory::Points,
    KeywordCategory::Templates,
    KeywordCategory::Run,
    KeywordCategory::Constraint,
];

/// Documentation entry for a single input keyword.
#[derive(Debug, Clone)]
pub struct Keyword {
    /// Keyword name as written in the input file
    pub name: &'static str,
    /// Category the keyword belongs to
    pub category: KeywordCategory,
    /// What the keyword does
    pub description: &'static str,
    /// Default value, if any
    pub default_value: Option<&'static str>,
    /// Example usage
    pub example: Option<&'static str>,
    /// Whether every sweep must set it
    pub required: bool,
}

/// Documentation entry for a template placeholder.
#[derive(Debug, Clone)]
pub struct PlaceholderInfo {
    /// Placeholder name, used as `{{NAME}}`
    pub name: &'static str,
    /// Templates in which the value is available
    pub available_in: &'static str,
    /// What the value is
    pub description: &'static str,
}

/// All input keywords
pub const KEYWORDS: &[Keyword] = &[
    Keyword {
        name: "*POINTS",
        category: KeywordCategory::Points,
        description: "Section listing the sweep points, separated by whitespace, commas or newlines. Numeric labels are distances in angstrom",
        default_value: None,
        example: Some("*POINTS\n3.5 4.0 4.5\n*"),
        required: false,
    },
    Keyword {
        name: "discover",
        category: KeywordCategory::Points,
        description: "Use every <name>.<ext> file next to the input file as a pre-made deck; the point label is <name>. Excludes *POINTS",
        default_value: None,
        example: Some("discover = in"),
        required: false,
    },
    Keyword {
        name: "*VARS",
        category: KeywordCategory::Points,
        description: "Section of user placeholders (name = value) available in every template",
        default_value: None,
        example: Some("*VARS\necut = 60\n*"),
        required: false,
    },
    Keyword {
        name: "input_template",
        category: KeywordCategory::Templates,
        description: "Ground-state deck template, rendered to gs.in in each point directory",
        default_value: None,
        example: Some("input_template = gs.in.tmpl"),
        required: true,
    },
    Keyword {
        name: "client_template",
        category: KeywordCategory::Templates,
        description: "Coupling client script template, rendered after the grid is known",
        default_value: None,
        example: Some("client_template = cdft.py.tmpl"),
        required: true,
    },
    Keyword {
        name: "geometry_template",
        category: KeywordCategory::Templates,
        description: "Geometry file template, rendered to geometry_file in each point directory",
        default_value: None,
        example: Some("geometry_template = geometry.tmpl"),
        required: false,
    },
    Keyword {
        name: "geometry_file",
        category: KeywordCategory::Templates,
        description: "Name of the rendered geometry file ({{GEOMETRY_FILE}})",
        default_value: Some("geometry.xyz"),
        example: None,
        required: false,
    },
    Keyword {
        name: "server_template",
        category: KeywordCategory::Templates,
        description: "Server input template rendered to qb_cdft.in; an empty file is used otherwise",
        default_value: None,
        example: Some("server_template = qb_cdft.in.tmpl"),
        required: false,
    },
    Keyword {
        name: "client_script",
        category: KeywordCategory::Templates,
        description: "Name of the rendered client script",
        default_value: Some("cdft.py"),
        example: None,
        required: false,
    },
    Keyword {
        name: "shared_assets",
        category: KeywordCategory::Templates,
        description: "Comma-separated files copied into every point directory (pseudopotentials, restart files)",
        default_value: None,
        example: Some("shared_assets = C_ONCV_PBE-1.0.xml, H_ONCV_PBE-1.0.xml"),
        required: false,
    },
    Keyword {
        name: "work_root",
        category: KeywordCategory::Run,
        description: "Directory receiving one subdirectory per point",
        default_value: Some("directory of the input file"),
        example: Some("work_root = runs"),
        required: false,
    },
    Keyword {
        name: "nprocs",
        category: KeywordCategory::Run,
        description: "Worker processes for both stages",
        default_value: Some("[sweep] default_nprocs from the settings file"),
        example: Some("nprocs = 32"),
        required: false,
    },
    Keyword {
        name: "policy",
        category: KeywordCategory::Run,
        description: "fail_fast stops at the first failed point; continue attempts every point",
        default_value: Some("[sweep] policy from the settings file"),
        example: Some("policy = continue"),
        required: false,
    },
    Keyword {
        name: "cell_length",
        category: KeywordCategory::Run,
        description: "Cell length along the displacement axis in bohr; enables {{FRACTIONAL}}",
        default_value: None,
        example: Some("cell_length = 60.0"),
        required: false,
    },
    Keyword {
        name: "optimizer",
        category: KeywordCategory::Constraint,
        description: "Optimizer used by the client to find the constraint potential",
        default_value: Some("secant"),
        example: Some("optimizer = brenth"),
        required: false,
    },
    Keyword {
        name: "n0",
        category: KeywordCategory::Constraint,
        description: "Target electron number difference between donor and acceptor",
        default_value: None,
        example: Some("n0 = 1.0"),
        required: false,
    },
    Keyword {
        name: "v_init",
        category: KeywordCategory::Constraint,
        description: "Initial constraint potential",
        default_value: Some("0.0"),
        example: None,
        required: false,
    },
    Keyword {
        name: "v_brak",
        category: KeywordCategory::Constraint,
        description: "Search bracket for the constraint potential (low, high)",
        default_value: Some("-1.0, 1.0"),
        example: Some("v_brak = -2.0, 2.0"),
        required: false,
    },
    Keyword {
        name: "n_tol",
        category: KeywordCategory::Constraint,
        description: "Convergence tolerance on the electron number",
        default_value: Some("1e-3"),
        example: None,
        required: false,
    },
    Keyword {
        name: "eps",
        category: KeywordCategory::Constraint,
        description: "Density cutoff of the weight function",
        default_value: Some("1e-6"),
        example: None,
        required: false,
    },
];

/// All built-in placeholders
pub const PLACEHOLDERS: &[PlaceholderInfo] = &[
    PlaceholderInfo { name: "LABEL", available_in: "all", description: "Point label as written in the input" },
    PlaceholderInfo { name: "DISTANCE", available_in: "all (numeric labels)", description: "Distance in angstrom, verbatim" },
    PlaceholderInfo { name: "DISTANCE_BOHR", available_in: "all (numeric labels)", description: "Distance in bohr, 8 decimals" },
    PlaceholderInfo { name: "FRACTIONAL", available_in: "all (needs cell_length)", description: "Distance in bohr divided by cell_length" },
    PlaceholderInfo { name: "GEOMETRY_FILE", available_in: "all", description: "Rendered geometry file name" },
    PlaceholderInfo { name: "NPROCS", available_in: "all", description: "Worker process count" },
    PlaceholderInfo { name: "GRID_N1", available_in: "client, server", description: "First FFT grid dimension from the ground-state output" },
    PlaceholderInfo { name: "GRID_N2", available_in: "client, server", description: "Second FFT grid dimension" },
    PlaceholderInfo { name: "GRID_N3", available_in: "client, server", description: "Third FFT grid dimension" },
    PlaceholderInfo { name: "OPTIMIZER", available_in: "all", description: "Constraint optimizer" },
    PlaceholderInfo { name: "N0", available_in: "all (needs n0)", description: "Target electron number difference" },
    PlaceholderInfo { name: "V_INIT", available_in: "all", description: "Initial constraint potential" },
    PlaceholderInfo { name: "V_BRAK_LOW", available_in: "all", description: "Lower bracket of the constraint potential" },
    PlaceholderInfo { name: "V_BRAK_HIGH", available_in: "all", description: "Upper bracket of the constraint potential" },
    PlaceholderInfo { name: "N_TOL", available_in: "all", description: "Electron number tolerance" },
    PlaceholderInfo { name: "EPS", available_in: "all", description: "Weight function density cutoff" },
];

/// Print global help
pub fn print_global_help() {
    println!("cdftsweep - Two-stage constrained-DFT coupling sweeps");
    println!();
    println!("USAGE:");
    println!("    cdftsweep [OPTIONS] <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    <input_file>         Run the sweep described by the input file");
    println!("    <input_file> --check Validate the input and list the points without running");
    println!();
    println!("    ci <file|dir>        Create a starter sweep input and templates");
    println!("    ci {}", CONFIG_FILE_NAME);
    println!("                         Create a settings template file");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help [topic]   Show help. Topics: keywords, placeholders, settings");
    println!();
    println!("PER POINT:");
    println!("    1. render geometry and gs.in, run the solver (gs.in on stdin, gs.out)");
    println!("    2. read the FFT grid from gs.out");
    println!("    3. start the solver in server mode, run the client script, stop the server");
    println!("    Results: <work_root>/<label>/coupling.out and <work_root>/sweep_summary.json");
    println!();
    println!("EXAMPLES:");
    println!("    cdftsweep ci sweep.inp");
    println!("    cdftsweep sweep.inp --check");
    println!("    cdftsweep sweep.inp > sweep.log");
    println!("    RUST_LOG=debug cdftsweep sweep.inp");
    println!();
}

/// Print keyword reference
pub fn print_keyword_help() {
    println!("KEYWORD REFERENCE");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();

    let mut categories: HashMap<KeywordCategory, Vec<&Keyword>> = HashMap::new();
    for keyword in KEYWORDS {
        categories.entry(keyword.category).or_default().push(keyword);
    }

    for category in CATEGORY_ORDER {
        print_category_header(category);
        println!();
        for keyword in categories.get(&category).into_iter().flatten() {
            print_keyword(keyword);
            println!();
        }
        println!();
    }
}

/// Print placeholder reference
pub fn print_placeholder_help() {
    println!("TEMPLATE PLACEHOLDERS");
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    println!("Write placeholders as {{{{NAME}}}}. Unknown or misspelled placeholders");
    println!("are reported before any program is started.");
    println!();
    println!("{:<16} {:<26} {}", "NAME", "AVAILABLE IN", "VALUE");
    println!("{}", "─".repeat(76));
    for p in PLACEHOLDERS {
        println!("{:<16} {:<26} {}", p.name, p.available_in, p.description);
    }
    println!();
    println!("Names defined in *VARS are available in every template.");
    println!();
}

/// Print settings file reference
pub fn print_settings_help() {
    println!("SETTINGS FILE ({})", CONFIG_FILE_NAME);
    println!("═══════════════════════════════════════════════════════════════════════");
    println!();
    println!("Search order (first found wins):");
    println!("  ./{}", CONFIG_FILE_NAME);
    println!("  ~/.config/cdftsweep/{}", CONFIG_FILE_NAME);
    println!("  /etc/cdftsweep/{}", CONFIG_FILE_NAME);
    println!();
    println!("[solver]      executable, launcher, np_flag, server_flag");
    println!("[client]      interpreter");
    println!("[server]      readiness_timeout, poll_interval_ms, ready_marker,");
    println!("              min_warmup, shutdown_grace");
    println!("[extraction]  marker");
    println!("[sweep]       policy, default_nprocs (number or 'auto' for SLURM)");
    println!("[logging]     level, file_logging");
    println!();
    println!("Create a commented template with: cdftsweep ci {}", CONFIG_FILE_NAME);
    println!();
}

fn print_category_header(category: KeywordCategory) {
    let title = match category {
        KeywordCategory::Points => "SWEEP POINTS",
        KeywordCategory::Templates => "TEMPLATES AND ASSETS",
        KeywordCategory::Run => "RUN PARAMETERS",
        KeywordCategory::Constraint => "CONSTRAINT PARAMETERS",
    };
    println!("{}", title);
    println!("{}", "─".repeat(76));
}

fn print_keyword(keyword: &Keyword) {
    let required_str = if keyword.required { " [REQUIRED]" } else { "" };

    println!("{}{}", keyword.name, required_str);
    println!("    {}", keyword.description);

    if let Some(default) = keyword.default_value {
        println!("    Default: {}", default);
    }

    if let Some(example) = keyword.example {
        println!("    Example: {}", example.replace('\n', "\n             "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template;

    #[test]
    fn test_every_category_has_keywords() {
        for category in CATEGORY_ORDER {
            assert!(KEYWORDS.iter().any(|k| k.category == category));
        }
    }

    #[test]
    fn test_placeholder_table_is_complete() {
        for name in [
            template::LABEL,
            template::DISTANCE_BOHR,
            template::FRACTIONAL,
            template::GRID_N3,
            template::EPS,
        ] {
            assert!(PLACEHOLDERS.iter().any(|p| p.name == name), "{name} undocumented");
        }
        assert_eq!(PLACEHOLDERS.len(), 16);
    }
}
