//! Command line companion for mapping documents and settings.
//!
//! ```text
//! ambit check <dir> [settings file]   validate and fingerprint every mapping document in <dir>
//! ambit settings [settings file]      print the effective settings as JSON
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tracing::{error, info, warn};

use ambit::config::init_logging;
use ambit::mapping::{EntityMapping, MappingDocument};
use ambit::{Result, Settings};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let settings_path = |i: usize| args.get(i).map(PathBuf::from);
    let outcome = match args.first().map(String::as_str) {
        Some("check") => match args.get(1) {
            Some(dir) => load_settings(settings_path(2)).and_then(|_| check(Path::new(dir))),
            None => usage(),
        },
        Some("settings") => load_settings(settings_path(1)).and_then(|settings| {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(true)
        }),
        _ => usage(),
    };
    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "ambit failed");
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn usage() -> Result<bool> {
    eprintln!("usage: ambit check <dir> [settings file] | ambit settings [settings file]");
    Ok(false)
}

fn load_settings(path: Option<PathBuf>) -> Result<Settings> {
    let settings = Settings::load(path.as_deref())?;
    init_logging(&settings);
    Ok(settings)
}

/// Every document must parse and validate; reports all failures, not just the first.
fn check(dir: &Path) -> Result<bool> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| ambit::AmbitError::Configuration(format!("cannot read {}: {e}", dir.display())))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    let mut healthy = true;
    for path in &paths {
        match MappingDocument::from_path(path).and_then(EntityMapping::new) {
            Ok(mapping) => {
                info!(file = %path.display(), entity = mapping.entity(), "mapping is valid");
                println!("ok   {}  {}  {}", mapping.fingerprint, mapping.entity(), path.display());
            }
            Err(e) => {
                healthy = false;
                warn!(file = %path.display(), error = %e, "mapping is invalid");
                println!("FAIL {}  {e}", path.display());
            }
        }
    }
    info!(documents = paths.len(), healthy, "check complete");
    Ok(healthy)
}
