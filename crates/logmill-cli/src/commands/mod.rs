pub mod completions;
pub mod ingest;
pub mod mask;
pub mod parse;
pub mod templates;

use std::path::{Path, PathBuf};

use logmill_config::IngestConfig;
use logmill_core::LogmillError;

const CONFIG_FILE: &str = "logmill.toml";

/// Config from `--config`, else `./logmill.toml`, else the user config dir,
/// else defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<IngestConfig, LogmillError> {
    if let Some(path) = explicit {
        return Ok(logmill_config::load(path)?);
    }
    match default_config_path() {
        Some(path) => {
            tracing::debug!("Using config {}", path.display());
            Ok(logmill_config::load(&path)?)
        }
        None => Ok(IngestConfig::default()),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("logmill").join(CONFIG_FILE))
        .filter(|path| path.is_file())
}
