//! Locating the runner configuration.

use stagehand_runner::RunnerConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the per-project configuration file.
const PROJECT_CONFIG: &str = "stagehand.yaml";

/// User-wide configuration file path.
pub fn config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let dirs = directories::ProjectDirs::from("dev", "stagehand", "stagehand")
        .ok_or("Could not determine config directory")?;
    Ok(dirs.config_dir().join("config.yaml"))
}

/// Load the configuration.
///
/// An explicit path must exist. Otherwise `stagehand.yaml` in the current
/// directory is used, then the user config file, then the defaults.
pub fn load(explicit: Option<&Path>) -> Result<RunnerConfig, Box<dyn std::error::Error>> {
    if let Some(path) = explicit {
        return Ok(RunnerConfig::from_file(path)?);
    }
    let project = Path::new(PROJECT_CONFIG);
    if project.exists() {
        debug!(path = %project.display(), "Using project configuration");
        return Ok(RunnerConfig::from_file(project)?);
    }
    let user = config_path()?;
    if user.exists() {
        debug!(path = %user.display(), "Using user configuration");
        return Ok(RunnerConfig::from_file(&user)?);
    }
    Ok(RunnerConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_runner::BackendKind;

    #[test]
    fn test_explicit_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.yaml");
        std::fs::write(&path, "backend: probe\ndry_run: true\n").unwrap();
        let config = load(Some(&path)).unwrap();
        assert_eq!(config.backend, BackendKind::Probe);
        assert!(config.dry_run);
    }

    #[test]
    fn test_explicit_file_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("missing.yaml"))).is_err());
    }
}
