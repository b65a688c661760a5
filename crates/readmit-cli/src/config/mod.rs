//! Configuration discovery for the `readmit` binary.
//! Uses `--config` first, then the READMIT_CONFIG env var, then ./readmit.toml, and
//! falls back to built-in defaults when none of them names a file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use readmit_common::EngineConfig;

pub const CONFIG_ENV: &str = "READMIT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "readmit.toml";

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    Flag(PathBuf),
    Env(PathBuf),
    WorkingDir(PathBuf),
    Defaults,
}

impl ConfigSource {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigSource::Flag(p) | ConfigSource::Env(p) | ConfigSource::WorkingDir(p) => Some(p),
            ConfigSource::Defaults => None,
        }
    }
}

/// Pick the configuration file. An explicit flag or env var is used even if the file
/// does not exist, so a typo fails loudly instead of silently using defaults.
pub fn resolve(flag: Option<&Path>, env: Option<String>, working_dir: &Path) -> ConfigSource {
    if let Some(path) = flag {
        return ConfigSource::Flag(path.to_path_buf());
    }
    if let Some(path) = env.filter(|p| !p.trim().is_empty()) {
        return ConfigSource::Env(PathBuf::from(path));
    }
    let local = working_dir.join(DEFAULT_CONFIG_FILE);
    if local.is_file() {
        return ConfigSource::WorkingDir(local);
    }
    ConfigSource::Defaults
}

pub fn load(source: &ConfigSource) -> anyhow::Result<EngineConfig> {
    let Some(path) = source.path() else {
        let config = EngineConfig::default();
        config.validate()?;
        return Ok(config);
    };
    if !path.is_file() {
        anyhow::bail!("Config file not found: {}", path.display());
    }
    let is_json = path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let config = if is_json {
        EngineConfig::from_json_file(path)
    } else {
        EngineConfig::from_toml_file(path)
    };
    config.with_context(|| format!("loading {}", path.display()))
}

/// Resolve and load using the process environment.
pub fn discover(flag: Option<&Path>) -> anyhow::Result<(EngineConfig, ConfigSource)> {
    let working_dir = std::env::current_dir().context("reading the working directory")?;
    let source = resolve(flag, std::env::var(CONFIG_ENV).ok(), &working_dir);
    let config = load(&source)?;
    Ok((config, source))
}

mod tests;
