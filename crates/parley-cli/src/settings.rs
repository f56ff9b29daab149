use std::path::{Path, PathBuf};

use color_eyre::eyre::{Context, Result, eyre};
use directories::ProjectDirs;
use serde::Deserialize;

use parley_worker::{DeliveryConfig, ParleyDb, SessionConfig};

/// Contents of the optional TOML settings file. Every key has a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: Option<PathBuf>,
    /// Root of the per-tenant credential directories.
    pub auth_dir: Option<PathBuf>,
    pub bridge_dir: Option<PathBuf>,
    pub session: SessionConfig,
    pub delivery: DeliveryConfig,
}

impl Settings {
    /// A path that was asked for explicitly must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read settings from {}", path.display()))?;
        Self::parse(&contents).wrap_err_with(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => Ok(ParleyDb::default_path()?),
        }
    }

    pub fn auth_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.auth_dir {
            return Ok(dir.clone());
        }
        let dirs = ProjectDirs::from("io", "parley", "parley")
            .ok_or_else(|| eyre!("Could not resolve data directory"))?;
        Ok(dirs.data_dir().join("auth"))
    }
}
