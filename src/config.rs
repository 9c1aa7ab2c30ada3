use std::path::PathBuf;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::compatibility::ScoringConfig;
use crate::curve::{PhaseBand, SetCurvePolicy};
use crate::ordering::OrderingConfig;

/// Application configuration loaded from TOML config file.
/// All fields have sensible defaults; the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Custom database path (overrides XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel scoring workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub scoring: ScoringConfig,
    pub ordering: OrderingConfig,
    pub curve: CurveConfig,
}

/// Optional replacement for the built-in energy curve.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CurveConfig {
    /// One band per phase, in warmup, build, peak, cooldown order.
    pub bands: Vec<PhaseBand>,
}

impl CurveConfig {
    /// The configured curve, or the default one when none is set or the
    /// table is invalid.
    pub fn policy(&self) -> SetCurvePolicy {
        if self.bands.is_empty() {
            return SetCurvePolicy::default();
        }
        match SetCurvePolicy::new(self.bands.clone()) {
            Ok(policy) => policy,
            Err(e) => {
                log::warn!("Invalid [curve] table: {e}. Using the default curve.");
                SetCurvePolicy::default()
            }
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/segue/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => match std::fs::read_to_string(&path) {
                Ok(contents) => Self::from_toml(&contents).unwrap_or_else(|e| {
                    log::warn!("Failed to parse {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }),
                Err(e) => {
                    log::warn!("Failed to read {}: {}. Using defaults.", path.display(), e);
                    Self::default()
                }
            },
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let config: AppConfig = toml::from_str(contents)?;
        log::info!("Loaded config");
        Ok(config)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path using XDG data directory.
pub fn default_db_path() -> PathBuf {
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join("segue.db")
    } else {
        // Fallback: current directory
        PathBuf::from("segue.db")
    }
}
