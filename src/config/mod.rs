//! Import settings
//!
//! Tunable values used by the statement importers. Most of them were tuned
//! against real broker reports, so they live in a JSON file next to the
//! other application settings instead of being compiled in.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::AssetType;

/// Directory name below the platform config dir
pub const APP_DIR_NAME: &str = "statement-ledger";

/// Settings file name
pub const SETTINGS_FILE: &str = "import_settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImportSettings {
    /// Amounts below this are treated as zero (fee legs of currency exchanges)
    pub calc_tolerance: f64,
    /// IBKR listing exchange of corporate-action records that only carry
    /// data for a paired primary record
    pub dummy_exchange: String,
    /// Counterparty assigned to accounts that have no bank yet
    pub default_counterparty: String,
    /// Highest Open Portfolio format version that can be read
    pub open_portfolio_max_version: String,
    /// Encoding label of Quik HTML reports
    pub quik_encoding: String,
    /// Asset type proposed for new assets when the report doesn't say
    pub default_asset_type: AssetType,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            calc_tolerance: 1e-10,
            dummy_exchange: "VALUE".to_string(),
            default_counterparty: "Interactive Brokers".to_string(),
            open_portfolio_max_version: "1.1.0".to_string(),
            quik_encoding: "windows-1251".to_string(),
            default_asset_type: AssetType::Stock,
        }
    }
}

impl ImportSettings {
    /// Load settings from a JSON file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: ImportSettings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        Ok(settings)
    }

    /// Load settings from the default location, falling back to defaults
    /// when there is no settings file.
    pub fn load_or_default() -> Self {
        let Some(path) = default_settings_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Using default import settings: {:#}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

/// `<config dir>/statement-ledger/import_settings.json`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(SETTINGS_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, r#"{"dummyExchange": "DUMMY", "calcTolerance": 0.001}"#).unwrap();

        let settings = ImportSettings::load(&path).unwrap();
        assert_eq!(settings.dummy_exchange, "DUMMY");
        assert_eq!(settings.calc_tolerance, 0.001);
        assert_eq!(settings.default_counterparty, "Interactive Brokers");
        assert_eq!(settings.open_portfolio_max_version, "1.1.0");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let settings = ImportSettings {
            default_asset_type: AssetType::Bond,
            ..ImportSettings::default()
        };
        settings.save(&path).unwrap();
        assert_eq!(ImportSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "not json").unwrap();
        assert!(ImportSettings::load(&path).is_err());
    }
}
