use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "ingestd.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Parent of the per-volume `<label>(<serial>)` folders.
    pub destination_root: PathBuf,
    /// Ingestion ledger, relative to the working directory unless absolute.
    pub ledger_path: PathBuf,
    /// fsync every copied file before moving on.
    pub sync_files: bool,
    pub verbose: bool,
    pub json_logs: bool,
    pub simulation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            destination_root: PathBuf::from("/srv/ingest"),
            ledger_path: PathBuf::from("ingest_ledger.txt"),
            sync_files: true,
            verbose: false,
            json_logs: false,
            simulation: false,
        }
    }
}

impl AppConfig {
    /// Merge defaults, the TOML file, `INGESTD_*` variables and CLI overrides,
    /// later layers winning.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("INGESTD_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Invalid configuration (file: {})", file.display()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        destination_root: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sync_files: Option<bool>,
    }

    #[test]
    fn test_defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = AppConfig::new(None, None::<&Overrides>).unwrap();
            assert_eq!(config, AppConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_layers_file_env_and_overrides() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                destination_root = "/from/file"
                ledger_path = "file-ledger.txt"
                sync_files = false
                "#,
            )?;
            jail.set_env("INGESTD_LEDGER_PATH", "env-ledger.txt");

            let overrides = Overrides {
                destination_root: Some("/from/cli".to_string()),
                sync_files: None,
            };
            let config = AppConfig::new(None, Some(&overrides)).unwrap();

            assert_eq!(config.destination_root, PathBuf::from("/from/cli"));
            assert_eq!(config.ledger_path, PathBuf::from("env-ledger.txt"));
            assert!(!config.sync_files);
            Ok(())
        });
    }

    #[test]
    fn test_to_toml_round_trips_through_figment() {
        Jail::expect_with(|jail| {
            let config = AppConfig {
                verbose: true,
                ..Default::default()
            };
            jail.create_file("custom.toml", &config.to_toml().unwrap())?;

            let loaded =
                AppConfig::new(Some(Path::new("custom.toml")), None::<&Overrides>).unwrap();
            assert_eq!(loaded, config);
            Ok(())
        });
    }
}
