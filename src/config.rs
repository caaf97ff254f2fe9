use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use anyhow::Context;

use crate::tftp::client::config::TftpcConfigFile;
use crate::tftp::server::config::Config as TftpdConfig;

pub const CONFIG_FILE: &str = ".tftpkit.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tftpd: Option<TftpdConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tftpc: Option<TftpcConfigFile>,
}

impl AppConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn generate_config_file(force: bool) -> anyhow::Result<()> {
        Self::write_config_file(Path::new(CONFIG_FILE), force)?;

        info!("Configuration file generated: {}", CONFIG_FILE);
        info!("Contains full configuration (server + client)");
        info!("Please edit this file to customize configuration");
        Ok(())
    }

    fn write_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
        if path.exists() && !force {
            anyhow::bail!(
                "Configuration file {} already exists. Use --force to overwrite.",
                path.display()
            );
        }

        fs::write(path, Self::generate_full_config()?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn generate_full_config() -> anyhow::Result<String> {
        let config = AppConfig {
            tftpd: Some(TftpdConfig::with_defaults()),
            tftpc: Some(TftpcConfigFile::with_defaults()),
        };
        let toml_content = toml::to_string_pretty(&config)?;
        Ok(format!(
            "# tftpkit configuration file\n# All fields are optional, values here take precedence over command line arguments\n\n{}",
            toml_content
        ))
    }
}
