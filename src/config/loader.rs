// Configuration loader
// Loads settings from --config, then ~/.esg-granite/config.toml, then defaults,
// and applies environment overrides (HF_TOKEN, ESG_GRANITE_DEVICE).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::constants::{CONFIG_DIR_NAME, CONFIG_FILE_NAME};
use super::settings::{Config, DeviceChoice};

/// Load configuration from an explicit path, the user config file, or defaults
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => read_config_file(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => read_config_file(&path)?,
            _ => {
                tracing::debug!("No config file found, using built-in defaults");
                Config::default()
            }
        },
    };

    apply_env_overrides(&mut config)?;

    config
        .validate()
        .context("Configuration validation failed")?;

    Ok(config)
}

/// `~/.esg-granite/config.toml`, if a home directory can be determined
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn read_config_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read configuration file {:?}", path))?;
    let config = Config::from_toml_str(&contents)
        .with_context(|| format!("Invalid configuration in {:?}", path))?;
    tracing::info!("Loaded configuration from {:?}", path);
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Ok(token) = std::env::var("HF_TOKEN") {
        if !token.trim().is_empty() {
            config.huggingface_token = Some(token);
        }
    }

    if let Ok(device) = std::env::var("ESG_GRANITE_DEVICE") {
        let choice: DeviceChoice = device
            .parse()
            .context("Invalid ESG_GRANITE_DEVICE value")?;
        config.finetune.device = choice;
        config.inference.device = choice;
    }

    Ok(())
}
