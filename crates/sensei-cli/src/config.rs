use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use sensei_core::controller::DEFAULT_STREAM_TIMEOUT;
use sensei_core::session::{DEFAULT_MODEL, DEFAULT_TEMPERATURE};
use sensei_core::ControllerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Gemini API key. Also read from `API_KEY` or `SENSEI_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    pub model: String,

    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Override for the Gemini endpoint (e.g. a proxy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Seconds to wait for the next reply fragment; 0 waits forever
    pub stream_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_output_tokens: None,
            base_url: None,
            stream_timeout_secs: DEFAULT_STREAM_TIMEOUT.as_secs(),
        }
    }
}

/// Values given on the command line. Unset fields leave lower layers alone.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Config {
    /// Load from `~/.config/sensei/config.toml`, the environment and `overrides`.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let path = Self::config_path()?;
        Self::extract(Self::figment(&path, overrides))
            .with_context(|| format!("Invalid configuration (file: {})", path.display()))
    }

    /// Layering, lowest first: defaults, config file, `SENSEI_*` variables,
    /// raw `API_KEY`, command-line overrides.
    pub fn figment(path: &Path, overrides: &Overrides) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SENSEI_"))
            .merge(Env::raw().only(&["API_KEY"]))
            .merge(Serialized::defaults(overrides))
    }

    pub fn extract(figment: Figment) -> Result<Self, figment::Error> {
        figment.extract()
    }

    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("sensei"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn history_path() -> Option<PathBuf> {
        Self::config_dir().ok().map(|d| d.join("chat_history"))
    }

    /// The API key, treating a blank value as absent.
    pub fn api_key(&self) -> Option<String> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
    }

    pub fn masked_api_key(&self) -> String {
        match self.api_key() {
            Some(key) => mask_key(&key),
            None => "(not set)".to_string(),
        }
    }

    pub fn stream_timeout(&self) -> Option<Duration> {
        (self.stream_timeout_secs > 0).then(|| Duration::from_secs(self.stream_timeout_secs))
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
            stream_timeout: self.stream_timeout(),
        }
    }
}

/// Keep the first and last four characters of a key.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
