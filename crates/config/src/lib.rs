//! Configuration loading and validation for Parley.
//!
//! Loads configuration from `~/.parley/config.toml` with environment
//! variable overrides. Everything a backend or the shell needs (system
//! instruction, defaults, limits) travels in these structs and is handed to
//! constructors explicitly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.parley/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key used when the provider section has none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Backend used when none is named on the command line
    #[serde(default = "default_provider")]
    pub default_provider: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Tool-requesting turns allowed per answer
    #[serde(default = "default_cycle_limit")]
    pub cycle_limit: u32,

    /// Provider-specific settings, keyed by provider name
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    #[serde(default)]
    pub shell: ShellConfig,
}

fn default_provider() -> String {
    "openai".into()
}
fn default_model() -> String {
    "gpt-4.1".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_cycle_limit() -> u32 {
    5
}

fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("cycle_limit", &self.cycle_limit)
            .field("providers", &self.providers)
            .field("shell", &self.shell)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .field("api_version", &self.api_version)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of an OpenAI-compatible endpoint, e.g.
    /// `http://localhost:11434/v1` for a local Ollama
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Sent as `?api-version=` (Azure deployments)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

/// Settings of the element-producing shell behind `parley ask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// May contain `(* ... *)` comments, which are stripped, and a `{date}`
    /// placeholder that is filled in per request.
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,

    /// How many times a malformed answer is re-asked before giving up
    #[serde(default = "default_answer_attempts")]
    pub answer_attempts: u32,

    /// Overrides `default_temperature` for shell requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

fn default_system_instruction() -> String {
    "You are a helpful assistant. (* Keep answers short. *) \
     Answer with a JSON object {\"items\": [...]} where every item is \
     {\"type\": \"text\", \"text\": \"...\"}, \
     {\"type\": \"graphics\", \"graphics\": \"<identifier>\"} or \
     {\"type\": \"table\", \"table\": \"<identifier>\"}; \
     only reference graphics and tables by identifiers your tools returned. \
     Today's date is {date}."
        .into()
}
fn default_answer_attempts() -> u32 {
    1
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            system_instruction: default_system_instruction(),
            answer_attempts: default_answer_attempts(),
            temperature: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.parley/config.toml).
    ///
    /// Environment variables win over the file:
    /// - `PARLEY_API_KEY`, then `OPENAI_API_KEY` (only if the file has no key)
    /// - `PARLEY_PROVIDER`
    /// - `PARLEY_MODEL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in
    /// [`AppConfig::load`]).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.api_key.is_none() {
            self.api_key = lookup("PARLEY_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }
        if let Some(provider) = lookup("PARLEY_PROVIDER") {
            self.default_provider = provider;
        }
        if let Some(model) = lookup("PARLEY_MODEL") {
            self.default_model = model;
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs_home().join(".parley")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if let Some(temperature) = self.shell.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(ConfigError::ValidationError(
                "shell.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.shell.answer_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "shell.answer_attempts must be at least 1".into(),
            ));
        }
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::ValidationError("default_model must not be empty".into()));
        }
        Ok(())
    }

    /// Settings for a named provider, if the file has a section for it.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// The provider's own key, else the global one.
    pub fn api_key_for(&self, name: &str) -> Option<&str> {
        self.provider(name)
            .and_then(|p| p.api_key.as_deref())
            .or(self.api_key.as_deref())
    }

    /// The provider's own default model, else the global one.
    pub fn model_for(&self, name: &str) -> &str {
        self.provider(name)
            .and_then(|p| p.default_model.as_deref())
            .unwrap_or(&self.default_model)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Default config as TOML (for `parley config --init`).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            cycle_limit: default_cycle_limit(),
            providers: HashMap::new(),
            shell: ShellConfig::default(),
        }
    }
}

fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.default_provider, "openai");
        assert_eq!(config.default_model, "gpt-4.1");
        assert_eq!(config.cycle_limit, 5);
        assert_eq!(config.shell.answer_attempts, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.default_provider, config.default_provider);
        assert_eq!(parsed.shell.system_instruction, config.shell.system_instruction);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = AppConfig {
            default_temperature: 5.0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.shell.temperature = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_answer_attempts_rejected() {
        let mut config = AppConfig::default();
        config.shell.answer_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.default_provider, "openai");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
default_provider = "local"
cycle_limit = 2

[providers.local]
api_url = "http://localhost:11434/v1"
default_model = "llama3"

[shell]
answer_attempts = 3
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.default_provider, "local");
        assert_eq!(config.cycle_limit, 2);
        assert_eq!(config.default_model, "gpt-4.1");
        assert_eq!(config.model_for("local"), "llama3");
        assert_eq!(config.model_for("openai"), "gpt-4.1");
        assert_eq!(config.shell.answer_attempts, 3);
        assert!(config.shell.system_instruction.contains("items"));
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cycle_limit = \"many\"").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn invalid_file_is_a_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_temperature = 3.5").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("OPENAI_API_KEY", "sk-openai"),
            ("PARLEY_MODEL", "gpt-4o-mini"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.api_key.as_deref(), Some("sk-openai"));
        assert_eq!(config.default_model, "gpt-4o-mini");
        assert_eq!(config.default_provider, "openai");
    }

    #[test]
    fn file_key_wins_over_environment() {
        let mut config = AppConfig {
            api_key: Some("from-file".into()),
            ..AppConfig::default()
        };
        config.apply_overrides(|name| (name == "PARLEY_API_KEY").then(|| "from-env".to_string()));
        assert_eq!(config.api_key.as_deref(), Some("from-file"));
    }

    #[test]
    fn provider_key_falls_back_to_global() {
        let mut config = AppConfig {
            api_key: Some("global".into()),
            ..AppConfig::default()
        };
        config.providers.insert(
            "azure".into(),
            ProviderConfig {
                api_key: Some("own".into()),
                ..ProviderConfig::default()
            },
        );
        assert_eq!(config.api_key_for("azure"), Some("own"));
        assert_eq!(config.api_key_for("openai"), Some("global"));
    }

    #[test]
    fn debug_redacts_keys() {
        let config = AppConfig {
            api_key: Some("sk-secret".into()),
            ..AppConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("openai"));
        assert!(toml_str.contains("answer_attempts"));
    }
}
