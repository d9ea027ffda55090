//! Model backends for Parley.
//!
//! All backends implement `parley_core::Llm`. [`create_llm`] picks one from
//! configuration.

pub mod manual;
pub mod openai_compat;
pub mod scripted;
pub mod transport;

pub use manual::ManualLlm;
pub use openai_compat::{OpenAiCompatLlm, Service};
pub use scripted::{ScriptedLlm, ScriptedTurn};
pub use transport::{ChatTransport, HttpTransport};

use std::sync::Arc;

use parley_config::AppConfig;
use parley_core::{BackendDefaults, Error, Llm, Result};
use tracing::info;

/// Names that need no provider section.
pub const BUILTIN_PROVIDERS: &[&str] = &["openai", "ollama", "echo", "manual"];

/// Build the configured default backend.
pub fn create_llm(config: &AppConfig) -> Result<Arc<dyn Llm>> {
    create_named(config, &config.default_provider)
}

/// Step settings taken from configuration for the offline backends.
pub fn offline_defaults(config: &AppConfig, name: &str) -> BackendDefaults {
    BackendDefaults {
        temperature: Some(config.default_temperature),
        model: Some(config.model_for(name).to_string()),
        tool_fn: None,
        cycle_limit: Some(config.cycle_limit),
    }
}

/// Build a backend by provider name.
///
/// `echo` and `manual` work offline. `openai` needs an API key. Any other
/// name must have a `[providers.<name>]` section with an `api_url`.
pub fn create_named(config: &AppConfig, name: &str) -> Result<Arc<dyn Llm>> {
    let model = config.model_for(name).to_string();
    info!(provider = name, model = %model, "Creating backend");

    match name {
        "echo" => {
            let defaults = offline_defaults(config, name);
            return Ok(Arc::new(ScriptedLlm::echo().with_defaults(defaults)));
        }
        "manual" => {
            let defaults = offline_defaults(config, name);
            return Ok(Arc::new(ManualLlm::stdio().with_defaults(defaults)));
        }
        _ => {}
    }

    let section = config.provider(name);
    let api_url = section.and_then(|p| p.api_url.clone());
    let (base_url, api_key) = match name {
        "openai" => {
            let key = config.api_key_for(name).ok_or_else(|| {
                Error::config("no API key for provider 'openai'; set PARLEY_API_KEY or OPENAI_API_KEY")
            })?;
            (
                api_url.unwrap_or_else(|| "https://api.openai.com/v1".into()),
                key.to_string(),
            )
        }
        "ollama" => (
            api_url.unwrap_or_else(|| "http://localhost:11434/v1".into()),
            config.api_key_for(name).unwrap_or("ollama").to_string(),
        ),
        other => {
            let url = api_url.ok_or_else(|| {
                Error::config(format!(
                    "unknown provider '{other}': add [providers.{other}] with an api_url"
                ))
            })?;
            (url, config.api_key_for(name).unwrap_or_default().to_string())
        }
    };

    let mut transport = HttpTransport::new(base_url, api_key)?;
    if let Some(version) = section.and_then(|p| p.api_version.clone()) {
        transport = transport.with_api_version(version);
    }
    let llm = OpenAiCompatLlm::new(name, Arc::new(transport), model)
        .with_default_temperature(config.default_temperature)
        .with_cycle_limit(config.cycle_limit);
    Ok(Arc::new(llm))
}
