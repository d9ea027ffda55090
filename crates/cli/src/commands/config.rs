//! `parley config`: show or initialize the configuration.

use std::path::Path;

use anyhow::Context;
use parley_config::AppConfig;
use parley_providers::BUILTIN_PROVIDERS;

pub async fn run(init: bool) -> anyhow::Result<()> {
    let config_path = AppConfig::config_dir().join("config.toml");

    if init {
        if init_at(&config_path).await? {
            println!("Wrote default configuration to {}", config_path.display());
        } else {
            println!("{} already exists, left untouched", config_path.display());
        }
        return Ok(());
    }

    let config = AppConfig::load().context("failed to load config")?;
    println!("# {}", config_path.display());
    println!("{}", show(&config)?);
    Ok(())
}

/// Write the default configuration unless a file is already there.
/// Returns whether a file was written.
pub async fn init_at(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    tokio::fs::write(path, AppConfig::default_toml())
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(true)
}

/// The effective configuration as TOML, with keys redacted, followed by
/// the providers that need no section of their own.
pub fn show(config: &AppConfig) -> anyhow::Result<String> {
    let mut redacted = config.clone();
    if redacted.api_key.is_some() {
        redacted.api_key = Some("[REDACTED]".into());
    }
    for provider in redacted.providers.values_mut() {
        if provider.api_key.is_some() {
            provider.api_key = Some("[REDACTED]".into());
        }
    }
    let mut out = toml::to_string_pretty(&redacted)?;
    out.push_str(&format!("\n# built-in providers: {}\n", BUILTIN_PROVIDERS.join(", ")));
    Ok(out)
}
