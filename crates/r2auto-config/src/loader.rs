use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Resolve a path, expanding ~ to home directory.
pub fn resolve_path(path: &str) -> PathBuf {
    if path.starts_with("~/") || path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~/").unwrap_or(""));
        }
    }
    PathBuf::from(path)
}

/// Base directory for r2auto state (~/.r2auto).
pub fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".r2auto")
}

/// Find the config file by searching standard locations.
pub fn find_config_path() -> PathBuf {
    // 1. Current directory
    let local = Path::new("r2auto.json");
    if local.exists() {
        return local.to_path_buf();
    }

    // 2. ~/.r2auto/config.json (will use defaults if missing)
    state_dir().join("config.json")
}

/// Load configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config '{}'", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config '{}'", path.display()))?;
        Ok(config)
    } else {
        Ok(Config::default())
    }
}

/// Overlay environment variables on top of file configuration.
pub fn apply_env_overrides(config: &mut Config) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn apply_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(base) = get("OPENAI_BASE_URL") {
        config.model.api_base = Some(base);
    }
    if let Some(key) = get("OPENAI_API_KEY") {
        config.model.api_key = Some(key);
    }
    if let Some(model) = get("OPENAI_MODEL") {
        config.model.model = model;
    }
    if let Some(provider) = get("R2AUTO_PROVIDER") {
        config.model.provider = provider.to_lowercase();
    }
    if let Some(proxy) = get("R2AUTO_PROXY") {
        config.model.proxy = Some(proxy);
    }
}

/// Save configuration to a JSON file.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    let contents = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!(
                "failed to create config directory '{}'",
                parent.to_string_lossy()
            )
        })?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}
