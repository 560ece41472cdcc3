pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, find_config_path, load_config, resolve_path, save_config, state_dir,
};
pub use schema::{
    AgentConfig, CodeConfig, Config, DisplayConfig, EngineConfig, ModelConfig, KNOWN_PROVIDERS,
};

/// Startup-fatal configuration problems.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    MissingCredential(String),
    #[error("unknown provider '{0}' (valid: openai, anthropic, ollama)")]
    UnknownProvider(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
