use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Providers the model client knows how to build.
pub const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic", "ollama"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub model: ModelConfig,
    pub engine: EngineConfig,
    pub agent: AgentConfig,
    pub code: CodeConfig,
    pub display: DisplayConfig,
    /// Append log output to this file instead of stderr.
    pub log_file: Option<String>,
}

impl Config {
    /// Check that everything needed to talk to the model endpoint is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let provider = self.model.provider.as_str();
        if !KNOWN_PROVIDERS.contains(&provider) {
            return Err(ConfigError::UnknownProvider(provider.to_string()));
        }
        if self.model.model.trim().is_empty() {
            return Err(ConfigError::MissingCredential(
                "model identifier (model.model or OPENAI_MODEL)".into(),
            ));
        }
        if provider != "ollama" && self.model.api_key().is_none() {
            return Err(ConfigError::MissingCredential(
                "API key (model.apiKey or OPENAI_API_KEY)".into(),
            ));
        }
        if self.engine.program.trim().is_empty() {
            return Err(ConfigError::Invalid("engine.program must not be empty".into()));
        }
        if self.agent.max_observation_chars == 0 {
            return Err(ConfigError::Invalid(
                "agent.maxObservationChars must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    pub api_base: Option<String>,
    pub api_key: Option<String>,
    /// HTTP(S) proxy URL applied to all outbound model traffic.
    pub proxy: Option<String>,
    pub temperature: f64,
    pub max_tokens: u64,
    /// Reasoning token budget for models that support extended thinking.
    pub thinking_budget: Option<u32>,
    pub stream: bool,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl ModelConfig {
    /// API key, treating an empty string as absent.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }

    /// Base URL, treating an empty string as absent.
    pub fn api_base(&self) -> Option<&str> {
        self.api_base.as_deref().filter(|b| !b.trim().is_empty())
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref().filter(|p| !p.trim().is_empty())
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-4".into(),
            api_base: None,
            api_key: None,
            proxy: None,
            temperature: 0.2,
            max_tokens: 8192,
            thinking_budget: None,
            stream: true,
            request_timeout_secs: 120,
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub program: String,
    /// Arguments placed before the target path.
    pub args: Vec<String>,
    pub command_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "r2".into(),
            args: vec!["-q0".into()],
            command_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub default_prompt: String,
    pub max_observation_chars: usize,
    pub context_budget_chars: usize,
    pub keep_recent_turns: usize,
    pub max_autonomous_steps: usize,
    pub max_consecutive_errors: usize,
    /// Accept `[[cmd]]` / `<code>` actions written in plain text.
    pub inline_actions: bool,
    pub save_transcripts: bool,
    pub transcript_dir: String,
    /// Extra instructions appended to the system prompt.
    pub instructions_file: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            default_prompt: "Analyze the main function logic.".into(),
            max_observation_chars: 30_000,
            context_budget_chars: 200_000,
            keep_recent_turns: 8,
            max_autonomous_steps: 40,
            max_consecutive_errors: 5,
            inline_actions: true,
            save_transcripts: true,
            transcript_dir: "~/.r2auto/sessions".into(),
            instructions_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeConfig {
    pub max_operations: u64,
    pub max_call_depth: usize,
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            max_operations: 10_000_000,
            max_call_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisplayConfig {
    pub max_observation_lines: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            max_observation_lines: 40,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_key() -> Config {
        let mut cfg = Config::default();
        cfg.model.api_key = Some("sk-test".into());
        cfg
    }

    #[test]
    fn empty_object_yields_defaults() {
        let cfg: Config = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(cfg.model.provider, "openai");
        assert_eq!(cfg.model.model, "gpt-4");
        assert_eq!(cfg.engine.program, "r2");
        assert_eq!(cfg.engine.args, vec!["-q0".to_string()]);
        assert_eq!(cfg.agent.max_observation_chars, 30_000);
        assert!(cfg.agent.inline_actions);
    }

    #[test]
    fn camel_case_fields_parsed() {
        let cfg: Config = serde_json::from_value(serde_json::json!({
            "model": {
                "apiBase": "http://localhost:8080/v1",
                "apiKey": "abc",
                "thinkingBudget": 4096,
                "maxRetries": 5
            },
            "engine": { "commandTimeoutSecs": 10 },
            "agent": { "keepRecentTurns": 4 },
            "logFile": "/tmp/r2auto.log"
        }))
        .unwrap();
        assert_eq!(cfg.model.api_base(), Some("http://localhost:8080/v1"));
        assert_eq!(cfg.model.thinking_budget, Some(4096));
        assert_eq!(cfg.model.max_retries, 5);
        assert_eq!(cfg.engine.command_timeout_secs, 10);
        assert_eq!(cfg.agent.keep_recent_turns, 4);
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/r2auto.log"));
        // untouched fields keep defaults
        assert_eq!(cfg.model.provider, "openai");
    }

    #[test]
    fn validate_requires_api_key() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingCredential(_))
        ));
        assert!(with_key().validate().is_ok());
    }

    #[test]
    fn validate_treats_blank_key_as_missing() {
        let mut cfg = Config::default();
        cfg.model.api_key = Some("   ".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ollama_needs_no_key() {
        let mut cfg = Config::default();
        cfg.model.provider = "ollama".into();
        cfg.model.model = "llama3".into();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_provider_rejected() {
        let mut cfg = with_key();
        cfg.model.provider = "acme".into();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownProvider(p)) if p == "acme"
        ));
    }
}
