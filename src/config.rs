use serde::{Deserialize, Serialize};

/// Global configuration for the engine and its backends.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RookConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    /// Debug mode disables backend caching for every prompt call.
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Schedule-to-close timeout for tool and prompt activities, seconds.
    pub schedule_to_close_timeout_secs: u64,

    /// Heartbeat timeout for long-running activities, seconds.
    pub heartbeat_timeout_secs: u64,

    /// Maximum attempts for a retryable activity before the step errors.
    pub retry_max_attempts: u32,

    /// Depth cap for the auto-run-tools prompt loop.
    pub tool_loop_depth: u32,

    /// Max-tokens cap sent on the native-tools path.
    pub native_max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule_to_close_timeout_secs: 300,
            heartbeat_timeout_secs: 30,
            retry_max_attempts: 3,
            tool_loop_depth: 5,
            native_max_tokens: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    pub openai_base_url: String,
    #[serde(default)]
    pub openai_api_key: String,
    pub anthropic_base_url: String,
    #[serde(default)]
    pub anthropic_api_key: String,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: String::new(),
            anthropic_base_url: "https://api.anthropic.com".to_string(),
            anthropic_api_key: String::new(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name.to_uppercase())
        .or_else(|_| std::env::var(name.to_lowercase()))
        .ok()
        .filter(|v| !v.is_empty())
}

impl RookConfig {
    /// Load configuration with precedence:
    /// 1. Recognized plain environment variables (highest)
    /// 2. Environment variables with the `ROOK__` prefix
    /// 3. Config file (`rook.yaml` in cwd or `~/.config/rook/rook.yaml`)
    /// 4. Defaults
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&RookConfig::default())?)
            .add_source(
                config::File::with_name("rook")
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::File::with_name(&format!(
                    "{}/.config/rook/rook",
                    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
                ))
                .format(config::FileFormat::Yaml)
                .required(false),
            )
            .add_source(
                config::Environment::with_prefix("ROOK")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut cfg: RookConfig = builder.build()?.try_deserialize()?;

        // The recognized plain variables win over everything.
        if let Some(secs) = env_var("temporal_schedule_to_close_timeout")
            .and_then(|v| v.parse().ok())
        {
            cfg.engine.schedule_to_close_timeout_secs = secs;
        }
        if let Some(secs) = env_var("temporal_heartbeat_timeout").and_then(|v| v.parse().ok()) {
            cfg.engine.heartbeat_timeout_secs = secs;
        }
        if let Some(key) = env_var("anthropic_api_key") {
            cfg.backends.anthropic_api_key = key;
        }
        if let Some(debug) = env_var("debug") {
            cfg.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }

        Ok(cfg)
    }
}
