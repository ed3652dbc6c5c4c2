use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::llm_client::ChatOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryBackendKind {
    #[default]
    Json,
    Sqlite,
}

impl MemoryBackendKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" | "files" => Some(Self::Json),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,

    // Sampling for the main thought stream
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,

    // Agent identity
    #[serde(default = "default_agent_name", alias = "username")]
    pub agent_name: String,
    #[serde(default = "default_prompt_path")]
    pub prompt_path: String,

    // Loop pacing
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_thought_delay_ms")]
    pub thought_delay_ms: u64,
    #[serde(default = "default_clock_interval_secs")]
    pub clock_interval_secs: u64,
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,

    // Long-term memory
    #[serde(default = "default_memory_preload_count")]
    pub memory_preload_count: usize,
    #[serde(default)]
    pub memory_backend: MemoryBackendKind,
    #[serde(default = "default_memory_dir")]
    pub memory_dir: String,
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3:8b".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_frequency_penalty() -> f32 {
    0.05
}

fn default_repeat_penalty() -> f32 {
    1.15
}

fn default_agent_name() -> String {
    "Reverie".to_string()
}

fn default_prompt_path() -> String {
    "reverie_prompt.txt".to_string()
}

fn default_max_context_chars() -> usize {
    12_000
}

fn default_thought_delay_ms() -> u64 {
    50
}

fn default_clock_interval_secs() -> u64 {
    60
}

fn default_error_backoff_secs() -> u64 {
    5
}

fn default_memory_preload_count() -> usize {
    3
}

fn default_memory_dir() -> String {
    "reverie_memories".to_string()
}

fn default_database_path() -> String {
    "reverie_memory.db".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            temperature: default_temperature(),
            frequency_penalty: default_frequency_penalty(),
            repeat_penalty: default_repeat_penalty(),
            agent_name: default_agent_name(),
            prompt_path: default_prompt_path(),
            max_context_chars: default_max_context_chars(),
            thought_delay_ms: default_thought_delay_ms(),
            clock_interval_secs: default_clock_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            memory_preload_count: default_memory_preload_count(),
            memory_backend: MemoryBackendKind::default(),
            memory_dir: default_memory_dir(),
            database_path: default_database_path(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("reverie_config.toml")
    }

    /// Load config from reverie_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<AgentConfig>(contents).context("Invalid agent config")
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            if !key.trim().is_empty() {
                config.llm_api_key = Some(key);
            }
        }

        if let Ok(name) = env::var("AGENT_NAME") {
            config.agent_name = name;
        }

        if let Ok(path) = env::var("AGENT_PROMPT_PATH") {
            if !path.trim().is_empty() {
                config.prompt_path = path;
            }
        }

        if let Ok(chars) = env::var("AGENT_MAX_CONTEXT_CHARS") {
            if let Ok(chars) = chars.parse() {
                config.max_context_chars = chars;
            }
        }

        if let Ok(delay) = env::var("AGENT_THOUGHT_DELAY_MS") {
            if let Ok(millis) = delay.parse() {
                config.thought_delay_ms = millis;
            }
        }

        if let Ok(interval) = env::var("AGENT_CLOCK_INTERVAL_SECS") {
            if let Ok(seconds) = interval.parse() {
                config.clock_interval_secs = seconds;
            }
        }

        if let Ok(count) = env::var("AGENT_MEMORY_PRELOAD") {
            if let Ok(count) = count.parse() {
                config.memory_preload_count = count;
            }
        }

        if let Ok(backend) = env::var("AGENT_MEMORY_BACKEND") {
            match MemoryBackendKind::parse(&backend) {
                Some(kind) => config.memory_backend = kind,
                None => tracing::warn!("Ignoring unknown AGENT_MEMORY_BACKEND '{}'", backend),
            }
        }

        if let Ok(dir) = env::var("AGENT_MEMORY_DIR") {
            if !dir.trim().is_empty() {
                config.memory_dir = dir;
            }
        }

        if let Ok(path) = env::var("AGENT_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        config
    }

    pub fn clock_interval(&self) -> Duration {
        // A zero interval would make tokio's interval panic.
        Duration::from_secs(self.clock_interval_secs.max(1))
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn chat_options(&self) -> ChatOptions {
        ChatOptions {
            temperature: self.temperature,
            frequency_penalty: self.frequency_penalty,
            repeat_penalty: self.repeat_penalty,
        }
    }
}
