use crate::api::ProviderKind;
use crate::quality::Quality;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub groq_api_key: Option<String>,
    #[serde(default)]
    pub gemini_api_key: Option<String>,
    #[serde(default = "default_groq_model")]
    pub groq_model: String,
    #[serde(default = "default_gemini_model")]
    pub gemini_model: String,
    #[serde(default = "default_groq_url")]
    pub groq_url: String,
    #[serde(default = "default_gemini_url")]
    pub gemini_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    #[serde(default = "default_render_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,
    /// Fixed quality; complexity-based when unset.
    #[serde(default)]
    pub quality: Option<Quality>,
    #[serde(default = "default_render_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Jobs kept on the board; finished ones are evicted oldest first.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    #[serde(default = "default_job_ttl_secs")]
    pub job_ttl_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Idle time after which a session's chat history is forgotten.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

fn default_groq_model() -> String {
    "llama3-70b-8192".to_string()
}

fn default_gemini_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_groq_url() -> String {
    "https://api.groq.com/openai/v1/chat/completions".to_string()
}

fn default_gemini_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_render_command() -> Vec<String> {
    vec!["manim".to_string()]
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("media")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("generated_scenes")
}

fn default_render_timeout_secs() -> u64 {
    600
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_workers() -> usize {
    1
}

fn default_history_limit() -> usize {
    50
}

fn default_max_jobs() -> usize {
    200
}

fn default_job_ttl_secs() -> u64 {
    3600
}

fn default_max_sessions() -> usize {
    1000
}

fn default_session_ttl_secs() -> u64 {
    24 * 3600
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            command: default_render_command(),
            extra_args: Vec::new(),
            media_dir: default_media_dir(),
            scripts_dir: default_scripts_dir(),
            quality: None,
            timeout_secs: default_render_timeout_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            static_dir: default_static_dir(),
            workers: default_workers(),
            history_limit: default_history_limit(),
            max_jobs: default_max_jobs(),
            job_ttl_secs: default_job_ttl_secs(),
            max_sessions: default_max_sessions(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            groq_api_key: None,
            gemini_api_key: None,
            groq_model: default_groq_model(),
            gemini_model: default_gemini_model(),
            groq_url: default_groq_url(),
            gemini_url: default_gemini_url(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            renderer: RendererConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Config {
    /// Read `path` if it exists, then layer environment overrides on top.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if fs::metadata(path).await.is_ok() {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = non_empty("GROQ_API_KEY") {
            self.groq_api_key = Some(key);
        }
        if let Some(key) = non_empty("GEMINI_API_KEY") {
            self.gemini_api_key = Some(key);
        }
        if let Some(provider) = non_empty("AUTOMANIM_PROVIDER") {
            self.provider = provider
                .parse()
                .with_context(|| format!("AUTOMANIM_PROVIDER: unknown provider {provider}"))?;
        }
        if let Some(bind) = non_empty("AUTOMANIM_BIND") {
            self.server.bind = bind;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("config: max_attempts must be at least 1");
        }
        if self.renderer.command.is_empty() || self.renderer.command[0].trim().is_empty() {
            anyhow::bail!("config: renderer.command must name a program");
        }
        if self.renderer.timeout_secs == 0 {
            anyhow::bail!("config: renderer.timeout_secs must be positive");
        }
        if self.server.workers == 0 {
            anyhow::bail!("config: server.workers must be at least 1");
        }
        if self.server.max_jobs == 0 || self.server.max_sessions == 0 {
            anyhow::bail!("config: server.max_jobs and server.max_sessions must be at least 1");
        }
        Ok(())
    }

    pub fn api_key(&self, kind: ProviderKind) -> Option<&str> {
        let key = match kind {
            ProviderKind::Groq => self.groq_api_key.as_deref(),
            ProviderKind::Gemini => self.gemini_api_key.as_deref(),
        };
        key.filter(|k| !k.is_empty())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.server.job_ttl_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.server.session_ttl_secs)
    }
}
