//! Chat-completion clients for the hosted models that write scene scripts.

use crate::config::Config;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub mod gemini;
pub mod groq;

pub use gemini::GeminiClient;
pub use groq::GroqClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Groq,
    Gemini,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "groq",
            ProviderKind::Gemini => "gemini",
        }
    }

    pub fn key_var(&self) -> &'static str {
        match self {
            ProviderKind::Groq => "GROQ_API_KEY",
            ProviderKind::Gemini => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(ProviderKind::Groq),
            "gemini" => Ok(ProviderKind::Gemini),
            other => Err(AppError::ProviderUnavailable(other.to_string())),
        }
    }
}

/// A model that turns a prompt plus conversation into scene source text.
#[async_trait]
pub trait SceneModel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, system: &str, history: &[ChatMessage], prompt: &str)
    -> Result<String>;
}

/// Earlier turns minus any message that repeats the current prompt.
pub(crate) fn past_history<'a>(
    history: &'a [ChatMessage],
    prompt: &'a str,
) -> impl Iterator<Item = &'a ChatMessage> + 'a {
    history.iter().filter(move |msg| msg.content != prompt)
}

pub fn build_model(
    cfg: &Config,
    kind: ProviderKind,
    http: reqwest::Client,
) -> Result<Arc<dyn SceneModel>> {
    let key = cfg
        .api_key(kind)
        .ok_or(AppError::MissingApiKey(kind.key_var()))?
        .to_string();

    let model: Arc<dyn SceneModel> = match kind {
        ProviderKind::Groq => Arc::new(GroqClient::new(
            http,
            key,
            cfg.groq_url.clone(),
            cfg.groq_model.clone(),
            cfg.temperature,
            cfg.request_timeout(),
        )),
        ProviderKind::Gemini => Arc::new(GeminiClient::new(
            http,
            key,
            cfg.gemini_url.clone(),
            cfg.gemini_model.clone(),
            cfg.temperature,
            cfg.request_timeout(),
        )),
    };
    Ok(model)
}

/// Pull a readable message out of a provider error body, if it has one.
pub(crate) fn provider_error_message(raw: &str) -> Option<String> {
    let root: serde_json::Value = serde_json::from_str(raw).ok()?;
    let err = root.get("error")?;
    if let Some(msg) = err.as_str() {
        return Some(msg.to_string());
    }

    let msg = err.get("message").and_then(|v| v.as_str())?;
    let kind = err
        .get("type")
        .or_else(|| err.get("status"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| match err.get("code")? {
            serde_json::Value::String(code) => Some(code.clone()),
            serde_json::Value::Number(code) => Some(code.to_string()),
            _ => None,
        });
    Some(match kind {
        Some(kind) => format!("{} ({})", msg, kind),
        None => msg.to_string(),
    })
}
