use super::{ChatMessage, SceneModel, past_history, provider_error_message};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

const PROVIDER: &str = "Groq";

/// OpenAI-compatible chat completions as served by Groq.
pub struct GroqClient {
    http: Client,
    api_key: String,
    url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl GroqClient {
    pub fn new(
        http: Client,
        api_key: String,
        url: String,
        model: String,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_key,
            url,
            model,
            temperature,
            timeout,
        }
    }

    pub(crate) fn request_body(&self, system: &str, history: &[ChatMessage], prompt: &str) -> Value {
        let mut messages = vec![json!({"role": "system", "content": system})];
        messages.extend(
            past_history(history, prompt)
                .map(|msg| json!({"role": msg.role, "content": msg.content})),
        );
        messages.push(json!({"role": "user", "content": prompt}));

        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": messages,
        })
    }
}

pub(crate) fn extract_reply(raw: &str) -> Result<String> {
    let root: Value = serde_json::from_str(raw).map_err(|e| AppError::Provider {
        provider: PROVIDER,
        message: format!("unreadable response: {e}"),
    })?;

    let content = root
        .pointer("/choices/0/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    if content.trim().is_empty() {
        return Err(AppError::EmptyReply(PROVIDER));
    }
    Ok(content.to_string())
}

#[async_trait]
impl SceneModel for GroqClient {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn complete(
        &self,
        system: &str,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<String> {
        let body = self.request_body(system, history, prompt);
        debug!(model = %self.model, turns = history.len(), "Groq chat completion");

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let message = provider_error_message(&raw)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            warn!("Groq HTTP {}: {}", status.as_u16(), message);
            return Err(AppError::Provider {
                provider: PROVIDER,
                message,
            });
        }

        extract_reply(&raw)
    }
}
