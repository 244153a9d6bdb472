use super::{ChatMessage, ChatRole, SceneModel, past_history, provider_error_message};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, warn};

const PROVIDER: &str = "Gemini";

/// Google Generative Language `generateContent` endpoint.
pub struct GeminiClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(
        http: Client,
        api_key: String,
        base_url: String,
        model: String,
        temperature: f32,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_key,
            base_url,
            model,
            temperature,
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }

    pub(crate) fn request_body(&self, system: &str, history: &[ChatMessage], prompt: &str) -> Value {
        let mut contents: Vec<Value> = past_history(history, prompt)
            .map(|msg| {
                let role = match msg.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "model",
                };
                json!({"role": role, "parts": [{"text": msg.content}]})
            })
            .collect();
        contents.push(json!({"role": "user", "parts": [{"text": prompt}]}));

        json!({
            "system_instruction": {"parts": [{"text": system}]},
            "contents": contents,
            "generationConfig": {"temperature": self.temperature},
        })
    }
}

pub(crate) fn extract_reply(raw: &str) -> Result<String> {
    let root: Value = serde_json::from_str(raw).map_err(|e| AppError::Provider {
        provider: PROVIDER,
        message: format!("unreadable response: {e}"),
    })?;

    let mut text = String::new();
    if let Some(parts) = root
        .pointer("/candidates/0/content/parts")
        .and_then(|v| v.as_array())
    {
        for part in parts {
            if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
                text.push_str(t);
            }
        }
    }

    if text.trim().is_empty() {
        if let Some(reason) = root
            .pointer("/promptFeedback/blockReason")
            .and_then(|v| v.as_str())
        {
            return Err(AppError::Provider {
                provider: PROVIDER,
                message: format!("prompt blocked: {reason}"),
            });
        }
        return Err(AppError::EmptyReply(PROVIDER));
    }
    Ok(text)
}

#[async_trait]
impl SceneModel for GeminiClient {
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
        debug!(model = %self.model, turns = history.len(), "Gemini generateContent");

        let resp = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            let message = provider_error_message(&raw)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            warn!("Gemini HTTP {}: {}", status.as_u16(), message);
            return Err(AppError::Provider {
                provider: PROVIDER,
                message,
            });
        }

        extract_reply(&raw)
    }
}
