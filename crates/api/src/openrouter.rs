use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use trustroute_agents::CompletionBackend;
use trustroute_core::{ChatMessage, ChatRole};

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
const APP_REFERER: &str = "https://trustroute.vercel.app";
const APP_TITLE: &str = "TrustRoute AI Chatbot";

/// OpenRouter chat completions. Without an API key every call returns
/// `Ok(None)` and the assistant keeps its rule-based reply.
#[derive(Clone)]
pub struct OpenRouterClient {
    http: Client,
    api_key: Option<String>,
    model: String,
}

impl OpenRouterClient {
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(6))
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key,
            model: model.into(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

impl CompletionBackend for OpenRouterClient {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
    ) -> Result<Option<String>> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(None);
        };

        let payload = serde_json::json!({
            "model": self.model,
            "messages": request_messages(system_prompt, messages),
            "temperature": 0.7,
            "max_tokens": 1000
        });

        let response = self
            .http
            .post(OPENROUTER_URL)
            .bearer_auth(api_key)
            .header("HTTP-Referer", APP_REFERER)
            .header("X-Title", APP_TITLE)
            .json(&payload)
            .send()
            .await
            .context("OpenRouter request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenRouter non-success status {}: {}", status.as_u16(), body);
        }

        let body: serde_json::Value = response.json().await.context("OpenRouter parse failed")?;
        Ok(extract_completion_text(&body))
    }
}

fn request_messages(system_prompt: &str, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    std::iter::once(serde_json::json!({ "role": "system", "content": system_prompt }))
        .chain(messages.iter().map(|message| {
            let role = match message.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            serde_json::json!({ "role": role, "content": message.content })
        }))
        .collect()
}

fn extract_completion_text(payload: &serde_json::Value) -> Option<String> {
    payload
        .get("choices")?
        .as_array()?
        .first()?
        .get("message")?
        .get("content")?
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
