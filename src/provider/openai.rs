//! Adapter for chat-completions-shaped HTTP APIs: the hosted OpenAI API,
//! router-style backends (OpenRouter), and any server exposing the same
//! wire format.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderDescriptor;
use crate::conversation::{Conversation, GenerationParams};
use crate::error::GaleError;
use crate::provider::{ConnectionReport, ModelInfo, StreamOutcome, classify_status};
use crate::session::GenerationEvent;

const CONNECT_TEST_TIMEOUT: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Context sizes for well-known hosted models, consulted before any
/// network metadata lookup.
const KNOWN_CONTEXT_SIZES: &[(&str, u32)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4o-mini", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4-32k", 32_768),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
];

pub struct OpenAiCompatAdapter {
    http: reqwest::Client,
    provider_name: String,
    base: String,
    api_key: Option<String>,
    model: String,
    app_headers: Vec<(String, String)>,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    context_length: Option<u32>,
}

impl OpenAiCompatAdapter {
    pub fn from_descriptor(http: reqwest::Client, descriptor: &ProviderDescriptor) -> Self {
        Self::new(
            http,
            provider_label(&descriptor.endpoint),
            &descriptor.endpoint,
            descriptor.api_key.clone(),
            &descriptor.model,
            descriptor.app_headers.clone(),
        )
    }

    pub fn new(
        http: reqwest::Client,
        provider_name: impl Into<String>,
        endpoint: &str,
        api_key: Option<String>,
        model: &str,
        app_headers: Vec<(String, String)>,
    ) -> Self {
        Self {
            http,
            provider_name: provider_name.into(),
            base: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            app_headers,
        }
    }

    fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base)
    }

    fn models_url(&self) -> String {
        format!("{}/v1/models", self.base)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder.header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        for (name, value) in &self.app_headers {
            builder = builder.header(name, value);
        }
        builder
    }

    fn body(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
        stream: bool,
    ) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": conversation.messages(),
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
            "top_p": params.top_p,
            "stream": stream,
        });
        if !params.stop_sequences.is_empty() {
            body["stop"] = serde_json::json!(params.stop_sequences);
        }
        body
    }

    pub async fn generate(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> Result<String, GaleError> {
        let response = self
            .request(self.http.post(self.chat_url()))
            .json(&self.body(conversation, params, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.provider_name, status, &body));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| GaleError::SchemaParse(format!("chat completion response: {e}")))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GaleError::Upstream {
                provider: self.provider_name.clone(),
                message: "empty choices or null content".to_string(),
                status: None,
            })
    }

    /// Streamed completion over SSE. `data:` lines carry delta chunks, a
    /// literal `data: [DONE]` ends the stream, malformed lines are skipped.
    pub(crate) async fn stream(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
        cancel: &CancellationToken,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Result<StreamOutcome, GaleError> {
        let response = self
            .request(self.http.post(self.chat_url()))
            .json(&self.body(conversation, params, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.provider_name, status, &body));
        }

        let mut stream = response.bytes_stream().eventsource();

        loop {
            let event = tokio::select! {
                // Cooperative cancellation: checked between reads, so no
                // new token is requested once the flag is seen.
                _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                event = stream.next() => event,
            };

            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    return Err(GaleError::Upstream {
                        provider: self.provider_name.clone(),
                        message: format!("stream read failed: {e}"),
                        status: None,
                    });
                }
                // Connection closed without [DONE]; what we have is all
                // there is.
                None => return Ok(StreamOutcome::Complete),
            };

            if event.data.trim() == "[DONE]" {
                return Ok(StreamOutcome::Complete);
            }

            match serde_json::from_str::<StreamChunk>(&event.data) {
                Ok(chunk) => {
                    let text = chunk
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .unwrap_or_default();
                    if !text.is_empty()
                        && events.send(GenerationEvent::Token(text)).await.is_err()
                    {
                        // Consumer went away; treat like cancellation.
                        return Ok(StreamOutcome::Cancelled);
                    }
                }
                Err(e) => {
                    // Keepalives and metadata lines land here. Skip, never fatal.
                    tracing::debug!(provider = self.provider_name, "skipping SSE line: {e}");
                }
            }
        }
    }

    /// One short completion to validate reachability and credentials.
    pub async fn test_connection(&self) -> Result<ConnectionReport, GaleError> {
        let mut conversation = Conversation::new();
        conversation.push(crate::conversation::Message::user(
            "Say 'Hello!' in exactly one word.",
        ));
        let params = GenerationParams {
            max_tokens: 10,
            temperature: 0.0,
            ..GenerationParams::default()
        };

        let response = self
            .request(self.http.post(self.chat_url()))
            .timeout(CONNECT_TEST_TIMEOUT)
            .json(&self.body(&conversation, &params, false))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.provider_name, status, &body));
        }

        Ok(ConnectionReport {
            ok: true,
            provider: self.provider_name.clone(),
            detail: format!("reachable, model {}", self.model),
        })
    }

    /// Context-size lookup: known-model table first, then the model list
    /// endpoint. A listed model without a context_length field is a
    /// normal "no data" result, not an error.
    pub async fn model_info(&self, name: Option<&str>) -> Result<ModelInfo, GaleError> {
        let model = name.unwrap_or(&self.model);

        for (known, size) in KNOWN_CONTEXT_SIZES {
            // Prefix match covers dated variants like gpt-4o-2024-05-13.
            if model == *known || model.starts_with(&format!("{known}-")) {
                return Ok(ModelInfo {
                    context_size: Some(*size),
                    raw: serde_json::json!({ "source": "builtin" }),
                });
            }
        }

        let response = self
            .request(self.http.get(self.models_url()))
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.provider_name, status, &body));
        }

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| GaleError::SchemaParse(format!("model list: {e}")))?;

        let context_size = serde_json::from_value::<ModelList>(raw.clone())
            .ok()
            .and_then(|list| {
                list.data
                    .into_iter()
                    .find(|entry| entry.id == model)
                    .and_then(|entry| entry.context_length)
            });

        Ok(ModelInfo { context_size, raw })
    }
}

impl OpenAiCompatAdapter {
    /// Model ids from `GET /v1/models`.
    pub async fn list_models(&self) -> Result<Vec<String>, GaleError> {
        let response = self
            .request(self.http.get(self.models_url()))
            .timeout(METADATA_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.provider_name, status, &body));
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| GaleError::SchemaParse(format!("model list: {e}")))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

fn provider_label(endpoint: &str) -> &'static str {
    if endpoint.contains("openrouter") {
        "openrouter"
    } else {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_model_table_covers_dated_variants() {
        assert!(
            KNOWN_CONTEXT_SIZES
                .iter()
                .any(|(name, size)| *name == "gpt-4" && *size == 8_192)
        );
        // Ordering matters: gpt-4o must be matched before gpt-4.
        let first_match = KNOWN_CONTEXT_SIZES
            .iter()
            .find(|(name, _)| "gpt-4o".starts_with(*name) || *name == "gpt-4o")
            .unwrap();
        assert_eq!(first_match.1, 128_000);
    }

    #[test]
    fn provider_label_recognizes_router() {
        assert_eq!(provider_label("https://openrouter.ai/api"), "openrouter");
        assert_eq!(provider_label("https://api.openai.com"), "openai");
    }
}
