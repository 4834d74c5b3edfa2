//! Dual-protocol adapter for Ollama-family servers. The same host may
//! speak the native API (`/api/generate`, NDJSON streaming) or an
//! OpenAI-compatible one (`/v1/...`, LM Studio's default); which one is
//! detected once per adapter instance and cached for its lifetime.

use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderDescriptor;
use crate::conversation::{Conversation, GenerationParams};
use crate::error::GaleError;
use crate::provider::openai::OpenAiCompatAdapter;
use crate::provider::{ConnectionReport, ModelInfo, StreamOutcome, classify_status};
use crate::session::GenerationEvent;

const PROVIDER: &str = "ollama";

/// LM Studio's default port; a configured endpoint on it is probably
/// OpenAI-compatible.
const OPENAI_COMPAT_DEFAULT_PORT: u16 = 1234;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireProtocol {
    /// `/api/generate` with a flattened prompt, NDJSON streaming.
    Native,
    /// Same wire shape as the hosted chat API, under `/v1`.
    OpenAiCompat,
}

pub struct OllamaAdapter {
    http: reqwest::Client,
    base: String,
    model: String,
    /// Memoized detection result. Mutated only through the cell's own
    /// synchronization; a new adapter instance is required to re-detect.
    detected: OnceCell<WireProtocol>,
    openai: OpenAiCompatAdapter,
}

#[derive(Deserialize)]
struct NativeCompletion {
    response: String,
}

#[derive(Deserialize)]
struct NativeChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct TagList {
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaAdapter {
    pub fn from_descriptor(http: reqwest::Client, descriptor: &ProviderDescriptor) -> Self {
        Self::new(http, &descriptor.endpoint, &descriptor.model)
    }

    pub fn new(http: reqwest::Client, endpoint: &str, model: &str) -> Self {
        let base = endpoint.trim_end_matches('/').to_string();
        let openai = OpenAiCompatAdapter::new(http.clone(), PROVIDER, &base, None, model, vec![]);
        Self {
            http,
            base,
            model: model.to_string(),
            detected: OnceCell::new(),
            openai,
        }
    }

    fn port(&self) -> Option<u16> {
        reqwest::Url::parse(&self.base).ok().and_then(|u| u.port())
    }

    /// Detection result for this instance, probing on first use.
    pub async fn protocol(&self) -> WireProtocol {
        *self.detected.get_or_init(|| self.detect()).await
    }

    async fn detect(&self) -> WireProtocol {
        let port_guess = if self.port() == Some(OPENAI_COMPAT_DEFAULT_PORT) {
            WireProtocol::OpenAiCompat
        } else {
            WireProtocol::Native
        };

        let mut probed_openai = false;
        if port_guess == WireProtocol::OpenAiCompat {
            probed_openai = true;
            if self.confirms_openai().await {
                tracing::debug!("detected OpenAI-compatible server");
                return WireProtocol::OpenAiCompat;
            }
        }

        if self.confirms_native().await {
            tracing::debug!("detected native server");
            return WireProtocol::Native;
        }

        if !probed_openai && self.confirms_openai().await {
            tracing::debug!("detected OpenAI-compatible server");
            return WireProtocol::OpenAiCompat;
        }

        tracing::debug!(guess = ?port_guess, "both probes failed — using port-based guess");
        port_guess
    }

    async fn confirms_openai(&self) -> bool {
        self.probe_json(format!("{}/v1/models", self.base))
            .await
            .is_some_and(|v| v.get("data").is_some_and(|d| d.is_array()))
    }

    async fn confirms_native(&self) -> bool {
        self.probe_json(format!("{}/api/tags", self.base))
            .await
            .is_some_and(|v| v.get("models").is_some_and(|m| m.is_array()))
    }

    async fn probe_json(&self, url: String) -> Option<serde_json::Value> {
        let response = self
            .http
            .get(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    fn native_body(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
        stream: bool,
    ) -> serde_json::Value {
        let mut options = serde_json::json!({
            "temperature": params.temperature,
            "num_predict": params.max_tokens,
            "top_p": params.top_p,
            "top_k": params.top_k,
            "repeat_penalty": params.repeat_penalty,
        });
        if !params.stop_sequences.is_empty() {
            options["stop"] = serde_json::json!(params.stop_sequences);
        }
        serde_json::json!({
            "model": self.model,
            "prompt": conversation.to_tagged_prompt(),
            "stream": stream,
            "options": options,
        })
    }

    pub async fn generate(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> Result<String, GaleError> {
        match self.protocol().await {
            WireProtocol::OpenAiCompat => self.openai.generate(conversation, params).await,
            WireProtocol::Native => {
                let response = self
                    .http
                    .post(format!("{}/api/generate", self.base))
                    .json(&self.native_body(conversation, params, false))
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(classify_status(PROVIDER, status, &body));
                }

                let completion: NativeCompletion = response
                    .json()
                    .await
                    .map_err(|e| GaleError::SchemaParse(format!("generate response: {e}")))?;
                Ok(completion.response)
            }
        }
    }

    pub(crate) async fn stream(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
        cancel: &CancellationToken,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Result<StreamOutcome, GaleError> {
        match self.protocol().await {
            WireProtocol::OpenAiCompat => {
                self.openai.stream(conversation, params, cancel, events).await
            }
            WireProtocol::Native => {
                self.stream_native(conversation, params, cancel, events)
                    .await
            }
        }
    }

    /// Native streaming: newline-delimited JSON objects, each carrying an
    /// incremental `response` field. There is no explicit terminator;
    /// `done: true` or stream close both mean the completion finished.
    async fn stream_native(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
        cancel: &CancellationToken,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Result<StreamOutcome, GaleError> {
        let response = self
            .http
            .post(format!("{}/api/generate", self.base))
            .json(&self.native_body(conversation, params, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(PROVIDER, status, &body));
        }

        let mut byte_stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                chunk = byte_stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        match self.emit_line(&line[..line.len() - 1], events).await? {
                            LineOutcome::Continue => {}
                            LineOutcome::Done => return Ok(StreamOutcome::Complete),
                            LineOutcome::ConsumerGone => return Ok(StreamOutcome::Cancelled),
                        }
                    }
                }
                Some(Err(e)) => return Err(GaleError::Network(e)),
                None => {
                    // Stream close = done. A trailing unterminated line is
                    // still a chunk.
                    if !buffer.is_empty() {
                        let line = std::mem::take(&mut buffer);
                        if let LineOutcome::ConsumerGone = self.emit_line(&line, events).await? {
                            return Ok(StreamOutcome::Cancelled);
                        }
                    }
                    return Ok(StreamOutcome::Complete);
                }
            }
        }
    }

    async fn emit_line(
        &self,
        line: &[u8],
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Result<LineOutcome, GaleError> {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return Ok(LineOutcome::Continue);
        }

        match serde_json::from_str::<NativeChunk>(text) {
            Ok(chunk) => {
                if !chunk.response.is_empty()
                    && events
                        .send(GenerationEvent::Token(chunk.response))
                        .await
                        .is_err()
                {
                    return Ok(LineOutcome::ConsumerGone);
                }
                if chunk.done {
                    Ok(LineOutcome::Done)
                } else {
                    Ok(LineOutcome::Continue)
                }
            }
            Err(e) => {
                // Single malformed unit: skip it, never fatal.
                tracing::debug!("skipping malformed stream line: {e}");
                Ok(LineOutcome::Continue)
            }
        }
    }

    /// Available model names, via whichever protocol was detected.
    pub async fn list_models(&self) -> Result<Vec<String>, GaleError> {
        match self.protocol().await {
            WireProtocol::OpenAiCompat => self.openai.list_models().await,
            WireProtocol::Native => {
                let response = self
                    .http
                    .get(format!("{}/api/tags", self.base))
                    .timeout(METADATA_TIMEOUT)
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(classify_status(PROVIDER, status, &body));
                }

                let tags: TagList = response
                    .json()
                    .await
                    .map_err(|e| GaleError::SchemaParse(format!("tag list: {e}")))?;
                Ok(tags.models.into_iter().map(|m| m.name).collect())
            }
        }
    }

    /// Reachability check via the model listing — no generation side
    /// effects, unlike the hosted API's short-completion probe. An empty
    /// listing is a reachable-but-unusable report, not an error.
    pub async fn test_connection(&self) -> Result<ConnectionReport, GaleError> {
        let models = self.list_models().await?;
        if models.is_empty() {
            return Ok(ConnectionReport {
                ok: false,
                provider: PROVIDER.to_string(),
                detail: "no models found".to_string(),
            });
        }
        Ok(ConnectionReport {
            ok: true,
            provider: PROVIDER.to_string(),
            detail: format!("{} models available", models.len()),
        })
    }

    pub async fn model_info(&self, name: Option<&str>) -> Result<ModelInfo, GaleError> {
        let model = name.unwrap_or(&self.model);

        match self.protocol().await {
            WireProtocol::OpenAiCompat => self.openai.model_info(Some(model)).await,
            WireProtocol::Native => {
                let response = self
                    .http
                    .post(format!("{}/api/show", self.base))
                    .timeout(METADATA_TIMEOUT)
                    .json(&serde_json::json!({ "name": model }))
                    .send()
                    .await?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(classify_status(PROVIDER, status, &body));
                }

                let raw: serde_json::Value = response
                    .json()
                    .await
                    .map_err(|e| GaleError::SchemaParse(format!("show response: {e}")))?;

                Ok(ModelInfo {
                    context_size: extract_context_size(&raw),
                    raw,
                })
            }
        }
    }
}

enum LineOutcome {
    Continue,
    Done,
    ConsumerGone,
}

/// Context size from an `/api/show` response: structured `model_info`
/// keys first, then a `num_ctx <int>` entry in the free-text
/// `parameters` blob.
fn extract_context_size(raw: &serde_json::Value) -> Option<u32> {
    if let Some(info) = raw.get("model_info").and_then(|v| v.as_object()) {
        for (key, value) in info {
            let matches = key == "n_ctx"
                || key == "max_position_embeddings"
                || key.ends_with("context_length");
            if matches && let Some(size) = value.as_u64() {
                return u32::try_from(size).ok();
            }
        }
    }

    let parameters = raw.get("parameters").and_then(|v| v.as_str())?;
    parse_num_ctx(parameters)
}

fn parse_num_ctx(parameters: &str) -> Option<u32> {
    for line in parameters.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("num_ctx") {
            return fields.next().and_then(|v| v.parse().ok());
        }
    }
    None
}
