pub mod local;
pub mod ollama;
pub mod openai;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::InferenceBackend;
use crate::config::{ProviderDescriptor, ProviderKind};
use crate::conversation::{Conversation, GenerationParams};
use crate::error::GaleError;
use crate::session::GenerationEvent;

use local::LocalAdapter;
use ollama::OllamaAdapter;
use openai::OpenAiCompatAdapter;

/// Result of a connectivity check. Failure is data, not an error — the
/// caller shows `detail` either way.
#[derive(Clone, Debug)]
pub struct ConnectionReport {
    pub ok: bool,
    pub provider: String,
    pub detail: String,
}

/// Best-effort model metadata. Absent data is a normal outcome.
#[derive(Clone, Debug, Default)]
pub struct ModelInfo {
    pub context_size: Option<u32>,
    pub raw: serde_json::Value,
}

/// How a stream ended when it did not fail.
pub(crate) enum StreamOutcome {
    Complete,
    Cancelled,
}

/// One backend family behind the uniform adapter contract. A closed enum
/// so dispatch is an exhaustive match rather than runtime probing.
pub enum Provider {
    Local(LocalAdapter),
    OpenAiCompat(OpenAiCompatAdapter),
    Ollama(OllamaAdapter),
}

impl Provider {
    pub fn from_descriptor(
        http: reqwest::Client,
        descriptor: &ProviderDescriptor,
        backend: Arc<dyn InferenceBackend>,
    ) -> Self {
        match descriptor.kind {
            ProviderKind::Local => Self::Local(LocalAdapter::new(backend)),
            ProviderKind::OpenAiCompat => {
                Self::OpenAiCompat(OpenAiCompatAdapter::from_descriptor(http, descriptor))
            }
            ProviderKind::Ollama => Self::Ollama(OllamaAdapter::from_descriptor(http, descriptor)),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Local(_) => ProviderKind::Local,
            Self::OpenAiCompat(_) => ProviderKind::OpenAiCompat,
            Self::Ollama(_) => ProviderKind::Ollama,
        }
    }

    /// Single blocking completion.
    pub async fn generate(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> Result<String, GaleError> {
        match self {
            Self::Local(adapter) => adapter.generate(conversation, params).await,
            Self::OpenAiCompat(adapter) => adapter.generate(conversation, params).await,
            Self::Ollama(adapter) => adapter.generate(conversation, params).await,
        }
    }

    /// Incremental delivery: pushes zero or more `Token` events followed
    /// by exactly one terminal event into `events`. Stops promptly once
    /// `cancel` fires, emitting `Cancelled` rather than `Error`.
    pub async fn stream_into(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
        cancel: &CancellationToken,
        events: &mpsc::Sender<GenerationEvent>,
    ) {
        let outcome = match self {
            Self::Local(adapter) => adapter.stream(conversation, params, cancel, events).await,
            Self::OpenAiCompat(adapter) => {
                adapter.stream(conversation, params, cancel, events).await
            }
            Self::Ollama(adapter) => adapter.stream(conversation, params, cancel, events).await,
        };

        let terminal = match outcome {
            Ok(StreamOutcome::Complete) => GenerationEvent::Complete,
            Ok(StreamOutcome::Cancelled) => GenerationEvent::Cancelled,
            Err(err) => {
                tracing::warn!(provider = self.kind().as_str(), "stream failed: {err}");
                GenerationEvent::from_error(&err)
            }
        };
        // Receiver may already be gone; the terminal event is then moot.
        let _ = events.send(terminal).await;
    }

    /// Minimal round trip to validate reachability and credentials.
    /// Classified failures come back as `Err` so the caller's retry
    /// layer can tell transient from fatal.
    pub async fn test_connection(&self) -> Result<ConnectionReport, GaleError> {
        match self {
            Self::Local(adapter) => adapter.test_connection().await,
            Self::OpenAiCompat(adapter) => adapter.test_connection().await,
            Self::Ollama(adapter) => adapter.test_connection().await,
        }
    }

    /// Metadata lookup. The engine retries transient failures and maps
    /// exhaustion to "no data" — absence is a normal outcome there.
    pub async fn model_info(&self, name: Option<&str>) -> Result<ModelInfo, GaleError> {
        match self {
            Self::Local(adapter) => Ok(adapter.model_info()),
            Self::OpenAiCompat(adapter) => adapter.model_info(name).await,
            Self::Ollama(adapter) => adapter.model_info(name).await,
        }
    }
}

/// Map a non-success HTTP status to the error taxonomy. Shared by both
/// remote wire paths.
pub(crate) fn classify_status(
    provider: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> GaleError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return GaleError::Auth {
            provider: provider.to_string(),
            message: format!("{status}"),
        };
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return GaleError::RateLimited {
            provider: provider.to_string(),
        };
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return GaleError::NotFound {
            what: format!("endpoint or model ({status})"),
        };
    }
    GaleError::Upstream {
        provider: provider.to_string(),
        message: truncate_body(body),
        status: Some(status.as_u16()),
    }
}

/// Cap upstream error bodies so a misbehaving server can't flood logs.
fn truncate_body(body: &str) -> String {
    const MAX: usize = 400;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification_matches_taxonomy() {
        let auth = classify_status("p", reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(matches!(auth, GaleError::Auth { .. }));

        let limited = classify_status("p", reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(limited, GaleError::RateLimited { .. }));
        assert!(limited.is_retryable());

        let fault = classify_status("p", reqwest::StatusCode::BAD_GATEWAY, "oops");
        assert!(matches!(fault, GaleError::Upstream { status: Some(502), .. }));
        assert!(fault.is_retryable());

        let teapot = classify_status("p", reqwest::StatusCode::IM_A_TEAPOT, "");
        assert!(!teapot.is_retryable());
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(10_000);
        let err = classify_status("p", reqwest::StatusCode::BAD_GATEWAY, &body);
        match err {
            GaleError::Upstream { message, .. } => assert!(message.len() < 500),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
