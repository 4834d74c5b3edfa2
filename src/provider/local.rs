//! Adapter over the in-process inference backend. Formats the
//! conversation into whichever input shape the backend accepts and
//! re-yields its native token stream unchanged.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendInput, InferenceBackend};
use crate::conversation::{Conversation, GenerationParams, Message};
use crate::error::GaleError;
use crate::provider::{ConnectionReport, ModelInfo, StreamOutcome};
use crate::session::GenerationEvent;

const PROVIDER: &str = "local";

pub struct LocalAdapter {
    backend: Arc<dyn InferenceBackend>,
}

impl LocalAdapter {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }

    /// Chat-native input when the backend supports it, else a flattened
    /// prompt. The fallback is transparent to callers.
    fn input(&self, conversation: &Conversation) -> BackendInput {
        if self.backend.supports_chat() {
            BackendInput::Chat(conversation.messages().to_vec())
        } else {
            BackendInput::Prompt(conversation.to_chatml_prompt())
        }
    }

    pub async fn generate(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> Result<String, GaleError> {
        self.backend.complete(self.input(conversation), params).await
    }

    pub(crate) async fn stream(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
        cancel: &CancellationToken,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Result<StreamOutcome, GaleError> {
        let mut chunks = self.backend.stream(self.input(conversation), params).await?;

        loop {
            let chunk = tokio::select! {
                // Stop requesting tokens as soon as cancellation is seen;
                // the chunk already in hand is not discarded.
                _ = cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
                chunk = chunks.recv() => chunk,
            };

            match chunk {
                Some(Ok(text)) => {
                    if !text.is_empty()
                        && events.send(GenerationEvent::Token(text)).await.is_err()
                    {
                        return Ok(StreamOutcome::Cancelled);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(StreamOutcome::Complete),
            }
        }
    }

    pub async fn test_connection(&self) -> Result<ConnectionReport, GaleError> {
        let mut conversation = Conversation::new();
        conversation.push(Message::user("Say 'Hello!' in exactly one word."));
        let params = GenerationParams {
            max_tokens: 10,
            temperature: 0.1,
            ..GenerationParams::default()
        };

        let response = self.generate(&conversation, &params).await?;
        Ok(ConnectionReport {
            ok: true,
            provider: PROVIDER.to_string(),
            detail: response,
        })
    }

    /// The backend contract has no metadata surface; context size comes
    /// from load options, which callers already hold.
    pub fn model_info(&self) -> ModelInfo {
        ModelInfo::default()
    }
}
