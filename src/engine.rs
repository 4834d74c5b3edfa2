use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backend::InferenceBackend;
use crate::config::{Config, ProviderKind};
use crate::conversation::{ConversationBuilder, GenerationParams, Message};
use crate::error::GaleError;
use crate::lifecycle::{ModelLifecycleManager, ModelState};
use crate::provider::{ConnectionReport, ModelInfo, Provider};
use crate::retry::RetryExecutor;
use crate::session::{BusyCoordinator, SessionHandle, spawn_forwarder};

/// The one engine object per process. All shared mutable state lives in
/// its members, each behind its own synchronization primitive: the busy
/// gate, the lifecycle state, and the adapter's protocol-detection cell.
pub struct Engine {
    config: Config,
    http: reqwest::Client,
    backend: Arc<dyn InferenceBackend>,
    provider: Arc<Provider>,
    busy: BusyCoordinator,
    lifecycle: Arc<ModelLifecycleManager>,
    retry: RetryExecutor,
}

impl Engine {
    pub fn new(config: Config, backend: Arc<dyn InferenceBackend>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        let provider = Arc::new(Provider::from_descriptor(
            http.clone(),
            &config.descriptor,
            backend.clone(),
        ));
        let lifecycle = Arc::new(ModelLifecycleManager::new(backend.clone()));

        Self {
            config,
            http,
            backend,
            provider,
            busy: BusyCoordinator::new(),
            lifecycle,
            retry: RetryExecutor::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model_state(&self) -> ModelState {
        self.lifecycle.state()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_busy()
    }

    /// Apply a configuration change. Takes effect on the next session.
    /// The provider is rebuilt (re-arming protocol detection), and a
    /// provider-kind or model-path change forces the lifecycle back to
    /// `Unloaded`.
    pub fn reconfigure(&mut self, config: Config) {
        let kind_changed = config.descriptor.kind != self.config.descriptor.kind;
        let path_changed = config.load.model_path != self.config.load.model_path;

        self.provider = Arc::new(Provider::from_descriptor(
            self.http.clone(),
            &config.descriptor,
            self.backend.clone(),
        ));
        if kind_changed || path_changed {
            self.lifecycle.reset();
        }
        tracing::info!(descriptor = %config.descriptor, "engine reconfigured");
        self.config = config;
    }

    /// Open a streaming generation session. Fails fast with `Busy` while
    /// another session is running. The returned handle delivers events
    /// until exactly one terminal event; dropping it cancels nothing on
    /// its own — call `cancel()` for that.
    pub async fn start_session(
        &self,
        prompt: &str,
        history: &[Message],
    ) -> Result<SessionHandle, GaleError> {
        self.ensure_backend_ready().await?;

        let permit = self.busy.try_begin()?;
        let conversation = self.build_conversation(prompt, history);
        let params = self.config.params.clone();
        let cancel = CancellationToken::new();

        let (handle, events) = spawn_forwarder(permit, cancel.clone());
        let provider = self.provider.clone();

        tokio::spawn(async move {
            provider
                .stream_into(&conversation, &params, &cancel, &events)
                .await;
        });

        Ok(handle)
    }

    /// Non-streaming completion, retried on transient failures. Holds
    /// the busy gate like any other generation.
    pub async fn generate(&self, prompt: &str, history: &[Message]) -> Result<String, GaleError> {
        self.generate_with(prompt, history, self.config.params.clone())
            .await
    }

    async fn generate_with(
        &self,
        prompt: &str,
        history: &[Message],
        params: GenerationParams,
    ) -> Result<String, GaleError> {
        self.ensure_backend_ready().await?;
        let _permit = self.busy.try_begin()?;

        let conversation = self.build_conversation(prompt, history);
        self.retry
            .run("generate", || self.provider.generate(&conversation, &params))
            .await
    }

    /// Minimal connectivity check, retried on transient failures.
    pub async fn test_connection(&self) -> ConnectionReport {
        match self
            .retry
            .run("test connection", || self.provider.test_connection())
            .await
        {
            Ok(report) => report,
            Err(e) => ConnectionReport {
                ok: false,
                provider: self.config.descriptor.kind.as_str().to_string(),
                detail: e.user_message(),
            },
        }
    }

    /// Best-effort metadata. Lookup failures collapse to "no data" at
    /// this surface; they are never fatal.
    pub async fn model_info(&self, name: Option<&str>) -> ModelInfo {
        self.retry
            .run("model info", || self.provider.model_info(name))
            .await
            .unwrap_or_default()
    }

    /// Unload the local backend; the next session reloads it.
    pub async fn unload_model(&self) {
        self.lifecycle.unload().await;
    }

    /// Explain a piece of code, adapted to the reader's level.
    pub async fn explain_code(&self, code: &str, language: &str) -> Result<String, GaleError> {
        let prompt = format!(
            "Explain this {language} code:\n\n```{}\n{code}\n```\n\n\
             Be concise. Focus on what the code does and key concepts.",
            language.to_lowercase(),
        );
        self.generate_with(&prompt, &[], self.consistent_params())
            .await
    }

    /// Propose a fix for a failing piece of code.
    pub async fn fix_error(
        &self,
        code: &str,
        error_message: &str,
        language: &str,
    ) -> Result<String, GaleError> {
        let prompt = format!(
            "Fix this {language} error:\n\n```{}\n{code}\n```\n\nError:\n```\n{error_message}\n```\n\n\
             Provide:\n1. Brief explanation of the error\n2. Corrected code\n3. What changed",
            language.to_lowercase(),
        );
        self.generate_with(&prompt, &[], self.consistent_params())
            .await
    }

    /// Low temperature for explanation-style calls where consistency
    /// beats creativity.
    fn consistent_params(&self) -> GenerationParams {
        GenerationParams {
            temperature: 0.3,
            ..self.config.params.clone()
        }
    }

    fn build_conversation(
        &self,
        prompt: &str,
        history: &[Message],
    ) -> crate::conversation::Conversation {
        ConversationBuilder::new(self.config.history_window)
            .system_prompt(&self.config.system_prompt)
            .history(history.to_vec())
            .build(prompt)
    }

    /// Local backends must be loaded before a session starts; remote
    /// providers have no load step.
    async fn ensure_backend_ready(&self) -> Result<(), GaleError> {
        if self.config.descriptor.kind == ProviderKind::Local {
            self.lifecycle.ensure_ready(&self.config.load).await?;
        }
        Ok(())
    }
}
