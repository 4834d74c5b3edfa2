//! Contract with the in-process inference backend. The backend itself
//! (tokenization, weight loading, sampling) is a black box behind this
//! trait; `provider::local` is its only consumer.

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::LoadOptions;
use crate::conversation::{GenerationParams, Message};
use crate::error::GaleError;

/// Input shape offered to the backend: a chat message list when it has a
/// chat-native path, otherwise a single flattened prompt string.
#[derive(Clone, Debug)]
pub enum BackendInput {
    Chat(Vec<Message>),
    Prompt(String),
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Load model weights. Must signal model-file-not-found as
    /// `GaleError::NotFound` and allocation failure as
    /// `GaleError::OutOfMemory` so callers can classify them.
    async fn load(&self, options: &LoadOptions) -> Result<(), GaleError>;

    async fn unload(&self);

    /// Whether `BackendInput::Chat` is accepted. When false the adapter
    /// falls back to a flattened prompt transparently.
    fn supports_chat(&self) -> bool;

    /// Single blocking completion.
    async fn complete(
        &self,
        input: BackendInput,
        params: &GenerationParams,
    ) -> Result<String, GaleError>;

    /// Incremental completion. Setup failures are returned directly;
    /// mid-stream failures arrive as an `Err` item on the channel.
    /// Channel close without an error means the completion finished.
    async fn stream(
        &self,
        input: BackendInput,
        params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<String, GaleError>>, GaleError>;
}

/// GPU-layer-count heuristic for model load: explicit configuration wins;
/// otherwise probe for an accelerator and use all layers (-1) if one is
/// found, else CPU only (0).
pub async fn resolve_gpu_layers(options: &LoadOptions) -> i32 {
    if let Some(layers) = options.gpu_layers {
        return layers;
    }
    detect_gpu_layers().await
}

pub async fn detect_gpu_layers() -> i32 {
    // CUDA_VISIBLE_DEVICES=-1 is the conventional "GPU off" switch
    if std::env::var("CUDA_VISIBLE_DEVICES").as_deref() == Ok("-1") {
        tracing::info!("GPU disabled via CUDA_VISIBLE_DEVICES=-1");
        return 0;
    }

    if cfg!(target_os = "macos") {
        if probe_command("system_profiler", &["SPDisplaysDataType"], "Metal").await {
            tracing::info!("Apple GPU detected — using all layers");
            return -1;
        }
    } else if probe_command("nvidia-smi", &[], "").await {
        tracing::info!("NVIDIA GPU detected via nvidia-smi — using all layers");
        return -1;
    }

    tracing::info!("no GPU detected — CPU only");
    0
}

/// Run a probe command without blocking the worker thread; returns true
/// if it exits successfully and (when `needle` is non-empty) its stdout
/// contains the needle.
async fn probe_command(program: &str, args: &[&str], needle: &str) -> bool {
    match Command::new(program).args(args).output().await {
        Ok(output) if output.status.success() => {
            needle.is_empty() || String::from_utf8_lossy(&output.stdout).contains(needle)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_gpu_layers_win_over_detection() {
        let options = LoadOptions {
            gpu_layers: Some(12),
            ..LoadOptions::default()
        };
        assert_eq!(resolve_gpu_layers(&options).await, 12);

        let cpu_only = LoadOptions {
            gpu_layers: Some(0),
            ..LoadOptions::default()
        };
        assert_eq!(resolve_gpu_layers(&cpu_only).await, 0);
    }

    #[tokio::test]
    async fn detection_probe_resolves_on_the_runtime() {
        // Probes run through tokio::process, so awaiting them must not
        // wedge the worker; either outcome is valid per host.
        let layers = detect_gpu_layers().await;
        assert!(layers == 0 || layers == -1, "got {layers}");
    }
}
