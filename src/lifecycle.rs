use std::sync::{Arc, Mutex};

use crate::backend::{InferenceBackend, resolve_gpu_layers};
use crate::config::LoadOptions;
use crate::error::GaleError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Failed(String),
}

struct Inner {
    state: ModelState,
    /// Bumped once per finished load attempt. Lets a caller that waited
    /// behind an in-flight load tell "a load completed while I waited"
    /// (attach to its result) from "nothing happened" (initiate one).
    epoch: u64,
}

/// Owns backend readiness. Loads are single-flight: a dedicated async
/// lock serializes them, distinct from the busy gate, so a load never
/// blocks a generation that is already running against a ready backend.
pub struct ModelLifecycleManager {
    backend: Arc<dyn InferenceBackend>,
    inner: Mutex<Inner>,
    load_lock: tokio::sync::Mutex<()>,
}

impl ModelLifecycleManager {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            inner: Mutex::new(Inner {
                state: ModelState::Unloaded,
                epoch: 0,
            }),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ModelState {
        self.inner.lock().expect("lifecycle lock poisoned").state.clone()
    }

    fn snapshot(&self) -> (ModelState, u64) {
        let inner = self.inner.lock().expect("lifecycle lock poisoned");
        (inner.state.clone(), inner.epoch)
    }

    fn set_state(&self, state: ModelState, bump_epoch: bool) {
        let mut inner = self.inner.lock().expect("lifecycle lock poisoned");
        inner.state = state;
        if bump_epoch {
            inner.epoch += 1;
        }
    }

    /// Make the backend ready, loading it if necessary. Concurrent calls
    /// while a load is in flight attach to that load and observe its
    /// result; exactly one underlying load runs at a time.
    pub async fn ensure_ready(&self, options: &LoadOptions) -> Result<(), GaleError> {
        let (state, epoch) = self.snapshot();
        if state == ModelState::Ready {
            return Ok(());
        }

        let _guard = self.load_lock.lock().await;

        let (state, epoch_after_wait) = self.snapshot();
        match state {
            ModelState::Ready => return Ok(()),
            ModelState::Failed(message) if epoch_after_wait != epoch => {
                // A load finished while we waited for the lock; share its
                // outcome instead of immediately retrying.
                return Err(GaleError::ModelLoad { message });
            }
            _ => {}
        }

        self.set_state(ModelState::Loading, false);
        tracing::info!("loading model backend");

        let mut resolved = options.clone();
        resolved.gpu_layers = Some(resolve_gpu_layers(options).await);

        match self.backend.load(&resolved).await {
            Ok(()) => {
                self.set_state(ModelState::Ready, true);
                tracing::info!(gpu_layers = resolved.gpu_layers, "model ready");
                Ok(())
            }
            Err(err) => {
                self.set_state(ModelState::Failed(err.user_message()), true);
                tracing::error!("model load failed: {err}");
                Err(err)
            }
        }
    }

    /// Unload and return to `Unloaded`. The next `ensure_ready` reloads.
    pub async fn unload(&self) {
        let _guard = self.load_lock.lock().await;
        self.backend.unload().await;
        self.set_state(ModelState::Unloaded, true);
        tracing::info!("model unloaded");
    }

    /// Force `Unloaded` without touching the backend. Called when a
    /// configuration change switches provider kind or model path.
    pub fn reset(&self) {
        self.set_state(ModelState::Unloaded, true);
    }
}
