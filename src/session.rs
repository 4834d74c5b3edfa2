use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::error::GaleError;

/// One unit of streamed output. A stream is a finite ordered sequence of
/// zero or more `Token`s followed by exactly one terminal event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationEvent {
    Token(String),
    Complete,
    Cancelled,
    Error { kind: &'static str, message: String },
}

impl GenerationEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }

    /// Terminal event for a failed stream. Cancellation maps to its own
    /// terminal variant, never to `Error`.
    pub fn from_error(err: &GaleError) -> Self {
        match err {
            GaleError::Cancelled => Self::Cancelled,
            _ => Self::Error {
                kind: err.kind_name(),
                message: err.user_message(),
            },
        }
    }
}

impl GaleError {
    /// Stable classification tag carried on `GenerationEvent::Error`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::RateLimited { .. } => "rate-limit",
            Self::Auth { .. } => "auth",
            Self::Upstream { .. } => "backend",
            Self::NotFound { .. } => "not-found",
            Self::OutOfMemory { .. } => "out-of-memory",
            Self::SchemaParse(_) => "parse",
            Self::ModelLoad { .. } => "model-load",
            Self::Busy => "busy",
            Self::Other(_) => "other",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Process-wide single-flight gate: at most one generation session may be
/// active at a time. A second `try_begin` while the permit is held fails
/// fast with `Busy` and never queues.
#[derive(Clone)]
pub struct BusyCoordinator {
    gate: Arc<Semaphore>,
}

impl Default for BusyCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl BusyCoordinator {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn try_begin(&self) -> Result<OwnedSemaphorePermit, GaleError> {
        match self.gate.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => Err(GaleError::Busy),
            Err(TryAcquireError::Closed) => {
                Err(GaleError::Other("busy gate closed".to_string()))
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.gate.available_permits() == 0
    }
}

/// Caller-facing side of a running session. Single-use: once a terminal
/// event is received the stream is over and the handle is spent.
#[derive(Debug)]
pub struct SessionHandle {
    events: mpsc::Receiver<GenerationEvent>,
    cancel: CancellationToken,
    first_token: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    /// Await the next event. Returns None only if the producer vanished
    /// after its terminal event.
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    /// Non-blocking drain for callers with their own loop to run.
    pub fn try_next_event(&mut self) -> Option<GenerationEvent> {
        self.events.try_recv().ok()
    }

    /// Request cooperative cancellation. The producer stops between token
    /// reads and emits a `Cancelled` terminal event; tokens already read
    /// are not discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// One-shot signal: flips when the first `Token` arrives, letting the
    /// caller switch from a "working" to a "streaming" UI state.
    pub fn first_token_seen(&self) -> bool {
        self.first_token.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }
}

/// Wire a producer task to a consumer handle. The producer pushes events
/// into the returned sender and must end with exactly one terminal
/// event; this forwarder tracks state,
/// flips the first-token flag, and releases the busy permit on every
/// exit path, panics included.
pub fn spawn_forwarder(
    permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) -> (SessionHandle, mpsc::Sender<GenerationEvent>) {
    let (raw_tx, mut raw_rx) = mpsc::channel::<GenerationEvent>(64);
    let (pub_tx, pub_rx) = mpsc::channel::<GenerationEvent>(64);

    let first_token = Arc::new(AtomicBool::new(false));
    let state = Arc::new(Mutex::new(SessionState::Running));

    let handle = SessionHandle {
        events: pub_rx,
        cancel: cancel.clone(),
        first_token: first_token.clone(),
        state: state.clone(),
    };

    tokio::spawn(async move {
        // Holding the permit here (not in the producer) guarantees release
        // even if the producer task panics: its sender drops, recv yields
        // None, and this task falls through to the synthesized terminal.
        let _permit = permit;
        let mut terminal_seen = false;

        while let Some(event) = raw_rx.recv().await {
            match &event {
                GenerationEvent::Token(_) => {
                    first_token.store(true, Ordering::Release);
                }
                GenerationEvent::Complete => {
                    set_state(&state, SessionState::Completed);
                    terminal_seen = true;
                }
                GenerationEvent::Cancelled => {
                    set_state(&state, SessionState::Cancelled);
                    terminal_seen = true;
                }
                GenerationEvent::Error { .. } => {
                    set_state(&state, SessionState::Failed);
                    terminal_seen = true;
                }
            }
            let done = event.is_terminal();
            if pub_tx.send(event).await.is_err() {
                // Consumer dropped the handle; nothing left to deliver.
                break;
            }
            if done {
                break;
            }
        }

        if !terminal_seen {
            set_state(&state, SessionState::Failed);
            let err = GaleError::operation("generation", "task ended without a terminal event");
            let _ = pub_tx.send(GenerationEvent::from_error(&err)).await;
        }
    });

    (handle, raw_tx)
}

fn set_state(state: &Mutex<SessionState>, next: SessionState) {
    if let Ok(mut guard) = state.lock() {
        *guard = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_gate_fails_fast_and_releases_on_drop() {
        let busy = BusyCoordinator::new();
        let permit = busy.try_begin().unwrap();
        assert!(busy.is_busy());
        assert!(matches!(busy.try_begin(), Err(GaleError::Busy)));

        drop(permit);
        assert!(!busy.is_busy());
        assert!(busy.try_begin().is_ok());
    }

    #[tokio::test]
    async fn forwarder_flips_first_token_and_tracks_state() {
        let busy = BusyCoordinator::new();
        let permit = busy.try_begin().unwrap();
        let (mut handle, tx) = spawn_forwarder(permit, CancellationToken::new());

        assert!(!handle.first_token_seen());
        tx.send(GenerationEvent::Token("hi".into())).await.unwrap();
        tx.send(GenerationEvent::Complete).await.unwrap();

        assert_eq!(
            handle.next_event().await,
            Some(GenerationEvent::Token("hi".into()))
        );
        assert!(handle.first_token_seen());
        assert_eq!(handle.next_event().await, Some(GenerationEvent::Complete));
        assert_eq!(handle.state(), SessionState::Completed);

        // Terminal event released the busy gate
        drop(tx);
        tokio::task::yield_now().await;
        assert!(!busy.is_busy());
    }

    #[tokio::test]
    async fn producer_death_without_terminal_synthesizes_error() {
        let busy = BusyCoordinator::new();
        let permit = busy.try_begin().unwrap();
        let (mut handle, tx) = spawn_forwarder(permit, CancellationToken::new());

        tx.send(GenerationEvent::Token("partial".into()))
            .await
            .unwrap();
        drop(tx); // producer vanished mid-stream

        assert_eq!(
            handle.next_event().await,
            Some(GenerationEvent::Token("partial".into()))
        );
        match handle.next_event().await {
            Some(GenerationEvent::Error { kind, .. }) => assert_eq!(kind, "other"),
            other => panic!("expected synthesized error, got {other:?}"),
        }
        assert_eq!(handle.state(), SessionState::Failed);
    }
}
