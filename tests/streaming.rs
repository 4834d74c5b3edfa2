//! SSE streaming against mock chat-completions servers, plus error
//! classification and end-to-end engine sessions over the remote path.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gale::backend::{BackendInput, InferenceBackend};
use gale::config::{Config, LoadOptions, ProviderDescriptor, ProviderKind};
use gale::conversation::{Conversation, GenerationParams, Message};
use gale::engine::Engine;
use gale::error::GaleError;
use gale::provider::Provider;
use gale::provider::openai::OpenAiCompatAdapter;
use gale::session::{GenerationEvent, SessionState};

/// Helper: bind a TCP listener on localhost and return (listener, port).
async fn mock_listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// Helper: format an SSE data event from a content string.
fn sse_chunk(content: &str) -> String {
    format!("data: {{\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n")
}

const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

fn adapter(port: u16) -> OpenAiCompatAdapter {
    OpenAiCompatAdapter::new(
        reqwest::Client::new(),
        "openai",
        &format!("http://127.0.0.1:{port}"),
        Some("test-key".to_string()),
        "test-model",
        vec![],
    )
}

fn conversation(turn: &str) -> Conversation {
    let mut conv = Conversation::new();
    conv.push(Message::user(turn));
    conv
}

async fn collect_events(
    provider: &Provider,
    conv: &Conversation,
    cancel: &CancellationToken,
) -> Vec<GenerationEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    provider
        .stream_into(conv, &GenerationParams::default(), cancel, &tx)
        .await;
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Engine tests below exercise the remote path only; this backend is the
/// required-but-unused local seam.
struct UnusedBackend;

#[async_trait::async_trait]
impl InferenceBackend for UnusedBackend {
    async fn load(&self, _options: &LoadOptions) -> Result<(), GaleError> {
        Ok(())
    }

    async fn unload(&self) {}

    fn supports_chat(&self) -> bool {
        false
    }

    async fn complete(
        &self,
        _input: BackendInput,
        _params: &GenerationParams,
    ) -> Result<String, GaleError> {
        Err(GaleError::Other("unused".to_string()))
    }

    async fn stream(
        &self,
        _input: BackendInput,
        _params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<String, GaleError>>, GaleError> {
        Err(GaleError::Other("unused".to_string()))
    }
}

fn remote_config(port: u16) -> Config {
    Config {
        descriptor: ProviderDescriptor {
            kind: ProviderKind::OpenAiCompat,
            endpoint: format!("http://127.0.0.1:{port}"),
            api_key: Some("test-key".to_string()),
            model: "test-model".to_string(),
            app_headers: vec![],
        },
        params: GenerationParams::default(),
        load: LoadOptions::default(),
        system_prompt: "You are a test assistant.".to_string(),
        history_window: 20,
    }
}

// ---------------------------------------------------------------------------
// Complete SSE stream: tokens in order, then exactly one Complete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_complete_response() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("Hello ").as_bytes()).await.unwrap();
        socket.write_all(sse_chunk("world!").as_bytes()).await.unwrap();
        socket.write_all(SSE_DONE).await.unwrap();
    });

    let provider = Provider::OpenAiCompat(adapter(port));
    let events = collect_events(&provider, &conversation("hi"), &CancellationToken::new()).await;

    assert_eq!(
        events,
        vec![
            GenerationEvent::Token("Hello ".to_string()),
            GenerationEvent::Token("world!".to_string()),
            GenerationEvent::Complete,
        ]
    );

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Cancellation mid-stream: delivered tokens kept, Cancelled terminal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_cancel_mid_stream() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("one ").as_bytes()).await.unwrap();
        socket.write_all(sse_chunk("two").as_bytes()).await.unwrap();
        // Hold the connection open; only cancellation ends the stream
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let provider = Arc::new(Provider::OpenAiCompat(adapter(port)));
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(64);

    let stream_task = {
        let provider = provider.clone();
        let cancel = cancel.clone();
        let conv = conversation("hi");
        tokio::spawn(async move {
            provider
                .stream_into(&conv, &GenerationParams::default(), &cancel, &tx)
                .await;
        })
    };

    assert_eq!(
        rx.recv().await,
        Some(GenerationEvent::Token("one ".to_string()))
    );
    assert_eq!(
        rx.recv().await,
        Some(GenerationEvent::Token("two".to_string()))
    );

    cancel.cancel();
    assert_eq!(rx.recv().await, Some(GenerationEvent::Cancelled));
    assert_eq!(rx.recv().await, None);

    stream_task.await.unwrap();
    server.abort();
}

// ---------------------------------------------------------------------------
// Malformed SSE payloads are skipped, never fatal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_skips_malformed_lines() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("ok ").as_bytes()).await.unwrap();
        socket.write_all(b"data: {not valid json\n\n").await.unwrap();
        socket.write_all(b": keepalive comment\n\n").await.unwrap();
        socket.write_all(sse_chunk("fine").as_bytes()).await.unwrap();
        socket.write_all(SSE_DONE).await.unwrap();
    });

    let provider = Provider::OpenAiCompat(adapter(port));
    let events = collect_events(&provider, &conversation("hi"), &CancellationToken::new()).await;

    assert_eq!(
        events,
        vec![
            GenerationEvent::Token("ok ".to_string()),
            GenerationEvent::Token("fine".to_string()),
            GenerationEvent::Complete,
        ]
    );

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Connection close without [DONE] completes with what was delivered
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_eof_without_done_completes() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("partial").as_bytes()).await.unwrap();
        // Socket closes without a [DONE] marker
    });

    let provider = Provider::OpenAiCompat(adapter(port));
    let events = collect_events(&provider, &conversation("hi"), &CancellationToken::new()).await;

    assert_eq!(
        events,
        vec![
            GenerationEvent::Token("partial".to_string()),
            GenerationEvent::Complete,
        ]
    );

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// HTTP status classification on the streaming path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_auth_failure_yields_auth_error_event() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket
            .write_all(
                b"HTTP/1.1 401 Unauthorized\r\n\
                  Content-Type: application/json\r\n\
                  Connection: close\r\n\r\n\
                  {\"error\":\"invalid key\"}",
            )
            .await
            .unwrap();
    });

    let provider = Provider::OpenAiCompat(adapter(port));
    let events = collect_events(&provider, &conversation("hi"), &CancellationToken::new()).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        GenerationEvent::Error { kind, .. } => assert_eq!(*kind, "auth"),
        other => panic!("expected auth error event, got {other:?}"),
    }

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// Non-streaming completion and error classification
// ---------------------------------------------------------------------------

#[tokio::test]
async fn generate_parses_chat_completion() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket
            .write_all(
                b"HTTP/1.1 200 OK\r\n\
                  Content-Type: application/json\r\n\
                  Connection: close\r\n\r\n\
                  {\"choices\":[{\"message\":{\"content\":\"Hello world!\"}}]}",
            )
            .await
            .unwrap();
    });

    let result = adapter(port)
        .generate(&conversation("hi"), &GenerationParams::default())
        .await
        .unwrap();
    assert_eq!(result, "Hello world!");

    server.await.unwrap();
}

#[tokio::test]
async fn generate_rate_limit_is_retryable() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket
            .write_all(
                b"HTTP/1.1 429 Too Many Requests\r\n\
                  Content-Length: 0\r\n\
                  Connection: close\r\n\r\n",
            )
            .await
            .unwrap();
    });

    let err = adapter(port)
        .generate(&conversation("hi"), &GenerationParams::default())
        .await
        .unwrap_err();

    assert!(matches!(err, GaleError::RateLimited { .. }), "got {err:?}");
    assert!(err.is_retryable());

    server.await.unwrap();
}

// ---------------------------------------------------------------------------
// End-to-end engine session over the remote path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn engine_session_end_to_end() {
    let (listener, port) = mock_listener().await;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 8192];
        let _ = socket.read(&mut buf).await;

        socket.write_all(SSE_HEADERS).await.unwrap();
        socket.write_all(sse_chunk("Alice").as_bytes()).await.unwrap();
        socket.write_all(SSE_DONE).await.unwrap();
    });

    let engine = Engine::new(remote_config(port), Arc::new(UnusedBackend));
    let history = vec![
        Message::user("My name is Alice"),
        Message::assistant("Hi Alice"),
    ];
    let mut handle = engine
        .start_session("What's my name?", &history)
        .await
        .unwrap();

    assert!(!handle.first_token_seen());
    assert_eq!(
        handle.next_event().await,
        Some(GenerationEvent::Token("Alice".to_string()))
    );
    assert!(handle.first_token_seen());
    assert_eq!(handle.next_event().await, Some(GenerationEvent::Complete));
    assert_eq!(handle.state(), SessionState::Completed);

    server.await.unwrap();
}
