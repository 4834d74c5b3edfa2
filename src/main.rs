use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;

use gale::backend::{BackendInput, InferenceBackend};
use gale::config::{Config, LoadOptions, ProviderKind};
use gale::conversation::GenerationParams;
use gale::engine::Engine;
use gale::error::GaleError;
use gale::session::GenerationEvent;

/// Stand-in backend for the CLI harness. Remote providers never touch it;
/// selecting the local provider without a real backend wired in fails at
/// load time with a clear message.
struct NoBackend;

#[async_trait::async_trait]
impl InferenceBackend for NoBackend {
    async fn load(&self, _options: &LoadOptions) -> Result<(), GaleError> {
        Err(GaleError::ModelLoad {
            message: "no local inference backend compiled into this binary".to_string(),
        })
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
        Err(GaleError::ModelLoad {
            message: "no local inference backend compiled into this binary".to_string(),
        })
    }

    async fn stream(
        &self,
        _input: BackendInput,
        _params: &GenerationParams,
    ) -> Result<mpsc::Receiver<Result<String, GaleError>>, GaleError> {
        Err(GaleError::ModelLoad {
            message: "no local inference backend compiled into this binary".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env();
    if config.descriptor.kind == ProviderKind::Local {
        tracing::warn!("local provider selected; this harness has no inference backend");
    }
    tracing::info!(descriptor = %config.descriptor, "gale starting");

    let engine = Engine::new(config, Arc::new(NoBackend));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let prompt = if args.is_empty() {
        "Write a haiku about wind.".to_string()
    } else {
        args.join(" ")
    };

    let mut handle = engine.start_session(&prompt, &[]).await?;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, cancelling");
                handle.cancel();
                continue;
            }
            event = handle.next_event() => event,
        };

        match event {
            Some(GenerationEvent::Token(text)) => {
                print!("{text}");
                std::io::stdout().flush().ok();
            }
            Some(GenerationEvent::Complete) => {
                println!();
                break;
            }
            Some(GenerationEvent::Cancelled) => {
                println!();
                tracing::info!("generation cancelled");
                break;
            }
            Some(GenerationEvent::Error { kind, message }) => {
                println!();
                anyhow::bail!("generation failed ({kind}): {message}");
            }
            None => break,
        }
    }

    Ok(())
}
