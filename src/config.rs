use std::env;

use crate::conversation::GenerationParams;

/// Which adapter family a descriptor selects. Closed set — dispatch is a
/// compile-time-checked match, not runtime probing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// In-process inference backend.
    Local,
    /// Hosted chat API or router-style API with the same wire shape.
    OpenAiCompat,
    /// Ollama-family server: native API plus an OpenAI-compatible one.
    Ollama,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::OpenAiCompat => "openai-compatible",
            Self::Ollama => "ollama",
        }
    }
}

/// Identifies the backend a session talks to. Owned by configuration,
/// read-only to the engine; a change takes effect on the next session.
#[derive(Clone, Debug)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    /// App-identifying headers required by router-style backends,
    /// e.g. ("HTTP-Referer", ...) and ("X-Title", ...).
    pub app_headers: Vec<(String, String)>,
}

impl std::fmt::Display for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // api_key intentionally omitted
        write!(
            f,
            "{} model={} endpoint={}",
            self.kind.as_str(),
            self.model,
            self.endpoint
        )
    }
}

/// Load-time options for the in-process backend.
#[derive(Clone, Debug)]
pub struct LoadOptions {
    pub model_path: String,
    pub context_size: u32,
    /// None = auto-detect; Some(-1) = all layers on GPU; Some(0) = CPU only.
    pub gpu_layers: Option<i32>,
    /// None = let the backend pick.
    pub threads: Option<u32>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            context_size: 4096,
            gpu_layers: None,
            threads: None,
        }
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an expert programming assistant integrated into a code editor.

Core principles:
- Be concise and direct in your responses
- Provide code examples without lengthy explanations unless asked
- Focus on solving the immediate problem
- Detect and work with the programming language being used

When generating code:
- Write clean, readable code following the language's best practices
- Include only essential comments
- Handle edge cases appropriately

Remember: prioritize clarity and brevity. Get straight to the solution.";

#[derive(Clone, Debug)]
pub struct Config {
    pub descriptor: ProviderDescriptor,
    pub params: GenerationParams,
    pub load: LoadOptions,
    pub system_prompt: String,
    /// Most-recent history messages included per request.
    pub history_window: usize,
}

impl Config {
    /// Build configuration from GALE_* environment variables.
    /// Missing values fall back to defaults; a missing API key for a
    /// hosted provider is only a warning since local setups need none.
    pub fn from_env() -> Self {
        let kind = match env::var("GALE_PROVIDER").as_deref() {
            Ok("openai") | Ok("openai-compatible") | Ok("openrouter") => ProviderKind::OpenAiCompat,
            Ok("ollama") | Ok("lmstudio") => ProviderKind::Ollama,
            Ok("local") | Err(_) => ProviderKind::Local,
            Ok(other) => {
                tracing::warn!("unknown GALE_PROVIDER '{other}' — falling back to local");
                ProviderKind::Local
            }
        };

        let endpoint = env::var("GALE_ENDPOINT").unwrap_or_else(|_| {
            match kind {
                ProviderKind::OpenAiCompat => "https://api.openai.com".to_string(),
                _ => "http://localhost:11434".to_string(),
            }
        });

        let api_key = env::var("GALE_API_KEY").ok();
        if api_key.is_none() && kind == ProviderKind::OpenAiCompat {
            tracing::warn!("GALE_API_KEY not set — hosted provider calls will fail auth");
        }

        let model = env::var("GALE_MODEL").unwrap_or_else(|_| match kind {
            ProviderKind::OpenAiCompat => "gpt-4o-mini".to_string(),
            _ => "llama3".to_string(),
        });

        let mut app_headers = Vec::new();
        if let Ok(referer) = env::var("GALE_APP_REFERER") {
            app_headers.push(("HTTP-Referer".to_string(), referer));
        }
        if let Ok(title) = env::var("GALE_APP_TITLE") {
            app_headers.push(("X-Title".to_string(), title));
        }

        let params = GenerationParams {
            temperature: env_parse("GALE_TEMPERATURE", 0.3),
            max_tokens: env_parse("GALE_MAX_TOKENS", 2048),
            top_p: env_parse("GALE_TOP_P", 0.95),
            top_k: env_parse("GALE_TOP_K", 40),
            repeat_penalty: env_parse("GALE_REPEAT_PENALTY", 1.1),
            stop_sequences: vec![],
        };

        let load = LoadOptions {
            model_path: env::var("GALE_MODEL_PATH").unwrap_or_default(),
            context_size: env_parse("GALE_CONTEXT_SIZE", 4096),
            gpu_layers: env::var("GALE_GPU_LAYERS")
                .ok()
                .and_then(|v| v.parse().ok()),
            threads: env::var("GALE_THREADS").ok().and_then(|v| v.parse().ok()),
        };

        if kind == ProviderKind::Local && load.model_path.is_empty() {
            tracing::warn!("GALE_MODEL_PATH not set — local model load will fail");
        }

        let system_prompt =
            env::var("GALE_SYSTEM_PROMPT").unwrap_or_else(|_| DEFAULT_SYSTEM_PROMPT.to_string());

        Config {
            descriptor: ProviderDescriptor {
                kind,
                endpoint,
                api_key,
                model,
                app_headers,
            },
            params,
            load,
            system_prompt,
            history_window: env_parse("GALE_HISTORY_WINDOW", 20),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("invalid value for {name}: '{raw}' — using default");
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_display_omits_api_key() {
        let descriptor = ProviderDescriptor {
            kind: ProviderKind::OpenAiCompat,
            endpoint: "https://api.openai.com".into(),
            api_key: Some("sk-secret".into()),
            model: "gpt-4o".into(),
            app_headers: vec![],
        };
        let shown = descriptor.to_string();
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("gpt-4o"));
    }
}
