use thiserror::Error;

#[derive(Debug, Error)]
pub enum GaleError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("cancelled")]
    Cancelled,

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("auth failed for {provider}: {message}")]
    Auth { provider: String, message: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("out of memory: {detail}")]
    OutOfMemory { detail: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("model load failed: {message}")]
    ModelLoad { message: String },

    #[error("a generation is already running")]
    Busy,

    #[error("{0}")]
    Other(String),
}

impl GaleError {
    /// Returns true for transient errors that may succeed on retry.
    /// Auth, NotFound, OutOfMemory and parse errors are never retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(e) => {
                // Request build errors (bad URL, bad body) won't improve on retry
                !e.is_builder()
            }
            Self::Timeout(_) => true,
            Self::RateLimited { .. } => true,
            Self::Upstream { status, .. } => {
                // 5xx = server fault (retryable), 4xx = client error (not)
                // status: None = ambiguous (not from HTTP) → safe default: NOT retryable
                status.is_some_and(|s| s >= 500)
            }
            _ => false,
        }
    }

    /// Extract provider name from structured error variants.
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider } => Some(provider),
            Self::Auth { provider, .. } => Some(provider),
            Self::Upstream { provider, .. } => Some(provider),
            _ => None,
        }
    }

    /// Produce a short message safe for display in the editor.
    /// Does not leak URLs, keys, or raw upstream bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(_) => "network request to provider failed".to_string(),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::Cancelled => "generation cancelled".to_string(),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider} — try again shortly")
            }
            Self::Auth { provider, .. } => {
                format!("authentication failed for {provider} — check your API key")
            }
            Self::Upstream {
                provider, message, ..
            } => format!("upstream error from {provider}: {message}"),
            Self::NotFound { what } => format!("not found: {what}"),
            Self::OutOfMemory { .. } => {
                "out of memory — reduce the context size or use a smaller model".to_string()
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::ModelLoad { message } => format!("model load failed: {message}"),
            Self::Busy => "a generation is already running".to_string(),
            Self::Other(msg) => msg.clone(),
        }
    }

    /// Fallback form for failures with no better classification.
    pub fn operation(op: &str, raw: impl std::fmt::Display) -> Self {
        Self::Other(format!("{op} failed: {raw}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_5xx_is_retryable_4xx_is_not() {
        let server = GaleError::Upstream {
            provider: "openai".into(),
            message: "boom".into(),
            status: Some(503),
        };
        assert!(server.is_retryable());

        let client = GaleError::Upstream {
            provider: "openai".into(),
            message: "bad request".into(),
            status: Some(400),
        };
        assert!(!client.is_retryable());

        let ambiguous = GaleError::Upstream {
            provider: "openai".into(),
            message: "?".into(),
            status: None,
        };
        assert!(!ambiguous.is_retryable());
    }

    #[test]
    fn fatal_classes_are_not_retryable() {
        let auth = GaleError::Auth {
            provider: "openrouter".into(),
            message: "401".into(),
        };
        assert!(!auth.is_retryable());
        assert!(!GaleError::Busy.is_retryable());
        assert!(
            !GaleError::OutOfMemory {
                detail: "kv cache".into()
            }
            .is_retryable()
        );
        assert!(!GaleError::Cancelled.is_retryable());
    }

    #[test]
    fn oom_message_carries_remediation_hint() {
        let err = GaleError::OutOfMemory {
            detail: "ggml alloc".into(),
        };
        let msg = err.user_message();
        assert!(msg.contains("smaller model"), "got: {msg}");
        assert!(!msg.contains("ggml"), "raw detail should not leak: {msg}");
    }

    #[test]
    fn auth_message_does_not_leak_detail() {
        let err = GaleError::Auth {
            provider: "openai".into(),
            message: "Bearer sk-123 rejected".into(),
        };
        assert!(!err.user_message().contains("sk-123"));
    }
}
