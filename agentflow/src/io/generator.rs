//! Generation Service abstraction.
//!
//! The [`Generator`] trait decouples stages from the text-generation backend
//! (Gemini over HTTP, or a local command). Tests use scripted generators that
//! return predetermined text without touching the network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::io::command::CommandGenerator;
use crate::io::config::{GeneratorBackend, GeneratorConfig};
use crate::io::gemini::GeminiGenerator;

/// One prompt sent to the Generation Service.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Who is asking (stage name or dispatch step); used for tracing.
    pub label: String,
    pub prompt: String,
    pub temperature: f32,
    /// Ask the backend for a JSON response when it supports that.
    pub expect_json: bool,
}

/// Failure reported by a Generation Service call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("rate limit exceeded (HTTP 429): {body}")]
    RateLimited { body: String },
    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("service blocked the prompt: {0}")]
    Blocked(String),
    #[error("response contained no text: {0}")]
    Empty(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generator command failed: {0}")]
    Command(String),
}

impl GenerationError {
    /// Errors a later call might not hit (network, throttling, time).
    pub fn is_transient(&self) -> bool {
        match self {
            GenerationError::Transport(_)
            | GenerationError::RateLimited { .. }
            | GenerationError::Timeout(_) => true,
            GenerationError::Status { status, .. } => *status >= 500,
            GenerationError::Blocked(_)
            | GenerationError::Empty(_)
            | GenerationError::Malformed(_)
            | GenerationError::Command(_) => false,
        }
    }
}

/// Abstraction over text-generation backends.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate text for `request`. Retries, if any, are the backend's concern.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

#[async_trait]
impl<G: Generator + ?Sized> Generator for Arc<G> {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        (**self).generate(request).await
    }
}

/// Configuration or connectivity problem detected before a backend is usable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("environment variable {0} is not set")]
    MissingApiKey(String),
    #[error("environment variable {0} still holds a placeholder value")]
    PlaceholderApiKey(String),
    #[error("generator.command must be a non-empty array for the command backend")]
    MissingCommand,
    #[error("http client setup failed: {0}")]
    Client(String),
}

/// Build the configured backend.
pub fn build_generator(config: &GeneratorConfig) -> Result<Arc<dyn Generator>, BackendError> {
    match config.backend {
        GeneratorBackend::Gemini => {
            let api_key = read_api_key(&config.api_key_env)?;
            let generator = GeminiGenerator::new(
                api_key,
                config.model.clone(),
                config.base_url.clone(),
                Duration::from_secs(config.request_timeout_secs),
            )?;
            Ok(Arc::new(generator))
        }
        GeneratorBackend::Command => {
            if config.command.is_empty() || config.command[0].trim().is_empty() {
                return Err(BackendError::MissingCommand);
            }
            Ok(Arc::new(CommandGenerator::new(
                config.command.clone(),
                config.output_limit_bytes,
            )))
        }
    }
}

fn read_api_key(var: &str) -> Result<String, BackendError> {
    let value = std::env::var(var).map_err(|_| BackendError::MissingApiKey(var.to_string()))?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BackendError::MissingApiKey(var.to_string()));
    }
    if trimmed.contains("your_key_here") || trimmed.contains("YOUR_API_KEY") {
        return Err(BackendError::PlaceholderApiKey(var.to_string()));
    }
    Ok(trimmed.to_string())
}
