//! AI provider abstractions and implementations.
//!
//! Document extraction and property matching only need text generation, so
//! a single trait covers both; Gemini in production, mock in tests.

pub mod gemini;
pub mod mock;

pub use gemini::{GeminiConfig, GeminiTextProvider};
pub use mock::MockTextProvider;

use async_trait::async_trait;
use thiserror::Error;

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Content filtered")]
    ContentFiltered,

    #[error("Network error: {0}")]
    NetworkError(String),
}

/// Result of a provider response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: Option<String>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub finish_reason: FinishReason,
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
    ContentFilter,
}

/// Generation parameters for AI requests.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    /// Temperature (0.0 - 2.0).
    pub temperature: Option<f32>,

    /// Maximum output tokens.
    pub max_tokens: Option<i32>,

    /// Ask for `application/json` output.
    pub json_output: bool,
}

impl GenerationParams {
    /// Deterministic JSON output, as used by extraction and matching prompts.
    pub fn structured() -> Self {
        Self {
            temperature: Some(0.0),
            max_tokens: Some(8192),
            json_output: true,
        }
    }
}

/// Raw document attached to a prompt.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Trait for text/JSON generation providers (e.g., Gemini).
#[async_trait]
pub trait TextProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Generate text response.
    async fn generate(
        &self,
        prompt: &str,
        documents: &[DocumentContext],
        params: &GenerationParams,
    ) -> Result<ProviderResponse, ProviderError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), ProviderError>;
}
