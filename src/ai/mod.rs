//! Generative AI client module
//!
//! Turns a client message into a lazily streamed sequence of text chunks.
//! The WebSocket server only sees the [`TextGenerator`] trait; the Gemini
//! REST client is the production implementation.

mod gemini;
mod sse;
mod types;

use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::config::EnvError;

use sse::SseDecoder;

pub use gemini::*;
pub use types::*;

/// Errors that can occur while talking to the AI service
#[derive(Debug, Error)]
pub enum AiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("No API key configured")]
    NoApiKey,

    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Result type for AI operations
pub type AiResult<T> = Result<T, AiError>;

/// Source of streamed text responses
pub trait TextGenerator: Send + Sync {
    /// Start generating a response to `content`.
    ///
    /// Nothing is sent until the stream is first polled. The stream ends
    /// when the response is complete.
    fn generate(&self, content: &str) -> BoxStream<'static, AiResult<String>>;
}
