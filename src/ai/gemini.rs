//! Gemini REST client
//!
//! Talks to the Google Generative Language API with the first key from
//! `GEMINI_API_KEYS`.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, Stream};
use futures_util::{future, StreamExt, TryStreamExt};
use reqwest::Client;
use tracing::{debug, warn};

use super::{
    AiError, AiResult, GenerateContentRequest, GenerateContentResponse, GenerationConfig,
    SseDecoder, TextGenerator,
};
use crate::config::{Env, EnvKey};

/// Default model for streamed replies
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Appended to every client message so replies come back as plain paragraphs
pub const PLAIN_TEXT_INSTRUCTION: &str =
    ". Don't use markdown syntax instead just write text paragraphs.";

const API_KEY_HEADER: &str = "x-goog-api-key";

const FINISH_STOP: &str = "STOP";

/// Client settings that don't come from the environment file
#[derive(Debug, Clone)]
pub struct GeminiOptions {
    /// Model used by [`TextGenerator::generate`]
    pub model: String,
    /// API base URL, without trailing slash
    pub base_url: String,
}

impl Default for GeminiOptions {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }
}

/// Gemini API client
#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    /// Create a client, reading the API key from the environment
    pub fn new(env: &Env, options: GeminiOptions) -> AiResult<Self> {
        let api_key = env
            .get_list(EnvKey::GeminiApiKeys)?
            .first()
            .cloned()
            .ok_or(AiError::NoApiKey)?;

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_key,
            model: options.model,
            base_url: options.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Get the model name
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a complete response in one request
    pub async fn generate_content(
        &self,
        model: &str,
        content: &str,
        config: Option<GenerationConfig>,
    ) -> AiResult<GenerateContentResponse> {
        let url = format!("{}/models/{}:generateContent", self.base_url, model);
        debug!("Sending request to Gemini API: {}", url);

        let response = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&GenerateContentRequest::user_text(content, config))
            .send()
            .await?;

        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    /// Stream a response chunk by chunk.
    ///
    /// The request is sent when the stream is first polled.
    pub fn stream_content(
        &self,
        model: &str,
        content: &str,
        config: Option<GenerationConfig>,
    ) -> BoxStream<'static, AiResult<GenerateContentResponse>> {
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let request = self
            .http
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&GenerateContentRequest::user_text(content, config));

        let body = async move {
            debug!("Streaming from Gemini API: {}", url);
            let response = check_status(request.send().await?).await?;
            Ok::<_, AiError>(decode_events(Box::pin(response.bytes_stream())))
        };

        stream::once(body).try_flatten().boxed()
    }
}

impl TextGenerator for GeminiClient {
    fn generate(&self, content: &str) -> BoxStream<'static, AiResult<String>> {
        let prompt = format!("{}{}", content, PLAIN_TEXT_INSTRUCTION);
        self.stream_content(&self.model, &prompt, None)
            .try_filter_map(|chunk| {
                if let Some(reason) = chunk.finish_reason().filter(|r| *r != FINISH_STOP) {
                    warn!("Gemini reply ended early: {}", reason);
                }
                future::ready(Ok(chunk.text()))
            })
            .boxed()
    }
}

async fn check_status(response: reqwest::Response) -> AiResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    warn!("Gemini API error: {} - {}", status, body);
    Err(AiError::Api {
        status: status.as_u16(),
        body,
    })
}

struct DecodeState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

/// Decode an SSE body into response chunks as bytes arrive
fn decode_events<S, B>(body: S) -> impl Stream<Item = AiResult<GenerateContentResponse>> + Send
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
{
    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };
    stream::try_unfold(state, next_event::<S, B>)
}

async fn next_event<S, B>(
    mut state: DecodeState<S>,
) -> AiResult<Option<(GenerateContentResponse, DecodeState<S>)>>
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
{
    loop {
        if let Some(data) = state.pending.pop_front() {
            let chunk: GenerateContentResponse = serde_json::from_str(&data)?;
            return Ok(Some((chunk, state)));
        }
        if state.done {
            return Ok(None);
        }

        match state.body.next().await {
            Some(bytes) => {
                let events = state.decoder.push(bytes?.as_ref());
                state.pending.extend(events);
            }
            None => {
                state.done = true;
                let events = state.decoder.finish();
                state.pending.extend(events);
            }
        }
    }
}
