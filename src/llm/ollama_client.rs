//! Streaming client for the Ollama `/api/generate` endpoint.
//!
//! Behaviour:
//! - Each turn is one streaming `POST /api/generate` carrying the prompt, the images
//!   for the turn, and the continuation token of the previous turn.
//! - Readiness is checked via `GET /api/version`.
//! - The model can be warmed up with a one-token, non-streaming generate.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::OllamaConfig;
use crate::llm::error::{TransportError, TransportResult};
use crate::llm::transport::{ByteStream, TransportFuture, TurnRequest, TurnTransport};

/// Warm-up prompt: minimal non-empty prompt.
const WARMUP_PROMPT: &str = " ";
/// Warm-up token budget.
const WARMUP_NUM_PREDICT: u32 = 1;

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a [i64]>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<&'a str>,
}

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
}

/// HTTP transport to an Ollama server.
#[derive(Debug)]
pub struct OllamaClient {
    client: reqwest::Client,
    config: OllamaConfig,
    generate_url: Url,
    version_url: Url,
}

impl OllamaClient {
    /// Build a client for the configured server.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid or the HTTP client cannot be built.
    pub fn new(config: OllamaConfig) -> TransportResult<Self> {
        let base = config.base_url.trim_end_matches('/');
        let generate_url = Url::parse(&format!("{base}/api/generate"))?;
        let version_url = Url::parse(&format!("{base}/api/version"))?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TransportError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            config,
            generate_url,
            version_url,
        })
    }

    /// Settings this client was built with.
    #[must_use]
    pub const fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Prompt sent for `text`: the text followed by the formatting instructions.
    #[must_use]
    pub fn prompt_for(&self, text: &str) -> String {
        match self.config.format_instructions.as_deref() {
            Some(instructions) => format!("{text}\n\n{instructions}"),
            None => text.to_string(),
        }
    }

    /// Server version string.
    ///
    /// # Errors
    /// Returns an error if the server is unreachable or answers with a failure.
    pub async fn version(&self) -> TransportResult<String> {
        let response = self.client.get(self.version_url.clone()).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<VersionResponse>().await?.version)
    }

    /// Whether the server answers its version probe.
    pub async fn is_ready(&self) -> bool {
        match self.version().await {
            Ok(version) => {
                tracing::debug!(%version, url = %self.version_url, "ollama is ready");
                true
            }
            Err(err) => {
                tracing::debug!(error = %err, url = %self.version_url, "ollama not ready");
                false
            }
        }
    }

    /// Load the model into memory with a one-token generate.
    ///
    /// # Errors
    /// Returns an error if the warm-up request fails.
    pub async fn preload_model(&self) -> TransportResult<()> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt: WARMUP_PROMPT,
            stream: false,
            options: GenerateOptions {
                temperature: self.config.temperature,
                num_predict: Some(WARMUP_NUM_PREDICT),
            },
            keep_alive: self.config.keep_alive.as_deref(),
            context: None,
            images: Vec::new(),
        };

        let response = self
            .client
            .post(self.generate_url.clone())
            .json(&request)
            .send()
            .await?;
        ensure_success(response).await?;
        tracing::info!(model = %self.config.model, "model preloaded");
        Ok(())
    }
}

impl TurnTransport for OllamaClient {
    fn send_turn(&self, request: TurnRequest) -> TransportFuture<'_, TransportResult<ByteStream>> {
        Box::pin(async move {
            let prompt = self.prompt_for(&request.text);
            let body = GenerateRequest {
                model: &self.config.model,
                prompt: &prompt,
                stream: true,
                options: GenerateOptions {
                    temperature: self.config.temperature,
                    num_predict: None,
                },
                keep_alive: self.config.keep_alive.as_deref(),
                context: request.continuation_token.as_deref(),
                images: request
                    .attachments
                    .iter()
                    .map(|image| image.data.as_str())
                    .collect(),
            };

            let response = self
                .client
                .post(self.generate_url.clone())
                .json(&body)
                .send()
                .await?;
            let response = ensure_success(response).await?;
            tracing::debug!(
                model = %self.config.model,
                images = body.images.len(),
                "generate stream opened"
            );

            Ok(response
                .bytes_stream()
                .map(|chunk| chunk.map_err(TransportError::from))
                .boxed())
        })
    }
}

async fn ensure_success(response: reqwest::Response) -> TransportResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}
