//! Embedding providers
//!
//! One trait, two variants. Which one is used is decided once by
//! [`select_provider`]; callers only ever see `dyn EmbeddingProvider`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::embedding::{HtpModel, EMBEDDING_DIM};
use crate::core::config::{EmbeddingConfig, ProviderKind};
use crate::error::{ConfigError, ProviderError};

/// Longest text sent to a remote provider, in bytes.
/// Longer inputs are cut on a char boundary.
const MAX_EMBED_CHARS: usize = 8_000;

pub trait EmbeddingProvider: Send + Sync {
    /// Identity persisted with an index; indexes are never mixed across ids
    fn id(&self) -> String;

    fn dimension(&self) -> usize;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError>;

    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("no embedding returned".to_string()))
    }
}

/// Pick the provider for `config`.
///
/// `auto` resolves to remote when a credential is configured, local otherwise.
pub fn select_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>, ConfigError> {
    let remote = match config.provider {
        ProviderKind::Local => false,
        ProviderKind::Remote => true,
        ProviderKind::Auto => config.api_key().is_some(),
    };

    if remote {
        let provider = RemoteProvider::new(config)?;
        info!(model = %config.model, base_url = %config.base_url, "using remote embedding provider");
        Ok(Arc::new(provider))
    } else {
        info!("no remote credential configured, using local embeddings");
        Ok(Arc::new(LocalProvider::new()))
    }
}

/// Deterministic, offline provider backed by [`HtpModel`]
#[derive(Default)]
pub struct LocalProvider {
    model: HtpModel,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmbeddingProvider for LocalProvider {
    fn id(&self) -> String {
        format!("local:htp-{}", EMBEDDING_DIM)
    }

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.model.embed(t)).collect())
    }
}

/// OpenAI-compatible `/v1/embeddings` client
pub struct RemoteProvider {
    client: reqwest::blocking::Client,
    url: String,
    model: String,
    api_key: String,
    dimension: usize,
    batch_size: usize,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl RemoteProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key()
            .ok_or_else(|| ConfigError::MissingCredential("embedding api key".to_string()))?
            .to_string();

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "embedding",
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            url: format!("{}/v1/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            dimension: config.dimension,
            batch_size: config.batch_size.max(1),
            timeout_secs: config.timeout_secs,
        })
    }

    fn embed_chunk(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let request = EmbedRequest {
            model: &self.model,
            input: texts.iter().map(|t| truncate_for_embedding(t)).collect(),
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(match status.as_u16() {
                401 | 403 => ProviderError::Auth {
                    status: status.as_u16(),
                    body,
                },
                429 => ProviderError::RateLimited(body),
                code => ProviderError::Status { status: code, body },
            });
        }

        let body: EmbedResponse = response
            .json()
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        if body.data.len() != texts.len() {
            return Err(ProviderError::Malformed(format!(
                "{} embeddings for {} inputs",
                body.data.len(),
                texts.len()
            )));
        }

        let mut data = body.data;
        if data.iter().all(|d| d.index.is_some()) {
            data.sort_by_key(|d| d.index);
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }

    fn transport_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout_secs)
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

impl EmbeddingProvider for RemoteProvider {
    fn id(&self) -> String {
        format!("remote:{}:{}", self.model, self.dimension)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for (i, chunk) in texts.chunks(self.batch_size).enumerate() {
            debug!(batch = i, size = chunk.len(), "requesting embeddings");
            out.extend(self.embed_chunk(chunk)?);
        }
        Ok(out)
    }
}

fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= MAX_EMBED_CHARS {
        return text;
    }
    let mut end = MAX_EMBED_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
