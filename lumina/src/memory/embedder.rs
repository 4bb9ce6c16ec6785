//! Embedder trait: produces dense vectors from text for store writes and
//! query embedding. Implementations can wrap OpenAI-compatible APIs or mock
//! embedders for tests.

use async_openai::{
    config::OpenAIConfig,
    types::embeddings::{CreateEmbeddingRequest, EmbeddingInput},
    Client,
};
use async_trait::async_trait;

use super::MemoryError;

/// Embedding compute is bounded; a slow provider fails the call rather than
/// stalling a chat request.
const EMBED_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Produces fixed-size float vectors from text.
///
/// Implementations must be `Send + Sync` for use from async store methods.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embeds each text into a vector of dimension [`Embedder::dimension`],
    /// one vector per input in the same order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, MemoryError>;

    /// Vector dimension returned by [`Embedder::embed`].
    fn dimension(&self) -> usize;
}

/// OpenAI Embeddings client implementing [`Embedder`]. Default model is
/// `text-embedding-3-small` (1536 dimensions); any OpenAI-compatible endpoint
/// works via a custom [`OpenAIConfig`] base url.
pub struct OpenAIEmbedder {
    config: OpenAIConfig,
    model: String,
    dimensions: usize,
}

impl OpenAIEmbedder {
    /// API key from `OPENAI_API_KEY` env.
    pub fn new(model: impl Into<String>) -> Self {
        let model = model.into();
        let dimensions = Self::model_dimensions(&model);
        Self {
            config: OpenAIConfig::new(),
            model,
            dimensions,
        }
    }

    /// Custom config (key, base url) for alternate providers.
    pub fn with_config(config: OpenAIConfig, model: impl Into<String>) -> Self {
        let model = model.into();
        let dimensions = Self::model_dimensions(&model);
        Self {
            config,
            model,
            dimensions,
        }
    }

    fn model_dimensions(model: &str) -> usize {
        match model {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        }
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, MemoryError> {
        let inputs: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();
        let input = if inputs.len() == 1 {
            EmbeddingInput::String(inputs.into_iter().next().unwrap_or_default())
        } else {
            EmbeddingInput::StringArray(inputs)
        };

        let request = CreateEmbeddingRequest {
            input,
            model: self.model.clone(),
            ..Default::default()
        };

        let client = Client::with_config(self.config.clone());
        let response = tokio::time::timeout(EMBED_TIMEOUT, client.embeddings().create(request))
            .await
            .map_err(|_| MemoryError::Embedding("embedding compute timed out".to_string()))?
            .map_err(|e| MemoryError::Embedding(format!("embeddings API error: {e}")))?;

        if response.data.is_empty() {
            return Err(MemoryError::Embedding("no embedding returned".to_string()));
        }

        Ok(response.data.into_iter().map(|e| e.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }
}
