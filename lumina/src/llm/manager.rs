//! Feature-route registry: maps logical features to (provider, model,
//! generation parameters).

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use config::RouteConfig;

use super::{ChatMessage, ChatRequest, LlmDriver, LlmError};

pub const FEATURE_CHAT: &str = "chat";
pub const FEATURE_DREAMING: &str = "dreaming";
pub const FEATURE_MEMORY_EXTRACT: &str = "memory_extract";
pub const FEATURE_EVOLUTION: &str = "evolution";

/// Resolved generation parameters for one call.
#[derive(Clone, Debug)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
}

/// Routes logical features ("chat", "dreaming", …) to concrete providers and
/// models. Providers are registered as drivers at bootstrap; routes come from
/// config and are frozen afterwards.
pub struct LlmManager {
    routes: HashMap<String, RouteConfig>,
    drivers: DashMap<String, Arc<dyn LlmDriver>>,
}

impl LlmManager {
    pub fn new(llm_config: &config::LlmConfig) -> Self {
        Self {
            routes: llm_config.routes.clone(),
            drivers: DashMap::new(),
        }
    }

    /// Registers the driver serving a provider id.
    pub fn register_driver(&self, provider_id: &str, driver: Arc<dyn LlmDriver>) {
        info!(provider = %provider_id, "LLM driver registered");
        self.drivers.insert(provider_id.to_string(), driver);
    }

    pub fn route(&self, feature: &str) -> Result<&RouteConfig, LlmError> {
        self.routes
            .get(feature)
            .ok_or_else(|| LlmError::RouteMissing(feature.to_string()))
    }

    /// Driver for a feature's provider.
    pub fn driver(&self, feature: &str) -> Result<Arc<dyn LlmDriver>, LlmError> {
        let route = self.route(feature)?;
        self.drivers
            .get(&route.provider)
            .map(|d| Arc::clone(d.value()))
            .ok_or_else(|| LlmError::ProviderMissing(route.provider.clone()))
    }

    pub fn model_name(&self, feature: &str) -> Result<String, LlmError> {
        Ok(self.route(feature)?.model.clone())
    }

    /// Generation parameters for a feature, optionally perturbed by the
    /// character's current arousal: higher arousal raises temperature,
    /// bounded to [0.0, 1.5].
    pub fn parameters(
        &self,
        feature: &str,
        arousal: Option<f32>,
    ) -> Result<GenerationParams, LlmError> {
        let route = self.route(feature)?;
        let mut temperature = route.temperature;
        if let Some(arousal) = arousal {
            temperature = (temperature + 0.3 * arousal).clamp(0.0, 1.5);
        }
        Ok(GenerationParams {
            temperature,
            top_p: route.top_p,
            presence_penalty: route.presence_penalty,
            frequency_penalty: route.frequency_penalty,
        })
    }

    /// Builds a [`ChatRequest`] for a feature with resolved model and
    /// parameters.
    pub fn request_for(
        &self,
        feature: &str,
        messages: Vec<ChatMessage>,
        arousal: Option<f32>,
    ) -> Result<ChatRequest, LlmError> {
        let params = self.parameters(feature, arousal)?;
        let mut request = ChatRequest::new(messages, self.model_name(feature)?);
        request.temperature = params.temperature;
        request.top_p = params.top_p;
        request.presence_penalty = params.presence_penalty;
        request.frequency_penalty = params.frequency_penalty;
        Ok(request)
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.drivers.iter().map(|e| e.key().clone()).collect()
    }
}
