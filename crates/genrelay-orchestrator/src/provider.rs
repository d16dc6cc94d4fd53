//! Provider capability consumed by the facade.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use genrelay_core::ProviderModel;
use tokio_util::sync::CancellationToken;

/// Sampling parameters forwarded to the provider.
#[derive(Debug, Clone, Default)]
pub struct CallParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
}

/// One fully assembled provider request.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub target: ProviderModel,
    pub system_prompt: String,
    pub user_prompt: String,
    pub params: CallParams,
}

/// Raw provider output plus token accounting.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A single upstream generative provider.
///
/// An implementation that can classify its own failures should put a typed
/// `GenError` in the error chain; anything else is classified by message
/// patterns at the retry boundary.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn perform_call(
        &self,
        request: &ProviderRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ProviderResponse>;
}

/// Providers keyed by the id used in route specs.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).cloned()
    }
}
