//! The `prompt(...) -> Response` contract every provider client implements.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ClientError;

/// One outbound prompt request.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub id: Uuid,
    pub text: String,
    pub system: Option<String>,
    pub json_mode: bool,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl PromptRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            system: None,
            json_mode: false,
            temperature: 0.0,
            max_output_tokens: 1024,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn json_mode(mut self, enabled: bool) -> Self {
        self.json_mode = enabled;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }
}

/// What a completed prompt produced. `dict` is populated only when
/// `json_mode` was requested and the response parsed successfully.
#[derive(Debug, Clone)]
pub struct PromptResponse {
    pub text: String,
    pub dict: Option<Value>,
    pub input_cost: f64,
    pub output_cost: f64,
}

impl PromptResponse {
    pub fn total_cost(&self) -> f64 {
        self.input_cost + self.output_cost
    }
}

/// Uniform entry point into a provider. Every implementation is expected to
/// gate its HTTP call behind a [`llmonpy_ratellmiter::RateLimiter`] ticket and
/// translate that provider's 429 into the limiter's rate-limit-exceeded path
/// internally — `RateLimited` must never be returned from `prompt`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, ClientError>;

    /// A cheap liveness probe used by the rate limiter while paused after a 429.
    /// Returns `true` while the provider is still refusing requests.
    async fn is_blocked(&self) -> bool;
}
