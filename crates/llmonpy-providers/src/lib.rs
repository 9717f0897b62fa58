//! LLM provider clients for LLMonPy: a uniform [`LlmClient`] contract plus the
//! OpenAI and Anthropic implementations, each gated by its own
//! `llmonpy-ratellmiter` rate limiter.

pub mod anthropic;
pub mod error;
pub mod json_repair;
pub mod openai;
pub mod pricing;
pub mod traits;

pub use anthropic::AnthropicClient;
pub use error::ClientError;
pub use openai::OpenAiClient;
pub use pricing::{anthropic_pricing, openai_pricing, ModelPricing, UNKNOWN_MODEL_PRICING};
pub use traits::{LlmClient, PromptRequest, PromptResponse};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
