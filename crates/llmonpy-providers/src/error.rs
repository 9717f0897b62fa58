//! Client-facing error kinds.
//!
//! `RateLimited` never escapes a client: [`crate::traits::LlmClient::prompt`]
//! recovers from it internally via the rate limiter before returning.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("rate limit exceeded")]
    RateLimited,

    #[error("response was not valid JSON after {attempts} attempt(s): {last_error}")]
    JsonFormat { attempts: u32, last_error: String },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("no API key configured for provider {0}")]
    NoApiKey(String),

    #[error("provider request timed out")]
    Timeout,
}
