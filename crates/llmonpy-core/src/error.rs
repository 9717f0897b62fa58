//! Error kinds surfaced by the step runtime.
//!
//! `RateLimited` never appears here: [`llmonpy_providers::LlmClient::prompt`] recovers
//! from it internally via the rate limiter before a step ever sees a result.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("prompt response was not valid JSON after retries: {0}")]
    JsonFormat(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("no API key configured for provider {0}")]
    NoApiKey(String),

    #[error("child step {0} failed")]
    StepFailure(String),

    #[error("provider request timed out")]
    Timeout,

    #[error("template render error: {0}")]
    Template(String),

    #[error("{0}")]
    Other(String),
}

pub type StepResult<T> = Result<T, StepError>;

impl From<llmonpy_providers::ClientError> for StepError {
    fn from(err: llmonpy_providers::ClientError) -> Self {
        match err {
            llmonpy_providers::ClientError::RateLimited => {
                // Recovered internally by the client; reaching here means a caller
                // bypassed the client contract. Surface it as a provider error rather
                // than panicking the step.
                StepError::Provider("rate limit exceeded".to_string())
            }
            llmonpy_providers::ClientError::JsonFormat { attempts, last_error } => {
                StepError::JsonFormat(format!("{attempts} attempt(s): {last_error}"))
            }
            llmonpy_providers::ClientError::Provider(msg) => StepError::Provider(msg),
            llmonpy_providers::ClientError::NoApiKey(name) => StepError::NoApiKey(name),
            llmonpy_providers::ClientError::Timeout => StepError::Timeout,
        }
    }
}
