//! OpenAI chat-completions client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use llmonpy_ratellmiter::{LivenessProbe, RateLimiter, RateLimiterConfig, RateLimiterMonitor};

use crate::error::ClientError;
use crate::json_repair::parse_with_repairs;
use crate::pricing::openai_pricing;
use crate::traits::{LlmClient, PromptRequest, PromptResponse};

const MAX_JSON_REPAIR_ATTEMPTS: u32 = 3;

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

struct OpenAiProbe {
    client: Client,
    base_url: String,
    api_key: String,
}

#[async_trait]
impl LivenessProbe for OpenAiProbe {
    async fn is_blocked(&self) -> bool {
        match self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
        {
            Ok(response) => response.status() == StatusCode::TOO_MANY_REQUESTS,
            Err(_) => true,
        }
    }
}

/// OpenAI `LlmClient`, bound to one model and gated by its own [`RateLimiter`].
///
/// A client is a (provider, model) pair: a model list is the Cartesian
/// product of clients and temperatures, not of clients and model names.
pub struct OpenAiClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    limiter: Arc<RateLimiter>,
}

impl OpenAiClient {
    pub fn new(api_key: String, model: String, rpm: u32, monitor: &Arc<RateLimiterMonitor>) -> Self {
        Self::with_base_url(api_key, model, "https://api.openai.com/v1".to_string(), rpm, monitor)
    }

    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: String,
        rpm: u32,
        monitor: &Arc<RateLimiterMonitor>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build OpenAI HTTP client");

        let probe = Arc::new(OpenAiProbe {
            client: http.clone(),
            base_url: base_url.clone(),
            api_key: api_key.clone(),
        });
        let limiter_name = format!("openai:{model}");
        let limiter = RateLimiter::new(limiter_name, RateLimiterConfig::new(rpm), probe);
        monitor.register(Arc::clone(&limiter));

        Self { http, api_key, base_url, model, limiter }
    }

    /// Reads `OPENAI_API_KEY` (or `LLMONPY_OPENAI_API_KEY`). Returns
    /// `NoApiKey` if neither is set, mirroring `filterClientsThatDidntStart`.
    pub fn from_env(model: String, rpm: u32, monitor: &Arc<RateLimiterMonitor>) -> Result<Self, ClientError> {
        let api_key = std::env::var("LLMONPY_OPENAI_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| ClientError::NoApiKey("openai".to_string()))?;
        Ok(Self::new(api_key, model, rpm, monitor))
    }

    fn to_request(&self, model: &str, request: &PromptRequest) -> ChatCompletionRequest {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(ChatMessage { role: "system".to_string(), content: system.clone() });
        }
        messages.push(ChatMessage { role: "user".to_string(), content: request.text.clone() });

        ChatCompletionRequest {
            model: model.to_string(),
            messages,
            temperature: Some(request.temperature),
            max_tokens: Some(request.max_output_tokens),
            response_format: request
                .json_mode
                .then(|| ResponseFormat { format_type: "json_object".to_string() }),
            stream: false,
        }
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> ClientError {
        if let Ok(parsed) = serde_json::from_str::<OpenAiErrorResponse>(body) {
            if status == StatusCode::TOO_MANY_REQUESTS || parsed.error.error_type == "rate_limit_exceeded" {
                return ClientError::RateLimited;
            }
            return ClientError::Provider(format!("[{}] {}", status.as_u16(), parsed.error.message));
        }
        ClientError::Provider(format!("[{}] {}", status.as_u16(), body))
    }

    async fn send_once(&self, model: &str, request: &PromptRequest) -> Result<ChatCompletionResponse, ClientError> {
        let body = self.to_request(model, request);
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ClientError::Timeout
                } else {
                    ClientError::Provider(err.to_string())
                }
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || text.is_empty() && !status.is_success() {
            return Err(ClientError::RateLimited);
        }
        if !status.is_success() {
            return Err(self.parse_error(status, &text));
        }
        serde_json::from_str(&text).map_err(|err| ClientError::Provider(err.to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, ClientError> {
        let model = self.model.as_str();
        let mut ticket = self.limiter.get_ticket().await;

        loop {
            match self.send_once(model, &request).await {
                Ok(raw) => {
                    let choice = raw
                        .choices
                        .into_iter()
                        .next()
                        .ok_or_else(|| ClientError::Provider("no choices in response".to_string()))?;
                    let pricing = openai_pricing(model);
                    let input_cost = pricing.input_cost(raw.usage.prompt_tokens);
                    let output_cost = pricing.output_cost(raw.usage.completion_tokens);

                    let dict = if request.json_mode {
                        Some(self.parse_json_response(&choice.message.content)?)
                    } else {
                        None
                    };

                    debug!(provider = "openai", tickets_rate_limited = ticket.was_rate_limited(), "prompt complete");
                    return Ok(PromptResponse { text: choice.message.content, dict, input_cost, output_cost });
                }
                Err(ClientError::RateLimited) => {
                    warn!(provider = "openai", "rate limited, waiting for reissue");
                    ticket = self.limiter.wait_for_ticket_after_rate_limit_exceeded(ticket).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn is_blocked(&self) -> bool {
        OpenAiProbe { client: self.http.clone(), base_url: self.base_url.clone(), api_key: self.api_key.clone() }
            .is_blocked()
            .await
    }
}

impl OpenAiClient {
    fn parse_json_response(&self, text: &str) -> Result<serde_json::Value, ClientError> {
        parse_with_repairs(text).map(|(value, _)| value).map_err(|err| ClientError::JsonFormat {
            attempts: MAX_JSON_REPAIR_ATTEMPTS,
            last_error: err.to_string(),
        })
    }
}
