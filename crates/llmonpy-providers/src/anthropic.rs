//! Anthropic Messages API client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use llmonpy_ratellmiter::{LivenessProbe, RateLimiter, RateLimiterConfig, RateLimiterMonitor};

use crate::error::ClientError;
use crate::json_repair::parse_with_repairs;
use crate::pricing::anthropic_pricing;
use crate::traits::{LlmClient, PromptRequest, PromptResponse};

const MAX_JSON_REPAIR_ATTEMPTS: u32 = 3;
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic's Messages API has no `response_format: json_object` switch, so
/// JSON mode primes the model by prepending an open brace to its turn: the
/// completion continues a JSON object the caller already started rather than
/// deciding on its own whether to emit one.
const JSON_MODE_PREFIX: &str = "{ ";

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

struct AnthropicProbe {
    client: Client,
    base_url: String,
    api_key: String,
}

#[async_trait]
impl LivenessProbe for AnthropicProbe {
    async fn is_blocked(&self) -> bool {
        let probe_body = MessagesRequest {
            model: "claude-3-5-haiku-20241022".to_string(),
            messages: vec![Message { role: "user".to_string(), content: "ping".to_string() }],
            max_tokens: 1,
            temperature: 0.0,
            system: None,
        };
        match self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&probe_body)
            .send()
            .await
        {
            Ok(response) => response.status() == StatusCode::TOO_MANY_REQUESTS,
            Err(_) => true,
        }
    }
}

/// Anthropic `LlmClient`, bound to one model and gated by its own [`RateLimiter`].
pub struct AnthropicClient {
    http: Client,
    api_key: String,
    base_url: String,
    model: String,
    limiter: Arc<RateLimiter>,
}

impl AnthropicClient {
    pub fn new(api_key: String, model: String, rpm: u32, monitor: &Arc<RateLimiterMonitor>) -> Self {
        Self::with_base_url(api_key, model, "https://api.anthropic.com/v1".to_string(), rpm, monitor)
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
            .expect("failed to build Anthropic HTTP client");

        let probe = Arc::new(AnthropicProbe { client: http.clone(), base_url: base_url.clone(), api_key: api_key.clone() });
        let limiter_name = format!("anthropic:{model}");
        let limiter = RateLimiter::new(limiter_name, RateLimiterConfig::new(rpm), probe);
        monitor.register(Arc::clone(&limiter));

        Self { http, api_key, base_url, model, limiter }
    }

    /// Reads `ANTHROPIC_API_KEY` (or `LLMONPY_ANTHROPIC_API_KEY`). Returns
    /// `NoApiKey` if neither is set, mirroring `filterClientsThatDidntStart`.
    pub fn from_env(model: String, rpm: u32, monitor: &Arc<RateLimiterMonitor>) -> Result<Self, ClientError> {
        let api_key = std::env::var("LLMONPY_ANTHROPIC_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_API_KEY"))
            .map_err(|_| ClientError::NoApiKey("anthropic".to_string()))?;
        Ok(Self::new(api_key, model, rpm, monitor))
    }

    fn to_request(&self, model: &str, request: &PromptRequest) -> MessagesRequest {
        MessagesRequest {
            model: model.to_string(),
            messages: vec![Message { role: "user".to_string(), content: request.text.clone() }],
            max_tokens: request.max_output_tokens,
            temperature: request.temperature,
            system: request.system.clone(),
        }
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> ClientError {
        if let Ok(parsed) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            if status == StatusCode::TOO_MANY_REQUESTS || parsed.error.error_type == "rate_limit_error" {
                return ClientError::RateLimited;
            }
            return ClientError::Provider(format!("[{}] {}", status.as_u16(), parsed.error.message));
        }
        ClientError::Provider(format!("[{}] {}", status.as_u16(), body))
    }

    async fn send_once(&self, model: &str, request: &PromptRequest) -> Result<MessagesResponse, ClientError> {
        let body = self.to_request(model, request);
        let response = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| if err.is_timeout() { ClientError::Timeout } else { ClientError::Provider(err.to_string()) })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ClientError::RateLimited);
        }
        if !status.is_success() {
            return Err(self.parse_error(status, &text));
        }
        serde_json::from_str(&text).map_err(|err| ClientError::Provider(err.to_string()))
    }

    /// Anthropic never emitted the leading `{` we asked the model to continue
    /// from, so it has to be spliced back on before a parser sees it.
    fn parse_json_response(&self, text: &str) -> Result<serde_json::Value, ClientError> {
        let primed = format!("{JSON_MODE_PREFIX}{text}");
        parse_with_repairs(&primed)
            .map(|(value, _)| value)
            .map_err(|err| ClientError::JsonFormat { attempts: MAX_JSON_REPAIR_ATTEMPTS, last_error: err.to_string() })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, ClientError> {
        let model = self.model.as_str();
        let mut ticket = self.limiter.get_ticket().await;

        loop {
            match self.send_once(model, &request).await {
                Ok(raw) => {
                    let text = raw.content.into_iter().next().map(|block| block.text).unwrap_or_default();
                    let pricing = anthropic_pricing(model);
                    let input_cost = pricing.input_cost(raw.usage.input_tokens);
                    let output_cost = pricing.output_cost(raw.usage.output_tokens);

                    let dict = if request.json_mode { Some(self.parse_json_response(&text)?) } else { None };

                    debug!(provider = "anthropic", tickets_rate_limited = ticket.was_rate_limited(), "prompt complete");
                    return Ok(PromptResponse { text, dict, input_cost, output_cost });
                }
                Err(ClientError::RateLimited) => {
                    warn!(provider = "anthropic", "rate limited, waiting for reissue");
                    ticket = self.limiter.wait_for_ticket_after_rate_limit_exceeded(ticket).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn is_blocked(&self) -> bool {
        AnthropicProbe { client: self.http.clone(), base_url: self.base_url.clone(), api_key: self.api_key.clone() }
            .is_blocked()
            .await
    }
}
