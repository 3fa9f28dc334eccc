//! OpenAI-compatible chat-completion client (OpenRouter by default).
//!
//! # Responsibilities
//! - Build `/chat/completions` requests with bearer authentication
//! - Extract the first choice's message content
//! - Translate HTTP failures into `ClientError` messages the driver can classify

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::client::{ChatClient, ChatPrompt, ClientError};
use crate::config::ApiConfig;

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// HTTP client for an OpenAI-compatible chat API.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl OpenRouterClient {
    /// Create a client from API configuration.
    ///
    /// No client-side timeout is set; the request driver owns deadlines.
    pub fn new(config: &ApiConfig) -> Self {
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        Self {
            client: Client::new(),
            endpoint,
            api_key: config.api_key.clone(),
        }
    }

    fn messages<'a>(prompt: &'a ChatPrompt) -> Vec<Message<'a>> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &prompt.system {
            messages.push(Message {
                role: "system",
                content: system,
            });
        }
        messages.push(Message {
            role: "user",
            content: &prompt.user,
        });
        messages
    }
}

fn status_error(status: StatusCode, body: String) -> ClientError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => ClientError::RateLimited(body),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ClientError::Timeout(body),
        _ => ClientError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl ChatClient for OpenRouterClient {
    async fn complete(&self, backend: &str, prompt: &ChatPrompt) -> Result<String, ClientError> {
        let api_key = self.api_key.as_deref().ok_or(ClientError::MissingApiKey)?;

        let request = CompletionRequest {
            model: backend,
            messages: Self::messages(prompt),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout(e.to_string())
                } else {
                    ClientError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(status_error(status, text));
        }

        let parsed: CompletionResponse =
            serde_json::from_str(&text).map_err(|e| ClientError::Decode(e.to_string()))?;

        // Some providers report upstream failures in a 200 body.
        if let Some(error) = parsed.error {
            let code = error.code.and_then(|c| c.as_u64()).unwrap_or(0);
            return Err(match StatusCode::from_u16(code as u16) {
                Ok(status) if code > 0 => status_error(status, error.message),
                _ => ClientError::Other(error.message),
            });
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ClientError::Decode("response contained no choices".to_string()))
    }
}
