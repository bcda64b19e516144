//! LLM gateway implementations
//!
//! Provides completion gateways for OpenAI-compatible, Anthropic and Ollama
//! APIs. Every failure is classified into the gateway taxonomy so the retry
//! layer can tell throttling from permanent errors.
//!
//! Author: hephaex@gmail.com

use std::time::{Duration, Instant};

use async_trait::async_trait;
use novelize_core::{
    CompletionGateway, CompletionOptions, GatewayError, LlmConfig, NovelizeError, Result,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error_parsing::{classify_status, classify_transport};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| NovelizeError::ConfigError(format!("Failed to build HTTP client: {e}")))
}

async fn send_json<T: Serialize>(
    request: reqwest::RequestBuilder,
    body: &T,
) -> std::result::Result<reqwest::Response, GatewayError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| classify_transport(&e))?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let error_text = response.text().await.unwrap_or_default();
        return Err(classify_status(status, &error_text));
    }

    Ok(response)
}

async fn decode<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> std::result::Result<T, GatewayError> {
    response
        .json()
        .await
        .map_err(|e| GatewayError::Transient(format!("Failed to parse response: {e}")))
}

// ============================================================================
// OpenAI Gateway
// ============================================================================

/// OpenAI chat-completions gateway (also Azure and compatible APIs)
pub struct OpenAiGateway {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

impl OpenAiGateway {
    /// Create a new OpenAI gateway
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: model.into(),
            max_tokens,
            temperature,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| NovelizeError::ConfigError("OpenAI API key required".to_string()))?;

        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            api_key: api_key.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Set custom base URL (for Azure or compatible APIs)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl CompletionGateway for OpenAiGateway {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> std::result::Result<String, GatewayError> {
        let request = OpenAiRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: options.max_output_tokens.unwrap_or(self.max_tokens),
            temperature: options.temperature.unwrap_or(self.temperature),
            stop: options.stop_sequences.clone(),
        };

        let started = Instant::now();
        let response = send_json(
            self.client
                .post(format!("{}/chat/completions", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key)),
            &request,
        )
        .await?;

        let result: OpenAiResponse = decode(response).await?;
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "OpenAI completion received"
        );

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GatewayError::Transient("No response generated".to_string()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ============================================================================
// Anthropic Gateway
// ============================================================================

/// Anthropic Messages API gateway
pub struct AnthropicGateway {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

impl AnthropicGateway {
    /// Create a new Anthropic gateway
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_string(),
            model: model.into(),
            max_tokens,
            temperature,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .anthropic_api_key
            .as_ref()
            .ok_or_else(|| NovelizeError::ConfigError("Anthropic API key required".to_string()))?;

        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            api_key: api_key.clone(),
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    /// Set custom base URL (for proxies)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[async_trait]
impl CompletionGateway for AnthropicGateway {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> std::result::Result<String, GatewayError> {
        let request = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: options.max_output_tokens.unwrap_or(self.max_tokens),
            temperature: options.temperature.unwrap_or(self.temperature),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stop_sequences: options.stop_sequences.clone(),
        };

        let started = Instant::now();
        let response = send_json(
            self.client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION),
            &request,
        )
        .await?;

        let result: AnthropicResponse = decode(response).await?;
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Anthropic completion received"
        );

        result
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .map(|block| block.text)
            .ok_or_else(|| GatewayError::Transient("No text content generated".to_string()))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ============================================================================
// Ollama Gateway
// ============================================================================

/// Ollama API gateway
pub struct OllamaGateway {
    client: Client,
    base_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaGateway {
    /// Create a new Ollama gateway
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let defaults = LlmConfig::default();
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            max_tokens: defaults.max_tokens,
            temperature: defaults.temperature,
        }
    }

    /// Create from config
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: build_http_client(config.timeout_secs)?,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| config.ollama_url.clone()),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl CompletionGateway for OllamaGateway {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> std::result::Result<String, GatewayError> {
        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                num_predict: options.max_output_tokens.unwrap_or(self.max_tokens),
                temperature: options.temperature.unwrap_or(self.temperature),
                stop: options.stop_sequences.clone(),
            },
        };

        let started = Instant::now();
        let response = send_json(
            self.client.post(format!("{}/api/generate", self.base_url)),
            &request,
        )
        .await?;

        let result: OllamaResponse = decode(response).await?;
        tracing::debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ollama completion received"
        );

        Ok(result.response)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_openai_gateway_creation() {
        let gateway = OpenAiGateway::new("test-key", "gpt-4o-mini", 2048, 0.1);
        assert_eq!(gateway.model, "gpt-4o-mini");
        assert_eq!(gateway.name(), "openai");
    }

    #[test]
    fn test_ollama_gateway_creation() {
        let gateway = OllamaGateway::new("http://localhost:11434", "llama3");
        assert_eq!(gateway.model, "llama3");
    }

    #[test]
    fn test_from_config_requires_key() {
        let config = LlmConfig::default();
        assert!(OpenAiGateway::from_config(&config).is_err());
        assert!(AnthropicGateway::from_config(&config).is_err());
        assert!(OllamaGateway::from_config(&config).is_ok());
    }

    #[tokio::test]
    async fn test_openai_success_and_options() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .and(body_partial_json(json!({"max_tokens": 64, "stop": ["<end>"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Alice: Went to the market"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway =
            OpenAiGateway::new("test-key", "gpt-4o-mini", 2048, 0.1).with_base_url(server.uri());
        let options = CompletionOptions::new()
            .with_max_output_tokens(64)
            .with_stop_sequence("<end>");

        let text = gateway.complete("extract", &options).await.unwrap();
        assert_eq!(text, "Alice: Went to the market");
    }

    #[tokio::test]
    async fn test_openai_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("Too many requests"))
            .mount(&server)
            .await;

        let gateway = OpenAiGateway::new("k", "m", 16, 0.0).with_base_url(server.uri());
        let err = gateway
            .complete("x", &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Throttled(_)));
    }

    #[tokio::test]
    async fn test_anthropic_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .and(header("x-api-key", "secret"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .and(body_partial_json(json!({
                "model": "claude-test",
                "messages": [{"role": "user", "content": "who is here?"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "content": [{"type": "text", "text": "<none>"}]
            })))
            .mount(&server)
            .await;

        let gateway =
            AnthropicGateway::new("secret", "claude-test", 256, 0.1).with_base_url(server.uri());
        let text = gateway
            .complete("who is here?", &CompletionOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "<none>");
    }

    #[tokio::test]
    async fn test_anthropic_auth_failure_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"type": "authentication_error", "message": "invalid x-api-key"}
            })))
            .mount(&server)
            .await;

        let gateway = AnthropicGateway::new("bad", "m", 16, 0.0).with_base_url(server.uri());
        let err = gateway
            .complete("x", &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(err.message().contains("invalid x-api-key"));
    }

    #[tokio::test]
    async fn test_ollama_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let gateway = OllamaGateway::new(server.uri(), "llama3");
        let err = gateway
            .complete("x", &CompletionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transient(_)));
    }

    #[tokio::test]
    async fn test_ollama_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .and(body_partial_json(json!({"stream": false, "options": {"num_predict": 32}})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"response": "<new>", "done": true})),
            )
            .mount(&server)
            .await;

        let gateway = OllamaGateway::new(server.uri(), "llama3");
        let text = gateway
            .complete("x", &CompletionOptions::new().with_max_output_tokens(32))
            .await
            .unwrap();
        assert_eq!(text, "<new>");
    }
}
