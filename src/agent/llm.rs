use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::LlmConfig;
use crate::{RagError, Result};

const LLM_RETRIES: u32 = 3;
const LLM_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const LLM_BACKOFF_FACTOR: u32 = 2;
const LLM_BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in a conversation, in the chat API's wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Tool descriptor advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ToolFunctionSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolFunctionSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDescriptor {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            kind: "function",
            function: ToolFunctionSpec {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDescriptor]>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseBody {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

/// Client for an Ollama-compatible chat completion API with tool calling.
///
/// Calls are retried on connection and timeout errors only, with
/// exponential backoff capped at ten seconds.
#[derive(Debug, Clone)]
pub struct LlmClient {
    base_url: Url,
    model: String,
    agent: ureq::Agent,
    retries: u32,
    backoff_initial: Duration,
}

impl LlmClient {
    #[inline]
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let base_url = Url::parse(&config.host)
            .map_err(|e| RagError::Config(format!("invalid LLM host: {e}")))?;

        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(config.timeout()))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            agent,
            retries: LLM_RETRIES,
            backoff_initial: LLM_BACKOFF_INITIAL,
        })
    }

    #[inline]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    #[inline]
    pub fn with_backoff_initial(mut self, initial: Duration) -> Self {
        self.backoff_initial = initial;
        self
    }

    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// One chat completion turn. The model either answers directly or
    /// requests tool calls in the returned message.
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDescriptor>,
    ) -> Result<ChatMessage> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.chat_blocking(&messages, &tools))
            .await
            .map_err(|e| RagError::Internal(format!("LLM task panicked: {e}")))?
    }

    /// Probe service reachability and model presence. Never errors.
    pub async fn check_available(&self) -> bool {
        let client = self.clone();
        tokio::task::spawn_blocking(move || client.check_available_blocking())
            .await
            .unwrap_or(false)
    }

    pub fn chat_blocking(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ChatMessage> {
        let url = self
            .base_url
            .join("/api/chat")
            .map_err(|e| RagError::Config(format!("failed to build chat URL: {e}")))?;

        let request = ChatRequestBody {
            model: &self.model,
            messages,
            stream: false,
            tools: if tools.is_empty() { None } else { Some(tools) },
        };
        let body = serde_json::to_string(&request)?;

        let mut delay = self.backoff_initial;
        let mut last_error = None;

        for attempt in 1..=self.retries {
            let result = self
                .agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&body)
                .and_then(|mut resp| resp.body_mut().read_to_string());

            match result {
                Ok(response_text) => {
                    let parsed: ChatResponseBody = serde_json::from_str(&response_text)
                        .map_err(|e| RagError::Llm(format!("malformed chat response: {e}")))?;
                    debug!(
                        "LLM answered with {} tool call(s)",
                        parsed
                            .message
                            .tool_calls
                            .as_ref()
                            .map(Vec::len)
                            .unwrap_or(0)
                    );
                    return Ok(parsed.message);
                }
                Err(error) => {
                    let (retryable, mapped) = match &error {
                        ureq::Error::Timeout(_) => {
                            (true, RagError::Timeout(format!("LLM request: {error}")))
                        }
                        ureq::Error::ConnectionFailed
                        | ureq::Error::HostNotFound
                        | ureq::Error::Io(_) => {
                            (true, RagError::Llm(format!("connection error: {error}")))
                        }
                        ureq::Error::StatusCode(status) => {
                            (false, RagError::Llm(format!("chat failed: HTTP {status}")))
                        }
                        other => (false, RagError::Llm(format!("chat failed: {other}"))),
                    };

                    if !retryable {
                        return Err(mapped);
                    }
                    warn!(
                        "LLM request failed (attempt {attempt}/{}): {error}",
                        self.retries
                    );
                    last_error = Some(mapped);

                    if attempt < self.retries {
                        std::thread::sleep(delay);
                        delay = (delay * LLM_BACKOFF_FACTOR).min(LLM_BACKOFF_CAP);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RagError::Llm("chat failed after retries".into())))
    }

    pub fn check_available_blocking(&self) -> bool {
        let Ok(url) = self.base_url.join("/api/tags") else {
            return false;
        };
        let response = self
            .agent
            .get(url.as_str())
            .call()
            .and_then(|mut resp| resp.body_mut().read_to_string());
        match response {
            Ok(text) => serde_json::from_str::<ModelsResponse>(&text)
                .map(|parsed| parsed.models.iter().any(|m| m.name == self.model))
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}
