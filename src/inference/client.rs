//! Model adapters.
//!
//! The orchestrator only sees the [`ModelAdapter`] trait: history and tool
//! schemas in, a complete string or a stream of text fragments out. Tool
//! calls travel inside that text as markup, so adapters never parse them.
//!
//! [`OpenAiCompatibleAdapter`] talks to any OpenAI-compatible endpoint
//! (Ollama, llama.cpp, vLLM). [`ScriptedAdapter`] replays canned responses
//! for headless runs and tests.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::config::ModelConfig;
use super::errors::InferenceError;
use super::streaming::parse_sse_stream;
use super::tool_call_parser::CallMarkup;
use super::types::{ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Role, ToolSchema};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Attempts per request when the error is retriable.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Base delay between attempts; multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

// ─── Adapter Trait ───────────────────────────────────────────────────────────

/// What an adapter hands back for one model call.
pub enum ModelResponse {
    /// The whole response at once.
    Complete(String),
    /// Text fragments as they arrive. The first error ends the response.
    Streaming(BoxStream<'static, Result<String, InferenceError>>),
}

impl ModelResponse {
    /// A streaming response over fixed fragments.
    pub fn from_fragments<I>(fragments: I) -> Self
    where
        I: IntoIterator<Item = String>,
        I::IntoIter: Send + 'static,
    {
        ModelResponse::Streaming(stream::iter(fragments.into_iter().map(Ok)).boxed())
    }

    /// Drain the response into a single string.
    pub async fn collect_text(self) -> Result<String, InferenceError> {
        match self {
            ModelResponse::Complete(text) => Ok(text),
            ModelResponse::Streaming(mut fragments) => {
                let mut text = String::new();
                while let Some(fragment) = fragments.next().await {
                    text.push_str(&fragment?);
                }
                Ok(text)
            }
        }
    }
}

impl fmt::Debug for ModelResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelResponse::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            ModelResponse::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// A language model behind some transport.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Send the conversation so far plus the tool catalog.
    async fn send(
        &self,
        history: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, InferenceError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "model"
    }
}

// ─── Protocol Prompt ─────────────────────────────────────────────────────────

/// System prompt text that teaches the model the call markup and lists the
/// available tools.
pub fn protocol_instructions(markup: &CallMarkup, tools: &[ToolSchema]) -> String {
    let mut prompt = format!(
        "You can call tools. To call one, write a block exactly like this:\n\
         {open}\n<name>TOOL_NAME</name>\n<parameters>{{\"argument\": \"value\"}}</parameters>\n{close}\n\
         Write one block per call and put nothing but the name and parameters inside it. \
         Each call's result comes back in a <tool_result> block. \
         When no tool is needed, answer the user directly.\n",
        open = markup.open,
        close = markup.close,
    );

    if tools.is_empty() {
        prompt.push_str("\nNo tools are available in this conversation.\n");
        return prompt;
    }

    prompt.push_str("\nAvailable tools:\n");
    for tool in tools {
        prompt.push_str(&format!(
            "- {}: {}\n  parameters: {}\n",
            tool.function.name, tool.function.description, tool.function.parameters
        ));
    }
    prompt
}

/// Build the wire message list: protocol prompt first, tool messages sent
/// as user messages since the markup protocol has no tool role.
fn build_messages(markup: &CallMarkup, history: &[ChatMessage], tools: &[ToolSchema]) -> Vec<ChatMessage> {
    let protocol = protocol_instructions(markup, tools);
    let mut messages = Vec::with_capacity(history.len() + 1);

    let mut rest = history;
    match history.first() {
        Some(first) if first.role == Role::System => {
            messages.push(ChatMessage::system(format!("{}\n\n{protocol}", first.content)));
            rest = &history[1..];
        }
        _ => messages.push(ChatMessage::system(protocol)),
    }

    messages.extend(rest.iter().map(|m| match m.role {
        Role::Tool => ChatMessage::user(m.content.clone()),
        _ => m.clone(),
    }));
    messages
}

// ─── OpenAI-Compatible Adapter ───────────────────────────────────────────────

/// Adapter for `POST {base_url}/chat/completions`.
pub struct OpenAiCompatibleAdapter {
    http: HttpClient,
    config: ModelConfig,
    markup: CallMarkup,
    max_attempts: u32,
}

impl OpenAiCompatibleAdapter {
    /// Build the adapter. Does NOT check connectivity; that happens on the
    /// first request.
    pub fn from_config(config: &ModelConfig, markup: CallMarkup) -> Result<Self, InferenceError> {
        if config.base_url.trim().is_empty() {
            return Err(InferenceError::ConfigError {
                reason: "model.base_url is empty".to_string(),
            });
        }

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            config: config.clone(),
            markup,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Override the retry budget (minimum one attempt).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    /// One request, no retries.
    async fn try_request(&self, body: &ChatCompletionRequest) -> Result<ModelResponse, InferenceError> {
        let url = self.endpoint();

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            max_tokens = body.max_tokens,
            stream = body.stream,
            "sending model request"
        );

        let mut request = self.http.post(&url).json(body);
        if body.stream {
            request = request.header("Accept", "text/event-stream");
        }
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                InferenceError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        if body.stream {
            return Ok(ModelResponse::Streaming(
                parse_sse_stream(response.bytes_stream()).boxed(),
            ));
        }

        let text = response.text().await.map_err(|e| InferenceError::StreamError {
            reason: format!("failed to read response body: {e}"),
        })?;
        let parsed: ChatCompletionResponse =
            serde_json::from_str(&text).map_err(|e| InferenceError::StreamError {
                reason: format!("invalid completion body: {e}"),
            })?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        Ok(ModelResponse::Complete(content))
    }
}

#[async_trait]
impl ModelAdapter for OpenAiCompatibleAdapter {
    async fn send(
        &self,
        history: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, InferenceError> {
        let body = ChatCompletionRequest {
            model: self.config.model_name.clone(),
            messages: build_messages(&self.markup, history, tools),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: self.config.stream,
        };

        let mut attempt = 1;
        loop {
            match self.try_request(&body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retriable() && attempt < self.max_attempts => {
                    tracing::warn!(attempt, error = %e, "model request failed, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn name(&self) -> &str {
        &self.config.model_name
    }
}

// ─── Scripted Adapter ────────────────────────────────────────────────────────

/// One canned model response.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Buffered response.
    Complete(String),
    /// Streamed response, one item per fragment.
    Fragments(Vec<String>),
    /// Fail with `AdapterUnavailable`.
    Fail(String),
    /// Never answer (until the caller gives up).
    Hang,
}

/// Replays a fixed list of responses, then optionally repeats a final step.
pub struct ScriptedAdapter {
    steps: Mutex<VecDeque<ScriptStep>>,
    repeat: Option<ScriptStep>,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedAdapter {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            repeat: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Answer with `step` forever once the script runs out.
    pub fn repeating(mut self, step: ScriptStep) -> Self {
        self.repeat = Some(step);
        self
    }

    /// Histories received so far, one entry per call.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl ModelAdapter for ScriptedAdapter {
    async fn send(
        &self,
        history: &[ChatMessage],
        _tools: &[ToolSchema],
    ) -> Result<ModelResponse, InferenceError> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(history.to_vec());

        let next = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .or_else(|| self.repeat.clone());

        match next {
            Some(ScriptStep::Complete(text)) => Ok(ModelResponse::Complete(text)),
            Some(ScriptStep::Fragments(parts)) => Ok(ModelResponse::from_fragments(parts)),
            Some(ScriptStep::Fail(reason)) => Err(InferenceError::AdapterUnavailable { reason }),
            Some(ScriptStep::Hang) => futures::future::pending().await,
            None => Err(InferenceError::AdapterUnavailable {
                reason: "script exhausted".to_string(),
            }),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
