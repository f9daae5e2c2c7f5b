//! Conversation history for one session.
//!
//! Responsibilities:
//! - Append-only message list (system, user, assistant, tool)
//! - Tool-result wire format fed back to the model
//! - Token-optimized replay: old, bulky tool results become placeholders
//! - The `SessionStore` seam for persistence

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::inference::types::{ChatMessage, Role};

use super::errors::AgentError;
use super::tokens::{self, truncate_chars};
use super::types::ToolOutcome;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Argument text in a tool-result message is cut to this many characters.
pub const TOOL_ARGUMENTS_MAX_CHARS: usize = 200;

// ─── Token Optimization ─────────────────────────────────────────────────────

/// History replay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenOptimization {
    pub enabled: bool,
    /// The most recent messages are always replayed verbatim.
    pub keep_recent_messages: usize,
    /// Older results of these tools are always compacted.
    pub compact_tools: Vec<String>,
    /// Older results longer than this (in characters) are compacted.
    pub compact_threshold: usize,
}

impl Default for TokenOptimization {
    fn default() -> Self {
        Self {
            enabled: true,
            keep_recent_messages: 5,
            compact_tools: Vec::new(),
            compact_threshold: 1000,
        }
    }
}

impl TokenOptimization {
    fn should_compact(&self, message: &ConversationMessage) -> bool {
        let Some(outcome) = &message.outcome else {
            return false;
        };
        self.compact_tools.iter().any(|t| t == &outcome.tool_name)
            || message.content.chars().count() > self.compact_threshold
    }
}

// ─── Messages ───────────────────────────────────────────────────────────────

/// A single message in conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    /// What the model sees. For assistant messages this is the raw output,
    /// call markup included.
    pub content: String,
    /// Assistant messages: the text with call blocks removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_text: Option<String>,
    /// Tool messages: the outcome this message reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ToolOutcome>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    fn new(role: Role, content: String) -> Self {
        Self {
            role,
            content,
            visible_text: None,
            outcome: None,
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    pub fn assistant(raw: impl Into<String>, visible_text: impl Into<String>) -> Self {
        Self {
            visible_text: Some(visible_text.into()),
            ..Self::new(Role::Assistant, raw.into())
        }
    }

    pub fn tool_result(outcome: ToolOutcome) -> Self {
        Self {
            outcome: Some(outcome.clone()),
            ..Self::new(Role::Tool, format_tool_result(&outcome))
        }
    }
}

/// Render an outcome in the `<tool_result>` wire format.
pub fn format_tool_result(outcome: &ToolOutcome) -> String {
    let arguments = match &outcome.arguments {
        serde_json::Value::String(raw) => raw.clone(),
        other => other.to_string(),
    };

    let mut text = format!(
        "<tool_result>\nname: {}\narguments: {}\nduration_ms: {}\n",
        outcome.tool_name,
        truncate_chars(&arguments, TOOL_ARGUMENTS_MAX_CHARS),
        outcome.duration_ms
    );

    match (&outcome.result, &outcome.error) {
        (_, Some(error)) => {
            text.push_str(&format!(
                "status: error\nerror_code: {}\nerror: {}\n",
                error.kind.as_str(),
                error.message
            ));
        }
        (Some(result), None) => {
            text.push_str(&format!("status: success\nresult: {result}\n"));
        }
        (None, None) => text.push_str("status: success\nresult: \n"),
    }

    text.push_str("</tool_result>");
    text
}

// ─── Conversation ───────────────────────────────────────────────────────────

/// Ordered history of one session. Append-only.
#[derive(Debug, Clone)]
pub struct Conversation {
    session_id: String,
    messages: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            messages: Vec::new(),
        }
    }

    pub fn with_system_prompt(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let mut conversation = Self::new(session_id);
        conversation.push(ConversationMessage::system(prompt));
        conversation
    }

    /// Rebuild a conversation from stored messages.
    pub fn from_messages(session_id: impl Into<String>, messages: Vec<ConversationMessage>) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
        }
    }

    /// Load the most recent `limit` messages of a session from a store.
    pub async fn restore(
        store: &dyn SessionStore,
        session_id: &str,
        limit: usize,
    ) -> Result<Self, AgentError> {
        let messages = store.load_recent(session_id, limit).await?;
        tracing::info!(session_id, restored = messages.len(), "conversation restored");
        Ok(Self::from_messages(session_id, messages))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    /// Messages appended at or after `index`.
    pub fn messages_since(&self, index: usize) -> &[ConversationMessage] {
        self.messages.get(index..).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationMessage> {
        self.messages.last()
    }

    pub fn push(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ConversationMessage::user(content));
    }

    pub fn push_assistant(&mut self, raw: impl Into<String>, visible_text: impl Into<String>) {
        self.push(ConversationMessage::assistant(raw, visible_text));
    }

    pub fn push_tool_result(&mut self, outcome: ToolOutcome) {
        self.push(ConversationMessage::tool_result(outcome));
    }

    /// Loop-level notice (budget exhausted, adapter failure, cancellation).
    pub fn push_notice(&mut self, notice: impl Into<String>) {
        self.push(ConversationMessage::system(notice));
    }

    /// Build the adapter-facing history.
    ///
    /// Tool results outside the last `keep_recent_messages` messages are
    /// replaced by a placeholder when their tool is listed in
    /// `compact_tools` or their text exceeds `compact_threshold`.
    pub fn to_chat_messages(&self, optimization: &TokenOptimization) -> Vec<ChatMessage> {
        let window_start = self
            .messages
            .len()
            .saturating_sub(optimization.keep_recent_messages);
        let mut compacted = 0usize;

        let messages: Vec<ChatMessage> = self
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| {
                if optimization.enabled && i < window_start && optimization.should_compact(m) {
                    if let Some(outcome) = &m.outcome {
                        compacted += 1;
                        return ChatMessage::new(
                            m.role,
                            tokens::compaction_placeholder(&outcome.tool_name, outcome.success),
                        );
                    }
                }
                ChatMessage::new(m.role, m.content.clone())
            })
            .collect();

        if compacted > 0 {
            tracing::debug!(
                session_id = %self.session_id,
                compacted,
                estimated_tokens = tokens::estimate_history_tokens(&messages),
                "compacted old tool results for replay"
            );
        }
        messages
    }
}

// ─── Session Store ──────────────────────────────────────────────────────────

/// Persistence seam for conversation history.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append messages to a session, creating it if needed.
    async fn append(&self, session_id: &str, messages: &[ConversationMessage]) -> Result<(), AgentError>;

    /// The last `limit` messages of a session, oldest first.
    async fn load_recent(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationMessage>, AgentError>;
}

/// Process-lifetime store, for tests and headless runs.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Vec<ConversationMessage>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append(&self, session_id: &str, messages: &[ConversationMessage]) -> Result<(), AgentError> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn load_recent(&self, session_id: &str, limit: usize) -> Result<Vec<ConversationMessage>, AgentError> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let messages = sessions.get(session_id).map(Vec::as_slice).unwrap_or_default();
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
