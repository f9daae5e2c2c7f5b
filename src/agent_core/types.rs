//! Shared types for the agent core.
//!
//! Tool outcomes, confirmation requests, and the turn-level status and
//! events used across the dispatcher and the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::permissions::{ConfirmationCategory, UserDecision};
use super::registry::RiskLevel;

// ─── Tool Outcomes ──────────────────────────────────────────────────────────

/// Why a dispatch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No tool with the requested name is registered.
    UnknownTool,
    /// The parameter payload could not be decoded.
    ParameterError,
    /// The decoded arguments do not satisfy the tool's schema.
    ValidationError,
    /// Policy or the user refused the call.
    UserDenied,
    /// The handler failed or panicked.
    ExecutionError,
    /// The handler did not finish in time.
    Timeout,
}

impl ErrorKind {
    /// Wire code used in tool-result messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownTool => "UNKNOWN_TOOL",
            ErrorKind::ParameterError => "PARAMETER_ERROR",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::UserDenied => "USER_DENIED",
            ErrorKind::ExecutionError => "EXECUTION_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
        }
    }
}

/// Error half of a failed outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result of dispatching one recognized call. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// 1-based index of the call within its assistant message.
    pub sequence: usize,
    pub tool_name: String,
    /// Arguments after validation and defaults, or the raw payload when
    /// decoding failed.
    pub arguments: serde_json::Value,
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<ToolError>,
    /// Wall time from dispatch start, including any confirmation wait.
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// The user's answer, when one was asked.
    pub user_decision: Option<UserDecision>,
}

impl ToolOutcome {
    pub fn succeeded(
        sequence: usize,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        result: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            sequence,
            tool_name: tool_name.into(),
            arguments,
            success: true,
            result: Some(result.into()),
            error: None,
            duration_ms,
            timestamp: Utc::now(),
            user_decision: None,
        }
    }

    pub fn failed(
        sequence: usize,
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        kind: ErrorKind,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            sequence,
            tool_name: tool_name.into(),
            arguments,
            success: false,
            result: None,
            error: Some(ToolError {
                kind,
                message: message.into(),
            }),
            duration_ms,
            timestamp: Utc::now(),
            user_decision: None,
        }
    }

    pub fn with_decision(mut self, decision: Option<UserDecision>) -> Self {
        self.user_decision = decision;
        self
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

// ─── Confirmation ───────────────────────────────────────────────────────────

/// Request handed to the confirmation collaborator when policy says `ask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    /// Unique request ID for matching responses.
    pub request_id: String,
    pub tool_name: String,
    pub category: ConfirmationCategory,
    pub risk: RiskLevel,
    /// Validated arguments.
    pub arguments: serde_json::Value,
    /// Human-readable preview with sensitive values redacted.
    pub preview: String,
}

// ─── Turns ──────────────────────────────────────────────────────────────────

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    /// The model answered without calling tools.
    FinalAnswer,
    /// The round cap or wall-clock budget ran out.
    BudgetExceeded { rounds: u32 },
    /// The model adapter failed.
    AdapterFailure { message: String },
    /// The caller cancelled the turn.
    Cancelled,
}

impl TurnStatus {
    pub fn code(&self) -> &'static str {
        match self {
            TurnStatus::FinalAnswer => "FINAL_ANSWER",
            TurnStatus::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            TurnStatus::AdapterFailure { .. } => "ADAPTER_FAILURE",
            TurnStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Progress events for a presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// Visible model text, as soon as the recognizer releases it.
    TextDelta { round: u32, text: String },
    /// A complete call was recognized.
    CallRecognized {
        round: u32,
        sequence: usize,
        name: String,
    },
    /// A call finished dispatching.
    Outcome { round: u32, outcome: ToolOutcome },
    /// Loop-level notice (budget exhausted, adapter failure, cancelled).
    Notice { message: String },
}

/// Summary of a finished turn. The conversation holds the full history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnReport {
    pub status: TurnStatus,
    /// Visible text of the last assistant message.
    pub final_text: String,
    /// Dispatch rounds executed.
    pub rounds: u32,
    /// Every outcome of the turn, in history order.
    pub outcomes: Vec<ToolOutcome>,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
