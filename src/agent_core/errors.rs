//! Agent Core error types.
//!
//! Tool failures never show up here: the dispatcher captures them into
//! outcomes. These are the failures of the surrounding machinery.

use thiserror::Error;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A tool with this name is already registered.
    #[error("tool '{name}' is already registered")]
    DuplicateTool { name: String },

    /// No tool with this name is registered.
    #[error("unknown tool '{name}'")]
    UnknownTool { name: String },

    /// A tool descriptor is unusable (empty name, bad schema).
    #[error("invalid tool descriptor '{name}': {reason}")]
    InvalidDescriptor { name: String, reason: String },

    /// Database operation failed.
    #[error("database error: {reason}")]
    DatabaseError { reason: String },

    /// Session not found.
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    SerializationError { reason: String },
}

impl From<rusqlite::Error> for AgentError {
    fn from(e: rusqlite::Error) -> Self {
        AgentError::DatabaseError {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::SerializationError {
            reason: e.to_string(),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            AgentError::DuplicateTool { name: "calc".into() }.to_string(),
            "tool 'calc' is already registered"
        );
        assert_eq!(
            AgentError::UnknownTool { name: "nope".into() }.to_string(),
            "unknown tool 'nope'"
        );
        assert_eq!(
            AgentError::SessionNotFound { session_id: "s1".into() }.to_string(),
            "session not found: 's1'"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let agent: AgentError = err.into();
        assert!(matches!(agent, AgentError::SerializationError { .. }));
    }
}
