//! Agent core: tools, confirmation, dispatch, and the turn loop.
//!
//! Submodules:
//! - `registry`: Tool descriptors, parameter schemas, and the lookup table
//! - `permissions`: Confirmation policy resolution and remembered decisions
//! - `tool_router`: Dispatches recognized calls into outcomes
//! - `conversation`: History, tool-result format, token-optimized replay
//! - `orchestrator`: Drives one user turn to a terminal state
//! - `database`: SQLite session store
//! - `tokens`: Token estimation and text truncation
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod database;
pub mod errors;
pub mod orchestrator;
pub mod permissions;
pub mod registry;
pub mod tokens;
pub mod tool_router;
pub mod types;

// Re-exports for convenience
pub use conversation::{
    format_tool_result, Conversation, ConversationMessage, InMemorySessionStore, SessionStore,
    TokenOptimization,
};
pub use database::SqliteSessionStore;
pub use errors::AgentError;
pub use orchestrator::{LoopLimits, Orchestrator};
pub use permissions::{
    ConfirmationCategory, ConfirmationPolicy, PolicyDecision, PolicyStore, UserDecision,
};
pub use registry::{
    async_handler, sync_handler, ParamKind, ParamSchema, ParamSpec, RiskLevel, ToolContext,
    ToolDescriptor, ToolHandler, ToolOutput, ToolRegistry,
};
pub use tool_router::{
    ChannelConfirmer, ConfirmationHandler, PendingConfirmation, StaticConfirmer, ToolRouter,
};
pub use types::{
    ConfirmationRequest, ErrorKind, ToolError, ToolOutcome, TurnEvent, TurnReport, TurnStatus,
};
