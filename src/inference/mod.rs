//! Model side of the loop.
//!
//! - Model adapters (`ModelAdapter`, OpenAI-compatible HTTP, scripted)
//! - Tool-call recognition over buffered and streamed text
//! - SSE stream parsing
//! - Runtime configuration loading from `toolchat.yaml`
//!
//! Calls travel inside the model's text as markup, so any endpoint that can
//! produce text can drive tools. Switching models is a config change.

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod tool_call_parser;
pub mod types;

// Re-exports for convenience
pub use client::{ModelAdapter, ModelResponse, OpenAiCompatibleAdapter, ScriptStep, ScriptedAdapter};
pub use config::{LoopConfig, ModelConfig, RuntimeConfig};
pub use errors::InferenceError;
pub use streaming::{recognize_stream, StreamRecognizer};
pub use tool_call_parser::{
    recognize, split_response, ArgumentPayload, CallMarkup, RecognizedCall, Segment,
};
pub use types::{ChatMessage, Role, ToolSchema};
