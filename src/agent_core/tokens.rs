//! Token estimation and text shortening for history replay.
//!
//! Uses character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (conservative, overestimate is safer)
//! - JSON/structured content: ~2.8 chars/token (denser due to punctuation)
//!
//! The estimates only feed logging and compaction decisions; nothing here
//! rejects a request.

use crate::inference::types::{ChatMessage, Role};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
///
/// Tool results and argument dumps fall into this category.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Suffix appended by [`truncate_chars`].
const ELLIPSIS: &str = "...";

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
///
/// If the byte at `max_bytes` is inside a multi-byte character, the slice is
/// shortened to the preceding character boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Keep at most `max_chars` characters, marking the cut with `...`.
pub(crate) fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        None => s.to_string(),
        Some((cut, _)) => format!("{}{ELLIPSIS}", &s[..cut]),
    }
}

// ─── Public API ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for a `ChatMessage`.
///
/// Tool results are structured text, so they use the JSON ratio.
pub fn estimate_message_tokens(message: &ChatMessage) -> u32 {
    MESSAGE_OVERHEAD_TOKENS
        + match message.role {
            Role::Tool => estimate_json_tokens(&message.content),
            _ => estimate_tokens(&message.content),
        }
}

/// Estimate the token count for a whole replayed history.
pub fn estimate_history_tokens(messages: &[ChatMessage]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Stand-in for a tool result dropped from replayed history.
pub fn compaction_placeholder(tool_name: &str, succeeded: bool) -> String {
    let status = if succeeded { "success" } else { "error" };
    format!(
        "<tool_result>\nname: {tool_name}\nstatus: {status}\n\
         result: (omitted to save context; call {tool_name} again if you need it)\n</tool_result>"
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────
