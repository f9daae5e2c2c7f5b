//! Tool-call recognition over a complete model response.
//!
//! Model output is free text with call blocks embedded between two markers
//! (default `<tool_call>` / `</tool_call>`):
//!
//! ```text
//! Let me work that out.
//! <tool_call>
//! <name>calculator</name>
//! <parameters>{"expression": "2+2"}</parameters>
//! </tool_call>
//! ```
//!
//! [`recognize`] walks the text lazily and yields alternating [`Segment`]s.
//! Every byte of the input belongs to exactly one segment, so concatenating
//! `text[segment.span()]` over all segments reproduces the input.
//!
//! Bodies are accepted in three shapes, tried in order:
//!
//! 1. **Tagged**: `<name>…</name>` plus `<parameters>…</parameters>`
//!    (`<parameter>` is accepted as an alias).
//! 2. **JSON envelope**: `{"name": "...", "arguments": {...}}`, also in the
//!    OpenAI shape `{"function": {...}}` or as an array of envelopes, of
//!    which only the first is dispatched.
//! 3. **Compact**: `calculator{"expression": "2+2"}`: a leading identifier
//!    followed by the payload.
//!
//! Payload decoding never drops a call. Malformed JSON goes through a
//! conservative repair pass, then an XML-style `<key>value</key>` fallback,
//! and if both fail the call carries an [`ArgumentPayload::Invalid`].

use std::ops::Range;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Markup ──────────────────────────────────────────────────────────────────

/// Default opening marker for a call block.
pub const DEFAULT_OPEN_MARKER: &str = "<tool_call>";

/// Default closing marker for a call block.
pub const DEFAULT_CLOSE_MARKER: &str = "</tool_call>";

/// The pair of markers that delimit a call block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallMarkup {
    pub open: String,
    pub close: String,
}

impl Default for CallMarkup {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_MARKER, DEFAULT_CLOSE_MARKER)
    }
}

impl CallMarkup {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    /// Both markers must be non-empty for recognition to make progress.
    pub fn is_valid(&self) -> bool {
        !self.open.is_empty() && !self.close.is_empty()
    }
}

// ─── Segments ────────────────────────────────────────────────────────────────

/// One piece of recognized model output.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Text(TextSpan),
    Call(RecognizedCall),
}

impl Segment {
    /// Byte range of this segment in the source text.
    pub fn span(&self) -> Range<usize> {
        match self {
            Segment::Text(t) => t.span.clone(),
            Segment::Call(c) => c.span.clone(),
        }
    }

    pub fn as_call(&self) -> Option<&RecognizedCall> {
        match self {
            Segment::Call(c) => Some(c),
            Segment::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Segment::Text(t) => Some(&t.text),
            Segment::Call(_) => None,
        }
    }
}

/// Plain text between (or around) call blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub text: String,
    pub span: Range<usize>,
}

/// A call block extracted from model output.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognizedCall {
    /// 1-based position among the calls of one response.
    pub sequence: usize,
    /// Tool name as written by the model. Empty when none could be found.
    pub name: String,
    pub arguments: ArgumentPayload,
    /// The parameter text exactly as it appeared inside the block.
    pub raw_parameters: String,
    /// Byte range of the whole block, markers included.
    pub span: Range<usize>,
}

/// Decoded call arguments, or the reason they could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgumentPayload {
    Decoded(Map<String, Value>),
    Invalid { raw: String, reason: String },
}

impl ArgumentPayload {
    pub fn is_decoded(&self) -> bool {
        matches!(self, ArgumentPayload::Decoded(_))
    }

    /// Arguments as a JSON value (the raw text as a string when invalid).
    pub fn to_value(&self) -> Value {
        match self {
            ArgumentPayload::Decoded(map) => Value::Object(map.clone()),
            ArgumentPayload::Invalid { raw, .. } => Value::String(raw.clone()),
        }
    }
}

// ─── Buffered Recognizer ─────────────────────────────────────────────────────

/// Lazily split `text` into text and call segments.
///
/// A block with an opening marker but no closing marker is emitted verbatim
/// as text. A second opening marker before the close is literal body text.
pub fn recognize<'a>(text: &'a str, markup: &'a CallMarkup) -> Recognizer<'a> {
    Recognizer {
        text,
        markup,
        pos: 0,
        next_sequence: 1,
        pending: None,
    }
}

/// Iterator returned by [`recognize`].
pub struct Recognizer<'a> {
    text: &'a str,
    markup: &'a CallMarkup,
    pos: usize,
    next_sequence: usize,
    pending: Option<Segment>,
}

impl Iterator for Recognizer<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        if let Some(segment) = self.pending.take() {
            return Some(segment);
        }
        if self.pos >= self.text.len() {
            return None;
        }

        let start = self.pos;
        let rest = &self.text[start..];

        let open_at = if self.markup.is_valid() {
            rest.find(&self.markup.open)
        } else {
            None
        };

        let Some(open_offset) = open_at else {
            self.pos = self.text.len();
            return Some(text_segment(rest, start));
        };

        let block_start = start + open_offset;
        let body_start = block_start + self.markup.open.len();
        let Some(close_offset) = self.text[body_start..].find(&self.markup.close) else {
            // Unterminated block: everything left is text.
            self.pos = self.text.len();
            return Some(text_segment(rest, start));
        };

        let body_end = body_start + close_offset;
        let block_end = body_end + self.markup.close.len();
        let call = build_call(
            self.next_sequence,
            &self.text[body_start..body_end],
            block_start..block_end,
        );
        self.next_sequence += 1;
        self.pos = block_end;

        if open_offset > 0 {
            self.pending = Some(Segment::Call(call));
            Some(text_segment(&rest[..open_offset], start))
        } else {
            Some(Segment::Call(call))
        }
    }
}

/// Visible text and calls of a complete response, in order.
pub fn split_response(text: &str, markup: &CallMarkup) -> (String, Vec<RecognizedCall>) {
    let mut visible = String::new();
    let mut calls = Vec::new();
    for segment in recognize(text, markup) {
        match segment {
            Segment::Text(t) => visible.push_str(&t.text),
            Segment::Call(c) => calls.push(c),
        }
    }
    (visible, calls)
}

fn text_segment(text: &str, offset: usize) -> Segment {
    Segment::Text(TextSpan {
        text: text.to_string(),
        span: offset..offset + text.len(),
    })
}

// ─── Call Bodies ─────────────────────────────────────────────────────────────

/// Build a call from the text between the markers.
pub(crate) fn build_call(sequence: usize, body: &str, span: Range<usize>) -> RecognizedCall {
    let (name, raw_parameters, arguments) = parse_call_body(body);
    if let ArgumentPayload::Invalid { reason, .. } = &arguments {
        tracing::debug!(sequence, tool = %name, reason = %reason, "call parameters could not be decoded");
    }
    RecognizedCall {
        sequence,
        name,
        arguments,
        raw_parameters,
        span,
    }
}

fn parse_call_body(body: &str) -> (String, String, ArgumentPayload) {
    let trimmed = body.trim();

    // Tagged bodies start with a tag; `<name>` inside a compact payload is data.
    if trimmed.starts_with('<') {
        if let Some(name) = tag_content(trimmed, "name", false) {
            let raw = tag_content(trimmed, "parameters", true)
                .or_else(|| tag_content(trimmed, "parameter", true))
                .unwrap_or("");
            return (name.trim().to_string(), raw.to_string(), decode_parameters(raw));
        }
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Some(parsed) = parse_json_envelope(trimmed) {
            return parsed;
        }
    }

    let name_len = trimmed
        .find(|c: char| !is_name_char(c))
        .unwrap_or(trimmed.len());
    let (name, rest) = trimmed.split_at(name_len);
    let rest = rest.trim();
    (name.to_string(), rest.to_string(), decode_parameters(rest))
}

/// Inner text of `<tag>…</tag>`. With `last_close` the final closing tag is
/// used, so payloads that mention the tag themselves stay intact.
fn tag_content<'a>(s: &'a str, tag: &str, last_close: bool) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = s.find(&open)? + open.len();
    let rest = &s[start..];
    let end = if last_close {
        rest.rfind(&close)?
    } else {
        rest.find(&close)?
    };
    Some(&rest[..end])
}

/// `{"name": "...", "arguments": ...}` with `parameters` as an alias.
///
/// The envelope may be wrapped as `{"function": {...}}`, and a JSON array of
/// envelopes yields its first entry.
fn parse_json_envelope(body: &str) -> Option<(String, String, ArgumentPayload)> {
    let value: Value = serde_json::from_str(body).ok()?;
    let entry = match value {
        Value::Array(items) => {
            if items.len() > 1 {
                tracing::warn!(calls = items.len(), "call block holds several calls, keeping the first");
            }
            items.into_iter().next()?
        }
        other => other,
    };
    let outer = entry.as_object()?;
    let obj = outer
        .get("function")
        .and_then(Value::as_object)
        .unwrap_or(outer);
    let name = obj.get("name")?.as_str()?.trim().to_string();

    let (raw, arguments) = match obj.get("arguments").or_else(|| obj.get("parameters")) {
        None | Some(Value::Null) => (String::new(), ArgumentPayload::Decoded(Map::new())),
        // OpenAI-style stringified arguments.
        Some(Value::String(s)) => (s.clone(), decode_parameters(s)),
        Some(other) => {
            let raw = other.to_string();
            let payload = decode_parameters(&raw);
            (raw, payload)
        }
    };
    Some((name, raw, arguments))
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

// ─── Parameter Decoding ──────────────────────────────────────────────────────

/// Decode raw parameter text into an argument map.
///
/// Empty text is an empty map. A JSON value that is not an object is invalid.
pub fn decode_parameters(raw: &str) -> ArgumentPayload {
    let text = strip_code_fence(raw.trim());
    if text.is_empty() {
        return ArgumentPayload::Decoded(Map::new());
    }

    let err = match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => return ArgumentPayload::Decoded(map),
        Ok(other) => {
            return ArgumentPayload::Invalid {
                raw: raw.to_string(),
                reason: format!("parameters must be a JSON object, found {}", json_kind(&other)),
            }
        }
        Err(e) => e,
    };

    if text.starts_with('{') {
        if let Some(Value::Object(map)) = repair_malformed_json(text) {
            tracing::warn!(raw_len = text.len(), "repaired malformed call parameters");
            return ArgumentPayload::Decoded(map);
        }
    }

    if text.starts_with('<') {
        if let Some(map) = parse_tagged_parameters(text) {
            return ArgumentPayload::Decoded(map);
        }
    }

    ArgumentPayload::Invalid {
        raw: raw.to_string(),
        reason: format!("malformed parameters: {err}"),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Drop a surrounding Markdown code fence (```` ```json … ``` ````).
fn strip_code_fence(text: &str) -> &str {
    let Some(inner) = text.strip_prefix("```") else {
        return text;
    };
    let inner = match inner.find('\n') {
        Some(nl) => &inner[nl + 1..],
        None => inner,
    };
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

/// Decode `<key>value</key>` children, inferring scalar types.
///
/// Returns `None` unless the whole text is a sequence of such elements.
fn parse_tagged_parameters(text: &str) -> Option<Map<String, Value>> {
    let mut map = Map::new();
    let mut rest = text.trim();

    while !rest.is_empty() {
        let after_lt = rest.strip_prefix('<')?;
        let key_end = after_lt.find('>')?;
        let key = &after_lt[..key_end];
        if key.is_empty() || !key.chars().all(is_name_char) {
            return None;
        }
        let body = &after_lt[key_end + 1..];
        let close = format!("</{key}>");
        let value_end = body.find(&close)?;
        map.insert(key.to_string(), infer_scalar(body[..value_end].trim()));
        rest = body[value_end + close.len()..].trim_start();
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// `true`/`false` → bool, integers, decimals, embedded JSON, else string.
fn infer_scalar(s: &str) -> Value {
    match s.to_ascii_lowercase().as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = s.parse::<i64>() {
        return Value::from(n);
    }
    if s.contains('.') {
        if let Some(n) = s.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return Value::Number(n);
        }
    }
    if s.starts_with('{') || s.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Value>(s) {
            return v;
        }
    }
    Value::String(s.to_string())
}

// ─── Malformed JSON Repair ───────────────────────────────────────────────────

/// Attempt to repair malformed JSON emitted by a model.
///
/// Repairs are cumulative and the text is re-parsed after each one:
/// 1. Doubled quote after a colon: `"key":""value"`
/// 2. Raw control characters inside strings (escaped) or outside (dropped)
/// 3. Unclosed strings, objects and arrays
/// 4. Trailing commas before `}` or `]`
///
/// Returns `None` if the text is still not JSON afterwards.
pub fn repair_malformed_json(raw: &str) -> Option<Value> {
    const REPAIRS: [fn(&str) -> String; 4] = [
        collapse_doubled_quotes,
        escape_control_characters,
        close_unbalanced,
        drop_trailing_commas,
    ];

    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        return Some(v);
    }

    let mut candidate = raw.to_string();
    for repair in REPAIRS {
        candidate = repair(&candidate);
        if let Ok(v) = serde_json::from_str::<Value>(&candidate) {
            return Some(v);
        }
    }
    None
}

/// `:""X` → `:"X` unless the doubled quote is a legitimate empty string.
fn collapse_doubled_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        out.push(c);
        if c != ':' {
            continue;
        }
        let mut lookahead = chars.clone();
        if lookahead.next() == Some('"') && lookahead.next() == Some('"') {
            let empty_string = matches!(lookahead.peek(), None | Some(',') | Some('}') | Some(' '));
            if !empty_string {
                out.push('"');
                chars.next();
                chars.next();
            }
        }
    }
    out
}

fn escape_control_characters(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => {}
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            if !c.is_control() || c.is_whitespace() {
                out.push(c);
            }
        }
    }
    out
}

fn close_unbalanced(input: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = input.trim_end().to_string();
    if in_string {
        out.push('"');
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

fn drop_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());

    for (i, &c) in chars.iter().enumerate() {
        if c == ',' {
            let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn calls(text: &str, markup: &CallMarkup) -> Vec<RecognizedCall> {
        recognize(text, markup)
            .filter_map(|s| s.as_call().cloned())
            .collect()
    }

    fn decoded(call: &RecognizedCall) -> &Map<String, Value> {
        match &call.arguments {
            ArgumentPayload::Decoded(map) => map,
            ArgumentPayload::Invalid { reason, .. } => panic!("expected decoded, got {reason}"),
        }
    }

    #[test]
    fn test_calculator_call_with_custom_markers() {
        let markup = CallMarkup::new("<CALL>", "</CALL>");
        let text = r#"Let me compute. <CALL><name>calculator</name><parameters>{"expression":"2+2"}</parameters></CALL> Done."#;

        let segments: Vec<Segment> = recognize(text, &markup).collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].as_text(), Some("Let me compute. "));
        let call = segments[1].as_call().unwrap();
        assert_eq!(call.sequence, 1);
        assert_eq!(call.name, "calculator");
        assert_eq!(decoded(call)["expression"], "2+2");
        assert_eq!(call.raw_parameters, r#"{"expression":"2+2"}"#);
        assert_eq!(segments[2].as_text(), Some(" Done."));
    }

    #[test]
    fn test_compact_call_with_custom_markers() {
        let markup = CallMarkup::new("<CALL>", "</CALL>");
        let text = r#"Compute: <CALL>calculator{"expression":"2+2"}</CALL> done"#;

        let segments: Vec<Segment> = recognize(text, &markup).collect();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].as_text(), Some("Compute: "));
        let call = segments[1].as_call().unwrap();
        assert_eq!(call.sequence, 1);
        assert_eq!(call.name, "calculator");
        assert_eq!(decoded(call)["expression"], "2+2");
        assert_eq!(call.span, 9..text.len() - 5);
        assert_eq!(segments[2].as_text(), Some(" done"));
    }

    #[test]
    fn test_compact_payload_mentioning_name_tag() {
        let markup = CallMarkup::default();
        let text = r#"<tool_call>echo{"text": "use <name>x</name> here"}</tool_call>"#;
        let found = calls(text, &markup);
        assert_eq!(found[0].name, "echo");
        assert_eq!(decoded(&found[0])["text"], "use <name>x</name> here");
    }

    #[test]
    fn test_tool_calls_wrapper_with_function_array() {
        let markup = CallMarkup::new("<tool_calls>", "</tool_calls>");
        let text = r#"Working. <tool_calls>[{"type": "function", "function": {"name": "read_file", "arguments": {"path": "a.txt"}}}, {"function": {"name": "rm", "arguments": {}}}]</tool_calls>"#;
        let found = calls(text, &markup);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "read_file");
        assert_eq!(decoded(&found[0])["path"], "a.txt");
    }

    #[test]
    fn test_function_wrapped_envelope() {
        let markup = CallMarkup::default();
        let text = r#"<tool_call>{"function": {"name": "search", "arguments": "{\"q\": \"rust\"}"}}</tool_call>"#;
        let found = calls(text, &markup);
        assert_eq!(found[0].name, "search");
        assert_eq!(decoded(&found[0])["q"], "rust");
    }

    #[test]
    fn test_spans_reconstruct_input() {
        let markup = CallMarkup::default();
        let text = "a<tool_call><name>x</name></tool_call>b\n<tool_call>y{}</tool_call><tool_call><name>z</name><parameters>{\"k\":1}</parameters></tool_call>tail";

        let segments: Vec<Segment> = recognize(text, &markup).collect();
        let rebuilt: String = segments.iter().map(|s| &text[s.span()]).collect();
        assert_eq!(rebuilt, text);

        let names: Vec<&str> = segments
            .iter()
            .filter_map(|s| s.as_call())
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["x", "y", "z"]);
        let sequences: Vec<usize> = segments
            .iter()
            .filter_map(|s| s.as_call())
            .map(|c| c.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn test_adjacent_calls_have_no_empty_text_between() {
        let markup = CallMarkup::default();
        let text = "<tool_call>a{}</tool_call><tool_call>b{}</tool_call>";
        let segments: Vec<Segment> = recognize(text, &markup).collect();
        assert_eq!(segments.len(), 2);
        assert!(segments.iter().all(|s| s.as_call().is_some()));
    }

    #[test]
    fn test_unterminated_block_is_text() {
        let markup = CallMarkup::default();
        let text = "before <tool_call><name>calculator</name><parameters>{\"a\":";
        let segments: Vec<Segment> = recognize(text, &markup).collect();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].as_text(), Some(text));
    }

    #[test]
    fn test_second_open_marker_is_literal_body() {
        let markup = CallMarkup::default();
        let text = "<tool_call><name>a</name><tool_call>x</tool_call> tail";
        let segments: Vec<Segment> = recognize(text, &markup).collect();
        assert_eq!(segments.len(), 2);
        let call = segments[0].as_call().unwrap();
        assert_eq!(call.name, "a");
        assert_eq!(segments[1].as_text(), Some(" tail"));
    }

    #[test]
    fn test_recognizer_is_lazy() {
        let markup = CallMarkup::default();
        let text = "intro <tool_call>a{}</tool_call> rest";
        let mut it = recognize(text, &markup);
        assert_eq!(it.next().unwrap().as_text(), Some("intro "));
        assert_eq!(it.next().unwrap().as_call().unwrap().name, "a");
        assert_eq!(it.next().unwrap().as_text(), Some(" rest"));
        assert!(it.next().is_none());
    }

    #[test]
    fn test_no_markup_yields_single_text() {
        let markup = CallMarkup::default();
        let segments: Vec<Segment> = recognize("just chatting", &markup).collect();
        assert_eq!(segments.len(), 1);
        assert!(recognize("", &markup).next().is_none());
    }

    #[test]
    fn test_invalid_markup_never_matches() {
        let markup = CallMarkup::new("", "</x>");
        let segments: Vec<Segment> = recognize("abc</x>", &markup).collect();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].as_text(), Some("abc</x>"));
    }

    #[test]
    fn test_parameter_alias() {
        let markup = CallMarkup::default();
        let text = r#"<tool_call><name>echo</name><parameter>{"msg":"hi"}</parameter></tool_call>"#;
        let found = calls(text, &markup);
        assert_eq!(decoded(&found[0])["msg"], "hi");
    }

    #[test]
    fn test_missing_parameters_is_empty_map() {
        let markup = CallMarkup::default();
        let found = calls("<tool_call><name>now</name></tool_call>", &markup);
        assert!(decoded(&found[0]).is_empty());
    }

    #[test]
    fn test_compact_form() {
        let markup = CallMarkup::default();
        let found = calls(r#"<tool_call>calculator{"expression": "3*7"}</tool_call>"#, &markup);
        assert_eq!(found[0].name, "calculator");
        assert_eq!(decoded(&found[0])["expression"], "3*7");
    }

    #[test]
    fn test_json_envelope_with_string_arguments() {
        let markup = CallMarkup::default();
        let text = r#"<tool_call>{"name": "search", "arguments": "{\"q\": \"rust\"}"}</tool_call>"#;
        let found = calls(text, &markup);
        assert_eq!(found[0].name, "search");
        assert_eq!(decoded(&found[0])["q"], "rust");
    }

    #[test]
    fn test_tagged_parameters_infer_types() {
        let markup = CallMarkup::default();
        let text = "<tool_call><name>resize</name><parameters><width>640</width><ratio>1.5</ratio><keep>TRUE</keep><label>cover art</label></parameters></tool_call>";
        let found = calls(text, &markup);
        let args = decoded(&found[0]);
        assert_eq!(args["width"], 640);
        assert_eq!(args["ratio"], 1.5);
        assert_eq!(args["keep"], true);
        assert_eq!(args["label"], "cover art");
    }

    #[test]
    fn test_malformed_payload_keeps_call() {
        let markup = CallMarkup::default();
        let text = "<tool_call><name>calculator</name><parameters>expression is 2+2</parameters></tool_call>";
        let found = calls(text, &markup);
        assert_eq!(found.len(), 1);
        match &found[0].arguments {
            ArgumentPayload::Invalid { raw, reason } => {
                assert_eq!(raw, "expression is 2+2");
                assert!(reason.contains("malformed"));
            }
            other => panic!("expected invalid payload, got {other:?}"),
        }
    }

    #[test]
    fn test_non_object_json_is_invalid() {
        match decode_parameters("[1, 2]") {
            ArgumentPayload::Invalid { reason, .. } => assert!(reason.contains("an array")),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_name_yields_empty_name() {
        let markup = CallMarkup::default();
        let found = calls(r#"<tool_call>{"expression": "1"}</tool_call>"#, &markup);
        assert_eq!(found[0].name, "");
    }

    #[test]
    fn test_code_fenced_parameters() {
        let payload = "```json\n{\"path\": \"/tmp\"}\n```";
        match decode_parameters(payload) {
            ArgumentPayload::Decoded(map) => assert_eq!(map["path"], "/tmp"),
            other => panic!("expected decoded, got {other:?}"),
        }
    }

    #[test]
    fn test_split_response_collects_visible_text() {
        let markup = CallMarkup::default();
        let (visible, found) =
            split_response("one <tool_call>a{}</tool_call>two", &markup);
        assert_eq!(visible, "one two");
        assert_eq!(found.len(), 1);
    }

    // ─── JSON Repair ────────────────────────────────────────────────────

    #[test]
    fn test_repair_doubled_quote() {
        let raw = r#"{"create_dirs":true,"destination":""/home/user/file.png","source":"/tmp/file.png"}"#;
        let v = repair_malformed_json(raw).expect("should repair doubled quote");
        assert_eq!(v["destination"], "/home/user/file.png");
        assert_eq!(v["create_dirs"], true);
    }

    #[test]
    fn test_repair_keeps_empty_strings() {
        let v = repair_malformed_json(r#"{"a":"","b":1,}"#).unwrap();
        assert_eq!(v["a"], "");
        assert_eq!(v["b"], 1);
    }

    #[test]
    fn test_repair_trailing_comma() {
        let v = repair_malformed_json(r#"{"path": "/tmp", "recursive": true,}"#).unwrap();
        assert_eq!(v["path"], "/tmp");
    }

    #[test]
    fn test_repair_truncated_object_and_array() {
        let v = repair_malformed_json(r#"{"items": [1, 2, {"k": "v"#).unwrap();
        assert_eq!(v["items"][2]["k"], "v");
    }

    #[test]
    fn test_repair_raw_newline_in_string() {
        let v = repair_malformed_json("{\"content\": \"line one\nline two\"}").unwrap();
        assert_eq!(v["content"], "line one\nline two");
    }

    #[test]
    fn test_repair_irreparable() {
        assert!(repair_malformed_json("this is not json at all").is_none());
    }

    #[test]
    fn test_repaired_payload_is_decoded() {
        match decode_parameters(r#"{"expression": "2+2",}"#) {
            ArgumentPayload::Decoded(map) => assert_eq!(map["expression"], "2+2"),
            other => panic!("expected decoded, got {other:?}"),
        }
    }
}
