//! Tool registry: descriptors, parameter schemas, and handlers.
//!
//! Provides:
//! - Explicit registration at startup (`&mut`), then shared behind `Arc`
//! - Lookup by name, with "did you mean" suggestions for misses
//! - Schema validation with documented coercion of model-supplied values
//! - Model-facing schemas and human-readable parameter help
//!
//! Coercion rules applied by [`ParamSchema::validate`]:
//!
//! | kind      | accepted                                                   |
//! |-----------|------------------------------------------------------------|
//! | `string`  | strings; numbers and booleans become their text            |
//! | `integer` | integers; floats with zero fraction; numeric strings       |
//! | `number`  | any JSON number; numeric strings                           |
//! | `boolean` | booleans; `true/false/yes/no/1/0` strings, any case        |
//! | `array`   | arrays; strings holding a JSON array; other scalars wrapped |
//! | `object`  | objects; strings holding a JSON object                     |
//!
//! An explicit `null` counts as absent. Missing optional parameters get
//! their declared default.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::errors::AgentError;
use super::permissions::ConfirmationCategory;
use crate::inference::types::{FunctionDefinition, ToolSchema};

// ─── Handlers ────────────────────────────────────────────────────────────────

/// What a handler returns. Non-text values are rendered to text by the
/// dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Text(String),
    Json(Value),
}

impl From<String> for ToolOutput {
    fn from(s: String) -> Self {
        ToolOutput::Text(s)
    }
}

impl From<&str> for ToolOutput {
    fn from(s: &str) -> Self {
        ToolOutput::Text(s.to_string())
    }
}

impl From<Value> for ToolOutput {
    fn from(v: Value) -> Self {
        ToolOutput::Json(v)
    }
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub tool_name: String,
    /// 1-based index of the call within its assistant message.
    pub sequence: usize,
    /// Fires when the turn is cancelled or the call times out.
    pub cancel: CancellationToken,
}

/// A tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Map<String, Value>, ctx: ToolContext) -> anyhow::Result<ToolOutput>;
}

struct SyncHandler<F>(Arc<F>);

#[async_trait]
impl<F, O> ToolHandler for SyncHandler<F>
where
    F: Fn(&Map<String, Value>) -> anyhow::Result<O> + Send + Sync + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    async fn call(&self, args: Map<String, Value>, _ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        let f = Arc::clone(&self.0);
        match tokio::task::spawn_blocking(move || f(&args).map(Into::<ToolOutput>::into)).await {
            Ok(result) => result,
            // Re-raise so the dispatcher reports it like any other panic.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow::anyhow!("blocking tool task failed: {e}")),
        }
    }
}

struct AsyncHandler<F>(F);

#[async_trait]
impl<F, Fut, O> ToolHandler for AsyncHandler<F>
where
    F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    async fn call(&self, args: Map<String, Value>, ctx: ToolContext) -> anyhow::Result<ToolOutput> {
        (self.0)(args, ctx).await.map(Into::<ToolOutput>::into)
    }
}

/// Wrap a blocking closure. It runs on the blocking thread pool.
pub fn sync_handler<F, O>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(&Map<String, Value>) -> anyhow::Result<O> + Send + Sync + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    Arc::new(SyncHandler(Arc::new(f)))
}

/// Wrap an async closure.
pub fn async_handler<F, Fut, O>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    O: Into<ToolOutput> + Send + 'static,
{
    Arc::new(AsyncHandler(f))
}

// ─── Parameter Schema ────────────────────────────────────────────────────────

/// JSON type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Integer => "integer",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Array => "array",
            ParamKind::Object => "object",
        }
    }

    /// Coerce a model-supplied value to this kind.
    fn coerce(&self, value: &Value) -> Result<Value, String> {
        let mismatch = || format!("expected {}, found {}", self.as_str(), describe_value(value));

        match (self, value) {
            (ParamKind::String, Value::String(_)) => Ok(value.clone()),
            (ParamKind::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ParamKind::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),

            (ParamKind::Integer, Value::Number(n)) => {
                if n.is_i64() || n.is_u64() {
                    return Ok(value.clone());
                }
                n.as_f64().and_then(whole_number).ok_or_else(mismatch)
            }
            (ParamKind::Integer, Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .map(Value::from)
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(whole_number))
                    .ok_or_else(mismatch)
            }

            (ParamKind::Number, Value::Number(_)) => Ok(value.clone()),
            (ParamKind::Number, Value::String(s)) => {
                let s = s.trim();
                if let Ok(i) = s.parse::<i64>() {
                    return Ok(Value::from(i));
                }
                s.parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(mismatch)
            }

            (ParamKind::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (ParamKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "0" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },

            (ParamKind::Array, Value::Array(_)) => Ok(value.clone()),
            (ParamKind::Array, Value::String(s)) => {
                if s.trim_start().starts_with('[') {
                    if let Ok(decoded @ Value::Array(_)) = serde_json::from_str::<Value>(s) {
                        return Ok(decoded);
                    }
                }
                Ok(Value::Array(vec![value.clone()]))
            }
            (ParamKind::Array, Value::Number(_) | Value::Bool(_)) => Ok(Value::Array(vec![value.clone()])),

            (ParamKind::Object, Value::Object(_)) => Ok(value.clone()),
            (ParamKind::Object, Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(decoded @ Value::Object(_)) => Ok(decoded),
                _ => Err(mismatch()),
            },

            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrow a float with zero fraction to an integer value.
fn whole_number(f: f64) -> Option<Value> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(Value::from(f as i64))
    } else {
        None
    }
}

fn describe_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {b}"),
        Value::Number(n) => format!("number {n}"),
        Value::String(s) => format!("string {:?}", crate::agent_core::tokens::truncate_chars(s, 40)),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Allowed values, checked after coercion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: description.into(),
            default: None,
            allowed: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn one_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.allowed = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// One help line: `name (type, required): description`.
    fn help_line(&self) -> String {
        let mut attrs = vec![
            self.kind.as_str().to_string(),
            if self.required { "required" } else { "optional" }.to_string(),
        ];
        if let Some(default) = &self.default {
            attrs.push(format!("default: {default}"));
        }
        if let Some(allowed) = &self.allowed {
            let list: Vec<String> = allowed.iter().map(Value::to_string).collect();
            attrs.push(format!("one of: {}", list.join(", ")));
        }

        if self.description.is_empty() {
            format!("  - {} ({})", self.name, attrs.join(", "))
        } else {
            format!("  - {} ({}): {}", self.name, attrs.join(", "), self.description)
        }
    }
}

/// Arguments that failed validation. Each problem is one sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub problems: Vec<String>,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.problems.join("; "))
    }
}

impl std::error::Error for SchemaViolation {}

/// Ordered list of declared parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSchema {
    params: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Validate and coerce arguments, filling defaults.
    ///
    /// Every problem is reported, not just the first.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<Map<String, Value>, SchemaViolation> {
        let mut problems = Vec::new();
        let mut resolved = Map::new();

        for name in args.keys() {
            if self.get(name).is_none() {
                problems.push(format!("unknown parameter '{name}'"));
            }
        }

        for spec in &self.params {
            let supplied = args.get(&spec.name).filter(|v| !v.is_null());
            let Some(value) = supplied else {
                if let Some(default) = &spec.default {
                    resolved.insert(spec.name.clone(), default.clone());
                } else if spec.required {
                    problems.push(format!("missing required parameter '{}'", spec.name));
                }
                continue;
            };

            match spec.kind.coerce(value) {
                Ok(coerced) => {
                    if let Some(allowed) = &spec.allowed {
                        if !allowed.contains(&coerced) {
                            let list: Vec<String> = allowed.iter().map(Value::to_string).collect();
                            problems.push(format!(
                                "parameter '{}' must be one of {}, found {coerced}",
                                spec.name,
                                list.join(", ")
                            ));
                            continue;
                        }
                    }
                    resolved.insert(spec.name.clone(), coerced);
                }
                Err(reason) => problems.push(format!("parameter '{}': {reason}", spec.name)),
            }
        }

        if problems.is_empty() {
            Ok(resolved)
        } else {
            Err(SchemaViolation { problems })
        }
    }

    /// JSON Schema (`type: object`) for the model-facing catalog.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();

        for spec in &self.params {
            let mut prop = Map::new();
            prop.insert("type".into(), Value::String(spec.kind.as_str().into()));
            if !spec.description.is_empty() {
                prop.insert("description".into(), Value::String(spec.description.clone()));
            }
            if let Some(allowed) = &spec.allowed {
                prop.insert("enum".into(), Value::Array(allowed.clone()));
            }
            if let Some(default) = &spec.default {
                prop.insert("default".into(), default.clone());
            }
            properties.insert(spec.name.clone(), Value::Object(prop));
            if spec.required {
                required.push(Value::String(spec.name.clone()));
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        })
    }
}

// ─── Descriptors ─────────────────────────────────────────────────────────────

/// How much damage a tool can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A registered tool. Immutable once registered.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub schema: ParamSchema,
    pub category: ConfirmationCategory,
    pub risk: RiskLevel,
    pub requires_confirmation: bool,
    /// Overrides the dispatcher's default timeout.
    pub timeout: Option<Duration>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: ParamSchema::new(),
            category: ConfirmationCategory::General,
            risk: RiskLevel::Low,
            requires_confirmation: false,
            timeout: None,
            handler,
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.schema = self.schema.param(spec);
        self
    }

    pub fn schema(mut self, schema: ParamSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Require confirmation under the given category.
    pub fn confirm(mut self, category: ConfirmationCategory) -> Self {
        self.category = category;
        self.requires_confirmation = true;
        self
    }

    pub fn category(mut self, category: ConfirmationCategory) -> Self {
        self.category = category;
        self
    }

    pub fn risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    pub fn requires_confirmation(mut self, required: bool) -> Self {
        self.requires_confirmation = required;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn handler(&self) -> Arc<dyn ToolHandler> {
        Arc::clone(&self.handler)
    }

    pub fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: self.name.clone(),
                description: self.description.clone(),
                parameters: self.schema.to_json_schema(),
            },
        }
    }

    /// Parameter help, used in validation error messages.
    pub fn help(&self) -> String {
        let mut help = format!("{}: {}\nParameters:", self.name, self.description);
        if self.schema.params().is_empty() {
            help.push_str(" none");
        }
        for spec in self.schema.params() {
            help.push('\n');
            help.push_str(&spec.help_line());
        }
        help
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("risk", &self.risk)
            .field("requires_confirmation", &self.requires_confirmation)
            .field("timeout", &self.timeout)
            .field("params", &self.schema.params().len())
            .finish()
    }
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Registration-ordered tool catalog.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    /// `name → index into tools`.
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Names must be unique and non-empty.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<(), AgentError> {
        let name = descriptor.name.clone();
        if name.trim().is_empty() {
            return Err(AgentError::InvalidDescriptor {
                name,
                reason: "tool name is empty".to_string(),
            });
        }
        if self.index.contains_key(&name) {
            return Err(AgentError::DuplicateTool { name });
        }

        let mut seen = std::collections::HashSet::new();
        for spec in descriptor.schema.params() {
            if !seen.insert(spec.name.as_str()) {
                return Err(AgentError::InvalidDescriptor {
                    name,
                    reason: format!("parameter '{}' declared twice", spec.name),
                });
            }
        }

        tracing::info!(
            tool = %name,
            category = %descriptor.category,
            requires_confirmation = descriptor.requires_confirmation,
            params = descriptor.schema.params().len(),
            "registered tool"
        );

        self.index.insert(name, self.tools.len());
        self.tools.push(descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolDescriptor, AgentError> {
        self.get(name).ok_or_else(|| AgentError::UnknownTool {
            name: name.to_string(),
        })
    }

    /// Descriptors in registration order. Call again to restart.
    pub fn list(&self) -> std::slice::Iter<'_, ToolDescriptor> {
        self.tools.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    /// Model-facing schemas in registration order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(ToolDescriptor::to_schema).collect()
    }

    pub fn describe(&self, name: &str) -> Result<String, AgentError> {
        self.lookup(name).map(ToolDescriptor::help)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Up to `max_results` registered names similar to `name`, best first.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(&str, f64)> = self
            .tools
            .iter()
            .map(|t| (t.name.as_str(), similarity(name, &t.name)))
            .filter(|(_, score)| *score > 0.5)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(n, _)| n.to_string()).collect()
    }
}

// ─── Edit Distance ───────────────────────────────────────────────────────────

/// Levenshtein edit distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
