//! ToolRouter: dispatches recognized calls to registered handlers.
//!
//! Every call goes through the same lifecycle, and every failure along the
//! way becomes a structured outcome rather than an error:
//!
//! 1. lookup → `UNKNOWN_TOOL`
//! 2. payload decoding → `PARAMETER_ERROR`
//! 3. schema validation with defaults → `VALIDATION_ERROR`
//! 4. confirmation gate (policy, then the user on `ask`) → `USER_DENIED`
//! 5. handler on a spawned task under a timeout → `TIMEOUT` / `EXECUTION_ERROR`
//!
//! A cancelled dispatch yields no outcome at all.

use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::agent_core::tokens::truncate_chars;
use crate::inference::config::DEFAULT_TOOL_TIMEOUT_SECS;
use crate::inference::tool_call_parser::{ArgumentPayload, RecognizedCall};

use super::permissions::{PolicyDecision, PolicyStore, UserDecision};
use super::registry::{ToolContext, ToolDescriptor, ToolOutput, ToolRegistry};
use super::types::{ConfirmationRequest, ErrorKind, ToolOutcome};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Argument values longer than this are cut in confirmation previews.
const PREVIEW_VALUE_MAX_CHARS: usize = 100;

/// Argument keys containing any of these are redacted in previews.
const SENSITIVE_KEY_MARKERS: &[&str] = &["password", "token", "secret", "api_key", "apikey"];

/// How many "did you mean" suggestions an unknown-tool error carries.
const MAX_SUGGESTIONS: usize = 3;

// ─── Confirmation Collaborators ─────────────────────────────────────────────

/// Obtains a decision from the user when policy resolves to `ask`.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    /// `None` means the user could not be asked (channel closed); the
    /// dispatcher treats it as a denial.
    async fn request_decision(&self, request: ConfirmationRequest) -> Option<UserDecision>;
}

/// A confirmation request waiting for an answer from the presentation layer.
#[derive(Debug)]
pub struct PendingConfirmation {
    pub request: ConfirmationRequest,
    reply: oneshot::Sender<UserDecision>,
}

impl PendingConfirmation {
    /// Answer the request. Returns `false` if the dispatcher stopped waiting.
    pub fn respond(self, decision: UserDecision) -> bool {
        self.reply.send(decision).is_ok()
    }
}

/// Forwards requests over an mpsc channel; answers come back on a oneshot.
///
/// The caller must drain the receiver (CLI prompt, HTTP bridge, ...).
#[derive(Debug, Clone)]
pub struct ChannelConfirmer {
    tx: mpsc::Sender<PendingConfirmation>,
}

impl ChannelConfirmer {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingConfirmation>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConfirmationHandler for ChannelConfirmer {
    async fn request_decision(&self, request: ConfirmationRequest) -> Option<UserDecision> {
        let (reply, answer) = oneshot::channel();
        let tool = request.tool_name.clone();
        if self.tx.send(PendingConfirmation { request, reply }).await.is_err() {
            tracing::warn!(tool = %tool, "confirmation channel closed before request was sent");
            return None;
        }
        answer.await.ok()
    }
}

/// Answers every request the same way. `None` behaves like a closed channel.
#[derive(Debug, Default)]
pub struct StaticConfirmer {
    decision: Option<UserDecision>,
    asked: AtomicUsize,
}

impl StaticConfirmer {
    pub fn new(decision: Option<UserDecision>) -> Self {
        Self {
            decision,
            asked: AtomicUsize::new(0),
        }
    }

    /// Number of requests received so far.
    pub fn times_asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfirmationHandler for StaticConfirmer {
    async fn request_decision(&self, _request: ConfirmationRequest) -> Option<UserDecision> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}

// ─── ToolRouter ─────────────────────────────────────────────────────────────

/// Validates, confirms, and executes recognized calls.
pub struct ToolRouter {
    registry: Arc<ToolRegistry>,
    policies: Arc<PolicyStore>,
    confirmer: Arc<dyn ConfirmationHandler>,
    /// Used for tools that declare no timeout of their own.
    default_timeout: Duration,
}

impl ToolRouter {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policies: Arc<PolicyStore>,
        confirmer: Arc<dyn ConfirmationHandler>,
    ) -> Self {
        Self {
            registry,
            policies,
            confirmer,
            default_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Dispatch one call to completion.
    pub async fn dispatch(&self, call: &RecognizedCall) -> ToolOutcome {
        let start = Instant::now();
        match self.dispatch_with_cancel(call, &CancellationToken::new()).await {
            Some(outcome) => outcome,
            // Unreachable with a private token, but never panic on it.
            None => self.log_and_return_error(
                call,
                call.arguments.to_value(),
                ErrorKind::ExecutionError,
                "dispatch cancelled".to_string(),
                start,
                None,
            ),
        }
    }

    /// Dispatch one call; `None` if `cancel` fired before it finished.
    pub async fn dispatch_with_cancel(
        &self,
        call: &RecognizedCall,
        cancel: &CancellationToken,
    ) -> Option<ToolOutcome> {
        let start = Instant::now();
        if cancel.is_cancelled() {
            return None;
        }

        // 1. Lookup
        let Some(descriptor) = self.registry.get(&call.name) else {
            let message = self.unknown_tool_message(&call.name);
            return Some(self.log_and_return_error(
                call,
                call.arguments.to_value(),
                ErrorKind::UnknownTool,
                message,
                start,
                None,
            ));
        };

        // 2. Payload
        let raw_args = match &call.arguments {
            ArgumentPayload::Decoded(map) => map,
            ArgumentPayload::Invalid { raw, reason } => {
                return Some(self.log_and_return_error(
                    call,
                    Value::String(raw.clone()),
                    ErrorKind::ParameterError,
                    format!("could not decode parameters for '{}': {reason}", call.name),
                    start,
                    None,
                ));
            }
        };

        // 3. Validate
        let args = match descriptor.schema.validate(raw_args) {
            Ok(args) => args,
            Err(violation) => {
                return Some(self.log_and_return_error(
                    call,
                    Value::Object(raw_args.clone()),
                    ErrorKind::ValidationError,
                    format!(
                        "invalid arguments for '{}': {violation}\n\n{}",
                        call.name,
                        descriptor.help()
                    ),
                    start,
                    None,
                ));
            }
        };
        let args_value = Value::Object(args.clone());

        // 4. Confirmation gate
        let mut decision = None;
        if descriptor.requires_confirmation {
            match self.policies.resolve(&descriptor.name, descriptor.category) {
                PolicyDecision::Allow => {
                    tracing::debug!(tool = %call.name, "confirmation skipped, policy allows");
                }
                PolicyDecision::Deny => {
                    return Some(self.log_and_return_error(
                        call,
                        args_value,
                        ErrorKind::UserDenied,
                        format!("'{}' is denied by confirmation policy", call.name),
                        start,
                        None,
                    ));
                }
                PolicyDecision::Ask => {
                    let request = ConfirmationRequest {
                        request_id: uuid::Uuid::new_v4().to_string(),
                        tool_name: descriptor.name.clone(),
                        category: descriptor.category,
                        risk: descriptor.risk,
                        arguments: args_value.clone(),
                        preview: generate_preview(descriptor, &args),
                    };

                    let answer = tokio::select! {
                        _ = cancel.cancelled() => return None,
                        answer = self.confirmer.request_decision(request) => answer,
                    };

                    let Some(answer) = answer else {
                        return Some(self.log_and_return_error(
                            call,
                            args_value,
                            ErrorKind::UserDenied,
                            "confirmation channel closed; treated as denied".to_string(),
                            start,
                            None,
                        ));
                    };

                    self.policies
                        .record_decision(&descriptor.name, descriptor.category, answer);
                    decision = Some(answer);

                    if !answer.is_approval() {
                        return Some(self.log_and_return_error(
                            call,
                            args_value,
                            ErrorKind::UserDenied,
                            format!("user denied '{}'", call.name),
                            start,
                            decision,
                        ));
                    }
                }
            }
        }

        // 5. Execute
        self.execute_tool(call, descriptor, args, cancel, start, decision)
            .await
    }

    /// Dispatch a batch. Outcomes come back in sequence order.
    ///
    /// With `parallel`, calls run concurrently; otherwise one after another.
    /// On cancellation only the contiguous prefix of finished outcomes is
    /// returned.
    pub async fn dispatch_all(
        &self,
        calls: &[RecognizedCall],
        cancel: &CancellationToken,
        parallel: bool,
    ) -> Vec<ToolOutcome> {
        let mut ordered: Vec<&RecognizedCall> = calls.iter().collect();
        ordered.sort_by_key(|c| c.sequence);

        if parallel {
            let results = futures::future::join_all(
                ordered.iter().map(|call| self.dispatch_with_cancel(call, cancel)),
            )
            .await;
            return results.into_iter().map_while(|o| o).collect();
        }

        let mut outcomes = Vec::with_capacity(ordered.len());
        for call in ordered {
            match self.dispatch_with_cancel(call, cancel).await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        outcomes
    }

    // ─── Execution ──────────────────────────────────────────────────────

    /// Run the handler on its own task so panics and timeouts stay contained.
    async fn execute_tool(
        &self,
        call: &RecognizedCall,
        descriptor: &ToolDescriptor,
        args: Map<String, Value>,
        cancel: &CancellationToken,
        start: Instant,
        decision: Option<UserDecision>,
    ) -> Option<ToolOutcome> {
        let timeout = descriptor.timeout.unwrap_or(self.default_timeout);
        let args_value = Value::Object(args.clone());
        let handler_cancel = cancel.child_token();
        let ctx = ToolContext {
            tool_name: descriptor.name.clone(),
            sequence: call.sequence,
            cancel: handler_cancel.clone(),
        };
        let handler = descriptor.handler();

        tracing::debug!(tool = %call.name, sequence = call.sequence, ?timeout, "executing tool");

        let mut task = tokio::spawn(async move { handler.call(args, ctx).await });

        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                handler_cancel.cancel();
                task.abort();
                tracing::info!(tool = %call.name, sequence = call.sequence, "tool call cancelled");
                return None;
            }
            joined = tokio::time::timeout(timeout, &mut task) => joined,
        };

        let outcome = match joined {
            Err(_elapsed) => {
                handler_cancel.cancel();
                task.abort();
                self.log_and_return_error(
                    call,
                    args_value,
                    ErrorKind::Timeout,
                    format!("'{}' did not finish within {timeout:?}", call.name),
                    start,
                    decision,
                )
            }
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    format!("tool panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "tool task was aborted".to_string()
                };
                self.log_and_return_error(call, args_value, ErrorKind::ExecutionError, message, start, decision)
            }
            Ok(Ok(Err(e))) => self.log_and_return_error(
                call,
                args_value,
                ErrorKind::ExecutionError,
                format!("{e:#}"),
                start,
                decision,
            ),
            Ok(Ok(Ok(output))) => {
                let elapsed = start.elapsed().as_millis() as u64;
                let text = render_output(&call.name, output);
                tracing::info!(
                    tool = %call.name,
                    sequence = call.sequence,
                    elapsed_ms = elapsed,
                    result_len = text.len(),
                    "tool call succeeded"
                );
                ToolOutcome::succeeded(call.sequence, &call.name, args_value, text, elapsed)
                    .with_decision(decision)
            }
        };
        Some(outcome)
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    fn unknown_tool_message(&self, name: &str) -> String {
        if name.trim().is_empty() {
            return "tool call has no name".to_string();
        }
        let suggestions = self.registry.find_similar(name, MAX_SUGGESTIONS);
        if suggestions.is_empty() {
            format!("unknown tool '{name}'; available: {}", self.registry.names().join(", "))
        } else {
            format!("unknown tool '{name}'; did you mean: {}", suggestions.join(", "))
        }
    }

    /// Log a failed dispatch and build its outcome.
    fn log_and_return_error(
        &self,
        call: &RecognizedCall,
        arguments: Value,
        kind: ErrorKind,
        message: String,
        start: Instant,
        decision: Option<UserDecision>,
    ) -> ToolOutcome {
        let elapsed = start.elapsed().as_millis() as u64;

        tracing::warn!(
            tool = %call.name,
            sequence = call.sequence,
            kind = kind.as_str(),
            elapsed_ms = elapsed,
            error = %message,
            "tool call failed"
        );

        ToolOutcome::failed(call.sequence, &call.name, arguments, kind, message, elapsed)
            .with_decision(decision)
    }
}

// ─── Free Functions ─────────────────────────────────────────────────────────

/// Render handler output as text. JSON strings are unwrapped; any other
/// value is serialized and logged as a compatibility fallback.
fn render_output(tool_name: &str, output: ToolOutput) -> String {
    match output {
        ToolOutput::Text(text) => text,
        ToolOutput::Json(Value::String(text)) => text,
        ToolOutput::Json(value) => {
            tracing::warn!(tool = %tool_name, "tool returned a non-text result, rendering as JSON");
            value.to_string()
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Human-readable confirmation preview. Sensitive keys are redacted and
/// long values truncated.
pub fn generate_preview(descriptor: &ToolDescriptor, arguments: &Map<String, Value>) -> String {
    let mut preview = format!(
        "Tool: {}\nDescription: {}\nCategory: {}\nRisk: {:?}",
        descriptor.name, descriptor.description, descriptor.category, descriptor.risk
    );

    if arguments.is_empty() {
        return preview;
    }

    preview.push_str("\nParameters:");
    for (key, value) in arguments {
        let lower = key.to_ascii_lowercase();
        let shown = if SENSITIVE_KEY_MARKERS.iter().any(|m| lower.contains(m)) {
            "***".to_string()
        } else {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            truncate_chars(&text, PREVIEW_VALUE_MAX_CHARS)
        };
        preview.push_str(&format!("\n  - {key}: {shown}"));
    }
    preview
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::permissions::{ConfirmationCategory, ConfirmationPolicy};
    use crate::agent_core::registry::{async_handler, sync_handler, ParamKind, ParamSpec, RiskLevel};
    use serde_json::json;

    fn call(sequence: usize, name: &str, args: Value) -> RecognizedCall {
        RecognizedCall {
            sequence,
            name: name.to_string(),
            arguments: ArgumentPayload::Decoded(args.as_object().cloned().unwrap_or_default()),
            raw_parameters: args.to_string(),
            span: 0..0,
        }
    }

    fn counting_tool(name: &str, counter: Arc<AtomicUsize>) -> ToolDescriptor {
        ToolDescriptor::new(
            name,
            "Counts invocations",
            sync_handler(move |_args| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("counted")
            }),
        )
    }

    fn calculator() -> ToolDescriptor {
        ToolDescriptor::new(
            "calculator",
            "Add two numbers",
            sync_handler(|args| {
                let a = args.get("a").and_then(Value::as_i64).unwrap_or_default();
                let b = args.get("b").and_then(Value::as_i64).unwrap_or_default();
                Ok((a + b).to_string())
            }),
        )
        .param(ParamSpec::required("a", ParamKind::Integer, "First addend"))
        .param(ParamSpec::required("b", ParamKind::Integer, "Second addend"))
    }

    fn router_with(
        tools: Vec<ToolDescriptor>,
        policy: ConfirmationPolicy,
        confirmer: Arc<dyn ConfirmationHandler>,
    ) -> ToolRouter {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool).unwrap();
        }
        ToolRouter::new(Arc::new(registry), Arc::new(PolicyStore::new(policy)), confirmer)
    }

    fn router(tools: Vec<ToolDescriptor>) -> ToolRouter {
        router_with(tools, ConfirmationPolicy::default(), Arc::new(StaticConfirmer::new(None)))
    }

    #[tokio::test]
    async fn test_unknown_tool_never_invokes_handler() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = router(vec![counting_tool("counter", Arc::clone(&counter))]);

        let outcome = router.dispatch(&call(1, "countr", json!({}))).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error_kind(), Some(ErrorKind::UnknownTool));
        assert!(outcome.error.unwrap().message.contains("did you mean: counter"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_name_is_unknown_tool() {
        let router = router(vec![calculator()]);
        let outcome = router.dispatch(&call(1, "", json!({}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::UnknownTool));
        assert_eq!(outcome.error.unwrap().message, "tool call has no name");
    }

    #[tokio::test]
    async fn test_invalid_payload_is_parameter_error() {
        let counter = Arc::new(AtomicUsize::new(0));
        let router = router(vec![counting_tool("counter", Arc::clone(&counter))]);

        let mut bad = call(1, "counter", json!({}));
        bad.arguments = ArgumentPayload::Invalid {
            raw: "{{{".into(),
            reason: "malformed parameters".into(),
        };
        let outcome = router.dispatch(&bad).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ParameterError));
        assert_eq!(outcome.arguments, json!("{{{"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_validation_error_includes_help() {
        let router = router(vec![calculator()]);
        let outcome = router.dispatch(&call(1, "calculator", json!({"a": "x"}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ValidationError));
        let message = outcome.error.unwrap().message;
        assert!(message.contains("missing required parameter 'b'"));
        assert!(message.contains("- a (integer, required): First addend"));
    }

    #[tokio::test]
    async fn test_success_with_coerced_arguments() {
        let router = router(vec![calculator()]);
        let outcome = router
            .dispatch(&call(2, "calculator", json!({"a": "2", "b": 2.0})))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.sequence, 2);
        assert_eq!(outcome.result.as_deref(), Some("4"));
        assert_eq!(outcome.arguments, json!({"a": 2, "b": 2}));
        assert!(outcome.user_decision.is_none());
    }

    #[tokio::test]
    async fn test_pure_handler_is_idempotent() {
        let mut policy = ConfirmationPolicy::default();
        policy.default_policy = PolicyDecision::Allow;
        let router = router_with(
            vec![calculator().requires_confirmation(true)],
            policy,
            Arc::new(StaticConfirmer::new(None)),
        );

        let c = call(1, "calculator", json!({"a": 20, "b": 22}));
        let first = router.dispatch(&c).await;
        let second = router.dispatch(&c).await;
        assert!(first.success);
        assert_eq!(first.result, second.result);
    }

    #[tokio::test]
    async fn test_delete_file_deny_once_is_user_denied() {
        let counter = Arc::new(AtomicUsize::new(0));
        let confirmer = Arc::new(StaticConfirmer::new(Some(UserDecision::DenyOnce)));
        let router = router_with(
            vec![counting_tool("delete_file", Arc::clone(&counter))
                .param(ParamSpec::required("path", ParamKind::String, "File to delete"))
                .confirm(ConfirmationCategory::FileDelete)
                .risk(RiskLevel::High)],
            ConfirmationPolicy::default(),
            confirmer.clone(),
        );

        let outcome = router
            .dispatch(&call(1, "delete_file", json!({"path": "/tmp/x"})))
            .await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::UserDenied));
        assert_eq!(outcome.user_decision, Some(UserDecision::DenyOnce));
        assert_eq!(confirmer.times_asked(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        // Once-answers are not remembered.
        assert!(router.policies().remembered().is_empty());
    }

    #[tokio::test]
    async fn test_policy_deny_skips_confirmer() {
        let counter = Arc::new(AtomicUsize::new(0));
        let confirmer = Arc::new(StaticConfirmer::new(Some(UserDecision::ApproveOnce)));
        let mut policy = ConfirmationPolicy::default();
        policy.tool_policies.insert("rm".into(), PolicyDecision::Deny);
        let router = router_with(
            vec![counting_tool("rm", Arc::clone(&counter)).confirm(ConfirmationCategory::FileDelete)],
            policy,
            confirmer.clone(),
        );

        let outcome = router.dispatch(&call(1, "rm", json!({}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::UserDenied));
        assert_eq!(confirmer.times_asked(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_closed_confirmation_counts_as_deny() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (confirmer, rx) = ChannelConfirmer::new(1);
        drop(rx);
        let router = router_with(
            vec![counting_tool("write", Arc::clone(&counter)).confirm(ConfirmationCategory::FileWrite)],
            ConfirmationPolicy::default(),
            Arc::new(confirmer),
        );

        let outcome = router.dispatch(&call(1, "write", json!({}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::UserDenied));
        assert!(outcome.error.unwrap().message.contains("channel closed"));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_always_approve_is_remembered() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (confirmer, mut rx) = ChannelConfirmer::new(4);
        let router = router_with(
            vec![counting_tool("write", Arc::clone(&counter))
                .param(ParamSpec::required("api_token", ParamKind::String, ""))
                .confirm(ConfirmationCategory::FileWrite)],
            ConfirmationPolicy::default(),
            Arc::new(confirmer),
        );

        let ui = tokio::spawn(async move {
            let pending = rx.recv().await.unwrap();
            assert!(pending.request.preview.contains("api_token: ***"));
            assert_eq!(pending.request.category, ConfirmationCategory::FileWrite);
            pending.respond(UserDecision::AlwaysApprove);
            // No second request should arrive.
            rx.recv().await.is_none()
        });

        let c = call(1, "write", json!({"api_token": "s3cr3t"}));
        let first = router.dispatch(&c).await;
        assert!(first.success);
        assert_eq!(first.user_decision, Some(UserDecision::AlwaysApprove));

        let second = router.dispatch(&c).await;
        assert!(second.success);
        assert!(second.user_decision.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(router);
        assert!(ui.await.unwrap());
    }

    #[tokio::test]
    async fn test_handler_error_is_execution_error() {
        let router = router(vec![ToolDescriptor::new(
            "fails",
            "Always fails",
            sync_handler(|_args| -> anyhow::Result<String> { anyhow::bail!("disk on fire") }),
        )]);
        let outcome = router.dispatch(&call(1, "fails", json!({}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ExecutionError));
        assert_eq!(outcome.error.unwrap().message, "disk on fire");
    }

    #[tokio::test]
    async fn test_handler_panic_is_captured() {
        let router = router(vec![
            ToolDescriptor::new(
                "sync_panic",
                "",
                sync_handler(|_args| -> anyhow::Result<String> { panic!("sync boom") }),
            ),
            ToolDescriptor::new(
                "async_panic",
                "",
                async_handler(|_args, _ctx| async move {
                    if true {
                        panic!("async boom");
                    }
                    Ok("unreachable")
                }),
            ),
        ]);

        let outcome = router.dispatch(&call(1, "sync_panic", json!({}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ExecutionError));
        assert!(outcome.error.unwrap().message.contains("sync boom"));

        let outcome = router.dispatch(&call(2, "async_panic", json!({}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::ExecutionError));
        assert!(outcome.error.unwrap().message.contains("async boom"));
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let router = router(vec![ToolDescriptor::new(
            "slow",
            "Sleeps",
            async_handler(|_args, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok("late")
            }),
        )
        .timeout(Duration::from_millis(50))]);

        let outcome = router.dispatch(&call(1, "slow", json!({}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
        assert!(outcome.error.unwrap().message.contains("did not finish within 50ms"));
        assert!(outcome.duration_ms >= 50);
    }

    #[tokio::test]
    async fn test_router_default_timeout_applies() {
        let router = router(vec![ToolDescriptor::new(
            "slow",
            "Sleeps",
            async_handler(|_args, ctx: ToolContext| async move {
                ctx.cancel.cancelled().await;
                Ok("stopped")
            }),
        )])
        .with_default_timeout(Duration::from_millis(20));

        let outcome = router.dispatch(&call(1, "slow", json!({}))).await;
        assert_eq!(outcome.error_kind(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_non_text_result_rendered_as_json() {
        let router = router(vec![ToolDescriptor::new(
            "stats",
            "",
            sync_handler(|_args| Ok(json!({"count": 3}))),
        )]);
        let outcome = router.dispatch(&call(1, "stats", json!({}))).await;
        assert_eq!(outcome.result.as_deref(), Some(r#"{"count":3}"#));
    }

    #[tokio::test]
    async fn test_dispatch_all_parallel_keeps_sequence_order() {
        let slow_first = ToolDescriptor::new(
            "sleep",
            "",
            async_handler(|args, _ctx| async move {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(format!("slept {ms}"))
            }),
        )
        .param(ParamSpec::required("ms", ParamKind::Integer, ""));
        let router = router(vec![slow_first]);

        let calls = vec![
            call(2, "sleep", json!({"ms": 1})),
            call(1, "sleep", json!({"ms": 80})),
            call(3, "sleep", json!({"ms": 0})),
        ];
        let outcomes = router
            .dispatch_all(&calls, &CancellationToken::new(), true)
            .await;
        let sequences: Vec<usize> = outcomes.iter().map(|o| o.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(outcomes[0].result.as_deref(), Some("slept 80"));
    }

    #[tokio::test]
    async fn test_dispatch_all_cancel_keeps_prefix() {
        let hang = ToolDescriptor::new(
            "hang",
            "",
            async_handler(|_args, _ctx| async move {
                futures::future::pending::<()>().await;
                Ok("never")
            }),
        );
        let router = Arc::new(router(vec![calculator(), hang]));
        let cancel = CancellationToken::new();

        let calls = vec![
            call(1, "calculator", json!({"a": 1, "b": 1})),
            call(2, "hang", json!({})),
            call(3, "calculator", json!({"a": 2, "b": 2})),
        ];

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcomes = router.dispatch_all(&calls, &cancel, false).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].sequence, 1);

        // Already-cancelled tokens dispatch nothing.
        assert!(router.dispatch_with_cancel(&calls[0], &cancel).await.is_none());
    }

    #[test]
    fn test_generate_preview_redacts_and_truncates() {
        let descriptor = ToolDescriptor::new("login", "Log in", sync_handler(|_args| Ok("ok")))
            .category(ConfirmationCategory::NetworkRequest);
        let args = json!({
            "password": "hunter2",
            "Auth_Token": "abc",
            "note": "x".repeat(150),
            "retries": 3
        });
        let preview = generate_preview(&descriptor, args.as_object().unwrap());

        assert!(preview.contains("Tool: login"));
        assert!(preview.contains("Category: network_request"));
        assert!(preview.contains("password: ***"));
        assert!(preview.contains("Auth_Token: ***"));
        assert!(!preview.contains("hunter2"));
        assert!(preview.contains(&format!("note: {}...", "x".repeat(100))));
        assert!(preview.contains("retries: 3"));
    }
}
