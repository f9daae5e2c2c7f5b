//! Conversation orchestrator: drives one user turn to a terminal state.
//!
//! Each round:
//! 1. **Await model**: send the token-optimized history plus tool schemas
//! 2. **Recognize**: split the response into visible text and ordered calls
//! 3. **Dispatch**: run every call through the router, append one
//!    tool-result message per outcome in sequence order
//! 4. **Decide**: no calls ends the turn; otherwise loop until the round cap
//!    or wall-clock budget runs out
//!
//! A turn ends as a final answer, an exhausted budget, an adapter failure, or
//! a cancellation. Nothing inside a round aborts the turn early: recognizer
//! malformations and tool failures become outcomes the model can read.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::inference::client::{ModelAdapter, ModelResponse, OpenAiCompatibleAdapter};
use crate::inference::config::{LoopConfig, RuntimeConfig};
use crate::inference::errors::InferenceError;
use crate::inference::streaming::StreamRecognizer;
use crate::inference::tool_call_parser::{recognize, CallMarkup, RecognizedCall, Segment};
use crate::inference::types::{ChatMessage, ToolSchema};

use super::conversation::{Conversation, SessionStore, TokenOptimization};
use super::permissions::PolicyStore;
use super::registry::ToolRegistry;
use super::tokens::truncate_utf8;
use super::tool_router::{ConfirmationHandler, ToolRouter};
use super::types::{TurnEvent, TurnReport, TurnStatus};

// ─── Limits ─────────────────────────────────────────────────────────────────

/// Bounds on a single turn.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopLimits {
    /// Dispatch rounds before the turn ends with `BUDGET_EXCEEDED`.
    pub max_rounds: u32,
    pub wall_clock: Option<Duration>,
    /// Dispatch the calls of one response concurrently.
    pub parallel: bool,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self::from(&LoopConfig::default())
    }
}

impl From<&LoopConfig> for LoopLimits {
    fn from(config: &LoopConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            wall_clock: config.wall_clock(),
            parallel: config.parallel_dispatch,
        }
    }
}

// ─── Internal Types ─────────────────────────────────────────────────────────

/// What one model response contained.
struct ModelTurn {
    raw: String,
    visible: String,
    calls: Vec<RecognizedCall>,
}

/// Why a guarded wait stopped early.
enum Interrupt {
    Cancelled,
    Deadline,
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

/// Drives turns against one adapter and one router. Shareable across
/// sessions; all per-turn state lives in the `Conversation`.
pub struct Orchestrator {
    adapter: Arc<dyn ModelAdapter>,
    router: Arc<ToolRouter>,
    markup: CallMarkup,
    limits: LoopLimits,
    optimization: TokenOptimization,
    store: Option<Arc<dyn SessionStore>>,
    events: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl Orchestrator {
    pub fn new(adapter: Arc<dyn ModelAdapter>, router: Arc<ToolRouter>) -> Self {
        Self {
            adapter,
            router,
            markup: CallMarkup::default(),
            limits: LoopLimits::default(),
            optimization: TokenOptimization::default(),
            store: None,
            events: None,
        }
    }

    /// Wire everything from a runtime config: the OpenAI-compatible adapter,
    /// the policy store (persistent when `persist_path` is set), and a router
    /// using the configured tool timeout.
    pub fn from_config(
        config: &RuntimeConfig,
        registry: ToolRegistry,
        confirmer: Arc<dyn ConfirmationHandler>,
    ) -> Result<Self, InferenceError> {
        config.validate()?;

        let adapter = OpenAiCompatibleAdapter::from_config(&config.model, config.markup.clone())?;
        let policy = config.confirmation.policy.clone();
        let policies = match &config.confirmation.persist_path {
            Some(path) => PolicyStore::with_persistence(policy, path),
            None => PolicyStore::new(policy),
        };
        let router = ToolRouter::new(Arc::new(registry), Arc::new(policies), confirmer)
            .with_default_timeout(config.agent_loop.tool_timeout());

        tracing::info!(
            model = %config.model.model_name,
            tools = router.registry().len(),
            max_rounds = config.agent_loop.max_rounds,
            "orchestrator configured"
        );

        Ok(Self::new(Arc::new(adapter), Arc::new(router))
            .with_markup(config.markup.clone())
            .with_limits(LoopLimits::from(&config.agent_loop))
            .with_optimization(config.token_optimization.clone()))
    }

    pub fn with_markup(mut self, markup: CallMarkup) -> Self {
        self.markup = markup;
        self
    }

    pub fn with_limits(mut self, limits: LoopLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_optimization(mut self, optimization: TokenOptimization) -> Self {
        self.optimization = optimization;
        self
    }

    /// Hand each turn's new messages to a session store.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Forward progress events. A dropped receiver is ignored.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    // ─── Turn Loop ──────────────────────────────────────────────────────

    /// Run one user turn to completion. Every message produced is appended
    /// to `conversation`; the report summarizes the turn.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        user_message: &str,
        cancel: &CancellationToken,
    ) -> TurnReport {
        let turn_start = conversation.len();
        let deadline = self.limits.wall_clock.map(|budget| Instant::now() + budget);
        let max_rounds = self.limits.max_rounds.max(1);
        let schemas = self.router.registry().schemas();

        conversation.push_user(user_message);
        tracing::info!(
            session_id = %conversation.session_id(),
            adapter = %self.adapter.name(),
            max_rounds,
            "turn started"
        );

        let mut rounds: u32 = 0;
        let mut outcomes = Vec::new();
        let mut final_text = String::new();

        let status = loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break TurnStatus::BudgetExceeded { rounds };
            }

            // Await model + recognize
            let history = conversation.to_chat_messages(&self.optimization);
            let round = rounds + 1;
            let model_turn = match self
                .guarded(self.model_round(round, &history, &schemas), cancel, deadline)
                .await
            {
                Ok(Ok(turn)) => turn,
                Ok(Err(e)) => {
                    tracing::warn!(round, error = %e, "model adapter failed");
                    break TurnStatus::AdapterFailure {
                        message: e.to_string(),
                    };
                }
                Err(Interrupt::Cancelled) => break TurnStatus::Cancelled,
                Err(Interrupt::Deadline) => break TurnStatus::BudgetExceeded { rounds },
            };

            conversation.push_assistant(model_turn.raw, model_turn.visible.clone());
            final_text = model_turn.visible;

            if model_turn.calls.is_empty() {
                break TurnStatus::FinalAnswer;
            }

            // Dispatch
            rounds = round;
            tracing::debug!(round, calls = model_turn.calls.len(), "dispatching tool calls");
            let batch = self
                .router
                .dispatch_all(&model_turn.calls, cancel, self.limits.parallel)
                .await;
            for outcome in batch {
                self.emit(TurnEvent::Outcome {
                    round,
                    outcome: outcome.clone(),
                });
                conversation.push_tool_result(outcome.clone());
                outcomes.push(outcome);
            }

            // Decide
            if cancel.is_cancelled() {
                break TurnStatus::Cancelled;
            }
            if rounds >= max_rounds {
                break TurnStatus::BudgetExceeded { rounds };
            }
        };

        if let Some(notice) = self.notice_for(&status, max_rounds) {
            self.emit(TurnEvent::Notice {
                message: notice.clone(),
            });
            conversation.push_notice(notice);
        }

        tracing::info!(
            session_id = %conversation.session_id(),
            status = status.code(),
            rounds,
            outcomes = outcomes.len(),
            "turn finished"
        );

        self.persist(conversation, turn_start).await;

        TurnReport {
            status,
            final_text,
            rounds,
            outcomes,
        }
    }

    /// One model call, recognized into text and calls. Streaming text is
    /// forwarded as soon as the recognizer releases it.
    async fn model_round(
        &self,
        round: u32,
        history: &[ChatMessage],
        schemas: &[ToolSchema],
    ) -> Result<ModelTurn, InferenceError> {
        let mut turn = ModelTurn {
            raw: String::new(),
            visible: String::new(),
            calls: Vec::new(),
        };

        match self.adapter.send(history, schemas).await? {
            ModelResponse::Complete(text) => {
                for segment in recognize(&text, &self.markup) {
                    self.absorb(round, segment, &mut turn);
                }
                turn.raw = text;
            }
            ModelResponse::Streaming(mut fragments) => {
                let mut recognizer = StreamRecognizer::new(self.markup.clone());
                while let Some(fragment) = fragments.next().await {
                    let fragment = fragment?;
                    turn.raw.push_str(&fragment);
                    for segment in recognizer.push(&fragment) {
                        self.absorb(round, segment, &mut turn);
                    }
                }
                for segment in recognizer.finish() {
                    self.absorb(round, segment, &mut turn);
                }
            }
        }

        tracing::debug!(
            round,
            calls = turn.calls.len(),
            preview = %truncate_utf8(&turn.visible, 120),
            "model response recognized"
        );
        Ok(turn)
    }

    fn absorb(&self, round: u32, segment: Segment, turn: &mut ModelTurn) {
        match segment {
            Segment::Text(span) => {
                if span.text.is_empty() {
                    return;
                }
                self.emit(TurnEvent::TextDelta {
                    round,
                    text: span.text.clone(),
                });
                turn.visible.push_str(&span.text);
            }
            Segment::Call(call) => {
                self.emit(TurnEvent::CallRecognized {
                    round,
                    sequence: call.sequence,
                    name: call.name.clone(),
                });
                turn.calls.push(call);
            }
        }
    }

    /// Await `fut` unless the caller cancels or the deadline passes first.
    async fn guarded<F: Future>(
        &self,
        fut: F,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<F::Output, Interrupt> {
        let expired = async {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => futures::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = expired => Err(Interrupt::Deadline),
            out = fut => Ok(out),
        }
    }

    fn notice_for(&self, status: &TurnStatus, max_rounds: u32) -> Option<String> {
        let detail = match status {
            TurnStatus::FinalAnswer => return None,
            TurnStatus::BudgetExceeded { rounds } if *rounds >= max_rounds => {
                format!("stopped after {rounds} tool rounds without a final answer")
            }
            TurnStatus::BudgetExceeded { rounds } => match self.limits.wall_clock {
                Some(budget) => format!("wall-clock budget of {budget:?} ran out after {rounds} tool rounds"),
                None => format!("stopped after {rounds} tool rounds"),
            },
            TurnStatus::AdapterFailure { message } => format!("model request failed: {message}"),
            TurnStatus::Cancelled => "turn cancelled by the user".to_string(),
        };
        Some(format!("[{}] {detail}", status.code()))
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    async fn persist(&self, conversation: &Conversation, turn_start: usize) {
        let Some(store) = &self.store else {
            return;
        };
        let new_messages = conversation.messages_since(turn_start);
        if let Err(e) = store.append(conversation.session_id(), new_messages).await {
            tracing::warn!(
                session_id = %conversation.session_id(),
                error = %e,
                "failed to persist turn; history kept in memory"
            );
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
