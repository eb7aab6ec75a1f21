//! The agent loop: stream a model turn, run the tools it asked for, feed the
//! results back, repeat until the model answers without tools.
//!
//! ```text
//! AwaitingModel -> ModelStreaming -> ExecutingTools -> AwaitingModel ...
//!                        |                 |
//!                        +--> Completed    +--> Aborted
//!                        +--> Failed / Aborted
//! ```
//!
//! The assistant message is appended only once the stream delivers its final
//! event. A cancelled tool phase rolls the transcript back to where the turn
//! started, so an aborted task never leaves a tool request without results.

use std::fmt::Write;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use drover_providers::retry::{RetryConfig, calculate_retry_delay};
use drover_providers::{ApiError, InferenceTransport};
use drover_types::{
    ContentBlock, ConversationMessage, FinalResponse, InvocationStatus, ProviderError, Role,
    StreamEvent, ToolInvocation, Usage,
};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::environment::EnvironmentProbe;
use crate::extract::{Extraction, ToolCallExtractor, ToolParseError};
use crate::persistence::TranscriptSink;
use crate::session::TaskSession;
use crate::tools::{self, SideEffect, ToolCtx, ToolError, ToolRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    AwaitingModel,
    ModelStreaming,
    ExecutingTools,
    Completed,
    Aborted,
    Failed,
}

impl LoopState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            LoopState::AwaitingModel => "awaiting_model",
            LoopState::ModelStreaming => "model_streaming",
            LoopState::ExecutingTools => "executing_tools",
            LoopState::Completed => "completed",
            LoopState::Aborted => "aborted",
            LoopState::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            LoopState::Completed | LoopState::Aborted | LoopState::Failed
        )
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("turn limit of {0} exceeded")]
    TurnLimitExceeded(u32),
}

/// How a task run ended.
#[derive(Debug)]
pub struct LoopOutcome {
    pub state: LoopState,
    pub turns: u32,
    pub error: Option<LoopError>,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_turns: u32,
    pub max_concurrent_tools: usize,
    /// Applies to tools that do not declare their own timeout.
    pub tool_timeout: Duration,
    /// How long running tools get to wind down after an abort.
    pub cleanup_grace: Duration,
    pub retry: RetryConfig,
    pub working_dir: PathBuf,
    pub max_output_bytes: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_turns: 25,
            max_concurrent_tools: 4,
            tool_timeout: Duration::from_secs(120),
            cleanup_grace: Duration::from_secs(2),
            retry: RetryConfig::default(),
            working_dir: PathBuf::from("."),
            max_output_bytes: 64 * 1024,
        }
    }
}

/// Progress notifications for a front end.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    StateChanged(LoopState),
    Text(String),
    ToolStarted {
        id: String,
        name: String,
    },
    ToolFinished {
        id: String,
        name: String,
        status: InvocationStatus,
    },
    Usage(Usage),
}

struct TurnResponse {
    response: FinalResponse,
    extractions: Vec<Extraction>,
}

type ToolOutcome = Result<String, ToolError>;

pub struct ToolLoop<T> {
    transport: T,
    registry: Arc<ToolRegistry>,
    probe: Box<dyn EnvironmentProbe>,
    sink: Box<dyn TranscriptSink>,
    settings: LoopSettings,
    events: Option<mpsc::Sender<LoopEvent>>,
}

impl<T> std::fmt::Debug for ToolLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolLoop")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<T: InferenceTransport> ToolLoop<T> {
    pub fn new(
        transport: T,
        registry: Arc<ToolRegistry>,
        probe: Box<dyn EnvironmentProbe>,
        sink: Box<dyn TranscriptSink>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            transport,
            registry,
            probe,
            sink,
            settings,
            events: None,
        }
    }

    /// Send progress events to `tx`. Events are dropped when the channel is full.
    pub fn with_events(mut self, tx: mpsc::Sender<LoopEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Drive `session` to a terminal state and hand the transcript to the sink.
    pub async fn run(&self, session: &mut TaskSession) -> LoopOutcome {
        let (state, error) = self.drive(session).await;
        self.transition(session, state);
        match &error {
            Some(err) => tracing::error!(task = %session.id(), turns = session.turns(), "Task failed: {err}"),
            None => tracing::info!(task = %session.id(), turns = session.turns(), %state, "Task finished"),
        }
        if let Err(e) = self.sink.persist(session.id(), session.messages(), state) {
            tracing::warn!(task = %session.id(), "Failed to persist transcript: {e}");
        }
        LoopOutcome {
            state,
            turns: session.turns(),
            error,
        }
    }

    async fn drive(&self, session: &mut TaskSession) -> (LoopState, Option<LoopError>) {
        loop {
            if session.is_aborted() {
                return (LoopState::Aborted, None);
            }
            if session.turns() >= self.settings.max_turns {
                return (
                    LoopState::Failed,
                    Some(LoopError::TurnLimitExceeded(self.settings.max_turns)),
                );
            }
            let turn = session.begin_turn();
            self.transition(session, LoopState::AwaitingModel);

            let TurnResponse {
                response,
                extractions,
            } = match self.model_turn(session, turn).await {
                Ok(Some(turn_response)) => turn_response,
                Ok(None) => return (LoopState::Aborted, None),
                Err(err) => return (LoopState::Failed, Some(err.into())),
            };

            session.record_usage(&response.usage);
            self.emit(LoopEvent::Usage(response.usage));
            let checkpoint = session.messages().len();
            let mut message = response.message;
            message.role = Role::Assistant;
            session.push_message(message);

            // Parse errors alone still get a turn: they are reported back so the
            // model can correct the block.
            if extractions.is_empty() {
                return (LoopState::Completed, None);
            }

            self.transition(session, LoopState::ExecutingTools);
            match self.execute_tools(session, turn, extractions).await {
                Some(results) => session.push_message(results),
                None => {
                    session.truncate(checkpoint);
                    return (LoopState::Aborted, None);
                }
            }
        }
    }

    /// One model call with turn-level retries. `Ok(None)` means aborted.
    async fn model_turn(
        &self,
        session: &mut TaskSession,
        turn: u32,
    ) -> Result<Option<TurnResponse>, ApiError> {
        let cancel = session.cancel_token();
        let mut attempt = 0;
        loop {
            match self.stream_turn(session, turn).await {
                Ok(turn_response) => return Ok(Some(turn_response)),
                Err(ApiError::Aborted) => return Ok(None),
                Err(_) if cancel.is_cancelled() => return Ok(None),
                Err(err) if err.is_retryable() && attempt < self.settings.retry.max_retries => {
                    let delay = calculate_retry_delay(attempt, &self.settings.retry);
                    attempt += 1;
                    tracing::warn!(
                        turn,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying turn after {err}"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn stream_turn(
        &self,
        session: &mut TaskSession,
        turn: u32,
    ) -> Result<TurnResponse, ApiError> {
        let environment = self.probe.environment_details().await;
        let request = session.prepare_request(environment.as_deref());
        let cancel = session.cancel_token();

        let mut stream = self
            .transport
            .open_stream(&request, cancel.child_token())
            .await?;
        self.transition(session, LoopState::ModelStreaming);

        let mut extractor = ToolCallExtractor::new(self.registry.names(), format!("t{turn}"));
        let mut provider_error: Option<ProviderError> = None;

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(ApiError::Aborted);
            }
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    // A stream that reported an error and then closed fails with that error.
                    return Err(match (err, provider_error.take()) {
                        (ApiError::Network, Some(reported)) => ApiError::Provider {
                            status: reported.status,
                            message: reported.message,
                        },
                        (err, _) => err,
                    });
                }
            };
            match event {
                StreamEvent::Partial => {}
                StreamEvent::Display(text) => {
                    extractor.push(&text);
                    self.emit(LoopEvent::Text(text));
                }
                StreamEvent::Error(reported) => {
                    tracing::warn!(
                        turn,
                        status = ?reported.status,
                        "Provider reported an error mid-stream: {}",
                        reported.message
                    );
                    provider_error = Some(reported);
                }
                StreamEvent::Final(response) => {
                    let extractions = extractor.reconcile(&response.message.text());
                    if let Some(name) = extractor.finish() {
                        tracing::warn!(turn, tool = name, "Unterminated tool block ignored");
                    }
                    return Ok(TurnResponse {
                        response,
                        extractions,
                    });
                }
            }
        }

        Err(match provider_error {
            Some(reported) => ApiError::Provider {
                status: reported.status,
                message: reported.message,
            },
            None => ApiError::Network,
        })
    }

    /// Run the turn's invocations. `None` means the task was aborted.
    async fn execute_tools(
        &self,
        session: &TaskSession,
        turn: u32,
        extractions: Vec<Extraction>,
    ) -> Option<ConversationMessage> {
        let cancel = session.cancel_token();
        let mut invocations = Vec::new();
        let mut parse_errors = Vec::new();
        for extraction in extractions {
            match extraction {
                Extraction::Invocation(invocation) => invocations.push(invocation),
                Extraction::ParseError { tool, error } => {
                    tracing::warn!(turn, tool = %tool, "Malformed tool block: {error}");
                    parse_errors.push((tool, error));
                }
            }
        }

        let side_effects: Vec<SideEffect> = invocations
            .iter()
            .map(|inv| {
                self.registry
                    .lookup(&inv.name)
                    .map_or(SideEffect::Mutating, |exec| exec.side_effect())
            })
            .collect();
        let fail_fast: Vec<bool> = invocations
            .iter()
            .map(|inv| self.registry.lookup(&inv.name).is_ok_and(|exec| exec.fail_fast()))
            .collect();

        let mut results: Vec<Option<ToolOutcome>> = invocations.iter().map(|_| None).collect();
        let mut join: JoinSet<(usize, ToolOutcome)> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut mutating_in_flight = false;
        let mut next = 0usize;
        let mut halted_by: Option<String> = None;
        let pool = self.settings.max_concurrent_tools.max(1);

        loop {
            while halted_by.is_none() && next < invocations.len() && !cancel.is_cancelled() {
                let can_start = match side_effects[next] {
                    SideEffect::Mutating => in_flight == 0,
                    SideEffect::ReadOnly => !mutating_in_flight && in_flight < pool,
                };
                if !can_start {
                    break;
                }
                let invocation = &mut invocations[next];
                invocation.advance(InvocationStatus::Running);
                tracing::info!(turn, tool = %invocation.name, id = %invocation.id, "Tool started");
                self.emit(LoopEvent::ToolStarted {
                    id: invocation.id.clone(),
                    name: invocation.name.clone(),
                });
                let ctx = ToolCtx {
                    invocation_id: invocation.id.clone(),
                    working_dir: self.settings.working_dir.clone(),
                    cancel: cancel.child_token(),
                    max_output_bytes: self.settings.max_output_bytes,
                };
                let registry = Arc::clone(&self.registry);
                let call = invocation.clone();
                let default_timeout = self.settings.tool_timeout;
                let index = next;
                join.spawn(async move {
                    (index, run_tool(&registry, call, ctx, default_timeout).await)
                });
                in_flight += 1;
                mutating_in_flight |= side_effects[next] == SideEffect::Mutating;
                next += 1;
            }

            if in_flight == 0 {
                break;
            }

            let joined = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                joined = join.join_next() => joined,
            };
            let Some(joined) = joined else {
                self.wind_down(&mut join, turn).await;
                return None;
            };
            in_flight -= 1;
            if in_flight == 0 {
                mutating_in_flight = false;
            }
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(turn, "Tool task failed: {err}");
                    continue;
                }
            };
            let invocation = &mut invocations[index];
            let status = if outcome.is_ok() {
                InvocationStatus::Succeeded
            } else {
                InvocationStatus::Failed
            };
            invocation.advance(status);
            match &outcome {
                Ok(_) => tracing::info!(turn, tool = %invocation.name, id = %invocation.id, "Tool succeeded"),
                Err(err) => tracing::warn!(turn, tool = %invocation.name, id = %invocation.id, "Tool failed: {err}"),
            }
            self.emit(LoopEvent::ToolFinished {
                id: invocation.id.clone(),
                name: invocation.name.clone(),
                status,
            });
            if outcome.is_err() && fail_fast[index] && halted_by.is_none() {
                tracing::warn!(turn, tool = %invocation.name, "Fail-fast tool failed; skipping the rest of the turn");
                halted_by = Some(invocation.name.clone());
            }
            results[index] = Some(outcome);
        }

        if cancel.is_cancelled() {
            self.wind_down(&mut join, turn).await;
            return None;
        }

        let outcomes = invocations
            .iter_mut()
            .zip(results)
            .map(|(invocation, result)| {
                let outcome = result.unwrap_or_else(|| match &halted_by {
                    Some(after) if invocation.status == InvocationStatus::Detected => {
                        Err(ToolError::Skipped {
                            after: after.clone(),
                        })
                    }
                    _ => Err(ToolError::Panicked {
                        tool: invocation.name.clone(),
                        message: "tool task ended without a result".to_string(),
                    }),
                });
                invocation.advance(InvocationStatus::Failed);
                outcome
            })
            .collect::<Vec<_>>();

        Some(results_message(&invocations, &outcomes, &parse_errors))
    }

    /// Give running tools the cleanup grace period, then abort what is left.
    async fn wind_down(&self, join: &mut JoinSet<(usize, ToolOutcome)>, turn: u32) {
        let grace = self.settings.cleanup_grace;
        let drained = tokio::time::timeout(grace, async {
            while join.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                turn,
                remaining = join.len(),
                grace_ms = grace.as_millis() as u64,
                "Tools still running after cleanup grace; aborting them"
            );
        }
        join.shutdown().await;
    }

    fn transition(&self, session: &TaskSession, state: LoopState) {
        tracing::info!(task = %session.id(), turn = session.turns(), %state, "Loop state changed");
        self.emit(LoopEvent::StateChanged(state));
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.try_send(event);
        }
    }
}

async fn run_tool(
    registry: &ToolRegistry,
    invocation: ToolInvocation,
    ctx: ToolCtx,
    default_timeout: Duration,
) -> ToolOutcome {
    let exec = registry.lookup(&invocation.name)?;
    tools::validate_input(exec.parameters(), &invocation.input)?;
    let timeout = exec.timeout().unwrap_or(default_timeout);
    let max_output_bytes = ctx.max_output_bytes;

    let exec_future = AssertUnwindSafe(exec.execute(invocation.input, ctx)).catch_unwind();
    match tokio::time::timeout(timeout, exec_future).await {
        Err(_) => Err(ToolError::Timeout {
            tool: invocation.name,
            elapsed: timeout,
        }),
        Ok(Err(panic_payload)) => Err(ToolError::Panicked {
            tool: invocation.name,
            message: panic_payload_to_string(&panic_payload),
        }),
        Ok(Ok(result)) => result.map(|output| tools::truncate_output(output, max_output_bytes)),
    }
}

fn results_message(
    invocations: &[ToolInvocation],
    outcomes: &[ToolOutcome],
    parse_errors: &[(String, ToolParseError)],
) -> ConversationMessage {
    let mut blocks = Vec::with_capacity(invocations.len() + parse_errors.len());
    for (invocation, outcome) in invocations.iter().zip(outcomes) {
        let (status, body) = match outcome {
            Ok(output) => ("success", output.clone()),
            Err(err) => ("error", err.to_string()),
        };
        let mut text = String::with_capacity(body.len() + 96);
        let _ = write!(
            text,
            "<tool_result name=\"{}\" id=\"{}\" status=\"{status}\">\n{body}\n</tool_result>",
            invocation.name, invocation.id
        );
        blocks.push(ContentBlock::text(text));
    }
    for (tool, error) in parse_errors {
        blocks.push(ContentBlock::text(format!(
            "<tool_parse_error name=\"{tool}\">\n{error}\n</tool_parse_error>"
        )));
    }
    ConversationMessage::new(Role::User, blocks)
}

fn panic_payload_to_string(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
