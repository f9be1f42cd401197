//! The step loop.
//!
//! A [`Soul`] owns its [`Context`] and drives one turn at a time:
//! user text in, then model call → tool batch → model call … until the model
//! answers without tool calls, the step limit is hit, the turn is cancelled,
//! or a fatal error ends it.

pub mod retry;

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{ToolBroker, ToolResultRecord};
use crate::context::{compaction, Context};
use crate::error::{SoulError, SoulResult};
use crate::provider::{ModelReply, Provider};
use crate::types::*;

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    AwaitingModel,
    HandlingToolCalls,
    Done,
    Failed,
}

/// How a turn ended, when it did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The model answered without tool calls
    Completed { text: String, steps: usize },
    /// The turn's cancellation token fired
    Cancelled,
    /// `max_steps` model calls happened without a final answer
    StepLimit { steps: usize },
}

const TRUNCATION_MARKER: &str = "\n[output truncated]";

pub struct Soul {
    provider: Arc<dyn Provider>,
    broker: ToolBroker,
    context: Context,
    config: AgentConfig,
    state: LoopState,
}

impl Soul {
    pub fn new(
        provider: Arc<dyn Provider>,
        broker: ToolBroker,
        context: Context,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            broker,
            context,
            config,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn into_context(self) -> Context {
        self.context
    }

    /// Run one user turn to completion.
    ///
    /// Returns `Err` only for failures the model cannot act on: exhausted
    /// retries, a fatal model error, an oversized entry or a storage error.
    /// Whatever was committed before the failure stays in the context.
    pub async fn run_turn(
        &mut self,
        user_text: impl Into<String>,
        events: mpsc::UnboundedSender<AgentEvent>,
        cancel: CancellationToken,
    ) -> SoulResult<TurnOutcome> {
        let pending = self.context.pending_tool_calls();
        if !pending.is_empty() {
            return Err(SoulError::InvariantViolation(format!(
                "{} tool call(s) from an interrupted turn are unanswered; resume first",
                pending.len()
            )));
        }

        self.state = LoopState::Idle;
        let cancel = cancel.child_token();
        let result = self.drive(user_text.into(), &events, &cancel).await;

        match &result {
            Ok(TurnOutcome::Completed { steps, .. }) => {
                let _ = events.send(AgentEvent::TurnDone { steps: *steps });
                self.state = LoopState::Done;
            }
            Ok(TurnOutcome::Cancelled) => {
                tracing::info!("Turn cancelled");
                let _ = events.send(AgentEvent::TurnFailed {
                    reason: "cancelled".into(),
                });
                self.state = LoopState::Idle;
            }
            Ok(TurnOutcome::StepLimit { steps }) => {
                tracing::warn!(steps, "Turn hit the step limit");
                let _ = events.send(AgentEvent::TurnFailed {
                    reason: format!("step limit of {steps} reached"),
                });
                self.state = LoopState::Idle;
            }
            Err(e) => {
                self.state = LoopState::Failed;
                tracing::error!(error = %e, "Turn failed");
                let _ = events.send(AgentEvent::TurnFailed {
                    reason: e.to_string(),
                });
                self.state = LoopState::Idle;
            }
        }
        result
    }

    async fn drive(
        &mut self,
        user_text: String,
        events: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> SoulResult<TurnOutcome> {
        self.context.append(EntryKind::user(user_text)).await?;
        self.state = LoopState::AwaitingModel;

        let mut steps = 0;
        loop {
            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
            if steps >= self.config.max_steps {
                return Ok(TurnOutcome::StepLimit { steps });
            }

            self.maybe_compact(events, cancel).await?;

            steps += 1;
            let Some(reply) = self.call_model(events, cancel).await? else {
                return Ok(TurnOutcome::Cancelled);
            };
            check_call_ids(&reply)?;

            let text = reply.text.clone();
            let calls = reply.tool_calls.clone();
            self.context.append(reply.into_entry()).await?;

            if calls.is_empty() {
                tracing::debug!(steps, "Model answered without tool calls");
                return Ok(TurnOutcome::Completed { text, steps });
            }

            self.state = LoopState::HandlingToolCalls;
            tracing::debug!(count = calls.len(), "Executing tool calls");
            // Journal each result as soon as it and its predecessors are in
            let mut results = self.broker.spawn_batch(&calls, cancel, events);
            while let Some(record) = results.next().await {
                self.append_tool_result(record).await?;
            }

            if cancel.is_cancelled() {
                return Ok(TurnOutcome::Cancelled);
            }
            self.state = LoopState::AwaitingModel;
        }
    }

    /// Call the model, retrying transient failures. `None` means cancelled.
    async fn call_model(
        &self,
        events: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> SoulResult<Option<ModelReply>> {
        let model = self.provider.model();
        let capabilities = if model.supports_tools {
            self.broker.registry().capabilities()
        } else {
            Vec::new()
        };
        let thinking = self.config.thinking_enabled(model);
        let policy = &self.config.retry;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let snapshot = self.context.snapshot();

            // Forward deltas as events
            let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();
            let event_tx = events.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(delta) = delta_rx.recv().await {
                    let event = match delta {
                        StreamDelta::TextDelta { text } => AgentEvent::AssistantTextDelta { text },
                        StreamDelta::ThinkingDelta { text } => AgentEvent::ReasoningDelta { text },
                    };
                    let _ = event_tx.send(event);
                }
            });

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.provider.send(&snapshot, &capabilities, thinking, delta_tx) => Some(result),
            };
            forwarder.await.ok();

            let error = match result {
                None => return Ok(None),
                Some(Ok(reply)) => return Ok(Some(reply)),
                Some(Err(e)) => e,
            };

            if !error.is_transient() || !policy.should_retry(attempt) {
                return Err(SoulError::FatalTurn {
                    attempts: attempt,
                    reason: error.to_string(),
                });
            }

            let delay = policy.delay_for(attempt, error.retry_after_ms());
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient model error, retrying"
            );
            let _ = events.send(AgentEvent::Retrying {
                attempt,
                delay_ms: delay.as_millis() as u64,
                reason: error.to_string(),
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Fold the oldest entries into a summary when the context runs hot.
    ///
    /// A failed or cancelled summary leaves the context untouched.
    async fn maybe_compact(
        &mut self,
        events: &mpsc::UnboundedSender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> SoulResult<()> {
        if !compaction::needs_compaction(&self.context, &self.config.compaction) {
            return Ok(());
        }
        let Some(boundary) =
            compaction::compaction_boundary(&self.context, self.config.compaction.preserve_recent)
        else {
            tracing::debug!("Compaction due but nothing can be folded");
            return Ok(());
        };

        let tokens_before = self.context.estimated_tokens();
        let _ = events.send(AgentEvent::CompactionStart {
            tokens_before,
            through_seq: boundary,
        });

        let folded: Vec<ContextEntry> = self
            .context
            .snapshot()
            .into_iter()
            .filter(|e| e.seq <= boundary)
            .collect();

        let summary = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            summary = self.provider.summarize(&folded) => Some(summary),
        };

        match summary {
            Some(Ok(summary)) => {
                let tokens = EntryKind::system(summary.as_str()).estimate_tokens();
                self.context.checkpoint(summary, tokens, boundary).await?;
                tracing::info!(
                    through_seq = boundary,
                    tokens_before,
                    tokens_after = self.context.estimated_tokens(),
                    "Compacted context"
                );
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Summary failed, continuing without compaction");
            }
            None => {}
        }

        let _ = events.send(AgentEvent::CompactionEnd {
            tokens_after: self.context.estimated_tokens(),
        });
        Ok(())
    }

    async fn append_tool_result(&mut self, record: ToolResultRecord) -> SoulResult<u64> {
        let payload = truncate_payload(record.payload, self.context.max_tokens());
        self.context
            .append(EntryKind::tool_result(
                record.call_id,
                record.tool_name,
                record.status,
                payload,
            ))
            .await
    }

    /// Close tool calls left unanswered by a crash.
    ///
    /// Each pending call gets a `Cancelled` result reading `interrupted`. The
    /// tools are not run again. Returns how many calls were closed.
    pub async fn resume(&mut self) -> SoulResult<usize> {
        let pending = self.context.pending_tool_calls();
        for call in &pending {
            self.context
                .append(EntryKind::tool_result(
                    call.id.clone(),
                    call.name.clone(),
                    ToolStatus::Cancelled,
                    "interrupted",
                ))
                .await?;
        }
        if !pending.is_empty() {
            tracing::info!(closed = pending.len(), "Closed tool calls from interrupted turn");
        }
        self.state = LoopState::Idle;
        Ok(pending.len())
    }
}

/// Call ids must be unique within a reply
fn check_call_ids(reply: &ModelReply) -> SoulResult<()> {
    let mut seen = HashSet::new();
    for call in &reply.tool_calls {
        if !seen.insert(call.id.as_str()) {
            return Err(SoulError::FatalTurn {
                attempts: 1,
                reason: format!("model repeated tool call id {}", call.id),
            });
        }
    }
    Ok(())
}

/// Cut a tool payload so its entry fits under `max_tokens`
fn truncate_payload(payload: String, max_tokens: usize) -> String {
    let budget = max_tokens.saturating_sub(ENTRY_OVERHEAD_TOKENS) * 4;
    if payload.len() <= budget {
        return payload;
    }
    if budget < TRUNCATION_MARKER.len() {
        return String::new();
    }

    let mut cut = budget - TRUNCATION_MARKER.len();
    while !payload.is_char_boundary(cut) {
        cut -= 1;
    }
    tracing::warn!(
        original_bytes = payload.len(),
        kept_bytes = cut,
        "Truncating oversized tool payload"
    );
    format!("{}{}", &payload[..cut], TRUNCATION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalGate;
    use crate::broker::BrokerConfig;
    use crate::provider::{ScriptStep, ScriptedProvider};
    use crate::tool::{Tool, ToolOutput, ToolRegistry};
    use async_trait::async_trait;
    use retry::RetryPolicy;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn capability(&self) -> Capability {
            Capability::read_only("echo", json!({"type": "object"}))
        }

        async fn invoke(
            &self,
            input: serde_json::Value,
            _progress: mpsc::UnboundedSender<String>,
        ) -> SoulResult<ToolOutput> {
            Ok(ToolOutput::success(
                input["text"].as_str().unwrap_or_default(),
            ))
        }
    }

    fn model() -> ModelInfo {
        ModelInfo::new("scripted", 10_000)
    }

    fn soul(provider: Arc<ScriptedProvider>, max_tokens: usize) -> Soul {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let broker = ToolBroker::new(
            Arc::new(registry),
            Arc::new(ApprovalGate::auto_approve()),
            BrokerConfig::default(),
        );
        let mut config = AgentConfig::default();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        };
        Soul::new(provider, broker, Context::new(max_tokens), config)
    }

    fn echo(id: &str, text: &str) -> ToolCallRequest {
        ToolCallRequest::new(id, "echo", json!({"text": text}))
    }

    fn collect(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn plain_answer_completes_turn() {
        let provider = Arc::new(ScriptedProvider::replies(
            model(),
            [ModelReply::text("hello there")],
        ));
        let mut soul = soul(provider, 10_000);
        let (tx, rx) = mpsc::unbounded_channel();

        let outcome = soul
            .run_turn("hi", tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Completed {
                text: "hello there".into(),
                steps: 1
            }
        );
        assert_eq!(soul.state(), LoopState::Done);
        assert_eq!(soul.context().len(), 2);

        let events = collect(rx);
        assert!(events.contains(&AgentEvent::AssistantTextDelta {
            text: "hello there".into()
        }));
        assert_eq!(events.last(), Some(&AgentEvent::TurnDone { steps: 1 }));
    }

    #[tokio::test]
    async fn thinking_follows_provider_model() {
        let reasoned = || ModelReply::text("42").with_reasoning("six times seven");
        let reasoning_events = |rx| {
            collect(rx)
                .into_iter()
                .filter(|e| matches!(e, AgentEvent::ReasoningDelta { .. }))
                .count()
        };

        let mut thinker = model();
        thinker.supports_thinking = true;
        let mut soul_a = soul(Arc::new(ScriptedProvider::replies(thinker, [reasoned()])), 10_000);
        soul_a.config.thinking = true;
        let (tx, rx) = mpsc::unbounded_channel();
        soul_a.run_turn("q", tx, CancellationToken::new()).await.unwrap();
        assert_eq!(reasoning_events(rx), 1);

        // Requested but unsupported by the provider's model
        let mut soul_b = soul(Arc::new(ScriptedProvider::replies(model(), [reasoned()])), 10_000);
        soul_b.config.thinking = true;
        let (tx, rx) = mpsc::unbounded_channel();
        soul_b.run_turn("q", tx, CancellationToken::new()).await.unwrap();
        assert_eq!(reasoning_events(rx), 0);
    }

    #[tokio::test]
    async fn tool_round_trip() {
        let provider = Arc::new(ScriptedProvider::replies(
            model(),
            [
                ModelReply::with_calls("", vec![echo("c1", "one"), echo("c2", "two")]),
                ModelReply::text("done"),
            ],
        ));
        let mut soul = soul(provider.clone(), 10_000);
        let (tx, _rx) = mpsc::unbounded_channel();

        soul.run_turn("go", tx, CancellationToken::new())
            .await
            .unwrap();

        let kinds: Vec<&EntryKind> = soul.context().entries().iter().map(|e| &e.kind).collect();
        assert_eq!(kinds.len(), 5);
        assert_eq!(
            kinds[2],
            &EntryKind::tool_result("c1", "echo", ToolStatus::Ok, "one")
        );
        assert_eq!(
            kinds[3],
            &EntryKind::tool_result("c2", "echo", ToolStatus::Ok, "two")
        );
        // Second model call saw the results
        assert_eq!(provider.requests()[1].len(), 4);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let provider = Arc::new(ScriptedProvider::new(
            model(),
            [
                ScriptStep::Fail(SoulError::ModelTimeout),
                ScriptStep::Fail(SoulError::RateLimited {
                    retry_after_ms: Some(2),
                }),
                ScriptStep::Reply(ModelReply::text("finally")),
            ],
        ));
        let mut soul = soul(provider, 10_000);
        let (tx, rx) = mpsc::unbounded_channel();

        let outcome = soul
            .run_turn("hi", tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(soul.context().len(), 2);

        let retries: Vec<(u32, u64)> = collect(rx)
            .into_iter()
            .filter_map(|e| match e {
                AgentEvent::Retrying {
                    attempt, delay_ms, ..
                } => Some((attempt, delay_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![(1, 1), (2, 2)]);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_turn() {
        let provider = Arc::new(ScriptedProvider::new(
            model(),
            (0..3).map(|_| ScriptStep::Fail(SoulError::Provider("reset".into()))),
        ));
        let mut soul = soul(provider.clone(), 10_000);
        let (tx, rx) = mpsc::unbounded_channel();

        let err = soul
            .run_turn("hi", tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SoulError::FatalTurn { attempts: 3, .. }));
        assert_eq!(soul.state(), LoopState::Idle);
        assert_eq!(provider.request_count(), 3);
        // Only the user entry was committed
        assert_eq!(soul.context().len(), 1);
        assert!(matches!(
            collect(rx).last(),
            Some(AgentEvent::TurnFailed { .. })
        ));
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(
            model(),
            [ScriptStep::Fail(SoulError::ModelFatal("bad request".into()))],
        ));
        let mut soul = soul(provider.clone(), 10_000);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = soul
            .run_turn("hi", tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SoulError::FatalTurn { attempts: 1, .. }));
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test]
    async fn repeated_call_ids_are_fatal() {
        let provider = Arc::new(ScriptedProvider::replies(
            model(),
            [ModelReply::with_calls(
                "",
                vec![echo("dup", "a"), echo("dup", "b")],
            )],
        ));
        let mut soul = soul(provider, 10_000);
        let (tx, _rx) = mpsc::unbounded_channel();

        let err = soul
            .run_turn("hi", tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SoulError::FatalTurn { .. }));
        assert!(soul.context().pending_tool_calls().is_empty());
        assert_eq!(soul.context().len(), 1);
    }

    #[tokio::test]
    async fn step_limit_stops_loop() {
        let provider = Arc::new(ScriptedProvider::replies(
            model(),
            (0..5).map(|i| ModelReply::with_calls("", vec![echo(&format!("c{i}"), "x")])),
        ));
        let mut soul = soul(provider, 10_000);
        soul.config.max_steps = 2;
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = soul
            .run_turn("loop", tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::StepLimit { steps: 2 });
        assert_eq!(soul.state(), LoopState::Idle);
        assert!(soul.context().pending_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn cancel_during_model_call() {
        let provider = Arc::new(ScriptedProvider::new(model(), [ScriptStep::Stall]));
        let mut soul = soul(provider, 10_000);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outcome = soul.run_turn("hi", tx, cancel).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(soul.state(), LoopState::Idle);
        assert_eq!(soul.context().len(), 1);
        assert_eq!(
            collect(rx).last(),
            Some(&AgentEvent::TurnFailed {
                reason: "cancelled".into()
            })
        );
    }

    #[tokio::test]
    async fn pending_calls_block_new_turn_until_resume() {
        let provider = Arc::new(ScriptedProvider::replies(
            model(),
            [ModelReply::text("back again")],
        ));
        let mut soul = soul(provider, 10_000);
        soul.context.append(EntryKind::user("before crash")).await.unwrap();
        soul.context
            .append(EntryKind::assistant_with_calls("", vec![echo("c1", "x")]))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = soul
            .run_turn("hi", tx.clone(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SoulError::InvariantViolation(_)));

        assert_eq!(soul.resume().await.unwrap(), 1);
        let last = soul.context().entries().last().unwrap();
        assert_eq!(
            last.kind,
            EntryKind::tool_result("c1", "echo", ToolStatus::Cancelled, "interrupted")
        );

        soul.run_turn("hi", tx, CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn compaction_runs_before_model_call() {
        let provider = Arc::new(
            ScriptedProvider::replies(model(), [ModelReply::text("ok")])
                .with_summaries(["short summary".to_string()]),
        );
        let mut soul = soul(provider.clone(), 200);
        soul.config.compaction.preserve_recent = 1;
        for i in 0..6 {
            let kind = if i % 2 == 0 {
                EntryKind::user("u".repeat(100))
            } else {
                EntryKind::assistant("a".repeat(100))
            };
            soul.context.append(kind).await.unwrap();
        }
        let (tx, rx) = mpsc::unbounded_channel();

        soul.run_turn("next", tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(soul.context().checkpoints().len(), 1);
        assert_eq!(soul.context().checkpoints()[0].seq, 6);
        let seen = &provider.requests()[0];
        assert_eq!(seen[0].kind, EntryKind::system("short summary"));
        assert_eq!(seen[1].kind, EntryKind::user("next"));

        let events = collect(rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::CompactionStart { through_seq: 6, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::CompactionEnd { .. })));
    }

    #[tokio::test]
    async fn failed_summary_skips_compaction() {
        let provider = Arc::new(ScriptedProvider::replies(
            model(),
            [ModelReply::text("ok")],
        ));
        let mut soul = soul(provider, 200);
        soul.config.compaction.preserve_recent = 1;
        for _ in 0..3 {
            soul.context.append(EntryKind::user("u".repeat(200))).await.unwrap();
        }
        let (tx, _rx) = mpsc::unbounded_channel();

        let outcome = soul
            .run_turn("next", tx, CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert!(soul.context().checkpoints().is_empty());
    }

    #[test]
    fn truncation_fits_ceiling() {
        let payload = "é".repeat(500);
        let cut = truncate_payload(payload, 50);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        assert!(EntryKind::tool_result("c", "t", ToolStatus::Ok, cut.as_str()).estimate_tokens() <= 50);

        assert_eq!(truncate_payload("small".into(), 50), "small");
    }
}
