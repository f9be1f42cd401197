use chrono::Utc;
use tokio::sync::mpsc;

use crate::error::SoulResult;
use crate::types::*;

/// Instruction appended to the folded prefix when asking for a summary
pub const SUMMARY_INSTRUCTION: &str = "Summarize the conversation so far. Keep decisions, \
open tasks, file paths and tool findings that later steps depend on. Reply with the summary only.";

/// One completed model reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_calls(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            text: text.into(),
            reasoning: None,
            tool_calls,
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Context entry recording this reply
    pub fn into_entry(self) -> EntryKind {
        EntryKind::Assistant {
            text: self.text,
            reasoning: self.reasoning,
            tool_calls: self.tool_calls,
        }
    }
}

/// Model capability. Abstracts the LLM behind a single request/reply call.
///
/// Errors classified as transient by [`SoulError::is_transient`](crate::error::SoulError::is_transient)
/// are retried by the loop; anything else ends the turn.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn model(&self) -> &ModelInfo;

    /// Send a snapshot and stream deltas through `delta_tx` until the reply completes
    async fn send(
        &self,
        snapshot: &[ContextEntry],
        capabilities: &[Capability],
        thinking: bool,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> SoulResult<ModelReply>;

    /// Summarize a folded prefix of the context.
    ///
    /// The default sends the entries plus [`SUMMARY_INSTRUCTION`] with no tools.
    async fn summarize(&self, entries: &[ContextEntry]) -> SoulResult<String> {
        let mut request = entries.to_vec();
        let instruction = EntryKind::user(SUMMARY_INSTRUCTION);
        request.push(ContextEntry {
            seq: entries.last().map(|e| e.seq + 1).unwrap_or(1),
            timestamp: Utc::now(),
            tokens: instruction.estimate_tokens(),
            kind: instruction,
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let reply = self.send(&request, &[], false, tx).await?;
        while rx.try_recv().is_ok() {}
        Ok(reply.text)
    }
}
