use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::retry::RetryPolicy;
use crate::context::compaction::CompactionConfig;

// ─── Context Entries ────────────────────────────────────────────────────────

/// Per-entry framing overhead added on top of the content estimate
pub const ENTRY_OVERHEAD_TOKENS: usize = 4;

/// Rough token estimate for a piece of text (4 chars ≈ 1 token, rounded up)
pub fn estimate_text_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique within the originating assistant entry
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Outcome classification of a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    Denied,
    Cancelled,
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolStatus::Ok => write!(f, "ok"),
            ToolStatus::Error => write!(f, "error"),
            ToolStatus::Denied => write!(f, "denied"),
            ToolStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The payload of a context entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    System {
        text: String,
    },
    User {
        text: String,
    },
    Assistant {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(default)]
        tool_calls: Vec<ToolCallRequest>,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        status: ToolStatus,
        payload: String,
    },
}

impl EntryKind {
    pub fn system(text: impl Into<String>) -> Self {
        EntryKind::System { text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        EntryKind::User { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        EntryKind::Assistant {
            text: text.into(),
            reasoning: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn assistant_with_calls(text: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        EntryKind::Assistant {
            text: text.into(),
            reasoning: None,
            tool_calls,
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        status: ToolStatus,
        payload: impl Into<String>,
    ) -> Self {
        EntryKind::ToolResult {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            status,
            payload: payload.into(),
        }
    }

    /// Estimate token count for this entry, framing overhead included
    pub fn estimate_tokens(&self) -> usize {
        let content = match self {
            EntryKind::System { text } | EntryKind::User { text } => estimate_text_tokens(text),
            EntryKind::Assistant {
                text,
                reasoning,
                tool_calls,
            } => {
                let calls: usize = tool_calls
                    .iter()
                    .map(|c| estimate_text_tokens(&c.name) + estimate_text_tokens(&c.input.to_string()))
                    .sum();
                estimate_text_tokens(text)
                    + reasoning.as_deref().map(estimate_text_tokens).unwrap_or(0)
                    + calls
            }
            EntryKind::ToolResult { payload, .. } => estimate_text_tokens(payload),
        };
        content + ENTRY_OVERHEAD_TOKENS
    }

    /// Tool calls requested by this entry (empty unless it is an assistant entry)
    pub fn tool_calls(&self) -> &[ToolCallRequest] {
        match self {
            EntryKind::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// One committed entry of a context log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub tokens: usize,
    pub kind: EntryKind,
}

/// Compaction boundary: everything up to and including `seq` is folded into `summary`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: u64,
    /// Token count standing in for the whole folded prefix
    pub tokens_after: usize,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}

// ─── Capabilities ───────────────────────────────────────────────────────────

/// Declared contract of a registered tool. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub output_schema: serde_json::Value,
    #[serde(default)]
    pub mutates_state: bool,
    #[serde(default)]
    pub requires_approval: bool,
    /// JSON pointer into the call input naming the resource this tool mutates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_key: Option<String>,
}

impl Capability {
    /// A read-only capability that needs no approval
    pub fn read_only(name: impl Into<String>, input_schema: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema,
            output_schema: serde_json::json!({"type": "string"}),
            mutates_state: false,
            requires_approval: false,
            conflict_key: None,
        }
    }

    /// A state-mutating capability gated by approval
    pub fn mutating(name: impl Into<String>, input_schema: serde_json::Value) -> Self {
        Self {
            mutates_state: true,
            requires_approval: true,
            ..Self::read_only(name, input_schema)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_conflict_key(mut self, pointer: impl Into<String>) -> Self {
        self.conflict_key = Some(pointer.into());
        self
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    /// Serialization group for a call against this capability.
    ///
    /// Calls sharing a group run one at a time in request order; `None` means
    /// the call never conflicts.
    pub fn conflict_group(&self, input: &serde_json::Value) -> Option<String> {
        if !self.mutates_state {
            return None;
        }
        let resource = self
            .conflict_key
            .as_deref()
            .and_then(|pointer| input.pointer(pointer))
            .map(|value| match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        Some(match resource {
            Some(resource) => format!("resource:{resource}"),
            None => format!("tool:{}", self.name),
        })
    }
}

// ─── Model Info ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub context_window: usize,
    #[serde(default)]
    pub max_output_tokens: usize,
    #[serde(default)]
    pub supports_thinking: bool,
    #[serde(default = "default_true")]
    pub supports_tools: bool,
}

fn default_true() -> bool {
    true
}

impl ModelInfo {
    pub fn new(id: impl Into<String>, context_window: usize) -> Self {
        Self {
            id: id.into(),
            context_window,
            max_output_tokens: 0,
            supports_thinking: false,
            supports_tools: true,
        }
    }
}

// ─── Streaming Events ────────────────────────────────────────────────────────

/// Progress events produced for UI adapters. Finite per turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AssistantTextDelta {
        text: String,
    },
    ReasoningDelta {
        text: String,
    },
    ToolStarted {
        call_id: String,
        tool_name: String,
    },
    ToolProgress {
        call_id: String,
        chunk: String,
    },
    ToolFinished {
        call_id: String,
        tool_name: String,
        status: ToolStatus,
    },
    CompactionStart {
        tokens_before: usize,
        through_seq: u64,
    },
    CompactionEnd {
        tokens_after: usize,
    },
    Retrying {
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
    TurnDone {
        steps: usize,
    },
    TurnFailed {
        reason: String,
    },
}

/// Delta updates during a streamed model call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    TextDelta { text: String },
    ThinkingDelta { text: String },
}

// ─── Agent Configuration ─────────────────────────────────────────────────────

/// Configuration for one step loop.
///
/// Model capabilities come from the provider, not from here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Model round-trips allowed per turn
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub thinking: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub compaction: CompactionConfig,
}

pub(crate) fn default_max_steps() -> usize {
    100
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            thinking: false,
            retry: RetryPolicy::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Whether `model` should be asked to think on this loop
    pub fn thinking_enabled(&self, model: &ModelInfo) -> bool {
        self.thinking && model.supports_thinking
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_estimate_rounds_up() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        assert_eq!(estimate_text_tokens("abcd"), 1);
        assert_eq!(estimate_text_tokens("abcde"), 2);
    }

    #[test]
    fn entry_estimate_includes_overhead_and_calls() {
        let user = EntryKind::user("hello world!");
        assert_eq!(user.estimate_tokens(), 3 + ENTRY_OVERHEAD_TOKENS);

        let plain = EntryKind::assistant("ok");
        let with_call = EntryKind::assistant_with_calls(
            "ok",
            vec![ToolCallRequest::new("c1", "write_file", json!({"path": "/a"}))],
        );
        assert!(with_call.estimate_tokens() > plain.estimate_tokens());
    }

    #[test]
    fn entry_kind_serializes_tagged() {
        let kind = EntryKind::tool_result("c1", "bash", ToolStatus::Denied, "no");
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["status"], "denied");

        let back: EntryKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn assistant_without_calls_deserializes() {
        let kind: EntryKind =
            serde_json::from_value(json!({"type": "assistant", "text": "hi"})).unwrap();
        assert!(kind.tool_calls().is_empty());
    }

    #[test]
    fn conflict_group_uses_resource_pointer() {
        let cap = Capability::mutating("write_file", json!({"type": "object"}))
            .with_conflict_key("/path");
        assert_eq!(
            cap.conflict_group(&json!({"path": "/tmp/a"})),
            Some("resource:/tmp/a".to_string())
        );
        // Unresolvable pointer falls back to serializing the tool with itself
        assert_eq!(
            cap.conflict_group(&json!({"other": 1})),
            Some("tool:write_file".to_string())
        );
    }

    #[test]
    fn read_only_capability_never_conflicts() {
        let cap = Capability::read_only("read_file", json!({"type": "object"}))
            .with_conflict_key("/path");
        assert_eq!(cap.conflict_group(&json!({"path": "/tmp/a"})), None);
    }

    #[test]
    fn thinking_gated_by_model() {
        let mut model = ModelInfo::new("m", 1000);
        let mut config = AgentConfig::default();
        config.thinking = true;
        assert!(!config.thinking_enabled(&model));

        model.supports_thinking = true;
        assert!(config.thinking_enabled(&model));

        config.thinking = false;
        assert!(!config.thinking_enabled(&model));
    }

    #[test]
    fn agent_event_serializes() {
        let event = AgentEvent::ToolFinished {
            call_id: "c1".into(),
            tool_name: "bash".into(),
            status: ToolStatus::Cancelled,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("tool_finished"));
        assert!(json.contains("cancelled"));
    }
}
