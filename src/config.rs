//! Runtime configuration, loaded from TOML.
//!
//! ```toml
//! max_steps = 50
//! thinking = true
//! session_dir = "/home/me/.soul"
//!
//! [model]
//! id = "claude-sonnet"
//! context_window = 200000
//! supports_thinking = true
//!
//! [context]
//! compaction_threshold = 0.8
//!
//! [broker]
//! tool_timeout_ms = 60000
//!
//! [approval]
//! mode = "auto"
//!
//! [[approval.rules]]
//! tool_pattern = "bash"
//! argument_patterns = [{ path = "/command", pattern = "rm *" }]
//! action = { type = "deny", reason = "no deletes" }
//! priority = 100
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::retry::RetryPolicy;
use crate::approval::rules::{ApprovalRule, RuleSet};
use crate::approval::{ApprovalGate, ApprovalPolicy, ApprovalPrompt};
use crate::broker::BrokerConfig;
use crate::context::compaction::CompactionConfig;
use crate::error::{SoulError, SoulResult};
use crate::session::SessionStore;
use crate::types::{default_max_steps, AgentConfig, ModelInfo};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub model: ModelInfo,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub approval: ApprovalSection,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub thinking: bool,
    /// Where sessions are stored; sessions are disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSection {
    /// Token ceiling; defaults to the model's context window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f64,
    #[serde(default = "default_preserve_recent")]
    pub preserve_recent: usize,
}

fn default_compaction_threshold() -> f64 {
    CompactionConfig::default().threshold
}

fn default_preserve_recent() -> usize {
    CompactionConfig::default().preserve_recent
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: None,
            compaction_threshold: default_compaction_threshold(),
            preserve_recent: default_preserve_recent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSection {
    #[serde(default = "default_tool_timeout_ms")]
    pub tool_timeout_ms: u64,
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
}

fn default_tool_timeout_ms() -> u64 {
    120_000
}

fn default_max_parallelism() -> usize {
    4
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            tool_timeout_ms: default_tool_timeout_ms(),
            max_parallelism: default_max_parallelism(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Approve every call ("yolo")
    Auto,
    /// Ask through an [`ApprovalPrompt`]
    #[default]
    Interactive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalSection {
    #[serde(default)]
    pub mode: ApprovalMode,
    #[serde(default)]
    pub rules: Vec<ApprovalRule>,
}

impl RuntimeConfig {
    pub fn new(model: ModelInfo) -> Self {
        Self {
            model,
            context: ContextSection::default(),
            broker: BrokerSection::default(),
            retry: RetryPolicy::default(),
            approval: ApprovalSection::default(),
            max_steps: default_max_steps(),
            thinking: false,
            session_dir: None,
        }
    }

    /// Parse and validate
    pub fn from_toml_str(content: &str) -> SoulResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> SoulResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SoulError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), model = %config.model.id, "Loaded runtime config");
        Ok(config)
    }

    pub fn validate(&self) -> SoulResult<()> {
        let threshold = self.context.compaction_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(SoulError::Config(format!(
                "context.compaction_threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.broker.max_parallelism == 0 {
            return Err(SoulError::Config(
                "broker.max_parallelism must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SoulError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.max_steps == 0 {
            return Err(SoulError::Config("max_steps must be at least 1".into()));
        }
        if self.context_max_tokens() == 0 {
            return Err(SoulError::Config("context ceiling must be positive".into()));
        }
        Ok(())
    }

    /// Token ceiling for a context
    pub fn context_max_tokens(&self) -> usize {
        self.context.max_tokens.unwrap_or(self.model.context_window)
    }

    /// Per-loop view of this config
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            max_steps: self.max_steps,
            thinking: self.thinking,
            retry: self.retry.clone(),
            compaction: CompactionConfig {
                threshold: self.context.compaction_threshold,
                preserve_recent: self.context.preserve_recent,
            },
        }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            timeout: Duration::from_millis(self.broker.tool_timeout_ms),
            max_parallelism: self.broker.max_parallelism,
        }
    }

    /// Build the approval gate. Interactive mode needs a prompt.
    pub fn build_gate(&self, prompt: Option<Arc<dyn ApprovalPrompt>>) -> SoulResult<ApprovalGate> {
        let policy = match (self.approval.mode, prompt) {
            (ApprovalMode::Auto, _) => ApprovalPolicy::AutoApprove,
            (ApprovalMode::Interactive, Some(prompt)) => ApprovalPolicy::Interactive(prompt),
            (ApprovalMode::Interactive, None) => {
                return Err(SoulError::Config(
                    "approval.mode = \"interactive\" requires an approval prompt".into(),
                ))
            }
        };
        let rules = RuleSet::new(self.approval.rules.iter().cloned());
        Ok(ApprovalGate::new(policy).with_rules(rules))
    }

    /// Session store rooted at `session_dir`, if configured
    pub fn session_store(&self) -> Option<SessionStore> {
        self.session_dir.as_ref().map(SessionStore::new)
    }
}
