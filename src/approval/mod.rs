//! Approval gate for effectful tool calls.
//!
//! The [`ApprovalGate`] consults, in order:
//! 1. the static [`RuleSet`](rules::RuleSet), whose first match decides;
//! 2. tools the user already approved for the rest of the session;
//! 3. the configured [`ApprovalPolicy`].

pub mod rules;

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::types::{Capability, ToolCallRequest};
use rules::RuleSet;

/// Outcome of an approval check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny { reason: String },
    /// Approve this call and every later call to the same tool
    ApproveForSession,
}

impl ApprovalDecision {
    pub fn is_approved(&self) -> bool {
        !matches!(self, ApprovalDecision::Deny { .. })
    }
}

/// Asks a human (or anything standing in for one) about a tool call.
///
/// Only the calling tool execution waits on the answer.
pub trait ApprovalPrompt: Send + Sync {
    fn ask<'a>(
        &'a self,
        request: &'a ToolCallRequest,
        capability: &'a Capability,
    ) -> Pin<Box<dyn Future<Output = ApprovalDecision> + Send + 'a>>;
}

pub enum ApprovalPolicy {
    /// Approve everything
    AutoApprove,
    /// Delegate to a prompt
    Interactive(Arc<dyn ApprovalPrompt>),
    /// Replay canned answers in order, denying once they run out
    Scripted(Mutex<VecDeque<ApprovalDecision>>),
}

impl ApprovalPolicy {
    pub fn scripted(decisions: impl IntoIterator<Item = ApprovalDecision>) -> Self {
        ApprovalPolicy::Scripted(Mutex::new(decisions.into_iter().collect()))
    }

    fn name(&self) -> &'static str {
        match self {
            ApprovalPolicy::AutoApprove => "auto",
            ApprovalPolicy::Interactive(_) => "interactive",
            ApprovalPolicy::Scripted(_) => "scripted",
        }
    }
}

impl std::fmt::Debug for ApprovalPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub struct ApprovalGate {
    policy: ApprovalPolicy,
    rules: RuleSet,
    session_approved: Mutex<HashSet<String>>,
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy) -> Self {
        Self {
            policy,
            rules: RuleSet::default(),
            session_approved: Mutex::new(HashSet::new()),
        }
    }

    pub fn auto_approve() -> Self {
        Self::new(ApprovalPolicy::AutoApprove)
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Whether `tool_name` was approved for the rest of the session
    pub fn is_session_approved(&self, tool_name: &str) -> bool {
        self.session_approved
            .lock()
            .map(|set| set.contains(tool_name))
            .unwrap_or(false)
    }

    /// Decide whether the call may run
    pub async fn decide(
        &self,
        capability: &Capability,
        request: &ToolCallRequest,
    ) -> ApprovalDecision {
        if let Some(decision) = self.rules.evaluate(request) {
            tracing::debug!(tool = %request.name, ?decision, "Approval rule matched");
            return decision;
        }

        if self.is_session_approved(&request.name) {
            return ApprovalDecision::Approve;
        }

        let decision = match &self.policy {
            ApprovalPolicy::AutoApprove => ApprovalDecision::Approve,
            ApprovalPolicy::Interactive(prompt) => prompt.ask(request, capability).await,
            ApprovalPolicy::Scripted(queue) => queue
                .lock()
                .ok()
                .and_then(|mut q| q.pop_front())
                .unwrap_or_else(|| ApprovalDecision::Deny {
                    reason: "no scripted approval left".into(),
                }),
        };

        if decision == ApprovalDecision::ApproveForSession {
            if let Ok(mut set) = self.session_approved.lock() {
                set.insert(request.name.clone());
            }
        }

        tracing::debug!(
            tool = %request.name,
            policy = self.policy.name(),
            ?decision,
            "Approval decided"
        );
        decision
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("policy", &self.policy)
            .field("rules", &self.rules.len())
            .finish()
    }
}
