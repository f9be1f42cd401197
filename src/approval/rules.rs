//! Static approval rules evaluated ahead of the approval policy.
//!
//! A rule names a tool by glob and may further constrain the call's input
//! through JSON pointer + glob pairs. The first matching rule in priority
//! order decides the call outright.

use serde::{Deserialize, Serialize};

use super::ApprovalDecision;
use crate::types::ToolCallRequest;

/// Matches one input value, addressed by JSON pointer, against a glob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentMatcher {
    pub path: String,
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleAction {
    Approve,
    Deny { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRule {
    pub tool_pattern: String,
    #[serde(default)]
    pub argument_patterns: Vec<ArgumentMatcher>,
    pub action: RuleAction,
    #[serde(default)]
    pub priority: i32,
}

impl ApprovalRule {
    pub fn approve(tool_pattern: impl Into<String>, priority: i32) -> Self {
        Self {
            tool_pattern: tool_pattern.into(),
            argument_patterns: Vec::new(),
            action: RuleAction::Approve,
            priority,
        }
    }

    pub fn deny(tool_pattern: impl Into<String>, reason: impl Into<String>, priority: i32) -> Self {
        Self {
            tool_pattern: tool_pattern.into(),
            argument_patterns: Vec::new(),
            action: RuleAction::Deny {
                reason: reason.into(),
            },
            priority,
        }
    }

    pub fn when_argument(mut self, path: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.argument_patterns.push(ArgumentMatcher {
            path: path.into(),
            pattern: pattern.into(),
        });
        self
    }

    fn matches(&self, request: &ToolCallRequest) -> bool {
        glob_match(&self.tool_pattern, &request.name)
            && self
                .argument_patterns
                .iter()
                .all(|m| match_argument(&request.input, &m.path, &m.pattern))
    }
}

/// Ordered rule list. Highest priority first; deny before approve on ties.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<ApprovalRule>,
}

impl RuleSet {
    pub fn new(rules: impl IntoIterator<Item = ApprovalRule>) -> Self {
        let mut set = Self::default();
        for rule in rules {
            set.add(rule);
        }
        set
    }

    pub fn add(&mut self, rule: ApprovalRule) -> &mut Self {
        self.rules.push(rule);
        self.rules.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| {
                let a_deny = matches!(a.action, RuleAction::Deny { .. });
                let b_deny = matches!(b.action, RuleAction::Deny { .. });
                b_deny.cmp(&a_deny)
            })
        });
        self
    }

    /// Decision of the first matching rule, if any
    pub fn evaluate(&self, request: &ToolCallRequest) -> Option<ApprovalDecision> {
        let rule = self.rules.iter().find(|r| r.matches(request))?;
        Some(match &rule.action {
            RuleAction::Approve => ApprovalDecision::Approve,
            RuleAction::Deny { reason } => ApprovalDecision::Deny {
                reason: reason.clone(),
            },
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Glob match over bytes: `*` is any run (possibly empty), `?` one byte.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` seen and the text index it is currently covering up to
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        match p.get(pi) {
            Some(b'*') => {
                star = Some((pi, ti));
                pi += 1;
            }
            Some(&c) if c == b'?' || c == t[ti] => {
                pi += 1;
                ti += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    pi = sp + 1;
                    ti = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }

    p[pi..].iter().all(|&c| c == b'*')
}

/// Glob match against the scalar found at `path` in `input`.
///
/// Arrays, objects and missing values never match.
pub fn match_argument(input: &serde_json::Value, path: &str, pattern: &str) -> bool {
    use serde_json::Value;

    match input.pointer(path) {
        Some(Value::String(s)) => glob_match(pattern, s),
        Some(Value::Number(n)) => glob_match(pattern, &n.to_string()),
        Some(Value::Bool(b)) => glob_match(pattern, &b.to_string()),
        Some(Value::Null) => glob_match(pattern, "null"),
        _ => false,
    }
}
