//! Compaction trigger and boundary policy.
//!
//! Producing the summary is the model's job; this module only decides when a
//! checkpoint is due and how far it may reach without breaking a tool-call /
//! tool-result pair or touching the most recent entries.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::Context;
use crate::types::{ContextEntry, EntryKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Fraction of the ceiling at which compaction triggers
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Newest entries that are never folded
    #[serde(default = "default_preserve_recent")]
    pub preserve_recent: usize,
}

fn default_threshold() -> f64 {
    0.75
}

fn default_preserve_recent() -> usize {
    4
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            preserve_recent: default_preserve_recent(),
        }
    }
}

/// Whether the context has reached its high-water mark
pub fn needs_compaction(ctx: &Context, config: &CompactionConfig) -> bool {
    let trigger = ctx.max_tokens() as f64 * config.threshold;
    ctx.estimated_tokens() as f64 >= trigger
}

/// Highest seq that can be folded into a checkpoint, if any.
pub fn compaction_boundary(ctx: &Context, preserve_recent: usize) -> Option<u64> {
    let entries = ctx.entries();
    let foldable = entries.len().checked_sub(preserve_recent)?;

    entries[..foldable]
        .iter()
        .rev()
        .map(|e| e.seq)
        .find(|&seq| !splits_tool_pair(entries, seq))
}

/// True when folding through `through_seq` would leave a tool call on one side
/// of the boundary without its result on the same side.
pub fn splits_tool_pair(entries: &[ContextEntry], through_seq: u64) -> bool {
    let mut calls: HashSet<&str> = HashSet::new();
    let mut answered: HashSet<&str> = HashSet::new();

    for entry in entries.iter().take_while(|e| e.seq <= through_seq) {
        match &entry.kind {
            EntryKind::Assistant { tool_calls, .. } => {
                calls.extend(tool_calls.iter().map(|c| c.id.as_str()));
            }
            EntryKind::ToolResult { call_id, .. } => {
                answered.insert(call_id.as_str());
            }
            _ => {}
        }
    }

    calls.iter().any(|id| !answered.contains(id))
}
