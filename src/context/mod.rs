//! Append-only, token-bounded conversation log.
//!
//! A [`Context`] holds the live entries (those after the last checkpoint), the
//! checkpoints recorded so far, and a running token count that is updated on
//! every append instead of being re-scanned. When a journal is attached, each
//! record is flushed to disk before it becomes visible in memory.

pub mod compaction;

use std::collections::HashSet;

use chrono::Utc;

use crate::error::{SoulError, SoulResult};
use crate::session::log::{LogRecord, SessionLog};
use crate::types::*;

pub struct Context {
    entries: Vec<ContextEntry>,
    checkpoints: Vec<Checkpoint>,
    max_tokens: usize,
    tokens: usize,
    next_seq: u64,
    journal: Option<SessionLog>,
}

impl Context {
    /// In-memory context with a hard token ceiling
    pub fn new(max_tokens: usize) -> Self {
        Self {
            entries: Vec::new(),
            checkpoints: Vec::new(),
            max_tokens,
            tokens: 0,
            next_seq: 1,
            journal: None,
        }
    }

    /// Context whose appends are written ahead to `journal`
    pub fn with_journal(max_tokens: usize, journal: SessionLog) -> Self {
        let mut ctx = Self::new(max_tokens);
        ctx.journal = Some(journal);
        ctx
    }

    /// Rebuild in-memory state by folding journal records in commit order.
    pub fn replay(max_tokens: usize, records: Vec<LogRecord>) -> SoulResult<Self> {
        let mut ctx = Self::new(max_tokens);
        for record in records {
            match record {
                LogRecord::Entry(entry) => {
                    if entry.seq != ctx.next_seq {
                        return Err(SoulError::InvariantViolation(format!(
                            "replay expected seq {}, found {}",
                            ctx.next_seq, entry.seq
                        )));
                    }
                    ctx.next_seq += 1;
                    ctx.tokens += entry.tokens;
                    ctx.entries.push(entry);
                }
                LogRecord::Checkpoint(checkpoint) => ctx.apply_checkpoint(checkpoint),
            }
        }
        Ok(ctx)
    }

    pub fn attach_journal(&mut self, journal: SessionLog) {
        self.journal = Some(journal);
    }

    pub fn has_journal(&self) -> bool {
        self.journal.is_some()
    }

    /// Append an entry, returning its sequence id.
    ///
    /// Fails with `CapacityExceeded` when the entry alone exceeds the ceiling;
    /// compaction can never make room for it.
    pub async fn append(&mut self, kind: EntryKind) -> SoulResult<u64> {
        self.check_pairing(&kind)?;

        let tokens = kind.estimate_tokens();
        if tokens > self.max_tokens {
            return Err(SoulError::CapacityExceeded {
                entry_tokens: tokens,
                max_tokens: self.max_tokens,
            });
        }

        let entry = ContextEntry {
            seq: self.next_seq,
            timestamp: Utc::now(),
            tokens,
            kind,
        };

        if let Some(journal) = self.journal.as_mut() {
            journal.append(&LogRecord::Entry(entry.clone())).await?;
        }

        let seq = entry.seq;
        self.next_seq += 1;
        self.tokens += tokens;
        self.entries.push(entry);
        Ok(seq)
    }

    /// Fold every entry up to and including `through_seq` into `summary`.
    ///
    /// Folded entries leave the in-memory log and future snapshots; the
    /// journal keeps them.
    pub async fn checkpoint(
        &mut self,
        summary: impl Into<String>,
        tokens_after_summary: usize,
        through_seq: u64,
    ) -> SoulResult<()> {
        let first_live = self.entries.first().map(|e| e.seq);
        match first_live {
            Some(first) if through_seq >= first && through_seq <= self.last_seq() => {}
            _ => {
                return Err(SoulError::InvariantViolation(format!(
                    "checkpoint seq {through_seq} is outside the live range"
                )))
            }
        }
        if compaction::splits_tool_pair(&self.entries, through_seq) {
            return Err(SoulError::InvariantViolation(format!(
                "checkpoint at seq {through_seq} would split a tool call from its result"
            )));
        }

        let checkpoint = Checkpoint {
            seq: through_seq,
            tokens_after: tokens_after_summary,
            summary: summary.into(),
            timestamp: Utc::now(),
        };
        if let Some(journal) = self.journal.as_mut() {
            journal
                .append(&LogRecord::Checkpoint(checkpoint.clone()))
                .await?;
        }
        self.apply_checkpoint(checkpoint);
        Ok(())
    }

    fn apply_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.entries.retain(|e| e.seq > checkpoint.seq);
        let live: usize = self.entries.iter().map(|e| e.tokens).sum();
        self.tokens = checkpoint.tokens_after + live;
        self.checkpoints.push(checkpoint);
    }

    /// Ordered entries for rendering to the model.
    ///
    /// When a checkpoint exists its summary leads the snapshot as a system
    /// entry carrying the checkpoint's seq.
    pub fn snapshot(&self) -> Vec<ContextEntry> {
        let mut snapshot = Vec::with_capacity(self.entries.len() + 1);
        if let Some(checkpoint) = self.checkpoints.last() {
            snapshot.push(ContextEntry {
                seq: checkpoint.seq,
                timestamp: checkpoint.timestamp,
                tokens: checkpoint.tokens_after,
                kind: EntryKind::system(checkpoint.summary.clone()),
            });
        }
        snapshot.extend(self.entries.iter().cloned());
        snapshot
    }

    pub fn estimated_tokens(&self) -> usize {
        self.tokens
    }

    /// Token count summed from scratch
    pub fn recompute_tokens(&self) -> usize {
        let base = self.checkpoints.last().map(|c| c.tokens_after).unwrap_or(0);
        base + self.entries.iter().map(|e| e.tokens).sum::<usize>()
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Live entries (after the last checkpoint)
    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Sequence id of the most recent entry, 0 if nothing was ever appended
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Calls of the latest assistant entry that have no result yet
    pub fn pending_tool_calls(&self) -> Vec<ToolCallRequest> {
        let Some(pos) = self
            .entries
            .iter()
            .rposition(|e| matches!(e.kind, EntryKind::Assistant { .. }))
        else {
            return Vec::new();
        };

        let answered: HashSet<&str> = self.entries[pos + 1..]
            .iter()
            .filter_map(|e| match &e.kind {
                EntryKind::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();

        self.entries[pos]
            .kind
            .tool_calls()
            .iter()
            .filter(|c| !answered.contains(c.id.as_str()))
            .cloned()
            .collect()
    }

    fn check_pairing(&self, kind: &EntryKind) -> SoulResult<()> {
        let pending = self.pending_tool_calls();
        match kind {
            EntryKind::ToolResult { call_id, .. } => {
                if pending.iter().any(|c| &c.id == call_id) {
                    Ok(())
                } else {
                    Err(SoulError::InvariantViolation(format!(
                        "tool result {call_id} answers no pending tool call"
                    )))
                }
            }
            _ if !pending.is_empty() => Err(SoulError::InvariantViolation(format!(
                "{} tool call(s) still await results",
                pending.len()
            ))),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("entries", &self.entries)
            .field("checkpoints", &self.checkpoints)
            .field("max_tokens", &self.max_tokens)
            .field("tokens", &self.tokens)
            .field("next_seq", &self.next_seq)
            .field("journaled", &self.journal.is_some())
            .finish()
    }
}

/// Equality over logical state; the attached journal is not compared.
impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
            && self.checkpoints == other.checkpoints
            && self.max_tokens == other.max_tokens
            && self.tokens == other.tokens
            && self.next_seq == other.next_seq
    }
}
