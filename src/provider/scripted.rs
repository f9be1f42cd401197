//! Deterministic provider that replays a script of replies and failures.
//!
//! Useful for offline runs and for exercising the loop's retry, compaction
//! and cancellation paths.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::mpsc;

use super::{ModelReply, Provider};
use crate::error::{SoulError, SoulResult};
use crate::types::*;

/// One scripted response to `send`
#[derive(Debug)]
pub enum ScriptStep {
    Reply(ModelReply),
    Fail(SoulError),
    /// Never completes; only cancellation ends the call
    Stall,
}

pub struct ScriptedProvider {
    model: ModelInfo,
    steps: Mutex<VecDeque<ScriptStep>>,
    summaries: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<ContextEntry>>>,
}

impl ScriptedProvider {
    pub fn new(model: ModelInfo, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            model,
            steps: Mutex::new(steps.into_iter().collect()),
            summaries: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies only, in order
    pub fn replies(model: ModelInfo, replies: impl IntoIterator<Item = ModelReply>) -> Self {
        Self::new(model, replies.into_iter().map(ScriptStep::Reply))
    }

    pub fn with_summaries(self, summaries: impl IntoIterator<Item = String>) -> Self {
        if let Ok(mut queue) = self.summaries.lock() {
            queue.extend(summaries);
        }
        self
    }

    /// Snapshots received by `send`, one per call
    pub fn requests(&self) -> Vec<Vec<ContextEntry>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl Provider for ScriptedProvider {
    fn model(&self) -> &ModelInfo {
        &self.model
    }

    async fn send(
        &self,
        snapshot: &[ContextEntry],
        _capabilities: &[Capability],
        thinking: bool,
        delta_tx: mpsc::UnboundedSender<StreamDelta>,
    ) -> SoulResult<ModelReply> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(snapshot.to_vec());
        }
        let step = self.steps.lock().ok().and_then(|mut s| s.pop_front());

        match step {
            Some(ScriptStep::Reply(reply)) => {
                if thinking {
                    if let Some(reasoning) = &reply.reasoning {
                        let _ = delta_tx.send(StreamDelta::ThinkingDelta {
                            text: reasoning.clone(),
                        });
                    }
                }
                if !reply.text.is_empty() {
                    let _ = delta_tx.send(StreamDelta::TextDelta {
                        text: reply.text.clone(),
                    });
                }
                Ok(reply)
            }
            Some(ScriptStep::Fail(error)) => Err(error),
            Some(ScriptStep::Stall) => std::future::pending().await,
            None => Err(SoulError::ModelFatal("script exhausted".into())),
        }
    }

    async fn summarize(&self, _entries: &[ContextEntry]) -> SoulResult<String> {
        self.summaries
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .ok_or_else(|| SoulError::Provider("no scripted summary".into()))
    }
}
