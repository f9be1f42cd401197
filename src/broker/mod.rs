//! Tool execution broker.
//!
//! Resolves a call against the registry, runs it past the approval gate,
//! invokes it under a timeout and the turn's cancellation token, and forwards
//! progress as [`AgentEvent::ToolProgress`]. Every path ends in a
//! [`ToolResultRecord`]; nothing here returns an error to the loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalDecision, ApprovalGate};
use crate::tool::{Tool, ToolOutput, ToolRegistry};
use crate::types::{AgentEvent, EntryKind, ToolCallRequest, ToolStatus};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Per-call execution limit
    pub timeout: Duration,
    /// Calls allowed to run at once
    pub max_parallelism: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            max_parallelism: 4,
        }
    }
}

/// Result of one tool call, ready to be appended to the context
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultRecord {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    pub payload: String,
}

impl ToolResultRecord {
    fn new(request: &ToolCallRequest, status: ToolStatus, payload: impl Into<String>) -> Self {
        Self {
            call_id: request.id.clone(),
            tool_name: request.name.clone(),
            status,
            payload: payload.into(),
        }
    }

    pub fn into_entry(self) -> EntryKind {
        EntryKind::tool_result(self.call_id, self.tool_name, self.status, self.payload)
    }
}

#[derive(Clone)]
pub struct ToolBroker {
    registry: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    config: BrokerConfig,
    permits: Arc<Semaphore>,
}

impl ToolBroker {
    pub fn new(registry: Arc<ToolRegistry>, gate: Arc<ApprovalGate>, config: BrokerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_parallelism.max(1)));
        Self {
            registry,
            gate,
            config,
            permits,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Execute one call. Emits `ToolFinished` for every outcome.
    ///
    /// Approval is settled before a parallelism permit is taken, so a call
    /// waiting on a prompt never holds a slot another call could run in.
    pub async fn execute(
        &self,
        request: &ToolCallRequest,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> ToolResultRecord {
        let record = match self.authorize(request, cancel).await {
            Ok(tool) => {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = self.permits.acquire() => permit.ok(),
                };
                match permit {
                    Some(_permit) => self.invoke(request, tool, cancel, events).await,
                    None => ToolResultRecord::new(request, ToolStatus::Cancelled, "cancelled"),
                }
            }
            Err(record) => record,
        };

        tracing::debug!(
            call_id = %record.call_id,
            tool = %record.tool_name,
            status = %record.status,
            "Tool call finished"
        );
        let _ = events.send(AgentEvent::ToolFinished {
            call_id: record.call_id.clone(),
            tool_name: record.tool_name.clone(),
            status: record.status,
        });
        record
    }

    /// Resolve the tool and run the call past the approval gate.
    /// `Err` carries the final record for calls that must not run.
    async fn authorize(
        &self,
        request: &ToolCallRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Tool>, ToolResultRecord> {
        let Some((capability, tool)) = self.registry.get(&request.name) else {
            tracing::warn!(tool = %request.name, "Model called an unknown tool");
            return Err(ToolResultRecord::new(
                request,
                ToolStatus::Error,
                format!("unknown tool: {}", request.name),
            ));
        };

        if capability.requires_approval {
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ToolResultRecord::new(request, ToolStatus::Cancelled, "cancelled"));
                }
                decision = self.gate.decide(capability, request) => decision,
            };
            if let ApprovalDecision::Deny { reason } = decision {
                tracing::info!(tool = %request.name, %reason, "Tool call denied");
                return Err(ToolResultRecord::new(request, ToolStatus::Denied, reason));
            }
        }

        if cancel.is_cancelled() {
            return Err(ToolResultRecord::new(request, ToolStatus::Cancelled, "cancelled"));
        }
        Ok(tool)
    }

    async fn invoke(
        &self,
        request: &ToolCallRequest,
        tool: Arc<dyn Tool>,
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> ToolResultRecord {
        let _ = events.send(AgentEvent::ToolStarted {
            call_id: request.id.clone(),
            tool_name: request.name.clone(),
        });

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<String>();
        let forward = |chunk: String| {
            let _ = events.send(AgentEvent::ToolProgress {
                call_id: request.id.clone(),
                chunk,
            });
        };

        let outcome = {
            let invoke = tool.invoke(request.input.clone(), progress_tx);
            tokio::pin!(invoke);
            let deadline = tokio::time::sleep(self.config.timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Err("cancelled"),
                    result = &mut invoke => break Ok(result),
                    _ = &mut deadline => break Err("timeout"),
                    Some(chunk) = progress_rx.recv() => forward(chunk),
                }
            }
            // The invocation future is dropped here, cancelling the tool
        };

        while let Ok(chunk) = progress_rx.try_recv() {
            forward(chunk);
        }

        match outcome {
            Ok(Ok(ToolOutput { content, is_error })) => {
                let status = if is_error {
                    ToolStatus::Error
                } else {
                    ToolStatus::Ok
                };
                ToolResultRecord::new(request, status, content)
            }
            Ok(Err(e)) => ToolResultRecord::new(request, ToolStatus::Error, e.to_string()),
            Err(reason) => {
                tracing::warn!(tool = %request.name, call_id = %request.id, reason, "Tool call aborted");
                ToolResultRecord::new(request, ToolStatus::Cancelled, reason)
            }
        }
    }

    /// Start a batch concurrently. Results are read back in request order
    /// through [`BatchResults::next`], each as soon as it and every earlier
    /// call have finished.
    ///
    /// Calls that share a conflict group run one after another in request
    /// order, approval included. Everything else only waits for a free permit.
    pub fn spawn_batch(
        &self,
        requests: &[ToolCallRequest],
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> BatchResults {
        let mut group_tails: HashMap<String, oneshot::Receiver<()>> = HashMap::new();
        let mut pending = VecDeque::with_capacity(requests.len());

        for request in requests {
            let group = self
                .registry
                .capability(&request.name)
                .and_then(|cap| cap.conflict_group(&request.input));
            let (predecessor, done) = match group {
                Some(group) => {
                    let (tx, rx) = oneshot::channel();
                    (group_tails.insert(group, rx), Some(tx))
                }
                None => (None, None),
            };

            let broker = self.clone();
            let task_request = request.clone();
            let cancel = cancel.clone();
            let events = events.clone();
            let handle = tokio::spawn(async move {
                if let Some(predecessor) = predecessor {
                    // Err only means the predecessor's task is gone; go ahead
                    let _ = predecessor.await;
                }
                let record = broker.execute(&task_request, &cancel, &events).await;
                if let Some(done) = done {
                    let _ = done.send(());
                }
                record
            });
            pending.push_back((request.clone(), handle));
        }

        BatchResults {
            pending,
            events: events.clone(),
        }
    }

    /// Execute a batch and collect every result, in request order.
    pub async fn execute_batch(
        &self,
        requests: &[ToolCallRequest],
        cancel: &CancellationToken,
        events: &mpsc::UnboundedSender<AgentEvent>,
    ) -> Vec<ToolResultRecord> {
        let mut results = self.spawn_batch(requests, cancel, events);
        let mut records = Vec::with_capacity(requests.len());
        while let Some(record) = results.next().await {
            records.push(record);
        }
        records
    }
}

/// Results of a spawned batch, yielded in request order.
///
/// Dropping it leaves the remaining calls running to completion.
pub struct BatchResults {
    pending: VecDeque<(ToolCallRequest, JoinHandle<ToolResultRecord>)>,
    events: mpsc::UnboundedSender<AgentEvent>,
}

impl BatchResults {
    /// Next result in request order; `None` once the batch is drained
    pub async fn next(&mut self) -> Option<ToolResultRecord> {
        let (request, handle) = self.pending.pop_front()?;
        let record = match handle.await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(tool = %request.name, error = %e, "Tool task failed");
                let _ = self.events.send(AgentEvent::ToolFinished {
                    call_id: request.id.clone(),
                    tool_name: request.name.clone(),
                    status: ToolStatus::Error,
                });
                ToolResultRecord::new(&request, ToolStatus::Error, format!("tool task failed: {e}"))
            }
        };
        Some(record)
    }

    /// Calls not yet read back
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}
