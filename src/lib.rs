//! # soul-runtime
//!
//! Async execution runtime for a conversational coding agent: a step loop that
//! alternates model calls and tool batches over a token-bounded, durably
//! journaled context.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use soul_runtime::agent::Soul;
//! use soul_runtime::approval::ApprovalGate;
//! use soul_runtime::broker::{BrokerConfig, ToolBroker};
//! use soul_runtime::provider::{ModelReply, ScriptedProvider};
//! use soul_runtime::session::SessionStore;
//! use soul_runtime::tool::ToolRegistry;
//! use soul_runtime::{AgentConfig, ModelInfo};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> soul_runtime::error::SoulResult<()> {
//! let model = ModelInfo::new("offline", 8_000);
//! let provider = Arc::new(ScriptedProvider::replies(model.clone(), [ModelReply::text("hi")]));
//!
//! let store = SessionStore::new("/tmp/soul");
//! let session = store.open(".").await?;
//! let context = store.load_context(&session, model.context_window).await?;
//!
//! let broker = ToolBroker::new(
//!     Arc::new(ToolRegistry::new()),
//!     Arc::new(ApprovalGate::auto_approve()),
//!     BrokerConfig::default(),
//! );
//! let mut soul = Soul::new(provider, broker, context, AgentConfig::default());
//!
//! let (events, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         println!("{event:?}");
//!     }
//! });
//! soul.run_turn("hello", events, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`types`] | Context entries, checkpoints, capabilities, events, `AgentConfig` |
//! | [`context`] | Append-only token-bounded log with checkpoints; compaction policy |
//! | [`approval`] | Approval gate: policies, session approvals, static rules |
//! | [`tool`] | Async tool trait and registry |
//! | [`broker`] | Tool execution: approval, timeout, cancellation, progress, bounded concurrency |
//! | [`provider`] | Model capability trait and a scripted provider |
//! | [`agent`] | The step loop (`Soul`) and its retry policy |
//! | [`session`] | Work-dir sessions, JSONL journal, single-writer lock, crash replay |
//! | [`config`] | TOML runtime configuration |
//! | [`error`] | Error types with thiserror and transient classification |
//!
//! ## Durability
//!
//! Every context append and checkpoint is written to the session journal and
//! synced before it becomes visible in memory. After a crash the journal is
//! replayed into an identical context; a torn last line is dropped. Tool calls
//! left unanswered by the crash are closed by [`agent::Soul::resume`] rather
//! than re-run.

pub mod agent;
pub mod approval;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod provider;
pub mod session;
pub mod tool;
pub mod types;

pub use error::{SoulError, SoulResult};
pub use types::*;
