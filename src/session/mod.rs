//! Durable sessions keyed by working directory.
//!
//! Layout under the store's base directory:
//!
//! ```text
//! metadata.json                       work dir → sessions index
//! sessions/<work-dir-hash>/<id>.jsonl one journal per session
//! ```
//!
//! `open` derives the session id from the canonical work dir, so repeated
//! opens resolve to the same journal. `create` starts an additional session
//! with a random id. The store never deletes sessions.

pub mod log;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::context::Context;
use crate::error::{SoulError, SoulResult};
use log::{LogRecord, SessionLog};

/// A session of a work directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Canonical path of the work directory
    pub work_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Journal holding this session's context
    pub history_file: PathBuf,
}

/// Listing row for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub history_file: PathBuf,
    pub entry_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionIndex {
    id: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkDirMeta {
    path: String,
    #[serde(default)]
    last_session_id: Option<String>,
    #[serde(default)]
    sessions: Vec<SessionIndex>,
}

impl WorkDirMeta {
    fn record(&mut self, id: &str, created_at: DateTime<Utc>) -> DateTime<Utc> {
        self.last_session_id = Some(id.to_string());
        match self.sessions.iter().find(|s| s.id == id) {
            Some(existing) => existing.created_at,
            None => {
                self.sessions.push(SessionIndex {
                    id: id.to_string(),
                    created_at,
                });
                created_at
            }
        }
    }

    fn created_at(&self, id: &str) -> Option<DateTime<Utc>> {
        self.sessions
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.created_at)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    #[serde(default)]
    work_dirs: Vec<WorkDirMeta>,
    #[serde(default)]
    session_to_workdir: HashMap<String, String>,
}

impl Metadata {
    fn work_dir(&self, path: &str) -> Option<&WorkDirMeta> {
        self.work_dirs.iter().find(|wd| wd.path == path)
    }

    fn work_dir_mut(&mut self, path: &str) -> &mut WorkDirMeta {
        let index = match self.work_dirs.iter().position(|wd| wd.path == path) {
            Some(index) => index,
            None => {
                self.work_dirs.push(WorkDirMeta {
                    path: path.to_string(),
                    last_session_id: None,
                    sessions: Vec::new(),
                });
                self.work_dirs.len() - 1
            }
        };
        &mut self.work_dirs[index]
    }
}

/// Hex digest naming a work directory's session folder
pub fn work_dir_hash(work_dir: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(work_dir.to_string_lossy().as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

/// Deterministic session id for a work directory (8-4-4-4-12 layout)
pub fn derive_session_id(work_dir: &Path) -> String {
    let hash = work_dir_hash(work_dir);
    format!(
        "{}-{}-{}-{}-{}",
        &hash[..8],
        &hash[8..12],
        &hash[12..16],
        &hash[16..20],
        &hash[20..32]
    )
}

/// Maps work directories to durable sessions
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn metadata_path(&self) -> PathBuf {
        self.base_dir.join("metadata.json")
    }

    fn sessions_dir(&self, work_dir: &Path) -> PathBuf {
        self.base_dir.join("sessions").join(work_dir_hash(work_dir))
    }

    fn history_path(&self, work_dir: &Path, session_id: &str) -> PathBuf {
        self.sessions_dir(work_dir).join(format!("{session_id}.jsonl"))
    }

    /// Open the deterministic session of a work directory, registering it on
    /// first use. Never truncates an existing journal.
    pub async fn open(&self, work_dir: impl AsRef<Path>) -> SoulResult<Session> {
        let work_dir = canonical(work_dir.as_ref()).await?;
        let key = work_dir.to_string_lossy().to_string();
        let id = derive_session_id(&work_dir);

        let mut metadata = self.load_metadata().await?;
        let created_at = metadata.work_dir_mut(&key).record(&id, Utc::now());
        metadata.session_to_workdir.insert(id.clone(), key);
        self.save_metadata(&metadata).await?;

        tracing::debug!(session_id = %id, work_dir = %work_dir.display(), "Opened session");
        Ok(Session {
            history_file: self.history_path(&work_dir, &id),
            id,
            work_dir,
            created_at,
        })
    }

    /// Start a fresh session with a random id.
    ///
    /// An explicit `history_file` that already exists is truncated.
    pub async fn create(
        &self,
        work_dir: impl AsRef<Path>,
        history_file: Option<PathBuf>,
    ) -> SoulResult<Session> {
        let work_dir = canonical(work_dir.as_ref()).await?;
        let key = work_dir.to_string_lossy().to_string();
        let id = Uuid::new_v4().to_string();

        let history_file = match history_file {
            Some(path) => {
                tracing::warn!(path = %path.display(), "Using provided history file");
                if path.is_dir() {
                    return Err(SoulError::Session(format!(
                        "history file is a directory: {}",
                        path.display()
                    )));
                }
                path
            }
            None => self.history_path(&work_dir, &id),
        };
        if let Some(parent) = history_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if history_file.exists() {
            tracing::warn!(
                path = %history_file.display(),
                "History file already exists, truncating"
            );
            tokio::fs::write(&history_file, b"").await?;
        }

        let mut metadata = self.load_metadata().await?;
        let created_at = metadata.work_dir_mut(&key).record(&id, Utc::now());
        metadata.session_to_workdir.insert(id.clone(), key);
        self.save_metadata(&metadata).await?;

        tracing::debug!(session_id = %id, work_dir = %work_dir.display(), "Created session");
        Ok(Session {
            id,
            work_dir,
            created_at,
            history_file,
        })
    }

    /// The session last used in a work directory, if any
    pub async fn continue_last(&self, work_dir: impl AsRef<Path>) -> SoulResult<Option<Session>> {
        let work_dir = canonical(work_dir.as_ref()).await?;
        let key = work_dir.to_string_lossy().to_string();

        let metadata = self.load_metadata().await?;
        let Some(meta) = metadata.work_dir(&key) else {
            tracing::debug!(work_dir = %key, "Work directory never used");
            return Ok(None);
        };
        let Some(id) = meta.last_session_id.clone() else {
            tracing::debug!(work_dir = %key, "Work directory never had a session");
            return Ok(None);
        };

        Ok(Some(Session {
            history_file: self.history_path(&work_dir, &id),
            created_at: meta.created_at(&id).unwrap_or_else(Utc::now),
            id,
            work_dir,
        }))
    }

    /// Find a session by id regardless of work directory.
    ///
    /// Falls back to scanning the session folders of known work directories
    /// when the id is missing from the index, and repairs the index on a hit.
    pub async fn load_by_id(&self, session_id: &str) -> SoulResult<Option<Session>> {
        let mut metadata = self.load_metadata().await?;

        if let Some(path) = metadata.session_to_workdir.get(session_id) {
            if let Some(meta) = metadata.work_dir(path) {
                let work_dir = PathBuf::from(&meta.path);
                let history_file = self.history_path(&work_dir, session_id);
                if history_file.exists() {
                    return Ok(Some(Session {
                        created_at: meta.created_at(session_id).unwrap_or_else(Utc::now),
                        id: session_id.to_string(),
                        work_dir,
                        history_file,
                    }));
                }
                tracing::debug!(
                    path = %history_file.display(),
                    "Session indexed but history file missing"
                );
            }
        }

        let found = metadata.work_dirs.iter().position(|wd| {
            self.history_path(Path::new(&wd.path), session_id)
                .exists()
        });
        let Some(index) = found else {
            return Ok(None);
        };

        let meta = &mut metadata.work_dirs[index];
        let key = meta.path.clone();
        let work_dir = PathBuf::from(&key);
        let history_file = self.history_path(&work_dir, session_id);
        let created_at = match meta.created_at(session_id) {
            Some(at) => at,
            None => {
                let at = Utc::now();
                meta.sessions.push(SessionIndex {
                    id: session_id.to_string(),
                    created_at: at,
                });
                at
            }
        };
        metadata
            .session_to_workdir
            .insert(session_id.to_string(), key);
        self.save_metadata(&metadata).await?;

        tracing::debug!(session_id, work_dir = %work_dir.display(), "Recovered session from disk");
        Ok(Some(Session {
            id: session_id.to_string(),
            work_dir,
            created_at,
            history_file,
        }))
    }

    /// Sessions known for a work directory, oldest first
    pub async fn list(&self, work_dir: impl AsRef<Path>) -> SoulResult<Vec<SessionInfo>> {
        let work_dir = canonical(work_dir.as_ref()).await?;
        let key = work_dir.to_string_lossy().to_string();

        let metadata = self.load_metadata().await?;
        let Some(meta) = metadata.work_dir(&key) else {
            return Ok(Vec::new());
        };

        let mut sessions = Vec::with_capacity(meta.sessions.len());
        for index in &meta.sessions {
            let history_file = self.history_path(&work_dir, &index.id);
            let entry_count = SessionLog::read_records(&history_file)
                .await?
                .iter()
                .filter(|r| matches!(r, LogRecord::Entry(_)))
                .count();
            sessions.push(SessionInfo {
                id: index.id.clone(),
                created_at: index.created_at,
                history_file,
                entry_count,
            });
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Lock the session's journal and replay it into a context that keeps
    /// journaling to the same file.
    pub async fn load_context(&self, session: &Session, max_tokens: usize) -> SoulResult<Context> {
        let (journal, records) = SessionLog::open(&session.history_file).await?;
        let record_count = records.len();
        let mut context = Context::replay(max_tokens, records)?;
        context.attach_journal(journal);

        tracing::info!(
            session_id = %session.id,
            records = record_count,
            live_entries = context.len(),
            tokens = context.estimated_tokens(),
            "Loaded session context"
        );
        Ok(context)
    }

    async fn load_metadata(&self) -> SoulResult<Metadata> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(Metadata::default());
        }
        let content = tokio::fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn save_metadata(&self, metadata: &Metadata) -> SoulResult<()> {
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let json = serde_json::to_string_pretty(metadata)?;
        let tmp = self.base_dir.join("metadata.json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, self.metadata_path()).await?;
        Ok(())
    }
}

async fn canonical(work_dir: &Path) -> SoulResult<PathBuf> {
    tokio::fs::canonicalize(work_dir).await.map_err(|e| {
        SoulError::Session(format!(
            "cannot resolve work directory {}: {e}",
            work_dir.display()
        ))
    })
}
