//! File-backed conversation store with delta compaction.
//!
//! Layout per conversation:
//!
//! ```text
//! <directory>/<conversation_id>/base.json     full snapshot
//! <directory>/<conversation_id>/deltas.jsonl  one {"timestamp", "diff"} per line
//! ```
//!
//! The first save writes the base. Later saves append the [`MemoryDiff`]
//! against the reconstructed state, and nothing at all when the memory is
//! unchanged. Once the number of replayed diffs reaches the compaction
//! threshold, the current state becomes the new base and the log is
//! dropped. Compaction runs on both reads and writes.

use super::diff::MemoryDiff;
use super::error::{Result, StorageError};
use super::ConversationStore;
use crate::core::{KeyedGate, Memory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

pub const DEFAULT_COMPACTION_THRESHOLD: usize = 50;

const BASE_FILE: &str = "base.json";
const BASE_TEMP_FILE: &str = "base.json.tmp";
const DELTA_FILE: &str = "deltas.jsonl";

/// Settings for [`DeltaConversationStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaStoreConfig {
    /// Root directory holding one subdirectory per conversation.
    pub directory: PathBuf,
    /// Number of replayed diffs that triggers compaction. Minimum 1.
    pub compaction_threshold: usize,
}

impl Default for DeltaStoreConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("conversations"),
            compaction_threshold: DEFAULT_COMPACTION_THRESHOLD,
        }
    }
}

impl DeltaStoreConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Self::default()
        }
    }

    pub fn with_compaction_threshold(mut self, threshold: usize) -> Self {
        self.compaction_threshold = threshold.max(1);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaEntry {
    timestamp: DateTime<Utc>,
    diff: MemoryDiff,
}

/// State rebuilt from disk.
struct Snapshot {
    memory: Memory,
    applied: usize,
}

struct ConversationPaths {
    dir: PathBuf,
    base: PathBuf,
    base_temp: PathBuf,
    deltas: PathBuf,
}

/// Conversation memory persisted as a base snapshot plus a diff log.
///
/// Operations on the same conversation are serialized inside this process.
/// The store does not coordinate between processes; the orchestrator's
/// conversation lock does that.
#[derive(Debug)]
pub struct DeltaConversationStore {
    config: DeltaStoreConfig,
    gate: KeyedGate,
}

impl DeltaConversationStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_config(DeltaStoreConfig::new(directory))
    }

    pub fn with_config(mut config: DeltaStoreConfig) -> Self {
        config.compaction_threshold = config.compaction_threshold.max(1);
        Self {
            config,
            gate: KeyedGate::default(),
        }
    }

    pub fn config(&self) -> &DeltaStoreConfig {
        &self.config
    }

    /// Folds the log into a fresh base. Returns false if the conversation
    /// does not exist.
    pub async fn compact(&self, conversation_id: &str) -> Result<bool> {
        let paths = self.paths(conversation_id)?;
        let _pass = self.gate.enter(conversation_id).await;

        match load(&paths).await? {
            Some(snapshot) => {
                rebase(&paths, &snapshot.memory).await?;
                info!(
                    "Compacted conversation {} ({} deltas folded)",
                    conversation_id, snapshot.applied
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of diffs currently in the log of a conversation.
    pub async fn delta_count(&self, conversation_id: &str) -> Result<usize> {
        let paths = self.paths(conversation_id)?;
        Ok(read_entries(&paths.deltas).await?.map_or(0, |entries| entries.len()))
    }

    fn paths(&self, conversation_id: &str) -> Result<ConversationPaths> {
        validate_id(conversation_id)?;
        let dir = self.config.directory.join(conversation_id);
        Ok(ConversationPaths {
            base: dir.join(BASE_FILE),
            base_temp: dir.join(BASE_TEMP_FILE),
            deltas: dir.join(DELTA_FILE),
            dir,
        })
    }
}

fn validate_id(conversation_id: &str) -> Result<()> {
    let reason = if conversation_id.is_empty() {
        Some("conversation id is empty")
    } else if conversation_id.contains(['/', '\\']) {
        Some("conversation id contains a path separator")
    } else if conversation_id.contains("..") || conversation_id == "." {
        Some("conversation id contains a relative path component")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(StorageError::invalid_key(conversation_id, reason)),
        None => Ok(()),
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_entries(path: &Path) -> Result<Option<Vec<DeltaEntry>>> {
    let Some(contents) = read_optional(path).await? else {
        return Ok(None);
    };
    let mut entries = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(line).map_err(|e| {
            StorageError::corrupted(path, format!("line {}: {}", index + 1, e))
        })?;
        entries.push(entry);
    }
    Ok(Some(entries))
}

/// Replays base plus log. `None` if the conversation was never saved.
async fn load(paths: &ConversationPaths) -> Result<Option<Snapshot>> {
    let base = read_optional(&paths.base).await?;
    let entries = read_entries(&paths.deltas).await?;

    let mut memory: Memory = match (base, &entries) {
        (Some(base), _) => serde_json::from_str(&base)
            .map_err(|e| StorageError::corrupted(&paths.base, e.to_string()))?,
        (None, Some(_)) => {
            return Err(StorageError::corrupted(
                &paths.deltas,
                "delta log exists without a base snapshot",
            ))
        }
        (None, None) => return Ok(None),
    };

    let entries = entries.unwrap_or_default();
    for entry in &entries {
        entry.diff.apply(&mut memory);
    }
    Ok(Some(Snapshot {
        memory,
        applied: entries.len(),
    }))
}

/// Writes `memory` as the new base, then drops the log.
///
/// A crash between the two steps leaves a log whose replay over the new
/// base yields the same state.
async fn rebase(paths: &ConversationPaths, memory: &Memory) -> Result<()> {
    fs::create_dir_all(&paths.dir).await?;
    let bytes = serde_json::to_vec(memory)?;
    fs::write(&paths.base_temp, bytes).await?;
    fs::rename(&paths.base_temp, &paths.base).await?;

    match fs::remove_file(&paths.deltas).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn append(paths: &ConversationPaths, diff: MemoryDiff) -> Result<()> {
    let entry = DeltaEntry {
        timestamp: Utc::now(),
        diff,
    };
    let mut line = serde_json::to_vec(&entry)?;
    line.push(b'\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&paths.deltas)
        .await?;
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl ConversationStore for DeltaConversationStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Memory>> {
        let paths = self.paths(conversation_id)?;
        let _pass = self.gate.enter(conversation_id).await;

        let Some(snapshot) = load(&paths).await? else {
            return Ok(None);
        };
        if snapshot.applied >= self.config.compaction_threshold {
            debug!("Compacting conversation {} on read", conversation_id);
            rebase(&paths, &snapshot.memory).await?;
        }
        Ok(Some(snapshot.memory))
    }

    async fn set(&self, conversation_id: &str, memory: &Memory) -> Result<()> {
        let paths = self.paths(conversation_id)?;
        let _pass = self.gate.enter(conversation_id).await;

        let Some(snapshot) = load(&paths).await? else {
            return rebase(&paths, memory).await;
        };

        let diff = MemoryDiff::between(&snapshot.memory, memory);
        let mut applied = snapshot.applied;
        if !diff.is_empty() {
            append(&paths, diff).await?;
            applied += 1;
        }
        if applied >= self.config.compaction_threshold {
            debug!("Compacting conversation {} on write", conversation_id);
            rebase(&paths, memory).await?;
        }
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<()> {
        let paths = self.paths(conversation_id)?;
        let _pass = self.gate.enter(conversation_id).await;

        match fs::remove_dir_all(&paths.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}
