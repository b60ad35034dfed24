//! Persistence interfaces and implementations.
//!
//! - [`ConversationStore`]: chatflow memory keyed by conversation id
//! - [`RunStore`]: one [`RunRecord`] per workflow execution
//!
//! Backends:
//!
//! - [`DeltaConversationStore`]: file-backed, base snapshot plus a
//!   compacted diff log
//! - [`InMemoryConversationStore`] / [`InMemoryRunStore`]: `DashMap` based,
//!   for tests and single-process use
//!
//! # Example
//!
//! ```no_run
//! use cadence::storage::{ConversationStore, DeltaConversationStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = DeltaConversationStore::new("/var/lib/app/conversations");
//! let memory = store.get("conversation-42").await?.unwrap_or_default();
//! store.set("conversation-42", &memory).await?;
//! # Ok(())
//! # }
//! ```

use crate::core::Memory;
use async_trait::async_trait;
use std::sync::Arc;

mod delta;
mod diff;
mod error;
mod memory;
mod record;

pub use delta::{DeltaConversationStore, DeltaStoreConfig, DEFAULT_COMPACTION_THRESHOLD};
pub use diff::MemoryDiff;
pub use error::{Result, StorageError};
pub use memory::{InMemoryConversationStore, InMemoryRunStore};
pub use record::{ErrorRecord, RunFilter, RunRecord};

/// Storage for chatflow conversation memory.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Loads the memory of a conversation, `None` if it was never saved.
    async fn get(&self, conversation_id: &str) -> Result<Option<Memory>>;

    /// Replaces the memory of a conversation.
    async fn set(&self, conversation_id: &str, memory: &Memory) -> Result<()>;

    /// Forgets a conversation.
    ///
    /// # Default Implementation
    ///
    /// Returns `StorageError::Unsupported`.
    async fn delete(&self, conversation_id: &str) -> Result<()> {
        let _ = conversation_id;
        Err(StorageError::Unsupported(
            "delete not implemented for this conversation store".to_string(),
        ))
    }
}

/// Storage for workflow run records.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, record: &RunRecord) -> Result<()>;

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>>;

    /// Records matching `filter`, newest first.
    ///
    /// # Default Implementation
    ///
    /// Returns `StorageError::Unsupported`.
    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let _ = filter;
        Err(StorageError::Unsupported(
            "list not implemented for this run store".to_string(),
        ))
    }
}

#[async_trait]
impl<S: ConversationStore + ?Sized> ConversationStore for Arc<S> {
    async fn get(&self, conversation_id: &str) -> Result<Option<Memory>> {
        (**self).get(conversation_id).await
    }

    async fn set(&self, conversation_id: &str, memory: &Memory) -> Result<()> {
        (**self).set(conversation_id, memory).await
    }

    async fn delete(&self, conversation_id: &str) -> Result<()> {
        (**self).delete(conversation_id).await
    }
}

#[async_trait]
impl<S: RunStore + ?Sized> RunStore for Arc<S> {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        (**self).save(record).await
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        (**self).get(run_id).await
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        (**self).list(filter).await
    }
}
