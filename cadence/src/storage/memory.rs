use super::error::Result;
use super::record::{RunFilter, RunRecord};
use super::{ConversationStore, RunStore};
use crate::core::Memory;
use async_trait::async_trait;
use dashmap::DashMap;

/// In-memory run store using DashMap for concurrent access.
///
/// Suitable for tests and single-process deployments; nothing survives a
/// restart.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    records: DashMap<String, RunRecord>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, record: &RunRecord) -> Result<()> {
        self.records.insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.records.get(run_id).map(|entry| entry.value().clone()))
    }

    /// Matching records, newest first.
    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>> {
        let mut records: Vec<RunRecord> = self
            .records
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

/// In-memory conversation store.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: DashMap<String, Memory>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Memory>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|entry| entry.value().clone()))
    }

    async fn set(&self, conversation_id: &str, memory: &Memory) -> Result<()> {
        self.conversations
            .insert(conversation_id.to_string(), memory.clone());
        Ok(())
    }

    async fn delete(&self, conversation_id: &str) -> Result<()> {
        self.conversations.remove(conversation_id);
        Ok(())
    }
}
