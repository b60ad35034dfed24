use crate::core::Memory;
use serde::{Deserialize, Serialize};

/// Key-level difference between two memory snapshots.
///
/// Values are compared by JSON equality, so a nested object that is equal
/// in content produces no entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryDiff {
    /// Keys added or changed, with their new values.
    pub set: Memory,
    /// Keys that were dropped.
    pub remove: Vec<String>,
}

impl MemoryDiff {
    /// The diff that turns `previous` into `next`.
    pub fn between(previous: &Memory, next: &Memory) -> Self {
        let set = next
            .iter()
            .filter(|(key, value)| previous.get(key.as_str()) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let remove = previous
            .keys()
            .filter(|key| !next.contains_key(key.as_str()))
            .cloned()
            .collect();
        Self { set, remove }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    pub fn apply(&self, memory: &mut Memory) {
        for key in &self.remove {
            memory.remove(key);
        }
        for (key, value) in &self.set {
            memory.insert(key.clone(), value.clone());
        }
    }
}
