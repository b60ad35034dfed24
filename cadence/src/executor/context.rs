//! Per-attempt context handed to node handlers.
//!
//! Everything a handler can see about its run lives behind this type: the
//! identifiers, the caller's input and context values, the outputs of nodes
//! that already finished and, for chatflows, the conversation memory.
//!
//! Results and memory are shared by every node of the run. They sit behind
//! `std::sync::Mutex` because no lock is ever held across an `.await`.

use crate::core::{Error, Memory, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Memory buffer shared by the nodes of one chatflow run.
pub(crate) type SharedMemory = Arc<Mutex<Memory>>;

/// Context passed to a node handler on every attempt.
#[derive(Clone)]
pub struct NodeContext {
    workflow_id: Arc<str>,
    run_id: Arc<str>,
    node_id: Arc<str>,
    attempt: u32,
    input: Arc<Value>,
    context: Arc<Value>,
    conversation_id: Option<Arc<str>>,
    results: Arc<Mutex<HashMap<String, Value>>>,
    memory: Option<SharedMemory>,
    cancellation: CancellationToken,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        workflow_id: Arc<str>,
        run_id: Arc<str>,
        node_id: Arc<str>,
        attempt: u32,
        input: Arc<Value>,
        context: Arc<Value>,
        conversation_id: Option<Arc<str>>,
        results: Arc<Mutex<HashMap<String, Value>>>,
        memory: Option<SharedMemory>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            workflow_id,
            run_id,
            node_id,
            attempt,
            input,
            context,
            conversation_id,
            results,
            memory,
            cancellation,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// 1-indexed attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Input the run was started with.
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Caller-supplied context value (free-form metadata).
    pub fn context(&self) -> &Value {
        &self.context
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Output of a node that already completed in this run.
    pub fn get_result(&self, node_id: &str) -> Option<Value> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    /// True if this run carries conversation memory.
    pub fn has_memory(&self) -> bool {
        self.memory.is_some()
    }

    /// Reads one memory key. Always `None` outside chatflows.
    pub fn get_memory(&self, key: &str) -> Option<Value> {
        let memory = self.memory.as_ref()?;
        memory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Copy of the whole memory. Always `None` outside chatflows.
    pub fn memory_snapshot(&self) -> Option<Memory> {
        self.memory
            .as_ref()
            .map(|memory| memory.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Writes one memory key; visible to every node scheduled afterwards.
    pub fn set_memory(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.update_memory(|memory| {
            memory.insert(key.into(), value);
        })
    }

    /// Removes one memory key, returning its previous value.
    pub fn remove_memory(&self, key: &str) -> Result<Option<Value>> {
        let mut removed = None;
        self.update_memory(|memory| removed = memory.remove(key))?;
        Ok(removed)
    }

    /// Mutates the memory in place under its lock.
    ///
    /// Fails with `State` when the run is not a chatflow.
    pub fn update_memory<F>(&self, update: F) -> Result<()>
    where
        F: FnOnce(&mut Memory),
    {
        let memory = self.memory.as_ref().ok_or_else(|| {
            Error::state(format!(
                "workflow '{}' is not a chatflow and has no memory",
                self.workflow_id
            ))
        })?;
        let mut guard = memory.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut *guard);
        Ok(())
    }

    /// Token cancelled when the run is aborted.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns `Cancelled` if the run has been aborted. Handlers doing long
    /// loops call this between iterations.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(Error::cancelled(format!(
                "run {} aborted before node '{}' finished",
                self.run_id, self.node_id
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("attempt", &self.attempt)
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context(memory: Option<SharedMemory>) -> NodeContext {
        NodeContext::new(
            Arc::from("wf"),
            Arc::from("run-1"),
            Arc::from("node"),
            1,
            Arc::new(json!({"q": 1})),
            Arc::new(Value::Null),
            None,
            Arc::new(Mutex::new(HashMap::from([("prev".to_string(), json!(7))]))),
            memory,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_results_visible() {
        let ctx = context(None);
        assert_eq!(ctx.get_result("prev"), Some(json!(7)));
        assert_eq!(ctx.get_result("other"), None);
        assert_eq!(ctx.input()["q"], 1);
    }

    #[test]
    fn test_memory_requires_chatflow() {
        let ctx = context(None);
        assert!(!ctx.has_memory());
        assert_eq!(ctx.get_memory("k"), None);
        assert!(matches!(ctx.set_memory("k", json!(1)), Err(Error::State(_))));
    }

    #[test]
    fn test_memory_shared_between_contexts() {
        let memory: SharedMemory = Arc::new(Mutex::new(Memory::new()));
        let first = context(Some(Arc::clone(&memory)));
        let second = context(Some(memory));

        first.set_memory("turns", json!(1)).unwrap();
        second
            .update_memory(|m| {
                let turns = m.get("turns").and_then(Value::as_i64).unwrap_or(0);
                m.insert("turns".into(), json!(turns + 1));
            })
            .unwrap();

        assert_eq!(first.get_memory("turns"), Some(json!(2)));
        assert_eq!(second.remove_memory("turns").unwrap(), Some(json!(2)));
        assert!(first.memory_snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_check_cancelled() {
        let ctx = context(None);
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation().cancel();
        assert!(ctx.check_cancelled().unwrap_err().is_cancellation());
    }
}
