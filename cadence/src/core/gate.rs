use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

type Gate = Arc<tokio::sync::Mutex<()>>;

/// In-process mutual exclusion per key.
///
/// Waiters on one key are served in FIFO order. A key's entry is dropped
/// once nobody holds or waits on it.
#[derive(Debug, Default)]
pub(crate) struct KeyedGate {
    gates: Mutex<HashMap<String, Gate>>,
}

pub(crate) struct GatePass<'a> {
    owner: &'a KeyedGate,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyedGate {
    pub(crate) async fn enter(&self, key: &str) -> GatePass<'_> {
        let gate = Arc::clone(self.gates().entry(key.to_string()).or_default());
        let guard = gate.lock_owned().await;
        GatePass {
            owner: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.gates().len()
    }

    fn gates(&self) -> std::sync::MutexGuard<'_, HashMap<String, Gate>> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut gates = self.owner.gates();
        // Only the map itself still references an idle gate.
        if gates
            .get(&self.key)
            .is_some_and(|gate| Arc::strong_count(gate) == 1)
        {
            gates.remove(&self.key);
        }
    }
}
