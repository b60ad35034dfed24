use super::index::TriggerIndex;
use super::trigger::Trigger;
use crate::core::{Error, Result};
use crate::events::Event;
use crate::executor::RunOptions;
use crate::graph::Workflow;
use std::collections::HashMap;
use std::sync::Arc;

/// A workflow known to an orchestrator.
#[derive(Debug, Clone)]
pub struct RegisteredWorkflow {
    pub workflow: Arc<Workflow>,
    pub trigger: Trigger,
    /// Defaults merged under the options of every run.
    pub options: RunOptions,
}

#[derive(Debug, Default)]
pub(crate) struct Registry {
    workflows: HashMap<String, RegisteredWorkflow>,
    index: TriggerIndex,
}

impl Registry {
    pub(crate) fn insert(&mut self, registered: RegisteredWorkflow) -> Result<()> {
        let id = registered.workflow.id().to_string();
        if self.workflows.contains_key(&id) {
            return Err(Error::conflict(format!("workflow '{}' is already registered", id)));
        }
        if let Some(trigger) = registered.trigger.event_trigger() {
            self.index.insert(&id, trigger.matcher());
        }
        self.workflows.insert(id, registered);
        Ok(())
    }

    pub(crate) fn remove(&mut self, workflow_id: &str) -> bool {
        self.index.remove(workflow_id);
        self.workflows.remove(workflow_id).is_some()
    }

    pub(crate) fn get(&self, workflow_id: &str) -> Option<RegisteredWorkflow> {
        self.workflows.get(workflow_id).cloned()
    }

    pub(crate) fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.contains_key(workflow_id)
    }

    pub(crate) fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Registrations whose trigger accepts `event`, in index order.
    pub(crate) fn matching(&self, event: &Event) -> Vec<RegisteredWorkflow> {
        self.index
            .candidates(event.event_type())
            .iter()
            .filter_map(|id| self.workflows.get(id))
            .filter(|registered| {
                registered
                    .trigger
                    .event_trigger()
                    .is_some_and(|trigger| trigger.accepts(event))
            })
            .cloned()
            .collect()
    }
}
