//! The decision handed back to the host after one replay, and the per-turn
//! action log it is assembled from.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actions::Action;
use crate::runtime::ReplaySchema;

/// Separates the human-readable error from the serialized decision snapshot
/// in the message of a failed orchestration.
pub const OUT_OF_PROC_DATA_LABEL: &str = "\n\n$OutOfProcData$:";

/// Outcome of replaying one orchestration invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorDecision {
    /// The orchestration returned, failed, or continued as new.
    pub is_done: bool,
    /// One batch of newly issued actions per turn.
    pub actions: Vec<Vec<Action>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_status: Option<Value>,
    pub schema_version: ReplaySchema,
}

impl OrchestratorDecision {
    /// Append this decision, serialized, to `message` behind [`OUT_OF_PROC_DATA_LABEL`].
    pub fn embed_in(&self, message: &str) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("{message}{OUT_OF_PROC_DATA_LABEL}{json}"),
            Err(_) => message.to_string(),
        }
    }

    /// Recover the message and decision snapshot from an embedded error string.
    pub fn from_host_message(message: &str) -> Option<(String, OrchestratorDecision)> {
        let (text, json) = message.split_once(OUT_OF_PROC_DATA_LABEL)?;
        let decision = serde_json::from_str(json).ok()?;
        Some((text.to_string(), decision))
    }

    /// Every leaf action across all batches, composites expanded.
    pub fn flattened_actions(&self) -> Vec<Action> {
        self.actions
            .iter()
            .flatten()
            .cloned()
            .flat_map(Action::flatten)
            .collect()
    }
}

/// Position of a recorded action, possibly grouped under a composite.
#[derive(Debug, Clone)]
pub(crate) enum ActionEntry {
    Single(usize),
    WhenAll(Vec<ActionEntry>),
    WhenAny(Vec<ActionEntry>),
}

/// Recorded actions for the current invocation. Actions live in an arena so a
/// timer canceled after being recorded is updated in place.
#[derive(Debug)]
pub(crate) struct ActionLog {
    actions: Vec<Action>,
    batches: Vec<Vec<ActionEntry>>,
    open_new_batch: bool,
}

impl ActionLog {
    pub(crate) fn new() -> Self {
        Self {
            actions: Vec::new(),
            batches: vec![Vec::new()],
            open_new_batch: false,
        }
    }

    /// Store an action and return its arena slot.
    pub(crate) fn store(&mut self, action: Action) -> usize {
        self.actions.push(action);
        self.actions.len() - 1
    }

    pub(crate) fn action_mut(&mut self, slot: usize) -> Option<&mut Action> {
        self.actions.get_mut(slot)
    }

    /// Append an entry to the batch of the current turn.
    pub(crate) fn record(&mut self, entry: ActionEntry) {
        if self.open_new_batch || self.batches.is_empty() {
            self.batches.push(Vec::new());
            self.open_new_batch = false;
        }
        if let Some(batch) = self.batches.last_mut() {
            batch.push(entry);
        }
    }

    /// The orchestration suspended; the next recorded action starts a new batch.
    pub(crate) fn end_turn(&mut self) {
        self.open_new_batch = true;
    }

    pub(crate) fn materialize(&self) -> Vec<Vec<Action>> {
        self.batches
            .iter()
            .map(|batch| batch.iter().filter_map(|entry| self.materialize_entry(entry)).collect())
            .collect()
    }

    fn materialize_entry(&self, entry: &ActionEntry) -> Option<Action> {
        match entry {
            ActionEntry::Single(slot) => self.actions.get(*slot).cloned(),
            ActionEntry::WhenAll(children) => Some(Action::WhenAll {
                compound_actions: children.iter().filter_map(|c| self.materialize_entry(c)).collect(),
            }),
            ActionEntry::WhenAny(children) => Some(Action::WhenAny {
                compound_actions: children.iter().filter_map(|c| self.materialize_entry(c)).collect(),
            }),
        }
    }
}
