//! Error taxonomy for orchestration code and the replay engine.
//!
//! Three families of failure exist:
//!
//! - **Authoring errors** are returned synchronously by `OrchestrationContext`
//!   when an orchestration misuses the API (empty names, bad retry options,
//!   awaiting something that is not a durable task).
//! - **Operation failures** are carried as data on a failed task and only
//!   surface when orchestration code awaits that task.
//! - **Replay errors** mean the history cannot be reconciled with the
//!   orchestration and abort the invocation.

use serde::{Deserialize, Serialize};

use crate::runtime::decision::OrchestratorDecision;

/// Failure of a durable operation (activity, sub-orchestration, entity call, HTTP call).
///
/// Built from the `Reason`/`Details` pair of a failure event in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{reason}")]
pub struct TaskFailure {
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl TaskFailure {
    pub fn new(reason: impl Into<String>, details: Option<String>) -> Self {
        Self {
            reason: reason.into(),
            details,
        }
    }
}

/// Error type flowing through orchestration code.
///
/// Orchestrations return `Result<Value, OrchestrationError>`; `?` on a failed
/// task or on an invalid context call converts into this type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestrationError {
    /// The orchestration used the context API incorrectly.
    #[error("orchestration authoring error: {0}")]
    Authoring(String),
    /// A durable operation failed and the orchestration did not handle it.
    #[error(transparent)]
    TaskFailed(#[from] TaskFailure),
    /// Orchestration-defined failure.
    #[error("{0}")]
    Application(String),
    /// A payload could not be encoded or decoded.
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

impl OrchestrationError {
    pub fn authoring(message: impl Into<String>) -> Self {
        Self::Authoring(message.into())
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    pub fn is_authoring(&self) -> bool {
        matches!(self, Self::Authoring(_))
    }
}

impl From<serde_json::Error> for OrchestrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error returned by the replay engine for one invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// The orchestration failed with an uncaught error. The partial decision
    /// (actions recorded so far) travels with the error and is embedded in its
    /// display string so the host can recover it.
    #[error("{}", embed_decision(.message, .decision))]
    OrchestrationFailed {
        message: String,
        decision: Box<OrchestratorDecision>,
    },
    /// History cannot be matched against tracked tasks.
    #[error("history protocol violation: {0}")]
    Protocol(String),
    /// A completion correlated to a task of a different kind.
    #[error("nondeterministic replay: {0}")]
    Nondeterminism(String),
    /// Replay options are inconsistent.
    #[error("invalid replay configuration: {0}")]
    Configuration(String),
}

fn embed_decision(message: &str, decision: &OrchestratorDecision) -> String {
    decision.embed_in(message)
}

impl ReplayError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// The decision snapshot attached to an orchestration failure.
    pub fn decision(&self) -> Option<&OrchestratorDecision> {
        match self {
            Self::OrchestrationFailed { decision, .. } => Some(&**decision),
            _ => None,
        }
    }

    /// Whether the error points at corrupted or mismatched history rather
    /// than at orchestration logic.
    pub fn is_replay_fault(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Nondeterminism(_))
    }
}
