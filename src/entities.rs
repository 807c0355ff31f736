//! Entity addressing and the request/response envelopes used to correlate
//! entity operations with their results.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{OrchestrationError, TaskFailure};

/// Identity of a durable entity: `@name@key` on the wire. Names are
/// case-insensitive and normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId {
    pub name: String,
    pub key: String,
}

impl EntityId {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Result<Self, OrchestrationError> {
        let name: String = name.into();
        crate::actions::require_name("entity name", &name)?;
        Ok(Self {
            name: name.to_lowercase(),
            key: key.into(),
        })
    }

    /// Scheduler id used as the target instance of entity actions.
    pub fn scheduler_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}@{}", self.name, self.key)
    }
}

impl FromStr for EntityId {
    type Err = OrchestrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| OrchestrationError::authoring(format!("entity id '{s}' must start with '@'")))?;
        let (name, key) = rest
            .split_once('@')
            .ok_or_else(|| OrchestrationError::authoring(format!("entity id '{s}' must have the form @name@key")))?;
        EntityId::new(name, key)
    }
}

/// Envelope the host records in `EventSent` for an entity operation. Only the
/// request `id` matters for correlation; the response arrives as an
/// `EventRaised` named after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default)]
    pub signal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Envelope of an entity operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMessage {
    /// JSON-encoded result, or the error message when `exception_type` is set.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
}

impl ResponseMessage {
    /// Decode into the task outcome it represents.
    pub(crate) fn into_outcome(self) -> Result<Result<Value, TaskFailure>, serde_json::Error> {
        if let Some(exception_type) = self.exception_type {
            return Ok(Err(TaskFailure::new(exception_type, self.result)));
        }
        crate::decode_payload(self.result.as_deref()).map(Ok)
    }
}
