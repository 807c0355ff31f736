//! Host-persisted orchestration history.
//!
//! History arrives from the host as an ordered, append-only list of events.
//! The replay engine never mutates it. Wire names follow the host's
//! PascalCase schema with an `EventType` discriminator, e.g.
//!
//! ```json
//! {"EventType":"TaskCompleted","EventId":-1,"Timestamp":"2024-01-01T00:00:00Z",
//!  "IsPlayed":true,"TaskScheduledId":0,"Result":"\"Hello, Tokyo!\""}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of an orchestration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HistoryEvent {
    /// Sequence id assigned by the host. Scheduling events carry the
    /// correlation id of the task that requested them; completions use -1.
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    /// Whether the event was already observed by a previous invocation.
    #[serde(default)]
    pub is_played: bool,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl HistoryEvent {
    pub fn new(event_id: i64, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            event_id,
            timestamp,
            is_played: false,
            kind,
        }
    }

    /// Mark the event as replayed from a previous invocation.
    pub fn played(mut self) -> Self {
        self.is_played = true;
        self
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// Type-specific payload of a [`HistoryEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "EventType", rename_all_fields = "PascalCase")]
pub enum EventKind {
    /// A new orchestrator episode began; its timestamp drives `current_utc_date_time`.
    OrchestratorStarted {},
    /// The orchestrator episode ended.
    OrchestratorCompleted {},
    /// The instance started executing with the given input.
    ExecutionStarted {
        name: String,
        input: Option<String>,
        version: Option<String>,
    },
    ExecutionCompleted {
        result: Option<String>,
    },
    ExecutionTerminated {
        input: Option<String>,
    },
    ExecutionSuspended {
        reason: Option<String>,
    },
    ExecutionResumed {
        reason: Option<String>,
    },
    TaskScheduled {
        name: String,
        input: Option<String>,
    },
    TaskCompleted {
        task_scheduled_id: i64,
        result: Option<String>,
    },
    TaskFailed {
        task_scheduled_id: i64,
        reason: Option<String>,
        details: Option<String>,
    },
    SubOrchestrationInstanceCreated {
        name: String,
        instance_id: Option<String>,
        input: Option<String>,
    },
    SubOrchestrationInstanceCompleted {
        task_scheduled_id: i64,
        result: Option<String>,
    },
    SubOrchestrationInstanceFailed {
        task_scheduled_id: i64,
        reason: Option<String>,
        details: Option<String>,
    },
    TimerCreated {
        fire_at: DateTime<Utc>,
    },
    TimerFired {
        timer_id: i64,
        fire_at: DateTime<Utc>,
    },
    /// An external event (or an entity response) was delivered by name.
    EventRaised {
        name: String,
        input: Option<String>,
    },
    /// A message was sent to another instance (entity operation requests).
    EventSent {
        instance_id: Option<String>,
        name: String,
        input: Option<String>,
    },
    /// The instance continued as new with fresh input.
    ContinueAsNew {
        input: Option<String>,
    },
    GenericEvent {
        data: Option<String>,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::OrchestratorStarted {} => "OrchestratorStarted",
            EventKind::OrchestratorCompleted {} => "OrchestratorCompleted",
            EventKind::ExecutionStarted { .. } => "ExecutionStarted",
            EventKind::ExecutionCompleted { .. } => "ExecutionCompleted",
            EventKind::ExecutionTerminated { .. } => "ExecutionTerminated",
            EventKind::ExecutionSuspended { .. } => "ExecutionSuspended",
            EventKind::ExecutionResumed { .. } => "ExecutionResumed",
            EventKind::TaskScheduled { .. } => "TaskScheduled",
            EventKind::TaskCompleted { .. } => "TaskCompleted",
            EventKind::TaskFailed { .. } => "TaskFailed",
            EventKind::SubOrchestrationInstanceCreated { .. } => "SubOrchestrationInstanceCreated",
            EventKind::SubOrchestrationInstanceCompleted { .. } => "SubOrchestrationInstanceCompleted",
            EventKind::SubOrchestrationInstanceFailed { .. } => "SubOrchestrationInstanceFailed",
            EventKind::TimerCreated { .. } => "TimerCreated",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::EventRaised { .. } => "EventRaised",
            EventKind::EventSent { .. } => "EventSent",
            EventKind::ContinueAsNew { .. } => "ContinueAsNew",
            EventKind::GenericEvent { .. } => "GenericEvent",
        }
    }

    /// Whether this event resolves a previously requested operation.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            EventKind::TaskCompleted { .. }
                | EventKind::TaskFailed { .. }
                | EventKind::SubOrchestrationInstanceCompleted { .. }
                | EventKind::SubOrchestrationInstanceFailed { .. }
                | EventKind::TimerFired { .. }
                | EventKind::EventRaised { .. }
        )
    }
}
