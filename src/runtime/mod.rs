//! Replay runtime: configuration, the host request envelope, and the entry point
//! that replays one orchestration invocation against its history.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{OrchestrationError, ReplayError};
use crate::history::HistoryEvent;
use crate::OrchestrationContext;

pub mod decision;
pub mod replay_engine;
pub(crate) mod state;
pub(crate) mod tasks;
pub mod timespan;

pub use decision::{OrchestratorDecision, OUT_OF_PROC_DATA_LABEL};
pub use replay_engine::{ExecutorStatus, ReplayEngine};
pub use tasks::TaskState;

/// Trait implemented by orchestration handlers that can be replayed.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext) -> Result<Value, OrchestrationError>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, OrchestrationError>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, OrchestrationError>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async function as a shareable handler.
pub fn orchestration<F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
where
    F: Fn(OrchestrationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, OrchestrationError>> + Send + 'static,
{
    Arc::new(FnOrchestration(f))
}

/// Replay schema negotiated with the host. Later versions unlock more actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ReplaySchema {
    #[default]
    V1,
    V2,
    V3,
}

impl ReplaySchema {
    pub fn capabilities(self) -> ReplayCapabilities {
        match self {
            ReplaySchema::V1 => ReplayCapabilities::default(),
            ReplaySchema::V2 => ReplayCapabilities {
                compound_actions: true,
                ..ReplayCapabilities::default()
            },
            ReplaySchema::V3 => ReplayCapabilities {
                compound_actions: true,
                long_timers: true,
                http_polling: true,
            },
        }
    }
}

impl From<ReplaySchema> for u8 {
    fn from(schema: ReplaySchema) -> Self {
        match schema {
            ReplaySchema::V1 => 0,
            ReplaySchema::V2 => 1,
            ReplaySchema::V3 => 2,
        }
    }
}

impl TryFrom<u8> for ReplaySchema {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReplaySchema::V1),
            1 => Ok(ReplaySchema::V2),
            2 => Ok(ReplaySchema::V3),
            other => Err(format!("unsupported replay schema version {other}")),
        }
    }
}

/// Feature switches derived from the negotiated schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReplayCapabilities {
    /// Awaited WhenAll/WhenAny tasks are recorded as one composite action.
    pub compound_actions: bool,
    /// Timers beyond the host maximum are split into chained sub-timers.
    pub long_timers: bool,
    /// HTTP calls follow `202 Accepted` responses by polling.
    pub http_polling: bool,
}

/// Configuration options for one replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOptions {
    pub schema: ReplaySchema,
    /// Longest timer the host accepts as a single action.
    pub maximum_short_timer_duration: Option<Duration>,
    /// Spacing of the sub-timers of a long timer.
    pub long_running_timer_interval: Option<Duration>,
    /// Poll delay when a `202 Accepted` response carries no `Retry-After`.
    pub default_http_poll_interval: Duration,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            schema: ReplaySchema::V1,
            maximum_short_timer_duration: None,
            long_running_timer_interval: None,
            default_http_poll_interval: Duration::seconds(30),
        }
    }
}

impl ReplayOptions {
    pub fn with_schema(mut self, schema: ReplaySchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_long_timers(mut self, maximum_short_timer_duration: Duration, interval: Duration) -> Self {
        self.maximum_short_timer_duration = Some(maximum_short_timer_duration);
        self.long_running_timer_interval = Some(interval);
        self
    }

    pub fn capabilities(&self) -> ReplayCapabilities {
        self.schema.capabilities()
    }

    pub fn validate(&self) -> Result<(), ReplayError> {
        if self.default_http_poll_interval < Duration::zero() {
            return Err(ReplayError::Configuration(
                "default HTTP poll interval must not be negative".to_string(),
            ));
        }
        if !self.capabilities().long_timers {
            return Ok(());
        }
        let (Some(maximum), Some(interval)) = (self.maximum_short_timer_duration, self.long_running_timer_interval)
        else {
            return Err(ReplayError::Configuration(format!(
                "schema {:?} requires both maximumShortTimerDuration and longRunningTimerIntervalDuration",
                self.schema
            )));
        };
        if interval <= Duration::zero() {
            return Err(ReplayError::Configuration(
                "long running timer interval must be positive".to_string(),
            ));
        }
        if interval > maximum {
            return Err(ReplayError::Configuration(
                "long running timer interval must not exceed the maximum short timer duration".to_string(),
            ));
        }
        Ok(())
    }

    /// `(maximum, interval)` when long timers are enabled and configured.
    pub(crate) fn long_timer_limits(&self) -> Option<(Duration, Duration)> {
        if !self.capabilities().long_timers {
            return None;
        }
        Some((self.maximum_short_timer_duration?, self.long_running_timer_interval?))
    }
}

/// Identity and input of the instance being replayed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OrchestrationInstance {
    pub instance_id: String,
    pub parent_instance_id: Option<String>,
    /// Input used when `ExecutionStarted` carries none.
    pub input: Option<Value>,
    pub is_replaying: bool,
}

impl OrchestrationInstance {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent_instance_id: impl Into<String>) -> Self {
        self.parent_instance_id = Some(parent_instance_id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }
}

/// Request envelope sent by the host for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRequest {
    pub history: Vec<HistoryEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<String>,
    #[serde(default)]
    pub is_replaying: bool,
    #[serde(default)]
    pub upper_schema_version: ReplaySchema,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_running_timer_interval_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_short_timer_duration: Option<String>,
    #[serde(
        default,
        rename = "defaultHttpAsyncRequestSleepTimeMillseconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_http_async_request_sleep_time_millis: Option<u64>,
}

impl OrchestrationRequest {
    pub fn options(&self) -> Result<ReplayOptions, ReplayError> {
        let parse = |value: &Option<String>| value.as_deref().map(timespan::parse_timespan).transpose();
        let mut options = ReplayOptions {
            schema: self.upper_schema_version,
            maximum_short_timer_duration: parse(&self.maximum_short_timer_duration)?,
            long_running_timer_interval: parse(&self.long_running_timer_interval_duration)?,
            ..ReplayOptions::default()
        };
        if let Some(millis) = self.default_http_async_request_sleep_time_millis {
            let millis = i64::try_from(millis).map_err(|_| {
                ReplayError::Configuration(format!("HTTP poll interval of {millis}ms is out of range"))
            })?;
            options.default_http_poll_interval = Duration::milliseconds(millis);
        }
        options.validate()?;
        Ok(options)
    }

    pub fn instance(&self) -> OrchestrationInstance {
        OrchestrationInstance {
            instance_id: self.instance_id.clone(),
            parent_instance_id: self.parent_instance_id.clone(),
            input: self.input.clone(),
            is_replaying: self.is_replaying,
        }
    }
}

/// Replay `request.history` through `handler` and return the decision for the host.
pub fn execute(
    request: &OrchestrationRequest,
    handler: Arc<dyn OrchestrationHandler>,
) -> Result<OrchestratorDecision, ReplayError> {
    let engine = ReplayEngine::new(handler, request.instance(), request.options()?)?;
    engine.execute(&request.history)
}
