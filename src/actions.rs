//! Declarative side effects returned to the host.
//!
//! Actions are pure data. The host materializes each one (schedules the
//! activity, persists the timer, ...) and reports the outcome back through
//! history. Composite `WhenAll`/`WhenAny` actions only group their children
//! for hosts that understand nested decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::OrchestrationError;
use crate::http::DurableHttpRequest;

/// A side effect requested by an orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "actionType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    CallActivity {
        function_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    CallActivityWithRetry {
        function_name: String,
        retry_options: RetryOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    CallSubOrchestrator {
        function_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    CallSubOrchestratorWithRetry {
        function_name: String,
        retry_options: RetryOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    CreateTimer {
        fire_at: DateTime<Utc>,
        #[serde(default)]
        is_canceled: bool,
    },
    WaitForExternalEvent {
        external_event_name: String,
    },
    /// Two-way entity operation; the response is correlated by request id.
    CallEntity {
        instance_id: String,
        operation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// One-way entity operation.
    SignalEntity {
        instance_id: String,
        operation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    CallHttp {
        http_request: DurableHttpRequest,
    },
    ContinueAsNew {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    WhenAll {
        compound_actions: Vec<Action>,
    },
    WhenAny {
        compound_actions: Vec<Action>,
    },
}

impl Action {
    pub fn action_type(&self) -> &'static str {
        match self {
            Action::CallActivity { .. } => "callActivity",
            Action::CallActivityWithRetry { .. } => "callActivityWithRetry",
            Action::CallSubOrchestrator { .. } => "callSubOrchestrator",
            Action::CallSubOrchestratorWithRetry { .. } => "callSubOrchestratorWithRetry",
            Action::CreateTimer { .. } => "createTimer",
            Action::WaitForExternalEvent { .. } => "waitForExternalEvent",
            Action::CallEntity { .. } => "callEntity",
            Action::SignalEntity { .. } => "signalEntity",
            Action::CallHttp { .. } => "callHttp",
            Action::ContinueAsNew { .. } => "continueAsNew",
            Action::WhenAll { .. } => "whenAll",
            Action::WhenAny { .. } => "whenAny",
        }
    }

    /// Expand composite actions into their leaves, preserving order.
    pub fn flatten(self) -> Vec<Action> {
        match self {
            Action::WhenAll { compound_actions } | Action::WhenAny { compound_actions } => {
                compound_actions.into_iter().flat_map(Action::flatten).collect()
            }
            other => vec![other],
        }
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Action::CreateTimer { is_canceled, .. } = self {
            *is_canceled = true;
        }
    }
}

/// Retry policy attached to `*WithRetry` actions. The host performs the
/// delays; the orchestration only counts attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOptions {
    pub first_retry_interval_in_milliseconds: u64,
    pub max_number_of_attempts: u32,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry_interval_in_milliseconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_timeout_in_milliseconds: Option<u64>,
}

fn default_backoff_coefficient() -> f64 {
    1.0
}

impl RetryOptions {
    pub fn new(
        first_retry_interval_in_milliseconds: u64,
        max_number_of_attempts: u32,
    ) -> Result<Self, OrchestrationError> {
        let options = Self {
            first_retry_interval_in_milliseconds,
            max_number_of_attempts,
            backoff_coefficient: default_backoff_coefficient(),
            max_retry_interval_in_milliseconds: None,
            retry_timeout_in_milliseconds: None,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_max_retry_interval(mut self, millis: u64) -> Self {
        self.max_retry_interval_in_milliseconds = Some(millis);
        self
    }

    pub fn with_retry_timeout(mut self, millis: u64) -> Self {
        self.retry_timeout_in_milliseconds = Some(millis);
        self
    }

    /// Check the policy is well formed. Fields are public, so the context
    /// validates again before building an action.
    pub fn validate(&self) -> Result<(), OrchestrationError> {
        if self.first_retry_interval_in_milliseconds == 0 {
            return Err(OrchestrationError::authoring(
                "retry options: first retry interval must be greater than 0 milliseconds",
            ));
        }
        if self.max_number_of_attempts == 0 {
            return Err(OrchestrationError::authoring(
                "retry options: max number of attempts must be at least 1",
            ));
        }
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient <= 0.0 {
            return Err(OrchestrationError::authoring(
                "retry options: backoff coefficient must be a positive number",
            ));
        }
        if let Some(max) = self.max_retry_interval_in_milliseconds {
            if max < self.first_retry_interval_in_milliseconds {
                return Err(OrchestrationError::authoring(
                    "retry options: max retry interval must not be shorter than the first retry interval",
                ));
            }
        }
        Ok(())
    }
}

/// Reject empty or whitespace-only names.
pub(crate) fn require_name(what: &str, name: &str) -> Result<(), OrchestrationError> {
    if name.trim().is_empty() {
        return Err(OrchestrationError::authoring(format!("{what} must be a non-empty string")));
    }
    Ok(())
}
