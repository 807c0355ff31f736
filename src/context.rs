//! The API orchestration code uses to schedule durable work.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::actions::{require_name, Action, RetryOptions};
use crate::entities::EntityId;
use crate::errors::OrchestrationError;
use crate::futures::{AnyTask, Task, TimerTask};
use crate::http::DurableHttpRequest;
use crate::runtime::state::ReplayState;
use crate::runtime::tasks::{Operation, TaskRef};

/// Handle passed to orchestration code. Cloning is cheap; all clones share
/// the same replay state.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<ReplayState>>,
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("instance_id", &self.instance_id())
            .finish()
    }
}

impl OrchestrationContext {
    pub(crate) fn new(state: ReplayState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ReplayState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn owns(&self, task: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &task.ctx.inner)
    }

    pub fn instance_id(&self) -> String {
        self.state().instance_id.clone()
    }

    pub fn parent_instance_id(&self) -> Option<String> {
        self.state().parent_instance_id.clone()
    }

    /// True while the orchestration is re-executing code whose results came from history.
    pub fn is_replaying(&self) -> bool {
        self.state().is_replaying
    }

    /// Deterministic time: the timestamp of the latest `OrchestratorStarted` replayed so far.
    pub fn current_utc_date_time(&self) -> DateTime<Utc> {
        self.state().current_utc
    }

    /// Deterministic UUID v5, identical on every replay at the same point.
    pub fn new_guid(&self) -> Uuid {
        self.state().new_guid()
    }

    pub fn input_value(&self) -> Value {
        self.state().input.clone()
    }

    pub fn input<T: DeserializeOwned>(&self) -> Result<T, OrchestrationError> {
        Ok(serde_json::from_value(self.input_value())?)
    }

    pub fn set_custom_status(&self, status: impl Serialize) -> Result<(), OrchestrationError> {
        let status = serde_json::to_value(status)?;
        self.state().custom_status = Some(status);
        Ok(())
    }

    fn atomic(&self, op: Operation, action: Action) -> Task {
        let id = self.state().new_atomic(op, Some(action));
        Task::new(self, id)
    }

    pub fn call_activity(&self, name: &str, input: impl Serialize) -> Result<Task, OrchestrationError> {
        require_name("activity name", name)?;
        let action = Action::CallActivity {
            function_name: name.to_string(),
            input: crate::encode_input(input)?,
        };
        Ok(self.atomic(Operation::Activity, action))
    }

    pub fn call_activity_with_retry(
        &self,
        name: &str,
        retry_options: RetryOptions,
        input: impl Serialize,
    ) -> Result<Task, OrchestrationError> {
        require_name("activity name", name)?;
        retry_options.validate()?;
        let action = Action::CallActivityWithRetry {
            function_name: name.to_string(),
            retry_options: retry_options.clone(),
            input: crate::encode_input(input)?,
        };
        let id = self.state().new_retry(Operation::Activity, action, retry_options);
        Ok(Task::new(self, id))
    }

    pub fn call_sub_orchestrator(
        &self,
        name: &str,
        input: impl Serialize,
        instance_id: Option<&str>,
    ) -> Result<Task, OrchestrationError> {
        require_name("sub-orchestrator name", name)?;
        let instance_id = sub_instance_id(instance_id)?;
        let action = Action::CallSubOrchestrator {
            function_name: name.to_string(),
            instance_id,
            input: crate::encode_input(input)?,
        };
        Ok(self.atomic(Operation::SubOrchestration, action))
    }

    pub fn call_sub_orchestrator_with_retry(
        &self,
        name: &str,
        retry_options: RetryOptions,
        input: impl Serialize,
        instance_id: Option<&str>,
    ) -> Result<Task, OrchestrationError> {
        require_name("sub-orchestrator name", name)?;
        retry_options.validate()?;
        let action = Action::CallSubOrchestratorWithRetry {
            function_name: name.to_string(),
            retry_options: retry_options.clone(),
            instance_id: sub_instance_id(instance_id)?,
            input: crate::encode_input(input)?,
        };
        let id = self.state().new_retry(Operation::SubOrchestration, action, retry_options);
        Ok(Task::new(self, id))
    }

    /// Call an entity operation and wait for its response.
    pub fn call_entity(
        &self,
        entity: &EntityId,
        operation: &str,
        input: impl Serialize,
    ) -> Result<Task, OrchestrationError> {
        require_name("entity operation", operation)?;
        let action = Action::CallEntity {
            instance_id: entity.scheduler_id(),
            operation: operation.to_string(),
            input: crate::encode_input(input)?,
        };
        Ok(self.atomic(Operation::Entity, action))
    }

    /// Send a one-way operation to an entity. Nothing waits for it.
    pub fn signal_entity(
        &self,
        entity: &EntityId,
        operation: &str,
        input: impl Serialize,
    ) -> Result<(), OrchestrationError> {
        require_name("entity operation", operation)?;
        let action = Action::SignalEntity {
            instance_id: entity.scheduler_id(),
            operation: operation.to_string(),
            input: crate::encode_input(input)?,
        };
        self.state().record_fire_and_forget(action, true);
        Ok(())
    }

    /// Issue a durable HTTP request. With HTTP polling enabled, `202 Accepted`
    /// responses are followed until a final response arrives.
    pub fn call_http(&self, request: DurableHttpRequest) -> Result<Task, OrchestrationError> {
        request.validate()?;
        let mut state = self.state();
        let id = if state.options.capabilities().http_polling && request.asynchronous_pattern_enabled {
            let poll_interval = state.options.default_http_poll_interval;
            state.new_http_polling(request, poll_interval)
        } else {
            state.new_atomic(Operation::Http, Some(Action::CallHttp { http_request: request }))
        };
        drop(state);
        Ok(Task::new(self, id))
    }

    pub fn create_timer(&self, fire_at: DateTime<Utc>) -> TimerTask {
        let mut state = self.state();
        let id = match state.options.long_timer_limits() {
            Some((maximum, interval)) if fire_at - state.current_utc > maximum => {
                state.new_long_timer(fire_at, interval, maximum)
            }
            _ => state.new_atomic(
                Operation::Timer,
                Some(Action::CreateTimer {
                    fire_at,
                    is_canceled: false,
                }),
            ),
        };
        drop(state);
        TimerTask::new(Task::new(self, id))
    }

    /// Wait for an external event raised under `name`. Events raised before
    /// anything waits are buffered and delivered in arrival order.
    pub fn wait_for_external_event(&self, name: &str) -> Result<Task, OrchestrationError> {
        require_name("event name", name)?;
        let action = Action::WaitForExternalEvent {
            external_event_name: name.to_string(),
        };
        Ok(self.atomic(Operation::ExternalEvent(name.to_string()), action))
    }

    /// Restart the orchestration with `input` once the current invocation returns.
    /// Actions requested afterwards in this invocation are not recorded.
    pub fn continue_as_new(&self, input: impl Serialize) -> Result<(), OrchestrationError> {
        let input = crate::encode_input(input)?;
        self.state().continue_as_new(input);
        Ok(())
    }

    fn children<I, T>(&self, tasks: I) -> Result<Vec<TaskRef>, OrchestrationError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Task>,
    {
        let tasks: Vec<Task> = tasks.into_iter().map(Into::into).collect();
        if tasks.is_empty() {
            return Err(OrchestrationError::authoring("cannot wait on an empty set of tasks"));
        }
        if let Some(foreign) = tasks.iter().find(|t| !self.owns(t)) {
            return Err(OrchestrationError::authoring(format!(
                "task {} belongs to a different orchestration",
                foreign.id
            )));
        }
        Ok(tasks.iter().map(|t| t.id).collect())
    }

    /// A task that completes with the array of all results in input order, or
    /// fails with the first failure.
    pub fn task_all<I, T>(&self, tasks: I) -> Result<Task, OrchestrationError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Task>,
    {
        let children = self.children(tasks)?;
        let id = self.state().new_when_all(children);
        Ok(Task::new(self, id))
    }

    /// A task that completes with the first child to finish, successfully or not.
    pub fn task_any<I, T>(&self, tasks: I) -> Result<AnyTask, OrchestrationError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Task>,
    {
        let children = self.children(tasks)?;
        let id = self.state().new_when_any(children);
        Ok(AnyTask::new(Task::new(self, id)))
    }
}

fn sub_instance_id(instance_id: Option<&str>) -> Result<Option<String>, OrchestrationError> {
    match instance_id {
        Some(id) => {
            require_name("sub-orchestration instance id", id)?;
            Ok(Some(id.to_string()))
        }
        None => Ok(None),
    }
}
