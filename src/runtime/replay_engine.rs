use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{OrchestrationError, ReplayError, TaskFailure};
use crate::history::{EventKind, HistoryEvent};
use crate::runtime::decision::OrchestratorDecision;
use crate::runtime::state::{Completion, ReplayState};
use crate::runtime::tasks::TaskKey;
use crate::runtime::{OrchestrationHandler, OrchestrationInstance, ReplayOptions};
use crate::OrchestrationContext;

type OrchestrationFuture = Pin<Box<dyn Future<Output = Result<Value, OrchestrationError>> + Send>>;

/// Where the orchestration stands after the history seen so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorStatus {
    /// No `ExecutionStarted` has been replayed yet.
    Initialized,
    /// The orchestration is being polled.
    Replaying,
    /// Waiting on a task history has not completed.
    Suspended,
    Returned,
    Threw,
    ContinuingAsNew,
}

impl ExecutorStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            ExecutorStatus::Returned | ExecutorStatus::Threw | ExecutorStatus::ContinuingAsNew
        )
    }
}

/// How one poll of the orchestration future ended.
enum PollOutcome {
    Returned(Value),
    Threw(String),
    ContinuedAsNew,
    Suspended,
}

/// Replays history through an orchestration and produces the decision for one invocation.
pub struct ReplayEngine {
    handler: Arc<dyn OrchestrationHandler>,
    instance: OrchestrationInstance,
    options: ReplayOptions,
    ctx: OrchestrationContext,
    orchestration: Option<OrchestrationFuture>,
    status: ExecutorStatus,
    output: Option<Value>,
    error: Option<String>,
}

impl ReplayEngine {
    pub fn new(
        handler: Arc<dyn OrchestrationHandler>,
        instance: OrchestrationInstance,
        options: ReplayOptions,
    ) -> Result<Self, ReplayError> {
        options.validate()?;
        let ctx = OrchestrationContext::new(ReplayState::new(&instance, options.clone(), DateTime::<Utc>::UNIX_EPOCH));
        Ok(Self {
            handler,
            instance,
            options,
            ctx,
            orchestration: None,
            status: ExecutorStatus::Initialized,
            output: None,
            error: None,
        })
    }

    pub fn status(&self) -> ExecutorStatus {
        self.status
    }

    /// Replay `history` in order and return the resulting decision.
    ///
    /// An uncaught orchestration failure is returned as
    /// [`ReplayError::OrchestrationFailed`] carrying the decision snapshot.
    pub fn execute(mut self, history: &[HistoryEvent]) -> Result<OrchestratorDecision, ReplayError> {
        if let Some(first) = history.first() {
            self.ctx.state().current_utc = first.timestamp;
        }

        for (index, event) in history.iter().enumerate() {
            self.process_event(event)?;
            if self.status.is_final() {
                let remaining = history.len() - index - 1;
                if remaining > 0 {
                    debug!(
                        instance_id = %self.instance.instance_id,
                        remaining,
                        status = ?self.status,
                        "orchestration finished; remaining history ignored"
                    );
                }
                break;
            }
        }

        let decision = self.decision();
        debug!(
            instance_id = %self.instance.instance_id,
            status = ?self.status,
            batches = decision.actions.len(),
            "replay finished"
        );
        match self.status {
            ExecutorStatus::Threw => Err(ReplayError::OrchestrationFailed {
                message: self.error.unwrap_or_default(),
                decision: Box::new(decision),
            }),
            _ => Ok(decision),
        }
    }

    fn decision(&self) -> OrchestratorDecision {
        let state = self.ctx.state();
        OrchestratorDecision {
            is_done: self.status.is_final(),
            actions: state.log.materialize(),
            output: self.output.clone(),
            error: self.error.clone(),
            custom_status: state.custom_status.clone(),
            schema_version: self.options.schema,
        }
    }

    fn process_event(&mut self, event: &HistoryEvent) -> Result<(), ReplayError> {
        debug!(
            instance_id = %self.instance.instance_id,
            event_type = event.event_type(),
            event_id = event.event_id,
            is_played = event.is_played,
            "processing history event"
        );
        let played = event.is_played;
        match &event.kind {
            EventKind::OrchestratorStarted {} => {
                self.ctx.state().advance_clock(event.timestamp);
                Ok(())
            }
            EventKind::ExecutionStarted { input, .. } => self.start(input.as_deref(), played),
            EventKind::ContinueAsNew { input } => {
                self.reset();
                self.start(input.as_deref(), played)
            }
            EventKind::TaskCompleted {
                task_scheduled_id,
                result,
            } => self.complete(
                sequence_key(*task_scheduled_id)?,
                Completion::TaskSucceeded(result.clone()),
                played,
            ),
            EventKind::TaskFailed {
                task_scheduled_id,
                reason,
                details,
            } => self.complete(
                sequence_key(*task_scheduled_id)?,
                Completion::TaskFailed(failure(reason, details)),
                played,
            ),
            EventKind::SubOrchestrationInstanceCompleted {
                task_scheduled_id,
                result,
            } => self.complete(
                sequence_key(*task_scheduled_id)?,
                Completion::SubOrchestrationSucceeded(result.clone()),
                played,
            ),
            EventKind::SubOrchestrationInstanceFailed {
                task_scheduled_id,
                reason,
                details,
            } => self.complete(
                sequence_key(*task_scheduled_id)?,
                Completion::SubOrchestrationFailed(failure(reason, details)),
                played,
            ),
            EventKind::TimerFired { timer_id, .. } => {
                self.complete(sequence_key(*timer_id)?, Completion::TimerFired, played)
            }
            EventKind::EventRaised { name, input } => self.complete(
                TaskKey::Name(name.clone()),
                Completion::EventRaised(input.clone()),
                played,
            ),
            EventKind::EventSent { input, .. } => {
                self.ctx.state().observe_event_sent(event.event_id, input.as_deref())?;
                self.resume()
            }
            _ => Ok(()),
        }
    }

    fn start(&mut self, input: Option<&str>, is_played: bool) -> Result<(), ReplayError> {
        if self.status != ExecutorStatus::Initialized {
            warn!(
                instance_id = %self.instance.instance_id,
                status = ?self.status,
                "ignoring ExecutionStarted for an orchestration that is already running"
            );
            return Ok(());
        }
        let input = match input {
            Some(raw) => crate::decode_payload(Some(raw))
                .map_err(|e| ReplayError::protocol(format!("orchestration input is not valid JSON: {e}")))?,
            None => self.instance.input.clone().unwrap_or(Value::Null),
        };
        {
            let mut state = self.ctx.state();
            state.input = input;
            state.is_replaying = is_played;
        }

        debug!(instance_id = %self.instance.instance_id, "starting orchestration");
        let handler = self.handler.clone();
        let ctx = self.ctx.clone();
        self.orchestration = Some(Box::pin(async move { handler.invoke(ctx).await }));
        self.status = ExecutorStatus::Suspended;
        self.poll_orchestration()?;
        self.resume()
    }

    /// Drop all bookkeeping of the current execution; the clock carries over.
    fn reset(&mut self) {
        let now = self.ctx.state().current_utc;
        debug!(instance_id = %self.instance.instance_id, "continue-as-new marker; restarting orchestration");
        self.orchestration = None;
        self.ctx = OrchestrationContext::new(ReplayState::new(&self.instance, self.options.clone(), now));
        self.status = ExecutorStatus::Initialized;
        self.output = None;
        self.error = None;
    }

    fn complete(&mut self, key: TaskKey, completion: Completion, is_played: bool) -> Result<(), ReplayError> {
        self.ctx.state().deliver(key, completion, is_played)?;
        self.resume()
    }

    /// Keep polling while the orchestration waits on a task that has finished.
    fn resume(&mut self) -> Result<(), ReplayError> {
        while self.status == ExecutorStatus::Suspended {
            let ready = {
                let state = self.ctx.state();
                state.suspended_on.iter().any(|&t| state.is_terminal(t))
            };
            if !ready {
                return Ok(());
            }
            self.poll_orchestration()?;
        }
        Ok(())
    }

    fn poll_orchestration(&mut self) -> Result<(), ReplayError> {
        let Some(orchestration) = self.orchestration.as_mut() else {
            return Ok(());
        };
        self.ctx.state().suspended_on.clear();
        self.status = ExecutorStatus::Replaying;

        let mut cx = Context::from_waker(::futures::task::noop_waker_ref());
        let polled = catch_unwind(AssertUnwindSafe(|| orchestration.as_mut().poll(&mut cx)));

        let outcome = {
            let mut state = self.ctx.state();
            if let Some(fault) = state.fault.take() {
                return Err(fault);
            }
            match polled {
                Err(payload) => PollOutcome::Threw(format!("orchestration panicked: {}", panic_message(&*payload))),
                Ok(Poll::Ready(Ok(_))) if state.will_continue_as_new => PollOutcome::ContinuedAsNew,
                Ok(Poll::Ready(Ok(output))) => PollOutcome::Returned(output),
                Ok(Poll::Ready(Err(err))) => PollOutcome::Threw(err.to_string()),
                Ok(Poll::Pending) if state.will_continue_as_new => PollOutcome::ContinuedAsNew,
                Ok(Poll::Pending) if state.suspended_on.is_empty() => PollOutcome::Threw(
                    OrchestrationError::authoring("orchestration awaited something that is not a durable task")
                        .to_string(),
                ),
                Ok(Poll::Pending) => {
                    state.log.end_turn();
                    PollOutcome::Suspended
                }
            }
        };

        self.status = match outcome {
            PollOutcome::Returned(output) => {
                self.output = Some(output);
                ExecutorStatus::Returned
            }
            PollOutcome::Threw(message) => {
                debug!(instance_id = %self.instance.instance_id, error = %message, "orchestration failed");
                self.error = Some(message);
                ExecutorStatus::Threw
            }
            PollOutcome::ContinuedAsNew => ExecutorStatus::ContinuingAsNew,
            PollOutcome::Suspended => ExecutorStatus::Suspended,
        };
        if self.status.is_final() {
            self.orchestration = None;
        }
        Ok(())
    }
}

fn sequence_key(id: i64) -> Result<TaskKey, ReplayError> {
    u64::try_from(id)
        .map(TaskKey::Sequence)
        .map_err(|_| ReplayError::protocol(format!("completion refers to invalid task id {id}")))
}

fn failure(reason: &Option<String>, details: &Option<String>) -> TaskFailure {
    TaskFailure::new(reason.clone().unwrap_or_default(), details.clone())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
