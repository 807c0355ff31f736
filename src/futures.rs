//! Durable task handles returned by [`OrchestrationContext`].
//!
//! A handle is an index into the replay state plus the context that owns it.
//! Awaiting a handle suspends the orchestration until history supplies the
//! task's result; awaiting a finished handle again yields the same result.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::errors::{OrchestrationError, TaskFailure};
use crate::runtime::tasks::{TaskOutcome, TaskRef};
use crate::runtime::TaskState;
use crate::OrchestrationContext;

/// A durable operation (activity, timer, event wait, ...) or a `task_all` group.
/// A `task_any` group converted into a `Task` resolves to its winner's result.
#[derive(Clone)]
#[must_use = "durable tasks do nothing unless awaited"]
pub struct Task {
    pub(crate) id: TaskRef,
    pub(crate) ctx: OrchestrationContext,
}

impl Task {
    pub(crate) fn new(ctx: &OrchestrationContext, id: TaskRef) -> Self {
        Self { id, ctx: ctx.clone() }
    }

    pub fn state(&self) -> TaskState {
        self.ctx.state().tasks[self.id].state
    }

    /// Finished, successfully or not.
    pub fn is_completed(&self) -> bool {
        !self.state().is_running()
    }

    pub fn is_faulted(&self) -> bool {
        self.state() == TaskState::Failed
    }

    /// The result if the task has finished. Does not suspend.
    pub fn result(&self) -> Option<Result<Value, TaskFailure>> {
        let state = self.ctx.state();
        state.tasks[self.id].result.as_ref()?;
        Some(state.settled(self.id))
    }

    /// Await the task and decode its success value.
    pub async fn into_typed<T: DeserializeOwned>(self) -> Result<T, OrchestrationError> {
        let value = self.await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").field("id", &self.id).finish()
    }
}

impl Future for Task {
    type Output = Result<Value, TaskFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.ctx.state();
        match state.poll_task(self.id) {
            Some(Ok(TaskOutcome::Value(value))) => Poll::Ready(Ok(value)),
            Some(Ok(TaskOutcome::Winner(winner))) => Poll::Ready(state.settled(winner)),
            Some(Err(failure)) => Poll::Ready(Err(failure)),
            None => Poll::Pending,
        }
    }
}

/// A durable timer. Long timers are split into sub-timers transparently.
#[derive(Clone, Debug)]
#[must_use = "durable tasks do nothing unless awaited"]
pub struct TimerTask {
    task: Task,
}

impl TimerTask {
    pub(crate) fn new(task: Task) -> Self {
        Self { task }
    }

    /// Mark the timer canceled. Awaiting it afterwards never completes unless
    /// history still delivers the fire event.
    pub fn cancel(&self) -> Result<(), OrchestrationError> {
        self.task.ctx.state().cancel_timer(self.task.id)
    }

    pub fn is_canceled(&self) -> bool {
        self.task.ctx.state().is_canceled(self.task.id)
    }

    pub fn is_completed(&self) -> bool {
        self.task.is_completed()
    }

    pub fn as_task(&self) -> &Task {
        &self.task
    }
}

impl From<TimerTask> for Task {
    fn from(timer: TimerTask) -> Self {
        timer.task
    }
}

impl Future for TimerTask {
    type Output = Result<Value, TaskFailure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx)
    }
}

/// Result of `task_any`: resolves to the first child that finished.
#[derive(Clone, Debug)]
#[must_use = "durable tasks do nothing unless awaited"]
pub struct AnyTask {
    task: Task,
}

impl AnyTask {
    pub(crate) fn new(task: Task) -> Self {
        Self { task }
    }

    pub fn is_completed(&self) -> bool {
        self.task.is_completed()
    }
}

impl From<AnyTask> for Task {
    fn from(any: AnyTask) -> Self {
        any.task
    }
}

impl Future for AnyTask {
    type Output = Task;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let ctx = &self.task.ctx;
        match ctx.state().poll_task(self.task.id) {
            Some(Ok(TaskOutcome::Winner(winner))) => Poll::Ready(Task::new(ctx, winner)),
            Some(_) => Poll::Ready(self.task.clone()),
            None => Poll::Pending,
        }
    }
}
