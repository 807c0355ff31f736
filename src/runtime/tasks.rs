//! Task arena nodes and the completion rules of compound tasks.
//!
//! Every task an orchestration creates is a [`TaskNode`] in the arena owned by
//! [`ReplayState`]. Children point at their parents by index; a compound task
//! lists its children by index. A task handed to several `task_all`/`task_any`
//! groups has one parent link per group. The graph is acyclic by construction:
//! a node only ever gets parents created after it.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

use crate::actions::{Action, RetryOptions};
use crate::errors::{ReplayError, TaskFailure};
use crate::http::{DurableHttpRequest, DurableHttpResponse};
use crate::runtime::state::ReplayState;

/// Index of a task in the arena.
pub(crate) type TaskRef = usize;

/// Lifecycle of a task. `Running` transitions exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_running(self) -> bool {
        self == TaskState::Running
    }
}

/// Success payload of a task: a JSON value, or for a when-any task the winning child.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TaskOutcome {
    Value(Value),
    Winner(TaskRef),
}

pub(crate) type TaskResult = Result<TaskOutcome, TaskFailure>;

/// Correlation key under which a task waits for its completion event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TaskKey {
    Sequence(u64),
    Name(String),
}

/// What an atomic task is waiting on; decides which completion events may resolve it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operation {
    Activity,
    SubOrchestration,
    Timer,
    ExternalEvent(String),
    Entity,
    Http,
    /// Bookkeeping task of a retry loop; the host schedules the real work.
    Internal,
}

impl Operation {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Operation::Activity => "activity",
            Operation::SubOrchestration => "sub-orchestration",
            Operation::Timer => "timer",
            Operation::ExternalEvent(_) => "external event",
            Operation::Entity => "entity",
            Operation::Http => "http",
            Operation::Internal => "internal",
        }
    }
}

#[derive(Debug)]
pub(crate) struct AtomicTask {
    pub(crate) op: Operation,
    /// `None` for internal tasks that must not emit an action.
    pub(crate) action: Option<Action>,
    pub(crate) key: Option<TaskKey>,
    pub(crate) scheduled: bool,
    /// Arena slot in the action log once recorded.
    pub(crate) slot: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct RetryTask {
    pub(crate) children: Vec<TaskRef>,
    pub(crate) options: RetryOptions,
    pub(crate) attempt: u32,
    pub(crate) waiting_on_timer: bool,
    pub(crate) last_failure: Option<TaskFailure>,
}

#[derive(Debug)]
pub(crate) struct LongTimerTask {
    pub(crate) children: Vec<TaskRef>,
    pub(crate) fire_at: DateTime<Utc>,
    pub(crate) interval: Duration,
    pub(crate) maximum: Duration,
    pub(crate) canceled: bool,
}

#[derive(Debug)]
pub(crate) struct HttpPollingTask {
    pub(crate) children: Vec<TaskRef>,
    pub(crate) request: DurableHttpRequest,
    pub(crate) poll_interval: Duration,
    pub(crate) next_request: Option<DurableHttpRequest>,
}

#[derive(Debug)]
pub(crate) enum TaskKind {
    Atomic(AtomicTask),
    WhenAll(Vec<TaskRef>),
    WhenAny(Vec<TaskRef>),
    Retry(RetryTask),
    LongTimer(LongTimerTask),
    HttpPolling(HttpPollingTask),
}

impl TaskKind {
    pub(crate) fn children(&self) -> &[TaskRef] {
        match self {
            TaskKind::Atomic(_) => &[],
            TaskKind::WhenAll(children) | TaskKind::WhenAny(children) => children,
            TaskKind::Retry(r) => &r.children,
            TaskKind::LongTimer(t) => &t.children,
            TaskKind::HttpPolling(h) => &h.children,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaskNode {
    pub(crate) kind: TaskKind,
    pub(crate) state: TaskState,
    pub(crate) result: Option<TaskResult>,
    /// The completing event was replayed from an earlier invocation.
    pub(crate) is_played: bool,
    pub(crate) parents: Vec<TaskRef>,
}

impl TaskNode {
    fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            state: TaskState::Running,
            result: None,
            is_played: false,
            parents: Vec::new(),
        }
    }
}

// Construction
impl ReplayState {
    fn push_node(&mut self, kind: TaskKind) -> TaskRef {
        self.tasks.push(TaskNode::new(kind));
        self.tasks.len() - 1
    }

    fn adopt(&mut self, parent: TaskRef, children: &[TaskRef]) {
        for &child in children {
            self.tasks[child].parents.push(parent);
        }
    }

    pub(crate) fn new_atomic(&mut self, op: Operation, action: Option<Action>) -> TaskRef {
        self.push_node(TaskKind::Atomic(AtomicTask {
            op,
            action,
            key: None,
            scheduled: false,
            slot: None,
        }))
    }

    pub(crate) fn new_when_all(&mut self, children: Vec<TaskRef>) -> TaskRef {
        let t = self.push_node(TaskKind::WhenAll(children.clone()));
        self.adopt(t, &children);
        self.absorb_finished_children(t, &children);
        t
    }

    pub(crate) fn new_when_any(&mut self, children: Vec<TaskRef>) -> TaskRef {
        let t = self.push_node(TaskKind::WhenAny(children.clone()));
        self.adopt(t, &children);
        self.absorb_finished_children(t, &children);
        t
    }

    pub(crate) fn new_retry(&mut self, op: Operation, action: Action, options: RetryOptions) -> TaskRef {
        let inner = self.new_atomic(op, Some(action));
        let t = self.push_node(TaskKind::Retry(RetryTask {
            children: vec![inner],
            options,
            attempt: 1,
            waiting_on_timer: false,
            last_failure: None,
        }));
        self.adopt(t, &[inner]);
        t
    }

    /// A timer longer than the host's maximum, fired as a chain of sub-timers
    /// at most `interval` apart. The last stretch goes straight to `fire_at`
    /// once it fits in a single timer of `maximum`.
    pub(crate) fn new_long_timer(&mut self, fire_at: DateTime<Utc>, interval: Duration, maximum: Duration) -> TaskRef {
        let first = self.next_sub_timer(self.current_utc, fire_at, interval, maximum);
        let t = self.push_node(TaskKind::LongTimer(LongTimerTask {
            children: vec![first],
            fire_at,
            interval,
            maximum,
            canceled: false,
        }));
        self.adopt(t, &[first]);
        t
    }

    pub(crate) fn new_http_polling(&mut self, request: DurableHttpRequest, poll_interval: Duration) -> TaskRef {
        let first = self.new_atomic(
            Operation::Http,
            Some(Action::CallHttp {
                http_request: request.clone(),
            }),
        );
        let t = self.push_node(TaskKind::HttpPolling(HttpPollingTask {
            children: vec![first],
            request,
            poll_interval,
            next_request: None,
        }));
        self.adopt(t, &[first]);
        t
    }

    fn next_sub_timer(
        &mut self,
        now: DateTime<Utc>,
        fire_at: DateTime<Utc>,
        interval: Duration,
        maximum: Duration,
    ) -> TaskRef {
        let next = if fire_at - now <= maximum {
            fire_at
        } else {
            // An unrepresentable `now + interval` lies past `fire_at` anyway.
            now.checked_add_signed(interval)
                .map_or(fire_at, |segment| std::cmp::min(segment, fire_at))
        };
        self.new_atomic(
            Operation::Timer,
            Some(Action::CreateTimer {
                fire_at: next,
                is_canceled: false,
            }),
        )
    }

    /// Compound tasks built from already finished tasks settle immediately.
    fn absorb_finished_children(&mut self, parent: TaskRef, children: &[TaskRef]) {
        for &child in children {
            if !self.tasks[child].state.is_running() {
                if let Err(err) = self.child_completed(parent, child) {
                    self.fault.get_or_insert(err);
                }
            }
        }
    }
}

// Completion
impl ReplayState {
    /// Transition `t` out of `Running` and notify its parents.
    pub(crate) fn set_value(&mut self, t: TaskRef, result: TaskResult, is_played: bool) -> Result<(), ReplayError> {
        let node = &mut self.tasks[t];
        if !node.state.is_running() {
            return Err(ReplayError::protocol(format!(
                "task {t} received a second result; a task completes exactly once"
            )));
        }
        node.state = if result.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        node.result = Some(result);
        node.is_played = is_played;
        for parent in node.parents.clone() {
            self.child_completed(parent, t)?;
        }
        Ok(())
    }

    pub(crate) fn is_terminal(&self, t: TaskRef) -> bool {
        !self.tasks[t].state.is_running()
    }

    /// Outcome of a finished task, following when-any winners down to the
    /// winning leaf's value or failure.
    pub(crate) fn settled(&self, t: TaskRef) -> Result<Value, TaskFailure> {
        match &self.tasks[t].result {
            Some(Ok(TaskOutcome::Value(v))) => Ok(v.clone()),
            Some(Ok(TaskOutcome::Winner(w))) => self.settled(*w),
            Some(Err(failure)) => Err(failure.clone()),
            None => Ok(Value::Null),
        }
    }

    fn child_completed(&mut self, parent: TaskRef, child: TaskRef) -> Result<(), ReplayError> {
        if !self.tasks[parent].state.is_running() {
            return Ok(());
        }
        let played = self.tasks[child].is_played;
        let child_result = self.tasks[child].result.clone();

        match &self.tasks[parent].kind {
            TaskKind::Atomic(_) => Ok(()),
            TaskKind::WhenAll(children) => {
                let children = children.clone();
                if let Err(failure) = self.settled(child) {
                    return self.set_value(parent, Err(failure), played);
                }
                if children.iter().all(|&c| !self.tasks[c].state.is_running()) {
                    let values = children.iter().map(|&c| self.settled(c)).collect::<Result<Vec<_>, _>>();
                    self.set_value(parent, values.map(|v| TaskOutcome::Value(Value::Array(v))), played)
                } else {
                    Ok(())
                }
            }
            TaskKind::WhenAny(_) => self.set_value(parent, Ok(TaskOutcome::Winner(child)), played),
            TaskKind::Retry(_) => self.retry_child_completed(parent, child_result, played),
            TaskKind::LongTimer(_) => self.long_timer_child_completed(parent, child, played),
            TaskKind::HttpPolling(_) => self.http_child_completed(parent, child_result, played),
        }
    }

    fn retry_child_completed(
        &mut self,
        parent: TaskRef,
        child_result: Option<TaskResult>,
        played: bool,
    ) -> Result<(), ReplayError> {
        let TaskKind::Retry(retry) = &mut self.tasks[parent].kind else {
            return Ok(());
        };

        if retry.waiting_on_timer {
            retry.waiting_on_timer = false;
            if retry.attempt > retry.options.max_number_of_attempts {
                let failure = retry
                    .last_failure
                    .clone()
                    .unwrap_or_else(|| TaskFailure::new("retry attempts exhausted", None));
                debug!(task = parent, attempts = retry.attempt - 1, "retry attempts exhausted");
                return self.set_value(parent, Err(failure), played);
            }
            let attempt = self.new_atomic(Operation::Internal, None);
            self.attach_child(parent, attempt);
            return self.track_child(attempt);
        }

        match child_result {
            Some(Ok(outcome)) => self.set_value(parent, Ok(outcome), played),
            Some(Err(failure)) => {
                retry.waiting_on_timer = true;
                retry.attempt += 1;
                retry.last_failure = Some(failure);
                let timer = self.new_atomic(Operation::Internal, None);
                self.attach_child(parent, timer);
                self.track_child(timer)
            }
            None => Ok(()),
        }
    }

    fn long_timer_child_completed(&mut self, parent: TaskRef, child: TaskRef, played: bool) -> Result<(), ReplayError> {
        let child_fire_at = match &self.tasks[child].kind {
            TaskKind::Atomic(AtomicTask {
                action: Some(Action::CreateTimer { fire_at, .. }),
                ..
            }) => Some(*fire_at),
            _ => None,
        };
        let now = match child_fire_at {
            Some(fired) => std::cmp::max(self.current_utc, fired),
            None => self.current_utc,
        };
        let TaskKind::LongTimer(timer) = &self.tasks[parent].kind else {
            return Ok(());
        };
        if timer.canceled || now >= timer.fire_at {
            return self.set_value(parent, Ok(TaskOutcome::Value(Value::Null)), played);
        }
        let (fire_at, interval, maximum) = (timer.fire_at, timer.interval, timer.maximum);
        let next = self.next_sub_timer(now, fire_at, interval, maximum);
        debug!(task = parent, %fire_at, "scheduling next long-timer segment");
        self.attach_child(parent, next);
        self.track_child(next)
    }

    fn http_child_completed(
        &mut self,
        parent: TaskRef,
        child_result: Option<TaskResult>,
        played: bool,
    ) -> Result<(), ReplayError> {
        let now = self.current_utc;
        let TaskKind::HttpPolling(polling) = &mut self.tasks[parent].kind else {
            return Ok(());
        };

        if let Some(request) = polling.next_request.take() {
            // The poll delay elapsed; issue the follow-up request.
            let next = self.new_atomic(Operation::Http, Some(Action::CallHttp { http_request: request }));
            self.attach_child(parent, next);
            return self.track_child(next);
        }

        match child_result {
            Some(Ok(TaskOutcome::Value(value))) => {
                let response = serde_json::from_value::<DurableHttpResponse>(value.clone()).ok();
                let location = response.as_ref().and_then(|r| r.poll_location());
                match (response.as_ref(), location) {
                    (Some(response), Some(location)) => {
                        let default = polling.poll_interval;
                        let fire_at = now
                            .checked_add_signed(response.retry_after(default))
                            .or_else(|| now.checked_add_signed(default))
                            .ok_or_else(|| {
                                ReplayError::protocol(format!("http poll time after {now} is out of range"))
                            })?;
                        polling.next_request = Some(polling.request.poll_request(location));
                        let timer = self.new_atomic(
                            Operation::Timer,
                            Some(Action::CreateTimer {
                                fire_at,
                                is_canceled: false,
                            }),
                        );
                        debug!(task = parent, location, "http call accepted; polling after delay");
                        self.attach_child(parent, timer);
                        self.track_child(timer)
                    }
                    _ => self.set_value(parent, Ok(TaskOutcome::Value(value)), played),
                }
            }
            Some(other) => self.set_value(parent, other, played),
            None => Ok(()),
        }
    }

    fn attach_child(&mut self, parent: TaskRef, child: TaskRef) {
        self.tasks[child].parents.push(parent);
        match &mut self.tasks[parent].kind {
            TaskKind::Retry(r) => r.children.push(child),
            TaskKind::LongTimer(t) => t.children.push(child),
            TaskKind::HttpPolling(h) => h.children.push(child),
            TaskKind::WhenAll(children) | TaskKind::WhenAny(children) => children.push(child),
            TaskKind::Atomic(_) => {}
        }
    }
}
