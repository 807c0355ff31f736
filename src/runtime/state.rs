//! Per-instance replay state shared by the engine and the orchestration context:
//! the task arena, correlation tables, deferred completions, and the action log.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::actions::Action;
use crate::entities::{RequestMessage, ResponseMessage};
use crate::errors::{OrchestrationError, ReplayError, TaskFailure};
use crate::runtime::decision::{ActionEntry, ActionLog};
use crate::runtime::tasks::{Operation, TaskKey, TaskKind, TaskNode, TaskOutcome, TaskRef, TaskResult};
use crate::runtime::{OrchestrationInstance, ReplayOptions};

/// Namespace of deterministic orchestration GUIDs (UUID v5).
const GUID_NAMESPACE: Uuid = Uuid::from_u128(0x9e95_2958_5e33_4daf_827f_2fa1_2937_b875);

/// A completion event reduced to what correlation needs.
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    TaskSucceeded(Option<String>),
    TaskFailed(TaskFailure),
    SubOrchestrationSucceeded(Option<String>),
    SubOrchestrationFailed(TaskFailure),
    TimerFired,
    EventRaised(Option<String>),
}

impl Completion {
    fn source(&self) -> &'static str {
        match self {
            Completion::TaskSucceeded(_) => "TaskCompleted",
            Completion::TaskFailed(_) => "TaskFailed",
            Completion::SubOrchestrationSucceeded(_) => "SubOrchestrationInstanceCompleted",
            Completion::SubOrchestrationFailed(_) => "SubOrchestrationInstanceFailed",
            Completion::TimerFired => "TimerFired",
            Completion::EventRaised(_) => "EventRaised",
        }
    }
}

/// A completion that arrived before its task was tracked.
#[derive(Debug, Clone)]
struct Deferred {
    completion: Completion,
    is_played: bool,
}

#[derive(Debug)]
pub(crate) struct ReplayState {
    pub(crate) instance_id: String,
    pub(crate) parent_instance_id: Option<String>,
    pub(crate) input: Value,
    pub(crate) current_utc: DateTime<Utc>,
    pub(crate) is_replaying: bool,
    pub(crate) custom_status: Option<Value>,
    pub(crate) options: ReplayOptions,
    pub(crate) tasks: Vec<TaskNode>,
    pub(crate) log: ActionLog,
    pub(crate) will_continue_as_new: bool,
    /// Tasks the orchestration awaited during the current poll.
    pub(crate) suspended_on: Vec<TaskRef>,
    /// First replay fault raised where it could not be returned (inside a poll).
    pub(crate) fault: Option<ReplayError>,
    guid_counter: u64,
    next_sequence: u64,
    open_tasks: HashMap<u64, TaskRef>,
    open_events: HashMap<String, VecDeque<TaskRef>>,
    deferred: HashMap<u64, Deferred>,
    deferred_events: HashMap<String, VecDeque<Deferred>>,
    pending_rekeys: HashMap<u64, String>,
    ready: Vec<(TaskRef, Deferred)>,
}

impl ReplayState {
    pub(crate) fn new(instance: &OrchestrationInstance, options: ReplayOptions, current_utc: DateTime<Utc>) -> Self {
        Self {
            instance_id: instance.instance_id.clone(),
            parent_instance_id: instance.parent_instance_id.clone(),
            input: instance.input.clone().unwrap_or(Value::Null),
            current_utc,
            is_replaying: instance.is_replaying,
            custom_status: None,
            options,
            tasks: Vec::new(),
            log: ActionLog::new(),
            will_continue_as_new: false,
            suspended_on: Vec::new(),
            fault: None,
            guid_counter: 0,
            next_sequence: 0,
            open_tasks: HashMap::new(),
            open_events: HashMap::new(),
            deferred: HashMap::new(),
            deferred_events: HashMap::new(),
            pending_rekeys: HashMap::new(),
            ready: Vec::new(),
        }
    }

    /// Move the deterministic clock forward; it never goes backwards.
    pub(crate) fn advance_clock(&mut self, timestamp: DateTime<Utc>) {
        if timestamp > self.current_utc {
            self.current_utc = timestamp;
        }
    }

    pub(crate) fn new_guid(&mut self) -> Uuid {
        let name = format!(
            "{}_{}_{}",
            self.instance_id,
            self.current_utc.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.guid_counter
        );
        self.guid_counter += 1;
        Uuid::new_v5(&GUID_NAMESPACE, name.as_bytes())
    }

    pub(crate) fn note_fault(&mut self, err: ReplayError) {
        self.fault.get_or_insert(err);
    }

    /// The orchestration awaits `t`: track it and record its pending actions.
    pub(crate) fn suspend_on(&mut self, t: TaskRef) -> Result<(), ReplayError> {
        if !self.suspended_on.contains(&t) {
            self.suspended_on.push(t);
        }
        self.track_child(t)
    }

    /// Result of `t` if it is finished. Observing a result updates `is_replaying`.
    pub(crate) fn take_result(&mut self, t: TaskRef) -> Option<TaskResult> {
        let node = &self.tasks[t];
        if node.state.is_running() {
            return None;
        }
        let result = node.result.clone();
        self.is_replaying = node.is_played;
        result
    }

    /// Poll-side view of a task: its result, tracking it first if still running.
    pub(crate) fn poll_task(&mut self, t: TaskRef) -> Option<TaskResult> {
        if let Some(result) = self.take_result(t) {
            return Some(result);
        }
        if let Err(err) = self.suspend_on(t) {
            self.note_fault(err);
        }
        self.take_result(t)
    }

    pub(crate) fn track_child(&mut self, t: TaskRef) -> Result<(), ReplayError> {
        let entries = self.schedule(t)?;
        for entry in entries {
            self.record(entry);
        }
        self.flush_ready()
    }

    /// Assign correlation keys to every running leaf under `t` and collect the
    /// log entries for actions not yet recorded.
    fn schedule(&mut self, t: TaskRef) -> Result<Vec<ActionEntry>, ReplayError> {
        if !self.tasks[t].state.is_running() {
            return Ok(Vec::new());
        }
        if matches!(self.tasks[t].kind, TaskKind::Atomic(_)) {
            return self.schedule_atomic(t);
        }
        let children = self.tasks[t].kind.children().to_vec();
        let composite = match &self.tasks[t].kind {
            TaskKind::WhenAll(_) => Some(false),
            TaskKind::WhenAny(_) => Some(true),
            _ => None,
        };

        let mut entries = Vec::new();
        for child in children {
            entries.extend(self.schedule(child)?);
        }
        match composite {
            Some(is_any) if !entries.is_empty() && self.options.capabilities().compound_actions => {
                Ok(vec![if is_any {
                    ActionEntry::WhenAny(entries)
                } else {
                    ActionEntry::WhenAll(entries)
                }])
            }
            _ => Ok(entries),
        }
    }

    fn schedule_atomic(&mut self, t: TaskRef) -> Result<Vec<ActionEntry>, ReplayError> {
        let (op, needs_key) = match &self.tasks[t].kind {
            TaskKind::Atomic(atomic) if !atomic.scheduled => (atomic.op.clone(), atomic.key.is_none()),
            _ => return Ok(Vec::new()),
        };
        if needs_key {
            self.assign_key(t, op);
        }

        let will_continue_as_new = self.will_continue_as_new;
        let TaskKind::Atomic(atomic) = &mut self.tasks[t].kind else {
            return Ok(Vec::new());
        };
        atomic.scheduled = true;
        let Some(action) = atomic.action.clone() else {
            return Ok(Vec::new());
        };
        if will_continue_as_new {
            debug!(task = t, action = action.action_type(), "not recording action after continue-as-new");
            return Ok(Vec::new());
        }
        let slot = self.log.store(action);
        if let TaskKind::Atomic(atomic) = &mut self.tasks[t].kind {
            atomic.slot = Some(slot);
        }
        Ok(vec![ActionEntry::Single(slot)])
    }

    fn assign_key(&mut self, t: TaskRef, op: Operation) {
        let key = match &op {
            Operation::ExternalEvent(name) => {
                self.open_events.entry(name.clone()).or_default().push_back(t);
                if let Some(d) = self.deferred_events.get_mut(name).and_then(VecDeque::pop_front) {
                    self.claim_event_waiter(name, t);
                    self.ready.push((t, d));
                }
                TaskKey::Name(name.clone())
            }
            _ => {
                let id = self.next_sequence;
                self.next_sequence += 1;
                self.open_tasks.insert(id, t);
                if let Some(d) = self.deferred.remove(&id) {
                    self.open_tasks.remove(&id);
                    self.ready.push((t, d));
                }
                TaskKey::Sequence(id)
            }
        };
        if let TaskKind::Atomic(atomic) = &mut self.tasks[t].kind {
            atomic.key = Some(key.clone());
        }
        if let (Operation::Entity, TaskKey::Sequence(id)) = (&op, key) {
            if let Some(request_id) = self.pending_rekeys.remove(&id) {
                self.rekey(t, id, request_id);
            }
        }
    }

    fn claim_event_waiter(&mut self, name: &str, t: TaskRef) {
        if let Some(queue) = self.open_events.get_mut(name) {
            queue.retain(|&waiter| waiter != t);
        }
    }

    /// Move an entity call from its sequence key to the request id its
    /// response will be raised under.
    fn rekey(&mut self, t: TaskRef, id: u64, request_id: String) {
        debug!(task = t, sequence = id, request_id = %request_id, "correlating entity call by request id");
        self.open_tasks.remove(&id);
        self.open_events.entry(request_id.clone()).or_default().push_back(t);
        if let Some(d) = self.deferred_events.get_mut(&request_id).and_then(VecDeque::pop_front) {
            self.claim_event_waiter(&request_id, t);
            self.ready.push((t, d));
        }
        if let TaskKind::Atomic(atomic) = &mut self.tasks[t].kind {
            atomic.key = Some(TaskKey::Name(request_id));
        }
    }

    /// Append an action entry unless continue-as-new suppressed recording.
    pub(crate) fn record(&mut self, entry: ActionEntry) {
        if self.will_continue_as_new {
            return;
        }
        self.log.record(entry);
    }

    /// Record an action that no task waits on. Entity signals still consume a
    /// sequence number since the host assigns them one.
    pub(crate) fn record_fire_and_forget(&mut self, action: Action, consumes_sequence: bool) {
        if self.will_continue_as_new {
            debug!(action = action.action_type(), "not recording action after continue-as-new");
            return;
        }
        if consumes_sequence {
            self.next_sequence += 1;
        }
        let slot = self.log.store(action);
        self.log.record(ActionEntry::Single(slot));
    }

    pub(crate) fn continue_as_new(&mut self, input: Option<Value>) {
        self.record_fire_and_forget(Action::ContinueAsNew { input }, false);
        self.will_continue_as_new = true;
    }

    /// Route a completion event to its task, or hold it until the task is tracked.
    pub(crate) fn deliver(&mut self, key: TaskKey, completion: Completion, is_played: bool) -> Result<(), ReplayError> {
        let deferred = Deferred { completion, is_played };
        match key {
            TaskKey::Sequence(id) => {
                if let Some(t) = self.open_tasks.remove(&id) {
                    self.complete_atomic(t, deferred)?;
                } else if id < self.next_sequence {
                    return Err(ReplayError::protocol(format!(
                        "{} for task {id}, which is not awaiting a result",
                        deferred.completion.source()
                    )));
                } else if self.deferred.contains_key(&id) {
                    return Err(ReplayError::protocol(format!(
                        "{} for task {id} arrived twice before the task was scheduled",
                        deferred.completion.source()
                    )));
                } else {
                    debug!(sequence = id, event_type = deferred.completion.source(), "deferring completion");
                    self.deferred.insert(id, deferred);
                }
            }
            TaskKey::Name(name) => {
                let waiter = self.open_events.get_mut(&name).and_then(VecDeque::pop_front);
                match waiter {
                    Some(t) => self.complete_atomic(t, deferred)?,
                    None => {
                        debug!(name = %name, "buffering raised event until a task waits for it");
                        self.deferred_events.entry(name).or_default().push_back(deferred);
                    }
                }
            }
        }
        self.flush_ready()
    }

    /// An `EventSent` names the request id of an entity call; re-key the call
    /// now, or once it is tracked.
    pub(crate) fn observe_event_sent(&mut self, event_id: i64, input: Option<&str>) -> Result<(), ReplayError> {
        let Ok(id) = u64::try_from(event_id) else {
            return Ok(());
        };
        match self.open_tasks.get(&id).copied() {
            Some(t) if self.is_entity_call(t) => {
                let request_id = parse_request_id(input)?;
                self.rekey(t, id, request_id);
                self.flush_ready()
            }
            Some(_) => Ok(()),
            None if id >= self.next_sequence => {
                // Could also be a signal not yet replayed, so a bad envelope is not fatal here.
                match parse_request_id(input) {
                    Ok(request_id) => {
                        self.pending_rekeys.insert(id, request_id);
                    }
                    Err(err) => warn!(sequence = id, error = %err, "EventSent without an entity request id"),
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn is_entity_call(&self, t: TaskRef) -> bool {
        matches!(&self.tasks[t].kind, TaskKind::Atomic(a) if a.op == Operation::Entity)
    }

    fn flush_ready(&mut self) -> Result<(), ReplayError> {
        while !self.ready.is_empty() {
            let batch = std::mem::take(&mut self.ready);
            for (t, deferred) in batch {
                self.complete_atomic(t, deferred)?;
            }
        }
        Ok(())
    }

    fn complete_atomic(&mut self, t: TaskRef, deferred: Deferred) -> Result<(), ReplayError> {
        let op = match &self.tasks[t].kind {
            TaskKind::Atomic(atomic) => atomic.op.clone(),
            _ => return Err(ReplayError::protocol(format!("task {t} cannot receive a completion event"))),
        };
        let result = decode_completion(&op, deferred.completion)?;
        self.set_value(t, result.map(TaskOutcome::Value), deferred.is_played)
    }

    pub(crate) fn cancel_timer(&mut self, t: TaskRef) -> Result<(), OrchestrationError> {
        if !self.tasks[t].state.is_running() {
            return Err(OrchestrationError::authoring(
                "cannot cancel a timer that has already completed",
            ));
        }
        let targets: Vec<TaskRef> = match &mut self.tasks[t].kind {
            TaskKind::Atomic(atomic) if atomic.op == Operation::Timer => vec![t],
            TaskKind::LongTimer(timer) => {
                timer.canceled = true;
                timer.children.clone()
            }
            _ => return Err(OrchestrationError::authoring("only timer tasks can be canceled")),
        };
        for target in targets {
            if !self.tasks[target].state.is_running() {
                continue;
            }
            let slot = match &mut self.tasks[target].kind {
                TaskKind::Atomic(atomic) => {
                    if let Some(action) = atomic.action.as_mut() {
                        action.cancel_timer();
                    }
                    atomic.slot
                }
                _ => None,
            };
            if let Some(action) = slot.and_then(|s| self.log.action_mut(s)) {
                action.cancel_timer();
            }
        }
        Ok(())
    }

    pub(crate) fn is_canceled(&self, t: TaskRef) -> bool {
        match &self.tasks[t].kind {
            TaskKind::Atomic(atomic) => matches!(atomic.action, Some(Action::CreateTimer { is_canceled: true, .. })),
            TaskKind::LongTimer(timer) => timer.canceled,
            _ => false,
        }
    }
}

fn parse_request_id(input: Option<&str>) -> Result<String, ReplayError> {
    let raw = input.ok_or_else(|| ReplayError::protocol("EventSent carries no entity request"))?;
    let request: RequestMessage = serde_json::from_str(raw)
        .map_err(|e| ReplayError::protocol(format!("EventSent carries a malformed entity request: {e}")))?;
    Ok(request.id)
}

fn malformed(source: &str, err: serde_json::Error) -> ReplayError {
    ReplayError::protocol(format!("{source} carries malformed JSON: {err}"))
}

/// Turn a completion into the result of a task waiting on `op`.
fn decode_completion(op: &Operation, completion: Completion) -> Result<Result<Value, TaskFailure>, ReplayError> {
    let source = completion.source();
    match (op, completion) {
        (Operation::Activity | Operation::Http | Operation::Internal, Completion::TaskSucceeded(payload))
        | (Operation::SubOrchestration | Operation::Internal, Completion::SubOrchestrationSucceeded(payload))
        | (Operation::ExternalEvent(_), Completion::EventRaised(payload)) => crate::decode_payload(payload.as_deref())
            .map(Ok)
            .map_err(|e| malformed(source, e)),
        (Operation::Activity | Operation::Http | Operation::Internal, Completion::TaskFailed(failure))
        | (Operation::SubOrchestration | Operation::Internal, Completion::SubOrchestrationFailed(failure)) => {
            Ok(Err(failure))
        }
        (Operation::Timer | Operation::Internal, Completion::TimerFired) => Ok(Ok(Value::Null)),
        (Operation::Entity, Completion::EventRaised(payload)) => {
            let raw = payload.ok_or_else(|| ReplayError::protocol("entity response carries no payload"))?;
            let response: ResponseMessage = serde_json::from_str(&raw).map_err(|e| malformed(source, e))?;
            response.into_outcome().map_err(|e| malformed(source, e))
        }
        (op, _) => Err(ReplayError::Nondeterminism(format!(
            "{source} cannot complete a pending {} task; the orchestration code no longer matches its history",
            op.label()
        ))),
    }
}
