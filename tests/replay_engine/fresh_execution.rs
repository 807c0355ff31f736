//! Fresh Execution Tests
//!
//! The orchestration starts from ExecutionStarted with no completions in history.

use super::helpers::*;
use duroxide_replay::{OrchestrationContext, OrchestrationError, OrchestrationRequest, ReplaySchema};
use serde_json::{json, Value};

async fn say_hello(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    let name: String = ctx.input()?;
    Ok(json!(format!("Hello, {name}!")))
}

async fn hello_activity(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    let name: String = ctx.input()?;
    let greeting = ctx.call_activity("Hello", &name)?.await?;
    Ok(greeting)
}

async fn fails_immediately(_ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    Err(OrchestrationError::application("nothing to do"))
}

/// A procedure that returns without awaiting completes in one turn with an empty batch.
#[test]
fn immediate_return_completes() {
    let decision = decide(History::fresh(json!("World")).build(), say_hello);

    assert!(decision.is_done);
    assert_eq!(decision.actions, vec![vec![]]);
    assert_eq!(decision.output, Some(json!("Hello, World!")));
    assert_eq!(decision.error, None);
}

/// Awaiting an activity with no history schedules it and suspends.
#[test]
fn first_activity_is_scheduled() {
    let decision = decide(History::fresh(json!("World")).build(), hello_activity);

    assert!(!decision.is_done);
    assert_eq!(decision.actions, vec![vec![activity("Hello", json!("World"))]]);
    assert_eq!(decision.output, None);
}

/// An error returned before any await fails the orchestration with an empty batch.
#[test]
fn immediate_error_fails() {
    let (message, decision) = expect_failure(run(History::fresh(Value::Null).build(), fails_immediately));

    assert_eq!(message, "nothing to do");
    assert!(decision.is_done);
    assert_eq!(decision.error.as_deref(), Some("nothing to do"));
    assert_eq!(decision.actions, vec![vec![]]);
}

/// Without ExecutionStarted the procedure never runs.
#[test]
fn history_without_start_does_nothing() {
    let history = History::fresh(Value::Null).build().into_iter().take(1).collect();
    let decision = decide(history, say_hello);

    assert!(!decision.is_done);
    assert_eq!(decision.actions, vec![vec![]]);
}

/// The host envelope carries history, instance identity and the schema.
#[test]
fn host_request_envelope_runs_the_orchestration() {
    let request: OrchestrationRequest = serde_json::from_value(json!({
        "history": [
            {"EventType": "OrchestratorStarted", "EventId": -1, "Timestamp": "2024-01-01T00:00:00Z"},
            {"EventType": "ExecutionStarted", "EventId": -1, "Timestamp": "2024-01-01T00:00:00Z",
             "Name": "SayHello", "Input": "\"World\""}
        ],
        "instanceId": "abc",
        "upperSchemaVersion": 1
    }))
    .unwrap();

    let decision = execute_request(&request, hello_activity).unwrap();
    assert_eq!(decision.schema_version, ReplaySchema::V2);
    assert_eq!(
        serde_json::to_value(&decision).unwrap(),
        json!({
            "isDone": false,
            "actions": [[{"actionType": "callActivity", "functionName": "Hello", "input": "World"}]],
            "schemaVersion": 1
        })
    );
}

/// Host input is used when ExecutionStarted carries none.
#[test]
fn request_input_is_the_fallback() {
    let request: OrchestrationRequest = serde_json::from_value(json!({
        "history": [
            {"EventType": "OrchestratorStarted", "EventId": -1, "Timestamp": "2024-01-01T00:00:00Z"},
            {"EventType": "ExecutionStarted", "EventId": -1, "Timestamp": "2024-01-01T00:00:00Z", "Name": "SayHello"}
        ],
        "instanceId": "abc",
        "input": "Rust"
    }))
    .unwrap();

    let decision = execute_request(&request, say_hello).unwrap();
    assert_eq!(decision.output, Some(json!("Hello, Rust!")));
}
