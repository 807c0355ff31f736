//! Failure Handling Tests
//!
//! Operation failures surface at the await point; uncaught ones fail the
//! orchestration and carry the partial decision.

use super::helpers::*;
use duroxide_replay::{
    Action, OrchestrationContext, OrchestrationError, OrchestratorDecision, ReplayError, RetryOptions,
};
use serde_json::{json, Value};

async fn compensating(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    match ctx.call_activity("Charge", 100)?.await {
        Ok(receipt) => Ok(receipt),
        Err(failure) => {
            ctx.call_activity("Refund", &failure.reason)?.await?;
            Ok(json!({"refunded": failure.reason, "details": failure.details}))
        }
    }
}

/// A caught failure lets the orchestration continue.
#[test]
fn caught_failure_continues() {
    let history = History::replayed(Value::Null)
        .task_failed(0, "card declined")
        .task_completed(1, Value::Null)
        .build();

    let decision = decide(history, compensating);

    assert!(decision.is_done);
    assert_eq!(
        decision.output,
        Some(json!({"refunded": "card declined", "details": "card declined details"}))
    );
    assert_eq!(
        decision.flattened_actions(),
        vec![activity("Charge", json!(100)), activity("Refund", json!("card declined"))]
    );
}

async fn two_steps(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    ctx.call_activity("First", ())?.await?;
    ctx.call_activity("Second", ())?.await?;
    Ok(json!("done"))
}

/// An uncaught failure fails the invocation and keeps the actions recorded so far.
#[test]
fn uncaught_failure_embeds_partial_decision() {
    let history = History::replayed(Value::Null)
        .task_completed(0, Value::Null)
        .task_failed(1, "second broke")
        .build();

    let err = run(history, two_steps).unwrap_err();

    let rendered = err.to_string();
    assert!(rendered.starts_with("second broke\n\n$OutOfProcData$:"));
    let (message, decision) = OrchestratorDecision::from_host_message(&rendered).unwrap();
    assert_eq!(message, "second broke");
    assert!(decision.is_done);
    assert_eq!(decision.error.as_deref(), Some("second broke"));
    assert_eq!(decision.output, None);
    assert_eq!(
        decision.actions,
        vec![vec![activity("First", Value::Null)], vec![activity("Second", Value::Null)]]
    );
    assert_eq!(err.decision(), Some(&decision));
    assert!(!err.is_replay_fault());
}

/// Sub-orchestration results and failures correlate like activities.
#[test]
fn sub_orchestration_completes_and_fails() {
    async fn parent(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        let ok = ctx.call_sub_orchestrator("Child", 1, Some("child-1"))?.await?;
        let failed = ctx.call_sub_orchestrator("Child", 2, None)?.await.unwrap_err();
        Ok(json!([ok, failed.reason]))
    }

    let history = History::replayed(Value::Null)
        .sub_orchestration_completed(0, json!("child done"))
        .sub_orchestration_failed(1, "child broke")
        .build();

    let decision = decide(history, parent);

    assert_eq!(decision.output, Some(json!(["child done", "child broke"])));
    assert_eq!(
        decision.flattened_actions(),
        vec![
            Action::CallSubOrchestrator {
                function_name: "Child".to_string(),
                instance_id: Some("child-1".to_string()),
                input: Some(json!(1)),
            },
            Action::CallSubOrchestrator {
                function_name: "Child".to_string(),
                instance_id: None,
                input: Some(json!(2)),
            },
        ]
    );
}

fn retry_options(attempts: u32) -> RetryOptions {
    RetryOptions::new(1000, attempts).unwrap()
}

async fn flaky(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    let result = ctx
        .call_activity_with_retry("Flaky", retry_options(3), "payload")?
        .await?;
    Ok(result)
}

/// The retry action is recorded once; nothing new is scheduled while retries run.
#[test]
fn retry_records_a_single_action() {
    let history = History::replayed(Value::Null)
        .task_failed(0, "attempt 1")
        .timer_fired(1, at(1))
        .build();

    let decision = decide(history, flaky);

    assert!(!decision.is_done);
    assert_eq!(
        decision.actions,
        vec![vec![Action::CallActivityWithRetry {
            function_name: "Flaky".to_string(),
            retry_options: retry_options(3),
            input: Some(json!("payload")),
        }]]
    );
}

/// A later attempt succeeding completes the retry task with its value.
#[test]
fn retry_succeeds_on_a_later_attempt() {
    let history = History::replayed(Value::Null)
        .task_failed(0, "attempt 1")
        .timer_fired(1, at(1))
        .task_completed(2, json!("finally"))
        .build();

    let decision = decide(history, flaky);

    assert!(decision.is_done);
    assert_eq!(decision.output, Some(json!("finally")));
}

fn three_failed_attempts() -> History {
    History::replayed(Value::Null)
        .task_failed(0, "attempt 1")
        .timer_fired(1, at(1))
        .task_failed(2, "attempt 2")
        .timer_fired(3, at(2))
        .task_failed(4, "attempt 3")
}

/// The last failure still waits for its timer before giving up.
#[test]
fn retry_waits_for_the_final_timer() {
    let decision = decide(three_failed_attempts().build(), flaky);
    assert!(!decision.is_done);
}

/// N attempts, each followed by a timer fire, then failure with the last error.
#[test]
fn retry_exhaustion_fails_with_last_error() {
    let history = three_failed_attempts().timer_fired(5, at(3)).build();

    let (message, decision) = expect_failure(run(history, flaky));

    assert_eq!(message, "attempt 3");
    assert!(decision.is_done);
    assert_eq!(decision.flattened_actions().len(), 1);
}

/// Sub-orchestrations retry through the same loop.
#[test]
fn sub_orchestration_retry_exhausts() {
    async fn parent(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        let task = ctx.call_sub_orchestrator_with_retry("Child", retry_options(1), (), None)?;
        match task.await {
            Ok(value) => Ok(value),
            Err(failure) => Ok(json!({"gaveUp": failure.reason})),
        }
    }

    let history = History::replayed(Value::Null)
        .sub_orchestration_failed(0, "child broke")
        .timer_fired(1, at(1))
        .build();

    let decision = decide(history, parent);
    assert_eq!(decision.output, Some(json!({"gaveUp": "child broke"})));
}

/// Invalid retry options are rejected before anything is scheduled.
#[test]
fn invalid_retry_options_are_authoring_errors() {
    async fn bad(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        let mut options = retry_options(3);
        options.max_number_of_attempts = 0;
        ctx.call_activity_with_retry("Flaky", options, ())?.await?;
        Ok(Value::Null)
    }

    let (message, decision) = expect_failure(run(History::fresh(Value::Null).build(), bad));
    assert!(message.contains("authoring"));
    assert_eq!(decision.actions, vec![vec![]]);
}

/// Blank names are rejected synchronously.
#[test]
fn blank_names_are_authoring_errors() {
    async fn blank(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        Ok(json!([
            ctx.call_activity(" ", ()).unwrap_err().is_authoring(),
            ctx.wait_for_external_event("").unwrap_err().is_authoring(),
            ctx.call_sub_orchestrator("Child", (), Some("")).unwrap_err().is_authoring(),
        ]))
    }

    let decision = decide(History::fresh(Value::Null).build(), blank);
    assert_eq!(decision.output, Some(json!([true, true, true])));
}

/// Protocol errors never carry a decision.
#[test]
fn replay_faults_carry_no_decision() {
    let history = History::replayed(Value::Null)
        .task_completed(0, Value::Null)
        .task_completed(0, Value::Null)
        .build();

    let err = run(history, two_steps).unwrap_err();
    assert!(matches!(err, ReplayError::Protocol(_)));
    assert!(err.decision().is_none());
    assert!(err.is_replay_fault());
}
