//! HTTP Polling Tests
//!
//! Durable HTTP calls and the 202 Accepted polling loop.

use super::helpers::*;
use duroxide_replay::{
    Action, DurableHttpRequest, OrchestrationContext, OrchestrationError, ReplayOptions, ReplaySchema,
};
use serde_json::{json, Value};

const START: &str = "https://example.com/jobs";
const STATUS: &str = "https://example.com/jobs/7/status";

fn start_request() -> DurableHttpRequest {
    DurableHttpRequest::new("POST", START)
        .with_content(r#"{"size":3}"#)
        .with_header("x-trace", "abc")
}

async fn start_job(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    let response = ctx.call_http(start_request())?.await?;
    Ok(response)
}

fn call(request: DurableHttpRequest) -> Action {
    Action::CallHttp { http_request: request }
}

fn accepted(retry_after: Option<&str>) -> Value {
    let mut headers = json!({"Location": STATUS});
    if let Some(secs) = retry_after {
        headers["Retry-After"] = json!(secs);
    }
    json!({"statusCode": 202, "headers": headers})
}

fn finished() -> Value {
    json!({"statusCode": 200, "headers": {}, "content": "done"})
}

/// The request is recorded as given.
#[test]
fn request_is_recorded() {
    let decision = run_with(v3(), History::fresh(Value::Null).build(), start_job).unwrap();

    assert!(!decision.is_done);
    assert_eq!(decision.actions, vec![vec![call(start_request())]]);
}

/// 202 with Location schedules a timer at now + Retry-After.
#[test]
fn accepted_response_waits_before_polling() {
    let history = History::replayed(Value::Null)
        .episode(5)
        .task_completed(0, accepted(Some("10")))
        .build();

    let decision = run_with(v3(), history, start_job).unwrap();

    assert!(!decision.is_done);
    assert_eq!(decision.flattened_actions(), vec![call(start_request()), timer(at(15))]);
}

/// After the delay a GET against the Location is issued, then the final response completes the call.
#[test]
fn polling_completes_with_the_final_response() {
    let history = History::replayed(Value::Null)
        .episode(5)
        .task_completed(0, accepted(Some("10")))
        .episode(15)
        .timer_fired(1, at(15))
        .episode(20)
        .task_completed(2, finished())
        .build();

    let decision = run_with(v3(), history, start_job).unwrap();

    assert!(decision.is_done);
    assert_eq!(decision.output, Some(finished()));

    let poll = DurableHttpRequest::get(STATUS).with_header("x-trace", "abc");
    assert_eq!(
        decision.flattened_actions(),
        vec![call(start_request()), timer(at(15)), call(poll)]
    );
}

/// Without Retry-After the configured default interval applies.
#[test]
fn default_poll_interval_applies() {
    let history = History::replayed(Value::Null)
        .task_completed(0, accepted(None))
        .build();

    let decision = run_with(v3(), history, start_job).unwrap();
    assert_eq!(decision.flattened_actions()[1], timer(at(30)));

    let mut options = v3();
    options.default_http_poll_interval = chrono::Duration::seconds(2);
    let history = History::replayed(Value::Null)
        .task_completed(0, accepted(None))
        .build();
    let decision = run_with(options, history, start_job).unwrap();
    assert_eq!(decision.flattened_actions()[1], timer(at(2)));
}

/// A Retry-After too large for the clock falls back to the default interval.
#[test]
fn oversized_retry_after_uses_default_interval() {
    for secs in ["9223372036854775807", "9000000000000000"] {
        let history = History::replayed(Value::Null)
            .task_completed(0, accepted(Some(secs)))
            .build();

        let decision = run_with(v3(), history, start_job).unwrap();

        assert!(!decision.is_done);
        assert_eq!(decision.flattened_actions()[1], timer(at(30)), "Retry-After {secs}");
    }
}

/// Without the polling capability, or with the pattern disabled, 202 is the result.
#[test]
fn accepted_is_final_without_polling() {
    let history = || {
        History::replayed(Value::Null)
            .task_completed(0, accepted(Some("10")))
            .build()
    };

    let decision = run_with(ReplayOptions::default().with_schema(ReplaySchema::V2), history(), start_job).unwrap();
    assert_eq!(decision.output, Some(accepted(Some("10"))));

    async fn no_polling(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        let response = ctx.call_http(start_request().with_async_pattern(false))?.await?;
        Ok(response)
    }
    let decision = run_with(v3(), history(), no_polling).unwrap();
    assert_eq!(decision.output, Some(accepted(Some("10"))));
}

/// A failed HTTP call surfaces like an activity failure.
#[test]
fn failed_call_propagates() {
    let history = History::replayed(Value::Null).task_failed(0, "connection refused").build();

    let (message, _) = expect_failure(run_with(v3(), history, start_job));
    assert_eq!(message, "connection refused");
}

/// Requests without a method or uri are authoring errors.
#[test]
fn invalid_request_is_rejected() {
    async fn blank_uri(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        Ok(json!(ctx.call_http(DurableHttpRequest::get("")).unwrap_err().is_authoring()))
    }

    let decision = decide(History::fresh(Value::Null).build(), blank_uri);
    assert_eq!(decision.output, Some(json!(true)));
}
