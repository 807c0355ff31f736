//! Timer Tests
//!
//! Durable timers, the deterministic clock, cancellation, and long timers
//! split into sub-timers.

use super::helpers::*;
use chrono::{DateTime, Duration, Utc};
use duroxide_replay::{EventKind, HistoryEvent, OrchestrationContext, OrchestrationError, Task};
use serde_json::{json, Value};

const DAY: i64 = 24 * 60 * 60;

async fn nap(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    let fire_at = ctx.current_utc_date_time() + Duration::hours(1);
    ctx.create_timer(fire_at).await?;
    Ok(json!(ctx.current_utc_date_time()))
}

/// A fresh timer is scheduled at its absolute fire time.
#[test]
fn timer_is_scheduled() {
    let decision = decide(History::fresh(Value::Null).build(), nap);

    assert!(!decision.is_done);
    assert_eq!(decision.actions, vec![vec![timer(at(3600))]]);
}

/// After the fire event, the clock reads the episode that delivered it.
#[test]
fn fired_timer_resumes_at_the_new_clock() {
    let history = History::replayed(Value::Null)
        .timer_created(0, at(3600))
        .episode(3600)
        .now_playing()
        .timer_fired(0, at(3600))
        .build();

    let decision = decide(history, nap);

    assert!(decision.is_done);
    assert_eq!(decision.output, Some(json!(at(3600))));
}

/// The clock follows OrchestratorStarted and never moves backwards.
#[test]
fn clock_follows_orchestrator_started() {
    async fn stamps(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        let before = ctx.current_utc_date_time();
        ctx.call_activity("Work", ())?.await?;
        let after = ctx.current_utc_date_time();
        Ok(json!([before, after]))
    }

    let mut history = History::replayed(Value::Null)
        .task_scheduled(0, "Work")
        .episode(60)
        .build();
    // A stale episode start must not rewind the clock.
    history.push(HistoryEvent::new(-1, at(30), EventKind::OrchestratorStarted {}).played());
    history.push(
        HistoryEvent::new(
            -1,
            at(30),
            EventKind::TaskCompleted {
                task_scheduled_id: 0,
                result: None,
            },
        )
        .played(),
    );

    let decision = decide(history, stamps);
    assert_eq!(decision.output, Some(json!([at(0), at(60)])));
}

/// Canceling a timer that already fired is an authoring error.
#[test]
fn cancel_after_fire_is_rejected() {
    async fn late_cancel(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        let t = ctx.create_timer(ctx.current_utc_date_time() + Duration::minutes(1));
        t.clone().await?;
        let err = t.cancel().unwrap_err();
        Ok(json!({"authoring": err.is_authoring(), "canceled": t.is_canceled()}))
    }

    let history = History::replayed(Value::Null).timer_fired(0, at(60)).build();
    let decision = decide(history, late_cancel);

    assert_eq!(decision.output, Some(json!({"authoring": true, "canceled": false})));
    assert_eq!(decision.actions, vec![vec![timer(at(60))]]);
}

async fn long_sleep(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
    let fire_at = ctx.current_utc_date_time() + Duration::days(5);
    ctx.create_timer(fire_at).await?;
    Ok(json!("awake"))
}

/// A timer longer than the maximum starts with one interval-sized segment.
#[test]
fn long_timer_schedules_first_segment() {
    let decision = run_with(v3(), History::fresh(Value::Null).build(), long_sleep).unwrap();

    assert!(!decision.is_done);
    assert_eq!(decision.actions, vec![vec![timer(at(DAY))]]);
}

/// Each fired segment schedules the next one; once the rest fits under the
/// maximum, the last segment goes straight to the real fire time.
#[test]
fn long_timer_chains_segments() {
    let history = History::replayed(Value::Null)
        .episode(DAY)
        .timer_fired(0, at(DAY))
        .episode(2 * DAY)
        .timer_fired(1, at(2 * DAY))
        .episode(5 * DAY)
        .timer_fired(2, at(5 * DAY))
        .build();

    let decision = run_with(v3(), history, long_sleep).unwrap();

    assert!(decision.is_done);
    assert_eq!(decision.output, Some(json!("awake")));
    assert_eq!(
        decision.flattened_actions(),
        vec![timer(at(DAY)), timer(at(2 * DAY)), timer(at(5 * DAY))]
    );
}

/// A remainder between the interval and the maximum is one timer, not two.
#[test]
fn long_timer_remainder_under_maximum_is_not_split() {
    async fn four_days(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        ctx.create_timer(ctx.current_utc_date_time() + Duration::days(4)).await?;
        Ok(Value::Null)
    }

    let history = History::replayed(Value::Null)
        .episode(DAY)
        .timer_fired(0, at(DAY))
        .build();

    let decision = run_with(v3(), history, four_days).unwrap();

    assert!(!decision.is_done);
    assert_eq!(decision.flattened_actions(), vec![timer(at(DAY)), timer(at(4 * DAY))]);
}

/// A fire time far beyond the clock's range still chains segments.
#[test]
fn distant_long_timer_does_not_overflow() {
    async fn forever(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        ctx.create_timer(DateTime::<Utc>::MAX_UTC).await?;
        Ok(Value::Null)
    }

    let decision = run_with(v3(), History::fresh(Value::Null).build(), forever).unwrap();

    assert!(!decision.is_done);
    assert_eq!(decision.actions, vec![vec![timer(at(DAY))]]);
}

/// A partially elapsed long timer stays pending with the next segment scheduled.
#[test]
fn long_timer_is_pending_between_segments() {
    let history = History::replayed(Value::Null)
        .episode(DAY)
        .timer_fired(0, at(DAY))
        .build();

    let decision = run_with(v3(), history, long_sleep).unwrap();

    assert!(!decision.is_done);
    assert_eq!(decision.flattened_actions(), vec![timer(at(DAY)), timer(at(2 * DAY))]);
}

/// Timers at or under the maximum are never split; without limits nothing is.
#[test]
fn short_timers_are_not_split() {
    async fn three_days(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        ctx.create_timer(ctx.current_utc_date_time() + Duration::days(3)).await?;
        Ok(Value::Null)
    }

    let decision = run_with(v3(), History::fresh(Value::Null).build(), three_days).unwrap();
    assert_eq!(decision.actions, vec![vec![timer(at(3 * DAY))]]);

    let decision = run_with(v2(), History::fresh(Value::Null).build(), long_sleep).unwrap();
    assert_eq!(decision.actions, vec![vec![timer(at(5 * DAY))]]);
}

/// Canceling a long timer cancels its running segment.
#[test]
fn long_timer_cancel_marks_running_segment() {
    async fn wait_or_give_up(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
        let deadline = ctx.create_timer(ctx.current_utc_date_time() + Duration::days(5));
        let approval = ctx.wait_for_external_event("Go")?;
        let winner = ctx.task_any([Task::from(deadline.clone()), approval])?.await;
        deadline.cancel()?;
        Ok(json!({"approved": winner.await?, "canceled": deadline.is_canceled()}))
    }

    let history = History::fresh(Value::Null).event_raised("Go", json!("yes")).build();
    let decision = run_with(v3(), history, wait_or_give_up).unwrap();

    assert_eq!(decision.output, Some(json!({"approved": "yes", "canceled": true})));
    assert_eq!(
        decision.flattened_actions(),
        vec![canceled_timer(at(DAY)), wait_for("Go")]
    );
}
