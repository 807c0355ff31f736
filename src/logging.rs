//! Replay-safe logging for orchestration code.
//!
//! Orchestration code re-runs on every replay, so a plain `tracing::info!`
//! would repeat once per invocation. These macros only emit while the context
//! is executing new code, and tag each event with the instance id.
//!
//! ```ignore
//! durable_info!(ctx, city = %city, "greeting sent");
//! ```

#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::info!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::warn!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::error!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}

#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)+) => {{
        if !$ctx.is_replaying() {
            ::tracing::debug!(instance_id = %$ctx.instance_id(), $($arg)+);
        }
    }};
}
