//! Deterministic replay of durable orchestrations.
//!
//! An orchestration is ordinary async Rust code written against an
//! [`OrchestrationContext`]. Each invocation replays the host-supplied
//! history from the start: tasks whose results already appear in history
//! resolve immediately, and the first task without a result suspends the
//! orchestration. The invocation ends with an [`OrchestratorDecision`]
//! listing the new actions the host should carry out.
//!
//! ```no_run
//! use duroxide_replay::{orchestration, runtime, OrchestrationContext, OrchestrationError, OrchestrationRequest};
//! use serde_json::Value;
//!
//! async fn hello_cities(ctx: OrchestrationContext) -> Result<Value, OrchestrationError> {
//!     let tokyo = ctx.call_activity("Hello", "Tokyo")?.await?;
//!     let seattle = ctx.call_activity("Hello", "Seattle")?.await?;
//!     Ok(Value::Array(vec![tokyo, seattle]))
//! }
//!
//! # fn run(request: OrchestrationRequest) -> Result<(), Box<dyn std::error::Error>> {
//! let decision = runtime::execute(&request, orchestration(hello_cities))?;
//! println!("{}", serde_json::to_string(&decision)?);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use serde_json::Value;

pub mod actions;
mod context;
pub mod entities;
pub mod errors;
pub mod futures;
pub mod history;
pub mod http;
pub mod logging;
pub mod runtime;

pub use actions::{Action, RetryOptions};
pub use context::OrchestrationContext;
pub use entities::{EntityId, RequestMessage, ResponseMessage};
pub use errors::{OrchestrationError, ReplayError, TaskFailure};
pub use futures::{AnyTask, Task, TimerTask};
pub use history::{EventKind, HistoryEvent};
pub use http::{DurableHttpRequest, DurableHttpResponse, ManagedIdentityTokenSource};
pub use runtime::{
    orchestration, ExecutorStatus, FnOrchestration, OrchestrationHandler, OrchestrationInstance,
    OrchestrationRequest, OrchestratorDecision, ReplayCapabilities, ReplayEngine, ReplayOptions, ReplaySchema,
    TaskState,
};

/// Decode a JSON payload carried in history. Absent or empty payloads are `null`.
pub(crate) fn decode_payload(payload: Option<&str>) -> Result<Value, serde_json::Error> {
    match payload {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw),
        _ => Ok(Value::Null),
    }
}

/// Encode an action input; `null` inputs are omitted from the action.
pub(crate) fn encode_input(input: impl Serialize) -> Result<Option<Value>, OrchestrationError> {
    match serde_json::to_value(input)? {
        Value::Null => Ok(None),
        value => Ok(Some(value)),
    }
}
