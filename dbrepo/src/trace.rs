//! Trace hook: observe statements before and after they run.
//!
//! Hooks are advisory. A hook returning an error is logged at `warn` and the operation
//! carries on as if the hook had succeeded.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What is about to run (or just ran).
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Repository operation, e.g. `Query` or `ExecuteNonQuery`
    pub operation: &'static str,
    /// Entity type name, when the operation is entity-bound
    pub entity: Option<&'static str>,
    pub sql: Arc<str>,
}

#[async_trait]
pub trait Trace: Send + Sync {
    async fn before_execution(&self, event: &TraceEvent) -> anyhow::Result<()>;

    async fn after_execution(&self, event: &TraceEvent, elapsed: Duration) -> anyhow::Result<()>;
}

/// Emits a `debug` event around every statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTrace;

#[async_trait]
impl Trace for LoggingTrace {
    async fn before_execution(&self, event: &TraceEvent) -> anyhow::Result<()> {
        debug!(operation = event.operation, entity = event.entity, sql = %event.sql, "Executing statement");
        Ok(())
    }

    async fn after_execution(&self, event: &TraceEvent, elapsed: Duration) -> anyhow::Result<()> {
        debug!(
            operation = event.operation,
            entity = event.entity,
            elapsed_ms = elapsed.as_millis() as u64,
            "Statement finished"
        );
        Ok(())
    }
}

pub(crate) async fn before(trace: Option<&dyn Trace>, event: &TraceEvent) {
    if let Some(trace) = trace
        && let Err(e) = trace.before_execution(event).await
    {
        warn!(operation = event.operation, error = %e, "Trace hook failed before execution");
    }
}

pub(crate) async fn after(trace: Option<&dyn Trace>, event: &TraceEvent, elapsed: Duration) {
    if let Some(trace) = trace
        && let Err(e) = trace.after_execution(event, elapsed).await
    {
        warn!(operation = event.operation, error = %e, "Trace hook failed after execution");
    }
}
