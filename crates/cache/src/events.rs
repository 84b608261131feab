//! Structured operation events
//!
//! Operation reports are emitted as tracing events on the
//! `stowage::operation` target with an `event_type` field, so subscribers can
//! filter them apart from ordinary log lines.

/// Emit an operation started event.
///
/// # Example
/// ```rust,ignore
/// emit_operation_started!(operation);
/// ```
#[macro_export]
macro_rules! emit_operation_started {
    ($op:expr) => {
        ::tracing::info!(
            target: "stowage::operation",
            event_type = "operation.started",
            operation_id = %$op.id,
            parent_id = ?$op.parent.map(|id| id.to_string()),
            kind = %$op.descriptor.details.kind(),
            name = %$op.descriptor.display_name,
            progress = $op.descriptor.progress_display_name,
        )
    };
}

/// Emit an operation completed event.
#[macro_export]
macro_rules! emit_operation_completed {
    ($op:expr, $result:expr) => {
        ::tracing::info!(
            target: "stowage::operation",
            event_type = "operation.completed",
            operation_id = %$op.id,
            kind = %$op.descriptor.details.kind(),
            result = ?$result,
        )
    };
}

/// Emit an operation failed event.
#[macro_export]
macro_rules! emit_operation_failed {
    ($op:expr, $error:expr) => {
        ::tracing::warn!(
            target: "stowage::operation",
            event_type = "operation.failed",
            operation_id = %$op.id,
            kind = %$op.descriptor.details.kind(),
            error = %$error,
        )
    };
}
