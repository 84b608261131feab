use super::{OperationResult, StartedOperation};
use crate::Error;

/// Receives reports of started and finished operations
///
/// Called from whichever thread starts or finishes the operation.
pub trait OperationSink: Send + Sync {
    /// `operation` has started
    fn started(&self, operation: &StartedOperation);

    /// `operation` has finished with `outcome`
    fn finished(&self, operation: &StartedOperation, outcome: &Result<OperationResult, Error>);
}

/// Reports operations as structured tracing events
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingOperationSink;

impl OperationSink for TracingOperationSink {
    fn started(&self, operation: &StartedOperation) {
        crate::emit_operation_started!(operation);
    }

    fn finished(&self, operation: &StartedOperation, outcome: &Result<OperationResult, Error>) {
        match outcome {
            Ok(result) => crate::emit_operation_completed!(operation, result),
            Err(error) => crate::emit_operation_failed!(operation, error),
        }
    }
}
