//! Lazily started, failure aggregating operation spans

use super::{OperationDescriptor, OperationResult, OperationSink, StartedOperation};
use crate::{Error, Result};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use uuid::Uuid;

const NOT_STARTED: u8 = 0;
const STARTED: u8 = 1;
const FINISHED: u8 = 2;

/// An operation that is only reported if something actually starts it
///
/// Starting and finishing each happen at most once, whatever the number of
/// concurrent callers. Failures can be recorded at any time and decide the
/// outcome reported on finish.
#[derive(Debug)]
pub(crate) struct OnDemandSpan {
    id: Uuid,
    state: AtomicU8,
    operation: OnceLock<StartedOperation>,
    failures: Mutex<Vec<Error>>,
}

impl OnDemandSpan {
    pub(crate) fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: AtomicU8::new(NOT_STARTED),
            operation: OnceLock::new(),
            failures: Mutex::new(Vec::new()),
        }
    }

    pub(crate) const fn id(&self) -> Uuid {
        self.id
    }

    /// Start the span unless it already is; returns whether this call started it
    pub(crate) fn ensure_started(
        &self,
        parent: Option<Uuid>,
        describe: impl FnOnce() -> OperationDescriptor,
        sink: &dyn OperationSink,
    ) -> bool {
        if self
            .state
            .compare_exchange(NOT_STARTED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let operation = self.operation.get_or_init(|| StartedOperation {
            id: self.id,
            parent,
            descriptor: describe(),
        });
        sink.started(operation);
        true
    }

    pub(crate) fn fail(&self, error: Error) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(error);
    }

    pub(crate) fn has_failures(&self) -> bool {
        !self
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Finish a started span, reporting `result` unless failures were recorded
    ///
    /// Returns `None` if the span never started or already finished.
    pub(crate) fn finish(
        &self,
        result: impl FnOnce() -> OperationResult,
        sink: &dyn OperationSink,
    ) -> Option<Result<OperationResult>> {
        self.state
            .compare_exchange(STARTED, FINISHED, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let operation = self.operation.get()?;

        let failures = std::mem::take(
            &mut *self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let message = format!(
            "{} errors encountered during {}",
            failures.len(),
            operation.descriptor.display_name
        );
        let outcome = match Error::aggregate(message, failures) {
            Some(error) => Err(error),
            None => Ok(result()),
        };
        sink.finished(operation, &outcome);
        Some(outcome)
    }
}

/// Which span of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    /// Pack or unpack
    Local,
    /// Remote store or remote load
    Remote,
}

impl Side {
    const fn tag(self) -> u8 {
        match self {
            Self::Local => 1,
            Self::Remote => 2,
        }
    }

    const fn other(self) -> Self {
        match self {
            Self::Local => Self::Remote,
            Self::Remote => Self::Local,
        }
    }
}

const NO_PARENT: u8 = 0;

/// The two spans of one pipeline
///
/// Whichever span starts first is the parent of the other. Closing finishes
/// the child before the parent.
pub(crate) struct SpanPair {
    local: OnDemandSpan,
    remote: OnDemandSpan,
    parent: AtomicU8,
    sink: Arc<dyn OperationSink>,
}

impl SpanPair {
    pub(crate) fn new(sink: Arc<dyn OperationSink>) -> Self {
        Self {
            local: OnDemandSpan::new(),
            remote: OnDemandSpan::new(),
            parent: AtomicU8::new(NO_PARENT),
            sink,
        }
    }

    const fn span(&self, side: Side) -> &OnDemandSpan {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }

    pub(crate) fn ensure_started(
        &self,
        side: Side,
        describe: impl FnOnce() -> OperationDescriptor,
    ) {
        let parent = match self.parent.compare_exchange(
            NO_PARENT,
            side.tag(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => None,
            Err(current) if current == side.tag() => None,
            Err(_) => Some(self.span(side.other()).id()),
        };
        self.span(side)
            .ensure_started(parent, describe, self.sink.as_ref());
    }

    pub(crate) fn fail(&self, side: Side, error: Error) {
        self.span(side).fail(error);
    }

    pub(crate) fn has_failures(&self, side: Side) -> bool {
        self.span(side).has_failures()
    }

    /// Finish both spans, child first; returns the (local, remote) outcomes
    pub(crate) fn close(
        &self,
        local_result: impl FnOnce() -> OperationResult,
        remote_result: impl FnOnce() -> OperationResult,
    ) -> (
        Option<Result<OperationResult>>,
        Option<Result<OperationResult>>,
    ) {
        let sink = self.sink.as_ref();
        if self.parent.load(Ordering::Acquire) == Side::Remote.tag() {
            let local = self.local.finish(local_result, sink);
            let remote = self.remote.finish(remote_result, sink);
            (local, remote)
        } else {
            let remote = self.remote.finish(remote_result, sink);
            let local = self.local.finish(local_result, sink);
            (local, remote)
        }
    }
}
