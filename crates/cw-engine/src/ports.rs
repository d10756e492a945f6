//! Capability interfaces to the external oracles. The engine treats
//! each call as an atomic step that runs to completion; failures are
//! never retried or masked here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cw_model::{
    ContrastiveContext, DecompositionOutcome, EvaluationOutcome, EvidenceBundle, NodeSnapshot,
    TargetSpec,
};
use thiserror::Error;

/// Transport-level failure from a port. Contract-level oddities in a
/// returned outcome are handled by enforcement instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("port failure: {detail}")]
pub struct PortError {
    pub detail: String,
}

impl PortError {
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

pub trait Evaluator {
    fn evaluate(
        &mut self,
        node: &NodeSnapshot,
        context: Option<&ContrastiveContext>,
        evidence: &EvidenceBundle,
    ) -> Result<EvaluationOutcome, PortError>;
}

pub trait Decomposer {
    fn decompose(&mut self, target: &TargetSpec) -> Result<DecompositionOutcome, PortError>;
}

/// Timestamp source for audit events. Injected so two sessions with
/// identical inputs can produce byte-identical traces.
pub trait Clock {
    fn now_unix_ms(&mut self) -> u64;
}

/// Fixed clock; the default when no clock is supplied.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_unix_ms(&mut self) -> u64 {
        self.0
    }
}

pub trait IdProvider {
    fn session_id(&mut self) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct FixedIdProvider(pub String);

impl IdProvider for FixedIdProvider {
    fn session_id(&mut self) -> String {
        if self.0.is_empty() {
            "session-00000000".to_owned()
        } else {
            self.0.clone()
        }
    }
}

/// Cooperative cancellation flag, honored only between operations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
