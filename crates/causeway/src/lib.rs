#![forbid(unsafe_code)]

//! Causeway: a deterministic, credit-metered inference engine that
//! maintains a probability ledger over named causal hypotheses.
//!
//! The library surface is three calls:
//!
//! - [`run_session`] drives a session against live [`Evaluator`] and
//!   [`Decomposer`] ports until a stop condition fires,
//! - [`replay_session`] re-runs a recorded trace without the ports and
//!   reproduces the original ledger and event stream,
//! - [`validate_hypothesis_set`] surfaces anti-vagueness issues before
//!   any credit is spent.
//!
//! Adapters render exclusively from [`SessionResult`]; no internal
//! state is exposed.

pub use cw_adjudicate::{DiscriminatorLedger, PairQueue, PairTask, VerdictOutcome};
pub use cw_audit::{
    AuditError, AuditLog, AuditSink, AuditTrace, JsonlFileSink, MemorySink, NullSink,
    SessionEnvelope, SessionTerminator, TraceRecord,
};
pub use cw_canon::{CanonicalId, canonicalize, normalize_quote};
pub use cw_engine::{
    AuditMetadata, CancelToken, CertificationOutput, CertificationStatus, Clock, Decomposer,
    Evaluator, FixedClock, IdProvider, PortError, SelectionOutput, SessionDeps, SessionError,
    SessionResult, replay_session, run_session,
};
pub use cw_gates::validate_hypothesis_set;
pub use cw_policy::{CONSERVATIVE_DELTA, CONTRADICTION_FLOOR, GUARDRAIL_K_CAP};
pub use cw_sched::{ClosureReport, Credits, Frontier, PlannedOp};
pub use cw_model::{
    AuditEvent, AuditPayload, Config, ConfigError, ContrastiveContext, DecompositionOutcome,
    DecompositionStructure, DecompositionType, Direction, DiscriminatorKind, DiscriminatorRecord,
    Entailment, EvaluationOutcome, EvidenceBundle, EvidenceItem, EventKind, GateIssue,
    GateIssueKind, HypothesisSet, NodeSnapshot, PairDeclaration, PairKey, PairVerdict,
    QuoteFidelityMode, ReasoningMode, Role, RootHypothesis, RootSpec, Rubric, SessionRequest,
    StopReason, TargetSpec, ValidationReport, WorldMode,
};
