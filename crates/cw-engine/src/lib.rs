#![forbid(unsafe_code)]

pub mod enforce;
pub mod pipeline;
pub mod ports;
pub mod session;

pub use enforce::{EnforcedEvaluation, EnforcementNote, enforce_evaluation};
pub use pipeline::{
    AbsorberTrail, AggregationTrail, EvaluationTarget, LedgerTrail, UpdateTrail, apply_evaluation,
    mark_root_unscoped, scope_root, scope_slot,
};
pub use ports::{
    CancelToken, Clock, Decomposer, Evaluator, FixedClock, FixedIdProvider, IdProvider, PortError,
};
pub use session::{
    AuditMetadata, CertificationOutput, CertificationStatus, SelectionOutput, SessionDeps,
    SessionError, SessionResult, replay_session, run_session,
};
