//! Audit event schema. Every computational decision the engine makes is
//! recorded as one of these, with the exact numeric inputs and outputs,
//! so a session can be replayed from its trace alone.

use cw_canon::CanonicalId;
use serde::{Deserialize, Serialize};

use crate::oracle::{
    DecompositionOutcome, EvaluationOutcome, PairKey, PairVerdict, TargetSpec,
};
use crate::{DecompositionType, OperationKind, StopReason, WorldMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateIssueKind {
    PairOverlapExceedsThreshold,
    MissingPairDeclaration,
    MissingPairDiscriminator,
    MissingComponents,
    ConfidenceCapBelowTau,
    DuplicateCanonicalId,
    MissingExclusionClause,
    VagueStatement,
    StandaloneHypothesis,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateIssue {
    pub kind: GateIssueKind,
    pub subject: String,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    POutOfRange,
    MissingRubric,
    MalformedDiscriminator,
    CouplingOutOfRange,
    LedgerRepaired,
}

/// Which branch absorber enforcement took for a given update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementBranch {
    SlackToAbsorbers,
    RescaleNamed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootMass {
    pub id: CanonicalId,
    pub mass: f64,
}

/// Full numeric payload of one audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditPayload {
    SessionBootstrap {
        world: WorldMode,
        named: Vec<RootMass>,
        noa_mass: f64,
        und_mass: f64,
    },
    TauAdjusted {
        tau: f64,
        cap: f64,
        tau_effective: f64,
    },
    GateFailed {
        issues: Vec<GateIssue>,
    },
    OperationChosen {
        op: OperationKind,
        leader: Option<CanonicalId>,
        frontier_size: usize,
        via_pair_queue: bool,
    },
    DecomposeRecorded {
        target: TargetSpec,
        outcome: DecompositionOutcome,
        materialized: Vec<String>,
    },
    EvaluateRecorded {
        node_key: String,
        outcome: EvaluationOutcome,
        p_stored: f64,
        k_derived: f64,
        guardrail: bool,
    },
    ConservativeDeltaEnforced {
        p_prev: f64,
        p_requested: f64,
        p_stored: f64,
    },
    ContradictionFloorApplied {
        p_prev: f64,
        p_requested: f64,
        p_stored: f64,
    },
    DiscriminatorInvalidated {
        discriminator_id: String,
        reason: String,
    },
    NonDiscriminativeDriftBounded {
        p_prev: f64,
        p_requested: f64,
        p_stored: f64,
        epsilon_nc: f64,
    },
    QuoteFidelityDegraded {
        discriminator_id: String,
        evidence_id: String,
    },
    QuoteFidelityBlocked {
        discriminator_id: String,
        evidence_id: String,
    },
    SlotAggregated {
        slot: String,
        decomposition: DecompositionType,
        coupling: f64,
        child_keys: Vec<String>,
        child_ps: Vec<f64>,
        m: f64,
    },
    LedgerUpdated {
        p_prev: f64,
        multiplier_raw: f64,
        multiplier_clamped: f64,
        regularizer: f64,
        p_prop: f64,
        alpha: f64,
        p_new: f64,
    },
    AbsorberEnforced {
        branch: EnforcementBranch,
        named_sum_before: f64,
        named_sum_after: f64,
        noa_mass: f64,
        und_mass: f64,
    },
    AbstentionComputed {
        unresolved_pair_ratio: f64,
        contradiction_density: f64,
        non_discriminative_density: f64,
        frame_inadequacy: f64,
        pressure: f64,
        mass: f64,
    },
    ActiveSetComputed {
        members: Vec<CanonicalId>,
        locked_pair: Option<PairKey>,
    },
    PairTaskSelected {
        pair: PairKey,
        target: CanonicalId,
        bootstrap: bool,
        value: f64,
    },
    PairDeferred {
        pair: PairKey,
        rank: usize,
        pair_budget: usize,
    },
    PairVerdictUpdated {
        pair: PairKey,
        verdict: PairVerdict,
        left_count: usize,
        right_count: usize,
        margin: i64,
    },
    ContenderRetired {
        root: CanonicalId,
        pair: PairKey,
    },
    ReserveEngaged {
        credits_remaining: u64,
        reserve: u64,
    },
    AnomalyRecorded {
        anomaly: AnomalyKind,
        detail: String,
    },
    PortFailureRecorded {
        op: OperationKind,
        reason: String,
        credit_refunded: bool,
    },
    DecisionContractChecked {
        passed: bool,
        winner: Option<CanonicalId>,
        margin: f64,
        min_winner_margin: f64,
    },
    GuidanceEmitted {
        guidance: Vec<String>,
    },
    CancellationObserved,
    StopRecorded {
        reason: StopReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionBootstrap,
    TauAdjusted,
    GateFailed,
    OperationChosen,
    DecomposeRecorded,
    EvaluateRecorded,
    ConservativeDeltaEnforced,
    ContradictionFloorApplied,
    DiscriminatorInvalidated,
    NonDiscriminativeDriftBounded,
    QuoteFidelityDegraded,
    QuoteFidelityBlocked,
    SlotAggregated,
    LedgerUpdated,
    AbsorberEnforced,
    AbstentionComputed,
    ActiveSetComputed,
    PairTaskSelected,
    PairDeferred,
    PairVerdictUpdated,
    ContenderRetired,
    ReserveEngaged,
    AnomalyRecorded,
    PortFailureRecorded,
    DecisionContractChecked,
    GuidanceEmitted,
    CancellationObserved,
    StopRecorded,
}

impl AuditPayload {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionBootstrap { .. } => EventKind::SessionBootstrap,
            Self::TauAdjusted { .. } => EventKind::TauAdjusted,
            Self::GateFailed { .. } => EventKind::GateFailed,
            Self::OperationChosen { .. } => EventKind::OperationChosen,
            Self::DecomposeRecorded { .. } => EventKind::DecomposeRecorded,
            Self::EvaluateRecorded { .. } => EventKind::EvaluateRecorded,
            Self::ConservativeDeltaEnforced { .. } => EventKind::ConservativeDeltaEnforced,
            Self::ContradictionFloorApplied { .. } => EventKind::ContradictionFloorApplied,
            Self::DiscriminatorInvalidated { .. } => EventKind::DiscriminatorInvalidated,
            Self::NonDiscriminativeDriftBounded { .. } => EventKind::NonDiscriminativeDriftBounded,
            Self::QuoteFidelityDegraded { .. } => EventKind::QuoteFidelityDegraded,
            Self::QuoteFidelityBlocked { .. } => EventKind::QuoteFidelityBlocked,
            Self::SlotAggregated { .. } => EventKind::SlotAggregated,
            Self::LedgerUpdated { .. } => EventKind::LedgerUpdated,
            Self::AbsorberEnforced { .. } => EventKind::AbsorberEnforced,
            Self::AbstentionComputed { .. } => EventKind::AbstentionComputed,
            Self::ActiveSetComputed { .. } => EventKind::ActiveSetComputed,
            Self::PairTaskSelected { .. } => EventKind::PairTaskSelected,
            Self::PairDeferred { .. } => EventKind::PairDeferred,
            Self::PairVerdictUpdated { .. } => EventKind::PairVerdictUpdated,
            Self::ContenderRetired { .. } => EventKind::ContenderRetired,
            Self::ReserveEngaged { .. } => EventKind::ReserveEngaged,
            Self::AnomalyRecorded { .. } => EventKind::AnomalyRecorded,
            Self::PortFailureRecorded { .. } => EventKind::PortFailureRecorded,
            Self::DecisionContractChecked { .. } => EventKind::DecisionContractChecked,
            Self::GuidanceEmitted { .. } => EventKind::GuidanceEmitted,
            Self::CancellationObserved => EventKind::CancellationObserved,
            Self::StopRecorded { .. } => EventKind::StopRecorded,
        }
    }
}

/// One record in the append-only, strictly sequenced audit stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    #[serde(rename = "ts")]
    pub ts_unix_ms: u64,
    pub kind: EventKind,
    pub target_id: String,
    pub payload: AuditPayload,
    pub credits_before: u64,
    pub credits_after: u64,
}

impl AuditEvent {
    #[must_use]
    pub fn new(
        seq: u64,
        ts_unix_ms: u64,
        target_id: impl Into<String>,
        payload: AuditPayload,
        credits_before: u64,
        credits_after: u64,
    ) -> Self {
        Self {
            seq,
            ts_unix_ms,
            kind: payload.kind(),
            target_id: target_id.into(),
            payload,
            credits_before,
            credits_after,
        }
    }
}
