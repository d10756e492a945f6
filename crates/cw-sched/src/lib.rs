#![forbid(unsafe_code)]

//! Deterministic scheduler core. Everything here is a pure function over
//! view structs the engine assembles from the hypothesis set, so the
//! selection logic never sees the evaluator's outputs beyond what the
//! nodes already record. Any candidate ordering uses canonical ids.

use cw_canon::CanonicalId;
use cw_model::{Config, RootStatus, StopReason};
use cw_policy::voi_priority;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Single monotonically decreasing credit counter, with an optional
/// tail reserved for counterevidence probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credits {
    total: u64,
    remaining: u64,
    reserve: u64,
}

impl Credits {
    #[must_use]
    pub fn new(total: u64, reserve: u64) -> Self {
        Self {
            total,
            remaining: total,
            reserve: reserve.min(total),
        }
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    #[must_use]
    pub fn spent(&self) -> u64 {
        self.total - self.remaining
    }

    #[must_use]
    pub fn reserve(&self) -> u64 {
        self.reserve
    }

    /// Regular operations are blocked once only the reserve remains.
    #[must_use]
    pub fn reserve_engaged(&self) -> bool {
        self.remaining > 0 && self.remaining <= self.reserve
    }

    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.remaining == 0
    }

    pub fn spend(&mut self) -> Result<(), SchedError> {
        if self.remaining == 0 {
            return Err(SchedError::NoCreditsRemaining);
        }
        self.remaining -= 1;
        Ok(())
    }

    /// Undo the most recent spend; only legal when the port-failure
    /// refund policy allows it.
    pub fn refund(&mut self) -> Result<(), SchedError> {
        if self.remaining >= self.total {
            return Err(SchedError::NothingToRefund);
        }
        self.remaining += 1;
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedError {
    #[error("no credits remaining")]
    NoCreditsRemaining,
    #[error("refund requested with no spend outstanding")]
    NothingToRefund,
}

/// Evaluable node view within a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotWork {
    pub key: String,
    pub node_canonical: CanonicalId,
    pub k: f64,
    pub evaluated: bool,
    /// Decomposition levels materialized beneath this slot.
    pub depth: usize,
    /// Sensitivity of the root multiplier to this slot (product of the
    /// other required slots' probabilities).
    pub impact: f64,
}

/// Root view the scheduler selects over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootWork {
    pub id: CanonicalId,
    pub status: RootStatus,
    pub retired: bool,
    pub p_ledger: f64,
    pub k_root: f64,
    pub missing_slots: Vec<String>,
    pub slots: Vec<SlotWork>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frontier {
    pub leader: Option<CanonicalId>,
    /// Active roots within epsilon of the leader, canonical order.
    pub members: Vec<CanonicalId>,
}

/// Leader is the named root with maximum ledger mass (canonical-id
/// tie-break); the frontier is every active root within `epsilon` of it.
#[must_use]
pub fn frontier(roots: &[RootWork], epsilon: f64) -> Frontier {
    let leader = roots
        .iter()
        .fold(None::<&RootWork>, |best, root| match best {
            Some(current)
                if current.p_ledger > root.p_ledger
                    || (current.p_ledger == root.p_ledger && current.id < root.id) =>
            {
                Some(current)
            }
            _ => Some(root),
        })
        .map(|root| root.id.clone());

    let members = leader.as_ref().map_or_else(Vec::new, |leader_id| {
        let leader_mass = roots
            .iter()
            .find(|root| root.id == *leader_id)
            .map_or(0.0, |root| root.p_ledger);
        let mut members: Vec<CanonicalId> = roots
            .iter()
            .filter(|root| !root.retired && root.p_ledger >= leader_mass - epsilon)
            .map(|root| root.id.clone())
            .collect();
        members.sort();
        members
    });

    Frontier { leader, members }
}

/// Exactly one operation per scheduler step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlannedOp {
    DecomposeRoot { root: CanonicalId },
    DecomposeSlot { root: CanonicalId, slot: String },
    EvaluateSlot { root: CanonicalId, slot: String },
}

impl PlannedOp {
    #[must_use]
    pub fn root(&self) -> &CanonicalId {
        match self {
            Self::DecomposeRoot { root }
            | Self::DecomposeSlot { root, .. }
            | Self::EvaluateSlot { root, .. } => root,
        }
    }
}

/// Walk the frontier in canonical order and choose the first productive
/// operation: scoping work first, then the evaluation the VOI-lite
/// priority picks (with `lambda_voi = 0` this is lowest-`k`-first,
/// canonical-id tie-break), then depth work required for closure.
///
/// Roots already at or above `tau_effective` yield no operation.
#[must_use]
pub fn choose_operation(
    roots: &[RootWork],
    frontier: &Frontier,
    config: &Config,
    tau_effective: f64,
) -> Option<PlannedOp> {
    for member in &frontier.members {
        let Some(root) = roots.iter().find(|root| root.id == *member) else {
            continue;
        };

        if root.status == RootStatus::Unscoped || !root.missing_slots.is_empty() {
            return Some(PlannedOp::DecomposeRoot {
                root: root.id.clone(),
            });
        }

        if let Some(op) = choose_evaluation(root, config, tau_effective) {
            return Some(op);
        }

        if config.min_decomposition_depth > 0
            && let Some(slot) = root
                .slots
                .iter()
                .find(|slot| slot.depth < config.min_decomposition_depth)
        {
            return Some(PlannedOp::DecomposeSlot {
                root: root.id.clone(),
                slot: slot.key.clone(),
            });
        }
    }
    None
}

/// Pick the evaluation the VOI-lite priority selects for one root, if
/// any remains productive.
#[must_use]
pub fn choose_evaluation(root: &RootWork, config: &Config, tau_effective: f64) -> Option<PlannedOp> {
    let candidates: Vec<&SlotWork> = root
        .slots
        .iter()
        .filter(|slot| !slot.evaluated || slot.k < tau_effective)
        .collect();
    if candidates.is_empty() || root.k_root >= tau_effective {
        return None;
    }

    let chosen = candidates.iter().fold(None::<&&SlotWork>, |best, slot| {
        let priority = voi_priority(slot.k, !slot.evaluated, slot.impact, config.lambda_voi);
        match best {
            Some(current) => {
                let current_priority = voi_priority(
                    current.k,
                    !current.evaluated,
                    current.impact,
                    config.lambda_voi,
                );
                if priority > current_priority
                    || (priority == current_priority && slot.node_canonical < current.node_canonical)
                {
                    Some(slot)
                } else {
                    Some(current)
                }
            }
            None => Some(slot),
        }
    })?;

    Some(PlannedOp::EvaluateSlot {
        root: root.id.clone(),
        slot: chosen.key.clone(),
    })
}

/// Closure gates checked once the frontier looks confident.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClosureReport {
    pub winner_margin: f64,
    pub winner_margin_ok: bool,
    pub depth_ok: bool,
    pub adjudication_ok: bool,
}

impl ClosureReport {
    #[must_use]
    pub fn pass(&self) -> bool {
        self.winner_margin_ok && self.depth_ok && self.adjudication_ok
    }
}

#[must_use]
pub fn closure_report(
    roots: &[RootWork],
    frontier: &Frontier,
    config: &Config,
    adjudication_complete: bool,
) -> ClosureReport {
    let mut masses: Vec<f64> = roots.iter().map(|root| root.p_ledger).collect();
    masses.sort_by(|a, b| b.total_cmp(a));
    let winner_margin = match masses.as_slice() {
        [] => 0.0,
        [only] => *only,
        [first, second, ..] => first - second,
    };

    let depth_ok = frontier.members.iter().all(|member| {
        roots
            .iter()
            .find(|root| root.id == *member)
            .is_some_and(|root| {
                root.status == RootStatus::Scoped
                    && root
                        .slots
                        .iter()
                        .all(|slot| slot.depth >= config.min_decomposition_depth)
            })
    });

    ClosureReport {
        winner_margin,
        winner_margin_ok: winner_margin >= config.min_winner_margin,
        depth_ok,
        adjudication_ok: !config.adjudication_required || adjudication_complete,
    }
}

/// Every frontier root at or above the effective closure threshold.
#[must_use]
pub fn frontier_confident(roots: &[RootWork], frontier: &Frontier, tau_effective: f64) -> bool {
    !frontier.members.is_empty()
        && frontier.members.iter().all(|member| {
            roots
                .iter()
                .find(|root| root.id == *member)
                .is_some_and(|root| root.k_root >= tau_effective)
        })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopInputs<'a> {
    pub cancelled: bool,
    pub credits_exhausted: bool,
    /// A regular operation exists but only reserved credits remain.
    pub blocked_by_reserve: bool,
    pub frontier_confident: bool,
    pub closure: &'a ClosureReport,
    pub has_planned_op: bool,
}

/// Decide whether the loop halts, and with which single reason.
#[must_use]
pub fn evaluate_stop(inputs: &StopInputs<'_>) -> Option<StopReason> {
    if inputs.cancelled {
        return Some(StopReason::Cancelled);
    }
    if inputs.frontier_confident && inputs.closure.pass() {
        return Some(StopReason::FrontierConfident);
    }
    if inputs.credits_exhausted {
        return Some(StopReason::CreditsExhausted);
    }
    if inputs.blocked_by_reserve {
        return Some(StopReason::NoLegalOp);
    }
    if !inputs.has_planned_op {
        if inputs.frontier_confident {
            return Some(StopReason::ClosureGatesUnmet);
        }
        return Some(StopReason::EpistemicallyExhausted);
    }
    None
}
