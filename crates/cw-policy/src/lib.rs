#![forbid(unsafe_code)]

//! Pure policies. Every function here is referentially transparent and
//! returns the full numeric outcome so the caller can audit it; nothing
//! in this crate touches the hypothesis set directly.

use cw_model::{
    DecompositionType, DynamicAbstentionConfig, EnforcementBranch, Role, Rubric, UNSCOPED_K_CAP,
};
use serde::{Deserialize, Serialize};

/// Cap applied to a derived confidence when any rubric score is zero.
pub const GUARDRAIL_K_CAP: f64 = 0.55;

/// Maximum probability movement allowed without evidence identifiers.
pub const CONSERVATIVE_DELTA: f64 = 0.05;

/// Minimum reduction a contradicting evaluation must apply to a slot.
pub const CONTRADICTION_FLOOR: f64 = 0.25;

/// Anchor table mapping rubric totals {0, 2, 4, 6, 8} to base confidence.
const K_ANCHORS: [(u8, f64); 5] = [(0, 0.15), (2, 0.35), (4, 0.55), (6, 0.75), (8, 0.90)];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KDerivation {
    pub k: f64,
    pub guardrail: bool,
}

/// Map rubric totals to a base confidence bucket, interpolating linearly
/// between anchors. A zero anywhere in the rubric caps the result at
/// [`GUARDRAIL_K_CAP`].
#[must_use]
pub fn base_k(rubric: &Rubric) -> KDerivation {
    let total = rubric.total();
    let mut k = K_ANCHORS[K_ANCHORS.len() - 1].1;
    for window in K_ANCHORS.windows(2) {
        let (lo_total, lo_k) = window[0];
        let (hi_total, hi_k) = window[1];
        if total <= hi_total {
            let span = f64::from(hi_total - lo_total);
            let offset = f64::from(total - lo_total);
            k = lo_k + (hi_k - lo_k) * (offset / span);
            break;
        }
    }

    let guardrail = rubric.any_zero();
    if guardrail && k > GUARDRAIL_K_CAP {
        k = GUARDRAIL_K_CAP;
    }
    KDerivation { k, guardrail }
}

/// Child view used for parent confidence propagation. Children must be
/// supplied in canonical-id order; ties are broken by taking the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildConfidence {
    pub key: String,
    pub p: f64,
    pub k: f64,
    pub guardrail: bool,
    pub unscoped: bool,
}

/// Propagate child confidences to a decomposed parent.
///
/// AND takes the minimum child `k`. OR takes the `k` of the child with
/// the maximum `p` (first wins on ties, so canonical ordering of the
/// input decides), carrying that child's guardrail flag. Any unscoped
/// child caps the parent at [`cw_model::UNSCOPED_K_CAP`].
#[must_use]
pub fn propagate_parent_k(
    decomposition: DecompositionType,
    children: &[ChildConfidence],
) -> KDerivation {
    if children.is_empty() {
        return KDerivation {
            k: cw_model::INITIAL_K,
            guardrail: false,
        };
    }

    let mut derived = match decomposition {
        DecompositionType::And => {
            let min = children
                .iter()
                .min_by(|a, b| a.k.total_cmp(&b.k))
                .map_or(cw_model::INITIAL_K, |child| child.k);
            let guardrail = children
                .iter()
                .filter(|child| child.k == min)
                .any(|child| child.guardrail);
            KDerivation { k: min, guardrail }
        }
        DecompositionType::Or => {
            let decisive = children
                .iter()
                .fold(None::<&ChildConfidence>, |best, child| match best {
                    Some(current) if current.p >= child.p => Some(current),
                    _ => Some(child),
                });
            decisive.map_or(
                KDerivation {
                    k: cw_model::INITIAL_K,
                    guardrail: false,
                },
                |child| KDerivation {
                    k: child.k,
                    guardrail: child.guardrail,
                },
            )
        }
    };

    if children.iter().any(|child| child.unscoped) && derived.k > UNSCOPED_K_CAP {
        derived.k = UNSCOPED_K_CAP;
    }
    derived
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeltaOutcome {
    pub p: f64,
    pub enforced: bool,
}

/// Without evidence identifiers the stored probability may move at most
/// [`CONSERVATIVE_DELTA`] from its previous value.
#[must_use]
pub fn conservative_delta(p_prev: f64, p_requested: f64, has_evidence: bool) -> DeltaOutcome {
    if has_evidence {
        return DeltaOutcome {
            p: p_requested.clamp(0.0, 1.0),
            enforced: false,
        };
    }
    let lo = (p_prev - CONSERVATIVE_DELTA).max(0.0);
    let hi = (p_prev + CONSERVATIVE_DELTA).min(1.0);
    let p = p_requested.clamp(lo, hi);
    DeltaOutcome {
        p,
        enforced: (p - p_requested).abs() > f64::EPSILON,
    }
}

/// A contradicting entailment must cost the slot at least
/// [`CONTRADICTION_FLOOR`] of probability.
#[must_use]
pub fn contradiction_floor(p_prev: f64, p_requested: f64) -> DeltaOutcome {
    let ceiling = (p_prev - CONTRADICTION_FLOOR).max(0.0);
    if p_requested <= ceiling {
        DeltaOutcome {
            p: p_requested.clamp(0.0, 1.0),
            enforced: false,
        }
    } else {
        DeltaOutcome {
            p: ceiling,
            enforced: true,
        }
    }
}

/// Child view used for slot aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildAggregate {
    pub key: String,
    pub p: f64,
    pub assessed: bool,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub m: f64,
    /// Evaluation order actually used, recorded for the audit event.
    pub child_keys: Vec<String>,
    pub child_ps: Vec<f64>,
}

/// Aggregate a decomposed slot from its children.
///
/// AND blends the soft minimum with the product:
/// `m = c * min(p_i) + (1 - c) * prod(p_i)`, with unassessed NEC
/// children counted as `p = 1.0`. OR takes the maximum over assessed
/// NEC children. EVID children attach explanations only and never move
/// the parent. Returns `None` when no child has been assessed, so a
/// freshly decomposed slot keeps its own probability.
#[must_use]
pub fn aggregate_slot(
    decomposition: DecompositionType,
    coupling: f64,
    children: &[ChildAggregate],
) -> Option<AggregateOutcome> {
    let included: Vec<&ChildAggregate> = children
        .iter()
        .filter(|child| child.role == Role::Nec)
        .collect();
    if included.is_empty() || included.iter().all(|child| !child.assessed) {
        return None;
    }

    let mut child_keys = Vec::with_capacity(included.len());
    let mut child_ps = Vec::with_capacity(included.len());
    let m = match decomposition {
        DecompositionType::And => {
            let c = coupling.clamp(0.0, 1.0);
            let mut min = 1.0_f64;
            let mut prod = 1.0_f64;
            for child in &included {
                let p = if child.assessed { child.p } else { 1.0 };
                child_keys.push(child.key.clone());
                child_ps.push(p);
                min = min.min(p);
                prod *= p;
            }
            c * min + (1.0 - c) * prod
        }
        DecompositionType::Or => {
            let mut max = 0.0_f64;
            for child in &included {
                if !child.assessed {
                    continue;
                }
                child_keys.push(child.key.clone());
                child_ps.push(child.p);
                max = max.max(child.p);
            }
            max
        }
    };

    Some(AggregateOutcome {
        m: m.clamp(0.0, 1.0),
        child_keys,
        child_ps,
    })
}

/// Clamp the root multiplier in log-odds space: `exp(clamp(beta * ln m,
/// -W, W))`. Bounds how hard a single update can move the ledger.
#[must_use]
pub fn clamped_multiplier(m_raw: f64, beta: f64, weight_clamp: f64) -> f64 {
    let floored = m_raw.max(1e-12);
    let weight = (beta * floored.ln()).clamp(-weight_clamp, weight_clamp);
    weight.exp().min(1.0)
}

/// Damped ledger update: `p_new = alpha * p_prev + (1 - alpha) * p_prop`.
#[must_use]
pub fn damp(alpha: f64, p_prev: f64, p_prop: f64) -> f64 {
    (alpha * p_prev + (1.0 - alpha) * p_prop).clamp(0.0, 1.0)
}

/// Occam penalty for compositional stories: a story of `n` components
/// carries `1 / n` of a singleton's multiplier. Applied before dynamic
/// abstention and absorber enforcement.
#[must_use]
pub fn compositional_regularizer(story_cardinality: usize) -> f64 {
    1.0 / story_cardinality.max(1) as f64
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbsorberInputs {
    pub named_sum: f64,
    /// Current none-of-the-above mass; `None` in closed world.
    pub noa_current: Option<f64>,
    pub gamma_noa: f64,
    pub gamma_und: f64,
    /// Dynamic abstention mass for `H_UND`, already clamped, when the
    /// policy is enabled.
    pub dynamic_und_mass: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbsorberOutcome {
    pub branch: EnforcementBranch,
    /// Factor to apply to every named root mass.
    pub named_scale: f64,
    pub noa_mass: f64,
    pub und_mass: f64,
}

/// Renormalize so the full ledger sums to 1.0.
///
/// Without dynamic abstention: named sum at or below one leaves named
/// masses untouched and absorbers carry the slack split by the gamma
/// ratio; a sum above one rescales named proportionally with absorbers
/// clamped to their prior floor. With dynamic abstention `H_UND` is set
/// first and the remainder is redistributed proportionally across named
/// roots and `H_NOA`.
#[must_use]
pub fn enforce_absorbers(inputs: AbsorberInputs) -> AbsorberOutcome {
    let open_world = inputs.noa_current.is_some();

    if let Some(und) = inputs.dynamic_und_mass {
        let noa_current = inputs.noa_current.unwrap_or(0.0);
        let pool = inputs.named_sum + noa_current;
        if pool <= 0.0 {
            // Nothing to redistribute over; absorbers carry everything.
            return AbsorberOutcome {
                branch: EnforcementBranch::SlackToAbsorbers,
                named_scale: 1.0,
                noa_mass: if open_world { 1.0 - und } else { 0.0 },
                und_mass: if open_world { und } else { 1.0 },
            };
        }
        let scale = (1.0 - und) / pool;
        let branch = if scale < 1.0 {
            EnforcementBranch::RescaleNamed
        } else {
            EnforcementBranch::SlackToAbsorbers
        };
        return AbsorberOutcome {
            branch,
            named_scale: scale,
            noa_mass: noa_current * scale,
            und_mass: und,
        };
    }

    if inputs.named_sum <= 1.0 {
        let slack = 1.0 - inputs.named_sum;
        let (noa_mass, und_mass) = if open_world {
            let gamma_total = inputs.gamma_noa + inputs.gamma_und;
            let noa_share = if gamma_total > 0.0 {
                inputs.gamma_noa / gamma_total
            } else {
                0.5
            };
            let noa = slack * noa_share;
            (noa, slack - noa)
        } else {
            (0.0, slack)
        };
        AbsorberOutcome {
            branch: EnforcementBranch::SlackToAbsorbers,
            named_scale: 1.0,
            noa_mass,
            und_mass,
        }
    } else {
        let floor_total = if open_world {
            inputs.gamma_noa + inputs.gamma_und
        } else {
            inputs.gamma_und
        };
        let scale = (1.0 - floor_total) / inputs.named_sum;
        AbsorberOutcome {
            branch: EnforcementBranch::RescaleNamed,
            named_scale: scale,
            noa_mass: if open_world { inputs.gamma_noa } else { 0.0 },
            und_mass: inputs.gamma_und,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbstentionInputs {
    pub unresolved_pair_ratio: f64,
    pub contradiction_density: f64,
    pub non_discriminative_density: f64,
    pub frame_inadequacy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbstentionOutcome {
    pub pressure: f64,
    pub mass: f64,
}

/// Linear weighted pressure from the run so far, clamped into the
/// configured band. The result becomes the `H_UND` mass.
#[must_use]
pub fn dynamic_abstention_mass(
    inputs: AbstentionInputs,
    config: &DynamicAbstentionConfig,
) -> AbstentionOutcome {
    let pressure = config.weight_unresolved_pairs * inputs.unresolved_pair_ratio.clamp(0.0, 1.0)
        + config.weight_contradiction_density * inputs.contradiction_density.clamp(0.0, 1.0)
        + config.weight_non_discriminative * inputs.non_discriminative_density.clamp(0.0, 1.0)
        + config.weight_frame_inadequacy * inputs.frame_inadequacy.clamp(0.0, 1.0);
    AbstentionOutcome {
        pressure,
        mass: pressure.clamp(config.min_mass, config.max_mass),
    }
}

/// VOI-lite slot priority: `(1 - k)` plus a leverage bonus for slots
/// that have never been evaluated. With `lambda_voi = 0` this reduces
/// to lowest-`k`-first.
#[must_use]
pub fn voi_priority(k: f64, unevaluated: bool, impact: f64, lambda_voi: f64) -> f64 {
    let bonus = if unevaluated {
        lambda_voi * impact.clamp(0.0, 1.0)
    } else {
        0.0
    };
    (1.0 - k) + bonus
}

#[cfg(test)]
mod tests {
    use cw_model::{DecompositionType, EnforcementBranch, Role, Rubric};

    use super::{
        AbsorberInputs, AbstentionInputs, ChildAggregate, ChildConfidence, aggregate_slot, base_k,
        clamped_multiplier, conservative_delta, contradiction_floor, damp, dynamic_abstention_mass,
        enforce_absorbers, propagate_parent_k,
    };

    fn rubric(a: u8, b: u8, c: u8, d: u8) -> Rubric {
        Rubric::new(a, b, c, d).expect("valid rubric")
    }

    #[test]
    fn rubric_anchor_table_is_exact() {
        assert!((base_k(&rubric(1, 1, 0, 0)).k - 0.35).abs() < 1e-12);
        assert!((base_k(&rubric(1, 1, 1, 1)).k - 0.55).abs() < 1e-12);
        assert!((base_k(&rubric(2, 2, 1, 1)).k - 0.75).abs() < 1e-12);
        assert!((base_k(&rubric(2, 2, 2, 2)).k - 0.90).abs() < 1e-12);
    }

    #[test]
    fn rubric_odd_totals_interpolate_linearly() {
        assert!((base_k(&rubric(1, 1, 1, 0)).k - 0.45).abs() < 1e-12);
        assert!((base_k(&rubric(2, 2, 1, 0)).k - 0.55).abs() < 1e-12);
    }

    #[test]
    fn zero_score_guardrail_caps_k() {
        let derived = base_k(&rubric(2, 2, 2, 0));
        assert!(derived.guardrail);
        assert!(derived.k <= 0.55);
    }

    #[test]
    fn and_propagation_takes_minimum_child_k() {
        let children = vec![
            ChildConfidence {
                key: "a".to_owned(),
                p: 0.9,
                k: 0.75,
                guardrail: false,
                unscoped: false,
            },
            ChildConfidence {
                key: "b".to_owned(),
                p: 0.4,
                k: 0.35,
                guardrail: true,
                unscoped: false,
            },
        ];
        let derived = propagate_parent_k(DecompositionType::And, &children);
        assert!((derived.k - 0.35).abs() < 1e-12);
        assert!(derived.guardrail);
    }

    #[test]
    fn or_propagation_follows_the_max_p_child() {
        let children = vec![
            ChildConfidence {
                key: "a".to_owned(),
                p: 0.8,
                k: 0.55,
                guardrail: true,
                unscoped: false,
            },
            ChildConfidence {
                key: "b".to_owned(),
                p: 0.3,
                k: 0.90,
                guardrail: false,
                unscoped: false,
            },
        ];
        let derived = propagate_parent_k(DecompositionType::Or, &children);
        assert!((derived.k - 0.55).abs() < 1e-12);
        assert!(derived.guardrail);
    }

    #[test]
    fn unscoped_child_caps_parent_k() {
        let children = vec![
            ChildConfidence {
                key: "a".to_owned(),
                p: 0.9,
                k: 0.90,
                guardrail: false,
                unscoped: false,
            },
            ChildConfidence {
                key: "b".to_owned(),
                p: 0.9,
                k: 0.90,
                guardrail: false,
                unscoped: true,
            },
        ];
        let derived = propagate_parent_k(DecompositionType::And, &children);
        assert!(derived.k <= 0.40);
    }

    #[test]
    fn conservative_delta_caps_movement_without_evidence() {
        let outcome = conservative_delta(1.0, 0.20, false);
        assert!((outcome.p - 0.95).abs() < 1e-12);
        assert!(outcome.enforced);
    }

    #[test]
    fn evidence_allows_full_movement() {
        let outcome = conservative_delta(1.0, 0.20, true);
        assert!((outcome.p - 0.20).abs() < 1e-12);
        assert!(!outcome.enforced);
    }

    #[test]
    fn contradiction_enforces_minimum_penalty() {
        let outcome = contradiction_floor(0.9, 0.85);
        assert!((outcome.p - 0.65).abs() < 1e-12);
        assert!(outcome.enforced);

        let deep_cut = contradiction_floor(0.9, 0.1);
        assert!((deep_cut.p - 0.1).abs() < 1e-12);
        assert!(!deep_cut.enforced);
    }

    #[test]
    fn soft_and_blends_min_and_product() {
        let children = vec![
            ChildAggregate {
                key: "a".to_owned(),
                p: 0.5,
                assessed: true,
                role: Role::Nec,
            },
            ChildAggregate {
                key: "b".to_owned(),
                p: 0.5,
                assessed: true,
                role: Role::Nec,
            },
        ];
        let outcome =
            aggregate_slot(DecompositionType::And, 0.20, &children).expect("assessed children");
        assert!((outcome.m - 0.30).abs() < 1e-12);

        let children = vec![
            ChildAggregate {
                key: "a".to_owned(),
                p: 0.7,
                assessed: true,
                role: Role::Nec,
            },
            ChildAggregate {
                key: "b".to_owned(),
                p: 0.9,
                assessed: true,
                role: Role::Nec,
            },
        ];
        let outcome =
            aggregate_slot(DecompositionType::And, 0.80, &children).expect("assessed children");
        assert!((outcome.m - 0.686).abs() < 1e-12);
    }

    #[test]
    fn unassessed_nec_children_do_not_move_the_aggregate() {
        let mut children = vec![
            ChildAggregate {
                key: "a".to_owned(),
                p: 0.5,
                assessed: true,
                role: Role::Nec,
            },
            ChildAggregate {
                key: "b".to_owned(),
                p: 0.5,
                assessed: false,
                role: Role::Nec,
            },
        ];
        let baseline = aggregate_slot(DecompositionType::And, 0.0, &children)
            .expect("one assessed child")
            .m;
        children.push(ChildAggregate {
            key: "c".to_owned(),
            p: 0.5,
            assessed: false,
            role: Role::Nec,
        });
        let widened = aggregate_slot(DecompositionType::And, 0.0, &children)
            .expect("one assessed child")
            .m;
        assert!((baseline - widened).abs() < 1e-12);
    }

    #[test]
    fn fully_unassessed_slot_keeps_its_own_probability() {
        let children = vec![ChildAggregate {
            key: "a".to_owned(),
            p: 0.5,
            assessed: false,
            role: Role::Nec,
        }];
        assert!(aggregate_slot(DecompositionType::And, 0.2, &children).is_none());
    }

    #[test]
    fn evid_children_never_raise_an_or_slot() {
        let children = vec![
            ChildAggregate {
                key: "a".to_owned(),
                p: 0.3,
                assessed: true,
                role: Role::Nec,
            },
            ChildAggregate {
                key: "b".to_owned(),
                p: 0.99,
                assessed: true,
                role: Role::Evid,
            },
        ];
        let outcome =
            aggregate_slot(DecompositionType::Or, 0.0, &children).expect("assessed child");
        assert!((outcome.m - 0.3).abs() < 1e-12);
    }

    #[test]
    fn multiplier_clamp_bounds_extreme_updates() {
        assert!((clamped_multiplier(0.5, 1.0, 3.0) - 0.5).abs() < 1e-12);
        let floored = clamped_multiplier(0.0, 1.0, 3.0);
        assert!((floored - (-3.0_f64).exp()).abs() < 1e-12);
        assert!(clamped_multiplier(1.0, 1.0, 3.0) <= 1.0);
    }

    #[test]
    fn damping_blends_previous_and_proposed_mass() {
        assert!((damp(0.30, 0.5, 0.1) - 0.17).abs() < 1e-12);
        assert!((damp(0.0, 0.5, 0.1) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn absorber_slack_branch_splits_by_gamma_ratio() {
        let outcome = enforce_absorbers(AbsorberInputs {
            named_sum: 0.7,
            noa_current: Some(0.1),
            gamma_noa: 0.10,
            gamma_und: 0.10,
            dynamic_und_mass: None,
        });
        assert_eq!(outcome.branch, EnforcementBranch::SlackToAbsorbers);
        assert!((outcome.named_scale - 1.0).abs() < 1e-12);
        assert!((outcome.noa_mass - 0.15).abs() < 1e-12);
        assert!((outcome.und_mass - 0.15).abs() < 1e-12);
    }

    #[test]
    fn absorber_overflow_branch_rescales_named_mass() {
        let outcome = enforce_absorbers(AbsorberInputs {
            named_sum: 1.2,
            noa_current: Some(0.1),
            gamma_noa: 0.10,
            gamma_und: 0.10,
            dynamic_und_mass: None,
        });
        assert_eq!(outcome.branch, EnforcementBranch::RescaleNamed);
        assert!((outcome.named_scale - (0.8 / 1.2)).abs() < 1e-12);
        assert!((outcome.noa_mass - 0.10).abs() < 1e-12);
        assert!((outcome.und_mass - 0.10).abs() < 1e-12);
        let total = 1.2 * outcome.named_scale + outcome.noa_mass + outcome.und_mass;
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn dynamic_abstention_sets_und_before_redistribution() {
        let outcome = enforce_absorbers(AbsorberInputs {
            named_sum: 0.8,
            noa_current: Some(0.1),
            gamma_noa: 0.10,
            gamma_und: 0.10,
            dynamic_und_mass: Some(0.25),
        });
        assert!((outcome.und_mass - 0.25).abs() < 1e-12);
        let total = 0.8 * outcome.named_scale + outcome.noa_mass + outcome.und_mass;
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn abstention_pressure_is_clamped_to_band() {
        let config = cw_model::DynamicAbstentionConfig {
            enabled: true,
            ..Default::default()
        };
        let calm = dynamic_abstention_mass(
            AbstentionInputs {
                unresolved_pair_ratio: 0.0,
                contradiction_density: 0.0,
                non_discriminative_density: 0.0,
                frame_inadequacy: 0.0,
            },
            &config,
        );
        assert!((calm.mass - config.min_mass).abs() < 1e-12);

        let saturated = dynamic_abstention_mass(
            AbstentionInputs {
                unresolved_pair_ratio: 1.0,
                contradiction_density: 1.0,
                non_discriminative_density: 1.0,
                frame_inadequacy: 1.0,
            },
            &config,
        );
        assert!((saturated.mass - config.max_mass).abs() < 1e-12);
        assert!((saturated.pressure - 1.0).abs() < 1e-12);
    }
}
