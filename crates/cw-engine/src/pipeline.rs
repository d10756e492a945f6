//! Ledger update pipeline: materializing decompositions and applying
//! enforced evaluations through aggregation, multiplier, damping, and
//! absorber enforcement. Probabilities and confidences mutate only
//! here.

use cw_canon::CanonicalId;
use cw_model::{
    AnomalyKind, Config, DecompositionStructure, DecompositionType, EnforcementBranch,
    EvaluationOutcome, HypothesisSet, ModelError, Node, NodeId, Role, RootStatus, UNSCOPED_K_CAP,
};
use cw_policy::{
    AbsorberInputs, AggregateOutcome, ChildAggregate, ChildConfidence, base_k, clamped_multiplier,
    compositional_regularizer, damp, enforce_absorbers, propagate_parent_k,
};
use serde::{Deserialize, Serialize};

use crate::enforce::EnforcedEvaluation;

/// Node addressed by the scheduler: a required slot, or one child
/// beneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationTarget {
    pub root: CanonicalId,
    pub slot: String,
    pub child: Option<String>,
}

impl EvaluationTarget {
    #[must_use]
    pub fn key(&self, display_id: &str) -> String {
        match &self.child {
            Some(child) => format!("{display_id}:{}:{child}", self.slot),
            None => format!("{display_id}:{}", self.slot),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationTrail {
    pub slot: String,
    pub decomposition: DecompositionType,
    pub coupling: f64,
    pub outcome: AggregateOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LedgerTrail {
    pub p_prev: f64,
    pub multiplier_raw: f64,
    pub multiplier_clamped: f64,
    pub regularizer: f64,
    pub p_prop: f64,
    pub alpha: f64,
    pub p_new: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbsorberTrail {
    pub branch: EnforcementBranch,
    pub named_sum_before: f64,
    pub named_sum_after: f64,
    pub noa_mass: f64,
    pub und_mass: f64,
}

/// Everything the session needs to audit one ledger update.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateTrail {
    pub k_derived: f64,
    pub guardrail: bool,
    pub aggregation: Option<AggregationTrail>,
    pub ledger: LedgerTrail,
    pub absorber: AbsorberTrail,
    pub anomalies: Vec<(AnomalyKind, String)>,
}

/// Materialize template slots for a root from a decomposition
/// structure. Parts outside the required template are ignored so the
/// shared-slot-set invariant holds. Returns the slot keys created.
pub fn scope_root(
    set: &mut HypothesisSet,
    root_id: &CanonicalId,
    structure: &DecompositionStructure,
    template: &[String],
    provenance: impl Into<String>,
) -> Result<Vec<String>, ModelError> {
    let mut materialized = Vec::new();
    for slot_key in template {
        let Some(part) = structure.parts.iter().find(|part| part.key == *slot_key) else {
            continue;
        };
        if set.root(root_id)?.obligations.contains_key(slot_key) {
            continue;
        }
        let node_id = set.alloc_node(Node::new(part.statement.clone(), part.role, None));
        let root = set.root_mut(root_id)?;
        root.obligations.insert(slot_key.clone(), node_id);
        materialized.push(slot_key.clone());
    }

    let root = set.root_mut(root_id)?;
    root.scoping_provenance = Some(provenance.into());
    let missing: Vec<&String> = template
        .iter()
        .filter(|slot| !root.obligations.contains_key(*slot))
        .collect();
    if missing.is_empty() {
        root.status = RootStatus::Scoped;
    } else {
        root.status = RootStatus::Unscoped;
        root.k_root = root.k_root.min(UNSCOPED_K_CAP);
    }
    Ok(materialized)
}

/// Record a scoped decomposition failure: the root stays unscoped and
/// its confidence is capped.
pub fn mark_root_unscoped(
    set: &mut HypothesisSet,
    root_id: &CanonicalId,
    reason: impl Into<String>,
) -> Result<(), ModelError> {
    let root = set.root_mut(root_id)?;
    root.status = RootStatus::Unscoped;
    root.k_root = root.k_root.min(UNSCOPED_K_CAP);
    root.scoping_provenance = Some(reason.into());
    Ok(())
}

/// Materialize children beneath a required slot. Returns the child keys
/// created plus any coupling anomaly.
pub fn scope_slot(
    set: &mut HypothesisSet,
    root_id: &CanonicalId,
    slot_key: &str,
    structure: &DecompositionStructure,
) -> Result<(Vec<String>, Vec<(AnomalyKind, String)>), ModelError> {
    let slot_id = slot_node_id(set, root_id, slot_key)?;
    let mut anomalies = Vec::new();

    let coupling = if (0.0..=1.0).contains(&structure.coupling) {
        structure.coupling
    } else {
        anomalies.push((
            AnomalyKind::CouplingOutOfRange,
            format!("coupling {} coerced into [0, 1]", structure.coupling),
        ));
        structure.coupling.clamp(0.0, 1.0)
    };

    let mut materialized = Vec::new();
    for part in &structure.parts {
        if set.node(slot_id)?.children.contains_key(&part.key) {
            continue;
        }
        let child = set.alloc_node(Node::new(part.statement.clone(), part.role, Some(slot_id)));
        set.node_mut(slot_id)?
            .children
            .insert(part.key.clone(), child);
        materialized.push(part.key.clone());
    }

    let slot = set.node_mut(slot_id)?;
    slot.decomposition = Some(structure.decomposition);
    slot.coupling = coupling;

    // Parent propagation happens on decomposition as well as on child
    // evaluation: fresh children reopen the slot at their initial
    // confidence.
    propagate_slot_confidence(set, slot_id)?;
    recompute_root_k(set, root_id)?;
    Ok((materialized, anomalies))
}

fn propagate_slot_confidence(set: &mut HypothesisSet, slot_id: NodeId) -> Result<(), ModelError> {
    let Some(decomposition) = set.node(slot_id)?.decomposition else {
        return Ok(());
    };
    let child_ids: Vec<NodeId> = set.node(slot_id)?.children.values().copied().collect();
    if child_ids.is_empty() {
        return Ok(());
    }

    let mut confidences = Vec::with_capacity(child_ids.len());
    for child_id in child_ids {
        let child = set.node(child_id)?;
        confidences.push((
            child.canonical_id.clone(),
            ChildConfidence {
                key: child.canonical_id.short().to_owned(),
                p: child.p,
                k: child.k,
                guardrail: child.guardrail,
                unscoped: child.role == Role::Unscoped,
            },
        ));
    }
    confidences.sort_by(|a, b| a.0.cmp(&b.0));
    let ordered: Vec<ChildConfidence> = confidences.into_iter().map(|(_, c)| c).collect();
    let derived = propagate_parent_k(decomposition, &ordered);

    let slot = set.node_mut(slot_id)?;
    slot.k = derived.k;
    slot.guardrail = derived.guardrail;
    Ok(())
}

pub fn slot_node_id(
    set: &HypothesisSet,
    root_id: &CanonicalId,
    slot_key: &str,
) -> Result<NodeId, ModelError> {
    let root = set.root(root_id)?;
    root.obligations
        .get(slot_key)
        .copied()
        .ok_or_else(|| ModelError::UnknownSlot {
            root: root_id.clone(),
            slot: slot_key.to_owned(),
        })
}

pub fn resolve_target(
    set: &HypothesisSet,
    target: &EvaluationTarget,
) -> Result<NodeId, ModelError> {
    let slot_id = slot_node_id(set, &target.root, &target.slot)?;
    match &target.child {
        None => Ok(slot_id),
        Some(child_key) => set
            .node(slot_id)?
            .children
            .get(child_key)
            .copied()
            .ok_or_else(|| ModelError::UnknownChild {
                slot: target.slot.clone(),
                child: child_key.clone(),
            }),
    }
}

/// Write an enforced evaluation into the arena and push the change
/// through aggregation, the root multiplier, damping, and absorber
/// enforcement. `p_base` is the ledger mass at the moment of update.
pub fn apply_evaluation(
    set: &mut HypothesisSet,
    target: &EvaluationTarget,
    enforced: &EnforcedEvaluation,
    outcome: &EvaluationOutcome,
    config: &Config,
    dynamic_und: Option<f64>,
) -> Result<UpdateTrail, ModelError> {
    let node_id = resolve_target(set, target)?;
    let mut anomalies = Vec::new();

    {
        let node = set.node_mut(node_id)?;
        node.p = enforced.p_stored;
        node.evaluated = true;
        node.entailment = outcome.entailment;
        node.non_discriminative = enforced.non_discriminative;
        for evidence_id in &outcome.evidence_ids {
            if !node.evidence_refs.contains(evidence_id) {
                node.evidence_refs.push(evidence_id.clone());
            }
        }
        for record in &enforced.accepted {
            node.discriminator_ids.push(record.id.clone());
        }
        if let Some(rubric) = outcome.rubric {
            let derived = base_k(&rubric);
            node.rubric = Some(rubric);
            node.k = derived.k;
            node.guardrail = derived.guardrail;
        }
    }
    let k_derived = set.node(node_id)?.k;
    let guardrail = set.node(node_id)?.guardrail;

    // Child updates propagate to their slot before the root multiplier.
    let aggregation = match target.child {
        Some(_) => aggregate_parent_slot(set, &target.root, &target.slot)?,
        None => None,
    };

    recompute_root_k(set, &target.root)?;

    let slot_order: Vec<NodeId> = set
        .root(&target.root)?
        .obligations
        .values()
        .copied()
        .collect();
    let mut multiplier_raw = 1.0_f64;
    for slot_id in slot_order {
        multiplier_raw *= set.node(slot_id)?.p;
    }
    let multiplier_clamped = clamped_multiplier(multiplier_raw, config.beta, config.weight_clamp);
    let regularizer = compositional_regularizer(set.root(&target.root)?.story_cardinality);

    let p_prev = set.root(&target.root)?.p_ledger;
    let p_prop = p_prev * multiplier_clamped * regularizer;
    let p_new = damp(config.alpha, p_prev, p_prop);
    set.root_mut(&target.root)?.p_ledger = p_new;

    let named_sum_before = set.named_sum();
    let absorber_outcome = enforce_absorbers(AbsorberInputs {
        named_sum: named_sum_before,
        noa_current: set.noa.map(|a| a.mass),
        gamma_noa: config.gamma_noa,
        gamma_und: config.gamma_und,
        dynamic_und_mass: dynamic_und,
    });

    if (absorber_outcome.named_scale - 1.0).abs() > f64::EPSILON {
        let ids: Vec<CanonicalId> = set.root_ids().cloned().collect();
        for id in ids {
            let root = set.root_mut(&id)?;
            root.p_ledger *= absorber_outcome.named_scale;
        }
    }
    if let Some(noa) = set.noa.as_mut() {
        noa.mass = absorber_outcome.noa_mass;
    }
    set.und.mass = absorber_outcome.und_mass;
    let named_sum_after = set.named_sum();

    if set.check_invariants().is_err() {
        let residual = 1.0 - set.ledger_sum();
        set.und.mass += residual;
        anomalies.push((
            AnomalyKind::LedgerRepaired,
            format!("ledger drift {residual:e} folded into the underdetermined absorber"),
        ));
        set.check_invariants()?;
    }

    Ok(UpdateTrail {
        k_derived,
        guardrail,
        aggregation,
        ledger: LedgerTrail {
            p_prev,
            multiplier_raw,
            multiplier_clamped,
            regularizer,
            p_prop,
            alpha: config.alpha,
            p_new,
        },
        absorber: AbsorberTrail {
            branch: absorber_outcome.branch,
            named_sum_before,
            named_sum_after,
            noa_mass: set.noa.map_or(0.0, |a| a.mass),
            und_mass: set.und.mass,
        },
        anomalies,
    })
}

fn aggregate_parent_slot(
    set: &mut HypothesisSet,
    root_id: &CanonicalId,
    slot_key: &str,
) -> Result<Option<AggregationTrail>, ModelError> {
    let slot_id = slot_node_id(set, root_id, slot_key)?;
    let Some(decomposition) = set.node(slot_id)?.decomposition else {
        return Ok(None);
    };
    let coupling = set.node(slot_id)?.coupling;

    let child_ids: Vec<(String, NodeId)> = set
        .node(slot_id)?
        .children
        .iter()
        .map(|(key, id)| (key.clone(), *id))
        .collect();

    let mut aggregates = Vec::with_capacity(child_ids.len());
    let mut confidences = Vec::with_capacity(child_ids.len());
    for (key, child_id) in &child_ids {
        let child = set.node(*child_id)?;
        aggregates.push(ChildAggregate {
            key: key.clone(),
            p: child.p,
            assessed: child.evaluated,
            role: child.role,
        });
        confidences.push((
            child.canonical_id.clone(),
            ChildConfidence {
                key: key.clone(),
                p: child.p,
                k: child.k,
                guardrail: child.guardrail,
                unscoped: child.role == Role::Unscoped,
            },
        ));
    }

    // Confidence propagation ties break on canonical id.
    confidences.sort_by(|a, b| a.0.cmp(&b.0));
    let ordered: Vec<ChildConfidence> = confidences.into_iter().map(|(_, c)| c).collect();
    let parent_k = propagate_parent_k(decomposition, &ordered);

    let slot = set.node_mut(slot_id)?;
    slot.k = parent_k.k;
    slot.guardrail = parent_k.guardrail;

    let Some(outcome) = cw_policy::aggregate_slot(decomposition, coupling, &aggregates) else {
        return Ok(None);
    };
    set.node_mut(slot_id)?.p = outcome.m;

    Ok(Some(AggregationTrail {
        slot: slot_key.to_owned(),
        decomposition,
        coupling,
        outcome,
    }))
}

pub fn recompute_root_k(set: &mut HypothesisSet, root_id: &CanonicalId) -> Result<(), ModelError> {
    let root = set.root(root_id)?;
    let scoped = root.status == RootStatus::Scoped;
    let slot_ids: Vec<NodeId> = root.obligations.values().copied().collect();

    let mut k = f64::INFINITY;
    for slot_id in &slot_ids {
        k = k.min(set.node(*slot_id)?.k);
    }
    if !k.is_finite() {
        k = cw_model::INITIAL_K;
    }
    if !scoped {
        k = k.min(UNSCOPED_K_CAP);
    }
    set.root_mut(root_id)?.k_root = k;
    Ok(())
}

#[cfg(test)]
mod tests {
    use cw_model::{
        Config, DecompositionStructure, DecompositionType, Entailment, EvaluationOutcome,
        HypothesisSet, PartSpec, Role, RootSpec, RootStatus, Rubric,
    };

    use crate::enforce::EnforcedEvaluation;

    use super::{EvaluationTarget, apply_evaluation, scope_root, scope_slot};

    fn one_slot_config() -> Config {
        let mut config = Config::default();
        config.template_slots = vec!["mechanism".to_owned()];
        config
    }

    fn scoped_set(config: &Config) -> (HypothesisSet, cw_canon::CanonicalId) {
        let specs = vec![
            RootSpec::new("H1", "Alpha mechanism", "not beta"),
            RootSpec::new("H2", "Beta mechanism", "not alpha"),
        ];
        let mut set = HypothesisSet::bootstrap(&specs, config).expect("bootstrap");
        let alpha = cw_canon::CanonicalId::of("Alpha mechanism");
        let structure = DecompositionStructure {
            decomposition: DecompositionType::And,
            coupling: 0.2,
            parts: vec![PartSpec {
                key: "mechanism".to_owned(),
                statement: "alpha pathway was active".to_owned(),
                role: Role::Nec,
            }],
        };
        scope_root(&mut set, &alpha, &structure, &config.template_slots, "test")
            .expect("scope");
        (set, alpha)
    }

    fn enforced(p: f64) -> EnforcedEvaluation {
        EnforcedEvaluation {
            p_stored: p,
            accepted: Vec::new(),
            non_discriminative: false,
            notes: Vec::new(),
        }
    }

    fn outcome(p: f64) -> EvaluationOutcome {
        EvaluationOutcome {
            p,
            rubric: Some(Rubric::new(2, 2, 2, 2).expect("rubric")),
            evidence_ids: vec!["e1".to_owned()],
            discriminators: Vec::new(),
            non_discriminative: false,
            entailment: Entailment::Supports,
        }
    }

    #[test]
    fn scoping_alone_leaves_the_ledger_unchanged() {
        let config = one_slot_config();
        let (set, _) = scoped_set(&config);
        let sum = set.ledger_sum();
        assert!((sum - 1.0).abs() < 1e-9);
        for root in set.roots() {
            assert!((root.p_ledger - 0.4).abs() < 1e-9);
        }
    }

    #[test]
    fn evaluation_moves_mass_through_damping_and_absorbers() {
        let config = one_slot_config();
        let (mut set, alpha) = scoped_set(&config);
        let target = EvaluationTarget {
            root: alpha.clone(),
            slot: "mechanism".to_owned(),
            child: None,
        };
        let trail = apply_evaluation(
            &mut set,
            &target,
            &enforced(0.9),
            &outcome(0.9),
            &config,
            None,
        )
        .expect("update");

        // p_prop = 0.4 * 0.9, damped with alpha = 0.3.
        assert!((trail.ledger.p_prop - 0.36).abs() < 1e-12);
        assert!((trail.ledger.p_new - 0.372).abs() < 1e-12);
        set.check_invariants().expect("ledger sums to one");
        assert!((set.root(&alpha).expect("root").k_root - 0.90).abs() < 1e-12);
    }

    #[test]
    fn child_evaluation_reaggregates_the_slot() {
        let config = one_slot_config();
        let (mut set, alpha) = scoped_set(&config);
        let structure = DecompositionStructure {
            decomposition: DecompositionType::And,
            coupling: 0.2,
            parts: vec![
                PartSpec {
                    key: "supply".to_owned(),
                    statement: "reagent supply was present".to_owned(),
                    role: Role::Nec,
                },
                PartSpec {
                    key: "trigger".to_owned(),
                    statement: "trigger condition occurred".to_owned(),
                    role: Role::Nec,
                },
            ],
        };
        let (children, anomalies) =
            scope_slot(&mut set, &alpha, "mechanism", &structure).expect("scope slot");
        assert_eq!(children.len(), 2);
        assert!(anomalies.is_empty());

        let target = EvaluationTarget {
            root: alpha.clone(),
            slot: "mechanism".to_owned(),
            child: Some("supply".to_owned()),
        };
        let trail = apply_evaluation(
            &mut set,
            &target,
            &enforced(0.5),
            &outcome(0.5),
            &config,
            None,
        )
        .expect("update");

        let aggregation = trail.aggregation.expect("slot reaggregated");
        // One assessed child at 0.5, one unassessed treated as 1.0:
        // m = 0.2 * 0.5 + 0.8 * 0.5 = 0.5.
        assert!((aggregation.outcome.m - 0.5).abs() < 1e-12);
    }

    #[test]
    fn coupling_out_of_range_is_coerced_with_anomaly() {
        let config = one_slot_config();
        let (mut set, alpha) = scoped_set(&config);
        let structure = DecompositionStructure {
            decomposition: DecompositionType::Or,
            coupling: 1.7,
            parts: vec![PartSpec {
                key: "path".to_owned(),
                statement: "direct pathway".to_owned(),
                role: Role::Nec,
            }],
        };
        let (_, anomalies) =
            scope_slot(&mut set, &alpha, "mechanism", &structure).expect("scope slot");
        assert_eq!(anomalies.len(), 1);
    }

    #[test]
    fn partial_template_leaves_root_unscoped_and_capped() {
        let mut config = Config::default();
        config.template_slots = vec!["mechanism".to_owned(), "availability".to_owned()];
        let specs = vec![
            RootSpec::new("H1", "Alpha mechanism", "not beta"),
            RootSpec::new("H2", "Beta mechanism", "not alpha"),
        ];
        let mut set = HypothesisSet::bootstrap(&specs, &config).expect("bootstrap");
        let alpha = cw_canon::CanonicalId::of("Alpha mechanism");
        let structure = DecompositionStructure {
            decomposition: DecompositionType::And,
            coupling: 0.0,
            parts: vec![PartSpec {
                key: "mechanism".to_owned(),
                statement: "alpha pathway was active".to_owned(),
                role: Role::Nec,
            }],
        };
        scope_root(&mut set, &alpha, &structure, &config.template_slots, "test")
            .expect("scope");
        let root = set.root(&alpha).expect("root");
        assert_eq!(root.status, RootStatus::Unscoped);
        assert!(root.k_root <= 0.40);
        assert_eq!(root.missing_slots(&config.template_slots), vec![
            "availability".to_owned()
        ]);
    }
}
