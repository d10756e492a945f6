#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use cw_canon::CanonicalId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod config;
pub mod event;
pub mod oracle;
pub mod request;

pub use config::{
    Config, ConfigError, DynamicAbstentionConfig, ProfileBundle, QuoteFidelityMode, ReasoningMode,
    WorldMode, resolve_profile,
};
pub use event::{
    AnomalyKind, AuditEvent, AuditPayload, EnforcementBranch, EventKind, GateIssue, GateIssueKind,
    RootMass,
};
pub use oracle::{
    ContrastiveContext, DecompositionOutcome, DecompositionStructure, Direction,
    DiscriminatorKind, DiscriminatorRecord, EvaluationOutcome, NodeSnapshot, PairKey, PairVerdict,
    PartSpec, TargetSpec,
};
pub use request::{
    EvidenceBundle, EvidenceItem, PairDeclaration, RootSpec, SessionRequest, ValidationReport,
};

/// Tolerance for ledger-sum invariant checks.
pub const LEDGER_TOLERANCE: f64 = 1e-9;

/// Initial probability for a node that has never been evaluated.
pub const INITIAL_NODE_P: f64 = 0.5;

/// Initial confidence for roots and freshly materialized nodes.
pub const INITIAL_K: f64 = 0.15;

/// Confidence cap applied to a root whose scoping failed or is incomplete.
pub const UNSCOPED_K_CAP: f64 = 0.40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Nec,
    Evid,
    Unscoped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecompositionType {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entailment {
    Supports,
    Contradicts,
    Neutral,
}

/// Four evaluation-quality scores, each in {0, 1, 2}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rubric {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
}

impl Rubric {
    pub fn new(a: u8, b: u8, c: u8, d: u8) -> Result<Self, ModelError> {
        let rubric = Self { a, b, c, d };
        if [a, b, c, d].iter().any(|score| *score > 2) {
            return Err(ModelError::RubricScoreOutOfRange { rubric });
        }
        Ok(rubric)
    }

    #[must_use]
    pub fn total(&self) -> u8 {
        self.a + self.b + self.c + self.d
    }

    #[must_use]
    pub fn any_zero(&self) -> bool {
        self.a == 0 || self.b == 0 || self.c == 0 || self.d == 0
    }
}

/// A slot or a child within a slot, stored in the set-owned arena.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub canonical_id: CanonicalId,
    pub statement: String,
    pub parent: Option<NodeId>,
    pub role: Role,
    pub p: f64,
    pub k: f64,
    pub rubric: Option<Rubric>,
    pub evidence_refs: Vec<String>,
    pub discriminator_ids: Vec<String>,
    pub decomposition: Option<DecompositionType>,
    pub coupling: f64,
    pub children: BTreeMap<String, NodeId>,
    pub assumptions: Vec<String>,
    pub entailment: Entailment,
    pub non_discriminative: bool,
    pub guardrail: bool,
    pub evaluated: bool,
}

impl Node {
    #[must_use]
    pub fn new(statement: impl Into<String>, role: Role, parent: Option<NodeId>) -> Self {
        let statement = statement.into();
        Self {
            canonical_id: CanonicalId::of(&statement),
            statement,
            parent,
            role,
            p: INITIAL_NODE_P,
            k: INITIAL_K,
            rubric: None,
            evidence_refs: Vec::new(),
            discriminator_ids: Vec::new(),
            decomposition: None,
            coupling: 0.0,
            children: BTreeMap::new(),
            assumptions: Vec::new(),
            entailment: Entailment::Neutral,
            non_discriminative: false,
            guardrail: false,
            evaluated: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootStatus {
    Unscoped,
    Scoped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootHypothesis {
    pub display_id: String,
    pub statement: String,
    pub exclusion_clause: String,
    pub canonical_id: CanonicalId,
    pub p_ledger: f64,
    pub k_root: f64,
    pub status: RootStatus,
    pub obligations: BTreeMap<String, NodeId>,
    pub credits_spent: u64,
    pub scoping_provenance: Option<String>,
    pub story_cardinality: usize,
    pub components: Vec<String>,
    pub retired: bool,
}

impl RootHypothesis {
    #[must_use]
    pub fn from_spec(spec: &RootSpec) -> Self {
        Self {
            display_id: spec.display_id.clone(),
            statement: spec.statement.clone(),
            exclusion_clause: spec.exclusion_clause.clone(),
            canonical_id: CanonicalId::of(&spec.statement),
            p_ledger: 0.0,
            k_root: INITIAL_K,
            status: RootStatus::Unscoped,
            obligations: BTreeMap::new(),
            credits_spent: 0,
            scoping_provenance: None,
            story_cardinality: spec.story_cardinality.max(1),
            components: spec.components.clone(),
            retired: false,
        }
    }

    /// Required slots that have not been materialized yet.
    #[must_use]
    pub fn missing_slots(&self, template: &[String]) -> Vec<String> {
        template
            .iter()
            .filter(|slot| !self.obligations.contains_key(*slot))
            .cloned()
            .collect()
    }
}

/// Residual-mass carrier so named-root totals stay well-defined under
/// partial information.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Absorber {
    pub mass: f64,
    pub floor: f64,
}

/// Named roots plus absorbers, owning the node arena.
///
/// Invariants: ledger sums to 1.0 within [`LEDGER_TOLERANCE`], every mass
/// lies in [0, 1], the required slot set is identical across named roots,
/// and iteration over named roots follows canonical-id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisSet {
    roots: BTreeMap<CanonicalId, RootHypothesis>,
    nodes: Vec<Node>,
    pub noa: Option<Absorber>,
    pub und: Absorber,
    world: WorldMode,
}

impl HypothesisSet {
    /// Build the set from root specs, insert absorbers, and split the
    /// prior mass: each named root gets `(1 - gamma) / n`, where `gamma`
    /// is the total absorber prior for the configured world mode.
    pub fn bootstrap(specs: &[RootSpec], config: &Config) -> Result<Self, ModelError> {
        if specs.is_empty() {
            return Err(ModelError::EmptyHypothesisSet);
        }

        let mut roots = BTreeMap::new();
        for spec in specs {
            let root = RootHypothesis::from_spec(spec);
            let id = root.canonical_id.clone();
            if let Some(existing) = roots.insert(id.clone(), root) {
                return Err(ModelError::DuplicateCanonicalId {
                    display_id: existing.display_id,
                    canonical_id: id,
                });
            }
        }

        let gamma = match config.world {
            WorldMode::Open => config.gamma_noa + config.gamma_und,
            WorldMode::Closed => config.gamma_und,
        };
        if !(0.0..1.0).contains(&gamma) {
            return Err(ModelError::AbsorberPriorOutOfRange { gamma });
        }

        let named_share = (1.0 - gamma) / roots.len() as f64;
        for root in roots.values_mut() {
            root.p_ledger = named_share;
        }

        let noa = match config.world {
            WorldMode::Open => Some(Absorber {
                mass: config.gamma_noa,
                floor: config.gamma_noa,
            }),
            WorldMode::Closed => None,
        };
        let und = Absorber {
            mass: config.gamma_und,
            floor: config.gamma_und,
        };

        Ok(Self {
            roots,
            nodes: Vec::new(),
            noa,
            und,
            world: config.world,
        })
    }

    #[must_use]
    pub fn world(&self) -> WorldMode {
        self.world
    }

    /// Named roots in canonical-id order.
    pub fn roots(&self) -> impl Iterator<Item = &RootHypothesis> {
        self.roots.values()
    }

    pub fn root_ids(&self) -> impl Iterator<Item = &CanonicalId> {
        self.roots.keys()
    }

    #[must_use]
    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub fn root(&self, id: &CanonicalId) -> Result<&RootHypothesis, ModelError> {
        self.roots
            .get(id)
            .ok_or_else(|| ModelError::UnknownRoot { id: id.clone() })
    }

    pub fn root_mut(&mut self, id: &CanonicalId) -> Result<&mut RootHypothesis, ModelError> {
        self.roots
            .get_mut(id)
            .ok_or_else(|| ModelError::UnknownRoot { id: id.clone() })
    }

    /// Resolve a user-facing display id to the canonical id behind it.
    #[must_use]
    pub fn resolve_display(&self, display_id: &str) -> Option<&CanonicalId> {
        self.roots
            .values()
            .find(|root| root.display_id == display_id)
            .map(|root| &root.canonical_id)
    }

    pub fn alloc_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, ModelError> {
        self.nodes
            .get(id.0)
            .ok_or(ModelError::UnknownNode { index: id.0 })
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node, ModelError> {
        self.nodes
            .get_mut(id.0)
            .ok_or(ModelError::UnknownNode { index: id.0 })
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Named masses in canonical-id order.
    #[must_use]
    pub fn named_masses(&self) -> Vec<(CanonicalId, f64)> {
        self.roots
            .iter()
            .map(|(id, root)| (id.clone(), root.p_ledger))
            .collect()
    }

    #[must_use]
    pub fn named_sum(&self) -> f64 {
        self.roots.values().map(|root| root.p_ledger).sum()
    }

    #[must_use]
    pub fn ledger_sum(&self) -> f64 {
        self.named_sum() + self.noa.map_or(0.0, |a| a.mass) + self.und.mass
    }

    /// Full ledger snapshot in canonical order, absorbers last.
    #[must_use]
    pub fn ledger_snapshot(&self) -> BTreeMap<String, f64> {
        let mut snapshot: BTreeMap<String, f64> = self
            .roots
            .iter()
            .map(|(id, root)| (id.to_string(), root.p_ledger))
            .collect();
        if let Some(noa) = self.noa {
            snapshot.insert("h_noa".to_owned(), noa.mass);
        }
        snapshot.insert("h_und".to_owned(), self.und.mass);
        snapshot
    }

    pub fn check_invariants(&self) -> Result<(), ModelError> {
        let sum = self.ledger_sum();
        if (sum - 1.0).abs() > LEDGER_TOLERANCE {
            return Err(ModelError::LedgerDrift { sum });
        }
        for root in self.roots.values() {
            if !(0.0..=1.0).contains(&root.p_ledger) {
                return Err(ModelError::MassOutOfRange {
                    id: root.canonical_id.clone(),
                    mass: root.p_ledger,
                });
            }
        }
        let mut slot_sets: Option<Vec<String>> = None;
        for root in self.roots.values() {
            if root.status != RootStatus::Scoped {
                continue;
            }
            let slots: Vec<String> = root.obligations.keys().cloned().collect();
            match &slot_sets {
                None => slot_sets = Some(slots),
                Some(expected) if *expected != slots => {
                    return Err(ModelError::SlotSetMismatch {
                        id: root.canonical_id.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    CreditsExhausted,
    FrontierConfident,
    ClosureGatesUnmet,
    EpistemicallyExhausted,
    MeceCertificateFailed,
    PolicyConfigIncompatible,
    NoLegalOp,
    ContenderSpaceInvalid,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Decompose,
    Evaluate,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("hypothesis set must contain at least one named root")]
    EmptyHypothesisSet,
    #[error("root {display_id:?} collides on canonical id {canonical_id}")]
    DuplicateCanonicalId {
        display_id: String,
        canonical_id: CanonicalId,
    },
    #[error("unknown root {id}")]
    UnknownRoot { id: CanonicalId },
    #[error("node index {index} is outside the arena")]
    UnknownNode { index: usize },
    #[error("root {root} has no required slot {slot:?}")]
    UnknownSlot { root: CanonicalId, slot: String },
    #[error("slot {slot:?} has no child {child:?}")]
    UnknownChild { slot: String, child: String },
    #[error("ledger sum drifted to {sum}")]
    LedgerDrift { sum: f64 },
    #[error("mass {mass} for {id} is outside [0, 1]")]
    MassOutOfRange { id: CanonicalId, mass: f64 },
    #[error("root {id} diverges from the shared required slot set")]
    SlotSetMismatch { id: CanonicalId },
    #[error("absorber prior gamma={gamma} must lie in [0, 1)")]
    AbsorberPriorOutOfRange { gamma: f64 },
    #[error("rubric scores must each lie in {{0, 1, 2}}, got {rubric:?}")]
    RubricScoreOutOfRange { rubric: Rubric },
}

#[cfg(test)]
mod tests {
    use super::{Config, HypothesisSet, ModelError, Node, Role, RootSpec, Rubric};

    fn three_roots() -> Vec<RootSpec> {
        vec![
            RootSpec::new("H1", "Alpha mechanism", "not beta or gamma"),
            RootSpec::new("H2", "Beta mechanism", "not alpha or gamma"),
            RootSpec::new("H3", "Gamma mechanism", "not alpha or beta"),
        ]
    }

    #[test]
    fn bootstrap_splits_prior_mass_between_named_and_absorbers() {
        let config = Config::default();
        let set = HypothesisSet::bootstrap(&three_roots(), &config).expect("bootstrap");

        let expected_named = (1.0 - 0.20) / 3.0;
        for root in set.roots() {
            assert!((root.p_ledger - expected_named).abs() < 1e-12);
        }
        let absorber_total = set.noa.expect("open world has noa").mass + set.und.mass;
        assert!((absorber_total - 0.20).abs() < 1e-12);
        set.check_invariants().expect("invariants hold");
    }

    #[test]
    fn bootstrap_rejects_duplicate_canonical_ids() {
        let specs = vec![
            RootSpec::new("H1", "Alpha mechanism", "x"),
            RootSpec::new("H2", "  alpha   MECHANISM.", "y"),
        ];
        let err = HypothesisSet::bootstrap(&specs, &Config::default()).expect_err("collision");
        assert!(matches!(err, ModelError::DuplicateCanonicalId { .. }));
    }

    #[test]
    fn root_iteration_is_canonical_not_insertion_order() {
        let config = Config::default();
        let forward = HypothesisSet::bootstrap(&three_roots(), &config).expect("forward");
        let mut reversed_specs = three_roots();
        reversed_specs.reverse();
        let reversed = HypothesisSet::bootstrap(&reversed_specs, &config).expect("reversed");

        let forward_ids: Vec<_> = forward.root_ids().cloned().collect();
        let reversed_ids: Vec<_> = reversed.root_ids().cloned().collect();
        assert_eq!(forward_ids, reversed_ids);
    }

    #[test]
    fn closed_world_has_no_noa_absorber() {
        let mut config = Config::default();
        config.world = super::WorldMode::Closed;
        let set = HypothesisSet::bootstrap(&three_roots(), &config).expect("bootstrap");
        assert!(set.noa.is_none());
        set.check_invariants().expect("invariants hold");
    }

    #[test]
    fn arena_round_trips_nodes_by_index() {
        let config = Config::default();
        let mut set = HypothesisSet::bootstrap(&three_roots(), &config).expect("bootstrap");
        let id = set.alloc_node(Node::new("pump was available", Role::Nec, None));
        assert_eq!(set.node(id).expect("node").statement, "pump was available");
        set.node_mut(id).expect("node").p = 0.8;
        assert!((set.node(id).expect("node").p - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn rubric_rejects_scores_above_two() {
        assert!(Rubric::new(2, 2, 3, 0).is_err());
        let rubric = Rubric::new(2, 1, 2, 0).expect("valid");
        assert_eq!(rubric.total(), 5);
        assert!(rubric.any_zero());
    }
}
