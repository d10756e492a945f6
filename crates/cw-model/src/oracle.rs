//! Wire types shared with the evaluator and decomposer ports, and the
//! typed discriminator vocabulary the adjudication subsystem consumes.

use std::fmt;

use cw_canon::CanonicalId;
use serde::{Deserialize, Serialize};

use crate::{DecompositionType, Entailment, Role, Rubric};

/// Unordered pair of named roots, stored canonically (`left < right`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    left: CanonicalId,
    right: CanonicalId,
}

impl PairKey {
    #[must_use]
    pub fn new(a: CanonicalId, b: CanonicalId) -> Self {
        if a <= b {
            Self { left: a, right: b }
        } else {
            Self { left: b, right: a }
        }
    }

    #[must_use]
    pub fn left(&self) -> &CanonicalId {
        &self.left
    }

    #[must_use]
    pub fn right(&self) -> &CanonicalId {
        &self.right
    }

    #[must_use]
    pub fn contains(&self, id: &CanonicalId) -> bool {
        self.left == *id || self.right == *id
    }

    #[must_use]
    pub fn side_of(&self, id: &CanonicalId) -> Option<Direction> {
        if self.left == *id {
            Some(Direction::Left)
        } else if self.right == *id {
            Some(Direction::Right)
        } else {
            None
        }
    }

    #[must_use]
    pub fn side(&self, direction: Direction) -> &CanonicalId {
        match direction {
            Direction::Left => &self.left,
            Direction::Right => &self.right,
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.left.short(), self.right.short())
    }
}

/// Which side of a canonical pair a record favors or targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    #[must_use]
    pub fn flipped(self) -> Self {
        match self {
            Self::Left => Self::Right,
            Self::Right => Self::Left,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairVerdict {
    FavorsLeft,
    FavorsRight,
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscriminatorKind {
    Absence,
    Support,
    Contradiction,
}

/// Typed assertion that an evidence item contrastively favors one root of
/// a pair over the other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorRecord {
    pub id: String,
    pub pair: PairKey,
    pub favors: Direction,
    pub kind: DiscriminatorKind,
    pub evidence_ids: Vec<String>,
    pub quote: Option<String>,
}

/// Immutable view of a node handed to the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Stable key `<root-short>:<slot>` or `<root-short>:<slot>:<child>`.
    pub key: String,
    pub canonical_id: CanonicalId,
    pub statement: String,
    pub role: Role,
    pub p: f64,
    pub k: f64,
    pub assumptions: Vec<String>,
}

/// Pair binding handed to the evaluator alongside a node snapshot.
///
/// Once a pair task is drawn this binding is authoritative, whether or
/// not the pair appears in the budget-pruned candidate catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContrastiveContext {
    pub pair: PairKey,
    pub target_side: Direction,
    /// Declared discriminator hint from the MECE certificate, if any.
    pub discriminator_hint: Option<String>,
}

/// What the decomposer is asked to expand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetSpec {
    Root {
        id: CanonicalId,
        statement: String,
        required_slots: Vec<String>,
    },
    Slot {
        root: CanonicalId,
        slot: String,
        statement: String,
    },
}

impl TargetSpec {
    #[must_use]
    pub fn target_id(&self) -> String {
        match self {
            Self::Root { id, .. } => id.to_string(),
            Self::Slot { root, slot, .. } => format!("{}:{slot}", root.short()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartSpec {
    pub key: String,
    pub statement: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionStructure {
    pub decomposition: DecompositionType,
    pub coupling: f64,
    pub parts: Vec<PartSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DecompositionOutcome {
    Structure(DecompositionStructure),
    Failure { reason: String },
}

/// Everything the evaluator returns for one paid evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub p: f64,
    pub rubric: Option<Rubric>,
    pub evidence_ids: Vec<String>,
    pub discriminators: Vec<DiscriminatorRecord>,
    pub non_discriminative: bool,
    pub entailment: Entailment,
}

#[cfg(test)]
mod tests {
    use cw_canon::CanonicalId;

    use super::{Direction, PairKey};

    #[test]
    fn pair_key_orders_sides_canonically() {
        let a = CanonicalId::of("alpha mechanism");
        let b = CanonicalId::of("beta mechanism");
        let forward = PairKey::new(a.clone(), b.clone());
        let reversed = PairKey::new(b.clone(), a.clone());
        assert_eq!(forward, reversed);
        assert!(forward.left() < forward.right());
    }

    #[test]
    fn side_of_resolves_membership() {
        let a = CanonicalId::of("alpha mechanism");
        let b = CanonicalId::of("beta mechanism");
        let c = CanonicalId::of("gamma mechanism");
        let pair = PairKey::new(a.clone(), b.clone());
        let side_a = pair.side_of(&a).expect("member");
        assert_eq!(pair.side(side_a), &a);
        assert_eq!(pair.side_of(&c), None);
        assert_eq!(side_a.flipped().flipped(), side_a);
    }
}
