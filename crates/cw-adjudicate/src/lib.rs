#![forbid(unsafe_code)]

//! Adjudication subsystem: typed discriminator records are validated
//! against the evidence bundle, folded into per-pair verdicts, and the
//! pair queue decides which contrast the next credit is spent on.

use std::collections::BTreeMap;

use cw_canon::CanonicalId;
use cw_model::{
    Config, Direction, DiscriminatorRecord, EvidenceBundle, PairKey, PairVerdict, RootStatus,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Minimum directional record count before a verdict may leave
/// `Unresolved`.
pub const MIN_DIRECTIONAL_COUNT: usize = 1;

/// Minimum count difference between the two directions for a verdict.
pub const MIN_DIRECTIONAL_MARGIN: i64 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscriminatorIssue {
    #[error("discriminator id is empty")]
    EmptyId,
    #[error("discriminator {id} targets pair {got} but the bound pair is {expected}")]
    PairMismatch {
        id: String,
        got: String,
        expected: String,
    },
    #[error("discriminator {id} references no evidence ids")]
    NoEvidence { id: String },
    #[error("discriminator {id} references unknown evidence id {evidence_id}")]
    UnknownEvidence { id: String, evidence_id: String },
    #[error("discriminator {id} reuses evidence {evidence_id} in the opposite direction")]
    ConflictingReuse { id: String, evidence_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictOutcome {
    pub verdict: PairVerdict,
    pub left_count: usize,
    pub right_count: usize,
    pub margin: i64,
}

/// Accepted discriminator records plus the per-evidence direction book
/// used to catch conflicting reuse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscriminatorLedger {
    records: Vec<DiscriminatorRecord>,
    directions: BTreeMap<(String, PairKey), Direction>,
}

impl DiscriminatorLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a typed record before acceptance. The bound pair from
    /// the active task is authoritative when present.
    pub fn validate(
        &self,
        record: &DiscriminatorRecord,
        bound_pair: Option<&PairKey>,
        evidence: &EvidenceBundle,
    ) -> Result<(), DiscriminatorIssue> {
        if record.id.trim().is_empty() {
            return Err(DiscriminatorIssue::EmptyId);
        }
        if let Some(expected) = bound_pair
            && record.pair != *expected
        {
            return Err(DiscriminatorIssue::PairMismatch {
                id: record.id.clone(),
                got: record.pair.to_string(),
                expected: expected.to_string(),
            });
        }
        if record.evidence_ids.is_empty() {
            return Err(DiscriminatorIssue::NoEvidence {
                id: record.id.clone(),
            });
        }
        for evidence_id in &record.evidence_ids {
            if !evidence.contains(evidence_id) {
                return Err(DiscriminatorIssue::UnknownEvidence {
                    id: record.id.clone(),
                    evidence_id: evidence_id.clone(),
                });
            }
            if let Some(prior) = self
                .directions
                .get(&(evidence_id.clone(), record.pair.clone()))
                && *prior != record.favors
            {
                return Err(DiscriminatorIssue::ConflictingReuse {
                    id: record.id.clone(),
                    evidence_id: evidence_id.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn accept(&mut self, record: DiscriminatorRecord) {
        for evidence_id in &record.evidence_ids {
            self.directions
                .insert((evidence_id.clone(), record.pair.clone()), record.favors);
        }
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[DiscriminatorRecord] {
        &self.records
    }

    /// Fold accepted records for a pair into a directional verdict.
    #[must_use]
    pub fn verdict(&self, pair: &PairKey) -> VerdictOutcome {
        let mut left_count = 0usize;
        let mut right_count = 0usize;
        for record in self.records.iter().filter(|record| record.pair == *pair) {
            match record.favors {
                Direction::Left => left_count += 1,
                Direction::Right => right_count += 1,
            }
        }
        let margin = left_count as i64 - right_count as i64;
        let verdict = if margin >= MIN_DIRECTIONAL_MARGIN && left_count >= MIN_DIRECTIONAL_COUNT {
            PairVerdict::FavorsLeft
        } else if -margin >= MIN_DIRECTIONAL_MARGIN && right_count >= MIN_DIRECTIONAL_COUNT {
            PairVerdict::FavorsRight
        } else {
            PairVerdict::Unresolved
        };
        VerdictOutcome {
            verdict,
            left_count,
            right_count,
            margin,
        }
    }
}

/// A root's view as the queue needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contender {
    pub id: CanonicalId,
    pub mass: f64,
    pub status: RootStatus,
    pub retired: bool,
}

/// One unit of contrastive work drawn from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairTask {
    pub pair: PairKey,
    pub target: CanonicalId,
    pub target_side: Direction,
    /// True when the target side was chosen because it is not yet
    /// scoped rather than by alternation.
    pub bootstrap: bool,
    pub value: f64,
}

/// Catalog of budget-feasible pairs plus the overflow that was deferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairCatalog {
    pub feasible: Vec<(PairKey, f64)>,
    pub deferred: Vec<PairKey>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairQueue {
    resolved: BTreeMap<PairKey, VerdictOutcome>,
    last_side: BTreeMap<PairKey, Direction>,
    locked: Option<PairKey>,
}

impl PairQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Top-N active contenders by ledger mass, canonical-id tie-break,
    /// optionally filtered by the mass-ratio floor.
    #[must_use]
    pub fn active_set(contenders: &[Contender], config: &Config) -> Vec<CanonicalId> {
        let mut live: Vec<&Contender> = contenders.iter().filter(|c| !c.retired).collect();
        live.sort_by(|a, b| b.mass.total_cmp(&a.mass).then_with(|| a.id.cmp(&b.id)));
        live.truncate(config.active_set_size);

        if config.mass_ratio_floor > 0.0
            && let Some(leader_mass) = live.first().map(|c| c.mass)
        {
            let floor = leader_mass * config.mass_ratio_floor;
            live.retain(|c| c.mass >= floor);
        }
        live.into_iter().map(|c| c.id.clone()).collect()
    }

    /// Every unresolved unordered pair within the active set, ranked by
    /// estimated elimination value when prioritization is on, capped by
    /// the pair budget. Overflow pairs are reported for deferral events.
    #[must_use]
    pub fn catalog(
        &self,
        active: &[CanonicalId],
        contenders: &[Contender],
        config: &Config,
    ) -> PairCatalog {
        let mass_of = |id: &CanonicalId| -> f64 {
            contenders
                .iter()
                .find(|c| c.id == *id)
                .map_or(0.0, |c| c.mass)
        };

        let mut pairs: Vec<(PairKey, f64)> = Vec::new();
        for (i, left) in active.iter().enumerate() {
            for right in active.iter().skip(i + 1) {
                let pair = PairKey::new(left.clone(), right.clone());
                if self.resolved.contains_key(&pair) {
                    continue;
                }
                let value = mass_of(left).min(mass_of(right));
                pairs.push((pair, value));
            }
        }

        if config.value_prioritization {
            pairs.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        } else {
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
        }

        let deferred = pairs
            .split_off(pairs.len().min(config.pair_budget))
            .into_iter()
            .map(|(pair, _)| pair)
            .collect();
        PairCatalog {
            feasible: pairs,
            deferred,
        }
    }

    /// Draw the next pair task, honoring the sticky lock, balanced
    /// targeting, and missing-side bootstrap. Once drawn, the selected
    /// pair is the authoritative contrastive context.
    #[must_use]
    pub fn next_task(
        &self,
        catalog: &PairCatalog,
        contenders: &[Contender],
        config: &Config,
    ) -> Option<PairTask> {
        let locked_choice = if config.sticky_lock {
            self.locked.as_ref().and_then(|locked| {
                if self.resolved.contains_key(locked) {
                    None
                } else {
                    let value = catalog
                        .feasible
                        .iter()
                        .find(|(pair, _)| pair == locked)
                        .map_or(0.0, |(_, value)| *value);
                    Some((locked.clone(), value))
                }
            })
        } else {
            None
        };

        let (pair, value) = locked_choice.or_else(|| catalog.feasible.first().cloned())?;

        let status_of = |id: &CanonicalId| -> Option<RootStatus> {
            contenders
                .iter()
                .find(|c| c.id == *id)
                .map(|c| c.status)
        };

        // Missing-side bootstrap takes precedence over alternation.
        let (target_side, bootstrap) =
            if status_of(pair.left()) == Some(RootStatus::Unscoped) {
                (Direction::Left, true)
            } else if status_of(pair.right()) == Some(RootStatus::Unscoped) {
                (Direction::Right, true)
            } else if config.balanced_targeting {
                let side = self
                    .last_side
                    .get(&pair)
                    .map_or(Direction::Left, |last| last.flipped());
                (side, false)
            } else {
                (Direction::Left, false)
            };

        Some(PairTask {
            target: pair.side(target_side).clone(),
            pair,
            target_side,
            bootstrap,
            value,
        })
    }

    /// Record that a task was issued for the pair, locking it and
    /// flipping the balanced-targeting side.
    pub fn record_task(&mut self, task: &PairTask) {
        self.last_side.insert(task.pair.clone(), task.target_side);
        self.locked = Some(task.pair.clone());
    }

    /// Fold a fresh verdict in; resolving the locked pair releases the
    /// lock.
    pub fn record_verdict(&mut self, pair: &PairKey, outcome: VerdictOutcome) {
        if outcome.verdict == PairVerdict::Unresolved {
            self.resolved.remove(pair);
            return;
        }
        self.resolved.insert(pair.clone(), outcome);
        if self.locked.as_ref() == Some(pair) {
            self.locked = None;
        }
    }

    #[must_use]
    pub fn resolved(&self) -> &BTreeMap<PairKey, VerdictOutcome> {
        &self.resolved
    }

    #[must_use]
    pub fn locked(&self) -> Option<&PairKey> {
        self.locked.as_ref()
    }

    /// Unresolved share of the budget-feasible catalog, the numerator
    /// of the dynamic-abstention pressure.
    #[must_use]
    pub fn unresolved_ratio(&self, catalog: &PairCatalog) -> f64 {
        let feasible = catalog.feasible.len();
        if feasible == 0 {
            return 0.0;
        }
        feasible as f64 / (feasible + self.resolved.len()) as f64
    }

    /// True when every feasible pair has a directional verdict.
    #[must_use]
    pub fn adjudication_complete(&self, catalog: &PairCatalog) -> bool {
        catalog.feasible.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use cw_canon::CanonicalId;
    use cw_model::{
        Config, Direction, DiscriminatorKind, DiscriminatorRecord, EvidenceBundle, EvidenceItem,
        PairKey, PairVerdict, RootStatus,
    };

    use super::{Contender, DiscriminatorIssue, DiscriminatorLedger, PairQueue};

    fn evidence(ids: &[&str]) -> EvidenceBundle {
        let mut bundle = EvidenceBundle::new();
        for id in ids {
            bundle.insert(EvidenceItem {
                id: (*id).to_owned(),
                text: format!("text for {id}"),
                source: None,
            });
        }
        bundle
    }

    fn pair() -> PairKey {
        PairKey::new(
            CanonicalId::of("alpha mechanism"),
            CanonicalId::of("beta mechanism"),
        )
    }

    fn record(id: &str, favors: Direction, evidence_ids: &[&str]) -> DiscriminatorRecord {
        DiscriminatorRecord {
            id: id.to_owned(),
            pair: pair(),
            favors,
            kind: DiscriminatorKind::Support,
            evidence_ids: evidence_ids.iter().map(|s| (*s).to_owned()).collect(),
            quote: None,
        }
    }

    #[test]
    fn validation_rejects_unknown_evidence() {
        let ledger = DiscriminatorLedger::new();
        let err = ledger
            .validate(&record("d1", Direction::Left, &["missing"]), None, &evidence(&["e1"]))
            .expect_err("unknown evidence");
        assert!(matches!(err, DiscriminatorIssue::UnknownEvidence { .. }));
    }

    #[test]
    fn validation_rejects_conflicting_directional_reuse() {
        let bundle = evidence(&["e1"]);
        let mut ledger = DiscriminatorLedger::new();
        let first = record("d1", Direction::Left, &["e1"]);
        ledger.validate(&first, None, &bundle).expect("first use");
        ledger.accept(first);

        let err = ledger
            .validate(&record("d2", Direction::Right, &["e1"]), None, &bundle)
            .expect_err("conflicting reuse");
        assert!(matches!(err, DiscriminatorIssue::ConflictingReuse { .. }));
    }

    #[test]
    fn validation_enforces_the_bound_pair() {
        let bundle = evidence(&["e1"]);
        let ledger = DiscriminatorLedger::new();
        let other_pair = PairKey::new(
            CanonicalId::of("alpha mechanism"),
            CanonicalId::of("gamma mechanism"),
        );
        let err = ledger
            .validate(
                &record("d1", Direction::Left, &["e1"]),
                Some(&other_pair),
                &bundle,
            )
            .expect_err("pair mismatch");
        assert!(matches!(err, DiscriminatorIssue::PairMismatch { .. }));
    }

    #[test]
    fn verdict_needs_a_directional_margin() {
        let bundle = evidence(&["e1", "e2"]);
        let mut ledger = DiscriminatorLedger::new();
        let left = record("d1", Direction::Left, &["e1"]);
        ledger.validate(&left, None, &bundle).expect("valid");
        ledger.accept(left);
        let right = record("d2", Direction::Right, &["e2"]);
        ledger.validate(&right, None, &bundle).expect("valid");
        ledger.accept(right);

        let outcome = ledger.verdict(&pair());
        assert_eq!(outcome.verdict, PairVerdict::Unresolved);
        assert_eq!(outcome.margin, 0);

        let more = record("d3", Direction::Left, &["e1"]);
        ledger.accept(more);
        let outcome = ledger.verdict(&pair());
        assert_eq!(outcome.verdict, PairVerdict::FavorsLeft);
        assert_eq!(outcome.left_count, 2);
    }

    fn contenders(masses: &[(&str, f64)]) -> Vec<Contender> {
        masses
            .iter()
            .map(|(statement, mass)| Contender {
                id: CanonicalId::of(statement),
                mass: *mass,
                status: RootStatus::Scoped,
                retired: false,
            })
            .collect()
    }

    #[test]
    fn active_set_takes_top_n_by_mass() {
        let contenders = contenders(&[
            ("alpha mechanism", 0.4),
            ("beta mechanism", 0.3),
            ("gamma mechanism", 0.2),
            ("delta mechanism", 0.05),
        ]);
        let mut config = Config::default();
        config.active_set_size = 3;
        let active = PairQueue::active_set(&contenders, &config);
        assert_eq!(active.len(), 3);
        assert!(active.contains(&CanonicalId::of("alpha mechanism")));
        assert!(!active.contains(&CanonicalId::of("delta mechanism")));
    }

    #[test]
    fn mass_ratio_floor_drops_weak_contenders() {
        let contenders = contenders(&[
            ("alpha mechanism", 0.6),
            ("beta mechanism", 0.3),
            ("gamma mechanism", 0.05),
        ]);
        let mut config = Config::default();
        config.mass_ratio_floor = 0.25;
        let active = PairQueue::active_set(&contenders, &config);
        assert_eq!(active.len(), 2);
    }

    #[test]
    fn catalog_caps_pairs_at_the_budget_and_defers_the_rest() {
        let contenders = contenders(&[
            ("alpha mechanism", 0.3),
            ("beta mechanism", 0.25),
            ("gamma mechanism", 0.2),
        ]);
        let mut config = Config::default();
        config.pair_budget = 2;
        let queue = PairQueue::new();
        let active = PairQueue::active_set(&contenders, &config);
        let catalog = queue.catalog(&active, &contenders, &config);
        assert_eq!(catalog.feasible.len(), 2);
        assert_eq!(catalog.deferred.len(), 1);
        // Highest elimination value first: alpha-beta has min mass 0.25.
        assert!((catalog.feasible[0].1 - 0.25).abs() < 1e-12);
    }

    #[test]
    fn balanced_targeting_alternates_sides() {
        let contenders = contenders(&[("alpha mechanism", 0.4), ("beta mechanism", 0.35)]);
        let config = Config::default();
        let mut queue = PairQueue::new();
        let active = PairQueue::active_set(&contenders, &config);
        let catalog = queue.catalog(&active, &contenders, &config);

        let first = queue
            .next_task(&catalog, &contenders, &config)
            .expect("task");
        queue.record_task(&first);
        let second = queue
            .next_task(&catalog, &contenders, &config)
            .expect("task");
        assert_eq!(second.target_side, first.target_side.flipped());
    }

    #[test]
    fn missing_side_bootstrap_targets_the_unscoped_root() {
        let mut contenders = contenders(&[("alpha mechanism", 0.4), ("beta mechanism", 0.35)]);
        let beta = CanonicalId::of("beta mechanism");
        for contender in &mut contenders {
            if contender.id == beta {
                contender.status = RootStatus::Unscoped;
            }
        }
        let config = Config::default();
        let queue = PairQueue::new();
        let active = PairQueue::active_set(&contenders, &config);
        let catalog = queue.catalog(&active, &contenders, &config);
        let task = queue
            .next_task(&catalog, &contenders, &config)
            .expect("task");
        assert!(task.bootstrap);
        assert_eq!(task.target, beta);
    }

    #[test]
    fn sticky_lock_survives_catalog_churn() {
        let initial_contenders = contenders(&[
            ("alpha mechanism", 0.3),
            ("beta mechanism", 0.25),
            ("gamma mechanism", 0.2),
        ]);
        let config = Config::default();
        let mut queue = PairQueue::new();
        let active = PairQueue::active_set(&initial_contenders, &config);
        let catalog = queue.catalog(&active, &initial_contenders, &config);
        let task = queue
            .next_task(&catalog, &initial_contenders, &config)
            .expect("task");
        queue.record_task(&task);

        // Shift masses so a different pair now ranks first.
        let churned_contenders = contenders(&[
            ("alpha mechanism", 0.2),
            ("beta mechanism", 0.25),
            ("gamma mechanism", 0.35),
        ]);
        let churned = PairQueue::active_set(&churned_contenders, &config);
        let churned_catalog = queue.catalog(&churned, &initial_contenders, &config);
        let next = queue
            .next_task(&churned_catalog, &initial_contenders, &config)
            .expect("task");
        assert_eq!(next.pair, task.pair);
    }
}
