//! Contract enforcement for evaluator outcomes. Runs in a fixed order
//! for every EVALUATE result; each divergence from nominal behavior
//! produces a typed note the session turns into an audit event.

use cw_adjudicate::DiscriminatorLedger;
use cw_gates::quote_matches;
use cw_model::{
    AnomalyKind, Config, ContrastiveContext, DiscriminatorRecord, Entailment, EvaluationOutcome,
    EvidenceBundle, QuoteFidelityMode,
};
use cw_policy::{conservative_delta, contradiction_floor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnforcementNote {
    Anomaly {
        anomaly: AnomalyKind,
        detail: String,
    },
    ConservativeDelta {
        p_prev: f64,
        p_requested: f64,
        p_stored: f64,
    },
    ContradictionFloor {
        p_prev: f64,
        p_requested: f64,
        p_stored: f64,
    },
    DiscriminatorInvalidated {
        discriminator_id: String,
        reason: String,
    },
    NcDriftBounded {
        p_prev: f64,
        p_requested: f64,
        p_stored: f64,
        epsilon_nc: f64,
    },
    QuoteDegraded {
        discriminator_id: String,
        evidence_id: String,
    },
    QuoteBlocked {
        discriminator_id: String,
        evidence_id: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnforcedEvaluation {
    pub p_stored: f64,
    /// Records that survived validation and quote fidelity.
    pub accepted: Vec<DiscriminatorRecord>,
    /// Effective non-discriminative flag after enforcement.
    pub non_discriminative: bool,
    pub notes: Vec<EnforcementNote>,
}

/// Apply the enforcement sequence to a raw evaluator outcome.
///
/// Order: clamp, conservative delta, contradiction floor, discriminator
/// validation, non-discriminative drift bound, quote fidelity. The raw
/// outcome itself is recorded unchanged by the caller; only the stored
/// probability and the accepted discriminator set come from here.
#[must_use]
pub fn enforce_evaluation(
    outcome: &EvaluationOutcome,
    p_prev: f64,
    context: Option<&ContrastiveContext>,
    evidence: &EvidenceBundle,
    ledger: &DiscriminatorLedger,
    config: &Config,
) -> EnforcedEvaluation {
    let mut notes = Vec::new();

    let mut p = outcome.p;
    if !p.is_finite() || !(0.0..=1.0).contains(&p) {
        let clamped = if p.is_finite() { p.clamp(0.0, 1.0) } else { p_prev };
        notes.push(EnforcementNote::Anomaly {
            anomaly: AnomalyKind::POutOfRange,
            detail: format!("evaluator returned p={p}, coerced to {clamped}"),
        });
        p = clamped;
    }

    let delta = conservative_delta(p_prev, p, !outcome.evidence_ids.is_empty());
    if delta.enforced {
        notes.push(EnforcementNote::ConservativeDelta {
            p_prev,
            p_requested: p,
            p_stored: delta.p,
        });
    }
    p = delta.p;

    if outcome.entailment == Entailment::Contradicts {
        let floored = contradiction_floor(p_prev, p);
        if floored.enforced {
            notes.push(EnforcementNote::ContradictionFloor {
                p_prev,
                p_requested: p,
                p_stored: floored.p,
            });
        }
        p = floored.p;
    }

    let bound_pair = context.map(|ctx| &ctx.pair);
    let mut accepted: Vec<DiscriminatorRecord> = Vec::new();
    // Validate sequentially against a scratch ledger so two records in
    // one outcome cannot smuggle in a conflicting reuse.
    let mut scratch = ledger.clone();
    for record in &outcome.discriminators {
        match scratch.validate(record, bound_pair, evidence) {
            Ok(()) => {
                scratch.accept(record.clone());
                accepted.push(record.clone());
            }
            Err(issue) => notes.push(EnforcementNote::DiscriminatorInvalidated {
                discriminator_id: record.id.clone(),
                reason: issue.to_string(),
            }),
        }
    }

    let mut non_discriminative = outcome.non_discriminative;
    if config.require_typed_discriminators && context.is_some() && accepted.is_empty() {
        non_discriminative = true;
    }

    if config.strict_contrastive && non_discriminative {
        let lo = (p_prev - config.epsilon_nc).max(0.0);
        let hi = (p_prev + config.epsilon_nc).min(1.0);
        let bounded = p.clamp(lo, hi);
        if (bounded - p).abs() > f64::EPSILON {
            notes.push(EnforcementNote::NcDriftBounded {
                p_prev,
                p_requested: p,
                p_stored: bounded,
                epsilon_nc: config.epsilon_nc,
            });
            p = bounded;
        }
    }

    accepted.retain(|record| {
        let Some(quote) = record.quote.as_deref() else {
            return true;
        };
        let matches = record.evidence_ids.iter().any(|id| {
            evidence
                .get(id)
                .is_some_and(|item| quote_matches(quote, &item.text))
        });
        if matches {
            return true;
        }
        let evidence_id = record
            .evidence_ids
            .first()
            .cloned()
            .unwrap_or_default();
        match config.quote_fidelity {
            QuoteFidelityMode::Strict => {
                notes.push(EnforcementNote::QuoteBlocked {
                    discriminator_id: record.id.clone(),
                    evidence_id,
                });
                false
            }
            QuoteFidelityMode::Advisory => {
                notes.push(EnforcementNote::QuoteDegraded {
                    discriminator_id: record.id.clone(),
                    evidence_id,
                });
                true
            }
        }
    });

    if outcome.rubric.is_none() {
        notes.push(EnforcementNote::Anomaly {
            anomaly: AnomalyKind::MissingRubric,
            detail: "evaluator returned no rubric; confidence left unchanged".to_owned(),
        });
    }

    EnforcedEvaluation {
        p_stored: p,
        accepted,
        non_discriminative,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use cw_adjudicate::DiscriminatorLedger;
    use cw_canon::CanonicalId;
    use cw_model::{
        Config, ContrastiveContext, Direction, DiscriminatorKind, DiscriminatorRecord, Entailment,
        EvaluationOutcome, EvidenceBundle, EvidenceItem, PairKey, QuoteFidelityMode, Rubric,
    };

    use super::{EnforcementNote, enforce_evaluation};

    fn bundle() -> EvidenceBundle {
        let mut bundle = EvidenceBundle::new();
        bundle.insert(EvidenceItem {
            id: "e1".to_owned(),
            text: "the valve stuck open at 03:14".to_owned(),
            source: None,
        });
        bundle
    }

    fn pair() -> PairKey {
        PairKey::new(
            CanonicalId::of("alpha mechanism"),
            CanonicalId::of("beta mechanism"),
        )
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
    fn out_of_range_p_is_clamped_and_recorded() {
        let enforced = enforce_evaluation(
            &outcome(1.7),
            0.5,
            None,
            &bundle(),
            &DiscriminatorLedger::new(),
            &Config::default(),
        );
        assert!((enforced.p_stored - 1.0).abs() < 1e-12);
        assert!(matches!(
            enforced.notes[0],
            EnforcementNote::Anomaly { .. }
        ));
    }

    #[test]
    fn empty_evidence_triggers_the_conservative_delta() {
        let mut raw = outcome(0.20);
        raw.evidence_ids.clear();
        let enforced = enforce_evaluation(
            &raw,
            1.0,
            None,
            &bundle(),
            &DiscriminatorLedger::new(),
            &Config::default(),
        );
        assert!((enforced.p_stored - 0.95).abs() < 1e-12);
        assert!(matches!(
            enforced.notes[0],
            EnforcementNote::ConservativeDelta { .. }
        ));
    }

    #[test]
    fn contradiction_applies_the_penalty_floor() {
        let mut raw = outcome(0.85);
        raw.entailment = Entailment::Contradicts;
        let enforced = enforce_evaluation(
            &raw,
            0.9,
            None,
            &bundle(),
            &DiscriminatorLedger::new(),
            &Config::default(),
        );
        assert!((enforced.p_stored - 0.65).abs() < 1e-12);
    }

    #[test]
    fn strict_mode_bounds_non_discriminative_drift() {
        let mut config = Config::default();
        config.strict_contrastive = true;
        let mut raw = outcome(0.9);
        raw.non_discriminative = true;
        let enforced = enforce_evaluation(
            &raw,
            0.5,
            None,
            &bundle(),
            &DiscriminatorLedger::new(),
            &config,
        );
        assert!((enforced.p_stored - 0.52).abs() < 1e-12);
        assert!(enforced.non_discriminative);
    }

    #[test]
    fn invalid_discriminators_are_dropped_not_fatal() {
        let mut raw = outcome(0.8);
        raw.discriminators.push(DiscriminatorRecord {
            id: "d1".to_owned(),
            pair: pair(),
            favors: Direction::Left,
            kind: DiscriminatorKind::Support,
            evidence_ids: vec!["missing".to_owned()],
            quote: None,
        });
        let enforced = enforce_evaluation(
            &raw,
            0.5,
            None,
            &bundle(),
            &DiscriminatorLedger::new(),
            &Config::default(),
        );
        assert!(enforced.accepted.is_empty());
        assert!(matches!(
            enforced.notes[0],
            EnforcementNote::DiscriminatorInvalidated { .. }
        ));
    }

    #[test]
    fn quote_mismatch_blocks_in_strict_and_keeps_in_advisory() {
        let record = DiscriminatorRecord {
            id: "d1".to_owned(),
            pair: pair(),
            favors: Direction::Left,
            kind: DiscriminatorKind::Support,
            evidence_ids: vec!["e1".to_owned()],
            quote: Some("valve stuck shut".to_owned()),
        };
        let mut raw = outcome(0.8);
        raw.discriminators.push(record);
        let strict = enforce_evaluation(
            &raw,
            0.5,
            Some(&ContrastiveContext {
                pair: pair(),
                target_side: Direction::Left,
                discriminator_hint: None,
            }),
            &bundle(),
            &DiscriminatorLedger::new(),
            &Config::default(),
        );
        assert!(strict.accepted.is_empty());

        let mut config = Config::default();
        config.quote_fidelity = QuoteFidelityMode::Advisory;
        let advisory =
            enforce_evaluation(&raw, 0.5, None, &bundle(), &DiscriminatorLedger::new(), &config);
        assert_eq!(advisory.accepted.len(), 1);
        assert!(
            advisory
                .notes
                .iter()
                .any(|note| matches!(note, EnforcementNote::QuoteDegraded { .. }))
        );
    }

    #[test]
    fn matching_quote_passes_strict_fidelity() {
        let mut raw = outcome(0.8);
        raw.discriminators.push(DiscriminatorRecord {
            id: "d1".to_owned(),
            pair: pair(),
            favors: Direction::Left,
            kind: DiscriminatorKind::Support,
            evidence_ids: vec!["e1".to_owned()],
            quote: Some("valve stuck open".to_owned()),
        });
        let enforced = enforce_evaluation(
            &raw,
            0.5,
            None,
            &bundle(),
            &DiscriminatorLedger::new(),
            &Config::default(),
        );
        assert_eq!(enforced.accepted.len(), 1);
        assert!(enforced.notes.is_empty());
    }
}
