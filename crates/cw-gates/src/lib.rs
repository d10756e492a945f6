#![forbid(unsafe_code)]

//! Pure predicates evaluated before any credit is spent. Each gate
//! returns typed issues rather than strings so stop reasons stay
//! machine-renderable.

use cw_canon::{CanonicalId, canonicalize, normalize_quote};
use cw_model::{
    Config, GateIssue, GateIssueKind, HypothesisSet, PairDeclaration, PairKey, ReasoningMode,
    RootSpec, SessionRequest, ValidationReport,
};
use serde::{Deserialize, Serialize};

/// Verify every unordered named-root pair has a declared overlap at or
/// below the configured maximum and a non-empty discriminator.
pub fn mece_certificate(
    set: &HypothesisSet,
    declarations: &[PairDeclaration],
    max_pair_overlap: u8,
) -> Result<(), Vec<GateIssue>> {
    let mut issues = Vec::new();
    let ids: Vec<&CanonicalId> = set.root_ids().collect();

    for (i, left) in ids.iter().enumerate() {
        for right in ids.iter().skip(i + 1) {
            let pair = PairKey::new((*left).clone(), (*right).clone());
            let left_display = display_of(set, left);
            let right_display = display_of(set, right);
            let declaration = declarations.iter().find(|d| {
                (d.left == left_display && d.right == right_display)
                    || (d.left == right_display && d.right == left_display)
            });
            match declaration {
                None => issues.push(GateIssue {
                    kind: GateIssueKind::MissingPairDeclaration,
                    subject: pair.to_string(),
                    detail: format!("no declaration for {left_display} vs {right_display}"),
                }),
                Some(declaration) => {
                    if declaration.overlap > max_pair_overlap {
                        issues.push(GateIssue {
                            kind: GateIssueKind::PairOverlapExceedsThreshold,
                            subject: pair.to_string(),
                            detail: format!(
                                "overlap {} exceeds maximum {max_pair_overlap}",
                                declaration.overlap
                            ),
                        });
                    }
                    if declaration.discriminator.trim().is_empty() {
                        issues.push(GateIssue {
                            kind: GateIssueKind::MissingPairDiscriminator,
                            subject: pair.to_string(),
                            detail: format!(
                                "pair {left_display} vs {right_display} declares no discriminator"
                            ),
                        });
                    }
                }
            }
        }
    }

    if issues.is_empty() { Ok(()) } else { Err(issues) }
}

fn display_of(set: &HypothesisSet, id: &CanonicalId) -> String {
    set.root(id)
        .map(|root| root.display_id.clone())
        .unwrap_or_else(|_| id.short().to_owned())
}

/// Singleton mode passes trivially; compositional mode requires every
/// root to declare its component set.
pub fn contender_space(set: &HypothesisSet) -> Result<(), Vec<GateIssue>> {
    let compositional = set.roots().any(|root| root.story_cardinality >= 2);
    if !compositional {
        return Ok(());
    }

    let issues: Vec<GateIssue> = set
        .roots()
        .filter(|root| root.components.is_empty())
        .map(|root| GateIssue {
            kind: GateIssueKind::MissingComponents,
            subject: root.display_id.clone(),
            detail: "compositional mode requires a declared component set".to_owned(),
        })
        .collect();

    if issues.is_empty() { Ok(()) } else { Err(issues) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyCompat {
    Compatible {
        tau_effective: f64,
        cap: f64,
        adjusted: bool,
    },
    Incompatible {
        issue: GateIssue,
    },
}

/// Combine the profile cap, the frame cap (engaged when the frame is
/// inadequate), and the unvalidated calibration cap into one effective
/// ceiling. In certify mode a ceiling under `tau` is fatal; in explore
/// mode `tau_effective` is lowered instead and the adjustment recorded.
#[must_use]
pub fn policy_compat(config: &Config, frame_score: f64) -> PolicyCompat {
    let mut cap = config.profile_cap;
    if frame_score < config.frame_adequacy_threshold {
        cap = cap.min(config.frame_cap);
    }
    if !config.calibration_validated {
        cap = cap.min(config.calibration_cap);
    }

    if cap >= config.tau {
        return PolicyCompat::Compatible {
            tau_effective: config.tau,
            cap,
            adjusted: false,
        };
    }

    match config.reasoning_mode {
        ReasoningMode::Certify => PolicyCompat::Incompatible {
            issue: GateIssue {
                kind: GateIssueKind::ConfidenceCapBelowTau,
                subject: "tau".to_owned(),
                detail: format!(
                    "effective confidence cap {cap} is below tau {} in certify mode",
                    config.tau
                ),
            },
        },
        ReasoningMode::Explore => PolicyCompat::Compatible {
            tau_effective: cap,
            cap,
            adjusted: true,
        },
    }
}

/// Declared frame-adequacy score, or a coverage heuristic over the
/// evidence bundle when the request leaves it out.
#[must_use]
pub fn frame_adequacy(request: &SessionRequest) -> f64 {
    if let Some(declared) = request.frame_adequacy {
        return declared.clamp(0.0, 1.0);
    }
    let demand = request.roots.len() * request.config.template_slots.len();
    if demand == 0 {
        return 0.0;
    }
    (request.evidence.len() as f64 / demand as f64).min(1.0)
}

/// Compare a discriminator quote against the referenced evidence text
/// after both sides are normalized.
#[must_use]
pub fn quote_matches(quote: &str, evidence_text: &str) -> bool {
    let quote = normalize_quote(quote);
    if quote.is_empty() {
        return false;
    }
    normalize_quote(evidence_text).contains(&quote)
}

/// Words that survive canonicalization; fewer than this many reads as a
/// vague hypothesis statement.
const MIN_CONTENT_WORDS: usize = 2;

/// Anti-vagueness and standalone-hypothesis review of a root list,
/// surfaced to callers before any credits are spent.
#[must_use]
pub fn validate_hypothesis_set(roots: &[RootSpec], _config: &Config) -> ValidationReport {
    let mut issues = Vec::new();

    let mut seen: Vec<(CanonicalId, &str)> = Vec::new();
    for spec in roots {
        let id = CanonicalId::of(&spec.statement);
        if let Some((_, other)) = seen.iter().find(|(existing, _)| *existing == id) {
            issues.push(GateIssue {
                kind: GateIssueKind::DuplicateCanonicalId,
                subject: spec.display_id.clone(),
                detail: format!("statement collides with {other} after canonicalization"),
            });
        } else {
            seen.push((id, &spec.display_id));
        }

        if spec.exclusion_clause.trim().is_empty() {
            issues.push(GateIssue {
                kind: GateIssueKind::MissingExclusionClause,
                subject: spec.display_id.clone(),
                detail: "every named root needs an exclusion clause".to_owned(),
            });
        }

        let content_words = canonicalize(&spec.statement)
            .split_whitespace()
            .count();
        if content_words < MIN_CONTENT_WORDS {
            issues.push(GateIssue {
                kind: GateIssueKind::VagueStatement,
                subject: spec.display_id.clone(),
                detail: format!(
                    "statement has {content_words} content word(s); state a concrete mechanism"
                ),
            });
        }
    }

    if roots.len() == 1 {
        issues.push(GateIssue {
            kind: GateIssueKind::StandaloneHypothesis,
            subject: roots[0].display_id.clone(),
            detail: "a single named root cannot be adjudicated contrastively".to_owned(),
        });
    }

    ValidationReport { issues }
}
