#![forbid(unsafe_code)]

//! Conformance harness: deterministic oracle doubles, JSON scenario
//! packets, and the replay drift gate. Packets reference roots by
//! display id and nodes by `<display>:<slot>` keys; the loader resolves
//! those into canonical identifiers.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;

use cw_audit::{AuditTrace, MemorySink};
use cw_canon::CanonicalId;
use cw_engine::{
    Decomposer, Evaluator, PortError, SessionDeps, SessionError, SessionResult, replay_session,
    run_session,
};
use cw_model::{
    AuditPayload, DecompositionOutcome, DecompositionStructure, DecompositionType, Direction,
    DiscriminatorKind, DiscriminatorRecord, Entailment, EvaluationOutcome, EventKind,
    GateIssueKind, NodeSnapshot, PairKey, Role, RootStatus, Rubric, SessionRequest, StopReason,
    TargetSpec,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Evaluator double with outcomes scripted per node key, optionally
/// specialized per contrastive pair. The last outcome for a key
/// repeats, so packets stay robust to tie-break ordering.
#[derive(Debug, Default)]
pub struct ScriptedEvaluator {
    outcomes: BTreeMap<String, VecDeque<EvaluationOutcome>>,
    pub calls: Vec<String>,
}

impl ScriptedEvaluator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&mut self, key: impl Into<String>, outcome: EvaluationOutcome) {
        self.outcomes.entry(key.into()).or_default().push_back(outcome);
    }

    fn take(&mut self, key: &str) -> Option<EvaluationOutcome> {
        let queue = self.outcomes.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Evaluator for ScriptedEvaluator {
    fn evaluate(
        &mut self,
        node: &NodeSnapshot,
        context: Option<&cw_model::ContrastiveContext>,
        _evidence: &cw_model::EvidenceBundle,
    ) -> Result<EvaluationOutcome, PortError> {
        self.calls.push(node.key.clone());
        if let Some(ctx) = context {
            let keyed = format!("{}@{}", node.key, ctx.pair);
            if let Some(outcome) = self.take(&keyed) {
                return Ok(outcome);
            }
        }
        self.take(&node.key)
            .ok_or_else(|| PortError::new(format!("no scripted evaluation for {}", node.key)))
    }
}

/// Decomposer double keyed by target statement (roots) or
/// `<slot>:<statement>` (slots).
#[derive(Debug, Default)]
pub struct ScriptedDecomposer {
    outcomes: BTreeMap<String, VecDeque<DecompositionOutcome>>,
    fallback: Option<DecompositionOutcome>,
    pub calls: Vec<String>,
}

impl ScriptedDecomposer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&mut self, key: impl Into<String>, outcome: DecompositionOutcome) {
        self.outcomes.entry(key.into()).or_default().push_back(outcome);
    }

    pub fn fallback(&mut self, outcome: DecompositionOutcome) {
        self.fallback = Some(outcome);
    }

    #[must_use]
    pub fn key_for(target: &TargetSpec) -> String {
        match target {
            TargetSpec::Root { statement, .. } => statement.clone(),
            TargetSpec::Slot {
                slot, statement, ..
            } => format!("{slot}:{statement}"),
        }
    }
}

impl Decomposer for ScriptedDecomposer {
    fn decompose(&mut self, target: &TargetSpec) -> Result<DecompositionOutcome, PortError> {
        let key = Self::key_for(target);
        self.calls.push(key.clone());
        let queued = {
            let queue = self.outcomes.get_mut(&key);
            queue.and_then(|queue| {
                if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                }
            })
        };
        queued
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| PortError::new(format!("no scripted decomposition for {key}")))
    }
}

// ---------------------------------------------------------------------
// Packet fixtures
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixturePart {
    pub key: String,
    pub statement: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FixtureDecompositionOutcome {
    Structure {
        decomposition: DecompositionType,
        coupling: f64,
        parts: Vec<FixturePart>,
    },
    Failure {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureDecomposition {
    /// Statement key for roots, `<slot>:<statement>` for slots.
    pub target: String,
    pub outcome: FixtureDecompositionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureDiscriminator {
    pub id: String,
    /// Display ids of the two roots the record contrasts.
    pub pair: [String; 2],
    /// Display id of the favored root.
    pub favors: String,
    pub kind: DiscriminatorKind,
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub quote: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureEvaluation {
    pub node_key: String,
    /// Specializes the script to one contrastive pair, by display ids.
    #[serde(default)]
    pub pair: Option<[String; 2]>,
    pub p: f64,
    #[serde(default)]
    pub rubric: Option<[u8; 4]>,
    #[serde(default)]
    pub evidence_ids: Vec<String>,
    #[serde(default)]
    pub discriminators: Vec<FixtureDiscriminator>,
    #[serde(default)]
    pub non_discriminative: bool,
    #[serde(default)]
    pub entailment: Option<Entailment>,
}

fn default_tolerance() -> f64 {
    1e-9
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub stop_reason: StopReason,
    #[serde(default)]
    pub credits_spent: Option<u64>,
    #[serde(default)]
    pub operation_count: Option<usize>,
    /// Display ids plus `h_noa` / `h_und`.
    #[serde(default)]
    pub ledger: Option<BTreeMap<String, f64>>,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    #[serde(default)]
    pub k_root: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub statuses: Option<BTreeMap<String, RootStatus>>,
    /// Display id of the certified root, or `H_UND` for abstention.
    #[serde(default)]
    pub certification: Option<String>,
    /// Last stored probability per node key.
    #[serde(default)]
    pub final_node_p: Option<BTreeMap<String, f64>>,
    /// Last aggregated `m` per `<display>:<slot>` key.
    #[serde(default)]
    pub slot_aggregate_m: Option<BTreeMap<String, f64>>,
    #[serde(default)]
    pub issue_kinds: Option<Vec<GateIssueKind>>,
    #[serde(default)]
    pub require_events: Vec<EventKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub packet_id: String,
    pub title: String,
    pub request: SessionRequest,
    #[serde(default)]
    pub decompositions: Vec<FixtureDecomposition>,
    #[serde(default)]
    pub evaluations: Vec<FixtureEvaluation>,
    pub expect: Expectation,
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("fixture io failure: {detail}")]
    Io { detail: String },
    #[error("fixture {path} is malformed: {detail}")]
    Malformed { path: String, detail: String },
    #[error("packet {packet_id} references unknown display id {display_id:?}")]
    UnknownDisplayId {
        packet_id: String,
        display_id: String,
    },
    #[error("packet {packet_id} has invalid rubric {scores:?}")]
    InvalidRubric { packet_id: String, scores: [u8; 4] },
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug)]
pub struct PacketReport {
    pub packet_id: String,
    pub failures: Vec<String>,
    pub result: Option<SessionResult>,
}

impl PacketReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SuiteReport {
    pub reports: Vec<PacketReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_green(&self) -> bool {
        self.reports.iter().all(PacketReport::passed)
    }
}

pub fn load_packet(path: &Path) -> Result<Packet, HarnessError> {
    let contents = fs::read_to_string(path).map_err(|err| HarnessError::Io {
        detail: err.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|err| HarnessError::Malformed {
        path: path.display().to_string(),
        detail: err.to_string(),
    })
}

pub fn load_packets(dir: &Path) -> Result<Vec<Packet>, HarnessError> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .map_err(|err| HarnessError::Io {
            detail: err.to_string(),
        })?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    paths.iter().map(|path| load_packet(path)).collect()
}

#[must_use]
pub fn default_fixture_root() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
}

fn canonical_of_display(
    packet: &Packet,
    display_id: &str,
) -> Result<CanonicalId, HarnessError> {
    packet
        .request
        .roots
        .iter()
        .find(|root| root.display_id == display_id)
        .map(|root| CanonicalId::of(&root.statement))
        .ok_or_else(|| HarnessError::UnknownDisplayId {
            packet_id: packet.packet_id.clone(),
            display_id: display_id.to_owned(),
        })
}

fn pair_of_displays(
    packet: &Packet,
    pair: &[String; 2],
) -> Result<PairKey, HarnessError> {
    Ok(PairKey::new(
        canonical_of_display(packet, &pair[0])?,
        canonical_of_display(packet, &pair[1])?,
    ))
}

/// Build the oracle doubles a packet scripts.
pub fn build_doubles(
    packet: &Packet,
) -> Result<(ScriptedDecomposer, ScriptedEvaluator), HarnessError> {
    let mut decomposer = ScriptedDecomposer::new();
    for fixture in &packet.decompositions {
        let outcome = match &fixture.outcome {
            FixtureDecompositionOutcome::Structure {
                decomposition,
                coupling,
                parts,
            } => DecompositionOutcome::Structure(DecompositionStructure {
                decomposition: *decomposition,
                coupling: *coupling,
                parts: parts
                    .iter()
                    .map(|part| cw_model::PartSpec {
                        key: part.key.clone(),
                        statement: part.statement.clone(),
                        role: part.role,
                    })
                    .collect(),
            }),
            FixtureDecompositionOutcome::Failure { reason } => DecompositionOutcome::Failure {
                reason: reason.clone(),
            },
        };
        decomposer.script(fixture.target.clone(), outcome);
    }

    let mut evaluator = ScriptedEvaluator::new();
    for fixture in &packet.evaluations {
        let rubric = match fixture.rubric {
            Some(scores) => Some(Rubric::new(scores[0], scores[1], scores[2], scores[3]).map_err(
                |_| HarnessError::InvalidRubric {
                    packet_id: packet.packet_id.clone(),
                    scores,
                },
            )?),
            None => None,
        };
        let mut discriminators = Vec::new();
        for fixture_record in &fixture.discriminators {
            let pair = pair_of_displays(packet, &fixture_record.pair)?;
            let favored = canonical_of_display(packet, &fixture_record.favors)?;
            let favors = pair.side_of(&favored).unwrap_or(Direction::Left);
            discriminators.push(DiscriminatorRecord {
                id: fixture_record.id.clone(),
                pair,
                favors,
                kind: fixture_record.kind,
                evidence_ids: fixture_record.evidence_ids.clone(),
                quote: fixture_record.quote.clone(),
            });
        }
        let outcome = EvaluationOutcome {
            p: fixture.p,
            rubric,
            evidence_ids: fixture.evidence_ids.clone(),
            discriminators,
            non_discriminative: fixture.non_discriminative,
            entailment: fixture.entailment.unwrap_or(Entailment::Neutral),
        };
        let key = match &fixture.pair {
            Some(pair_displays) => {
                let pair = pair_of_displays(packet, pair_displays)?;
                format!("{}@{pair}", fixture.node_key)
            }
            None => fixture.node_key.clone(),
        };
        evaluator.script(key, outcome);
    }

    Ok((decomposer, evaluator))
}

/// Run one packet end to end, check every expectation, then replay the
/// captured trace and require drift-free agreement.
pub fn run_packet(packet: &Packet) -> Result<PacketReport, HarnessError> {
    let (mut decomposer, mut evaluator) = build_doubles(packet)?;
    let mut sink = MemorySink::new();

    let result = run_session(
        &packet.request,
        SessionDeps {
            evaluator: &mut evaluator,
            decomposer: &mut decomposer,
            sink: &mut sink,
            clock: None,
            id_provider: None,
            cancel: None,
        },
    )?;

    let trace = AuditTrace::from_records(sink.records().to_vec())
        .map_err(SessionError::Audit)?;
    let mut failures = Vec::new();
    check_expectations(packet, &result, &trace, &mut failures);
    check_replay_drift(&trace, &result, &mut failures)?;

    Ok(PacketReport {
        packet_id: packet.packet_id.clone(),
        failures,
        result: Some(result),
    })
}

fn check_expectations(
    packet: &Packet,
    result: &SessionResult,
    trace: &AuditTrace,
    failures: &mut Vec<String>,
) {
    let expect = &packet.expect;
    if result.stop_reason != expect.stop_reason {
        failures.push(format!(
            "stop reason {:?} != expected {:?}",
            result.stop_reason, expect.stop_reason
        ));
    }

    if let Some(expected) = expect.credits_spent {
        let spent = packet.request.credits - result.credits_remaining;
        if spent != expected {
            failures.push(format!("credits spent {spent} != expected {expected}"));
        }
    }

    let operation_count = trace
        .events
        .iter()
        .filter(|event| matches!(event.payload, AuditPayload::OperationChosen { .. }))
        .count();
    if let Some(expected) = expect.operation_count
        && operation_count != expected
    {
        failures.push(format!(
            "operation count {operation_count} != expected {expected}"
        ));
    }

    let display_to_canonical: BTreeMap<&str, String> = result
        .roots
        .iter()
        .map(|root| (root.display_id.as_str(), root.canonical_id.to_string()))
        .collect();

    if let Some(expected_ledger) = &expect.ledger {
        for (key, expected_mass) in expected_ledger {
            let ledger_key = match key.as_str() {
                "h_noa" | "h_und" => key.clone(),
                display => display_to_canonical
                    .get(display)
                    .cloned()
                    .unwrap_or_else(|| display.to_owned()),
            };
            match result.ledger.get(&ledger_key) {
                Some(actual) if (actual - expected_mass).abs() <= expect.tolerance => {}
                Some(actual) => failures.push(format!(
                    "ledger[{key}] = {actual} != expected {expected_mass}"
                )),
                None => failures.push(format!("ledger has no entry for {key}")),
            }
        }
    }

    if let Some(expected_k) = &expect.k_root {
        for (display, expected) in expected_k {
            match result.roots.iter().find(|root| root.display_id == *display) {
                Some(root) if (root.k_root - expected).abs() <= expect.tolerance => {}
                Some(root) => failures.push(format!(
                    "k_root[{display}] = {} != expected {expected}",
                    root.k_root
                )),
                None => failures.push(format!("no root with display id {display}")),
            }
        }
    }

    if let Some(statuses) = &expect.statuses {
        for (display, expected) in statuses {
            match result.roots.iter().find(|root| root.display_id == *display) {
                Some(root) if root.status == *expected => {}
                Some(root) => failures.push(format!(
                    "status[{display}] = {:?} != expected {expected:?}",
                    root.status
                )),
                None => failures.push(format!("no root with display id {display}")),
            }
        }
    }

    if let Some(expected) = &expect.certification {
        let actual = result
            .certification_output
            .as_ref()
            .map(|certification| certification.display_id.clone());
        if actual.as_deref() != Some(expected.as_str()) {
            failures.push(format!(
                "certification {actual:?} != expected {expected:?}"
            ));
        }
    }

    if let Some(expected_ps) = &expect.final_node_p {
        for (node_key, expected) in expected_ps {
            let actual = trace.events.iter().rev().find_map(|event| {
                match &event.payload {
                    AuditPayload::EvaluateRecorded {
                        node_key: key,
                        p_stored,
                        ..
                    } if key == node_key => Some(*p_stored),
                    _ => None,
                }
            });
            match actual {
                Some(actual) if (actual - expected).abs() <= expect.tolerance => {}
                Some(actual) => failures.push(format!(
                    "final p[{node_key}] = {actual} != expected {expected}"
                )),
                None => failures.push(format!("no evaluation recorded for {node_key}")),
            }
        }
    }

    if let Some(expected_ms) = &expect.slot_aggregate_m {
        for (target, expected) in expected_ms {
            let actual = trace.events.iter().rev().find_map(|event| {
                if event.target_id != *target {
                    return None;
                }
                match &event.payload {
                    AuditPayload::SlotAggregated { m, .. } => Some(*m),
                    _ => None,
                }
            });
            match actual {
                Some(actual) if (actual - expected).abs() <= expect.tolerance => {}
                Some(actual) => failures.push(format!(
                    "aggregate m[{target}] = {actual} != expected {expected}"
                )),
                None => failures.push(format!("no aggregation recorded for {target}")),
            }
        }
    }

    if let Some(expected_kinds) = &expect.issue_kinds {
        let recorded: Vec<GateIssueKind> = trace
            .events
            .iter()
            .filter_map(|event| match &event.payload {
                AuditPayload::GateFailed { issues } => {
                    Some(issues.iter().map(|issue| issue.kind))
                }
                _ => None,
            })
            .flatten()
            .collect();
        for expected in expected_kinds {
            if !recorded.contains(expected) {
                failures.push(format!("gate issue {expected:?} was not recorded"));
            }
        }
    }

    for expected in &expect.require_events {
        if !trace.events.iter().any(|event| event.kind == *expected) {
            failures.push(format!("required event {expected:?} never fired"));
        }
    }
}

/// Replay the captured trace and require agreement with the original
/// run: same stop reason, same event kind sequence, ledger within
/// 1e-12.
fn check_replay_drift(
    trace: &AuditTrace,
    original: &SessionResult,
    failures: &mut Vec<String>,
) -> Result<(), HarnessError> {
    let mut replay_sink = MemorySink::new();
    let replayed = replay_session(trace, &mut replay_sink)?;

    if replayed.stop_reason != original.stop_reason {
        failures.push(format!(
            "replay stop reason {:?} != original {:?}",
            replayed.stop_reason, original.stop_reason
        ));
    }
    for (key, mass) in &original.ledger {
        match replayed.ledger.get(key) {
            Some(replayed_mass) if (replayed_mass - mass).abs() <= 1e-12 => {}
            other => failures.push(format!(
                "replay ledger[{key}] = {other:?} != original {mass}"
            )),
        }
    }
    for (original_root, replayed_root) in original.roots.iter().zip(replayed.roots.iter()) {
        if (original_root.k_root - replayed_root.k_root).abs() > 1e-12 {
            failures.push(format!(
                "replay k_root[{}] drifted: {} vs {}",
                original_root.display_id, replayed_root.k_root, original_root.k_root
            ));
        }
    }

    let replay_trace = AuditTrace::from_records(replay_sink.records().to_vec())
        .map_err(SessionError::Audit)?;
    let original_kinds: Vec<_> = trace.events.iter().map(|event| event.kind).collect();
    let replay_kinds: Vec<_> = replay_trace.events.iter().map(|event| event.kind).collect();
    if original_kinds != replay_kinds {
        failures.push(format!(
            "replay event sequence diverged: {} events vs {}",
            replay_kinds.len(),
            original_kinds.len()
        ));
    }
    Ok(())
}

pub fn run_suite(
    fixture_root: &Path,
    packet_filter: Option<&str>,
) -> Result<SuiteReport, HarnessError> {
    let packets = load_packets(fixture_root)?;
    let mut reports = Vec::new();
    for packet in &packets {
        if let Some(filter) = packet_filter
            && packet.packet_id != filter
        {
            continue;
        }
        reports.push(run_packet(packet)?);
    }
    Ok(SuiteReport { reports })
}
