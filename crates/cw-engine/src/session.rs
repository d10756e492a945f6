//! Session orchestrator: the one public use case. Composes the gates,
//! the deterministic scheduler, the pair queue, contract enforcement,
//! and the update pipeline under a configured policy profile, and owns
//! the audit stream for the session's lifetime.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use cw_adjudicate::{Contender, DiscriminatorLedger, PairCatalog, PairQueue, PairTask};
use cw_audit::{
    AuditError, AuditLog, AuditSink, AuditTrace, SessionEnvelope, SessionTerminator, TraceRecord,
};
use cw_canon::CanonicalId;
use cw_gates::{PolicyCompat, contender_space, frame_adequacy, mece_certificate, policy_compat};
use cw_model::{
    AuditEvent, AuditPayload, Config, ConfigError, ContrastiveContext, DecompositionOutcome,
    EvaluationOutcome, GateIssue, HypothesisSet, ModelError, NodeSnapshot, OperationKind, PairKey,
    ProfileBundle, RootHypothesis, RootStatus, SessionRequest, StopReason, TargetSpec,
};
use cw_policy::{AbstentionInputs, dynamic_abstention_mass};
use cw_sched::{
    ClosureReport, Credits, Frontier, PlannedOp, RootWork, SlotWork, StopInputs, choose_evaluation,
    choose_operation, closure_report, evaluate_stop, frontier, frontier_confident,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enforce::{EnforcementNote, enforce_evaluation};
use crate::pipeline::{
    EvaluationTarget, apply_evaluation, mark_root_unscoped, scope_root, scope_slot, slot_node_id,
};
use crate::ports::{
    CancelToken, Clock, Decomposer, Evaluator, FixedClock, FixedIdProvider, IdProvider,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("{op:?} port failed: {detail}")]
    Port { op: OperationKind, detail: String },
    #[error("replay failed: {detail}")]
    Replay { detail: String },
}

/// External collaborators for one session.
pub struct SessionDeps<'a> {
    pub evaluator: &'a mut dyn Evaluator,
    pub decomposer: &'a mut dyn Decomposer,
    pub sink: &'a mut dyn AuditSink,
    pub clock: Option<&'a mut dyn Clock>,
    pub id_provider: Option<&'a mut dyn IdProvider>,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMetadata {
    pub session_id: String,
    pub event_count: usize,
    pub config_hash: CanonicalId,
    pub profile_fingerprint: CanonicalId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionOutput {
    pub root: CanonicalId,
    pub display_id: String,
    pub p_ledger: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificationStatus {
    Certified,
    Abstain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificationOutput {
    pub status: CertificationStatus,
    /// Certified root; `None` when the session abstained into `H_UND`.
    pub root: Option<CanonicalId>,
    pub display_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub roots: Vec<RootHypothesis>,
    pub ledger: BTreeMap<String, f64>,
    pub audit: AuditMetadata,
    pub stop_reason: StopReason,
    pub credits_remaining: u64,
    pub selection_output: Option<SelectionOutput>,
    pub certification_output: Option<CertificationOutput>,
    pub next_step_guidance: Vec<String>,
}

enum CancelSignal {
    None,
    Token(CancelToken),
    AfterOps(u64),
}

impl CancelSignal {
    fn is_cancelled(&self, ops_executed: u64) -> bool {
        match self {
            Self::None => false,
            Self::Token(token) => token.is_cancelled(),
            Self::AfterOps(limit) => ops_executed >= *limit,
        }
    }
}

/// Run a full session against live oracle ports.
pub fn run_session(
    request: &SessionRequest,
    deps: SessionDeps<'_>,
) -> Result<SessionResult, SessionError> {
    let mut default_clock = FixedClock::default();
    let mut default_ids = FixedIdProvider::default();
    let clock: &mut dyn Clock = match deps.clock {
        Some(clock) => clock,
        None => &mut default_clock,
    };
    let ids: &mut dyn IdProvider = match deps.id_provider {
        Some(ids) => ids,
        None => &mut default_ids,
    };
    let cancel = deps
        .cancel
        .map_or(CancelSignal::None, CancelSignal::Token);

    Session::start(
        request,
        deps.evaluator,
        deps.decomposer,
        deps.sink,
        clock,
        ids,
        cancel,
    )?
    .run()
}

/// Re-run a recorded trace through contract enforcement and the update
/// pipeline without consulting the live oracles. Produces the same
/// ledger, stop reason, and event sequence as the original session.
pub fn replay_session(
    trace: &AuditTrace,
    sink: &mut dyn AuditSink,
) -> Result<SessionResult, SessionError> {
    let mut decompositions = VecDeque::new();
    let mut evaluations = VecDeque::new();
    let mut timestamps = VecDeque::new();
    for event in &trace.events {
        timestamps.push_back(event.ts_unix_ms);
        match &event.payload {
            AuditPayload::DecomposeRecorded { outcome, .. } => {
                decompositions.push_back(outcome.clone());
            }
            AuditPayload::EvaluateRecorded { outcome, .. } => {
                evaluations.push_back(outcome.clone());
            }
            _ => {}
        }
    }

    let mut evaluator = ReplayEvaluator { evaluations };
    let mut decomposer = ReplayDecomposer { decompositions };
    let mut clock = ReplayClock { timestamps };
    let mut ids = FixedIdProvider::default();
    let cancel = if trace.terminator.stop_reason == StopReason::Cancelled {
        let ops = trace
            .events
            .iter()
            .filter(|event| matches!(event.payload, AuditPayload::OperationChosen { .. }))
            .count() as u64;
        CancelSignal::AfterOps(ops)
    } else {
        CancelSignal::None
    };

    Session::start(
        &trace.envelope.request,
        &mut evaluator,
        &mut decomposer,
        sink,
        &mut clock,
        &mut ids,
        cancel,
    )?
    .run()
}

struct ReplayEvaluator {
    evaluations: VecDeque<EvaluationOutcome>,
}

impl Evaluator for ReplayEvaluator {
    fn evaluate(
        &mut self,
        _node: &NodeSnapshot,
        _context: Option<&ContrastiveContext>,
        _evidence: &cw_model::EvidenceBundle,
    ) -> Result<EvaluationOutcome, crate::ports::PortError> {
        self.evaluations
            .pop_front()
            .ok_or_else(|| crate::ports::PortError::new("replay trace has no further evaluations"))
    }
}

struct ReplayDecomposer {
    decompositions: VecDeque<DecompositionOutcome>,
}

impl Decomposer for ReplayDecomposer {
    fn decompose(
        &mut self,
        _target: &TargetSpec,
    ) -> Result<DecompositionOutcome, crate::ports::PortError> {
        self.decompositions
            .pop_front()
            .ok_or_else(|| crate::ports::PortError::new("replay trace has no further decompositions"))
    }
}

struct ReplayClock {
    timestamps: VecDeque<u64>,
}

impl Clock for ReplayClock {
    fn now_unix_ms(&mut self) -> u64 {
        self.timestamps.pop_front().unwrap_or(0)
    }
}

struct Session<'a> {
    request: SessionRequest,
    config: Config,
    bundle: ProfileBundle,
    set: HypothesisSet,
    credits: Credits,
    tau_effective: f64,
    frame_score: f64,
    log: AuditLog,
    sink: &'a mut dyn AuditSink,
    clock: &'a mut dyn Clock,
    evaluator: &'a mut dyn Evaluator,
    decomposer: &'a mut dyn Decomposer,
    cancel: CancelSignal,
    session_id: String,
    queue: PairQueue,
    discriminators: DiscriminatorLedger,
    ops_executed: u64,
    evaluations_total: usize,
    contradiction_count: usize,
    non_discriminative_count: usize,
    deferral_emitted: BTreeSet<PairKey>,
    active_emitted: Option<(Vec<CanonicalId>, Option<PairKey>)>,
}

impl<'a> Session<'a> {
    #[allow(clippy::too_many_arguments)]
    fn start(
        request: &SessionRequest,
        evaluator: &'a mut dyn Evaluator,
        decomposer: &'a mut dyn Decomposer,
        sink: &'a mut dyn AuditSink,
        clock: &'a mut dyn Clock,
        ids: &mut dyn IdProvider,
        cancel: CancelSignal,
    ) -> Result<Self, SessionError> {
        let mut config = request.config.clone();
        let bundle = config.apply_profile()?;
        config.validate()?;

        let envelope = SessionEnvelope::new(request, &bundle)?;
        sink.append(&TraceRecord::Envelope(envelope))?;

        let set = HypothesisSet::bootstrap(&request.roots, &config)?;
        let credits = Credits::new(request.credits, config.counterevidence_reserve);
        let frame_score = frame_adequacy(request);

        Ok(Self {
            request: request.clone(),
            tau_effective: config.tau,
            config,
            bundle,
            set,
            credits,
            frame_score,
            log: AuditLog::new(),
            sink,
            clock,
            evaluator,
            decomposer,
            cancel,
            session_id: ids.session_id(),
            queue: PairQueue::new(),
            discriminators: DiscriminatorLedger::new(),
            ops_executed: 0,
            evaluations_total: 0,
            contradiction_count: 0,
            non_discriminative_count: 0,
            deferral_emitted: BTreeSet::new(),
            active_emitted: None,
        })
    }

    fn emit(
        &mut self,
        target: impl Into<String>,
        payload: AuditPayload,
        credits_before: u64,
        credits_after: u64,
    ) -> Result<(), SessionError> {
        let event = AuditEvent::new(
            self.log.next_seq(),
            self.clock.now_unix_ms(),
            target,
            payload,
            credits_before,
            credits_after,
        );
        self.sink.append(&TraceRecord::Event(event.clone()))?;
        self.log.append(event)?;
        Ok(())
    }

    fn run(mut self) -> Result<SessionResult, SessionError> {
        let named = self
            .set
            .named_masses()
            .into_iter()
            .map(|(id, mass)| cw_model::RootMass { id, mass })
            .collect();
        let remaining = self.credits.remaining();
        self.emit(
            "session",
            AuditPayload::SessionBootstrap {
                world: self.set.world(),
                named,
                noa_mass: self.set.noa.map_or(0.0, |a| a.mass),
                und_mass: self.set.und.mass,
            },
            remaining,
            remaining,
        )?;

        if let Some(reason) = self.run_gates()? {
            return self.finish(reason, None);
        }

        loop {
            if self.cancel.is_cancelled(self.ops_executed) {
                let remaining = self.credits.remaining();
                self.emit(
                    "session",
                    AuditPayload::CancellationObserved,
                    remaining,
                    remaining,
                )?;
                return self.finish(StopReason::Cancelled, None);
            }

            let views = self.build_views();
            let frontier_view = frontier(&views, self.config.epsilon);
            let (planned, task, catalog) = self.plan(&views, &frontier_view)?;

            let confident = frontier_confident(&views, &frontier_view, self.tau_effective);
            let closure = closure_report(
                &views,
                &frontier_view,
                &self.config,
                self.queue.adjudication_complete(&catalog),
            );
            let blocked_by_reserve =
                planned.is_some() && task.is_none() && self.credits.reserve_engaged();

            let stop = evaluate_stop(&StopInputs {
                cancelled: false,
                credits_exhausted: self.credits.exhausted(),
                blocked_by_reserve,
                frontier_confident: confident,
                closure: &closure,
                has_planned_op: planned.is_some(),
            });
            if let Some(reason) = stop {
                if reason == StopReason::NoLegalOp {
                    let remaining = self.credits.remaining();
                    self.emit(
                        "session",
                        AuditPayload::ReserveEngaged {
                            credits_remaining: remaining,
                            reserve: self.credits.reserve(),
                        },
                        remaining,
                        remaining,
                    )?;
                }
                return self.finish(reason, Some(&closure));
            }

            let Some(op) = planned else {
                // evaluate_stop returns a reason whenever no operation
                // is planned, so this arm is unreachable; guard anyway.
                return self.finish(StopReason::EpistemicallyExhausted, Some(&closure));
            };
            self.execute(&op, task.as_ref(), &frontier_view)?;
        }
    }

    fn run_gates(&mut self) -> Result<Option<StopReason>, SessionError> {
        if let Err(issues) = mece_certificate(
            &self.set,
            &self.request.pair_declarations,
            self.config.max_pair_overlap,
        ) {
            self.emit_gate_failure(&issues)?;
            return Ok(Some(StopReason::MeceCertificateFailed));
        }

        if let Err(issues) = contender_space(&self.set) {
            self.emit_gate_failure(&issues)?;
            return Ok(Some(StopReason::ContenderSpaceInvalid));
        }

        match policy_compat(&self.config, self.frame_score) {
            PolicyCompat::Incompatible { issue } => {
                self.emit_gate_failure(std::slice::from_ref(&issue))?;
                Ok(Some(StopReason::PolicyConfigIncompatible))
            }
            PolicyCompat::Compatible {
                tau_effective,
                cap,
                adjusted,
            } => {
                if adjusted {
                    let remaining = self.credits.remaining();
                    let tau = self.config.tau;
                    self.emit(
                        "session",
                        AuditPayload::TauAdjusted {
                            tau,
                            cap,
                            tau_effective,
                        },
                        remaining,
                        remaining,
                    )?;
                }
                self.tau_effective = tau_effective;
                Ok(None)
            }
        }
    }

    fn emit_gate_failure(&mut self, issues: &[GateIssue]) -> Result<(), SessionError> {
        let remaining = self.credits.remaining();
        self.emit(
            "session",
            AuditPayload::GateFailed {
                issues: issues.to_vec(),
            },
            remaining,
            remaining,
        )
    }

    fn build_views(&self) -> Vec<RootWork> {
        let template = &self.config.template_slots;
        self.set
            .roots()
            .map(|root| {
                let mut slots = Vec::with_capacity(root.obligations.len());
                let slot_ps: Vec<f64> = root
                    .obligations
                    .values()
                    .filter_map(|id| self.set.node(*id).ok())
                    .map(|node| node.p)
                    .collect();
                for (index, (key, node_id)) in root.obligations.iter().enumerate() {
                    let Ok(node) = self.set.node(*node_id) else {
                        continue;
                    };
                    // A decomposed slot is exhausted only once every
                    // child has been assessed.
                    let evaluated = if node.children.is_empty() {
                        node.evaluated
                    } else {
                        node.children.values().all(|child_id| {
                            self.set
                                .node(*child_id)
                                .is_ok_and(|child| child.evaluated)
                        })
                    };
                    let impact = slot_ps
                        .iter()
                        .enumerate()
                        .filter(|(other, _)| *other != index)
                        .map(|(_, p)| *p)
                        .product();
                    slots.push(SlotWork {
                        key: key.clone(),
                        node_canonical: node.canonical_id.clone(),
                        k: node.k,
                        evaluated,
                        depth: usize::from(!node.children.is_empty()),
                        impact,
                    });
                }
                RootWork {
                    id: root.canonical_id.clone(),
                    status: root.status,
                    retired: root.retired,
                    p_ledger: root.p_ledger,
                    k_root: root.k_root,
                    missing_slots: root.missing_slots(template),
                    slots,
                }
            })
            .collect()
    }

    fn contenders(&self) -> Vec<Contender> {
        self.set
            .roots()
            .map(|root| Contender {
                id: root.canonical_id.clone(),
                mass: root.p_ledger,
                status: root.status,
                retired: root.retired,
            })
            .collect()
    }

    /// Operation selection: a legal pair-queue task first, otherwise
    /// the frontier walk.
    fn plan(
        &mut self,
        views: &[RootWork],
        frontier_view: &Frontier,
    ) -> Result<(Option<PlannedOp>, Option<PairTask>, PairCatalog), SessionError> {
        let contenders = self.contenders();
        let queue_enabled = self.config.pair_budget > 0 && self.set.root_count() >= 2;
        let active = PairQueue::active_set(&contenders, &self.config);
        let catalog = self.queue.catalog(&active, &contenders, &self.config);

        let active_signature = (active.clone(), self.queue.locked().cloned());
        if queue_enabled && self.active_emitted.as_ref() != Some(&active_signature) {
            let remaining = self.credits.remaining();
            self.emit(
                "session",
                AuditPayload::ActiveSetComputed {
                    members: active.clone(),
                    locked_pair: self.queue.locked().cloned(),
                },
                remaining,
                remaining,
            )?;
            self.active_emitted = Some(active_signature);
        }

        for (rank, pair) in catalog.deferred.iter().enumerate() {
            if self.deferral_emitted.insert(pair.clone()) {
                let remaining = self.credits.remaining();
                self.emit(
                    pair.to_string(),
                    AuditPayload::PairDeferred {
                        pair: pair.clone(),
                        rank: self.config.pair_budget + rank,
                        pair_budget: self.config.pair_budget,
                    },
                    remaining,
                    remaining,
                )?;
            }
        }

        if queue_enabled
            && let Some(task) = self.queue.next_task(&catalog, &contenders, &self.config)
            && let Some(op) = self.op_for_task(&task, views)
        {
            return Ok((Some(op), Some(task), catalog));
        }

        let op = choose_operation(views, frontier_view, &self.config, self.tau_effective);
        Ok((op, None, catalog))
    }

    fn op_for_task(&self, task: &PairTask, views: &[RootWork]) -> Option<PlannedOp> {
        let root = views.iter().find(|view| view.id == task.target)?;
        if root.status == RootStatus::Unscoped || !root.missing_slots.is_empty() {
            return Some(PlannedOp::DecomposeRoot {
                root: root.id.clone(),
            });
        }
        choose_evaluation(root, &self.config, self.tau_effective)
    }

    fn execute(
        &mut self,
        op: &PlannedOp,
        task: Option<&PairTask>,
        frontier_view: &Frontier,
    ) -> Result<(), SessionError> {
        let credits_before = self.credits.remaining();
        self.credits
            .spend()
            .map_err(|_| SessionError::Replay {
                detail: "operation scheduled with zero credits".to_owned(),
            })?;
        let credits_after = self.credits.remaining();
        self.ops_executed += 1;

        let kind = match op {
            PlannedOp::DecomposeRoot { .. } | PlannedOp::DecomposeSlot { .. } => {
                OperationKind::Decompose
            }
            PlannedOp::EvaluateSlot { .. } => OperationKind::Evaluate,
        };
        #[cfg(feature = "tracing")]
        tracing::debug!(
            target: "cw_engine",
            op = ?kind,
            root = %op.root().short(),
            credits = credits_after,
            "operation chosen"
        );
        self.emit(
            op.root().to_string(),
            AuditPayload::OperationChosen {
                op: kind,
                leader: frontier_view.leader.clone(),
                frontier_size: frontier_view.members.len(),
                via_pair_queue: task.is_some(),
            },
            credits_before,
            credits_after,
        )?;

        if let Some(task) = task {
            self.queue.record_task(task);
            let remaining = self.credits.remaining();
            self.emit(
                task.pair.to_string(),
                AuditPayload::PairTaskSelected {
                    pair: task.pair.clone(),
                    target: task.target.clone(),
                    bootstrap: task.bootstrap,
                    value: task.value,
                },
                remaining,
                remaining,
            )?;
        }

        let root_id = op.root().clone();
        self.set.root_mut(&root_id)?.credits_spent += 1;

        match op {
            PlannedOp::DecomposeRoot { root } => {
                self.execute_decompose_root(root, credits_before, credits_after)
            }
            PlannedOp::DecomposeSlot { root, slot } => {
                self.execute_decompose_slot(root, slot, credits_before, credits_after)
            }
            PlannedOp::EvaluateSlot { root, slot } => {
                self.execute_evaluate(root, slot, task, credits_before, credits_after)
            }
        }
    }

    fn execute_decompose_root(
        &mut self,
        root_id: &CanonicalId,
        credits_before: u64,
        credits_after: u64,
    ) -> Result<(), SessionError> {
        let root = self.set.root(root_id)?;
        let target = TargetSpec::Root {
            id: root_id.clone(),
            statement: root.statement.clone(),
            required_slots: self.config.template_slots.clone(),
        };

        let outcome = match self.decomposer.decompose(&target) {
            Ok(outcome) => outcome,
            Err(err) => return self.handle_port_failure(OperationKind::Decompose, &err.detail),
        };

        let materialized = match &outcome {
            DecompositionOutcome::Structure(structure) => scope_root(
                &mut self.set,
                root_id,
                structure,
                &self.config.template_slots,
                "decomposer",
            )?,
            DecompositionOutcome::Failure { reason } => {
                mark_root_unscoped(&mut self.set, root_id, reason.clone())?;
                Vec::new()
            }
        };

        self.emit(
            root_id.to_string(),
            AuditPayload::DecomposeRecorded {
                target,
                outcome,
                materialized,
            },
            credits_before,
            credits_after,
        )?;
        self.set.check_invariants()?;
        Ok(())
    }

    fn execute_decompose_slot(
        &mut self,
        root_id: &CanonicalId,
        slot: &str,
        credits_before: u64,
        credits_after: u64,
    ) -> Result<(), SessionError> {
        let slot_id = slot_node_id(&self.set, root_id, slot)?;
        let statement = self.set.node(slot_id)?.statement.clone();
        let target = TargetSpec::Slot {
            root: root_id.clone(),
            slot: slot.to_owned(),
            statement,
        };

        let outcome = match self.decomposer.decompose(&target) {
            Ok(outcome) => outcome,
            Err(err) => return self.handle_port_failure(OperationKind::Decompose, &err.detail),
        };

        let mut materialized = Vec::new();
        let mut anomalies = Vec::new();
        if let DecompositionOutcome::Structure(structure) = &outcome {
            let (created, coupling_anomalies) =
                scope_slot(&mut self.set, root_id, slot, structure)?;
            materialized = created;
            anomalies = coupling_anomalies;
        }

        let target_id = target.target_id();
        self.emit(
            target_id.clone(),
            AuditPayload::DecomposeRecorded {
                target,
                outcome,
                materialized,
            },
            credits_before,
            credits_after,
        )?;
        for (anomaly, detail) in anomalies {
            self.emit(
                target_id.clone(),
                AuditPayload::AnomalyRecorded { anomaly, detail },
                credits_after,
                credits_after,
            )?;
        }
        self.set.check_invariants()?;
        Ok(())
    }

    fn execute_evaluate(
        &mut self,
        root_id: &CanonicalId,
        slot: &str,
        task: Option<&PairTask>,
        credits_before: u64,
        credits_after: u64,
    ) -> Result<(), SessionError> {
        let target = self.refine_evaluation_target(root_id, slot)?;
        let display_id = self.set.root(root_id)?.display_id.clone();
        let node_key = target.key(&display_id);

        let node_id = crate::pipeline::resolve_target(&self.set, &target)?;
        let node = self.set.node(node_id)?;
        let snapshot = NodeSnapshot {
            key: node_key.clone(),
            canonical_id: node.canonical_id.clone(),
            statement: node.statement.clone(),
            role: node.role,
            p: node.p,
            k: node.k,
            assumptions: node.assumptions.clone(),
        };
        let p_prev = node.p;

        let context = task.map(|task| ContrastiveContext {
            pair: task.pair.clone(),
            target_side: task.target_side,
            discriminator_hint: self.declared_discriminator(&task.pair),
        });

        let outcome = match self
            .evaluator
            .evaluate(&snapshot, context.as_ref(), &self.request.evidence)
        {
            Ok(outcome) => outcome,
            Err(err) => return self.handle_port_failure(OperationKind::Evaluate, &err.detail),
        };

        let enforced = enforce_evaluation(
            &outcome,
            p_prev,
            context.as_ref(),
            &self.request.evidence,
            &self.discriminators,
            &self.config,
        );

        // Stats feed dynamic abstention and the epistemic stop report.
        self.evaluations_total += 1;
        if outcome.entailment == cw_model::Entailment::Contradicts {
            self.contradiction_count += 1;
        }
        if enforced.non_discriminative {
            self.non_discriminative_count += 1;
        }

        let dynamic_und = if self.config.dynamic_abstention.enabled {
            let contenders = self.contenders();
            let active = PairQueue::active_set(&contenders, &self.config);
            let catalog = self.queue.catalog(&active, &contenders, &self.config);
            let inputs = AbstentionInputs {
                unresolved_pair_ratio: self.queue.unresolved_ratio(&catalog),
                contradiction_density: self.contradiction_count as f64
                    / self.evaluations_total as f64,
                non_discriminative_density: self.non_discriminative_count as f64
                    / self.evaluations_total as f64,
                frame_inadequacy: 1.0 - self.frame_score,
            };
            let abstention = dynamic_abstention_mass(inputs, &self.config.dynamic_abstention);
            self.emit(
                "session",
                AuditPayload::AbstentionComputed {
                    unresolved_pair_ratio: inputs.unresolved_pair_ratio,
                    contradiction_density: inputs.contradiction_density,
                    non_discriminative_density: inputs.non_discriminative_density,
                    frame_inadequacy: inputs.frame_inadequacy,
                    pressure: abstention.pressure,
                    mass: abstention.mass,
                },
                credits_after,
                credits_after,
            )?;
            Some(abstention.mass)
        } else {
            None
        };

        let trail = apply_evaluation(
            &mut self.set,
            &target,
            &enforced,
            &outcome,
            &self.config,
            dynamic_und,
        )?;

        self.emit(
            node_key.clone(),
            AuditPayload::EvaluateRecorded {
                node_key: node_key.clone(),
                outcome: outcome.clone(),
                p_stored: enforced.p_stored,
                k_derived: trail.k_derived,
                guardrail: trail.guardrail,
            },
            credits_before,
            credits_after,
        )?;

        for note in &enforced.notes {
            let payload = match note.clone() {
                EnforcementNote::Anomaly { anomaly, detail } => {
                    AuditPayload::AnomalyRecorded { anomaly, detail }
                }
                EnforcementNote::ConservativeDelta {
                    p_prev,
                    p_requested,
                    p_stored,
                } => AuditPayload::ConservativeDeltaEnforced {
                    p_prev,
                    p_requested,
                    p_stored,
                },
                EnforcementNote::ContradictionFloor {
                    p_prev,
                    p_requested,
                    p_stored,
                } => AuditPayload::ContradictionFloorApplied {
                    p_prev,
                    p_requested,
                    p_stored,
                },
                EnforcementNote::DiscriminatorInvalidated {
                    discriminator_id,
                    reason,
                } => AuditPayload::DiscriminatorInvalidated {
                    discriminator_id,
                    reason,
                },
                EnforcementNote::NcDriftBounded {
                    p_prev,
                    p_requested,
                    p_stored,
                    epsilon_nc,
                } => AuditPayload::NonDiscriminativeDriftBounded {
                    p_prev,
                    p_requested,
                    p_stored,
                    epsilon_nc,
                },
                EnforcementNote::QuoteDegraded {
                    discriminator_id,
                    evidence_id,
                } => AuditPayload::QuoteFidelityDegraded {
                    discriminator_id,
                    evidence_id,
                },
                EnforcementNote::QuoteBlocked {
                    discriminator_id,
                    evidence_id,
                } => AuditPayload::QuoteFidelityBlocked {
                    discriminator_id,
                    evidence_id,
                },
            };
            self.emit(node_key.clone(), payload, credits_after, credits_after)?;
        }

        if let Some(aggregation) = &trail.aggregation {
            self.emit(
                format!("{display_id}:{}", aggregation.slot),
                AuditPayload::SlotAggregated {
                    slot: aggregation.slot.clone(),
                    decomposition: aggregation.decomposition,
                    coupling: aggregation.coupling,
                    child_keys: aggregation.outcome.child_keys.clone(),
                    child_ps: aggregation.outcome.child_ps.clone(),
                    m: aggregation.outcome.m,
                },
                credits_after,
                credits_after,
            )?;
        }

        self.emit(
            root_id.to_string(),
            AuditPayload::LedgerUpdated {
                p_prev: trail.ledger.p_prev,
                multiplier_raw: trail.ledger.multiplier_raw,
                multiplier_clamped: trail.ledger.multiplier_clamped,
                regularizer: trail.ledger.regularizer,
                p_prop: trail.ledger.p_prop,
                alpha: trail.ledger.alpha,
                p_new: trail.ledger.p_new,
            },
            credits_after,
            credits_after,
        )?;
        self.emit(
            "ledger",
            AuditPayload::AbsorberEnforced {
                branch: trail.absorber.branch,
                named_sum_before: trail.absorber.named_sum_before,
                named_sum_after: trail.absorber.named_sum_after,
                noa_mass: trail.absorber.noa_mass,
                und_mass: trail.absorber.und_mass,
            },
            credits_after,
            credits_after,
        )?;
        for (anomaly, detail) in trail.anomalies.clone() {
            self.emit(
                "ledger",
                AuditPayload::AnomalyRecorded { anomaly, detail },
                credits_after,
                credits_after,
            )?;
        }

        // Verdict refresh for every pair the accepted records touch.
        let mut touched: Vec<PairKey> = Vec::new();
        for record in &enforced.accepted {
            self.discriminators.accept(record.clone());
            if !touched.contains(&record.pair) {
                touched.push(record.pair.clone());
            }
        }
        for pair in touched {
            let verdict = self.discriminators.verdict(&pair);
            self.queue.record_verdict(&pair, verdict);
            self.emit(
                pair.to_string(),
                AuditPayload::PairVerdictUpdated {
                    pair: pair.clone(),
                    verdict: verdict.verdict,
                    left_count: verdict.left_count,
                    right_count: verdict.right_count,
                    margin: verdict.margin,
                },
                credits_after,
                credits_after,
            )?;
            self.retire_adjudicated_loser(&pair, verdict.verdict, credits_after)?;
        }

        Ok(())
    }

    /// A decisively out-adjudicated root that has also fallen out of
    /// the frontier band is retired from further adjudication. Its
    /// record and ledger mass are preserved.
    fn retire_adjudicated_loser(
        &mut self,
        pair: &PairKey,
        verdict: cw_model::PairVerdict,
        credits_now: u64,
    ) -> Result<(), SessionError> {
        let loser_id = match verdict {
            cw_model::PairVerdict::FavorsLeft => pair.right().clone(),
            cw_model::PairVerdict::FavorsRight => pair.left().clone(),
            cw_model::PairVerdict::Unresolved => return Ok(()),
        };
        let leader_mass = self
            .set
            .roots()
            .map(|root| root.p_ledger)
            .fold(0.0_f64, f64::max);
        let loser = self.set.root(&loser_id)?;
        if loser.retired || loser.p_ledger >= leader_mass - self.config.epsilon {
            return Ok(());
        }
        self.set.root_mut(&loser_id)?.retired = true;
        self.emit(
            loser_id.to_string(),
            AuditPayload::ContenderRetired {
                root: loser_id.clone(),
                pair: pair.clone(),
            },
            credits_now,
            credits_now,
        )
    }

    /// A slot with unevaluated children refines to its lowest-`k`
    /// unevaluated child; otherwise the slot node itself is evaluated.
    fn refine_evaluation_target(
        &self,
        root_id: &CanonicalId,
        slot: &str,
    ) -> Result<EvaluationTarget, SessionError> {
        let slot_id = slot_node_id(&self.set, root_id, slot)?;
        let slot_node = self.set.node(slot_id)?;
        let mut best: Option<(String, f64, CanonicalId)> = None;
        for (key, child_id) in &slot_node.children {
            let child = self.set.node(*child_id)?;
            if child.evaluated {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, best_k, best_canonical)) => {
                    child.k < *best_k
                        || (child.k == *best_k && child.canonical_id < *best_canonical)
                }
            };
            if better {
                best = Some((key.clone(), child.k, child.canonical_id.clone()));
            }
        }
        Ok(EvaluationTarget {
            root: root_id.clone(),
            slot: slot.to_owned(),
            child: best.map(|(key, _, _)| key),
        })
    }

    fn declared_discriminator(&self, pair: &PairKey) -> Option<String> {
        let left_display = self.set.root(pair.left()).ok()?.display_id.clone();
        let right_display = self.set.root(pair.right()).ok()?.display_id.clone();
        self.request
            .pair_declarations
            .iter()
            .find(|declaration| {
                (declaration.left == left_display && declaration.right == right_display)
                    || (declaration.left == right_display && declaration.right == left_display)
            })
            .map(|declaration| declaration.discriminator.clone())
    }

    fn handle_port_failure(
        &mut self,
        op: OperationKind,
        detail: &str,
    ) -> Result<(), SessionError> {
        let refunded = if self.config.refund_on_port_failure {
            self.credits.refund().is_ok()
        } else {
            false
        };
        let remaining = self.credits.remaining();
        self.emit(
            "session",
            AuditPayload::PortFailureRecorded {
                op,
                reason: detail.to_owned(),
                credit_refunded: refunded,
            },
            remaining,
            remaining,
        )?;
        #[cfg(feature = "tracing")]
        tracing::warn!(target: "cw_engine", op = ?op, detail, "port failure");
        Err(SessionError::Port {
            op,
            detail: detail.to_owned(),
        })
    }

    fn build_guidance(&self, closure: Option<&ClosureReport>) -> Vec<String> {
        let mut guidance = Vec::new();
        let contenders = self.contenders();
        let active = PairQueue::active_set(&contenders, &self.config);
        let catalog = self.queue.catalog(&active, &contenders, &self.config);
        for (pair, _) in &catalog.feasible {
            let left = self
                .set
                .root(pair.left())
                .map(|r| r.display_id.clone())
                .unwrap_or_else(|_| pair.left().short().to_owned());
            let right = self
                .set
                .root(pair.right())
                .map(|r| r.display_id.clone())
                .unwrap_or_else(|_| pair.right().short().to_owned());
            guidance.push(format!(
                "adjudicate {left} vs {right}: no directional discriminator has landed"
            ));
        }
        for root in self.set.roots() {
            if root.status == RootStatus::Unscoped {
                guidance.push(format!(
                    "scope {} before further evaluation",
                    root.display_id
                ));
            }
            for (slot, node_id) in &root.obligations {
                if self
                    .set
                    .node(*node_id)
                    .is_ok_and(|node| !node.evaluated)
                {
                    guidance.push(format!("evaluate {}:{slot}", root.display_id));
                }
            }
        }
        if self.credits.reserve_engaged() {
            guidance.push(format!(
                "only the counterevidence reserve of {} credit(s) remains",
                self.credits.reserve()
            ));
        }
        if let Some(closure) = closure {
            if !closure.winner_margin_ok {
                guidance.push(format!(
                    "winner margin {:.3} is below the decision contract minimum {:.3}",
                    closure.winner_margin, self.config.min_winner_margin
                ));
            }
            if !closure.depth_ok {
                guidance.push(
                    "decompose required slots to the configured minimum depth".to_owned(),
                );
            }
        }
        guidance
    }

    fn finish(
        mut self,
        reason: StopReason,
        closure: Option<&ClosureReport>,
    ) -> Result<SessionResult, SessionError> {
        let remaining = self.credits.remaining();

        let mut guidance = Vec::new();
        if matches!(
            reason,
            StopReason::EpistemicallyExhausted | StopReason::NoLegalOp
        ) {
            guidance = self.build_guidance(closure);
            if !guidance.is_empty() {
                self.emit(
                    "session",
                    AuditPayload::GuidanceEmitted {
                        guidance: guidance.clone(),
                    },
                    remaining,
                    remaining,
                )?;
            }
        }

        let structural = matches!(
            reason,
            StopReason::MeceCertificateFailed
                | StopReason::PolicyConfigIncompatible
                | StopReason::ContenderSpaceInvalid
        );

        let selection_output = if structural {
            None
        } else {
            self.set
                .roots()
                .fold(None::<&RootHypothesis>, |best, root| match best {
                    Some(current)
                        if current.p_ledger > root.p_ledger
                            || (current.p_ledger == root.p_ledger
                                && current.canonical_id < root.canonical_id) =>
                    {
                        Some(current)
                    }
                    _ => Some(root),
                })
                .map(|root| SelectionOutput {
                    root: root.canonical_id.clone(),
                    display_id: root.display_id.clone(),
                    p_ledger: root.p_ledger,
                })
        };

        let certification_output = if structural || !self.config.dual_output {
            None
        } else {
            let certified = reason == StopReason::FrontierConfident
                && closure.is_some_and(ClosureReport::pass);
            if let Some(closure) = closure
                && matches!(
                    reason,
                    StopReason::FrontierConfident | StopReason::ClosureGatesUnmet
                )
            {
                let winner = selection_output.as_ref().map(|s| s.root.clone());
                self.emit(
                    "session",
                    AuditPayload::DecisionContractChecked {
                        passed: certified,
                        winner: winner.clone(),
                        margin: closure.winner_margin,
                        min_winner_margin: self.config.min_winner_margin,
                    },
                    remaining,
                    remaining,
                )?;
            }
            if certified {
                selection_output.as_ref().map(|selection| CertificationOutput {
                    status: CertificationStatus::Certified,
                    root: Some(selection.root.clone()),
                    display_id: selection.display_id.clone(),
                })
            } else {
                Some(CertificationOutput {
                    status: CertificationStatus::Abstain,
                    root: None,
                    display_id: "H_UND".to_owned(),
                })
            }
        };

        self.emit(
            "session",
            AuditPayload::StopRecorded { reason },
            remaining,
            remaining,
        )?;
        #[cfg(feature = "tracing")]
        tracing::debug!(target: "cw_engine", reason = ?reason, credits = remaining, "session stopped");

        let ledger = self.set.ledger_snapshot();
        self.sink
            .append(&TraceRecord::Terminator(SessionTerminator {
                stop_reason: reason,
                final_ledger: ledger.clone(),
                credits_remaining: remaining,
            }))?;

        let envelope = SessionEnvelope::new(&self.request, &self.bundle)?;
        Ok(SessionResult {
            roots: self.set.roots().cloned().collect(),
            ledger,
            audit: AuditMetadata {
                session_id: self.session_id,
                event_count: self.log.len(),
                config_hash: envelope.config_hash,
                profile_fingerprint: envelope.profile_fingerprint,
            },
            stop_reason: reason,
            credits_remaining: remaining,
            selection_output,
            certification_output,
            next_step_guidance: guidance,
        })
    }
}

#[cfg(test)]
mod tests {
    use cw_audit::MemorySink;
    use cw_model::{
        Config, DecompositionOutcome, EvaluationOutcome, EventKind, PairDeclaration,
        ReasoningMode, RootSpec, SessionRequest, StopReason, TargetSpec,
    };

    use crate::ports::{Decomposer, Evaluator, PortError};

    use super::{SessionDeps, run_session};

    struct RefusingDecomposer;

    impl Decomposer for RefusingDecomposer {
        fn decompose(&mut self, _target: &TargetSpec) -> Result<DecompositionOutcome, PortError> {
            Ok(DecompositionOutcome::Failure {
                reason: "refused".to_owned(),
            })
        }
    }

    struct UnreachableEvaluator;

    impl Evaluator for UnreachableEvaluator {
        fn evaluate(
            &mut self,
            node: &cw_model::NodeSnapshot,
            _context: Option<&cw_model::ContrastiveContext>,
            _evidence: &cw_model::EvidenceBundle,
        ) -> Result<EvaluationOutcome, PortError> {
            Err(PortError::new(format!("unexpected evaluation of {}", node.key)))
        }
    }

    fn request(config: Config, credits: u64) -> SessionRequest {
        SessionRequest {
            claim: "which mechanism explains the fault".to_owned(),
            roots: vec![
                RootSpec::new("H1", "Alpha mechanism", "not beta"),
                RootSpec::new("H2", "Beta mechanism", "not alpha"),
            ],
            pair_declarations: vec![PairDeclaration {
                left: "H1".to_owned(),
                right: "H2".to_owned(),
                overlap: 0,
                discriminator: "alpha residue vs beta signature".to_owned(),
            }],
            evidence: cw_model::EvidenceBundle::new(),
            config,
            credits,
            frame_adequacy: Some(1.0),
        }
    }

    fn run(request: &SessionRequest, sink: &mut MemorySink) -> super::SessionResult {
        run_session(
            request,
            SessionDeps {
                evaluator: &mut UnreachableEvaluator,
                decomposer: &mut RefusingDecomposer,
                sink,
                clock: None,
                id_provider: None,
                cancel: None,
            },
        )
        .expect("session runs")
    }

    #[test]
    fn missing_pair_declaration_fails_the_mece_gate() {
        let mut req = request(Config::default(), 5);
        req.pair_declarations.clear();
        let mut sink = MemorySink::new();
        let result = run(&req, &mut sink);
        assert_eq!(result.stop_reason, StopReason::MeceCertificateFailed);
        assert_eq!(result.credits_remaining, 5);
        assert!(result.selection_output.is_none());
    }

    #[test]
    fn compositional_roots_without_components_are_invalid() {
        let mut req = request(Config::default(), 5);
        req.roots[1].story_cardinality = 2;
        let mut sink = MemorySink::new();
        let result = run(&req, &mut sink);
        assert_eq!(result.stop_reason, StopReason::ContenderSpaceInvalid);
    }

    #[test]
    fn certify_mode_rejects_an_unreachable_tau() {
        let mut config = Config::default();
        config.profile = "certify_default".to_owned();
        config.tau = 0.97;
        let req = request(config, 5);
        let mut sink = MemorySink::new();
        let result = run(&req, &mut sink);
        assert_eq!(result.stop_reason, StopReason::PolicyConfigIncompatible);
    }

    #[test]
    fn explore_mode_records_the_tau_adjustment() {
        let mut config = Config::default();
        config.reasoning_mode = ReasoningMode::Explore;
        config.tau = 0.93;
        config.calibration_cap = 0.80;
        let req = request(config, 1);
        let mut sink = MemorySink::new();
        let result = run(&req, &mut sink);
        // The failing decomposer leaves both roots unscoped until the
        // budget runs out; the adjustment event must still be present.
        assert_eq!(result.stop_reason, StopReason::CreditsExhausted);
        let adjusted = sink.records().iter().any(|record| {
            matches!(
                record,
                cw_audit::TraceRecord::Event(event) if event.kind == EventKind::TauAdjusted
            )
        });
        assert!(adjusted);
    }
}
