//! Task graph scheduler.
//!
//! Every tick works out, per live experiment, the next stage of its current
//! cycle and records it in the ledger, then dispatches pending invocations
//! onto tokio tasks bounded by a per-stage semaphore. Workers only execute;
//! they report back over a channel and every outcome is written to the
//! ledger from here.

pub mod retry;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::artifact::{Artifact, ArtifactKind, ArtifactPayload, ArtifactStore};
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::executor::{CancelFlag, ExecutionResult, ExecutorRegistry, ExperimentContext, StageExecutor};
use crate::journal::{Journal, JournalEntry};
use crate::ledger::{InvocationSpec, Ledger};
use crate::logging::{log, log_alert, log_audit, obj, v_num, v_str, Domain, Level};
use crate::model::{
    now_ms, ArtifactId, Experiment, ExperimentId, ExperimentStatus, FailureDetail, FailureKind,
    FeedbackSignal, Invocation, InvocationId, InvocationStatus, Outcome, Trigger,
};
use crate::stage::StageKind;
use retry::RetryConfig;

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// How a worker finished, before anything is written to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Success { payload: ArtifactPayload, attempts: u32 },
    Fatal { reason: String, attempts: u32 },
    /// Retryable failures up to `max_attempts`.
    Exhausted { reason: String, attempts: u32 },
    Rejected { reason: String, suggested_fix: Option<String> },
    Cancelled,
    MissingInput { id: ArtifactId, reason: String },
}

#[derive(Debug)]
pub struct Completion {
    pub invocation_id: InvocationId,
    pub experiment_id: ExperimentId,
    pub stage: StageKind,
    pub outcome: WorkerOutcome,
}

struct InFlight {
    experiment_id: ExperimentId,
    stage: StageKind,
    cancel: CancelFlag,
    handle: JoinHandle<()>,
}

/// The stage to record next in the experiment's current cycle.
///
/// Walks forward from the cycle's entry stage over successes. Stops at the
/// first stage without an invocation; anything open, failed or skipped on
/// the way means there is nothing to schedule.
pub fn next_stage(exp: &Experiment) -> Option<StageKind> {
    if exp.status.is_terminal() {
        return None;
    }
    let mut stage = exp.cycle_entry;
    loop {
        let latest = exp
            .in_cycle(exp.cycle)
            .filter(|inv| inv.stage == stage)
            .max_by_key(|inv| inv.seq);
        match latest {
            None => return Some(stage),
            Some(inv) if inv.status == InvocationStatus::Succeeded => stage = stage.next()?,
            Some(_) => return None,
        }
    }
}

/// A live experiment whose cycle ended in a successful Monitor at least
/// `interval_ms` ago.
fn monitor_window_due(exp: &Experiment, interval_ms: u64, now: u64) -> bool {
    if exp.status != ExperimentStatus::Active || exp.non_terminal().next().is_some() {
        return false;
    }
    match exp.in_cycle(exp.cycle).max_by_key(|inv| inv.seq) {
        Some(inv) => {
            inv.stage == StageKind::Monitor
                && inv.status == InvocationStatus::Succeeded
                && inv.ended_ms.is_some_and(|t| t.saturating_add(interval_ms) <= now)
        }
        None => false,
    }
}

/// Inputs of the cycle's last Monitor run: the deployment and its code.
fn monitor_inputs(exp: &Experiment) -> Option<Vec<ArtifactId>> {
    exp.in_cycle(exp.cycle)
        .filter(|inv| inv.stage == StageKind::Monitor)
        .max_by_key(|inv| inv.seq)
        .map(|inv| inv.inputs.clone())
        .filter(|inputs| !inputs.is_empty())
}

fn succeeded_output(exp: &Experiment, stage: StageKind) -> Option<ArtifactId> {
    exp.in_cycle(exp.cycle)
        .filter(|inv| inv.stage == stage && inv.status == InvocationStatus::Succeeded)
        .max_by_key(|inv| inv.seq)
        .and_then(|inv| inv.output.clone())
}

pub struct Scheduler {
    cfg: Config,
    ledger: Arc<Ledger>,
    store: ArtifactStore,
    executors: ExecutorRegistry,
    journal: Journal,
    permits: HashMap<StageKind, Arc<Semaphore>>,
    in_flight: HashMap<InvocationId, InFlight>,
    done_tx: mpsc::UnboundedSender<Completion>,
    done_rx: mpsc::UnboundedReceiver<Completion>,
    buffered: VecDeque<Completion>,
    /// Set by `shutdown`: cancelled work stays `running` for recovery.
    draining: bool,
}

impl Scheduler {
    pub fn new(
        cfg: Config,
        ledger: Arc<Ledger>,
        store: ArtifactStore,
        executors: ExecutorRegistry,
        journal: Journal,
    ) -> Self {
        let permits = StageKind::ORDER
            .iter()
            .map(|&stage| (stage, Arc::new(Semaphore::new(cfg.cap_for(stage)))))
            .collect();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            ledger,
            store,
            executors,
            journal,
            permits,
            in_flight: HashMap::new(),
            done_tx,
            done_rx,
            buffered: VecDeque::new(),
            draining: false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn running_for(&self, experiment: &ExperimentId) -> Vec<InvocationId> {
        self.in_flight
            .iter()
            .filter(|(_, f)| &f.experiment_id == experiment)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// `primary` plus the code bundle it points at, when that is a different
    /// artifact.
    fn with_code_ref(&self, primary: ArtifactId) -> Vec<ArtifactId> {
        let code = self
            .store
            .get(&primary)
            .ok()
            .and_then(|a| a.payload.code_ref().cloned())
            .filter(|code| code != &primary);
        std::iter::once(primary).chain(code).collect()
    }

    fn inputs_for(&self, exp: &Experiment, stage: StageKind) -> Option<Vec<ArtifactId>> {
        let primary = if stage == StageKind::Ideate {
            exp.manifest_ref.clone()
        } else {
            succeeded_output(exp, stage.predecessor()?)?
        };
        Some(self.with_code_ref(primary))
    }

    /// How a new invocation of `stage` enters the ledger.
    fn spec_for(&self, stage: StageKind, trigger: Trigger, now: u64) -> InvocationSpec {
        let base = if self.cfg.requires_approval(stage) {
            InvocationSpec::gated(self.cfg.approval_deadline(now))
        } else {
            InvocationSpec::default()
        };
        InvocationSpec { trigger, ..base }
    }

    /// Record the next invocation of every live experiment. Returns how many
    /// were recorded.
    pub fn schedule(&mut self) -> Result<usize> {
        let now = now_ms();
        let interval_ms = self.cfg.monitor_interval_secs.saturating_mul(1000);
        let mut recorded = 0;

        for exp in self.ledger.list_active_current_cycle()? {
            let attempt = if let Some(stage) = next_stage(&exp) {
                let Some(inputs) = self.inputs_for(&exp, stage) else {
                    continue;
                };
                let spec = self.spec_for(stage, Trigger::Pipeline, now);
                self.ledger.record_invocation(&exp.id, stage, &inputs, spec).map(|_| ())
            } else if interval_ms > 0 && monitor_window_due(&exp, interval_ms, now) {
                let Some(inputs) = monitor_inputs(&exp) else {
                    continue;
                };
                let spec = self.spec_for(StageKind::Monitor, Trigger::MonitorWindow, now);
                self.ledger
                    .begin_cycle(&exp.id, StageKind::Monitor, &inputs, spec)
                    .map(|start| {
                        self.cancel_invocations(&start.superseded);
                    })
            } else {
                continue;
            };

            match attempt {
                Ok(()) => recorded += 1,
                // Another writer moved the experiment; the next tick re-reads it.
                Err(e @ (PipelineError::DuplicateActiveInvocation { .. } | PipelineError::InvalidTransition(_))) => {
                    log(
                        Level::Debug,
                        Domain::Scheduler,
                        "schedule_skipped",
                        obj(&[("experiment_id", v_str(exp.id.as_str())), ("reason", v_str(&e.to_string()))]),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recorded)
    }

    /// Start workers for pending invocations while stage permits last.
    pub fn dispatch(&mut self) -> Result<usize> {
        let mut started = 0;
        for id in self.ledger.list_ready(None)? {
            if self.in_flight.contains_key(&id) {
                continue;
            }
            let pending = self.ledger.get_invocation(&id)?;
            let Some(executor) = self.executors.get(pending.stage) else {
                self.fail_unbound(&pending)?;
                continue;
            };
            let Some(sem) = self.permits.get(&pending.stage) else {
                continue;
            };
            let Ok(permit) = Arc::clone(sem).try_acquire_owned() else {
                continue;
            };
            let inv = match self.ledger.mark_running(&id) {
                Ok(inv) => inv,
                Err(PipelineError::InvalidTransition(_)) => continue,
                Err(e) => return Err(e),
            };
            let exp = self.ledger.get_experiment(&inv.experiment_id)?;

            let cancel = CancelFlag::new();
            let ctx = ExperimentContext {
                experiment_id: inv.experiment_id.clone(),
                invocation_id: inv.id.clone(),
                stage: inv.stage,
                cycle: inv.cycle,
                attempt: inv.attempt + 1,
                trigger: inv.trigger,
                manifest_ref: exp.manifest_ref.clone(),
                cancel: cancel.clone(),
            };
            log(
                Level::Info,
                Domain::Scheduler,
                "dispatched",
                obj(&[
                    ("experiment_id", v_str(inv.experiment_id.as_str())),
                    ("invocation_id", v_str(inv.id.as_str())),
                    ("stage", v_str(inv.stage.as_str())),
                    ("executor", v_str(executor.name())),
                    ("prior_attempts", v_num(inv.attempt as f64)),
                ]),
            );

            let worker = Worker {
                ledger: Arc::clone(&self.ledger),
                store: self.store.clone(),
                retry: self.cfg.retry.clone(),
                executor,
                inv: inv.clone(),
                ctx,
            };
            let done_tx = self.done_tx.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let completion = worker.run().await;
                // Receiver gone means the scheduler is shutting down.
                let _ = done_tx.send(completion);
            });
            self.in_flight.insert(
                inv.id.clone(),
                InFlight {
                    experiment_id: inv.experiment_id,
                    stage: inv.stage,
                    cancel,
                    handle,
                },
            );
            started += 1;
        }
        Ok(started)
    }

    fn fail_unbound(&self, inv: &Invocation) -> Result<()> {
        let reason = format!("no executor registered for {}", inv.stage);
        log_alert("executor_missing", inv.experiment_id.as_str(), &reason);
        let failure = FailureDetail::new(FailureKind::FatalExecutorFailure, reason);
        match self.ledger.complete_invocation(&inv.id, &Outcome::Failed(failure)) {
            Ok(_) | Err(PipelineError::InvalidTransition(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Wait up to `timeout` for a worker to report. False when nothing is in
    /// flight or the wait ran out.
    pub async fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        if self.in_flight.is_empty() || !self.buffered.is_empty() {
            return !self.buffered.is_empty();
        }
        match tokio::time::timeout(timeout, self.done_rx.recv()).await {
            Ok(Some(completion)) => {
                self.buffered.push_back(completion);
                true
            }
            _ => false,
        }
    }

    /// Apply every reported outcome to the ledger. Returns how many were
    /// applied and the feedback signals raised by Monitor reports.
    ///
    /// An outcome that cannot be applied fails its invocation with
    /// `FatalExecutorFailure`, so nothing stays `running` without a worker.
    pub async fn drain_completions(&mut self) -> Result<(usize, Vec<FeedbackSignal>)> {
        // A finished task has already sent, so anything finished that is
        // still unreported after the drain died without reporting.
        let finished: Vec<InvocationId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        while let Ok(completion) = self.done_rx.try_recv() {
            self.buffered.push_back(completion);
        }
        let reported: HashSet<&InvocationId> = self.buffered.iter().map(|c| &c.invocation_id).collect();
        let lost: Vec<InvocationId> = if self.draining {
            Vec::new()
        } else {
            finished.into_iter().filter(|id| !reported.contains(id)).collect()
        };
        for id in lost {
            if let Some(f) = self.in_flight.get(&id) {
                self.buffered.push_back(Completion {
                    invocation_id: id.clone(),
                    experiment_id: f.experiment_id.clone(),
                    stage: f.stage,
                    outcome: WorkerOutcome::Fatal {
                        reason: "worker task ended without reporting".to_string(),
                        attempts: 0,
                    },
                });
            }
        }

        let mut applied = 0;
        let mut signals = Vec::new();
        while let Some(completion) = self.buffered.pop_front() {
            let id = completion.invocation_id.clone();
            let experiment = completion.experiment_id.clone();
            match self.handle_completion(completion).await {
                Ok(raised) => signals.extend(raised),
                Err(e) => {
                    let reason = format!("could not apply outcome: {e}");
                    log_alert("completion_failed", experiment.as_str(), &reason);
                    if let Err(e) = self.fail_invocation(&id, FailureKind::FatalExecutorFailure, reason) {
                        log(
                            Level::Error,
                            Domain::Scheduler,
                            "completion_failed",
                            obj(&[("invocation_id", v_str(id.as_str())), ("error", v_str(&e.to_string()))]),
                        );
                    }
                }
            }
            applied += 1;
        }
        Ok((applied, signals))
    }

    async fn handle_completion(&mut self, c: Completion) -> Result<Vec<FeedbackSignal>> {
        self.in_flight.remove(&c.invocation_id);
        match c.outcome.clone() {
            WorkerOutcome::Success { payload, .. } => self.complete_success(&c, payload).await,
            WorkerOutcome::Fatal { reason, .. } => {
                self.fail(&c, FailureKind::FatalExecutorFailure, reason)?;
                Ok(vec![])
            }
            WorkerOutcome::Exhausted { reason, attempts } => {
                self.fail(
                    &c,
                    FailureKind::RetryableExecutorFailure,
                    format!("{reason} (gave up after {attempts} attempts)"),
                )?;
                Ok(vec![])
            }
            WorkerOutcome::Rejected { reason, suggested_fix } if c.stage == StageKind::Sanitize => {
                self.reject_sanitize(&c, reason, suggested_fix, None)?;
                Ok(vec![])
            }
            WorkerOutcome::Rejected { reason, .. } => {
                self.fail(
                    &c,
                    FailureKind::FatalExecutorFailure,
                    format!("{} cannot reject: {reason}", c.stage),
                )?;
                Ok(vec![])
            }
            WorkerOutcome::Cancelled if self.draining => {
                log(
                    Level::Info,
                    Domain::Scheduler,
                    "left_for_recovery",
                    obj(&[
                        ("experiment_id", v_str(c.experiment_id.as_str())),
                        ("invocation_id", v_str(c.invocation_id.as_str())),
                    ]),
                );
                Ok(vec![])
            }
            WorkerOutcome::Cancelled => {
                self.fail(&c, FailureKind::CancellationRequested, "cancellation requested".to_string())?;
                Ok(vec![])
            }
            WorkerOutcome::MissingInput { id, reason } => {
                let reason = format!("input {id}: {reason}");
                self.fail(&c, FailureKind::ArtifactNotFound, reason.clone())?;
                log_alert("artifact_not_found", c.experiment_id.as_str(), &reason);
                self.settle_experiment(&c.experiment_id, ExperimentStatus::Failed, &reason)?;
                Ok(vec![])
            }
        }
    }

    fn fail(&self, c: &Completion, kind: FailureKind, reason: String) -> Result<()> {
        self.fail_invocation(&c.invocation_id, kind, reason)
    }

    /// Fail an invocation; quiet if it already finished.
    fn fail_invocation(&self, id: &InvocationId, kind: FailureKind, reason: String) -> Result<()> {
        let failure = FailureDetail::new(kind, reason);
        match self.ledger.complete_invocation(id, &Outcome::Failed(failure)) {
            Ok(_) => Ok(()),
            Err(PipelineError::InvalidTransition(reason)) => {
                log(
                    Level::Warn,
                    Domain::Scheduler,
                    "completion_ignored",
                    obj(&[("invocation_id", v_str(id.as_str())), ("reason", v_str(&reason))]),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Halt the experiment's deployment through the Deploy executor and
    /// record the halt against the live deployment, if there is one. False
    /// when no executor is bound or the halt failed.
    pub async fn halt_deployment(&self, experiment: &ExperimentId, reason: &str) -> Result<bool> {
        let Some(deployer) = self.executors.get(StageKind::Deploy) else {
            log_alert("halt_failed", experiment.as_str(), "no deploy executor bound");
            return Ok(false);
        };
        if let Err(e) = deployer.halt(experiment).await {
            log_alert("halt_failed", experiment.as_str(), &e.to_string());
            return Ok(false);
        }
        if let Some(live) = self.ledger.live_deployment(experiment)? {
            self.ledger.record_halt(&live.id, reason)?;
        }
        Ok(true)
    }

    /// A re-evaluation of a deployed strategy fell short: take the
    /// deployment down before the experiment settles.
    async fn demote(&self, experiment: &ExperimentId, reason: &str) -> Result<()> {
        if self.ledger.live_deployment(experiment)?.is_none() {
            return Ok(());
        }
        let halted = self.halt_deployment(experiment, &format!("demoted: {reason}")).await?;
        log(
            if halted { Level::Warn } else { Level::Error },
            Domain::Scheduler,
            "deployment_demoted",
            obj(&[
                ("experiment_id", v_str(experiment.as_str())),
                ("halted", v_str(if halted { "true" } else { "false" })),
                ("reason", v_str(reason)),
            ]),
        );
        Ok(())
    }

    /// Terminal experiment status from a verdict; quiet if already terminal.
    fn settle_experiment(&self, id: &ExperimentId, to: ExperimentStatus, reason: &str) -> Result<()> {
        match self.ledger.transition_experiment(id, to, Some(reason)) {
            Ok(running) => {
                self.cancel_invocations(&running);
                Ok(())
            }
            Err(PipelineError::InvalidTransition(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn complete_success(&mut self, c: &Completion, payload: ArtifactPayload) -> Result<Vec<FeedbackSignal>> {
        if self.ledger.get_invocation(&c.invocation_id)?.status.is_terminal() {
            // Superseded by a newer cycle while the worker ran.
            self.fail(c, FailureKind::CancellationRequested, "superseded".to_string())?;
            return Ok(vec![]);
        }
        let exp = self.ledger.get_experiment(&c.experiment_id)?;
        if exp.status.is_terminal() {
            self.fail(
                c,
                FailureKind::CancellationRequested,
                format!("experiment {} before completion", exp.status),
            )?;
            return Ok(vec![]);
        }
        let expected = ArtifactKind::produced_by(c.stage);
        if payload.kind() != expected {
            self.fail(
                c,
                FailureKind::FatalExecutorFailure,
                format!("{} produced {}, expected {expected}", c.stage, payload.kind()),
            )?;
            return Ok(vec![]);
        }
        if let ArtifactPayload::SanitizeReport { passed: false, violations, .. } = &payload {
            let reason = if violations.is_empty() {
                "sanitizer did not pass the code".to_string()
            } else {
                violations.join("; ")
            };
            self.reject_sanitize(c, reason, None, Some(payload))?;
            return Ok(vec![]);
        }

        let output = match self.store.put(payload.clone(), Some(&c.invocation_id)) {
            Ok(id) => id,
            Err(PipelineError::InvalidArtifact(reason)) => {
                self.fail(c, FailureKind::FatalExecutorFailure, format!("invalid output: {reason}"))?;
                return Ok(vec![]);
            }
            Err(e) => return Err(e),
        };
        let inv = match self.ledger.complete_invocation(&c.invocation_id, &Outcome::Succeeded(output.clone())) {
            Ok(inv) => inv,
            Err(PipelineError::InvalidTransition(reason)) => {
                log_alert("completion_refused", c.experiment_id.as_str(), &reason);
                self.fail(c, FailureKind::FatalExecutorFailure, reason)?;
                return Ok(vec![]);
            }
            Err(e) => return Err(e),
        };
        let input_refs: Vec<String> = inv.inputs.iter().map(|a| a.as_str().to_string()).collect();
        log_audit(c.stage.as_str(), inv.id.as_str(), &input_refs, output.as_str());

        let mut signals = Vec::new();
        match payload {
            ArtifactPayload::ScoreCard { promote: false, score, reasons, .. } => {
                let reason = format!("score {score:.3} below promotion bar: {}", reasons.join("; "));
                self.demote(&c.experiment_id, &reason).await?;
                self.settle_experiment(&c.experiment_id, ExperimentStatus::Completed, &reason)?;
            }
            ArtifactPayload::Selection { selected: false, rationale, .. } => {
                let reason = format!("not selected: {rationale}");
                self.demote(&c.experiment_id, &reason).await?;
                self.settle_experiment(&c.experiment_id, ExperimentStatus::Completed, &reason)?;
            }
            ArtifactPayload::Deployment { .. } if exp.status == ExperimentStatus::Paused => {
                match self.ledger.transition_experiment(
                    &c.experiment_id,
                    ExperimentStatus::Active,
                    Some("replacement deployed"),
                ) {
                    Ok(_) | Err(PipelineError::InvalidTransition(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            ArtifactPayload::ResultBundle {
                strategy_id,
                metrics,
                seed,
                environment_hash,
                parameters,
                ..
            } => {
                let entry = JournalEntry {
                    ts_ms: now_ms(),
                    experiment_id: c.experiment_id.clone(),
                    invocation_id: c.invocation_id.clone(),
                    strategy_id,
                    result_ref: output.clone(),
                    metrics,
                    parameters,
                    seed,
                    environment_hash,
                };
                if let Err(e) = self.journal.append(&entry) {
                    log(
                        Level::Error,
                        Domain::Scheduler,
                        "journal_append_failed",
                        obj(&[
                            ("invocation_id", v_str(c.invocation_id.as_str())),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                }
            }
            ArtifactPayload::MonitorReport { signals: drafts, .. } => {
                let now = now_ms();
                signals = drafts
                    .into_iter()
                    .map(|d| FeedbackSignal {
                        experiment_id: c.experiment_id.clone(),
                        kind: d.kind,
                        severity: d.severity,
                        evidence_ref: output.clone(),
                        timestamp_ms: now,
                    })
                    .collect();
            }
            _ => {}
        }
        Ok(signals)
    }

    /// Store the rejection report, fail the invocation and complete the
    /// experiment: promotion is blocked, nothing broke.
    fn reject_sanitize(
        &self,
        c: &Completion,
        reason: String,
        suggested_fix: Option<String>,
        report: Option<ArtifactPayload>,
    ) -> Result<()> {
        let fix_ref = match suggested_fix {
            Some(fix) => Some(self.store.put(
                ArtifactPayload::Log { lines: fix.lines().map(str::to_string).collect() },
                Some(&c.invocation_id),
            )?),
            None => None,
        };
        let report = match report {
            Some(ArtifactPayload::SanitizeReport { violations, fix_patch_ref, code_ref, .. }) => {
                Some(ArtifactPayload::SanitizeReport {
                    passed: false,
                    violations,
                    fix_patch_ref: fix_patch_ref.or(fix_ref),
                    code_ref,
                })
            }
            _ => self
                .ledger
                .get_invocation(&c.invocation_id)?
                .inputs
                .first()
                .cloned()
                .map(|code_ref| ArtifactPayload::SanitizeReport {
                    passed: false,
                    violations: vec![reason.clone()],
                    fix_patch_ref: fix_ref,
                    code_ref,
                }),
        };
        let detail = match report {
            Some(report) => {
                let report_id = self.store.put(report, Some(&c.invocation_id))?;
                format!("{reason} (report {report_id})")
            }
            None => reason,
        };
        self.fail(c, FailureKind::SanitizeRejected, detail.clone())?;
        self.settle_experiment(&c.experiment_id, ExperimentStatus::Completed, &detail)
    }

    /// Begin a new cycle entered at `stage`. Only the feedback router calls
    /// this; forward progress is `schedule`'s job.
    pub fn inject(
        &mut self,
        experiment: &ExperimentId,
        stage: StageKind,
        inputs: Vec<ArtifactId>,
        trigger: Trigger,
    ) -> Result<InvocationId> {
        let inputs = match inputs.as_slice() {
            [only] => self.with_code_ref(only.clone()),
            _ => inputs,
        };
        let spec = self.spec_for(stage, trigger, now_ms());
        let start = self.ledger.begin_cycle(experiment, stage, &inputs, spec)?;
        self.cancel_invocations(&start.superseded);
        let (cycle, id) = (start.cycle, start.entry);
        log(
            Level::Info,
            Domain::Scheduler,
            "injected",
            obj(&[
                ("experiment_id", v_str(experiment.as_str())),
                ("invocation_id", v_str(id.as_str())),
                ("stage", v_str(stage.as_str())),
                ("cycle", v_num(cycle as f64)),
                ("trigger", v_str(&trigger.tag())),
                ("superseded", v_num(start.superseded.len() as f64)),
            ]),
        );
        Ok(id)
    }

    /// Raise the cancellation flag of each listed invocation still in flight.
    pub fn cancel_invocations(&self, ids: &[InvocationId]) -> usize {
        let mut n = 0;
        for id in ids {
            if let Some(f) = self.in_flight.get(id) {
                f.cancel.cancel();
                n += 1;
            }
        }
        n
    }

    /// Cancel in-flight work of experiments that went terminal elsewhere,
    /// e.g. through `pipeline cancel` from another process.
    pub fn sync_cancellations(&self) -> Result<usize> {
        let experiments: HashSet<&ExperimentId> = self
            .in_flight
            .values()
            .filter(|f| !f.cancel.is_cancelled())
            .map(|f| &f.experiment_id)
            .collect();
        let mut n = 0;
        for exp in experiments {
            if self.ledger.get_experiment(exp)?.status.is_terminal() {
                let ids = self.running_for(exp);
                n += self.cancel_invocations(&ids);
            }
        }
        Ok(n)
    }

    /// Stop every worker and record what finished. Work interrupted here is
    /// left `running`; recovery on the next start puts it back to pending.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<()> {
        self.draining = true;
        for f in self.in_flight.values() {
            f.cancel.cancel();
        }
        let ids: Vec<InvocationId> = self.in_flight.keys().cloned().collect();
        let handles: Vec<&mut JoinHandle<()>> = self.in_flight.values_mut().map(|f| &mut f.handle).collect();
        if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
            log(
                Level::Warn,
                Domain::Scheduler,
                "shutdown_timeout",
                obj(&[("in_flight", v_num(ids.len() as f64))]),
            );
            for f in self.in_flight.values() {
                f.handle.abort();
            }
        }
        let (_, signals) = self.drain_completions().await?;
        self.in_flight.clear();
        if !signals.is_empty() {
            log(
                Level::Warn,
                Domain::Scheduler,
                "signals_dropped_at_shutdown",
                obj(&[("count", v_num(signals.len() as f64))]),
            );
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for f in self.in_flight.values() {
            f.cancel.cancel();
            f.handle.abort();
        }
    }
}

/// One dispatched invocation: loads inputs and runs the attempt loop.
struct Worker {
    ledger: Arc<Ledger>,
    store: ArtifactStore,
    retry: RetryConfig,
    executor: Arc<dyn StageExecutor>,
    inv: Invocation,
    ctx: ExperimentContext,
}

impl Worker {
    async fn run(self) -> Completion {
        let outcome = self.execute().await;
        Completion {
            invocation_id: self.inv.id,
            experiment_id: self.inv.experiment_id,
            stage: self.inv.stage,
            outcome,
        }
    }

    fn load_inputs(&self) -> std::result::Result<Vec<Artifact>, WorkerOutcome> {
        self.inv
            .inputs
            .iter()
            .map(|id| {
                self.store.get(id).map_err(|e| WorkerOutcome::MissingInput {
                    id: id.clone(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn execute(&self) -> WorkerOutcome {
        let inputs = match self.load_inputs() {
            Ok(inputs) => inputs,
            Err(missing) => return missing,
        };

        // Resumed invocations carry their earlier attempts and still get one more.
        let mut attempt = self.inv.attempt;
        loop {
            if self.ctx.is_cancelled() {
                return WorkerOutcome::Cancelled;
            }
            attempt += 1;
            if let Err(e) = self.ledger.record_attempt(&self.inv.id, attempt) {
                return WorkerOutcome::Fatal {
                    reason: format!("could not record attempt {attempt}: {e}"),
                    attempts: attempt,
                };
            }
            let ctx = ExperimentContext { attempt, ..self.ctx.clone() };
            let result = self.executor.execute(&inputs, &ctx).await;
            if ctx.is_cancelled() {
                return WorkerOutcome::Cancelled;
            }

            match result {
                ExecutionResult::Success(payload) => return WorkerOutcome::Success { payload, attempts: attempt },
                ExecutionResult::FatalFailure(reason) => return WorkerOutcome::Fatal { reason, attempts: attempt },
                ExecutionResult::Rejected { reason, suggested_fix } => {
                    return WorkerOutcome::Rejected { reason, suggested_fix }
                }
                ExecutionResult::RetryableFailure(reason) => {
                    if !self.retry.allows_another(attempt) {
                        return WorkerOutcome::Exhausted { reason, attempts: attempt };
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    log(
                        Level::Warn,
                        Domain::Scheduler,
                        "retry_scheduled",
                        obj(&[
                            ("experiment_id", v_str(self.inv.experiment_id.as_str())),
                            ("invocation_id", v_str(self.inv.id.as_str())),
                            ("stage", v_str(self.inv.stage.as_str())),
                            ("attempt", v_num(attempt as f64)),
                            ("delay_ms", v_num(delay.as_millis() as f64)),
                            ("reason", v_str(&reason)),
                        ]),
                    );
                    if self.backoff(delay).await {
                        return WorkerOutcome::Cancelled;
                    }
                }
            }
        }
    }

    /// Sleep for `delay`, returning early (true) on cancellation.
    async fn backoff(&self, delay: Duration) -> bool {
        let until = Instant::now() + delay;
        while Instant::now() < until {
            if self.ctx.is_cancelled() {
                return true;
            }
            sleep(CANCEL_POLL.min(until.saturating_duration_since(Instant::now()))).await;
        }
        self.ctx.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inv(stage: StageKind, cycle: u32, status: InvocationStatus, seq: i64) -> Invocation {
        Invocation {
            id: InvocationId::generate(),
            experiment_id: ExperimentId::from("exp-test"),
            stage,
            cycle,
            trigger: Trigger::Pipeline,
            inputs: vec![],
            attempt: 1,
            status,
            output: (status == InvocationStatus::Succeeded).then(|| ArtifactId::from("a".repeat(64))),
            failure: None,
            deadline_ms: None,
            created_ms: 0,
            started_ms: None,
            ended_ms: status.is_terminal().then_some(seq as u64),
            seq,
        }
    }

    fn experiment(cycle: u32, entry: StageKind, history: Vec<Invocation>) -> Experiment {
        Experiment {
            id: ExperimentId::from("exp-test"),
            manifest_ref: ArtifactId::from("b".repeat(64)),
            created_ms: 0,
            updated_ms: 0,
            current_stage: entry,
            status: ExperimentStatus::Active,
            status_reason: None,
            cycle,
            cycle_entry: entry,
            version: 0,
            history,
        }
    }

    #[test]
    fn test_next_stage_walks_successes() {
        use InvocationStatus::*;
        let fresh = experiment(0, StageKind::Ideate, vec![]);
        assert_eq!(next_stage(&fresh), Some(StageKind::Ideate));

        let exp = experiment(
            0,
            StageKind::Ideate,
            vec![inv(StageKind::Ideate, 0, Succeeded, 1), inv(StageKind::Sanitize, 0, Succeeded, 2)],
        );
        assert_eq!(next_stage(&exp), Some(StageKind::Backtest));
    }

    #[test]
    fn test_next_stage_stalls_on_failure_or_open_work() {
        use InvocationStatus::*;
        let failed = experiment(
            0,
            StageKind::Ideate,
            vec![inv(StageKind::Ideate, 0, Succeeded, 1), inv(StageKind::Sanitize, 0, Failed, 2)],
        );
        assert_eq!(next_stage(&failed), None);

        let open = experiment(0, StageKind::Ideate, vec![inv(StageKind::Ideate, 0, Running, 1)]);
        assert_eq!(next_stage(&open), None);
    }

    #[test]
    fn test_next_stage_only_looks_at_current_cycle() {
        use InvocationStatus::*;
        let mut history: Vec<Invocation> = StageKind::ORDER
            .iter()
            .enumerate()
            .map(|(i, &s)| inv(s, 0, Succeeded, i as i64 + 1))
            .collect();
        history.push(inv(StageKind::Backtest, 1, Succeeded, 20));
        let exp = experiment(1, StageKind::Backtest, history);
        assert_eq!(next_stage(&exp), Some(StageKind::Score));

        let done = experiment(0, StageKind::Ideate, exp.history[..7].to_vec());
        assert_eq!(next_stage(&done), None);
    }

    #[test]
    fn test_monitor_window_due() {
        use InvocationStatus::*;
        let mut monitor = inv(StageKind::Monitor, 1, Succeeded, 9);
        monitor.ended_ms = Some(1_000);
        let exp = experiment(1, StageKind::Monitor, vec![monitor]);
        assert!(!monitor_window_due(&exp, 5_000, 5_999));
        assert!(monitor_window_due(&exp, 5_000, 6_000));

        let mut paused = exp.clone();
        paused.status = ExperimentStatus::Paused;
        assert!(!monitor_window_due(&paused, 5_000, 60_000));
    }

    #[test]
    fn test_monitor_inputs_reuse_last_window() {
        use InvocationStatus::*;
        let mut monitor = inv(StageKind::Monitor, 1, Succeeded, 9);
        monitor.inputs = vec![ArtifactId::from("d".repeat(64)), ArtifactId::from("c".repeat(64))];
        let exp = experiment(1, StageKind::Monitor, vec![monitor.clone()]);
        assert_eq!(monitor_inputs(&exp), Some(monitor.inputs));
        assert_eq!(monitor_inputs(&experiment(1, StageKind::Monitor, vec![])), None);
    }
}
