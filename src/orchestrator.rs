//! Control loop tying the ledger, scheduler, gate and router together.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::artifact::ArtifactStore;
use crate::commands;
use crate::config::Config;
use crate::error::Result;
use crate::executor::ExecutorRegistry;
use crate::feedback::{FeedbackRouter, RouteAction};
use crate::gate::ApprovalGate;
use crate::journal::Journal;
use crate::ledger::Ledger;
use crate::logging::{log, obj, v_num, v_str, Domain, Level, ProfileScope};
use crate::model::{now_ms, ArtifactId, Decision, Experiment, ExperimentId, FeedbackSignal, Invocation, InvocationId};
use crate::scheduler::Scheduler;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const IDLE_POLL: Duration = Duration::from_millis(25);

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub completed: usize,
    pub expired: usize,
    pub routed: usize,
    pub cancelled: usize,
    pub scheduled: usize,
    pub dispatched: usize,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        *self == TickReport::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub reset: Vec<InvocationId>,
    pub decisions_applied: usize,
}

pub struct Orchestrator {
    cfg: Config,
    ledger: Arc<Ledger>,
    store: ArtifactStore,
    scheduler: Scheduler,
    gate: ApprovalGate,
    router: FeedbackRouter,
    feedback_tx: mpsc::UnboundedSender<FeedbackSignal>,
    feedback_rx: mpsc::UnboundedReceiver<FeedbackSignal>,
    routed: Vec<RouteAction>,
}

impl Orchestrator {
    /// Open the ledger, store and journal named by `cfg`.
    pub fn open(cfg: Config, executors: ExecutorRegistry) -> Result<Self> {
        let ledger = Arc::new(Ledger::open(&cfg.db_path)?);
        let store = ArtifactStore::open(&cfg.artifact_dir)?;
        let journal = Journal::open(&cfg.journal_path)?;
        Ok(Self::with_parts(cfg, ledger, store, journal, executors))
    }

    pub fn with_parts(
        cfg: Config,
        ledger: Arc<Ledger>,
        store: ArtifactStore,
        journal: Journal,
        executors: ExecutorRegistry,
    ) -> Self {
        let scheduler = Scheduler::new(cfg.clone(), Arc::clone(&ledger), store.clone(), executors, journal);
        let gate = ApprovalGate::new(Arc::clone(&ledger));
        let router = FeedbackRouter::new(cfg.anomaly_threshold);
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        Self {
            cfg,
            ledger,
            store,
            scheduler,
            gate,
            router,
            feedback_tx,
            feedback_rx,
            routed: Vec::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Queue for signals raised outside a Monitor report.
    pub fn feedback_sender(&self) -> mpsc::UnboundedSender<FeedbackSignal> {
        self.feedback_tx.clone()
    }

    /// Router decisions so far, oldest first.
    pub fn routed(&self) -> &[RouteAction] {
        &self.routed
    }

    /// Put interrupted work back to pending and apply decisions that were
    /// recorded but never acted on.
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        let reset = self.ledger.reset_running_to_pending()?;
        let decisions_applied = self.gate.resume_decided()?;
        log(
            Level::Info,
            Domain::System,
            "recovered",
            obj(&[
                ("reset", v_num(reset.len() as f64)),
                ("decisions_applied", v_num(decisions_applied as f64)),
            ]),
        );
        Ok(RecoveryReport { reset, decisions_applied })
    }

    pub async fn tick(&mut self) -> Result<TickReport> {
        let _profile = ProfileScope::with_context("tick", &[]);
        let mut report = TickReport::default();

        let (completed, signals) = self.scheduler.drain_completions().await?;
        report.completed = completed;
        for signal in signals {
            // The receiver lives in self.
            let _ = self.feedback_tx.send(signal);
        }

        report.expired = self.gate.expire(now_ms())?.len();

        while let Ok(signal) = self.feedback_rx.try_recv() {
            match self.router.route(&self.ledger, &mut self.scheduler, &signal).await {
                Ok(action) => {
                    self.routed.push(action);
                    report.routed += 1;
                }
                Err(e) => log(
                    Level::Error,
                    Domain::Feedback,
                    "route_failed",
                    obj(&[
                        ("experiment_id", v_str(signal.experiment_id.as_str())),
                        ("error", v_str(&e.to_string())),
                    ]),
                ),
            }
        }

        report.cancelled = self.scheduler.sync_cancellations()?;
        report.scheduled = self.scheduler.schedule()?;
        report.dispatched = self.scheduler.dispatch()?;
        Ok(report)
    }

    /// Tick until nothing moves and no worker is in flight. False if
    /// `max_wait` ran out first.
    pub async fn run_until_idle(&mut self, max_wait: Duration) -> Result<bool> {
        let deadline = Instant::now() + max_wait;
        loop {
            let report = self.tick().await?;
            if report.is_quiet() && self.scheduler.in_flight() == 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if report.is_quiet() {
                self.scheduler.wait_for_completion(IDLE_POLL).await;
            }
        }
    }

    /// The long-running loop behind `pipeline run`.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        self.recover()?;
        let mut ticker = interval(Duration::from_millis(self.cfg.tick_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        log(
            Level::Info,
            Domain::System,
            "control_loop_started",
            obj(&[("tick_ms", v_num(self.cfg.tick_ms as f64))]),
        );
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        log(Level::Error, Domain::System, "tick_failed", obj(&[("error", v_str(&e.to_string()))]));
                    }
                }
            }
        }
        log(
            Level::Info,
            Domain::System,
            "control_loop_stopping",
            obj(&[("in_flight", v_num(self.scheduler.in_flight() as f64))]),
        );
        self.scheduler.shutdown(SHUTDOWN_GRACE).await
    }

    pub fn start_experiment(&self, manifest_ref: &ArtifactId) -> Result<ExperimentId> {
        commands::start_experiment(&self.ledger, &self.store, manifest_ref)
    }

    pub fn status(&self, id: &ExperimentId) -> Result<Experiment> {
        self.ledger.get_experiment(id)
    }

    pub fn approve(&self, invocation: &InvocationId, actor: &str, comment: Option<String>) -> Result<Invocation> {
        self.gate.submit_approval(invocation, Decision::Approved, actor, comment)
    }

    pub fn reject(&self, invocation: &InvocationId, actor: &str, reason: Option<String>) -> Result<Invocation> {
        self.gate.submit_approval(invocation, Decision::Rejected, actor, reason)
    }

    /// Abort the experiment and stop its workers.
    pub fn cancel(&self, id: &ExperimentId) -> Result<()> {
        let mut running = commands::cancel_experiment(&self.ledger, id)?;
        running.extend(self.scheduler.running_for(id));
        self.scheduler.cancel_invocations(&running);
        Ok(())
    }
}
