//! The stage executor seam.
//!
//! Ideation, sanitizing, backtesting, scoring, selection, deployment and
//! monitoring are external collaborators. The scheduler reaches each one
//! through [`StageExecutor`]; [`reference`] holds in-process stand-ins and
//! [`command`] binds a stage to an external program.

pub mod command;
pub mod reference;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::artifact::{Artifact, ArtifactKind, ArtifactPayload};
use crate::config::Config;
use crate::error::Result;
use crate::model::{ArtifactId, ExperimentId, InvocationId, Trigger};
use crate::stage::StageKind;

/// Cooperative cancellation shared between the scheduler and a worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What an executor is told about the invocation it serves.
#[derive(Debug, Clone)]
pub struct ExperimentContext {
    pub experiment_id: ExperimentId,
    pub invocation_id: InvocationId,
    pub stage: StageKind,
    pub cycle: u32,
    /// 1-based.
    pub attempt: u32,
    pub trigger: Trigger,
    pub manifest_ref: ArtifactId,
    pub cancel: CancelFlag,
}

impl ExperimentContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Success(ArtifactPayload),
    RetryableFailure(String),
    FatalFailure(String),
    /// Blocks promotion without being an operational failure. Sanitize only.
    Rejected {
        reason: String,
        suggested_fix: Option<String>,
    },
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult;

    /// Stop live activity for an experiment. Only meaningful for Deploy.
    async fn halt(&self, _experiment: &ExperimentId) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// First input of the given kind.
pub fn input_of(inputs: &[Artifact], kind: ArtifactKind) -> Option<&Artifact> {
    inputs.iter().find(|a| a.kind == kind)
}

/// Executors by stage.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<StageKind, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: StageKind, executor: impl StageExecutor + 'static) -> Self {
        self.register(stage, Arc::new(executor));
        self
    }

    pub fn register(&mut self, stage: StageKind, executor: Arc<dyn StageExecutor>) {
        self.executors.insert(stage, executor);
    }

    pub fn get(&self, stage: StageKind) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&stage).cloned()
    }

    /// In-process reference executors for every stage.
    pub fn reference(cfg: &Config) -> Self {
        Self::new()
            .with(StageKind::Ideate, reference::ManifestIdeator)
            .with(StageKind::Sanitize, reference::GuardrailSanitizer::new(cfg.sanitize_forbidden.clone()))
            .with(StageKind::Backtest, reference::NullBacktester)
            .with(
                StageKind::Score,
                reference::ThresholdScorer::new(cfg.score_min.clone(), cfg.score_max.clone()),
            )
            .with(StageKind::Select, reference::BudgetSelector::new(cfg.select_allocation))
            .with(StageKind::Deploy, reference::PaperDeployer)
            .with(StageKind::Monitor, reference::NullMonitor::new(cfg.monitor_interval_secs))
    }

    /// Reference executors, with any `STAGE_CMD_<STAGE>` bindings on top.
    pub fn from_config(cfg: &Config) -> Self {
        let mut registry = Self::reference(cfg);
        let halt_timeout = Duration::from_secs(cfg.halt_timeout_secs);
        for (stage, cmd) in &cfg.stage_commands {
            let executor = command::CommandExecutor::new(*stage, cmd.clone()).with_halt_timeout(halt_timeout);
            registry.register(*stage, Arc::new(executor));
        }
        registry
    }

    pub fn stages(&self) -> Vec<(StageKind, String)> {
        let mut out: Vec<_> = self
            .executors
            .iter()
            .map(|(stage, e)| (*stage, e.name().to_string()))
            .collect();
        out.sort();
        out
    }
}
