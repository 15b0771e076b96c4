#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use promotion_pipeline::artifact::{Artifact, ArtifactKind, ArtifactPayload, SignalDraft};
use promotion_pipeline::config::Config;
use promotion_pipeline::error::Result;
use promotion_pipeline::executor::{input_of, ExecutionResult, ExecutorRegistry, ExperimentContext, StageExecutor};
use promotion_pipeline::manifest::StrategyManifest;
use promotion_pipeline::model::{now_ms, ExperimentId, FeedbackSignal, Invocation, InvocationStatus, SignalKind};
use promotion_pipeline::orchestrator::Orchestrator;
use promotion_pipeline::scheduler::retry::RetryConfig;
use promotion_pipeline::stage::StageKind;

pub fn config(dir: &Path) -> Config {
    std::env::set_var("LOG_DIR", "off");
    let mut score_min = BTreeMap::new();
    score_min.insert("sharpe".to_string(), 1.0);
    let mut cfg = Config {
        db_path: dir.join("ledger.sqlite").to_string_lossy().into_owned(),
        artifact_dir: dir.join("artifacts").to_string_lossy().into_owned(),
        journal_path: dir.join("results.jsonl").to_string_lossy().into_owned(),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 5,
            max_delay_ms: 20,
            jitter_factor: 0.0,
        },
        approval_timeout_secs: 0,
        monitor_interval_secs: 0,
        tick_ms: 10,
        score_min,
        ..Config::default()
    };
    cfg.stage_caps.insert(StageKind::Backtest, 4);
    cfg
}

pub fn manifest(summary: &str) -> StrategyManifest {
    serde_json::from_value(json!({
        "metadata": {
            "strategy_id": "ema_cross",
            "display_name": "EMA cross",
            "summary": summary,
            "parameters": [
                {"name": "fast", "type_hint": "int", "min_value": 2.0, "max_value": 50.0},
                {"name": "slow", "type_hint": "int", "min_value": 10.0}
            ]
        },
        "default_config": {"fast": 10, "slow": 30},
        "parameter_grid": {"fast": [5, 10], "slow": [20, 40]},
        "instrumentation_hooks": ["on_bar"]
    }))
    .unwrap()
}

pub fn metrics(sharpe: f64) -> BTreeMap<String, f64> {
    let mut m = BTreeMap::new();
    m.insert("sharpe".to_string(), sharpe);
    m.insert("max_drawdown".to_string(), 0.12);
    m
}

/// Reference executors with scripted Backtest, Deploy and Monitor.
pub fn executors(
    cfg: &Config,
    backtest: impl StageExecutor + 'static,
    deploy: RecordingDeployer,
    monitor: ScriptedMonitor,
) -> ExecutorRegistry {
    ExecutorRegistry::reference(cfg)
        .with(StageKind::Backtest, backtest)
        .with(StageKind::Deploy, deploy)
        .with(StageKind::Monitor, monitor)
}

/// A signal as an outside watchdog would raise it.
pub fn signal(h: &Harness, exp: &ExperimentId, kind: SignalKind) -> FeedbackSignal {
    FeedbackSignal {
        experiment_id: exp.clone(),
        kind,
        severity: 1.0,
        evidence_ref: h.orch.status(exp).unwrap().manifest_ref,
        timestamp_ms: now_ms(),
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub cfg: Config,
    pub orch: Orchestrator,
}

impl Harness {
    pub fn new(backtest: impl StageExecutor + 'static) -> Self {
        Self::build(backtest, RecordingDeployer::default(), ScriptedMonitor::quiet(), |_| {})
    }

    pub fn build(
        backtest: impl StageExecutor + 'static,
        deploy: RecordingDeployer,
        monitor: ScriptedMonitor,
        tweak: impl FnOnce(&mut Config),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        tweak(&mut cfg);
        let registry = executors(&cfg, backtest, deploy, monitor);
        let orch = Orchestrator::open(cfg.clone(), registry).unwrap();
        Self { dir, cfg, orch }
    }

    pub fn with_registry(make: impl FnOnce(&Config) -> ExecutorRegistry) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let orch = Orchestrator::open(cfg.clone(), make(&cfg)).unwrap();
        Self { dir, cfg, orch }
    }

    pub async fn tick_until(&mut self, mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            self.orch.tick().await.unwrap();
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 500 ticks");
    }

    pub fn start(&self, summary: &str) -> ExperimentId {
        let m = self
            .orch
            .store()
            .put(ArtifactPayload::Manifest(manifest(summary)), None)
            .unwrap();
        self.orch.start_experiment(&m).unwrap()
    }

    pub async fn settle(&mut self) {
        assert!(
            self.orch.run_until_idle(Duration::from_secs(20)).await.unwrap(),
            "pipeline did not go idle"
        );
    }

    pub fn history(&self, exp: &ExperimentId) -> Vec<Invocation> {
        self.orch.ledger().invocations_for(exp).unwrap()
    }

    pub fn only(&self, exp: &ExperimentId, stage: StageKind) -> Invocation {
        let mut of_stage: Vec<Invocation> = self.history(exp).into_iter().filter(|i| i.stage == stage).collect();
        assert_eq!(of_stage.len(), 1, "expected one {stage} invocation");
        of_stage.remove(0)
    }

    pub fn awaiting(&self, exp: &ExperimentId) -> Invocation {
        self.history(exp)
            .into_iter()
            .find(|i| i.status == InvocationStatus::AwaitingApproval)
            .expect("an invocation awaiting approval")
    }
}

fn code_input(inputs: &[Artifact]) -> Option<&Artifact> {
    input_of(inputs, ArtifactKind::CodeBundle)
}

fn result_bundle(inputs: &[Artifact], metrics: BTreeMap<String, f64>) -> ExecutionResult {
    let Some(code) = code_input(inputs) else {
        return ExecutionResult::FatalFailure("no code bundle".into());
    };
    let parameters = match &code.payload {
        ArtifactPayload::CodeBundle { parameters, .. } => parameters.clone(),
        _ => BTreeMap::new(),
    };
    ExecutionResult::Success(ArtifactPayload::ResultBundle {
        strategy_id: "ema_cross".into(),
        metrics,
        fills_log_ref: None,
        equity_curve_ref: None,
        seed: 7,
        environment_hash: "env-test".into(),
        code_ref: code.id.clone(),
        parameters,
    })
}

/// Backtest that always reports the same metrics.
pub struct FixedBacktest {
    pub metrics: BTreeMap<String, f64>,
    pub calls: Arc<AtomicU32>,
}

impl FixedBacktest {
    pub fn new(sharpe: f64) -> Self {
        Self { metrics: metrics(sharpe), calls: Arc::new(AtomicU32::new(0)) }
    }
}

#[async_trait]
impl StageExecutor for FixedBacktest {
    async fn execute(&self, inputs: &[Artifact], _ctx: &ExperimentContext) -> ExecutionResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        result_bundle(inputs, self.metrics.clone())
    }

    fn name(&self) -> &str {
        "test:fixed-backtest"
    }
}

/// Reports the scripted sharpe values in order, repeating the last.
pub struct ScriptedBacktest {
    sharpes: Vec<f64>,
    pub calls: Arc<AtomicU32>,
}

impl ScriptedBacktest {
    pub fn new(sharpes: &[f64]) -> Self {
        Self { sharpes: sharpes.to_vec(), calls: Arc::new(AtomicU32::new(0)) }
    }
}

#[async_trait]
impl StageExecutor for ScriptedBacktest {
    async fn execute(&self, inputs: &[Artifact], _ctx: &ExperimentContext) -> ExecutionResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let sharpe = self.sharpes.get(n).or(self.sharpes.last()).copied().unwrap_or(0.0);
        result_bundle(inputs, metrics(sharpe))
    }

    fn name(&self) -> &str {
        "test:scripted-backtest"
    }
}

/// Fails retryably `failures` times, then succeeds. `u32::MAX` never succeeds.
pub struct FlakyBacktest {
    pub failures: u32,
    pub calls: Arc<AtomicU32>,
}

impl FlakyBacktest {
    pub fn new(failures: u32) -> Self {
        Self { failures, calls: Arc::new(AtomicU32::new(0)) }
    }
}

#[async_trait]
impl StageExecutor for FlakyBacktest {
    async fn execute(&self, inputs: &[Artifact], _ctx: &ExperimentContext) -> ExecutionResult {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            ExecutionResult::RetryableFailure(format!("data feed busy (call {n})"))
        } else {
            result_bundle(inputs, metrics(1.5))
        }
    }

    fn name(&self) -> &str {
        "test:flaky-backtest"
    }
}

/// Runs until cancelled.
#[derive(Clone, Default)]
pub struct BlockingStage {
    pub started: Arc<AtomicU32>,
    pub saw_cancel: Arc<AtomicBool>,
}

#[async_trait]
impl StageExecutor for BlockingStage {
    async fn execute(&self, _inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        loop {
            if ctx.is_cancelled() {
                self.saw_cancel.store(true, Ordering::SeqCst);
                return ExecutionResult::RetryableFailure("interrupted".into());
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn name(&self) -> &str {
        "test:blocking-stage"
    }
}

/// Paper deployer that counts halts.
#[derive(Clone, Default)]
pub struct RecordingDeployer {
    pub deployed: Arc<AtomicU32>,
    pub halts: Arc<AtomicU32>,
}

#[async_trait]
impl StageExecutor for RecordingDeployer {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        let Some(selection) = input_of(inputs, ArtifactKind::Selection) else {
            return ExecutionResult::FatalFailure("no selection".into());
        };
        let ArtifactPayload::Selection { code_ref, parameters, .. } = &selection.payload else {
            return ExecutionResult::FatalFailure("no selection".into());
        };
        self.deployed.fetch_add(1, Ordering::SeqCst);
        ExecutionResult::Success(ArtifactPayload::Deployment {
            deployment_id: format!("test-{}", ctx.invocation_id),
            mode: "paper".into(),
            code_ref: code_ref.clone(),
            parameters: parameters.clone(),
            selection_ref: selection.id.clone(),
        })
    }

    async fn halt(&self, _experiment: &ExperimentId) -> Result<()> {
        self.halts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "test:recording-deployer"
    }
}

/// Emits the queued signal sets, one per run, then nothing.
#[derive(Clone, Default)]
pub struct ScriptedMonitor {
    script: Arc<Mutex<VecDeque<Vec<SignalDraft>>>>,
    pub runs: Arc<AtomicU32>,
}

impl ScriptedMonitor {
    pub fn quiet() -> Self {
        Self::default()
    }

    pub fn emitting(kind: SignalKind, severity: f64) -> Self {
        let monitor = Self::default();
        monitor.script.lock().unwrap().push_back(vec![SignalDraft {
            kind,
            severity,
            note: format!("scripted {}", kind.as_str()),
        }]);
        monitor
    }
}

#[async_trait]
impl StageExecutor for ScriptedMonitor {
    async fn execute(&self, inputs: &[Artifact], _ctx: &ExperimentContext) -> ExecutionResult {
        let Some(deployment) = input_of(inputs, ArtifactKind::Deployment) else {
            return ExecutionResult::FatalFailure("no deployment".into());
        };
        self.runs.fetch_add(1, Ordering::SeqCst);
        let signals = self.script.lock().unwrap().pop_front().unwrap_or_default();
        let mut observations = BTreeMap::new();
        observations.insert("pnl".to_string(), -12.5);
        ExecutionResult::Success(ArtifactPayload::MonitorReport {
            window_start_ms: 0,
            window_end_ms: 1,
            observations,
            signals,
            deployment_ref: deployment.id.clone(),
        })
    }

    fn name(&self) -> &str {
        "test:scripted-monitor"
    }
}
