mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{executors, BlockingStage, FixedBacktest, RecordingDeployer, ScriptedMonitor};
use promotion_pipeline::artifact::ArtifactPayload;
use promotion_pipeline::model::{InvocationStatus, Trigger};
use promotion_pipeline::orchestrator::Orchestrator;
use promotion_pipeline::stage::StageKind;

#[tokio::test]
async fn test_restart_resumes_interrupted_backtests() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = common::config(dir.path());

    let blocking = BlockingStage::default();
    let experiments = {
        let registry = executors(&cfg, blocking.clone(), RecordingDeployer::default(), ScriptedMonitor::quiet());
        let mut orch = Orchestrator::open(cfg.clone(), registry).unwrap();
        let manifest = orch
            .store()
            .put(ArtifactPayload::Manifest(common::manifest("fast/slow crossover")), None)
            .unwrap();
        let experiments = vec![
            orch.start_experiment(&manifest).unwrap(),
            orch.start_experiment(&manifest).unwrap(),
        ];
        for _ in 0..500 {
            orch.tick().await.unwrap();
            if blocking.started.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(blocking.started.load(Ordering::SeqCst), 2);
        experiments
        // Dropped without a graceful shutdown, like a killed process.
    };

    let backtest = FixedBacktest::new(1.8);
    let calls = backtest.calls.clone();
    let registry = executors(&cfg, backtest, RecordingDeployer::default(), ScriptedMonitor::quiet());
    let mut orch = Orchestrator::open(cfg, registry).unwrap();

    let running_before: Vec<_> = orch
        .ledger()
        .list_non_terminal()
        .unwrap()
        .into_iter()
        .filter(|i| i.status == InvocationStatus::Running)
        .collect();
    assert_eq!(running_before.len(), 2);
    assert!(running_before.iter().all(|i| i.stage == StageKind::Backtest));

    let report = orch.recover().unwrap();
    assert_eq!(report.reset.len(), 2);
    assert!(orch.run_until_idle(Duration::from_secs(20)).await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    for exp in &experiments {
        let history = orch.ledger().invocations_for(exp).unwrap();
        for stage in [StageKind::Ideate, StageKind::Sanitize, StageKind::Backtest] {
            assert_eq!(history.iter().filter(|i| i.stage == stage).count(), 1, "{stage} ran twice");
        }
        let backtest = history.iter().find(|i| i.stage == StageKind::Backtest).unwrap();
        assert_eq!(backtest.status, InvocationStatus::Succeeded);
        assert_eq!(backtest.attempt, 2);
        assert_eq!(backtest.trigger, Trigger::Pipeline);

        let gated = history.iter().find(|i| i.stage == StageKind::Deploy).unwrap();
        assert_eq!(gated.status, InvocationStatus::AwaitingApproval);
    }
}

#[tokio::test]
async fn test_recorded_decision_applied_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = common::config(dir.path());

    let deployer = RecordingDeployer::default();
    let registry = executors(&cfg, FixedBacktest::new(1.8), deployer.clone(), ScriptedMonitor::quiet());
    let mut orch = Orchestrator::open(cfg.clone(), registry).unwrap();
    let manifest = orch
        .store()
        .put(ArtifactPayload::Manifest(common::manifest("fast/slow crossover")), None)
        .unwrap();
    let exp = orch.start_experiment(&manifest).unwrap();
    assert!(orch.run_until_idle(Duration::from_secs(20)).await.unwrap());
    let gated = orch
        .ledger()
        .invocations_for(&exp)
        .unwrap()
        .into_iter()
        .find(|i| i.status == InvocationStatus::AwaitingApproval)
        .unwrap();

    // Recorded but never acted on.
    orch.ledger()
        .record_approval(&promotion_pipeline::model::ApprovalRecord {
            invocation_id: gated.id.clone(),
            decision: promotion_pipeline::model::Decision::Approved,
            actor: "carol".into(),
            decided_ms: promotion_pipeline::model::now_ms(),
            comment: None,
            consumed_ms: None,
        })
        .unwrap();
    drop(orch);

    let registry = executors(&cfg, FixedBacktest::new(1.8), deployer.clone(), ScriptedMonitor::quiet());
    let mut orch = Orchestrator::open(cfg, registry).unwrap();
    assert_eq!(orch.recover().unwrap().decisions_applied, 1);
    assert!(orch.run_until_idle(Duration::from_secs(20)).await.unwrap());

    assert_eq!(deployer.deployed.load(Ordering::SeqCst), 1);
    let deploy = orch.ledger().get_invocation(&gated.id).unwrap();
    assert_eq!(deploy.status, InvocationStatus::Succeeded);
}
