mod common;

use std::sync::Arc;

use promotion_pipeline::ledger::{InvocationSpec, Ledger};
use promotion_pipeline::model::{
    ArtifactId, ExperimentId, ExperimentStatus, FailureDetail, FailureKind, InvocationId, InvocationStatus, Outcome,
};
use promotion_pipeline::stage::StageKind;
use promotion_pipeline::PipelineError;

fn artifact(n: u8) -> ArtifactId {
    ArtifactId::from(format!("{:02x}", n).repeat(32))
}

fn ledger() -> (tempfile::TempDir, Arc<Ledger>) {
    let dir = tempfile::tempdir().unwrap();
    common::config(dir.path());
    let ledger = Ledger::open(dir.path().join("ledger.sqlite")).unwrap();
    (dir, Arc::new(ledger))
}

fn succeed(ledger: &Ledger, exp: &ExperimentId, stage: StageKind) -> InvocationId {
    let id = ledger
        .record_invocation(exp, stage, &[artifact(stage.index() as u8)], InvocationSpec::default())
        .unwrap();
    ledger.mark_running(&id).unwrap();
    ledger
        .complete_invocation(&id, &Outcome::Succeeded(artifact(stage.index() as u8 + 1)))
        .unwrap();
    id
}

#[test]
fn test_concurrent_duplicate_record_has_one_winner() {
    let (_dir, ledger) = ledger();
    let exp = ledger.create_experiment(&artifact(0)).unwrap();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let exp = exp.clone();
                s.spawn(move || ledger.record_invocation(&exp, StageKind::Ideate, &[artifact(0)], InvocationSpec::default()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    for r in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(r, Err(PipelineError::DuplicateActiveInvocation { .. })));
    }
    assert_eq!(ledger.invocations_for(&exp).unwrap().len(), 1);
}

#[test]
fn test_stage_requires_predecessor_success() {
    let (_dir, ledger) = ledger();
    let exp = ledger.create_experiment(&artifact(0)).unwrap();
    let err = ledger
        .record_invocation(&exp, StageKind::Backtest, &[], InvocationSpec::default())
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition(_)));

    succeed(&ledger, &exp, StageKind::Ideate);
    let err = ledger
        .record_invocation(&exp, StageKind::Backtest, &[], InvocationSpec::default())
        .unwrap_err();
    assert_eq!(err.exit_code(), 3);

    succeed(&ledger, &exp, StageKind::Sanitize);
    assert!(ledger
        .record_invocation(&exp, StageKind::Backtest, &[], InvocationSpec::default())
        .is_ok());
}

#[test]
fn test_deploy_cannot_succeed_without_approval() {
    let (_dir, ledger) = ledger();
    let exp = ledger.create_experiment(&artifact(0)).unwrap();
    for stage in [StageKind::Ideate, StageKind::Sanitize, StageKind::Backtest, StageKind::Score, StageKind::Select] {
        succeed(&ledger, &exp, stage);
    }

    let deploy = ledger
        .record_invocation(&exp, StageKind::Deploy, &[artifact(5)], InvocationSpec::default())
        .unwrap();
    ledger.mark_running(&deploy).unwrap();
    let err = ledger
        .complete_invocation(&deploy, &Outcome::Succeeded(artifact(9)))
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition(_)));
    assert_eq!(ledger.get_invocation(&deploy).unwrap().status, InvocationStatus::Running);
}

#[test]
fn test_completion_is_final() {
    let (_dir, ledger) = ledger();
    let exp = ledger.create_experiment(&artifact(0)).unwrap();
    let id = succeed(&ledger, &exp, StageKind::Ideate);
    let before = ledger.get_invocation(&id).unwrap();

    let again = Outcome::Failed(FailureDetail::new(FailureKind::FatalExecutorFailure, "late"));
    assert!(matches!(
        ledger.complete_invocation(&id, &again),
        Err(PipelineError::InvalidTransition(_))
    ));
    assert!(ledger.complete_invocation(&id, &Outcome::Succeeded(artifact(7))).is_err());
    assert_eq!(ledger.get_invocation(&id).unwrap(), before);
}

#[test]
fn test_history_is_a_stage_prefix() {
    let (_dir, ledger) = ledger();
    let exp = ledger.create_experiment(&artifact(0)).unwrap();
    for stage in [StageKind::Ideate, StageKind::Sanitize, StageKind::Backtest] {
        succeed(&ledger, &exp, stage);
    }

    let snapshot = ledger.get_experiment(&exp).unwrap();
    let stages: Vec<StageKind> = snapshot.history.iter().map(|i| i.stage).collect();
    assert_eq!(stages, StageKind::ORDER[..3].to_vec());
    assert_eq!(snapshot.current_stage, StageKind::Backtest);
    let ended: Vec<u64> = snapshot.history.iter().filter_map(|i| i.ended_ms).collect();
    assert!(ended.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn test_terminal_experiment_takes_no_work() {
    let (_dir, ledger) = ledger();
    let exp = ledger.create_experiment(&artifact(0)).unwrap();
    let pending = ledger
        .record_invocation(&exp, StageKind::Ideate, &[artifact(0)], InvocationSpec::default())
        .unwrap();

    let running = ledger
        .transition_experiment(&exp, ExperimentStatus::Aborted, Some("operator"))
        .unwrap();
    assert!(running.is_empty());
    assert_eq!(ledger.get_invocation(&pending).unwrap().status, InvocationStatus::Skipped);

    let err = ledger
        .record_invocation(&exp, StageKind::Ideate, &[artifact(0)], InvocationSpec::default())
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition(_)));
    assert!(ledger.list_ready(None).unwrap().is_empty());
}

#[test]
fn test_running_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.sqlite");
    let (exp, id) = {
        let ledger = Ledger::open(&path).unwrap();
        let exp = ledger.create_experiment(&artifact(0)).unwrap();
        let id = ledger
            .record_invocation(&exp, StageKind::Ideate, &[artifact(0)], InvocationSpec::default())
            .unwrap();
        ledger.mark_running(&id).unwrap();
        ledger.record_attempt(&id, 1).unwrap();
        (exp, id)
    };

    let ledger = Ledger::open(&path).unwrap();
    assert_eq!(ledger.reset_running_to_pending().unwrap(), vec![id.clone()]);
    let inv = ledger.get_invocation(&id).unwrap();
    assert_eq!((inv.status, inv.attempt), (InvocationStatus::Pending, 1));
    assert_eq!(ledger.list_ready(None).unwrap(), vec![id]);
    assert!(ledger.events_for(&exp).unwrap().iter().any(|e| e.event == "recovered"));
}
