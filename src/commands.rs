//! Operator commands over the ledger and artifact store.
//!
//! These need no running control loop: a `run` process picks up whatever
//! they change on its next tick.

use std::fmt::Write as _;
use std::path::Path;

use serde_json::{json, Value};

use crate::artifact::{ArtifactKind, ArtifactPayload, ArtifactStore};
use crate::error::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::logging::{fmt_ms, log, obj, v_str, Domain, Level};
use crate::manifest::StrategyManifest;
use crate::model::{ArtifactId, Experiment, ExperimentId, ExperimentStatus, InvocationId};

/// Turn `--manifest <ref>` into a stored manifest artifact.
///
/// An existing file is parsed as a manifest and stored; otherwise the value
/// must be the id of a manifest already in the store.
pub fn resolve_manifest_ref(store: &ArtifactStore, raw: &str) -> Result<ArtifactId> {
    let path = Path::new(raw);
    if path.is_file() {
        let text = std::fs::read_to_string(path)?;
        let manifest: StrategyManifest = serde_json::from_str(&text)
            .map_err(|e| PipelineError::InvalidManifest(format!("{raw}: {e}")))?;
        manifest.validate()?;
        return store.put(ArtifactPayload::Manifest(manifest), None);
    }
    let id = ArtifactId::from(raw.trim());
    if !id.is_well_formed() {
        return Err(PipelineError::InvalidArtifact(format!(
            "{raw} is neither a manifest file nor an artifact id"
        )));
    }
    store.get_as(&id, ArtifactKind::Manifest)?;
    Ok(id)
}

/// Create an experiment for a stored manifest. It enters Ideate on the next
/// scheduler tick.
pub fn start_experiment(ledger: &Ledger, store: &ArtifactStore, manifest_ref: &ArtifactId) -> Result<ExperimentId> {
    let artifact = store.get_as(manifest_ref, ArtifactKind::Manifest)?;
    if let ArtifactPayload::Manifest(manifest) = &artifact.payload {
        manifest.validate()?;
    }
    ledger.create_experiment(manifest_ref)
}

/// Abort an experiment. Returns invocations still running, whose workers
/// must be told to stop.
pub fn cancel_experiment(ledger: &Ledger, id: &ExperimentId) -> Result<Vec<InvocationId>> {
    let running = ledger.transition_experiment(id, ExperimentStatus::Aborted, Some("cancelled by operator"))?;
    log(
        Level::Warn,
        Domain::System,
        "experiment_cancelled",
        obj(&[("experiment_id", v_str(id.as_str())), ("running", json!(running.len()))]),
    );
    Ok(running)
}

pub fn status_json(exp: &Experiment) -> Value {
    json!({
        "experiment_id": exp.id,
        "manifest_ref": exp.manifest_ref,
        "status": exp.status,
        "status_reason": exp.status_reason,
        "current_stage": exp.current_stage,
        "cycle": exp.cycle,
        "cycle_entry": exp.cycle_entry,
        "version": exp.version,
        "created_ms": exp.created_ms,
        "updated_ms": exp.updated_ms,
        "history": exp.history,
    })
}

pub fn render_status(exp: &Experiment) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "experiment {}  [{}]", exp.id, exp.status);
    if let Some(reason) = &exp.status_reason {
        let _ = writeln!(out, "  reason:   {reason}");
    }
    let _ = writeln!(out, "  stage:    {} (cycle {}, entered at {})", exp.current_stage, exp.cycle, exp.cycle_entry);
    let _ = writeln!(out, "  manifest: {}", exp.manifest_ref);
    let _ = writeln!(out, "  updated:  {}", fmt_ms(exp.updated_ms));
    let _ = writeln!(out, "  history:");
    if exp.history.is_empty() {
        let _ = writeln!(out, "    (none)");
    }
    for inv in &exp.history {
        let detail = match (&inv.output, &inv.failure) {
            (Some(output), _) => format!("-> {output}"),
            (None, Some(failure)) => failure.to_string(),
            (None, None) => match inv.deadline_ms {
                Some(deadline) => format!("approve by {}", fmt_ms(deadline)),
                None => String::new(),
            },
        };
        let _ = writeln!(
            out,
            "    c{:<2} {:<8} {:<17} {} attempt={} trigger={} {}",
            inv.cycle,
            inv.stage,
            inv.status,
            inv.id,
            inv.attempt,
            inv.trigger,
            detail
        );
    }
    out
}

pub fn render_list(experiments: &[Experiment]) -> String {
    if experiments.is_empty() {
        return "no experiments\n".to_string();
    }
    let mut out = String::new();
    for exp in experiments {
        let open = exp.non_terminal().count();
        let _ = writeln!(
            out,
            "{}  {:<9} {:<8} cycle={} open={} updated={}",
            exp.id,
            exp.status,
            exp.current_stage,
            exp.cycle,
            open,
            fmt_ms(exp.updated_ms)
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> StrategyManifest {
        serde_json::from_value(json!({
            "metadata": {"strategy_id": "mean_revert"},
            "parameter_grid": {"lookback": [10, 20]}
        }))
        .unwrap()
    }

    #[test]
    fn test_resolve_from_file_and_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path().join("artifacts")).unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, serde_json::to_string(&manifest()).unwrap()).unwrap();

        let id = resolve_manifest_ref(&store, path.to_str().unwrap()).unwrap();
        assert_eq!(resolve_manifest_ref(&store, id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_resolve_rejects_garbage_and_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let err = resolve_manifest_ref(&store, "no-such-thing").unwrap_err();
        assert_eq!(err.exit_code(), 1);
        let err = resolve_manifest_ref(&store, &"a".repeat(64)).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_start_refuses_non_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let ledger = Ledger::open_in_memory().unwrap();
        let log_ref = store.put(ArtifactPayload::Log { lines: vec!["x".into()] }, None).unwrap();
        assert!(start_experiment(&ledger, &store, &log_ref).is_err());
        assert!(ledger.list_experiments().unwrap().is_empty());
    }

    #[test]
    fn test_cancel_then_render() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(dir.path()).unwrap();
        let ledger = Ledger::open_in_memory().unwrap();
        let m = store.put(ArtifactPayload::Manifest(manifest()), None).unwrap();
        let exp = start_experiment(&ledger, &store, &m).unwrap();
        cancel_experiment(&ledger, &exp).unwrap();

        let snapshot = ledger.get_experiment(&exp).unwrap();
        assert_eq!(snapshot.status, ExperimentStatus::Aborted);
        let text = render_status(&snapshot);
        assert!(text.contains("aborted"));
        assert!(text.contains("cancelled by operator"));
        assert_eq!(status_json(&snapshot)["status"], "aborted");
    }
}
