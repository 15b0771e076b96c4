//! In-process stand-ins for the external stage collaborators.
//!
//! They keep `pipeline run` usable without any external program: the
//! ideator expands the manifest grid, the sanitizer and scorer apply
//! configured rules, and the deployer trades on paper. There is no
//! reference backtester; Backtest needs `STAGE_CMD_BACKTEST`.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::{input_of, ExecutionResult, ExperimentContext, StageExecutor};
use crate::artifact::{Artifact, ArtifactKind, ArtifactPayload};
use crate::error::Result;
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::model::{now_ms, ExperimentId, Trigger};

fn missing(kind: ArtifactKind, ctx: &ExperimentContext) -> ExecutionResult {
    ExecutionResult::FatalFailure(format!("{} received no {kind} input", ctx.stage))
}

/// Turns a manifest into a code bundle for one point of its grid.
///
/// Cycle `n` picks combination `n mod grid_size`, so a replacement search
/// after a kill moves on to the next parameter set.
pub struct ManifestIdeator;

#[async_trait]
impl StageExecutor for ManifestIdeator {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        let Some(ArtifactPayload::Manifest(manifest)) =
            input_of(inputs, ArtifactKind::Manifest).map(|a| &a.payload)
        else {
            return missing(ArtifactKind::Manifest, ctx);
        };

        let candidates: Vec<BTreeMap<_, _>> = manifest.iter_parameter_grid().collect();
        let parameters = match candidates.len() {
            0 => manifest.build_config(&BTreeMap::new()),
            n => manifest.build_config(&candidates[ctx.cycle as usize % n]),
        };
        let meta = &manifest.metadata;
        let rendered = serde_json::to_string_pretty(&parameters).unwrap_or_default();
        let source = format!(
            "# {}\n# strategy_id: {} v{}\n# {}\nPARAMETERS = {}\nHOOKS = {:?}\n",
            if meta.display_name.is_empty() { &meta.strategy_id } else { &meta.display_name },
            meta.strategy_id,
            meta.version,
            meta.summary,
            rendered,
            manifest.instrumentation_hooks,
        );

        ExecutionResult::Success(ArtifactPayload::CodeBundle {
            strategy_id: meta.strategy_id.clone(),
            language: "python".to_string(),
            source,
            parameters,
            candidates,
            hooks: manifest.instrumentation_hooks.clone(),
        })
    }

    fn name(&self) -> &str {
        "reference:manifest-ideator"
    }
}

/// Rejects code containing any forbidden pattern.
pub struct GuardrailSanitizer {
    forbidden: Vec<String>,
}

impl GuardrailSanitizer {
    pub fn new(forbidden: Vec<String>) -> Self {
        Self { forbidden }
    }
}

#[async_trait]
impl StageExecutor for GuardrailSanitizer {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        let Some(code) = input_of(inputs, ArtifactKind::CodeBundle) else {
            return missing(ArtifactKind::CodeBundle, ctx);
        };
        let ArtifactPayload::CodeBundle { source, .. } = &code.payload else {
            return missing(ArtifactKind::CodeBundle, ctx);
        };

        let violations: Vec<&str> = self
            .forbidden
            .iter()
            .map(String::as_str)
            .filter(|pattern| source.contains(pattern))
            .collect();
        if !violations.is_empty() {
            return ExecutionResult::Rejected {
                reason: format!("guardrails violated: {}", violations.join(", ")),
                suggested_fix: Some(format!("remove uses of {}", violations.join(", "))),
            };
        }

        ExecutionResult::Success(ArtifactPayload::SanitizeReport {
            passed: true,
            violations: vec![],
            fix_patch_ref: None,
            code_ref: code.id.clone(),
        })
    }

    fn name(&self) -> &str {
        "reference:guardrail-sanitizer"
    }
}

pub struct NullBacktester;

#[async_trait]
impl StageExecutor for NullBacktester {
    async fn execute(&self, _inputs: &[Artifact], _ctx: &ExperimentContext) -> ExecutionResult {
        ExecutionResult::FatalFailure(
            "no backtest collaborator configured (set STAGE_CMD_BACKTEST)".to_string(),
        )
    }

    fn name(&self) -> &str {
        "reference:null-backtester"
    }
}

/// Promotes when every configured metric bound holds.
pub struct ThresholdScorer {
    min: BTreeMap<String, f64>,
    max: BTreeMap<String, f64>,
}

impl ThresholdScorer {
    pub fn new(min: BTreeMap<String, f64>, max: BTreeMap<String, f64>) -> Self {
        Self { min, max }
    }

    /// Failed bounds and the fraction of bounds met.
    fn judge(&self, metrics: &BTreeMap<String, f64>) -> (Vec<String>, f64) {
        let mut reasons = Vec::new();
        for (name, bound) in &self.min {
            match metrics.get(name) {
                Some(v) if v >= bound => {}
                Some(v) => reasons.push(format!("{name} {v} below minimum {bound}")),
                None => reasons.push(format!("{name} missing (minimum {bound})")),
            }
        }
        for (name, bound) in &self.max {
            match metrics.get(name) {
                Some(v) if v <= bound => {}
                Some(v) => reasons.push(format!("{name} {v} above maximum {bound}")),
                None => reasons.push(format!("{name} missing (maximum {bound})")),
            }
        }
        let total = self.min.len() + self.max.len();
        let score = if total == 0 {
            1.0
        } else {
            (total - reasons.len()) as f64 / total as f64
        };
        (reasons, score)
    }
}

#[async_trait]
impl StageExecutor for ThresholdScorer {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        let Some(result) = input_of(inputs, ArtifactKind::ResultBundle) else {
            return missing(ArtifactKind::ResultBundle, ctx);
        };
        let ArtifactPayload::ResultBundle { metrics, code_ref, parameters, .. } = &result.payload else {
            return missing(ArtifactKind::ResultBundle, ctx);
        };
        let (reasons, score) = self.judge(metrics);
        ExecutionResult::Success(ArtifactPayload::ScoreCard {
            promote: reasons.is_empty(),
            score,
            reasons,
            result_ref: result.id.clone(),
            code_ref: code_ref.clone(),
            parameters: parameters.clone(),
        })
    }

    fn name(&self) -> &str {
        "reference:threshold-scorer"
    }
}

/// Selects every promoted candidate at a fixed capital fraction.
pub struct BudgetSelector {
    allocation: f64,
}

impl BudgetSelector {
    pub fn new(allocation: f64) -> Self {
        Self { allocation: allocation.clamp(0.0, 1.0) }
    }
}

#[async_trait]
impl StageExecutor for BudgetSelector {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        let Some(card) = input_of(inputs, ArtifactKind::ScoreCard) else {
            return missing(ArtifactKind::ScoreCard, ctx);
        };
        let ArtifactPayload::ScoreCard { promote, score, code_ref, parameters, .. } = &card.payload else {
            return missing(ArtifactKind::ScoreCard, ctx);
        };
        let selected = *promote && self.allocation > 0.0;
        ExecutionResult::Success(ArtifactPayload::Selection {
            selected,
            allocation: if selected { self.allocation } else { 0.0 },
            rationale: format!("score {score:.3}, budget fraction {:.3}", self.allocation),
            score_ref: card.id.clone(),
            code_ref: code_ref.clone(),
            parameters: parameters.clone(),
        })
    }

    fn name(&self) -> &str {
        "reference:budget-selector"
    }
}

/// Records a paper deployment; halting only logs.
pub struct PaperDeployer;

#[async_trait]
impl StageExecutor for PaperDeployer {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        let Some(selection) = input_of(inputs, ArtifactKind::Selection) else {
            return missing(ArtifactKind::Selection, ctx);
        };
        let ArtifactPayload::Selection { code_ref, parameters, .. } = &selection.payload else {
            return missing(ArtifactKind::Selection, ctx);
        };
        ExecutionResult::Success(ArtifactPayload::Deployment {
            deployment_id: format!("paper-{}", ctx.invocation_id),
            mode: "paper".to_string(),
            code_ref: code_ref.clone(),
            parameters: parameters.clone(),
            selection_ref: selection.id.clone(),
        })
    }

    async fn halt(&self, experiment: &ExperimentId) -> Result<()> {
        log(
            Level::Warn,
            Domain::Executor,
            "deploy_halted",
            obj(&[
                ("experiment_id", v_str(experiment.as_str())),
                ("mode", v_str("paper")),
            ]),
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "reference:paper-deployer"
    }
}

/// Reports an empty observation window.
pub struct NullMonitor {
    window_secs: u64,
}

impl NullMonitor {
    pub fn new(window_secs: u64) -> Self {
        Self { window_secs }
    }
}

#[async_trait]
impl StageExecutor for NullMonitor {
    async fn execute(&self, inputs: &[Artifact], ctx: &ExperimentContext) -> ExecutionResult {
        let Some(deployment) = input_of(inputs, ArtifactKind::Deployment) else {
            return missing(ArtifactKind::Deployment, ctx);
        };
        let end = now_ms();
        let mut observations = BTreeMap::new();
        observations.insert(
            "window_reruns".to_string(),
            if ctx.trigger == Trigger::MonitorWindow { 1.0 } else { 0.0 },
        );
        ExecutionResult::Success(ArtifactPayload::MonitorReport {
            window_start_ms: end.saturating_sub(self.window_secs.saturating_mul(1000)),
            window_end_ms: end,
            observations,
            signals: vec![],
            deployment_ref: deployment.id.clone(),
        })
    }

    fn name(&self) -> &str {
        "reference:null-monitor"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CancelFlag;
    use crate::manifest::StrategyManifest;
    use crate::model::{ArtifactId, InvocationId};
    use crate::stage::StageKind;
    use serde_json::json;

    fn ctx(stage: StageKind, cycle: u32) -> ExperimentContext {
        ExperimentContext {
            experiment_id: ExperimentId::from("exp-t"),
            invocation_id: InvocationId::from("inv-t"),
            stage,
            cycle,
            attempt: 1,
            trigger: Trigger::Pipeline,
            manifest_ref: ArtifactId::from("0".repeat(64)),
            cancel: CancelFlag::new(),
        }
    }

    fn wrap(payload: ArtifactPayload) -> Artifact {
        Artifact {
            id: ArtifactId::from("1".repeat(64)),
            kind: payload.kind(),
            producer: None,
            created_ms: 0,
            content_hash: String::new(),
            payload,
        }
    }

    fn manifest() -> ArtifactPayload {
        let m: StrategyManifest = serde_json::from_value(json!({
            "metadata": {"strategy_id": "breakout", "display_name": "Breakout"},
            "default_config": {"lookback": 20, "size": 1},
            "parameter_grid": {"lookback": [10, 30]},
            "instrumentation_hooks": ["on_fill"]
        }))
        .unwrap();
        ArtifactPayload::Manifest(m)
    }

    #[tokio::test]
    async fn test_ideator_walks_grid_by_cycle() {
        let inputs = [wrap(manifest())];
        let first = ManifestIdeator.execute(&inputs, &ctx(StageKind::Ideate, 0)).await;
        let second = ManifestIdeator.execute(&inputs, &ctx(StageKind::Ideate, 1)).await;
        let lookback = |r: &ExecutionResult| match r {
            ExecutionResult::Success(ArtifactPayload::CodeBundle { parameters, candidates, .. }) => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(parameters["size"], json!(1));
                parameters["lookback"].clone()
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(lookback(&first), json!(10));
        assert_eq!(lookback(&second), json!(30));
    }

    #[tokio::test]
    async fn test_ideator_without_manifest_is_fatal() {
        let r = ManifestIdeator.execute(&[], &ctx(StageKind::Ideate, 0)).await;
        assert!(matches!(r, ExecutionResult::FatalFailure(_)));
    }

    #[tokio::test]
    async fn test_sanitizer_rejects_forbidden() {
        let sanitizer = GuardrailSanitizer::new(vec!["subprocess".into()]);
        let bad = wrap(ArtifactPayload::CodeBundle {
            strategy_id: "x".into(),
            language: "python".into(),
            source: "import subprocess".into(),
            parameters: BTreeMap::new(),
            candidates: vec![],
            hooks: vec![],
        });
        match sanitizer.execute(&[bad], &ctx(StageKind::Sanitize, 0)).await {
            ExecutionResult::Rejected { reason, suggested_fix } => {
                assert!(reason.contains("subprocess"));
                assert!(suggested_fix.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_scorer_bounds() {
        let mut min = BTreeMap::new();
        min.insert("sharpe".to_string(), 1.0);
        let mut max = BTreeMap::new();
        max.insert("max_drawdown".to_string(), 0.2);
        let scorer = ThresholdScorer::new(min, max);

        let mut good = BTreeMap::new();
        good.insert("sharpe".to_string(), 1.4);
        good.insert("max_drawdown".to_string(), 0.1);
        let (reasons, score) = scorer.judge(&good);
        assert!(reasons.is_empty());
        assert_eq!(score, 1.0);

        let mut bad = BTreeMap::new();
        bad.insert("sharpe".to_string(), 0.3);
        let (reasons, score) = scorer.judge(&bad);
        assert_eq!(reasons.len(), 2);
        assert_eq!(score, 0.0);
    }
}
