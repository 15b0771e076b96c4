//! Artifact schema: a tagged union over everything stages exchange.
//!
//! Payloads carry an explicit `kind` discriminator and are validated before
//! they enter the [`ArtifactStore`], so consumers match on variants instead
//! of probing fields.

pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::manifest::StrategyManifest;
use crate::model::{ArtifactId, InvocationId, SignalKind};
use crate::stage::StageKind;

pub use store::ArtifactStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Manifest,
    CodeBundle,
    SanitizeReport,
    ResultBundle,
    ScoreCard,
    Selection,
    Deployment,
    MonitorReport,
    Log,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Manifest => "manifest",
            ArtifactKind::CodeBundle => "code-bundle",
            ArtifactKind::SanitizeReport => "sanitize-report",
            ArtifactKind::ResultBundle => "result-bundle",
            ArtifactKind::ScoreCard => "score-card",
            ArtifactKind::Selection => "selection",
            ArtifactKind::Deployment => "deployment",
            ArtifactKind::MonitorReport => "monitor-report",
            ArtifactKind::Log => "log",
        }
    }

    /// What a successful invocation of `stage` must produce.
    pub fn produced_by(stage: StageKind) -> ArtifactKind {
        match stage {
            StageKind::Ideate => ArtifactKind::CodeBundle,
            StageKind::Sanitize => ArtifactKind::SanitizeReport,
            StageKind::Backtest => ArtifactKind::ResultBundle,
            StageKind::Score => ArtifactKind::ScoreCard,
            StageKind::Select => ArtifactKind::Selection,
            StageKind::Deploy => ArtifactKind::Deployment,
            StageKind::Monitor => ArtifactKind::MonitorReport,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manifest" => Ok(ArtifactKind::Manifest),
            "code-bundle" => Ok(ArtifactKind::CodeBundle),
            "sanitize-report" => Ok(ArtifactKind::SanitizeReport),
            "result-bundle" => Ok(ArtifactKind::ResultBundle),
            "score-card" => Ok(ArtifactKind::ScoreCard),
            "selection" => Ok(ArtifactKind::Selection),
            "deployment" => Ok(ArtifactKind::Deployment),
            "monitor-report" => Ok(ArtifactKind::MonitorReport),
            "log" => Ok(ArtifactKind::Log),
            other => Err(format!("unknown artifact kind: {other}")),
        }
    }
}

/// A signal a monitor wants raised; the scheduler turns these into
/// [`FeedbackSignal`](crate::model::FeedbackSignal)s with the report as evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDraft {
    pub kind: SignalKind,
    pub severity: f64,
    #[serde(default)]
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ArtifactPayload {
    Manifest(StrategyManifest),
    CodeBundle {
        strategy_id: String,
        language: String,
        source: String,
        #[serde(default)]
        parameters: BTreeMap<String, Value>,
        /// Remaining grid combinations, for a later Select to choose among.
        #[serde(default)]
        candidates: Vec<BTreeMap<String, Value>>,
        #[serde(default)]
        hooks: Vec<String>,
    },
    SanitizeReport {
        passed: bool,
        #[serde(default)]
        violations: Vec<String>,
        #[serde(default)]
        fix_patch_ref: Option<ArtifactId>,
        code_ref: ArtifactId,
    },
    ResultBundle {
        strategy_id: String,
        metrics: BTreeMap<String, f64>,
        #[serde(default)]
        fills_log_ref: Option<ArtifactId>,
        #[serde(default)]
        equity_curve_ref: Option<ArtifactId>,
        seed: u64,
        environment_hash: String,
        code_ref: ArtifactId,
        #[serde(default)]
        parameters: BTreeMap<String, Value>,
    },
    ScoreCard {
        promote: bool,
        score: f64,
        #[serde(default)]
        reasons: Vec<String>,
        result_ref: ArtifactId,
        code_ref: ArtifactId,
        #[serde(default)]
        parameters: BTreeMap<String, Value>,
    },
    Selection {
        selected: bool,
        /// Fraction of the capital budget, in `[0, 1]`.
        allocation: f64,
        #[serde(default)]
        rationale: String,
        score_ref: ArtifactId,
        code_ref: ArtifactId,
        #[serde(default)]
        parameters: BTreeMap<String, Value>,
    },
    Deployment {
        deployment_id: String,
        mode: String,
        code_ref: ArtifactId,
        #[serde(default)]
        parameters: BTreeMap<String, Value>,
        selection_ref: ArtifactId,
    },
    MonitorReport {
        window_start_ms: u64,
        window_end_ms: u64,
        #[serde(default)]
        observations: BTreeMap<String, f64>,
        #[serde(default)]
        signals: Vec<SignalDraft>,
        deployment_ref: ArtifactId,
    },
    Log {
        lines: Vec<String>,
    },
}

fn check_ref(field: &str, id: &ArtifactId) -> Result<()> {
    if id.is_well_formed() {
        Ok(())
    } else {
        Err(PipelineError::InvalidArtifact(format!("{field} is not an artifact id: {id}")))
    }
}

fn check_opt_ref(field: &str, id: &Option<ArtifactId>) -> Result<()> {
    match id {
        Some(id) => check_ref(field, id),
        None => Ok(()),
    }
}

fn check_unit(field: &str, x: f64) -> Result<()> {
    if (0.0..=1.0).contains(&x) {
        Ok(())
    } else {
        Err(PipelineError::InvalidArtifact(format!("{field} must be within [0, 1], got {x}")))
    }
}

impl ArtifactPayload {
    pub fn kind(&self) -> ArtifactKind {
        match self {
            ArtifactPayload::Manifest(_) => ArtifactKind::Manifest,
            ArtifactPayload::CodeBundle { .. } => ArtifactKind::CodeBundle,
            ArtifactPayload::SanitizeReport { .. } => ArtifactKind::SanitizeReport,
            ArtifactPayload::ResultBundle { .. } => ArtifactKind::ResultBundle,
            ArtifactPayload::ScoreCard { .. } => ArtifactKind::ScoreCard,
            ArtifactPayload::Selection { .. } => ArtifactKind::Selection,
            ArtifactPayload::Deployment { .. } => ArtifactKind::Deployment,
            ArtifactPayload::MonitorReport { .. } => ArtifactKind::MonitorReport,
            ArtifactPayload::Log { .. } => ArtifactKind::Log,
        }
    }

    /// Structural checks applied at the store boundary.
    pub fn validate(&self) -> Result<()> {
        match self {
            ArtifactPayload::Manifest(m) => m.validate(),
            ArtifactPayload::CodeBundle { strategy_id, source, .. } => {
                if strategy_id.trim().is_empty() {
                    return Err(PipelineError::InvalidArtifact("code bundle without strategy_id".into()));
                }
                if source.is_empty() {
                    return Err(PipelineError::InvalidArtifact("code bundle without source".into()));
                }
                Ok(())
            }
            ArtifactPayload::SanitizeReport { passed, violations, fix_patch_ref, code_ref } => {
                if *passed && !violations.is_empty() {
                    return Err(PipelineError::InvalidArtifact(
                        "sanitize report passed with violations listed".into(),
                    ));
                }
                check_opt_ref("fix_patch_ref", fix_patch_ref)?;
                check_ref("code_ref", code_ref)
            }
            ArtifactPayload::ResultBundle {
                metrics,
                fills_log_ref,
                equity_curve_ref,
                code_ref,
                ..
            } => {
                if let Some((name, v)) = metrics.iter().find(|(_, v)| !v.is_finite()) {
                    return Err(PipelineError::InvalidArtifact(format!("metric {name} is not finite: {v}")));
                }
                check_opt_ref("fills_log_ref", fills_log_ref)?;
                check_opt_ref("equity_curve_ref", equity_curve_ref)?;
                check_ref("code_ref", code_ref)
            }
            ArtifactPayload::ScoreCard { score, result_ref, code_ref, .. } => {
                if !score.is_finite() {
                    return Err(PipelineError::InvalidArtifact(format!("score is not finite: {score}")));
                }
                check_ref("result_ref", result_ref)?;
                check_ref("code_ref", code_ref)
            }
            ArtifactPayload::Selection { allocation, score_ref, code_ref, .. } => {
                check_unit("allocation", *allocation)?;
                check_ref("score_ref", score_ref)?;
                check_ref("code_ref", code_ref)
            }
            ArtifactPayload::Deployment { deployment_id, code_ref, selection_ref, .. } => {
                if deployment_id.trim().is_empty() {
                    return Err(PipelineError::InvalidArtifact("deployment without id".into()));
                }
                check_ref("code_ref", code_ref)?;
                check_ref("selection_ref", selection_ref)
            }
            ArtifactPayload::MonitorReport {
                window_start_ms,
                window_end_ms,
                signals,
                deployment_ref,
                ..
            } => {
                if window_start_ms > window_end_ms {
                    return Err(PipelineError::InvalidArtifact("monitor window ends before it starts".into()));
                }
                for s in signals {
                    check_unit("signal severity", s.severity)?;
                }
                check_ref("deployment_ref", deployment_ref)
            }
            ArtifactPayload::Log { .. } => Ok(()),
        }
    }

    /// The code bundle this payload descends from, where it names one.
    pub fn code_ref(&self) -> Option<&ArtifactId> {
        match self {
            ArtifactPayload::SanitizeReport { code_ref, .. }
            | ArtifactPayload::ResultBundle { code_ref, .. }
            | ArtifactPayload::ScoreCard { code_ref, .. }
            | ArtifactPayload::Selection { code_ref, .. }
            | ArtifactPayload::Deployment { code_ref, .. } => Some(code_ref),
            _ => None,
        }
    }

    /// Parameters this payload carries forward, where it has any.
    pub fn parameters(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            ArtifactPayload::CodeBundle { parameters, .. }
            | ArtifactPayload::ResultBundle { parameters, .. }
            | ArtifactPayload::ScoreCard { parameters, .. }
            | ArtifactPayload::Selection { parameters, .. }
            | ArtifactPayload::Deployment { parameters, .. } => Some(parameters),
            _ => None,
        }
    }
}

/// Immutable envelope around a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    pub producer: Option<InvocationId>,
    pub created_ms: u64,
    /// sha256 of the payload's JSON encoding.
    pub content_hash: String,
    pub payload: ArtifactPayload,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn some_ref() -> ArtifactId {
        ArtifactId::from("0".repeat(64))
    }

    #[test]
    fn test_kind_discriminator_on_wire() {
        let p = ArtifactPayload::Log { lines: vec!["a".into()] };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["kind"], "log");

        let parsed: ArtifactPayload = serde_json::from_value(json!({
            "kind": "sanitize-report",
            "passed": false,
            "violations": ["uses network"],
            "code_ref": "0".repeat(64),
        }))
        .unwrap();
        assert_eq!(parsed.kind(), ArtifactKind::SanitizeReport);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let r: std::result::Result<ArtifactPayload, _> =
            serde_json::from_value(json!({"kind": "spreadsheet"}));
        assert!(r.is_err());
    }

    #[test]
    fn test_validate_catches_bad_values() {
        let sel = ArtifactPayload::Selection {
            selected: true,
            allocation: 1.5,
            rationale: String::new(),
            score_ref: some_ref(),
            code_ref: some_ref(),
            parameters: BTreeMap::new(),
        };
        assert!(sel.validate().is_err());

        let report = ArtifactPayload::SanitizeReport {
            passed: true,
            violations: vec!["x".into()],
            fix_patch_ref: None,
            code_ref: some_ref(),
        };
        assert!(report.validate().is_err());

        let card = ArtifactPayload::ScoreCard {
            promote: true,
            score: 1.0,
            reasons: vec![],
            result_ref: ArtifactId::from("nope"),
            code_ref: some_ref(),
            parameters: BTreeMap::new(),
        };
        assert!(matches!(card.validate(), Err(PipelineError::InvalidArtifact(_))));
    }

    #[test]
    fn test_stage_output_kinds() {
        assert_eq!(ArtifactKind::produced_by(StageKind::Backtest), ArtifactKind::ResultBundle);
        assert_eq!(ArtifactKind::produced_by(StageKind::Monitor), ArtifactKind::MonitorReport);
        for kind in [ArtifactKind::CodeBundle, ArtifactKind::MonitorReport] {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().unwrap(), kind);
        }
    }
}
