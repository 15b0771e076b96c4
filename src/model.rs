//! Ledger data model: experiments, invocations, approvals, feedback signals.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::stage::StageKind;

/// Epoch milliseconds.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

macro_rules! string_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, Ulid::new().to_string().to_lowercase()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(ExperimentId, "exp");
string_id!(InvocationId, "inv");

/// Hex sha256 identifying an artifact envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids are 64 lowercase hex characters.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == 64 && self.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ArtifactId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Active,
    Paused,
    Completed,
    Aborted,
    Failed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Active => "active",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Aborted => "aborted",
            ExperimentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExperimentStatus::Completed | ExperimentStatus::Aborted | ExperimentStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        match (self, next) {
            (Active, Paused) | (Paused, Active) => true,
            (Active | Paused, Completed | Aborted | Failed) => true,
            _ => false,
        }
    }
}

impl FromStr for ExperimentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ExperimentStatus::Active),
            "paused" => Ok(ExperimentStatus::Paused),
            "completed" => Ok(ExperimentStatus::Completed),
            "aborted" => Ok(ExperimentStatus::Aborted),
            "failed" => Ok(ExperimentStatus::Failed),
            other => Err(format!("unknown experiment status: {other}")),
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    AwaitingApproval,
    Skipped,
}

impl InvocationStatus {
    pub const NON_TERMINAL_SQL: &'static str = "('pending','running','awaiting_approval')";

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::Running => "running",
            InvocationStatus::Succeeded => "succeeded",
            InvocationStatus::Failed => "failed",
            InvocationStatus::AwaitingApproval => "awaiting_approval",
            InvocationStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Succeeded | InvocationStatus::Failed | InvocationStatus::Skipped
        )
    }
}

impl FromStr for InvocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvocationStatus::Pending),
            "running" => Ok(InvocationStatus::Running),
            "succeeded" => Ok(InvocationStatus::Succeeded),
            "failed" => Ok(InvocationStatus::Failed),
            "awaiting_approval" => Ok(InvocationStatus::AwaitingApproval),
            "skipped" => Ok(InvocationStatus::Skipped),
            other => Err(format!("unknown invocation status: {other}")),
        }
    }
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Degradation,
    Anomaly,
    Kill,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Degradation => "degradation",
            SignalKind::Anomaly => "anomaly",
            SignalKind::Kill => "kill",
        }
    }
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "degradation" => Ok(SignalKind::Degradation),
            "anomaly" => Ok(SignalKind::Anomaly),
            "kill" => Ok(SignalKind::Kill),
            other => Err(format!("unknown signal kind: {other}")),
        }
    }
}

/// Why an invocation was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Trigger {
    /// Normal forward progression.
    Pipeline,
    /// Injected by the feedback router.
    Feedback(SignalKind),
    /// Periodic re-run of Monitor on a live deployment.
    MonitorWindow,
}

impl Trigger {
    pub fn tag(&self) -> String {
        match self {
            Trigger::Pipeline => "pipeline".to_string(),
            Trigger::Feedback(kind) => format!("feedback:{}", kind.as_str()),
            Trigger::MonitorWindow => "monitor_window".to_string(),
        }
    }

    pub fn is_reentry(&self) -> bool {
        !matches!(self, Trigger::Pipeline)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pipeline" => Ok(Trigger::Pipeline),
            "monitor_window" => Ok(Trigger::MonitorWindow),
            other => match other.strip_prefix("feedback:") {
                Some(kind) => Ok(Trigger::Feedback(kind.parse()?)),
                None => Err(format!("unknown trigger tag: {other}")),
            },
        }
    }
}

impl From<Trigger> for String {
    fn from(t: Trigger) -> Self {
        t.tag()
    }
}

impl TryFrom<String> for Trigger {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Terminal failure reasons recorded on an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    RejectedByApprover,
    ApprovalTimeout,
    RetryableExecutorFailure,
    FatalExecutorFailure,
    SanitizeRejected,
    CancellationRequested,
    ArtifactNotFound,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RejectedByApprover => "RejectedByApprover",
            FailureKind::ApprovalTimeout => "ApprovalTimeout",
            FailureKind::RetryableExecutorFailure => "RetryableExecutorFailure",
            FailureKind::FatalExecutorFailure => "FatalExecutorFailure",
            FailureKind::SanitizeRejected => "SanitizeRejected",
            FailureKind::CancellationRequested => "CancellationRequested",
            FailureKind::ArtifactNotFound => "ArtifactNotFound",
        }
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RejectedByApprover" => Ok(FailureKind::RejectedByApprover),
            "ApprovalTimeout" => Ok(FailureKind::ApprovalTimeout),
            "RetryableExecutorFailure" => Ok(FailureKind::RetryableExecutorFailure),
            "FatalExecutorFailure" => Ok(FailureKind::FatalExecutorFailure),
            "SanitizeRejected" => Ok(FailureKind::SanitizeRejected),
            "CancellationRequested" => Ok(FailureKind::CancellationRequested),
            "ArtifactNotFound" => Ok(FailureKind::ArtifactNotFound),
            other => Err(format!("unknown failure kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub reason: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into() }
    }
}

impl fmt::Display for FailureDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.reason)
    }
}

/// Outcome supplied to `Ledger::complete_invocation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded(ArtifactId),
    Failed(FailureDetail),
    Skipped(String),
}

impl Outcome {
    pub fn status(&self) -> InvocationStatus {
        match self {
            Outcome::Succeeded(_) => InvocationStatus::Succeeded,
            Outcome::Failed(_) => InvocationStatus::Failed,
            Outcome::Skipped(_) => InvocationStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub id: InvocationId,
    pub experiment_id: ExperimentId,
    pub stage: StageKind,
    pub cycle: u32,
    pub trigger: Trigger,
    pub inputs: Vec<ArtifactId>,
    pub attempt: u32,
    pub status: InvocationStatus,
    pub output: Option<ArtifactId>,
    pub failure: Option<FailureDetail>,
    pub deadline_ms: Option<u64>,
    pub created_ms: u64,
    pub started_ms: Option<u64>,
    pub ended_ms: Option<u64>,
    /// Ledger insertion order.
    pub seq: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub manifest_ref: ArtifactId,
    pub created_ms: u64,
    pub updated_ms: u64,
    pub current_stage: StageKind,
    pub status: ExperimentStatus,
    pub status_reason: Option<String>,
    pub cycle: u32,
    pub cycle_entry: StageKind,
    /// Optimistic-concurrency counter, bumped on every row update.
    pub version: i64,
    /// Invocations ordered by completion time; unfinished ones last.
    pub history: Vec<Invocation>,
}

impl Experiment {
    pub fn invocations_of(&self, stage: StageKind) -> impl Iterator<Item = &Invocation> {
        self.history.iter().filter(move |inv| inv.stage == stage)
    }

    pub fn in_cycle(&self, cycle: u32) -> impl Iterator<Item = &Invocation> {
        self.history.iter().filter(move |inv| inv.cycle == cycle)
    }

    pub fn non_terminal(&self) -> impl Iterator<Item = &Invocation> {
        self.history.iter().filter(|inv| !inv.status.is_terminal())
    }

    /// Latest successful output for a stage across all cycles.
    pub fn latest_output(&self, stage: StageKind) -> Option<&ArtifactId> {
        self.history
            .iter()
            .filter(|inv| inv.stage == stage && inv.status == InvocationStatus::Succeeded)
            .max_by_key(|inv| (inv.ended_ms, inv.seq))
            .and_then(|inv| inv.output.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        }
    }
}

impl FromStr for Decision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approved" => Ok(Decision::Approved),
            "rejected" => Ok(Decision::Rejected),
            other => Err(format!("unknown decision: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub invocation_id: InvocationId,
    pub decision: Decision,
    pub actor: String,
    pub decided_ms: u64,
    pub comment: Option<String>,
    /// Set when the gate acted on the record.
    pub consumed_ms: Option<u64>,
}

/// Wire shape: `{experimentId, kind, severity, evidenceRef, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackSignal {
    pub experiment_id: ExperimentId,
    pub kind: SignalKind,
    /// In `[0, 1]`.
    pub severity: f64,
    pub evidence_ref: ArtifactId,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageEvent {
    pub seq: i64,
    pub experiment_id: ExperimentId,
    pub invocation_id: Option<InvocationId>,
    pub stage: Option<StageKind>,
    pub event: String,
    pub detail: Option<String>,
    pub recorded_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = ExperimentId::generate();
        let b = ExperimentId::generate();
        assert!(a.as_str().starts_with("exp-"));
        assert_ne!(a, b);
        assert!(InvocationId::generate().as_str().starts_with("inv-"));
    }

    #[test]
    fn test_trigger_tags() {
        assert_eq!(Trigger::Feedback(SignalKind::Kill).tag(), "feedback:kill");
        assert_eq!("feedback:degradation".parse::<Trigger>().unwrap(), Trigger::Feedback(SignalKind::Degradation));
        assert!("feedback:panic".parse::<Trigger>().is_err());
        assert!(!Trigger::Pipeline.is_reentry());
        assert!(Trigger::MonitorWindow.is_reentry());
    }

    #[test]
    fn test_status_transitions() {
        assert!(ExperimentStatus::Active.can_transition_to(ExperimentStatus::Paused));
        assert!(ExperimentStatus::Paused.can_transition_to(ExperimentStatus::Active));
        assert!(!ExperimentStatus::Completed.can_transition_to(ExperimentStatus::Active));
        assert!(!ExperimentStatus::Aborted.can_transition_to(ExperimentStatus::Aborted));
    }

    #[test]
    fn test_feedback_signal_wire_shape() {
        let sig = FeedbackSignal {
            experiment_id: ExperimentId::from("exp-1"),
            kind: SignalKind::Kill,
            severity: 0.9,
            evidence_ref: ArtifactId::from("ab"),
            timestamp_ms: 42,
        };
        let v = serde_json::to_value(&sig).unwrap();
        assert_eq!(v["experimentId"], "exp-1");
        assert_eq!(v["kind"], "kill");
        assert_eq!(v["evidenceRef"], "ab");
        assert_eq!(v["timestamp"], 42);
    }

    #[test]
    fn test_artifact_id_shape() {
        assert!(ArtifactId::from("a".repeat(64)).is_well_formed());
        assert!(!ArtifactId::from("xyz").is_well_formed());
        assert!(!ArtifactId::from("A".repeat(64)).is_well_formed());
    }
}
