//! Approval gate.
//!
//! Invocations of gated stages are recorded `awaiting_approval`. Only the
//! gate moves them on: an approval releases the invocation to `pending`, a
//! rejection or an expired deadline fails it. Each decision is stored before
//! it is acted on and is consumed at most once.

use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::logging::{fmt_ms, log, obj, v_str, Domain, Level};
use crate::model::{now_ms, ApprovalRecord, Decision, FailureDetail, FailureKind, Invocation, InvocationId, Outcome};

pub struct ApprovalGate {
    ledger: Arc<Ledger>,
}

impl ApprovalGate {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Record a human decision and act on it.
    pub fn submit_approval(
        &self,
        invocation: &InvocationId,
        decision: Decision,
        actor: &str,
        comment: Option<String>,
    ) -> Result<Invocation> {
        let record = ApprovalRecord {
            invocation_id: invocation.clone(),
            decision,
            actor: match actor.trim() {
                "" => "unknown".to_string(),
                a => a.to_string(),
            },
            decided_ms: now_ms(),
            comment: comment.filter(|c| !c.trim().is_empty()),
            consumed_ms: None,
        };
        self.ledger.record_approval(&record)?;
        log(
            Level::Info,
            Domain::Gate,
            "decision_recorded",
            obj(&[
                ("invocation_id", v_str(invocation.as_str())),
                ("decision", v_str(decision.as_str())),
                ("actor", v_str(&record.actor)),
            ]),
        );
        self.apply(record)
    }

    fn apply(&self, record: ApprovalRecord) -> Result<Invocation> {
        let record = match record.consumed_ms {
            Some(_) => record,
            None => self.ledger.consume_approval(&record.invocation_id)?,
        };
        match record.decision {
            Decision::Approved => self.ledger.release_awaiting(&record.invocation_id),
            Decision::Rejected => {
                let reason = match &record.comment {
                    Some(comment) => format!("rejected by {}: {comment}", record.actor),
                    None => format!("rejected by {}", record.actor),
                };
                let failure = FailureDetail::new(FailureKind::RejectedByApprover, reason);
                self.ledger.complete_invocation(&record.invocation_id, &Outcome::Failed(failure))
            }
        }
    }

    /// Fail every undecided invocation whose deadline has passed. The
    /// experiment stays where it is.
    pub fn expire(&self, now: u64) -> Result<Vec<InvocationId>> {
        let mut expired = Vec::new();
        for id in self.ledger.expired_approvals(now)? {
            // A decision that landed first wins; recovery or the decider applies it.
            if self.ledger.approval_for(&id)?.is_some() {
                continue;
            }
            let inv = self.ledger.get_invocation(&id)?;
            let deadline = inv.deadline_ms.unwrap_or(now);
            let failure = FailureDetail::new(
                FailureKind::ApprovalTimeout,
                format!("no decision by {}", fmt_ms(deadline)),
            );
            match self.ledger.complete_invocation(&id, &Outcome::Failed(failure)) {
                Ok(_) => {
                    log(
                        Level::Warn,
                        Domain::Gate,
                        "approval_expired",
                        obj(&[
                            ("experiment_id", v_str(inv.experiment_id.as_str())),
                            ("invocation_id", v_str(id.as_str())),
                            ("stage", v_str(inv.stage.as_str())),
                        ]),
                    );
                    expired.push(id);
                }
                Err(PipelineError::InvalidTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Act on decisions recorded before a restart but never applied.
    pub fn resume_decided(&self) -> Result<usize> {
        let mut applied = 0;
        for record in self.ledger.decided_awaiting()? {
            let id = record.invocation_id.clone();
            match self.apply(record) {
                Ok(_) => applied += 1,
                Err(e) => log(
                    Level::Error,
                    Domain::Gate,
                    "resume_failed",
                    obj(&[("invocation_id", v_str(id.as_str())), ("error", v_str(&e.to_string()))]),
                ),
            }
        }
        Ok(applied)
    }
}
