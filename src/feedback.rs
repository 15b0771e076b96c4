//! Feedback router.
//!
//! Monitor reports raise signals; the router turns each one into an action on
//! the experiment. Re-entry goes through `Scheduler::inject`, so the router
//! never writes invocation rows itself.

use crate::error::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::model::{ExperimentStatus, FeedbackSignal, InvocationId, SignalKind, Trigger};
use crate::scheduler::Scheduler;
use crate::stage::StageKind;

#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    /// Anomaly below the threshold.
    Logged,
    Rebacktest(InvocationId),
    Killed {
        /// False when the deploy collaborator failed to halt.
        halted: bool,
        replacement: InvocationId,
    },
    /// Kill on a finished experiment whose deployment was still live.
    Halted(InvocationId),
    Dropped(String),
}

pub struct FeedbackRouter {
    anomaly_threshold: f64,
}

impl FeedbackRouter {
    pub fn new(anomaly_threshold: f64) -> Self {
        Self { anomaly_threshold }
    }

    pub async fn route(
        &self,
        ledger: &Ledger,
        scheduler: &mut Scheduler,
        signal: &FeedbackSignal,
    ) -> Result<RouteAction> {
        let action = self.decide(ledger, scheduler, signal).await?;
        let (name, detail) = match &action {
            RouteAction::Logged => ("logged", String::new()),
            RouteAction::Rebacktest(id) => ("rebacktest", id.to_string()),
            RouteAction::Killed { replacement, .. } => ("killed", replacement.to_string()),
            RouteAction::Halted(deployment) => ("halted", deployment.to_string()),
            RouteAction::Dropped(reason) => ("dropped", reason.clone()),
        };
        log(
            if matches!(action, RouteAction::Dropped(_)) { Level::Warn } else { Level::Info },
            Domain::Feedback,
            "signal_routed",
            obj(&[
                ("experiment_id", v_str(signal.experiment_id.as_str())),
                ("kind", v_str(signal.kind.as_str())),
                ("severity", v_num(signal.severity)),
                ("evidence_ref", v_str(signal.evidence_ref.as_str())),
                ("action", v_str(name)),
                ("detail", v_str(&detail)),
            ]),
        );
        Ok(action)
    }

    async fn decide(
        &self,
        ledger: &Ledger,
        scheduler: &mut Scheduler,
        signal: &FeedbackSignal,
    ) -> Result<RouteAction> {
        if !(0.0..=1.0).contains(&signal.severity) {
            return Ok(RouteAction::Dropped(format!("severity {} outside [0, 1]", signal.severity)));
        }
        let exp = match ledger.get_experiment(&signal.experiment_id) {
            Ok(exp) => exp,
            Err(PipelineError::ExperimentNotFound(id)) => {
                return Ok(RouteAction::Dropped(format!("unknown experiment {id}")))
            }
            Err(e) => return Err(e),
        };
        if exp.status.is_terminal() {
            if signal.kind == SignalKind::Kill {
                if let Some(live) = ledger.live_deployment(&exp.id)? {
                    return Ok(if scheduler.halt_deployment(&exp.id, "kill signal").await? {
                        RouteAction::Halted(live.id)
                    } else {
                        RouteAction::Dropped("halt failed".to_string())
                    });
                }
            }
            return Ok(RouteAction::Dropped(format!("experiment is {}", exp.status)));
        }

        match signal.kind {
            SignalKind::Anomaly if signal.severity < self.anomaly_threshold => Ok(RouteAction::Logged),
            SignalKind::Anomaly | SignalKind::Degradation => {
                if exp.status == ExperimentStatus::Paused {
                    return Ok(RouteAction::Dropped("experiment paused".to_string()));
                }
                let Some(deployment) = exp.latest_output(StageKind::Deploy).cloned() else {
                    return Ok(RouteAction::Dropped("no live deployment".to_string()));
                };
                match scheduler.inject(&exp.id, StageKind::Backtest, vec![deployment], Trigger::Feedback(signal.kind)) {
                    Ok(id) => Ok(RouteAction::Rebacktest(id)),
                    Err(PipelineError::DuplicateActiveInvocation { .. }) => {
                        Ok(RouteAction::Dropped("backtest already in flight".to_string()))
                    }
                    Err(e) => Err(e),
                }
            }
            SignalKind::Kill => {
                let halted = scheduler.halt_deployment(&exp.id, "kill signal").await?;
                match ledger.transition_experiment(&exp.id, ExperimentStatus::Paused, Some("kill signal")) {
                    Ok(_) => {}
                    // Went terminal since we looked.
                    Err(PipelineError::InvalidTransition(reason)) => return Ok(RouteAction::Dropped(reason)),
                    Err(e) => return Err(e),
                }
                let running = scheduler.running_for(&exp.id);
                scheduler.cancel_invocations(&running);

                // Running work of the old cycle is superseded by the new one.
                let replacement = scheduler.inject(
                    &exp.id,
                    StageKind::Ideate,
                    vec![exp.manifest_ref.clone()],
                    Trigger::Feedback(SignalKind::Kill),
                )?;
                Ok(RouteAction::Killed { halted, replacement })
            }
        }
    }
}
