//! Durable experiment ledger on SQLite.
//!
//! Rows only move forward: invocations are inserted and then transition
//! status, experiments carry a version counter checked on status writes, and
//! every change appends to `stage_events`. All writes go through one
//! connection behind a mutex, each inside its own transaction.

mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{PipelineError, Result};
use crate::logging::{log, log_transition, obj, v_str, Domain, Level};
use crate::model::{
    now_ms, ApprovalRecord, ArtifactId, Decision, Experiment, ExperimentId, ExperimentStatus,
    FailureDetail, FailureKind, Invocation, InvocationId, InvocationStatus, Outcome, StageEvent,
    Trigger,
};
use crate::stage::StageKind;

pub use schema::SCHEMA_VERSION;

/// How a new invocation enters the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationSpec {
    pub trigger: Trigger,
    /// Created in `awaiting_approval` instead of `pending`.
    pub hold_for_approval: bool,
    pub deadline_ms: Option<u64>,
}

impl Default for InvocationSpec {
    fn default() -> Self {
        Self {
            trigger: Trigger::Pipeline,
            hold_for_approval: false,
            deadline_ms: None,
        }
    }
}

impl InvocationSpec {
    pub fn gated(deadline_ms: Option<u64>) -> Self {
        Self {
            hold_for_approval: true,
            deadline_ms,
            ..Self::default()
        }
    }
}

const INVOCATION_COLUMNS: &str = "seq, invocation_id, experiment_id, stage, cycle, trigger_tag, \
     inputs_json, attempt, status, output_ref, failure_kind, failure_reason, deadline_at, \
     created_at, started_at, ended_at";

const EXPERIMENT_COLUMNS: &str = "experiment_id, manifest_ref, created_at, updated_at, \
     current_stage, status, status_reason, cycle, cycle_entry, version";

fn parse<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T> {
    raw.parse().map_err(PipelineError::Corrupt)
}

struct RawInvocation {
    seq: i64,
    id: String,
    experiment_id: String,
    stage: String,
    cycle: i64,
    trigger: String,
    inputs_json: String,
    attempt: i64,
    status: String,
    output_ref: Option<String>,
    failure_kind: Option<String>,
    failure_reason: Option<String>,
    deadline_at: Option<i64>,
    created_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
}

impl RawInvocation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            id: row.get(1)?,
            experiment_id: row.get(2)?,
            stage: row.get(3)?,
            cycle: row.get(4)?,
            trigger: row.get(5)?,
            inputs_json: row.get(6)?,
            attempt: row.get(7)?,
            status: row.get(8)?,
            output_ref: row.get(9)?,
            failure_kind: row.get(10)?,
            failure_reason: row.get(11)?,
            deadline_at: row.get(12)?,
            created_at: row.get(13)?,
            started_at: row.get(14)?,
            ended_at: row.get(15)?,
        })
    }

    fn decode(self) -> Result<Invocation> {
        let failure = match self.failure_kind {
            Some(kind) => Some(FailureDetail::new(
                parse(&kind)?,
                self.failure_reason.unwrap_or_default(),
            )),
            None => None,
        };
        let inputs: Vec<ArtifactId> = serde_json::from_str(&self.inputs_json)
            .map_err(|e| PipelineError::Corrupt(format!("inputs of {}: {e}", self.id)))?;
        Ok(Invocation {
            id: InvocationId::from(self.id),
            experiment_id: ExperimentId::from(self.experiment_id),
            stage: parse(&self.stage)?,
            cycle: self.cycle as u32,
            trigger: parse(&self.trigger)?,
            inputs,
            attempt: self.attempt as u32,
            status: parse(&self.status)?,
            output: self.output_ref.map(ArtifactId::from),
            failure,
            deadline_ms: self.deadline_at.map(|v| v as u64),
            created_ms: self.created_at as u64,
            started_ms: self.started_at.map(|v| v as u64),
            ended_ms: self.ended_at.map(|v| v as u64),
            seq: self.seq,
        })
    }
}

struct ExperimentRow {
    id: ExperimentId,
    manifest_ref: ArtifactId,
    created_ms: u64,
    updated_ms: u64,
    current_stage: StageKind,
    status: ExperimentStatus,
    status_reason: Option<String>,
    cycle: u32,
    cycle_entry: StageKind,
    version: i64,
}

impl ExperimentRow {
    fn into_experiment(self, history: Vec<Invocation>) -> Experiment {
        Experiment {
            id: self.id,
            manifest_ref: self.manifest_ref,
            created_ms: self.created_ms,
            updated_ms: self.updated_ms,
            current_stage: self.current_stage,
            status: self.status,
            status_reason: self.status_reason,
            cycle: self.cycle,
            cycle_entry: self.cycle_entry,
            version: self.version,
            history,
        }
    }
}

type RawExperiment = (String, String, i64, i64, String, String, Option<String>, i64, String, i64);

fn raw_experiment(row: &Row<'_>) -> rusqlite::Result<RawExperiment> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode_experiment(raw: RawExperiment) -> Result<ExperimentRow> {
    let (id, manifest_ref, created, updated, stage, status, reason, cycle, entry, version) = raw;
    Ok(ExperimentRow {
        id: ExperimentId::from(id),
        manifest_ref: ArtifactId::from(manifest_ref),
        created_ms: created as u64,
        updated_ms: updated as u64,
        current_stage: parse(&stage)?,
        status: parse(&status)?,
        status_reason: reason,
        cycle: cycle as u32,
        cycle_entry: parse(&entry)?,
        version,
    })
}

fn load_experiment(conn: &Connection, id: &ExperimentId) -> Result<ExperimentRow> {
    let raw = conn
        .query_row(
            &format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE experiment_id = ?1"),
            params![id.as_str()],
            raw_experiment,
        )
        .optional()?
        .ok_or_else(|| PipelineError::ExperimentNotFound(id.clone()))?;
    decode_experiment(raw)
}

fn load_invocation(conn: &Connection, id: &InvocationId) -> Result<Invocation> {
    conn.query_row(
        &format!("SELECT {INVOCATION_COLUMNS} FROM invocations WHERE invocation_id = ?1"),
        params![id.as_str()],
        RawInvocation::from_row,
    )
    .optional()?
    .ok_or_else(|| PipelineError::InvocationNotFound(id.clone()))?
    .decode()
}

fn query_invocations(conn: &Connection, where_clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Invocation>> {
    let mut stmt = conn.prepare(&format!("SELECT {INVOCATION_COLUMNS} FROM invocations {where_clause}"))?;
    let raws = stmt
        .query_map(args, RawInvocation::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawInvocation::decode).collect()
}

fn append_event(
    conn: &Connection,
    experiment: &ExperimentId,
    invocation: Option<&InvocationId>,
    stage: Option<StageKind>,
    event: &str,
    detail: Option<&str>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO stage_events (experiment_id, invocation_id, stage, event, detail, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            experiment.as_str(),
            invocation.map(|i| i.as_str()),
            stage.map(|s| s.as_str()),
            event,
            detail,
            now_ms() as i64
        ],
    )?;
    Ok(())
}

fn active_invocation_of(conn: &Connection, experiment: &ExperimentId, stage: StageKind) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT invocation_id FROM invocations
                 WHERE experiment_id = ?1 AND stage = ?2 AND status IN {}",
                InvocationStatus::NON_TERMINAL_SQL
            ),
            params![experiment.as_str(), stage.as_str()],
            |row| row.get(0),
        )
        .optional()?)
}

#[allow(clippy::too_many_arguments)]
fn insert_invocation(
    conn: &Connection,
    experiment: &ExperimentId,
    stage: StageKind,
    cycle: u32,
    trigger: Trigger,
    inputs: &[ArtifactId],
    status: InvocationStatus,
    deadline_ms: Option<u64>,
) -> Result<InvocationId> {
    let id = InvocationId::generate();
    let inserted = conn.execute(
        "INSERT INTO invocations (invocation_id, experiment_id, stage, cycle, trigger_tag,
            inputs_json, attempt, status, deadline_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9)",
        params![
            id.as_str(),
            experiment.as_str(),
            stage.as_str(),
            cycle as i64,
            trigger.tag(),
            serde_json::to_string(inputs)?,
            status.as_str(),
            deadline_ms.map(|d| d as i64),
            now_ms() as i64
        ],
    );
    match inserted {
        Ok(_) => Ok(id),
        // The partial unique index is the last line of defence.
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
            Err(PipelineError::DuplicateActiveInvocation {
                experiment: experiment.clone(),
                stage,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Where an experiment stands, derived from its current cycle.
///
/// A non-terminal invocation wins. Otherwise a success points at the stage
/// that follows, a failure leaves the experiment at its last success, and a
/// terminal experiment stays at the stage that ended it.
fn derive_current_stage(status: ExperimentStatus, entry: StageKind, cycle_invs: &[Invocation]) -> StageKind {
    if let Some(open) = cycle_invs.iter().filter(|i| !i.status.is_terminal()).max_by_key(|i| i.seq) {
        return open.stage;
    }
    let Some(last) = cycle_invs.iter().max_by_key(|i| i.seq) else {
        return entry;
    };
    if status.is_terminal() {
        return last.stage;
    }
    match last.status {
        InvocationStatus::Succeeded => last.stage.next().unwrap_or(last.stage),
        _ => cycle_invs
            .iter()
            .filter(|i| i.status == InvocationStatus::Succeeded)
            .max_by_key(|i| i.seq)
            .map(|i| i.stage)
            .unwrap_or_else(|| entry.predecessor().unwrap_or(entry)),
    }
}

/// Recompute `current_stage`; bumps the version when it moves.
fn refresh_experiment(conn: &Connection, id: &ExperimentId) -> Result<()> {
    let row = load_experiment(conn, id)?;
    let cycle_invs = query_invocations(
        conn,
        "WHERE experiment_id = ?1 AND cycle = ?2",
        &[&id.as_str(), &(row.cycle as i64)],
    )?;
    let stage = derive_current_stage(row.status, row.cycle_entry, &cycle_invs);
    if stage != row.current_stage {
        conn.execute(
            "UPDATE experiments SET current_stage = ?2, updated_at = ?3, version = version + 1
             WHERE experiment_id = ?1",
            params![id.as_str(), stage.as_str(), now_ms() as i64],
        )?;
    }
    Ok(())
}

/// Mark every pending or awaiting invocation of `experiment` skipped, limited
/// to cycles before `before_cycle` when given.
fn skip_open(conn: &Connection, experiment: &ExperimentId, before_cycle: Option<u32>, reason: &str) -> Result<Vec<InvocationId>> {
    let bound = before_cycle.map(|c| c as i64).unwrap_or(i64::MAX);
    let open = query_invocations(
        conn,
        "WHERE experiment_id = ?1 AND status IN ('pending','awaiting_approval') AND cycle < ?2",
        &[&experiment.as_str(), &bound],
    )?;
    let now = now_ms() as i64;
    for inv in &open {
        conn.execute(
            "UPDATE invocations SET status = 'skipped', ended_at = ?2 WHERE invocation_id = ?1",
            params![inv.id.as_str(), now],
        )?;
        append_event(conn, experiment, Some(&inv.id), Some(inv.stage), "skipped", Some(reason))?;
    }
    Ok(open.into_iter().map(|i| i.id).collect())
}

/// Fail every running invocation of `experiment` from cycles before
/// `before_cycle`.
fn supersede_running(conn: &Connection, experiment: &ExperimentId, before_cycle: u32, reason: &str) -> Result<Vec<InvocationId>> {
    let running = query_invocations(
        conn,
        "WHERE experiment_id = ?1 AND status = 'running' AND cycle < ?2",
        &[&experiment.as_str(), &(before_cycle as i64)],
    )?;
    let now = now_ms() as i64;
    for inv in &running {
        conn.execute(
            "UPDATE invocations SET status = 'failed', failure_kind = ?2, failure_reason = ?3, ended_at = ?4
             WHERE invocation_id = ?1",
            params![inv.id.as_str(), FailureKind::CancellationRequested.as_str(), reason, now],
        )?;
        append_event(conn, experiment, Some(&inv.id), Some(inv.stage), "failed", Some(reason))?;
    }
    Ok(running.into_iter().map(|i| i.id).collect())
}

/// A cycle opened by `Ledger::begin_cycle`.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleStart {
    pub cycle: u32,
    pub entry: InvocationId,
    /// Running invocations of earlier cycles, now failed.
    pub superseded: Vec<InvocationId>,
}

const HALTED_EVENT: &str = "deployment_halted";

pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut conn = Connection::open(path)?;
        let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        schema::configure(&conn)?;
        schema::migrate(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        schema::configure(&conn)?;
        schema::migrate(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-transaction rolls back on drop, so the connection is usable.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_experiment(&self, manifest_ref: &ArtifactId) -> Result<ExperimentId> {
        let id = ExperimentId::generate();
        let now = now_ms() as i64;
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO experiments (experiment_id, manifest_ref, created_at, updated_at,
                current_stage, status, cycle, cycle_entry, version)
             VALUES (?1, ?2, ?3, ?3, ?4, 'active', 0, ?4, 0)",
            params![id.as_str(), manifest_ref.as_str(), now, StageKind::Ideate.as_str()],
        )?;
        append_event(&tx, &id, None, None, "experiment_created", Some(manifest_ref.as_str()))?;
        tx.commit()?;

        log(
            Level::Info,
            Domain::Ledger,
            "experiment_created",
            obj(&[("experiment_id", v_str(id.as_str())), ("manifest_ref", v_str(manifest_ref.as_str()))]),
        );
        Ok(id)
    }

    /// Insert an invocation for `stage` in the experiment's current cycle.
    ///
    /// Fails with `DuplicateActiveInvocation` if one is already non-terminal
    /// for the pair, and with `InvalidTransition` if the experiment is
    /// terminal or a predecessor has not succeeded in this cycle.
    pub fn record_invocation(
        &self,
        experiment: &ExperimentId,
        stage: StageKind,
        inputs: &[ArtifactId],
        spec: InvocationSpec,
    ) -> Result<InvocationId> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = load_experiment(&tx, experiment)?;
        if row.status.is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "experiment {experiment} is {}",
                row.status
            )));
        }
        if stage.index() < row.cycle_entry.index() {
            return Err(PipelineError::InvalidTransition(format!(
                "{stage} precedes the entry stage {} of cycle {}",
                row.cycle_entry, row.cycle
            )));
        }
        if active_invocation_of(&tx, experiment, stage)?.is_some() {
            return Err(PipelineError::DuplicateActiveInvocation {
                experiment: experiment.clone(),
                stage,
            });
        }
        for pred in stage.predecessors().iter().filter(|p| p.index() >= row.cycle_entry.index()) {
            let done: i64 = tx.query_row(
                "SELECT COUNT(*) FROM invocations
                 WHERE experiment_id = ?1 AND stage = ?2 AND cycle = ?3 AND status = 'succeeded'",
                params![experiment.as_str(), pred.as_str(), row.cycle as i64],
                |r| r.get(0),
            )?;
            if done == 0 {
                return Err(PipelineError::InvalidTransition(format!(
                    "{stage} requires {pred} to have succeeded in cycle {}",
                    row.cycle
                )));
            }
        }

        let status = if spec.hold_for_approval {
            InvocationStatus::AwaitingApproval
        } else {
            InvocationStatus::Pending
        };
        let deadline = if spec.hold_for_approval { spec.deadline_ms } else { None };
        let id = insert_invocation(&tx, experiment, stage, row.cycle, spec.trigger, inputs, status, deadline)?;
        append_event(&tx, experiment, Some(&id), Some(stage), status.as_str(), Some(spec.trigger.tag().as_str()))?;
        refresh_experiment(&tx, experiment)?;
        tx.commit()?;

        log_transition(experiment.as_str(), id.as_str(), stage.as_str(), "none", status.as_str(), Some(spec.trigger.tag().as_str()));
        Ok(id)
    }

    /// Start a new cycle entered at `entry`.
    ///
    /// Pending and awaiting invocations of earlier cycles are skipped and
    /// running ones are failed with `CancellationRequested`; their ids come
    /// back in `superseded` so the caller can stop the workers. The entry
    /// invocation is held for approval when `spec` says so.
    pub fn begin_cycle(
        &self,
        experiment: &ExperimentId,
        entry: StageKind,
        inputs: &[ArtifactId],
        spec: InvocationSpec,
    ) -> Result<CycleStart> {
        let trigger = spec.trigger;
        if !entry.is_reentry_point() || !trigger.is_reentry() {
            return Err(PipelineError::InvalidTransition(format!(
                "{entry} cannot be re-entered with trigger {trigger}"
            )));
        }
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = load_experiment(&tx, experiment)?;
        if row.status.is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "experiment {experiment} is {}",
                row.status
            )));
        }
        let cycle = row.cycle + 1;
        let reason = format!("superseded by cycle {cycle}");
        skip_open(&tx, experiment, Some(cycle), &reason)?;
        let superseded = supersede_running(&tx, experiment, cycle, &reason)?;
        if active_invocation_of(&tx, experiment, entry)?.is_some() {
            return Err(PipelineError::DuplicateActiveInvocation {
                experiment: experiment.clone(),
                stage: entry,
            });
        }
        tx.execute(
            "UPDATE experiments SET cycle = ?2, cycle_entry = ?3, updated_at = ?4, version = version + 1
             WHERE experiment_id = ?1",
            params![experiment.as_str(), cycle as i64, entry.as_str(), now_ms() as i64],
        )?;
        let (status, deadline) = if spec.hold_for_approval {
            (InvocationStatus::AwaitingApproval, spec.deadline_ms)
        } else {
            (InvocationStatus::Pending, None)
        };
        let id = insert_invocation(&tx, experiment, entry, cycle, trigger, inputs, status, deadline)?;
        append_event(
            &tx,
            experiment,
            Some(&id),
            Some(entry),
            "cycle_started",
            Some(format!("cycle {cycle} via {trigger}").as_str()),
        )?;
        refresh_experiment(&tx, experiment)?;
        tx.commit()?;

        log_transition(experiment.as_str(), id.as_str(), entry.as_str(), "none", status.as_str(), Some(trigger.tag().as_str()));
        Ok(CycleStart { cycle, entry: id, superseded })
    }

    /// pending → running, at dispatch.
    pub fn mark_running(&self, id: &InvocationId) -> Result<Invocation> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inv = load_invocation(&tx, id)?;
        if inv.status != InvocationStatus::Pending {
            return Err(PipelineError::InvalidTransition(format!(
                "invocation {id} is {}, not pending",
                inv.status
            )));
        }
        let exp = load_experiment(&tx, &inv.experiment_id)?;
        if exp.status.is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "experiment {} is {}",
                exp.id, exp.status
            )));
        }
        tx.execute(
            "UPDATE invocations SET status = 'running', started_at = COALESCE(started_at, ?2)
             WHERE invocation_id = ?1",
            params![id.as_str(), now_ms() as i64],
        )?;
        append_event(&tx, &inv.experiment_id, Some(id), Some(inv.stage), "running", None)?;
        refresh_experiment(&tx, &inv.experiment_id)?;
        let updated = load_invocation(&tx, id)?;
        tx.commit()?;

        log_transition(inv.experiment_id.as_str(), id.as_str(), inv.stage.as_str(), "pending", "running", None);
        Ok(updated)
    }

    /// Persist the attempt counter of a running invocation.
    pub fn record_attempt(&self, id: &InvocationId, attempt: u32) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inv = load_invocation(&tx, id)?;
        let changed = tx.execute(
            "UPDATE invocations SET attempt = ?2 WHERE invocation_id = ?1 AND status = 'running'",
            params![id.as_str(), attempt as i64],
        )?;
        if changed == 0 {
            return Err(PipelineError::InvalidTransition(format!(
                "invocation {id} is {}, not running",
                inv.status
            )));
        }
        append_event(&tx, &inv.experiment_id, Some(id), Some(inv.stage), "attempt", Some(attempt.to_string().as_str()))?;
        tx.commit()?;
        Ok(())
    }

    /// Move an invocation to a terminal status.
    ///
    /// Terminal invocations reject any further completion with
    /// `InvalidTransition`, leaving the row untouched. Only a running
    /// invocation can succeed, and a Deploy invocation only with a consumed
    /// `approved` record for its own id.
    pub fn complete_invocation(&self, id: &InvocationId, outcome: &Outcome) -> Result<Invocation> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inv = load_invocation(&tx, id)?;
        if inv.status.is_terminal() {
            return Err(PipelineError::InvalidTransition(format!(
                "invocation {id} is already {}",
                inv.status
            )));
        }

        let (output, failure, detail) = match outcome {
            Outcome::Succeeded(output) => {
                if inv.status != InvocationStatus::Running {
                    return Err(PipelineError::InvalidTransition(format!(
                        "invocation {id} cannot succeed from {}",
                        inv.status
                    )));
                }
                if inv.stage == StageKind::Deploy {
                    let approved: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM approvals
                         WHERE invocation_id = ?1 AND decision = 'approved' AND consumed_at IS NOT NULL",
                        params![id.as_str()],
                        |r| r.get(0),
                    )?;
                    if approved == 0 {
                        return Err(PipelineError::InvalidTransition(format!(
                            "deploy invocation {id} has no approved approval record"
                        )));
                    }
                }
                (Some(output.as_str().to_string()), None, output.as_str().to_string())
            }
            Outcome::Failed(failure) => {
                let approval_outcome = matches!(
                    failure.kind,
                    FailureKind::RejectedByApprover | FailureKind::ApprovalTimeout
                );
                if approval_outcome && inv.status != InvocationStatus::AwaitingApproval {
                    return Err(PipelineError::InvalidTransition(format!(
                        "invocation {id} is {}, not awaiting approval",
                        inv.status
                    )));
                }
                (None, Some(failure.clone()), failure.to_string())
            }
            Outcome::Skipped(reason) => (None, None, reason.clone()),
        };

        let status = outcome.status();
        tx.execute(
            "UPDATE invocations SET status = ?2, output_ref = ?3, failure_kind = ?4,
                failure_reason = ?5, ended_at = ?6
             WHERE invocation_id = ?1",
            params![
                id.as_str(),
                status.as_str(),
                output,
                failure.as_ref().map(|f| f.kind.as_str()),
                failure.as_ref().map(|f| f.reason.as_str()),
                now_ms() as i64
            ],
        )?;
        append_event(&tx, &inv.experiment_id, Some(id), Some(inv.stage), status.as_str(), Some(detail.as_str()))?;
        refresh_experiment(&tx, &inv.experiment_id)?;
        let updated = load_invocation(&tx, id)?;
        tx.commit()?;

        log_transition(
            inv.experiment_id.as_str(),
            id.as_str(),
            inv.stage.as_str(),
            inv.status.as_str(),
            status.as_str(),
            Some(detail.as_str()),
        );
        Ok(updated)
    }

    /// Version-checked status change.
    ///
    /// Moving to a terminal status skips the experiment's pending and
    /// awaiting invocations; the ids of invocations still running are
    /// returned so the caller can request their cancellation.
    pub fn set_experiment_status(
        &self,
        id: &ExperimentId,
        to: ExperimentStatus,
        reason: Option<&str>,
        expected_version: i64,
    ) -> Result<Vec<InvocationId>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let row = load_experiment(&tx, id)?;
        if !row.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition(format!(
                "experiment {id} cannot move from {} to {to}",
                row.status
            )));
        }
        let changed = tx.execute(
            "UPDATE experiments SET status = ?2, status_reason = ?3, updated_at = ?4, version = version + 1
             WHERE experiment_id = ?1 AND version = ?5",
            params![id.as_str(), to.as_str(), reason, now_ms() as i64, expected_version],
        )?;
        if changed == 0 {
            return Err(PipelineError::ConcurrentModification {
                experiment: id.clone(),
                expected: expected_version,
            });
        }
        append_event(&tx, id, None, None, &format!("status:{to}"), reason)?;

        let mut in_flight = Vec::new();
        if to.is_terminal() {
            skip_open(&tx, id, None, &format!("experiment {to}"))?;
            in_flight = query_invocations(&tx, "WHERE experiment_id = ?1 AND status = 'running'", &[&id.as_str()])?
                .into_iter()
                .map(|i| i.id)
                .collect();
        }
        refresh_experiment(&tx, id)?;
        tx.commit()?;

        log(
            Level::Info,
            Domain::Ledger,
            "experiment_status",
            obj(&[
                ("experiment_id", v_str(id.as_str())),
                ("from", v_str(row.status.as_str())),
                ("to", v_str(to.as_str())),
                ("reason", reason.map(v_str).unwrap_or_default()),
            ]),
        );
        Ok(in_flight)
    }

    /// `set_experiment_status` against a freshly read version, re-reading
    /// when another writer got there first. A no-op if already at `to`.
    pub fn transition_experiment(
        &self,
        id: &ExperimentId,
        to: ExperimentStatus,
        reason: Option<&str>,
    ) -> Result<Vec<InvocationId>> {
        const MAX_TRIES: usize = 5;
        let mut last_err = None;
        for _ in 0..MAX_TRIES {
            let (status, version) = {
                let conn = self.conn();
                let row = load_experiment(&conn, id)?;
                (row.status, row.version)
            };
            if status == to {
                return Ok(vec![]);
            }
            match self.set_experiment_status(id, to, reason, version) {
                Err(e @ PipelineError::ConcurrentModification { .. }) => last_err = Some(e),
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| PipelineError::ConcurrentModification {
            experiment: id.clone(),
            expected: -1,
        }))
    }

    pub fn record_approval(&self, record: &ApprovalRecord) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inv = load_invocation(&tx, &record.invocation_id)?;
        if inv.status != InvocationStatus::AwaitingApproval {
            return Err(PipelineError::InvalidTransition(format!(
                "invocation {} is {}, not awaiting approval",
                inv.id, inv.status
            )));
        }
        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM approvals WHERE invocation_id = ?1",
            params![inv.id.as_str()],
            |r| r.get(0),
        )?;
        if existing > 0 {
            return Err(PipelineError::InvalidTransition(format!(
                "invocation {} already has an approval record",
                inv.id
            )));
        }
        tx.execute(
            "INSERT INTO approvals (invocation_id, decision, actor, decided_at, comment)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                inv.id.as_str(),
                record.decision.as_str(),
                record.actor,
                record.decided_ms as i64,
                record.comment
            ],
        )?;
        append_event(
            &tx,
            &inv.experiment_id,
            Some(&inv.id),
            Some(inv.stage),
            "approval_recorded",
            Some(format!("{} by {}", record.decision.as_str(), record.actor).as_str()),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn approval_for(&self, id: &InvocationId) -> Result<Option<ApprovalRecord>> {
        let conn = self.conn();
        approval_row(&conn, id)
    }

    /// Mark a record consumed; a record is consumed at most once.
    pub fn consume_approval(&self, id: &InvocationId) -> Result<ApprovalRecord> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let record = approval_row(&tx, id)?
            .ok_or_else(|| PipelineError::InvalidTransition(format!("invocation {id} has no approval record")))?;
        if record.consumed_ms.is_some() {
            return Err(PipelineError::InvalidTransition(format!(
                "approval for {id} was already consumed"
            )));
        }
        let now = now_ms();
        tx.execute(
            "UPDATE approvals SET consumed_at = ?2 WHERE invocation_id = ?1 AND consumed_at IS NULL",
            params![id.as_str(), now as i64],
        )?;
        let inv = load_invocation(&tx, id)?;
        append_event(&tx, &inv.experiment_id, Some(id), Some(inv.stage), "approval_consumed", None)?;
        tx.commit()?;
        Ok(ApprovalRecord { consumed_ms: Some(now), ..record })
    }

    /// awaiting_approval → pending, once an approval has been consumed.
    pub fn release_awaiting(&self, id: &InvocationId) -> Result<Invocation> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inv = load_invocation(&tx, id)?;
        if inv.status != InvocationStatus::AwaitingApproval {
            return Err(PipelineError::InvalidTransition(format!(
                "invocation {id} is {}, not awaiting approval",
                inv.status
            )));
        }
        let released = matches!(
            approval_row(&tx, id)?,
            Some(ApprovalRecord { decision: Decision::Approved, consumed_ms: Some(_), .. })
        );
        if !released {
            return Err(PipelineError::InvalidTransition(format!(
                "invocation {id} has no consumed approval"
            )));
        }
        tx.execute(
            "UPDATE invocations SET status = 'pending' WHERE invocation_id = ?1",
            params![id.as_str()],
        )?;
        append_event(&tx, &inv.experiment_id, Some(id), Some(inv.stage), "released", None)?;
        refresh_experiment(&tx, &inv.experiment_id)?;
        let updated = load_invocation(&tx, id)?;
        tx.commit()?;

        log_transition(inv.experiment_id.as_str(), id.as_str(), inv.stage.as_str(), "awaiting_approval", "pending", None);
        Ok(updated)
    }

    /// Awaiting invocations whose deadline is at or before `now_ms`.
    pub fn expired_approvals(&self, now_ms: u64) -> Result<Vec<InvocationId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT invocation_id FROM invocations
             WHERE status = 'awaiting_approval' AND deadline_at IS NOT NULL AND deadline_at <= ?1
             ORDER BY seq",
        )?;
        let ids = stmt
            .query_map(params![now_ms as i64], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(InvocationId::from).collect())
    }

    /// Awaiting invocations that already have a decision recorded, e.g. when
    /// the process stopped between recording and acting on it.
    pub fn decided_awaiting(&self) -> Result<Vec<ApprovalRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT a.invocation_id, a.decision, a.actor, a.decided_at, a.comment, a.consumed_at
             FROM approvals a JOIN invocations i ON i.invocation_id = a.invocation_id
             WHERE i.status = 'awaiting_approval'
             ORDER BY i.seq",
        )?;
        let raws = stmt
            .query_map([], raw_approval)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(decode_approval).collect()
    }

    pub fn get_invocation(&self, id: &InvocationId) -> Result<Invocation> {
        let conn = self.conn();
        load_invocation(&conn, id)
    }

    /// Every invocation of an experiment, in creation order.
    pub fn invocations_for(&self, experiment: &ExperimentId) -> Result<Vec<Invocation>> {
        let conn = self.conn();
        load_experiment(&conn, experiment)?;
        query_invocations(&conn, "WHERE experiment_id = ?1 ORDER BY seq", &[&experiment.as_str()])
    }

    /// Snapshot with history ordered by completion time, unfinished last.
    pub fn get_experiment(&self, id: &ExperimentId) -> Result<Experiment> {
        let conn = self.conn();
        let row = load_experiment(&conn, id)?;
        let history = query_invocations(
            &conn,
            "WHERE experiment_id = ?1 ORDER BY ended_at IS NULL, ended_at, seq",
            &[&id.as_str()],
        )?;
        Ok(row.into_experiment(history))
    }

    pub fn list_experiments(&self) -> Result<Vec<Experiment>> {
        self.experiments_where("")
    }

    /// Live experiments, each with `history` cut down to its current cycle.
    pub fn list_active_current_cycle(&self) -> Result<Vec<Experiment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXPERIMENT_COLUMNS} FROM experiments WHERE status IN ('active','paused')
             ORDER BY created_at, experiment_id"
        ))?;
        let raws = stmt
            .query_map([], raw_experiment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter()
            .map(|raw| {
                let row = decode_experiment(raw)?;
                let history = query_invocations(
                    &conn,
                    "WHERE experiment_id = ?1 AND cycle = ?2 ORDER BY ended_at IS NULL, ended_at, seq",
                    &[&row.id.as_str(), &(row.cycle as i64)],
                )?;
                Ok(row.into_experiment(history))
            })
            .collect()
    }

    /// The most recent successful Deploy with no halt recorded against it.
    /// Terminal experiments can still have one.
    pub fn live_deployment(&self, experiment: &ExperimentId) -> Result<Option<Invocation>> {
        let conn = self.conn();
        load_experiment(&conn, experiment)?;
        let latest = query_invocations(
            &conn,
            "WHERE experiment_id = ?1 AND stage = 'deploy' AND status = 'succeeded'
             ORDER BY ended_at DESC, seq DESC LIMIT 1",
            &[&experiment.as_str()],
        )?;
        let Some(deploy) = latest.into_iter().next() else {
            return Ok(None);
        };
        let halted: i64 = conn.query_row(
            "SELECT COUNT(*) FROM stage_events WHERE invocation_id = ?1 AND event = ?2",
            params![deploy.id.as_str(), HALTED_EVENT],
            |r| r.get(0),
        )?;
        Ok((halted == 0).then_some(deploy))
    }

    /// Record that the deployment produced by `deploy` was halted.
    pub fn record_halt(&self, deploy: &InvocationId, reason: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let inv = load_invocation(&tx, deploy)?;
        if inv.stage != StageKind::Deploy || inv.status != InvocationStatus::Succeeded {
            return Err(PipelineError::InvalidTransition(format!(
                "invocation {deploy} is a {} {} invocation, not a deployment",
                inv.status, inv.stage
            )));
        }
        append_event(&tx, &inv.experiment_id, Some(deploy), Some(inv.stage), HALTED_EVENT, Some(reason))?;
        tx.commit()?;

        log(
            Level::Warn,
            Domain::Ledger,
            HALTED_EVENT,
            obj(&[
                ("experiment_id", v_str(inv.experiment_id.as_str())),
                ("invocation_id", v_str(deploy.as_str())),
                ("reason", v_str(reason)),
            ]),
        );
        Ok(())
    }

    fn experiments_where(&self, where_clause: &str) -> Result<Vec<Experiment>> {
        let ids: Vec<String> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT experiment_id FROM experiments {where_clause} ORDER BY created_at, experiment_id"
            ))?;
            let rows = stmt.query_map([], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        ids.into_iter()
            .map(|id| self.get_experiment(&ExperimentId::from(id)))
            .collect()
    }

    /// Pending invocations of live experiments, oldest first.
    pub fn list_ready(&self, stage: Option<StageKind>) -> Result<Vec<InvocationId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT i.invocation_id FROM invocations i
             JOIN experiments e ON e.experiment_id = i.experiment_id
             WHERE i.status = 'pending' AND e.status IN ('active','paused')
               AND (?1 IS NULL OR i.stage = ?1)
             ORDER BY i.seq",
        )?;
        let ids = stmt
            .query_map(params![stage.map(|s| s.as_str())], |r| r.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids.into_iter().map(InvocationId::from).collect())
    }

    pub fn list_non_terminal(&self) -> Result<Vec<Invocation>> {
        let conn = self.conn();
        query_invocations(
            &conn,
            &format!("WHERE status IN {} ORDER BY seq", InvocationStatus::NON_TERMINAL_SQL),
            &[],
        )
    }

    /// Crash recovery: anything left running goes back to pending with its
    /// attempt counter intact.
    pub fn reset_running_to_pending(&self) -> Result<Vec<InvocationId>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let running = query_invocations(&tx, "WHERE status = 'running' ORDER BY seq", &[])?;
        for inv in &running {
            tx.execute(
                "UPDATE invocations SET status = 'pending' WHERE invocation_id = ?1",
                params![inv.id.as_str()],
            )?;
            append_event(&tx, &inv.experiment_id, Some(&inv.id), Some(inv.stage), "recovered", None)?;
            refresh_experiment(&tx, &inv.experiment_id)?;
        }
        tx.commit()?;
        Ok(running.into_iter().map(|i| i.id).collect())
    }

    pub fn events_for(&self, experiment: &ExperimentId) -> Result<Vec<StageEvent>> {
        let conn = self.conn();
        load_experiment(&conn, experiment)?;
        let mut stmt = conn.prepare(
            "SELECT event_seq, experiment_id, invocation_id, stage, event, detail, recorded_at
             FROM stage_events WHERE experiment_id = ?1 ORDER BY event_seq",
        )?;
        let raws = stmt
            .query_map(params![experiment.as_str()], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, i64>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter()
            .map(|(seq, exp, inv, stage, event, detail, at)| {
                Ok(StageEvent {
                    seq,
                    experiment_id: ExperimentId::from(exp),
                    invocation_id: inv.map(InvocationId::from),
                    stage: stage.as_deref().map(parse).transpose()?,
                    event,
                    detail,
                    recorded_ms: at as u64,
                })
            })
            .collect()
    }
}

type RawApproval = (String, String, String, i64, Option<String>, Option<i64>);

fn raw_approval(row: &Row<'_>) -> rusqlite::Result<RawApproval> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn decode_approval(raw: RawApproval) -> Result<ApprovalRecord> {
    let (id, decision, actor, decided, comment, consumed) = raw;
    Ok(ApprovalRecord {
        invocation_id: InvocationId::from(id),
        decision: parse(&decision)?,
        actor,
        decided_ms: decided as u64,
        comment,
        consumed_ms: consumed.map(|c| c as u64),
    })
}

fn approval_row(conn: &Connection, id: &InvocationId) -> Result<Option<ApprovalRecord>> {
    conn.query_row(
        "SELECT invocation_id, decision, actor, decided_at, comment, consumed_at
         FROM approvals WHERE invocation_id = ?1",
        params![id.as_str()],
        raw_approval,
    )
    .optional()?
    .map(decode_approval)
    .transpose()
}
