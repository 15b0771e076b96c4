use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::model::now_ms;

pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS experiments (
  experiment_id TEXT PRIMARY KEY,
  manifest_ref TEXT NOT NULL,
  created_at INTEGER NOT NULL,
  updated_at INTEGER NOT NULL,
  current_stage TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('active','paused','completed','aborted','failed')),
  status_reason TEXT,
  cycle INTEGER NOT NULL DEFAULT 0,
  cycle_entry TEXT NOT NULL,
  version INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS invocations (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  invocation_id TEXT NOT NULL UNIQUE,
  experiment_id TEXT NOT NULL,
  stage TEXT NOT NULL,
  cycle INTEGER NOT NULL,
  trigger_tag TEXT NOT NULL,
  inputs_json TEXT NOT NULL,
  attempt INTEGER NOT NULL DEFAULT 0,
  status TEXT NOT NULL CHECK (status IN ('pending','running','succeeded','failed','awaiting_approval','skipped')),
  output_ref TEXT,
  failure_kind TEXT,
  failure_reason TEXT,
  deadline_at INTEGER,
  created_at INTEGER NOT NULL,
  started_at INTEGER,
  ended_at INTEGER,
  CHECK ((status = 'succeeded') = (output_ref IS NOT NULL)),
  CHECK ((status = 'failed') = (failure_kind IS NOT NULL)),
  FOREIGN KEY (experiment_id) REFERENCES experiments(experiment_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS invocations_one_active
  ON invocations(experiment_id, stage)
  WHERE status IN ('pending','running','awaiting_approval');

CREATE INDEX IF NOT EXISTS invocations_by_status ON invocations(status, stage);
CREATE INDEX IF NOT EXISTS invocations_by_experiment ON invocations(experiment_id, cycle);

CREATE TABLE IF NOT EXISTS stage_events (
  event_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  experiment_id TEXT NOT NULL,
  invocation_id TEXT,
  stage TEXT,
  event TEXT NOT NULL,
  detail TEXT,
  recorded_at INTEGER NOT NULL,
  FOREIGN KEY (experiment_id) REFERENCES experiments(experiment_id)
);

CREATE TABLE IF NOT EXISTS approvals (
  invocation_id TEXT PRIMARY KEY,
  decision TEXT NOT NULL CHECK (decision IN ('approved','rejected')),
  actor TEXT NOT NULL,
  decided_at INTEGER NOT NULL,
  comment TEXT,
  consumed_at INTEGER,
  FOREIGN KEY (invocation_id) REFERENCES invocations(invocation_id)
);

CREATE TRIGGER IF NOT EXISTS stage_events_append_only_update
BEFORE UPDATE ON stage_events
BEGIN
  SELECT RAISE(ABORT, 'stage_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS stage_events_append_only_delete
BEFORE DELETE ON stage_events
BEGIN
  SELECT RAISE(ABORT, 'stage_events is append-only');
END;

CREATE TRIGGER IF NOT EXISTS approvals_immutable
BEFORE UPDATE OF invocation_id, decision, actor, decided_at, comment ON approvals
BEGIN
  SELECT RAISE(ABORT, 'approval records are immutable');
END;
";

pub fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

pub fn migrate(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA_V1)?;
    let applied: Option<i64> = tx
        .query_row(
            "SELECT version FROM schema_migrations WHERE version = ?1",
            params![SCHEMA_VERSION],
            |row| row.get(0),
        )
        .optional()?;
    if applied.is_none() {
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, now_ms() as i64],
        )?;
    }
    tx.commit()?;
    Ok(())
}
