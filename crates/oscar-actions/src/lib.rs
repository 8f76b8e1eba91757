//! The action log: durable, deduplicated, approval-gated execution of
//! proposed edits.
//!
//! Processors decide *that* an edit is warranted and register it here;
//! a separate drain executes approved entries and records the outcome.
//! The `(kind, key)` pair is the dedup unit: a second registration while an
//! entry exists is a no-op, which is what lets processors re-run freely over
//! the same events without repeating side effects.
//!
//! Failed actions stay in the log with their error recorded and are not
//! retried automatically; [`ActionLog::rerun`] exists for manual
//! intervention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use oscar_core::error::{BoxedError, FmtCompact as _};
use oscar_core::{DbTime, Timestamp};
use oscar_db::{Database, DbError, DbResult, def_table, timed_max};
use snafu::Snafu;
use tracing::{debug, info, warn};

const LOG_TARGET: &str = "oscar::actions";

/// The timed-kind name under which action DbTimes are allocated.
const ACTION_LOG_KIND: &str = "actions.Log";

/// Advisory lock serializing registration and the executor drain.
const ACTION_LOG_LOCK: &str = "actions.Log";

pub type ActionKey = (String, Vec<u8>);

def_table! {
    /// The durable log entry per `(kind, key)`.
    actions: ActionKey => ActionRecord
}

def_table! {
    /// Registration-order index. Written once per entry, never rewritten,
    /// so the executor drains in registration order and `scan_after` can
    /// page by DbTime.
    actions_by_time: (DbTime, ActionKey) => ()
}

def_table! {
    /// Entries that have not completed yet.
    actions_pending: ActionKey => ()
}

#[derive(Debug, Encode, Decode, Clone)]
pub struct ActionRecord {
    pub kind: String,
    pub key: Vec<u8>,
    pub payload: Vec<u8>,
    pub requires_approval: bool,
    pub approved: bool,
    pub created_at: Timestamp,
    pub created_time: DbTime,
    pub running_at: Option<Timestamp>,
    pub done_at: Option<Timestamp>,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn is_done(&self) -> bool {
        self.done_at.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.is_done() && self.error.is_none()
    }
}

#[derive(Debug, Snafu)]
pub enum ActionError {
    #[snafu(transparent)]
    Db { source: DbError },
    #[snafu(display("no action `{kind}` with key `{key}`"))]
    UnknownAction { kind: String, key: String },
    #[snafu(display("action `{kind}` with key `{key}` has not completed"))]
    NotDone { kind: String, key: String },
}

pub type ActionResult<T> = std::result::Result<T, ActionError>;

fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/// Executes one kind of action.
#[async_trait]
pub trait Actioner: Send + Sync {
    /// Perform the side effect; the returned bytes are recorded as the
    /// action's durable result.
    async fn run(&self, payload: &[u8]) -> Result<Vec<u8>, BoxedError>;

    /// Human-readable rendering of a payload for listings.
    fn for_display(&self, payload: &[u8]) -> String;
}

pub struct ActionLog {
    db: Arc<Database>,
    runners: Mutex<HashMap<String, Arc<dyn Actioner>>>,
}

impl ActionLog {
    pub async fn new(db: Arc<Database>) -> DbResult<Self> {
        db.write_with(|tx| {
            let _ = tx.open_table(&actions::TABLE)?;
            let _ = tx.open_table(&actions_by_time::TABLE)?;
            let _ = tx.open_table(&actions_pending::TABLE)?;
            Ok(())
        })
        .await?;
        Ok(Self {
            db,
            runners: Mutex::new(HashMap::new()),
        })
    }

    /// Declare the actioner for a kind. Registering a kind twice is a
    /// programming error.
    pub fn register(&self, kind: &str, runner: Arc<dyn Actioner>) {
        let prev = self
            .runners
            .lock()
            .expect("Locking failed")
            .insert(kind.to_string(), runner);
        assert!(prev.is_none(), "duplicate actioner for kind {kind}");
    }

    /// Atomically insert a pending entry iff `(kind, key)` has none.
    ///
    /// Returns false (and changes nothing) on a duplicate. Entries that do
    /// not require approval are approved at creation.
    pub async fn before(
        &self,
        kind: &str,
        key: &[u8],
        payload: Vec<u8>,
        requires_approval: bool,
    ) -> DbResult<bool> {
        let _guard = self.db.locks().lock(ACTION_LOG_LOCK).await;
        let action_key = (kind.to_string(), key.to_vec());
        let inserted = self
            .db
            .write_with(|tx| {
                let mut actions_tbl = tx.open_table(&actions::TABLE)?;
                if actions_tbl.get(&action_key)?.is_some() {
                    return Ok(false);
                }

                let mut by_time_tbl = tx.open_table(&actions_by_time::TABLE)?;
                let mut pending_tbl = tx.open_table(&actions_pending::TABLE)?;
                let mut max_tbl = tx.open_table(&timed_max::TABLE)?;

                let log_kind = ACTION_LOG_KIND.to_string();
                let created_time = max_tbl
                    .get(&log_kind)?
                    .map(|guard| guard.value())
                    .unwrap_or(DbTime::ZERO)
                    .next();
                max_tbl.insert(&log_kind, &created_time)?;

                actions_tbl.insert(
                    &action_key,
                    &ActionRecord {
                        kind: action_key.0.clone(),
                        key: action_key.1.clone(),
                        payload,
                        requires_approval,
                        approved: !requires_approval,
                        created_at: Timestamp::now(),
                        created_time,
                        running_at: None,
                        done_at: None,
                        result: None,
                        error: None,
                    },
                )?;
                by_time_tbl.insert(&(created_time, action_key.clone()), &())?;
                pending_tbl.insert(&action_key, &())?;
                Ok(true)
            })
            .await?;

        if inserted {
            debug!(target: LOG_TARGET, kind, key = %display_key(key), requires_approval, "Registered action");
        } else {
            debug!(target: LOG_TARGET, kind, key = %display_key(key), "Action already registered, skipping");
        }
        Ok(inserted)
    }

    /// Record approval of an entry created with `requires_approval`.
    /// Idempotent on already-approved entries.
    pub async fn approve(&self, kind: &str, key: &[u8]) -> ActionResult<()> {
        let action_key = (kind.to_string(), key.to_vec());
        let found = self
            .db
            .write_with(|tx| {
                let mut actions_tbl = tx.open_table(&actions::TABLE)?;
                let Some(mut record) = actions_tbl.get(&action_key)?.map(|guard| guard.value())
                else {
                    return Ok(false);
                };
                if !record.approved {
                    record.approved = true;
                    actions_tbl.insert(&action_key, &record)?;
                }
                Ok(true)
            })
            .await?;
        if !found {
            return UnknownActionSnafu {
                kind,
                key: display_key(key),
            }
            .fail();
        }
        info!(target: LOG_TARGET, kind, key = %display_key(key), "Approved action");
        Ok(())
    }

    pub async fn get(&self, kind: &str, key: &[u8]) -> DbResult<Option<ActionRecord>> {
        let action_key = (kind.to_string(), key.to_vec());
        self.db
            .read_with(|tx| {
                let actions_tbl = tx.open_table(&actions::TABLE)?;
                Ok(actions_tbl.get(&action_key)?.map(|guard| guard.value()))
            })
            .await
    }

    /// Drain the pending queue: execute every approved, not-yet-done entry
    /// in registration order and durably record each outcome. Returns the
    /// number of actions executed.
    pub async fn run(&self) -> DbResult<usize> {
        let _guard = self.db.locks().lock(ACTION_LOG_LOCK).await;

        let runnable = self
            .db
            .read_with(|tx| {
                let actions_tbl = tx.open_table(&actions::TABLE)?;
                let by_time_tbl = tx.open_table(&actions_by_time::TABLE)?;
                let pending_tbl = tx.open_table(&actions_pending::TABLE)?;

                let mut runnable = vec![];
                for item in by_time_tbl.range::<(DbTime, ActionKey)>(..)? {
                    let (key_guard, _) = item?;
                    let (_, action_key) = key_guard.value();
                    if pending_tbl.get(&action_key)?.is_none() {
                        continue;
                    }
                    let record = actions_tbl
                        .get(&action_key)?
                        .expect("Pending action without log entry")
                        .value();
                    if record.approved && !record.is_done() {
                        runnable.push(record);
                    }
                }
                Ok(runnable)
            })
            .await?;

        let mut executed = 0;
        for record in runnable {
            self.execute(record).await?;
            executed += 1;
        }
        Ok(executed)
    }

    async fn execute(&self, record: ActionRecord) -> DbResult<()> {
        let action_key = (record.kind.clone(), record.key.clone());

        let runner = self
            .runners
            .lock()
            .expect("Locking failed")
            .get(&record.kind)
            .cloned();
        let Some(runner) = runner else {
            warn!(target: LOG_TARGET, kind = %record.kind, "No actioner registered for kind, skipping");
            return Ok(());
        };

        self.db
            .write_with(|tx| {
                let mut actions_tbl = tx.open_table(&actions::TABLE)?;
                let mut updated = record.clone();
                updated.running_at = Some(Timestamp::now());
                actions_tbl.insert(&action_key, &updated)?;
                Ok(())
            })
            .await?;

        info!(
            target: LOG_TARGET,
            kind = %record.kind,
            key = %display_key(&record.key),
            display = %runner.for_display(&record.payload),
            "Running action"
        );
        let outcome = runner.run(&record.payload).await;

        if let Err(err) = &outcome {
            warn!(
                target: LOG_TARGET,
                kind = %record.kind,
                key = %display_key(&record.key),
                err = %err.as_ref().fmt_compact(),
                "Action failed; entry frozen for manual re-run"
            );
        }

        self.db
            .write_with(|tx| {
                let mut actions_tbl = tx.open_table(&actions::TABLE)?;
                let mut pending_tbl = tx.open_table(&actions_pending::TABLE)?;

                let mut updated = actions_tbl
                    .get(&action_key)?
                    .expect("Running action without log entry")
                    .value();
                updated.done_at = Some(Timestamp::now());
                match outcome {
                    Ok(result) => updated.result = Some(result),
                    Err(err) => updated.error = Some(err.as_ref().fmt_compact().to_string()),
                }
                actions_tbl.insert(&action_key, &updated)?;
                pending_tbl.remove(&action_key)?;
                Ok(())
            })
            .await
    }

    /// Re-queue a completed entry for another execution. The prior error (or
    /// result) is cleared. Only completed entries can be re-run.
    pub async fn rerun(&self, kind: &str, key: &[u8]) -> ActionResult<()> {
        enum RerunState {
            Unknown,
            NotDone,
            Requeued,
        }

        let _guard = self.db.locks().lock(ACTION_LOG_LOCK).await;
        let action_key = (kind.to_string(), key.to_vec());
        let state = self
            .db
            .write_with(|tx| {
                let mut actions_tbl = tx.open_table(&actions::TABLE)?;
                let mut pending_tbl = tx.open_table(&actions_pending::TABLE)?;

                let Some(mut record) = actions_tbl.get(&action_key)?.map(|guard| guard.value())
                else {
                    return Ok(RerunState::Unknown);
                };
                if !record.is_done() {
                    return Ok(RerunState::NotDone);
                }
                record.running_at = None;
                record.done_at = None;
                record.result = None;
                record.error = None;
                actions_tbl.insert(&action_key, &record)?;
                pending_tbl.insert(&action_key, &())?;
                Ok(RerunState::Requeued)
            })
            .await?;

        match state {
            RerunState::Unknown => UnknownActionSnafu {
                kind,
                key: display_key(key),
            }
            .fail(),
            RerunState::NotDone => NotDoneSnafu {
                kind,
                key: display_key(key),
            }
            .fail(),
            RerunState::Requeued => {
                info!(target: LOG_TARGET, kind, key = %display_key(key), "Re-queued action");
                Ok(())
            }
        }
    }

    /// Entries registered strictly after `since`, in registration order,
    /// filtered by kind.
    pub async fn scan_after(
        &self,
        since: DbTime,
        filter: impl Fn(&str) -> bool,
    ) -> DbResult<Vec<ActionRecord>> {
        self.db
            .read_with(|tx| {
                let actions_tbl = tx.open_table(&actions::TABLE)?;
                let by_time_tbl = tx.open_table(&actions_by_time::TABLE)?;

                let mut records = vec![];
                for item in by_time_tbl.range((since.next(), ActionKey::default())..)? {
                    let (key_guard, _) = item?;
                    let (_, action_key) = key_guard.value();
                    if !filter(&action_key.0) {
                        continue;
                    }
                    let record = actions_tbl
                        .get(&action_key)?
                        .expect("Action index entry without log entry")
                        .value();
                    records.push(record);
                }
                Ok(records)
            })
            .await
    }

    /// Render pending and completed entries for the command surface.
    pub async fn list_display(&self) -> DbResult<Vec<String>> {
        let records = self.scan_after(DbTime::ZERO, |_| true).await?;
        let runners = self.runners.lock().expect("Locking failed");
        Ok(records
            .iter()
            .map(|record| {
                let display = runners
                    .get(&record.kind)
                    .map(|runner| runner.for_display(&record.payload))
                    .unwrap_or_else(|| display_key(&record.payload));
                let status = if record.succeeded() {
                    "done"
                } else if record.is_done() {
                    "failed"
                } else if record.approved {
                    "pending"
                } else {
                    "awaiting approval"
                };
                format!(
                    "[{status}] {} {}: {display}",
                    record.kind,
                    display_key(&record.key)
                )
            })
            .collect())
    }

    /// Remove every entry. Test support only.
    pub async fn clear_for_testing(&self) -> DbResult<()> {
        self.db
            .write_with(|tx| {
                let mut actions_tbl = tx.open_table(&actions::TABLE)?;
                let mut by_time_tbl = tx.open_table(&actions_by_time::TABLE)?;
                let mut pending_tbl = tx.open_table(&actions_pending::TABLE)?;

                let keys: Vec<ActionKey> = {
                    let mut keys = vec![];
                    for item in actions_tbl.range::<ActionKey>(..)? {
                        let (key_guard, _) = item?;
                        keys.push(key_guard.value());
                    }
                    keys
                };
                for key in keys {
                    let record = actions_tbl
                        .get(&key)?
                        .expect("Scanned key vanished")
                        .value();
                    actions_tbl.remove(&key)?;
                    by_time_tbl.remove(&(record.created_time, key.clone()))?;
                    pending_tbl.remove(&key)?;
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests;
