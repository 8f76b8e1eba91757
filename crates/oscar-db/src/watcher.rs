//! Named resumable cursors over a timed kind.
//!
//! A watcher delivers entries strictly after its cursor, in DbTime order.
//! Progress is two-phase: `mark_old` advances the in-memory cursor,
//! `flush` persists it. A consumer that stops without marking leaves the
//! cursor untouched and sees the same entries again; a consumer that marks
//! but crashes before flushing re-reads from the last flushed position.
//! Both are safe because downstream effects deduplicate.

use oscar_core::DbTime;
use tracing::debug;

use crate::timed::{Timed, TimedEntry};
use crate::{Database, DbResult, watcher_cursors};

const LOG_TARGET: &str = "oscar::db::watcher";

pub struct Watcher<K: 'static> {
    timed: &'static Timed<K>,
    name: String,
    latest: DbTime,
}

impl<K> Watcher<K>
where
    K: bincode::Encode + bincode::Decode<()> + Clone + Default + 'static,
{
    /// Load the persisted cursor for `(kind, name)`. Watchers constructed
    /// with the same name continue each other's flushed progress.
    pub async fn new(
        db: &Database,
        timed: &'static Timed<K>,
        name: impl Into<String>,
    ) -> DbResult<Self> {
        let name = name.into();
        let cursor_key = (timed.kind().to_string(), name.clone());
        let latest = db
            .read_with(|tx| {
                let cursors = tx.open_table(&watcher_cursors::TABLE)?;
                Ok(cursors
                    .get(&cursor_key)?
                    .map(|guard| guard.value())
                    .unwrap_or(DbTime::ZERO))
            })
            .await?;
        Ok(Self {
            timed,
            name,
            latest,
        })
    }

    /// Entries strictly after the cursor, in DbTime order.
    pub async fn recent(&self, db: &Database) -> DbResult<Vec<TimedEntry<K>>> {
        let after = self.latest;
        db.read_with(|tx| self.timed.scan_by_time_tx(tx, after)).await
    }

    /// Like [`recent`](Self::recent), skipping keys the predicate rejects
    /// without decoding their values.
    pub async fn recent_filtered(
        &self,
        db: &Database,
        filter: impl Fn(&K) -> bool,
    ) -> DbResult<Vec<TimedEntry<K>>> {
        let after = self.latest;
        db.read_with(|tx| self.timed.scan_by_time_filtered_tx(tx, after, filter))
            .await
    }

    /// Advance the in-memory cursor. Monotonic: lower values are ignored.
    pub fn mark_old(&mut self, t: DbTime) {
        if self.latest < t {
            self.latest = t;
        }
    }

    /// Persist the in-memory cursor. Idempotent; never moves the persisted
    /// cursor backwards.
    pub async fn flush(&self, db: &Database) -> DbResult<()> {
        let cursor_key = (self.timed.kind().to_string(), self.name.clone());
        let latest = self.latest;
        let _guard = db
            .locks()
            .lock(&format!("watcher/{}/{}", self.timed.kind(), self.name))
            .await;
        db.write_with(|tx| {
            let mut cursors = tx.open_table(&watcher_cursors::TABLE)?;
            let stored = cursors
                .get(&cursor_key)?
                .map(|guard| guard.value())
                .unwrap_or(DbTime::ZERO);
            if stored < latest {
                cursors.insert(&cursor_key, &latest)?;
            }
            Ok(())
        })
        .await
    }

    /// Reset the cursor to zero, in memory and persisted.
    pub async fn restart(&mut self, db: &Database) -> DbResult<()> {
        debug!(target: LOG_TARGET, kind = self.timed.kind(), name = %self.name, "Restarting watcher");
        let cursor_key = (self.timed.kind().to_string(), self.name.clone());
        self.latest = DbTime::ZERO;
        db.write_with(|tx| {
            let mut cursors = tx.open_table(&watcher_cursors::TABLE)?;
            cursors.remove(&cursor_key)?;
            Ok(())
        })
        .await
    }

    /// The persisted cursor position.
    pub async fn latest(&self, db: &Database) -> DbResult<DbTime> {
        let cursor_key = (self.timed.kind().to_string(), self.name.clone());
        db.read_with(|tx| {
            let cursors = tx.open_table(&watcher_cursors::TABLE)?;
            Ok(cursors
                .get(&cursor_key)?
                .map(|guard| guard.value())
                .unwrap_or(DbTime::ZERO))
        })
        .await
    }

    /// The in-memory cursor position (marked, possibly not yet flushed).
    pub fn marked(&self) -> DbTime {
        self.latest
    }
}
