//! The timed log: append-only, DbTime-indexed storage for one logical kind.
//!
//! A kind owns two tables:
//!
//! - primary: `key => (DbTime, raw bytes)`
//! - by-time: `(DbTime, key) => ()`
//!
//! Every set allocates the kind's next DbTime from [`crate::timed_max`] in
//! the same transaction, so DbTimes strictly increase per kind. Overwriting
//! an existing key removes the stale by-time entry: at most one index entry
//! exists per key, always pointing at the live record.

use bincode::{Decode, Encode};
use oscar_core::DbTime;

use crate::{Database, DbResult, ReadTransaction, WriteTransaction, timed_max};

/// Batches below this many buffered writes are not worth a transaction.
pub const DEFAULT_BATCH_THRESHOLD: usize = 64;

#[derive(Debug, Encode, Decode, Clone)]
pub struct TimedRecord {
    pub db_time: DbTime,
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TimedEntry<K> {
    pub db_time: DbTime,
    pub key: K,
    pub raw: Vec<u8>,
}

/// A timed kind: its stable name plus its two table definitions.
///
/// Key types must encode [`Default`] as the lexicographically smallest value
/// of the type (true for tuples of numbers, enums-with-first-variant-zero
/// and strings), since range scans use it as the open lower bound.
pub struct Timed<K: 'static> {
    kind: &'static str,
    primary: redb_bincode::TableDefinition<'static, K, TimedRecord>,
    by_time: redb_bincode::TableDefinition<'static, (DbTime, K), ()>,
}

impl<K> Timed<K> {
    pub const fn new(
        kind: &'static str,
        primary_table: &'static str,
        by_time_table: &'static str,
    ) -> Self {
        Self {
            kind,
            primary: redb_bincode::TableDefinition::new(primary_table),
            by_time: redb_bincode::TableDefinition::new(by_time_table),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl<K> Timed<K>
where
    K: bincode::Encode + bincode::Decode<()> + Clone + Default + 'static,
{
    pub fn primary_def(&self) -> &redb_bincode::TableDefinition<'static, K, TimedRecord> {
        &self.primary
    }

    pub fn by_time_def(&self) -> &redb_bincode::TableDefinition<'static, (DbTime, K), ()> {
        &self.by_time
    }

    /// Create the kind's tables so later reads don't fail on a fresh store.
    pub fn create_tables(&self, tx: &WriteTransaction) -> DbResult<()> {
        let _ = tx.open_table(&self.primary)?;
        let _ = tx.open_table(&self.by_time)?;
        Ok(())
    }

    /// Open the kind's tables for writing.
    ///
    /// Also opens the shared DbTime counter table, so a single transaction
    /// may hold at most one kind's write tables at a time.
    pub fn open_write<'a>(&self, tx: &'a WriteTransaction) -> DbResult<TimedWriteTables<'a, K>> {
        Ok(TimedWriteTables {
            max: tx.open_table(&timed_max::TABLE)?,
            primary: tx.open_table(&self.primary)?,
            by_time: tx.open_table(&self.by_time)?,
            kind: self.kind,
        })
    }

    pub fn get_tx(&self, tx: &ReadTransaction, key: &K) -> DbResult<Option<TimedRecord>> {
        let primary = tx.open_table(&self.primary)?;
        Ok(primary.get(key)?.map(|guard| guard.value()))
    }

    /// One-off set in its own transaction. Use [`TimedBatch`] for bulk writes.
    pub async fn set(&'static self, db: &Database, key: K, raw: Vec<u8>) -> DbResult<DbTime> {
        db.write_with(move |tx| {
            let mut tables = self.open_write(tx)?;
            tables.set(&key, raw)
        })
        .await
    }

    /// Entries in DbTime order, strictly after `after`.
    pub fn scan_by_time_tx(
        &self,
        tx: &ReadTransaction,
        after: DbTime,
    ) -> DbResult<Vec<TimedEntry<K>>> {
        self.scan_by_time_filtered_tx(tx, after, |_| true)
    }

    /// Same, skipping keys the predicate rejects without touching the
    /// primary table for them.
    pub fn scan_by_time_filtered_tx(
        &self,
        tx: &ReadTransaction,
        after: DbTime,
        filter: impl Fn(&K) -> bool,
    ) -> DbResult<Vec<TimedEntry<K>>> {
        let by_time = tx.open_table(&self.by_time)?;
        let primary = tx.open_table(&self.primary)?;

        let mut entries = vec![];
        for item in by_time.range((after.next(), K::default())..)? {
            let (key_guard, _) = item?;
            let (db_time, key) = key_guard.value();
            if !filter(&key) {
                continue;
            }
            let record = primary
                .get(&key)?
                .expect("Timed index entry without primary row")
                .value();
            assert_eq!(
                record.db_time, db_time,
                "Timed index entry does not match primary row"
            );
            entries.push(TimedEntry {
                db_time,
                key,
                raw: record.raw,
            });
        }
        Ok(entries)
    }
}

/// Write handles for one timed kind within one transaction.
pub struct TimedWriteTables<'a, K>
where
    K: bincode::Encode + bincode::Decode<()> + 'static,
{
    max: timed_max::Table<'a>,
    primary: redb_bincode::Table<'a, K, TimedRecord>,
    by_time: redb_bincode::Table<'a, (DbTime, K), ()>,
    kind: &'static str,
}

impl<K> TimedWriteTables<'_, K>
where
    K: bincode::Encode + bincode::Decode<()> + Clone + 'static,
{
    /// Insert or overwrite, assigning the kind's next DbTime.
    pub fn set(&mut self, key: &K, raw: Vec<u8>) -> DbResult<DbTime> {
        let kind = self.kind.to_string();
        let last = self
            .max
            .get(&kind)?
            .map(|guard| guard.value())
            .unwrap_or(DbTime::ZERO);
        let db_time = last.next();
        self.max.insert(&kind, &db_time)?;

        let prev = self.primary.get(key)?.map(|guard| guard.value());
        if let Some(prev) = prev {
            self.by_time.remove(&(prev.db_time, key.clone()))?;
        }

        self.primary.insert(key, &TimedRecord { db_time, raw })?;
        self.by_time.insert(&(db_time, key.clone()), &())?;
        Ok(db_time)
    }

    pub fn get(&self, key: &K) -> DbResult<Option<TimedRecord>> {
        Ok(self.primary.get(key)?.map(|guard| guard.value()))
    }

    pub fn delete(&mut self, key: &K) -> DbResult<()> {
        let prev = self.primary.get(key)?.map(|guard| guard.value());
        if let Some(prev) = prev {
            self.primary.remove(key)?;
            self.by_time.remove(&(prev.db_time, key.clone()))?;
        }
        Ok(())
    }

    /// Delete every key in `lo..=hi`, index entries included. Returns the
    /// number removed.
    pub fn delete_range(&mut self, lo: &K, hi: &K) -> DbResult<usize> {
        let keys: Vec<K> = {
            let mut keys = vec![];
            for item in self.primary.range(lo.clone()..=hi.clone())? {
                let (key_guard, _) = item?;
                keys.push(key_guard.value());
            }
            keys
        };
        for key in &keys {
            self.delete(key)?;
        }
        Ok(keys.len())
    }
}

/// Buffered writes to one timed kind, flushed in bounded atomic batches.
pub struct TimedBatch<K: 'static> {
    timed: &'static Timed<K>,
    pending: Vec<(K, Vec<u8>)>,
    threshold: usize,
}

impl<K> TimedBatch<K>
where
    K: bincode::Encode + bincode::Decode<()> + Clone + Default + Send + 'static,
{
    pub fn new(timed: &'static Timed<K>) -> Self {
        Self {
            timed,
            pending: vec![],
            threshold: DEFAULT_BATCH_THRESHOLD,
        }
    }

    pub fn set(&mut self, key: K, raw: Vec<u8>) {
        self.pending.push((key, raw));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flush when the buffer has grown past the threshold.
    pub async fn maybe_apply(&mut self, db: &Database) -> DbResult<()> {
        if self.pending.len() < self.threshold {
            return Ok(());
        }
        self.apply(db).await
    }

    /// Flush everything buffered, atomically.
    pub async fn apply(&mut self, db: &Database) -> DbResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let timed = self.timed;
        db.write_with(move |tx| {
            let mut tables = timed.open_write(tx)?;
            for (key, raw) in pending {
                tables.set(&key, raw)?;
            }
            Ok(())
        })
        .await
    }
}
