//! Durable ordered storage for Oscar.
//!
//! A thin typed layer over redb: composite tuple keys encoded by
//! `redb-bincode` preserve component order, so range scans over key prefixes
//! work the way the rest of the system expects. On top of the plain tables
//! this crate provides the timed log ([`timed::Timed`]), an append-only,
//! DbTime-indexed view with named resumable cursors ([`watcher::Watcher`]).
//!
//! Integrity errors (undecodable records, index entries without a primary
//! row) are fatal by design: callers `expect` at the outermost boundary and
//! the process aborts rather than proceeding on corrupt state.

pub mod tables;
pub mod timed;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::result;
use std::sync::Arc;

use snafu::{Location, ResultExt as _, Snafu};
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinError;
use tracing::debug;

pub use self::tables::{db_version, timed_max, watcher_cursors};
pub use oscar_core::error::BoxedError;
pub use redb_bincode::{ReadTransaction, ReadableTable, WriteTransaction};

const LOG_TARGET: &str = "oscar::db";

/// Bump on incompatible table layout changes. Event-kind names and key
/// shapes are stable; changing either invalidates stored data.
const DB_VERSION: u64 = 0;

#[derive(Debug, Snafu)]
pub enum DbError {
    Database {
        source: redb::DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Table {
        source: redb::TableError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: redb::StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    Transaction {
        #[snafu(source(from(redb::TransactionError, Box::new)))]
        source: Box<redb::TransactionError>,
        #[snafu(implicit)]
        location: Location,
    },
    Commit {
        source: redb::CommitError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("Database version {db_ver} is newer than supported {code_ver}"))]
    DbVersionTooHigh { db_ver: u64, code_ver: u64 },
    Join {
        source: JoinError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    DbTxLogic {
        source: BoxedError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type DbResult<T> = result::Result<T, DbError>;

/// Process-wide advisory locks, keyed by name.
///
/// Serializes logically-coupled multi-transaction operations: per-project
/// sync, per-watcher flush, action registration. The guard releases on drop;
/// re-entry by the same task deadlocks, so hold guards across the whole
/// critical section and never nest the same name.
#[derive(Debug, Default)]
pub struct Locks {
    inner: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Locks {
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .inner
            .lock()
            .expect("Locking failed")
            .entry(name.to_string())
            .or_default()
            .clone();
        mutex.lock_owned().await
    }
}

#[derive(Debug)]
pub struct Database {
    inner: redb_bincode::Database,
    locks: Locks,
}

impl Database {
    pub async fn open(path: impl Into<PathBuf>) -> DbResult<Database> {
        let path = path.into();
        debug!(target: LOG_TARGET, path = %path.display(), "Opening database");

        let inner = tokio::task::spawn_blocking(move || redb::Database::create(path))
            .await
            .context(JoinSnafu)?
            .context(DatabaseSnafu)?;

        Self::open_inner(inner).await
    }

    pub async fn new_in_memory() -> DbResult<Database> {
        debug!(target: LOG_TARGET, "Opening in-memory database");
        let inner = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .context(DatabaseSnafu)?;
        Self::open_inner(inner).await
    }

    async fn open_inner(inner: redb::Database) -> DbResult<Database> {
        let inner = redb_bincode::Database::from(inner);

        Self::write_with_inner(&inner, |tx| {
            Self::init_tables_tx(tx)?;
            Self::check_db_version_tx(tx)?;
            Ok(())
        })
        .await?;

        Ok(Self {
            inner,
            locks: Locks::default(),
        })
    }

    fn init_tables_tx(tx: &WriteTransaction) -> DbResult<()> {
        let _ = tx.open_table(&db_version::TABLE)?;
        let _ = tx.open_table(&timed_max::TABLE)?;
        let _ = tx.open_table(&watcher_cursors::TABLE)?;
        Ok(())
    }

    fn check_db_version_tx(tx: &WriteTransaction) -> DbResult<()> {
        let mut table = tx.open_table(&db_version::TABLE)?;
        let stored = table.get(&())?.map(|guard| guard.value());
        let db_ver = match stored {
            Some(db_ver) => db_ver,
            None => {
                table.insert(&(), &DB_VERSION)?;
                DB_VERSION
            }
        };
        if DB_VERSION < db_ver {
            return DbVersionTooHighSnafu {
                db_ver,
                code_ver: DB_VERSION,
            }
            .fail();
        }
        Ok(())
    }

    pub fn locks(&self) -> &Locks {
        &self.locks
    }

    async fn write_with_inner<T>(
        inner: &redb_bincode::Database,
        f: impl FnOnce(&'_ WriteTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = inner.begin_write().context(TransactionSnafu)?;
            let res = f(&dbtx)?;

            dbtx.commit().context(CommitSnafu)?;

            Ok(res)
        })
    }

    pub async fn write_with<T>(
        &self,
        f: impl FnOnce(&'_ WriteTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        Self::write_with_inner(&self.inner, f).await
    }

    pub async fn read_with<T>(
        &self,
        f: impl FnOnce(&'_ ReadTransaction) -> DbResult<T>,
    ) -> DbResult<T> {
        tokio::task::block_in_place(|| {
            let dbtx = self.inner.begin_read().context(TransactionSnafu)?;

            f(&dbtx)
        })
    }
}

#[cfg(test)]
mod tests;
