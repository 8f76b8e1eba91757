//! Table declaration macro and the system tables every database carries.
//!
//! Crates that store data declare their own tables with [`def_table!`] and
//! create them once at startup inside a write transaction; reads of a table
//! that was never created are storage errors, not empty results.

use oscar_core::DbTime;

#[macro_export]
macro_rules! def_table {
    ($(#[$outer:meta])*
        $name:ident : $k:ty => $v:ty) => {
        #[allow(unused)]
        $(#[$outer])*
        pub mod $name {
            use super::*;
            pub type Key = $k;
            pub type Value = $v;
            pub type Definition<'a> = redb_bincode::TableDefinition<'a, Key, Value>;
            pub trait ReadableTable: redb_bincode::ReadableTable<Key, Value> {}
            impl<RT> ReadableTable for RT where RT: redb_bincode::ReadableTable<Key, Value> {}
            pub type Table<'a> = redb_bincode::Table<'a, Key, Value>;
            pub const TABLE: Definition = redb_bincode::TableDefinition::new(stringify!($name));
        }
    };
}

def_table! {
    /// Tracks table-layout version for forward-compatibility checks.
    db_version: () => u64
}

def_table! {
    /// Last DbTime assigned per timed kind.
    ///
    /// The allocation source for the per-kind monotonic counter: every
    /// timed-log write reads, increments and writes back within the same
    /// transaction, so assigned DbTimes strictly increase per kind.
    timed_max: String => DbTime
}

def_table! {
    /// Persisted watcher cursors.
    ///
    /// Key: (kind, watcher name). Two watchers constructed with the same
    /// name share progress through this table: a flush by one is the
    /// starting point of the next one constructed.
    watcher_cursors: (String, String) => DbTime
}
