use oscar_core::DbTime;
use oscar_core::error::BoxedErrorResult;

use crate::timed::{Timed, TimedBatch};
use crate::watcher::Watcher;
use crate::{Database, def_table};

static NOTES: Timed<(String, u64)> = Timed::new("test.Note", "test_notes", "test_notes_by_time");

async fn temp_db() -> BoxedErrorResult<Database> {
    let db = Database::new_in_memory().await?;
    db.write_with(|tx| NOTES.create_tables(tx)).await?;
    Ok(db)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn timed_set_assigns_strictly_increasing_db_times() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    let mut times = vec![];
    for n in 0..5u64 {
        times.push(NOTES.set(&db, ("p".into(), n), vec![n as u8]).await?);
    }
    for pair in times.windows(2) {
        assert!(pair[0] < pair[1]);
    }
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn timed_overwrite_replaces_value_and_reassigns_db_time() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    let key = ("p".to_string(), 7u64);
    let first = NOTES.set(&db, key.clone(), b"old".to_vec()).await?;
    let second = NOTES.set(&db, key.clone(), b"new".to_vec()).await?;
    assert!(first < second);

    // Exactly one index entry survives, pointing at the new value.
    let entries = db
        .read_with(|tx| NOTES.scan_by_time_tx(tx, DbTime::ZERO))
        .await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].db_time, second);
    assert_eq!(entries[0].raw, b"new");

    let record = db
        .read_with(|tx| NOTES.get_tx(tx, &key))
        .await?
        .expect("record present");
    assert_eq!(record.raw, b"new");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn watcher_delivers_in_db_time_order_and_resumes() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    for n in 0..3u64 {
        NOTES.set(&db, ("p".into(), n), vec![n as u8]).await?;
    }

    let mut watcher = Watcher::new(&db, &NOTES, "orderer").await?;
    let entries = watcher.recent(&db).await?;
    assert_eq!(entries.len(), 3);
    for pair in entries.windows(2) {
        assert!(pair[0].db_time < pair[1].db_time);
    }

    for entry in &entries {
        watcher.mark_old(entry.db_time);
        watcher.flush(&db).await?;
    }
    assert!(watcher.recent(&db).await?.is_empty());

    // A second watcher with the same name continues from the flush.
    let resumed = Watcher::new(&db, &NOTES, "orderer").await?;
    assert!(resumed.recent(&db).await?.is_empty());

    // A differently named watcher starts from the beginning.
    let fresh = Watcher::new(&db, &NOTES, "other").await?;
    assert_eq!(fresh.recent(&db).await?.len(), 3);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn watcher_without_mark_old_repeats_entries() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    for n in 0..2u64 {
        NOTES.set(&db, ("p".into(), n), vec![]).await?;
    }

    let watcher = Watcher::new(&db, &NOTES, "repeater").await?;
    let first = watcher.recent(&db).await?;
    let second = watcher.recent(&db).await?;
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert_eq!(watcher.latest(&db).await?, DbTime::ZERO);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn watcher_mark_old_is_monotonic_and_flush_idempotent() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    for n in 0..3u64 {
        NOTES.set(&db, ("p".into(), n), vec![]).await?;
    }

    let mut watcher = Watcher::new(&db, &NOTES, "mono").await?;
    let entries = watcher.recent(&db).await?;
    let last = entries.last().expect("entries present").db_time;

    watcher.mark_old(last);
    // Lower marks are ignored.
    watcher.mark_old(entries[0].db_time);
    assert_eq!(watcher.marked(), last);

    watcher.flush(&db).await?;
    watcher.flush(&db).await?;
    assert_eq!(watcher.latest(&db).await?, last);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn watcher_recent_filtered_skips_keys() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    NOTES.set(&db, ("keep".into(), 1), vec![]).await?;
    NOTES.set(&db, ("skip".into(), 2), vec![]).await?;
    NOTES.set(&db, ("keep".into(), 3), vec![]).await?;

    let watcher = Watcher::new(&db, &NOTES, "filtering").await?;
    let entries = watcher
        .recent_filtered(&db, |(project, _)| project == "keep")
        .await?;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|entry| entry.key.0 == "keep"));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn watcher_restart_resets_cursor() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    NOTES.set(&db, ("p".into(), 1), vec![]).await?;

    let mut watcher = Watcher::new(&db, &NOTES, "restarter").await?;
    let entries = watcher.recent(&db).await?;
    watcher.mark_old(entries[0].db_time);
    watcher.flush(&db).await?;
    assert!(watcher.recent(&db).await?.is_empty());

    watcher.restart(&db).await?;
    assert_eq!(watcher.latest(&db).await?, DbTime::ZERO);
    assert_eq!(watcher.recent(&db).await?.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn batch_applies_at_threshold_and_on_demand() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    let mut batch = TimedBatch::new(&NOTES);
    for n in 0..3u64 {
        batch.set(("p".into(), n), vec![]);
        batch.maybe_apply(&db).await?;
    }
    // Below the threshold nothing has been committed yet.
    assert_eq!(
        db.read_with(|tx| NOTES.scan_by_time_tx(tx, DbTime::ZERO))
            .await?
            .len(),
        0
    );
    assert_eq!(batch.len(), 3);

    batch.apply(&db).await?;
    assert!(batch.is_empty());
    assert_eq!(
        db.read_with(|tx| NOTES.scan_by_time_tx(tx, DbTime::ZERO))
            .await?
            .len(),
        3
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn delete_range_removes_values_and_index_entries() -> BoxedErrorResult<()> {
    let db = temp_db().await?;

    for n in 0..5u64 {
        NOTES.set(&db, ("p".into(), n), vec![]).await?;
    }

    let removed = db
        .write_with(|tx| {
            let mut tables = NOTES.open_write(tx)?;
            tables.delete_range(&("p".into(), 1), &("p".into(), 3))
        })
        .await?;
    assert_eq!(removed, 3);

    let remaining = db
        .read_with(|tx| NOTES.scan_by_time_tx(tx, DbTime::ZERO))
        .await?;
    let numbers: Vec<u64> = remaining.iter().map(|entry| entry.key.1).collect();
    assert_eq!(numbers, [0, 4]);
    Ok(())
}

def_table! {
    /// Plain (non-timed) table, exercising the macro from a dependent module.
    test_settings: String => u64
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn plain_table_range_scan_is_key_ordered() -> BoxedErrorResult<()> {
    let db = Database::new_in_memory().await?;

    db.write_with(|tx| {
        let mut table = tx.open_table(&test_settings::TABLE)?;
        table.insert(&"b".to_string(), &2)?;
        table.insert(&"a".to_string(), &1)?;
        table.insert(&"c".to_string(), &3)?;
        Ok(())
    })
    .await?;

    let keys = db
        .read_with(|tx| {
            let table = tx.open_table(&test_settings::TABLE)?;
            let mut keys = vec![];
            for item in table.range::<String>(..)? {
                let (k, _) = item?;
                keys.push(k.value());
            }
            Ok(keys)
        })
        .await?;
    assert_eq!(keys, ["a", "b", "c"]);
    Ok(())
}
