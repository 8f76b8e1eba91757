use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use oscar_core::DbTime;
use oscar_core::error::{BoxedError, BoxedErrorResult};
use oscar_db::Database;

use super::{ActionLog, Actioner};

struct CountingActioner {
    calls: AtomicUsize,
    fail: bool,
}

impl CountingActioner {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Actioner for CountingActioner {
    async fn run(&self, payload: &[u8]) -> Result<Vec<u8>, BoxedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err("deliberate failure".into());
        }
        Ok(payload.to_vec())
    }

    fn for_display(&self, payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }
}

async fn temp_log() -> BoxedErrorResult<ActionLog> {
    let db = Arc::new(Database::new_in_memory().await?);
    Ok(ActionLog::new(db).await?)
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn before_is_idempotent_per_key() -> BoxedErrorResult<()> {
    let log = temp_log().await?;

    assert!(log.before("test.Kind", b"key-1", b"first".to_vec(), false).await?);
    assert!(!log.before("test.Kind", b"key-1", b"second".to_vec(), false).await?);
    // Same key under a different kind is a different action.
    assert!(log.before("test.Other", b"key-1", b"third".to_vec(), false).await?);

    let record = log.get("test.Kind", b"key-1").await?.expect("registered");
    assert_eq!(record.payload, b"first");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn concurrent_before_resolves_to_one_entry() -> BoxedErrorResult<()> {
    let log = Arc::new(temp_log().await?);

    let mut tasks = vec![];
    for n in 0..8u8 {
        let log = log.clone();
        tasks.push(tokio::spawn(async move {
            log.before("test.Kind", b"contended", vec![n], false).await
        }));
    }

    let mut inserted = 0;
    for task in tasks {
        if task.await?? {
            inserted += 1;
        }
    }
    assert_eq!(inserted, 1);

    let records = log.scan_after(DbTime::ZERO, |_| true).await?;
    assert_eq!(records.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn run_executes_each_action_exactly_once() -> BoxedErrorResult<()> {
    let log = temp_log().await?;
    let actioner = CountingActioner::new(false);
    log.register("test.Kind", actioner.clone());

    log.before("test.Kind", b"a", b"payload-a".to_vec(), false).await?;
    log.before("test.Kind", b"b", b"payload-b".to_vec(), false).await?;

    assert_eq!(log.run().await?, 2);
    assert_eq!(log.run().await?, 0);
    assert_eq!(actioner.calls(), 2);

    let record = log.get("test.Kind", b"a").await?.expect("present");
    assert!(record.succeeded());
    assert_eq!(record.result.as_deref(), Some(b"payload-a".as_slice()));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn approval_gates_execution() -> BoxedErrorResult<()> {
    let log = temp_log().await?;
    let actioner = CountingActioner::new(false);
    log.register("test.Kind", actioner.clone());

    log.before("test.Kind", b"gated", b"payload".to_vec(), true).await?;
    assert_eq!(log.run().await?, 0);
    assert_eq!(actioner.calls(), 0);

    log.approve("test.Kind", b"gated").await?;
    // Approval is idempotent.
    log.approve("test.Kind", b"gated").await?;
    assert_eq!(log.run().await?, 1);
    assert_eq!(actioner.calls(), 1);

    assert!(log.approve("test.Kind", b"missing").await.is_err());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn failed_action_is_frozen_until_rerun() -> BoxedErrorResult<()> {
    let log = temp_log().await?;
    let actioner = CountingActioner::new(true);
    log.register("test.Kind", actioner.clone());

    log.before("test.Kind", b"broken", b"payload".to_vec(), false).await?;
    assert_eq!(log.run().await?, 1);
    assert_eq!(actioner.calls(), 1);

    let record = log.get("test.Kind", b"broken").await?.expect("present");
    assert!(record.is_done());
    assert!(!record.succeeded());
    assert!(record.error.as_deref().unwrap().contains("deliberate failure"));

    // No silent retry.
    assert_eq!(log.run().await?, 0);
    assert_eq!(actioner.calls(), 1);

    // Manual re-run clears the outcome and executes again.
    log.rerun("test.Kind", b"broken").await?;
    assert_eq!(log.run().await?, 1);
    assert_eq!(actioner.calls(), 2);

    // Re-running an in-flight (not done) entry is rejected.
    log.before("test.Kind", b"fresh", b"payload".to_vec(), true).await?;
    assert!(log.rerun("test.Kind", b"fresh").await.is_err());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn scan_after_pages_in_registration_order() -> BoxedErrorResult<()> {
    let log = temp_log().await?;

    log.before("test.A", b"1", vec![], false).await?;
    log.before("test.B", b"2", vec![], false).await?;
    log.before("test.A", b"3", vec![], false).await?;

    let all = log.scan_after(DbTime::ZERO, |_| true).await?;
    assert_eq!(all.len(), 3);
    let keys: Vec<Vec<u8>> = all.iter().map(|record| record.key.clone()).collect();
    assert_eq!(keys, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);

    let only_a = log.scan_after(DbTime::ZERO, |kind| kind == "test.A").await?;
    assert_eq!(only_a.len(), 2);

    let after_first = log.scan_after(all[0].created_time, |_| true).await?;
    assert_eq!(after_first.len(), 2);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn clear_for_testing_empties_the_log() -> BoxedErrorResult<()> {
    let log = temp_log().await?;

    log.before("test.Kind", b"1", vec![], false).await?;
    log.before("test.Kind", b"2", vec![], false).await?;
    log.clear_for_testing().await?;

    assert!(log.scan_after(DbTime::ZERO, |_| true).await?.is_empty());
    assert!(log.get("test.Kind", b"1").await?.is_none());
    // The key is registerable again after clearing.
    assert!(log.before("test.Kind", b"1", vec![], false).await?);
    Ok(())
}
