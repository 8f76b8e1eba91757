//! The local event mirror: timed kinds, queries and watchers.

use oscar_core::{DbTime, Project};
use oscar_core::error::FmtCompact as _;
use oscar_db::timed::{Timed, TimedEntry};
use oscar_db::watcher::Watcher;
use oscar_db::{Database, DbResult};
use snafu::ResultExt as _;
use tracing::warn;

use crate::types::{ApiKind, Event, EventKey, Typed};
use crate::{DecodeSnafu, GithubResult, LOG_TARGET};

/// Issue-flavored events mirrored from REST.
pub static GITHUB_EVENTS: Timed<EventKey> =
    Timed::new("github.Event", "github_events", "github_events_by_time");

/// Discussion-flavored events mirrored from GraphQL.
pub static DISCUSSION_EVENTS: Timed<EventKey> = Timed::new(
    "discussion.Event",
    "discussion_events",
    "discussion_events_by_time",
);

pub async fn init_tables(db: &Database) -> DbResult<()> {
    db.write_with(|tx| {
        GITHUB_EVENTS.create_tables(tx)?;
        DISCUSSION_EVENTS.create_tables(tx)?;
        let _ = tx.open_table(&crate::ingest::github_sync::TABLE)?;
        let _ = tx.open_table(&crate::discussions::discussion_sync::TABLE)?;
        Ok(())
    })
    .await
}

/// Decode one stored entry into an [`Event`]. Undecodable JSON is an error
/// for the caller to log and skip; it never poisons iteration.
pub fn decode_event(entry: &TimedEntry<EventKey>) -> GithubResult<Event> {
    let (project, issue, api, id) = entry.key.clone();
    let json: serde_json::Value = serde_json::from_slice(&entry.raw).context(DecodeSnafu)?;
    let typed = Typed::decode(api, &json).context(DecodeSnafu)?;
    Ok(Event {
        project,
        issue,
        api,
        id,
        db_time: entry.db_time,
        json,
        typed,
    })
}

fn decode_entries(entries: Vec<TimedEntry<EventKey>>) -> Vec<Event> {
    entries
        .iter()
        .filter_map(|entry| match decode_event(entry) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    key = ?entry.key,
                    err = %err.fmt_compact(),
                    "Skipping undecodable stored event"
                );
                None
            }
        })
        .collect()
}

/// Events of a project ordered by `(issue, api, id)`, optionally bounded by
/// an inclusive issue-number range.
pub async fn events(
    db: &Database,
    project: &Project,
    issue_min: Option<u64>,
    issue_max: Option<u64>,
) -> DbResult<Vec<Event>> {
    let lo: EventKey = (
        project.clone(),
        issue_min.unwrap_or(0),
        ApiKind::MIN,
        0,
    );
    let hi: EventKey = (
        project.clone(),
        issue_max.unwrap_or(u64::MAX),
        ApiKind::MAX,
        u64::MAX,
    );
    let entries = db
        .read_with(|tx| {
            let primary = tx.open_table(GITHUB_EVENTS.primary_def())?;
            let mut entries = vec![];
            for item in primary.range(lo..=hi)? {
                let (key_guard, value_guard) = item?;
                let record = value_guard.value();
                entries.push(TimedEntry {
                    db_time: record.db_time,
                    key: key_guard.value(),
                    raw: record.raw,
                });
            }
            Ok(entries)
        })
        .await?;
    Ok(decode_entries(entries))
}

/// Events strictly after `after` in insertion (DbTime) order. An empty
/// project filter means all projects.
pub async fn events_after(
    db: &Database,
    after: DbTime,
    project: Option<&Project>,
) -> DbResult<Vec<Event>> {
    let entries = db
        .read_with(|tx| {
            GITHUB_EVENTS.scan_by_time_filtered_tx(tx, after, |key| match project {
                Some(project) => &key.0 == project,
                None => true,
            })
        })
        .await?;
    Ok(decode_entries(entries))
}

/// A named resumable cursor yielding typed events.
pub struct EventWatcher {
    inner: Watcher<EventKey>,
}

impl EventWatcher {
    /// Watcher over issue events (`github.Event`).
    pub async fn github(db: &Database, name: impl Into<String>) -> DbResult<Self> {
        Ok(Self {
            inner: Watcher::new(db, &GITHUB_EVENTS, name).await?,
        })
    }

    /// Watcher over discussion events (`discussion.Event`).
    pub async fn discussions(db: &Database, name: impl Into<String>) -> DbResult<Self> {
        Ok(Self {
            inner: Watcher::new(db, &DISCUSSION_EVENTS, name).await?,
        })
    }

    /// Typed events strictly after the cursor, in DbTime order. Events whose
    /// stored JSON no longer decodes are logged and skipped.
    pub async fn recent(&self, db: &Database) -> DbResult<Vec<Event>> {
        Ok(decode_entries(self.inner.recent(db).await?))
    }

    /// Like [`recent`](Self::recent), restricted to one project without
    /// decoding the rest.
    pub async fn recent_project(&self, db: &Database, project: &Project) -> DbResult<Vec<Event>> {
        let entries = self
            .inner
            .recent_filtered(db, |key| &key.0 == project)
            .await?;
        Ok(decode_entries(entries))
    }

    pub fn mark_old(&mut self, t: DbTime) {
        self.inner.mark_old(t);
    }

    pub async fn flush(&self, db: &Database) -> DbResult<()> {
        self.inner.flush(db).await
    }

    pub async fn restart(&mut self, db: &Database) -> DbResult<()> {
        self.inner.restart(db).await
    }

    pub async fn latest(&self, db: &Database) -> DbResult<DbTime> {
        self.inner.latest(db).await
    }
}

#[cfg(test)]
mod tests {
    use oscar_core::error::BoxedErrorResult;
    use oscar_db::timed::TimedBatch;

    use super::*;
    use crate::types::issue_url;

    pub(crate) fn issue_json(project: &Project, number: u64, updated_at: &str) -> serde_json::Value {
        serde_json::json!({
            "number": number,
            "title": format!("issue {number}"),
            "body": "body",
            "state": "open",
            "user": {"login": "gopher"},
            "html_url": issue_url(project, number),
            "created_at": updated_at,
            "updated_at": updated_at,
        })
    }

    async fn temp_db() -> BoxedErrorResult<Database> {
        let db = Database::new_in_memory().await?;
        init_tables(&db).await?;
        Ok(db)
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn events_query_orders_by_issue_api_id() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let project = Project::new("golang/go")?;

        // Ingest three issues with increasing upstream update times, written
        // out of key order.
        let mut batch = TimedBatch::new(&GITHUB_EVENTS);
        for (number, updated) in [
            (3u64, "2024-01-01T00:00:03Z"),
            (1, "2024-01-01T00:00:01Z"),
            (2, "2024-01-01T00:00:02Z"),
        ] {
            batch.set(
                (project.clone(), number, ApiKind::Issues, number),
                serde_json::to_vec(&issue_json(&project, number, updated))?,
            );
        }
        batch.apply(&db).await?;

        let all = events(&db, &project, None, None).await?;
        let numbers: Vec<u64> = all.iter().map(|event| event.issue).collect();
        assert_eq!(numbers, [1, 2, 3]);

        let bounded = events(&db, &project, Some(2), Some(3)).await?;
        let numbers: Vec<u64> = bounded.iter().map(|event| event.issue).collect();
        assert_eq!(numbers, [2, 3]);

        // Insertion order is DbTime order, not key order.
        let after = events_after(&db, DbTime::ZERO, None).await?;
        let numbers: Vec<u64> = after.iter().map(|event| event.issue).collect();
        assert_eq!(numbers, [3, 1, 2]);
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn events_after_filters_by_project() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let go = Project::new("golang/go")?;
        let tools = Project::new("golang/tools")?;

        for project in [&go, &tools] {
            GITHUB_EVENTS
                .set(
                    &db,
                    (project.clone(), 1, ApiKind::Issues, 1),
                    serde_json::to_vec(&issue_json(project, 1, "2024-01-01T00:00:00Z"))?,
                )
                .await?;
        }

        assert_eq!(events_after(&db, DbTime::ZERO, None).await?.len(), 2);
        let only_go = events_after(&db, DbTime::ZERO, Some(&go)).await?;
        assert_eq!(only_go.len(), 1);
        assert_eq!(only_go[0].project, go);
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn reingest_replaces_event_and_reassigns_db_time() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let project = Project::new("golang/go")?;
        let key = (project.clone(), 1, ApiKind::Issues, 1u64);

        let first = GITHUB_EVENTS
            .set(
                &db,
                key.clone(),
                serde_json::to_vec(&issue_json(&project, 1, "2024-01-01T00:00:00Z"))?,
            )
            .await?;
        let second = GITHUB_EVENTS
            .set(
                &db,
                key.clone(),
                serde_json::to_vec(&issue_json(&project, 1, "2024-02-01T00:00:00Z"))?,
            )
            .await?;
        assert!(first < second);

        let all = events(&db, &project, None, None).await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].db_time, second);
        let Typed::Issue(issue) = &all[0].typed else {
            panic!("expected issue");
        };
        assert_eq!(issue.updated_at, "2024-02-01T00:00:00Z");
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn watcher_yields_typed_events_and_resumes() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let project = Project::new("golang/go")?;

        for number in 1..=2u64 {
            GITHUB_EVENTS
                .set(
                    &db,
                    (project.clone(), number, ApiKind::Issues, number),
                    serde_json::to_vec(&issue_json(&project, number, "2024-01-01T00:00:00Z"))?,
                )
                .await?;
        }

        let mut watcher = EventWatcher::github(&db, "typed").await?;
        let recent = watcher.recent(&db).await?;
        assert_eq!(recent.len(), 2);
        assert!(matches!(recent[0].typed, Typed::Issue(_)));

        for event in &recent {
            watcher.mark_old(event.db_time);
        }
        watcher.flush(&db).await?;
        assert!(watcher.recent(&db).await?.is_empty());
        Ok(())
    }
}
