//! The document corpus: one indexable text document per tracker event,
//! plus the sync loops that keep corpus and vector index aligned.

use oscar_core::error::FmtCompact as _;
use oscar_db::timed::{Timed, TimedBatch};
use oscar_db::watcher::Watcher;
use oscar_db::{Database, DbResult};
use serde::{Deserialize, Serialize};
use snafu::ResultExt as _;
use tracing::{debug, warn};

use oscar_github::store::EventWatcher;
use oscar_github::types::Typed;
use oscar_github::{comment_url, issue_url};

use crate::{AiResult, BadJsonSnafu, Embedder, LOG_TARGET, VectorDb};

/// Documents are keyed by event URL; the stored value is the JSON-encoded
/// body of [`Document`] minus the id.
pub static DOCS: Timed<String> = Timed::new("docs.Doc", "docs", "docs_by_time");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(skip)]
    pub id: String,
    pub title: String,
    pub text: String,
}

impl Document {
    /// The text handed to the embedder.
    pub fn embedding_text(&self) -> String {
        if self.title.is_empty() {
            self.text.clone()
        } else {
            format!("{}\n{}", self.title, self.text)
        }
    }
}

pub async fn init_tables(db: &Database) -> DbResult<()> {
    db.write_with(|tx| DOCS.create_tables(tx)).await
}

/// Converts new tracker events into corpus documents.
pub struct DocsSync {
    watcher: EventWatcher,
}

impl DocsSync {
    pub async fn new(db: &Database) -> DbResult<Self> {
        Ok(Self {
            watcher: EventWatcher::github(db, "docs").await?,
        })
    }

    /// Returns the number of documents written.
    pub async fn sync(&mut self, db: &Database) -> AiResult<usize> {
        let events = self.watcher.recent(db).await?;
        let mut batch = TimedBatch::new(&DOCS);
        let mut written = 0;

        for event in &events {
            let document = match &event.typed {
                Typed::Issue(issue) if !issue.is_pull_request() => Some(Document {
                    id: issue_url(&event.project, issue.number),
                    title: issue.title.clone(),
                    text: issue.body().to_string(),
                }),
                Typed::IssueComment(comment) => Some(Document {
                    id: comment_url(&event.project, event.issue, comment.id),
                    title: String::new(),
                    text: comment.body().to_string(),
                }),
                Typed::Discussion(discussion) => Some(Document {
                    id: discussion.html_url.clone(),
                    title: discussion.title.clone(),
                    text: discussion.body().to_string(),
                }),
                Typed::DiscussionComment(comment) => Some(Document {
                    id: comment.html_url.clone(),
                    title: String::new(),
                    text: comment.body().to_string(),
                }),
                Typed::Issue(_) | Typed::IssueEvent(_) => None,
            };

            if let Some(document) = document {
                if !document.id.is_empty() {
                    batch.set(
                        document.id.clone(),
                        serde_json::to_vec(&document).context(BadJsonSnafu)?,
                    );
                    batch.maybe_apply(db).await?;
                    written += 1;
                }
            }
            self.watcher.mark_old(event.db_time);
        }

        batch.apply(db).await?;
        self.watcher.flush(db).await?;
        debug!(target: LOG_TARGET, written, "Synced documents");
        Ok(written)
    }
}

/// Keeps the vector index aligned with the corpus.
pub struct VectorSync {
    watcher: Watcher<String>,
}

impl VectorSync {
    pub async fn new(db: &Database) -> DbResult<Self> {
        Ok(Self {
            watcher: Watcher::new(db, &DOCS, "vector").await?,
        })
    }

    /// Embed every corpus document newer than the cursor and upsert it into
    /// the index. Returns the number of vectors written.
    pub async fn sync(
        &mut self,
        db: &Database,
        embedder: &dyn Embedder,
        vector_db: &dyn VectorDb,
    ) -> AiResult<usize> {
        let entries = self.watcher.recent(db).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut documents = vec![];
        let mut last = None;
        for entry in &entries {
            match serde_json::from_slice::<Document>(&entry.raw) {
                Ok(mut document) => {
                    document.id = entry.key.clone();
                    documents.push(document);
                }
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        id = %entry.key,
                        err = %err.fmt_compact(),
                        "Skipping undecodable corpus document"
                    );
                }
            }
            last = Some(entry.db_time);
        }

        let texts: Vec<String> = documents
            .iter()
            .map(Document::embedding_text)
            .collect();
        let vectors = embedder.embed(&texts).await?;
        let written = vectors.len();
        vector_db
            .set_batch(
                documents
                    .into_iter()
                    .map(|document| document.id)
                    .zip(vectors)
                    .collect(),
            )
            .await;

        if let Some(last) = last {
            self.watcher.mark_old(last);
            self.watcher.flush(db).await?;
        }
        debug!(target: LOG_TARGET, written, "Synced vectors");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use oscar_core::error::BoxedErrorResult;
    use oscar_core::Project;
    use oscar_github::store::GITHUB_EVENTS;
    use oscar_github::types::ApiKind;

    use super::*;
    use crate::embed::HashEmbedder;
    use crate::vector::MemoryVectorDb;

    async fn temp_db() -> BoxedErrorResult<Database> {
        let db = Database::new_in_memory().await?;
        oscar_github::store::init_tables(&db).await?;
        init_tables(&db).await?;
        Ok(db)
    }

    async fn ingest_issue(
        db: &Database,
        project: &Project,
        number: u64,
        title: &str,
        body: &str,
    ) -> BoxedErrorResult<()> {
        let json = serde_json::json!({
            "number": number,
            "title": title,
            "body": body,
            "state": "open",
            "user": {"login": "gopher"},
            "html_url": issue_url(project, number),
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        });
        GITHUB_EVENTS
            .set(
                db,
                (project.clone(), number, ApiKind::Issues, number),
                serde_json::to_vec(&json)?,
            )
            .await?;
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn docs_sync_converts_events_and_resumes() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let project = Project::new("golang/go")?;

        ingest_issue(&db, &project, 1, "first", "body one").await?;
        ingest_issue(&db, &project, 2, "second", "body two").await?;

        let mut docs_sync = DocsSync::new(&db).await?;
        assert_eq!(docs_sync.sync(&db).await?, 2);
        // Nothing new: nothing written.
        assert_eq!(docs_sync.sync(&db).await?, 0);

        ingest_issue(&db, &project, 3, "third", "body three").await?;
        assert_eq!(docs_sync.sync(&db).await?, 1);

        let record = db
            .read_with(|tx| DOCS.get_tx(tx, &issue_url(&project, 1)))
            .await?
            .expect("document stored");
        let document: Document = serde_json::from_slice(&record.raw)?;
        assert_eq!(document.title, "first");
        assert_eq!(document.text, "body one");
        Ok(())
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn vector_sync_aligns_index_with_corpus() -> BoxedErrorResult<()> {
        let db = temp_db().await?;
        let project = Project::new("golang/go")?;
        let embedder = HashEmbedder::default();
        let vector_db = MemoryVectorDb::new();

        ingest_issue(&db, &project, 1, "net/http hangs", "request never returns").await?;
        ingest_issue(&db, &project, 2, "compiler crash", "ICE on generics").await?;

        let mut docs_sync = DocsSync::new(&db).await?;
        let mut vector_sync = VectorSync::new(&db).await?;
        docs_sync.sync(&db).await?;
        assert_eq!(vector_sync.sync(&db, &embedder, &vector_db).await?, 2);
        assert_eq!(vector_db.len(), 2);
        assert!(vector_db.get(&issue_url(&project, 1)).await.is_some());

        // Re-running moves nothing.
        assert_eq!(vector_sync.sync(&db, &embedder, &vector_db).await?, 0);

        // A new event flows through both stages.
        ingest_issue(&db, &project, 3, "net/http stalls", "request never returns").await?;
        docs_sync.sync(&db).await?;
        assert_eq!(vector_sync.sync(&db, &embedder, &vector_db).await?, 1);

        // Similar issues actually find each other through the index.
        let query = vector_db.get(&issue_url(&project, 1)).await.unwrap();
        let results = vector_db.search(&query, 0.3, 5).await;
        assert!(
            results
                .iter()
                .any(|result| result.id == issue_url(&project, 3))
        );
        Ok(())
    }
}
