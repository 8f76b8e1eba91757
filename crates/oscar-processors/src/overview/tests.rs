use std::sync::Arc;

use oscar_actions::ActionLog;
use oscar_ai::ScriptedGenerator;
use oscar_core::Project;
use oscar_core::error::BoxedErrorResult;
use oscar_github::DivertedEdit;

use super::*;
use crate::testutil::{TestGithub, seed_comment, seed_issue, temp_db, test_issue};

const BOT: &str = "oscar";

fn hour(n: u64) -> Timestamp {
    Timestamp::from(1_700_000_000u64 + n * 3600)
}

fn enabled_config(project: &Project) -> ProcessorConfig {
    ProcessorConfig::new("overview")
        .with_project(project.clone())
        .enabled(true)
}

async fn busy_issue(db: &Database, project: &Project) -> BoxedErrorResult<()> {
    seed_issue(
        db,
        project,
        &test_issue(project, 1, "net/http: hangs", "it hangs"),
    )
    .await?;
    seed_comment(db, project, 1, 101, "alice", "same here on linux").await?;
    seed_comment(db, project, 1, 102, "bob", "bisected to go1.22").await?;
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn posts_once_then_updates_after_cadence() -> BoxedErrorResult<()> {
    let db = Arc::new(temp_db().await?);
    let actions = ActionLog::new(db.clone()).await?;
    let project = Project::new("golang/go")?;
    let llm = ScriptedGenerator::new();
    busy_issue(&db, &project).await?;

    let mut overview = Overview::new(&db, enabled_config(&project), BOT).await?;

    llm.push("Two users confirm a hang; bisected to go1.22.");
    assert_eq!(overview.run_at(&db, &actions, &llm, hour(0)).await?, 1);
    assert!(
        actions
            .get(ACTION_KIND, &post_key(&project, 1))
            .await?
            .is_some()
    );

    // New activity arrives, but an hour later the cadence gate holds.
    seed_comment(&db, &project, 1, 103, "carol", "also seen on darwin").await?;
    assert_eq!(overview.run_at(&db, &actions, &llm, hour(1)).await?, 0);

    // Past the 24h mark the new comment produces an update action.
    llm.push("Three users confirm; also reproduces on darwin.");
    assert_eq!(overview.run_at(&db, &actions, &llm, hour(25)).await?, 1);
    let update = actions
        .get(ACTION_KIND, &update_key(&project, 1, 103))
        .await?
        .expect("update registered");
    let action: OverviewAction = serde_json::from_slice(&update.payload)?;
    assert!(matches!(action.op, OverviewOp::Update { last_comment: 103 }));

    // Nothing new: a run another day later registers nothing.
    assert_eq!(overview.run_at(&db, &actions, &llm, hour(50)).await?, 0);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn quiet_issues_are_not_summarized() -> BoxedErrorResult<()> {
    let db = Arc::new(temp_db().await?);
    let actions = ActionLog::new(db.clone()).await?;
    let project = Project::new("golang/go")?;
    let llm = ScriptedGenerator::new();

    seed_issue(
        &db,
        &project,
        &test_issue(&project, 2, "io: small question", "how does this work"),
    )
    .await?;
    seed_comment(&db, &project, 2, 201, "alice", "one reply").await?;

    let mut overview = Overview::new(&db, enabled_config(&project), BOT).await?;
    assert_eq!(overview.run_at(&db, &actions, &llm, hour(0)).await?, 0);
    assert!(llm.prompts().is_empty());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn skipped_authors_do_not_count_toward_minimum() -> BoxedErrorResult<()> {
    let db = Arc::new(temp_db().await?);
    let actions = ActionLog::new(db.clone()).await?;
    let project = Project::new("golang/go")?;
    let llm = ScriptedGenerator::new();

    seed_issue(
        &db,
        &project,
        &test_issue(&project, 3, "os: flaky test", "fails sometimes"),
    )
    .await?;
    seed_comment(&db, &project, 3, 301, "gopherbot", "automated message").await?;
    seed_comment(&db, &project, 3, 302, "gopherbot", "another bot note").await?;
    seed_comment(&db, &project, 3, 303, "alice", "a real reply").await?;

    let mut config = enabled_config(&project);
    config.skip_authors.insert("gopherbot".into());
    let mut overview = Overview::new(&db, config, BOT).await?;
    assert_eq!(overview.run_at(&db, &actions, &llm, hour(0)).await?, 0);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn runner_posts_then_edits_its_own_comment() -> BoxedErrorResult<()> {
    let db = Arc::new(temp_db().await?);
    let actions = ActionLog::new(db.clone()).await?;
    let project = Project::new("golang/go")?;
    let github = Arc::new(TestGithub::new());
    let llm = ScriptedGenerator::new();
    busy_issue(&db, &project).await?;

    actions.register(
        ACTION_KIND,
        Arc::new(OverviewActioner::new(
            db.clone(),
            github.clone(),
            BOT,
            "overview",
        )),
    );

    let mut overview = Overview::new(&db, enabled_config(&project), BOT).await?;
    llm.push("First overview.");
    overview.run_at(&db, &actions, &llm, hour(0)).await?;
    actions.run().await?;

    let edits = github.edits();
    assert_eq!(edits.len(), 1);
    assert!(matches!(
        &edits[0],
        DivertedEdit::PostComment { body, .. } if body.contains("First overview.")
    ));

    // A later update edits the same comment instead of posting again.
    seed_comment(&db, &project, 1, 104, "dave", "new findings").await?;
    llm.push("Updated overview.");
    overview.run_at(&db, &actions, &llm, hour(30)).await?;
    actions.run().await?;

    let edits = github.edits();
    assert_eq!(edits.len(), 2);
    let DivertedEdit::EditComment {
        comment_id, body, ..
    } = &edits[1]
    else {
        panic!("expected comment edit, got {:?}", edits[1]);
    };
    // TestGithub handed out id 1 for the posted comment.
    assert_eq!(*comment_id, 1);
    assert!(body.contains("Updated overview."));
    Ok(())
}
