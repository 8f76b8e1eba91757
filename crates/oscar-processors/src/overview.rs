//! Overview generator: posts one summary comment per busy issue, then keeps
//! it fresh as comments accumulate.
//!
//! Two action shapes per issue over its lifetime: one *post* and
//! zero-or-more *updates*, the update key carrying the highest comment id
//! summarized so far. Whatever new events arrive, successful runs are at
//! least [`MIN_SECS_BETWEEN_RUNS`] apart, tracked in a per-`(name, bot)`
//! run record.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bincode::{Decode, Encode};
use oscar_actions::{ActionLog, Actioner};
use oscar_ai::Generator;
use oscar_core::error::{BoxedError, FmtCompact as _};
use oscar_core::{Project, Timestamp};
use oscar_db::{Database, def_table};
use oscar_github::store::{EventWatcher, GITHUB_EVENTS};
use oscar_github::types::{PostId, parse_post_id};
use oscar_github::{ApiKind, Issue, IssueComment, IssueSource, Typed, events};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{LOG_TARGET, ProcessorConfig, ProcessorResult};

pub const ACTION_KIND: &str = "overview.PostOrUpdate";

/// Successful runs are at least a day apart, no matter how busy the log is.
pub const MIN_SECS_BETWEEN_RUNS: u64 = 24 * 60 * 60;

pub const DEFAULT_MIN_COMMENTS: usize = 2;

def_table! {
    /// Per-issue overview progress. Key: (bot, name, project, issue).
    overview_state: (String, String, Project, u64) => IssueState
}

def_table! {
    /// Last successful run per (name, bot).
    overview_runs: (String, String) => RunState
}

#[derive(Debug, Encode, Decode, Clone, Copy, Default)]
pub struct IssueState {
    /// Highest comment id covered by the posted overview.
    pub last_comment: u64,
    /// The bot's own overview comment, once posted.
    pub overview_comment: Option<u64>,
}

#[derive(Debug, Encode, Decode, Clone, Copy)]
pub struct RunState {
    pub last_run: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OverviewOp {
    Post,
    Update { last_comment: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewAction {
    pub project: Project,
    pub issue: u64,
    pub op: OverviewOp,
    pub body: String,
}

fn post_key(project: &Project, issue: u64) -> Vec<u8> {
    format!("{project}#{issue}#post").into_bytes()
}

fn update_key(project: &Project, issue: u64, last_comment: u64) -> Vec<u8> {
    format!("{project}#{issue}#update#{last_comment}").into_bytes()
}

pub struct Overview {
    config: ProcessorConfig,
    /// Identity half of the run-state key; one bot account may run several
    /// named overview processors.
    bot: String,
    pub min_comments: usize,
    watcher: EventWatcher,
}

impl Overview {
    pub async fn new(
        db: &Database,
        config: ProcessorConfig,
        bot: impl Into<String>,
    ) -> ProcessorResult<Self> {
        db.write_with(|tx| {
            let _ = tx.open_table(&overview_state::TABLE)?;
            let _ = tx.open_table(&overview_runs::TABLE)?;
            Ok(())
        })
        .await?;
        let watcher = EventWatcher::github(db, &config.name).await?;
        Ok(Self {
            config,
            bot: bot.into(),
            min_comments: DEFAULT_MIN_COMMENTS,
            watcher,
        })
    }

    pub async fn run(
        &mut self,
        db: &Database,
        actions: &ActionLog,
        llm: &dyn Generator,
    ) -> ProcessorResult<usize> {
        self.run_at(db, actions, llm, Timestamp::now()).await
    }

    /// The run loop with an explicit clock, so cadence is testable.
    pub async fn run_at(
        &mut self,
        db: &Database,
        actions: &ActionLog,
        llm: &dyn Generator,
        now: Timestamp,
    ) -> ProcessorResult<usize> {
        let run_key = (self.config.name.clone(), self.bot.clone());
        let last_run = db
            .read_with(|tx| {
                let table = tx.open_table(&overview_runs::TABLE)?;
                Ok(table.get(&run_key)?.map(|guard| guard.value()))
            })
            .await?;
        if let Some(run_state) = last_run {
            if now.secs_since(run_state.last_run) < MIN_SECS_BETWEEN_RUNS {
                debug!(
                    target: LOG_TARGET,
                    name = %self.config.name,
                    last_run = %run_state.last_run,
                    "Overview ran recently, skipping"
                );
                return Ok(0);
            }
        }

        let events_batch = self.watcher.recent(db).await?;
        let mut handled: BTreeSet<(Project, u64)> = BTreeSet::new();
        let mut registered = 0;

        for event in &events_batch {
            if !matches!(event.typed, Typed::Issue(_) | Typed::IssueComment(_)) {
                continue;
            }
            if !self.config.project_enabled(&event.project) {
                continue;
            }
            let issue_id = (event.project.clone(), event.issue);
            if handled.contains(&issue_id) {
                self.advance(db, event.db_time).await?;
                continue;
            }

            match self
                .process_issue(db, actions, llm, &event.project, event.issue, now)
                .await?
            {
                IssueOutcome::Registered => {
                    handled.insert(issue_id);
                    registered += 1;
                    self.advance(db, event.db_time).await?;
                }
                IssueOutcome::Covered => {
                    handled.insert(issue_id);
                    self.advance(db, event.db_time).await?;
                }
                IssueOutcome::Skipped => {
                    handled.insert(issue_id);
                }
                IssueOutcome::Retry => {}
            }
        }

        let run_state = RunState { last_run: now };
        db.write_with(|tx| {
            let mut table = tx.open_table(&overview_runs::TABLE)?;
            table.insert(&run_key, &run_state)?;
            Ok(())
        })
        .await?;
        Ok(registered)
    }

    async fn process_issue(
        &self,
        db: &Database,
        actions: &ActionLog,
        llm: &dyn Generator,
        project: &Project,
        number: u64,
        now: Timestamp,
    ) -> ProcessorResult<IssueOutcome> {
        // The parent issue may not be mirrored yet when its comment event
        // arrives first; retry on a later run.
        let Some(issue) = read_issue(db, project, number).await? else {
            return Ok(IssueOutcome::Retry);
        };
        if !issue.is_open() {
            return Ok(IssueOutcome::Skipped);
        }
        if let Some(reason) = self.config.skip_issue(&issue, now) {
            debug!(target: LOG_TARGET, %project, issue = number, reason, "Overview skipping issue");
            return Ok(IssueOutcome::Skipped);
        }

        let comments = read_comments(db, project, number, &self.config).await?;
        if comments.len() < self.min_comments {
            return Ok(IssueOutcome::Skipped);
        }
        let last_comment = comments.iter().map(|comment| comment.id).max().unwrap_or(0);

        let state_key = (
            self.bot.clone(),
            self.config.name.clone(),
            project.clone(),
            number,
        );
        let state = db
            .read_with(|tx| {
                let table = tx.open_table(&overview_state::TABLE)?;
                Ok(table
                    .get(&state_key)?
                    .map(|guard| guard.value())
                    .unwrap_or_default())
            })
            .await?;

        let (op, key) = if actions.get(ACTION_KIND, &post_key(project, number)).await?.is_none() {
            (OverviewOp::Post, post_key(project, number))
        } else if state.last_comment < last_comment {
            (
                OverviewOp::Update { last_comment },
                update_key(project, number, last_comment),
            )
        } else {
            return Ok(IssueOutcome::Covered);
        };
        if actions.get(ACTION_KIND, &key).await?.is_some() {
            return Ok(IssueOutcome::Covered);
        }

        let body = match llm
            .generate(&overview_prompt(project, &issue, &comments), None)
            .await
        {
            Ok(text) => format_overview(&text),
            Err(err) => {
                warn!(target: LOG_TARGET, %project, issue = number, err = %err.fmt_compact(), "Overview backend failure");
                return Ok(IssueOutcome::Retry);
            }
        };

        info!(
            target: LOG_TARGET,
            %project,
            issue = number,
            op = ?op,
            comments = comments.len(),
            enabled = self.config.enabled,
            "Overview prepared"
        );
        if !self.config.enabled {
            return Ok(IssueOutcome::Skipped);
        }

        let action = OverviewAction {
            project: project.clone(),
            issue: number,
            op,
            body,
        };
        actions
            .before(
                ACTION_KIND,
                &key,
                serde_json::to_vec(&action).expect("action payload serializes"),
                self.config.require_approval,
            )
            .await?;

        let new_state = IssueState {
            last_comment,
            overview_comment: state.overview_comment,
        };
        db.write_with(|tx| {
            let mut table = tx.open_table(&overview_state::TABLE)?;
            table.insert(&state_key, &new_state)?;
            Ok(())
        })
        .await?;
        Ok(IssueOutcome::Registered)
    }

    async fn advance(&mut self, db: &Database, t: oscar_core::DbTime) -> ProcessorResult<()> {
        if self.config.enabled {
            self.watcher.mark_old(t);
            self.watcher.flush(db).await?;
        }
        Ok(())
    }
}

enum IssueOutcome {
    /// An action was registered; the event is done.
    Registered,
    /// Already covered by an existing action; the event is done.
    Covered,
    /// Ineligible for now; leave unmarked, later events re-trigger.
    Skipped,
    /// Transient failure; leave unmarked, the next run retries.
    Retry,
}

async fn read_issue(
    db: &Database,
    project: &Project,
    number: u64,
) -> ProcessorResult<Option<Issue>> {
    let key = (project.clone(), number, ApiKind::Issues, number);
    let record = db.read_with(|tx| GITHUB_EVENTS.get_tx(tx, &key)).await?;
    Ok(record.and_then(|record| serde_json::from_slice(&record.raw).ok()))
}

async fn read_comments(
    db: &Database,
    project: &Project,
    number: u64,
    config: &ProcessorConfig,
) -> ProcessorResult<Vec<IssueComment>> {
    let all = events(db, project, Some(number), Some(number)).await?;
    Ok(all
        .into_iter()
        .filter_map(|event| match event.typed {
            Typed::IssueComment(comment) if !config.author_skipped(&comment.user.login) => {
                Some(comment)
            }
            _ => None,
        })
        .collect())
}

fn overview_prompt(project: &Project, issue: &Issue, comments: &[IssueComment]) -> String {
    let mut prompt = format!(
        "Write a concise overview of the discussion on this tracker issue \
         for a maintainer who has not read it.\n\n\
         Issue {project}#{number}: {title}\n{body}\n\nComments:\n",
        number = issue.number,
        title = issue.title,
        body = issue.body(),
    );
    for (index, comment) in comments.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] @{}: {}\n",
            index + 1,
            comment.user.login,
            comment.body()
        ));
    }
    prompt.push_str("\nSummarize the state of the discussion and any open questions.\n");
    prompt
}

fn format_overview(text: &str) -> String {
    format!("**Issue overview**\n\n{}\n", text.trim())
}

/// Executes `overview.PostOrUpdate` actions: posts the first overview
/// comment, edits it afterwards. The posted comment's id is remembered in
/// the issue state so updates find it.
pub struct OverviewActioner {
    db: Arc<Database>,
    source: Arc<dyn IssueSource>,
    bot: String,
    name: String,
}

impl OverviewActioner {
    pub fn new(
        db: Arc<Database>,
        source: Arc<dyn IssueSource>,
        bot: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            db,
            source,
            bot: bot.into(),
            name: name.into(),
        }
    }
}

#[async_trait]
impl Actioner for OverviewActioner {
    async fn run(&self, payload: &[u8]) -> Result<Vec<u8>, BoxedError> {
        let action: OverviewAction = serde_json::from_slice(payload)?;
        let state_key = (
            self.bot.clone(),
            self.name.clone(),
            action.project.clone(),
            action.issue,
        );
        let mut state = self
            .db
            .read_with(|tx| {
                let table = tx.open_table(&overview_state::TABLE)?;
                Ok(table
                    .get(&state_key)?
                    .map(|guard| guard.value())
                    .unwrap_or_default())
            })
            .await?;

        let result = match state.overview_comment {
            Some(comment_id) => {
                self.source
                    .edit_comment(&action.project, comment_id, &action.body)
                    .await?;
                format!("updated comment {comment_id}")
            }
            None => {
                let url = self
                    .source
                    .post_comment(&action.project, action.issue, &action.body)
                    .await?;
                if let Some(PostId::Comment { comment_id, .. }) = parse_post_id(&url) {
                    state.overview_comment = Some(comment_id);
                }
                url
            }
        };

        self.db
            .write_with(|tx| {
                let mut table = tx.open_table(&overview_state::TABLE)?;
                table.insert(&state_key, &state)?;
                Ok(())
            })
            .await?;
        Ok(result.into_bytes())
    }

    fn for_display(&self, payload: &[u8]) -> String {
        match serde_json::from_slice::<OverviewAction>(payload) {
            Ok(action) => match action.op {
                OverviewOp::Post => {
                    format!("post overview on {}#{}", action.project, action.issue)
                }
                OverviewOp::Update { last_comment } => format!(
                    "update overview on {}#{} through comment {last_comment}",
                    action.project, action.issue
                ),
            },
            Err(_) => "overview.PostOrUpdate (unreadable payload)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests;
