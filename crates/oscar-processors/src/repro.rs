//! Reproduction extractor and bisection scheduler.
//!
//! For issues classified as bugs: extract a candidate repro program and the
//! reported failing/passing releases from the issue, clean both up, try the
//! program at both refs in the sandbox, and, when the failure actually
//! reproduces, log a bisection action for the external bisection service.
//!
//! All execution of user-supplied code goes through the [`Sandbox`]
//! contract; nothing in this module runs anything locally.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use oscar_actions::{ActionLog, Actioner};
use oscar_ai::{AiError, Generator, generate_json};
use oscar_core::error::{BoxedError, FmtCompact as _};
use oscar_core::{Project, Timestamp};
use oscar_db::Database;
use oscar_github::store::EventWatcher;
use oscar_github::{Issue, Typed};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::labels::{classify, read_categories};
use crate::{LOG_TARGET, ProcessorConfig, ProcessorResult, issue_action_key};

pub const ACTION_KIND: &str = "repro.Bisect";

/// Newest release branch the version cleaner knows about. Bump alongside
/// upstream releases.
pub const LATEST_RELEASE_MINOR: u32 = 23;

/// Runs a command inside a confined container, JSON over stdin/stdout.
/// External collaborator; the test suite scripts it.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `path args...` feeding `stdin`; `Ok` is the command's output,
    /// `Err` means it did not succeed.
    async fn output(&self, path: &str, args: &[String], stdin: &[u8])
    -> Result<Vec<u8>, BoxedError>;
}

// ---------------------------------------------------------------------------
// Markdown block model

/// The block shapes repro extraction cares about. Exhaustive by
/// construction: adding a variant forces every consumer to decide what to
/// do with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Paragraph(String),
    Heading { level: u8, text: String },
    CodeBlock { info: String, text: String },
}

/// Line-oriented parse of Markdown into blocks. Only fenced code blocks
/// need to be exact; everything else degrades to paragraphs.
pub fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks = vec![];
    let mut paragraph: Vec<&str> = vec![];
    let mut code: Option<(String, Vec<&str>)> = None;

    let flush_paragraph = |paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>| {
        if !paragraph.is_empty() {
            blocks.push(Block::Paragraph(paragraph.join("\n")));
            paragraph.clear();
        }
    };

    for line in text.lines() {
        if let Some((info, lines)) = &mut code {
            if line.trim_start().starts_with("```") {
                blocks.push(Block::CodeBlock {
                    info: info.clone(),
                    text: lines.join("\n"),
                });
                code = None;
            } else {
                lines.push(line);
            }
            continue;
        }
        if let Some(info) = line.trim_start().strip_prefix("```") {
            flush_paragraph(&mut paragraph, &mut blocks);
            code = Some((info.trim().to_string(), vec![]));
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            let level = 1 + rest.len().saturating_sub(rest.trim_start_matches('#').len());
            let text = rest.trim_start_matches('#').trim();
            if !text.is_empty() {
                flush_paragraph(&mut paragraph, &mut blocks);
                blocks.push(Block::Heading {
                    level: level.min(6) as u8,
                    text: text.to_string(),
                });
                continue;
            }
        }
        if line.trim().is_empty() {
            flush_paragraph(&mut paragraph, &mut blocks);
        } else {
            paragraph.push(line);
        }
    }
    // An unterminated fence still yields its content.
    if let Some((info, lines)) = code {
        blocks.push(Block::CodeBlock {
            info,
            text: lines.join("\n"),
        });
    }
    flush_paragraph(&mut paragraph, &mut blocks);
    blocks
}

/// Code blocks that plausibly hold Go source.
pub fn go_code_blocks(blocks: &[Block]) -> Vec<&str> {
    blocks
        .iter()
        .filter_map(|block| match block {
            Block::CodeBlock { info, text } if info.is_empty() || info == "go" => {
                Some(text.as_str())
            }
            Block::CodeBlock { .. } | Block::Paragraph(_) | Block::Heading { .. } => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Repro cleaning

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReproPackage {
    Main,
    P,
    PTest,
}

impl ReproPackage {
    pub fn clause(self) -> &'static str {
        match self {
            Self::Main => "package main",
            Self::P => "package p",
            Self::PTest => "package p_test",
        }
    }

    pub fn run_command(self) -> &'static str {
        match self {
            Self::Main => "go run .",
            Self::P => "go build .",
            Self::PTest => "go test .",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedRepro {
    pub source: String,
    pub package: ReproPackage,
    pub run_command: String,
}

static FUNC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^func\s+(\w+)").expect("func regex compiles"));
static PACKAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^package\s+(\w+)").expect("package regex compiles"));

fn pick_package(source: &str) -> ReproPackage {
    let mut has_test = false;
    for captures in FUNC_RE.captures_iter(source) {
        let name = &captures[1];
        if name == "main" {
            return ReproPackage::Main;
        }
        if name.starts_with("Test") || name.starts_with("Benchmark") || name.starts_with("Fuzz") {
            has_test = true;
        }
    }
    if has_test {
        ReproPackage::PTest
    } else {
        ReproPackage::P
    }
}

/// Normalize a candidate repro into a runnable single file: make sure it
/// has a package clause, record how to run it in a leading comment, and
/// format it through `goimports` in the sandbox when one is available.
pub async fn clean_repro(source: &str, sandbox: Option<&dyn Sandbox>) -> CleanedRepro {
    let package = pick_package(source);
    let mut body = source.trim_end().to_string();
    if !PACKAGE_RE.is_match(&body) {
        body = format!("{}\n\n{body}", package.clause());
    }
    let run_command = package.run_command().to_string();
    let mut cleaned = format!("// {run_command}\n\n{body}\n");

    if let Some(sandbox) = sandbox {
        match sandbox.output("goimports", &[], cleaned.as_bytes()).await {
            Ok(formatted) => match String::from_utf8(formatted) {
                Ok(formatted) if !formatted.trim().is_empty() => cleaned = formatted,
                _ => {}
            },
            Err(err) => {
                debug!(target: LOG_TARGET, err = %err.fmt_compact(), "goimports unavailable, keeping unformatted repro");
            }
        }
    }

    CleanedRepro {
        source: cleaned,
        package,
        run_command,
    }
}

// ---------------------------------------------------------------------------
// Version cleaning

static RELEASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?:go\s*)?1\.(\d+)(?:\.\d+)?(?:\s*(?:rc|beta)\s*\d+)?$")
        .expect("release regex compiles")
});

/// Map one user-guessed version to a repository ref: a release branch, or
/// `master` for tip-flavored answers. Unrecognized input maps to `None`.
fn clean_version(version: &str) -> Option<String> {
    let trimmed = version.trim();
    if trimmed.is_empty() {
        return None;
    }
    let lowered = trimmed.to_lowercase();
    if ["tip", "master", "devel", "head", "gotip"].contains(&lowered.as_str()) {
        return Some("master".to_string());
    }
    RELEASE_RE
        .captures(trimmed)
        .map(|captures| format!("release-branch.go1.{}", &captures[1]))
}

/// Normalize the fail/pass version pair. Unknown fail means the failure is
/// current: try `master`, with the previous release as the passing side.
pub fn clean_versions(fail: &str, pass: &str) -> (String, String) {
    let fail_ref = clean_version(fail);
    let pass_ref = clean_version(pass);

    match (fail_ref, pass_ref) {
        (Some(fail_ref), Some(pass_ref)) => (fail_ref, pass_ref),
        (Some(fail_ref), None) => {
            let pass_ref = match release_minor(&fail_ref) {
                Some(minor) if 1 < minor => format!("release-branch.go1.{}", minor - 1),
                _ => format!("release-branch.go1.{LATEST_RELEASE_MINOR}"),
            };
            (fail_ref, pass_ref)
        }
        (None, Some(pass_ref)) => ("master".to_string(), pass_ref),
        (None, None) => (
            "master".to_string(),
            format!("release-branch.go1.{LATEST_RELEASE_MINOR}"),
        ),
    }
}

fn release_minor(reference: &str) -> Option<u32> {
    reference
        .strip_prefix("release-branch.go1.")
        .and_then(|minor| minor.parse().ok())
}

// ---------------------------------------------------------------------------
// Trying the repro

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryOutcome {
    /// Fails at `fail_ref`, passes at `pass_ref`, possibly after swapping
    /// an inverted user guess.
    Confirmed { fail_ref: String, pass_ref: String },
    /// Same result at both refs; nothing to bisect.
    NotConfirmed,
}

/// Run the cleaned repro at both refs. The sandbox command is
/// `go-repro <ref> <run command>` with the source on stdin; success means
/// the program behaved, failure means it reproduced the bug.
pub async fn try_repro(
    sandbox: &dyn Sandbox,
    repro: &CleanedRepro,
    fail_ref: &str,
    pass_ref: &str,
) -> TryOutcome {
    let run_at = |reference: &str| {
        let args = vec![reference.to_string(), repro.run_command.clone()];
        async move {
            sandbox
                .output("go-repro", &args, repro.source.as_bytes())
                .await
                .is_ok()
        }
    };

    let fail_passes = run_at(fail_ref).await;
    let pass_passes = run_at(pass_ref).await;

    match (fail_passes, pass_passes) {
        (false, true) => TryOutcome::Confirmed {
            fail_ref: fail_ref.to_string(),
            pass_ref: pass_ref.to_string(),
        },
        // Inverted guess: swap the refs.
        (true, false) => TryOutcome::Confirmed {
            fail_ref: pass_ref.to_string(),
            pass_ref: fail_ref.to_string(),
        },
        (true, true) | (false, false) => TryOutcome::NotConfirmed,
    }
}

// ---------------------------------------------------------------------------
// The processor

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Extraction {
    repro: String,
    fail_release: String,
    pass_release: String,
}

fn extraction_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "Repro": { "type": "string" },
            "FailRelease": { "type": "string" },
            "PassRelease": { "type": "string" },
        },
        "required": ["Repro", "FailRelease", "PassRelease"],
    })
}

fn extraction_prompt(issue: &Issue) -> String {
    format!(
        "Extract from this bug report a minimal single-file Go program that \
         demonstrates the bug, plus the release the reporter says fails and \
         the release they say works.\n\
         Reply with JSON {{\"Repro\": ..., \"FailRelease\": ..., \
         \"PassRelease\": ...}}; use empty strings for anything the report \
         does not say.\n\n\
         Issue title: {}\nIssue body:\n{}\n",
        issue.title,
        issue.body(),
    )
}

/// The program to try: the extraction when it has one (unfencing any
/// Markdown the model returned verbatim), otherwise the first Go code
/// block of the issue body.
fn repro_source(extraction: &Extraction, issue: &Issue) -> Option<String> {
    if extraction.repro.trim().is_empty() {
        let blocks = parse_blocks(issue.body());
        return go_code_blocks(&blocks).first().map(|block| block.to_string());
    }
    let blocks = parse_blocks(&extraction.repro);
    let fenced = go_code_blocks(&blocks);
    if fenced.is_empty() {
        Some(extraction.repro.clone())
    } else {
        Some(fenced.join("\n\n"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BisectAction {
    pub project: Project,
    pub issue: u64,
    pub repro: CleanedRepro,
    pub fail_ref: String,
    pub pass_ref: String,
}

pub struct Repro {
    config: ProcessorConfig,
    watcher: EventWatcher,
    sandbox: Arc<dyn Sandbox>,
}

impl Repro {
    pub async fn new(
        db: &Database,
        config: ProcessorConfig,
        sandbox: Arc<dyn Sandbox>,
    ) -> ProcessorResult<Self> {
        let watcher = EventWatcher::github(db, &config.name).await?;
        Ok(Self {
            config,
            watcher,
            sandbox,
        })
    }

    pub async fn run(
        &mut self,
        db: &Database,
        actions: &ActionLog,
        llm: &dyn Generator,
    ) -> ProcessorResult<usize> {
        let now = Timestamp::now();
        let events = self.watcher.recent(db).await?;
        let mut registered = 0;

        for event in &events {
            let Typed::Issue(issue) = &event.typed else {
                continue;
            };
            if !self.config.project_enabled(&event.project) {
                continue;
            }
            if !issue.is_open() {
                continue;
            }
            if let Some(reason) = self.config.skip_issue(issue, now) {
                debug!(target: LOG_TARGET, project = %event.project, issue = issue.number, reason, "Repro skipping issue");
                continue;
            }

            let key = issue_action_key(&event.project, issue.number);
            if actions.get(ACTION_KIND, &key).await?.is_some() {
                self.advance(db, event.db_time).await?;
                continue;
            }

            // Bugs only.
            let kind = match read_categories(db, &event.project, issue.number)
                .await?
                .and_then(|categories| categories.into_iter().next())
            {
                Some(kind) => kind,
                None => match classify(llm, issue).await {
                    Ok(classification) => classification.category_name,
                    Err(err @ AiError::BadJson { .. }) => {
                        warn!(target: LOG_TARGET, project = %event.project, issue = issue.number, err = %err.fmt_compact(), "Repro got unusable classification");
                        self.advance(db, event.db_time).await?;
                        continue;
                    }
                    Err(err) => {
                        warn!(target: LOG_TARGET, project = %event.project, issue = issue.number, err = %err.fmt_compact(), "Repro backend failure");
                        continue;
                    }
                },
            };
            if kind != "bug" {
                self.advance(db, event.db_time).await?;
                continue;
            }

            let extraction: Extraction =
                match generate_json(llm, &extraction_prompt(issue), &extraction_schema()).await {
                    Ok(extraction) => extraction,
                    Err(err @ AiError::BadJson { .. }) => {
                        warn!(target: LOG_TARGET, project = %event.project, issue = issue.number, err = %err.fmt_compact(), "Repro extraction unusable");
                        self.advance(db, event.db_time).await?;
                        continue;
                    }
                    Err(err) => {
                        warn!(target: LOG_TARGET, project = %event.project, issue = issue.number, err = %err.fmt_compact(), "Repro backend failure");
                        continue;
                    }
                };
            let Some(source) = repro_source(&extraction, issue) else {
                debug!(target: LOG_TARGET, project = %event.project, issue = issue.number, "No repro in issue");
                self.advance(db, event.db_time).await?;
                continue;
            };

            let repro = clean_repro(&source, Some(self.sandbox.as_ref())).await;
            let (fail_ref, pass_ref) =
                clean_versions(&extraction.fail_release, &extraction.pass_release);

            let outcome = try_repro(self.sandbox.as_ref(), &repro, &fail_ref, &pass_ref).await;
            let TryOutcome::Confirmed { fail_ref, pass_ref } = outcome else {
                info!(target: LOG_TARGET, project = %event.project, issue = issue.number, "Repro did not confirm, skipping");
                self.advance(db, event.db_time).await?;
                continue;
            };

            info!(
                target: LOG_TARGET,
                project = %event.project,
                issue = issue.number,
                %fail_ref,
                %pass_ref,
                enabled = self.config.enabled,
                "Repro confirmed, queueing bisection"
            );
            if !self.config.enabled {
                continue;
            }

            let action = BisectAction {
                project: event.project.clone(),
                issue: issue.number,
                repro,
                fail_ref,
                pass_ref,
            };
            actions
                .before(
                    ACTION_KIND,
                    &key,
                    serde_json::to_vec(&action).expect("action payload serializes"),
                    self.config.require_approval,
                )
                .await?;
            registered += 1;
            self.advance(db, event.db_time).await?;
        }

        Ok(registered)
    }

    async fn advance(&mut self, db: &Database, t: oscar_core::DbTime) -> ProcessorResult<()> {
        if self.config.enabled {
            self.watcher.mark_old(t);
            self.watcher.flush(db).await?;
        }
        Ok(())
    }
}

/// Starts bisections against the external bisection service. The service
/// works asynchronously; its verdict reaches the tracker on its own path.
#[async_trait]
pub trait BisectionClient: Send + Sync {
    /// Start a bisection, returning its id.
    async fn start(&self, action: &BisectAction) -> Result<String, BoxedError>;
}

pub struct BisectActioner {
    client: Arc<dyn BisectionClient>,
}

impl BisectActioner {
    pub fn new(client: Arc<dyn BisectionClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Actioner for BisectActioner {
    async fn run(&self, payload: &[u8]) -> Result<Vec<u8>, BoxedError> {
        let action: BisectAction = serde_json::from_slice(payload)?;
        let id = self.client.start(&action).await?;
        info!(target: LOG_TARGET, project = %action.project, issue = action.issue, bisection = %id, "Started bisection");
        Ok(id.into_bytes())
    }

    fn for_display(&self, payload: &[u8]) -> String {
        match serde_json::from_slice::<BisectAction>(payload) {
            Ok(action) => format!(
                "bisect {}#{} between {} and {}",
                action.project, action.issue, action.pass_ref, action.fail_ref
            ),
            Err(_) => "repro.Bisect (unreadable payload)".to_string(),
        }
    }
}
