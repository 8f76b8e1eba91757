use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;

use clap::Parser;
use oscar_bot::{App, AppConfig, Backends, BotError, BotResult, LOG_TARGET};
use oscar_core::Project;
use tokio::time::{Duration, interval};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Oscar: watches issue trackers and proposes edits back.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Data dir to store the database in; in-memory when omitted
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Projects to watch, owner/repo (can specify multiple)
    #[arg(long = "project", value_name = "OWNER/REPO")]
    pub projects: Vec<Project>,

    /// Tracker API token
    #[arg(long, env = "GITHUB_TOKEN")]
    pub github_token: Option<String>,

    /// Divert all outbound edits to an in-process log
    #[arg(long)]
    pub divert: bool,

    /// Bot account name, used in per-bot state keys
    #[arg(long, default_value = "oscar")]
    pub bot_name: String,

    /// Registered actions wait for manual approval
    #[arg(long)]
    pub require_approval: bool,

    /// Authors whose activity processors ignore (can specify multiple)
    #[arg(long = "skip-author", value_name = "LOGIN")]
    pub skip_authors: Vec<String>,

    /// Minutes between cycles in serve mode
    #[arg(long, default_value = "60")]
    pub cycle_interval_minutes: u64,

    /// Enable the label classifier (default: dry run)
    #[arg(long)]
    pub enable_labels: bool,

    /// Enable the overview generator (default: dry run)
    #[arg(long)]
    pub enable_overview: bool,

    /// Enable the related-content poster (default: dry run)
    #[arg(long)]
    pub enable_related: bool,

    /// Enable the rule checker (default: dry run)
    #[arg(long)]
    pub enable_rules: bool,

    /// Enable the repro extractor and bisector (default: dry run)
    #[arg(long)]
    pub enable_repro: bool,
}

#[derive(Debug, Parser)]
pub enum Command {
    /// Mirror upstream activity once and exit
    Sync,
    /// Run one full cycle (sync, processors, actions) and exit
    Run,
    /// Inspect and drive the action log
    Actions {
        #[command(subcommand)]
        actions_command: ActionsCommand,
    },
}

#[derive(Debug, Parser)]
pub enum ActionsCommand {
    /// List registered actions with their status
    List,
    /// Execute approved pending actions
    Run,
    /// Approve an action awaiting approval
    Approve { kind: String, key: String },
    /// Re-queue a completed (usually failed) action
    Rerun { kind: String, key: String },
}

impl Opts {
    fn app_config(&self) -> AppConfig {
        AppConfig {
            data_dir: self.data_dir.clone(),
            projects: self.projects.clone(),
            github_token: self.github_token.clone(),
            divert: self.divert,
            bot_name: self.bot_name.clone(),
            require_approval: self.require_approval,
            skip_authors: self.skip_authors.iter().cloned().collect::<BTreeSet<_>>(),
            enable_labels: self.enable_labels,
            enable_overview: self.enable_overview,
            enable_related: self.enable_related,
            enable_rules: self.enable_rules,
            enable_repro: self.enable_repro,
        }
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> BotResult<()> {
    init_logging()?;
    let opts = Opts::parse();

    let mut app = App::build(opts.app_config(), Backends::default()).await?;

    match opts.command {
        Some(Command::Sync) => {
            app.sync().await;
            Ok(())
        }
        Some(Command::Run) => {
            app.cycle().await;
            Ok(())
        }
        Some(Command::Actions { actions_command }) => {
            handle_actions_command(&app, actions_command).await
        }
        None => serve(&mut app, opts.cycle_interval_minutes).await,
    }
}

async fn handle_actions_command(app: &App, command: ActionsCommand) -> BotResult<()> {
    match command {
        ActionsCommand::List => {
            let lines = app
                .actions
                .list_display()
                .await
                .map_err(|source| BotError::Database { source })?;
            if lines.is_empty() {
                println!("No actions registered.");
            }
            for line in lines {
                println!("{line}");
            }
            Ok(())
        }
        ActionsCommand::Run => {
            let executed = app
                .actions
                .run()
                .await
                .map_err(|source| BotError::Database { source })?;
            println!("Executed {executed} action(s).");
            Ok(())
        }
        ActionsCommand::Approve { kind, key } => {
            app.actions
                .approve(&kind, key.as_bytes())
                .await
                .map_err(|source| BotError::Actions { source })?;
            println!("Approved {kind} {key}.");
            Ok(())
        }
        ActionsCommand::Rerun { kind, key } => {
            app.actions
                .rerun(&kind, key.as_bytes())
                .await
                .map_err(|source| BotError::Actions { source })?;
            println!("Re-queued {kind} {key}.");
            Ok(())
        }
    }
}

async fn serve(app: &mut App, cycle_interval_minutes: u64) -> BotResult<()> {
    info!(
        target: LOG_TARGET,
        cycle_interval_minutes,
        "Oscar is running. Press Ctrl+C to stop."
    );
    let mut ticker = interval(Duration::from_secs(cycle_interval_minutes * 60));
    loop {
        ticker.tick().await;
        app.cycle().await;
    }
}

fn init_logging() -> BotResult<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|_| BotError::Logging)?;

    Ok(())
}
