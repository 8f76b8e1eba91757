//! Wiring: one [`App`] owns the store, the ingestors, the processors and
//! the action log, and drives them through batch cycles.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use oscar_actions::ActionLog;
use oscar_ai::docs::{DocsSync, VectorSync};
use oscar_ai::{AiResult, Generator, HashEmbedder, MemoryVectorDb};
use oscar_core::Project;
use oscar_core::error::{BoxedError, FmtCompact as _};
use oscar_db::Database;
use oscar_github::webhook::Secrets;
use oscar_github::{
    Client, DiscussionsIngestor, GithubSource, IssuesIngestor, WebhookEvent, WebhookRequest,
    validate_webhook,
};
use oscar_processors::repro::{BisectAction, BisectionClient, Sandbox};
use oscar_processors::{ProcessorConfig, labels, overview, related, repro, rules};
use snafu::{ResultExt as _, Snafu};
use tracing::{error, info, warn};

pub const LOG_TARGET: &str = "oscar::bot";

#[derive(Debug, Snafu)]
pub enum BotError {
    #[snafu(display("Database error: {source}"))]
    Database { source: oscar_db::DbError },
    #[snafu(display("Processor setup error: {source}"))]
    Processor {
        source: oscar_processors::ProcessorError,
    },
    #[snafu(display("Action log error: {source}"))]
    Actions {
        source: oscar_actions::ActionError,
    },
    #[snafu(display("Webhook rejected: {source}"))]
    Webhook {
        source: oscar_github::WebhookError,
    },
    #[snafu(display("Logging initialization failed"))]
    Logging,
    #[snafu(display("At least one --project is required"))]
    NoProjects,
}

pub type BotResult<T> = std::result::Result<T, BotError>;

/// Everything a deployment can vary, resolved from the command line.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: Option<PathBuf>,
    pub projects: Vec<Project>,
    pub github_token: Option<String>,
    pub divert: bool,
    pub bot_name: String,
    pub require_approval: bool,
    pub skip_authors: BTreeSet<String>,
    pub enable_labels: bool,
    pub enable_overview: bool,
    pub enable_related: bool,
    pub enable_rules: bool,
    pub enable_repro: bool,
}

/// The backend seams a deployment fills in. The defaults run the whole
/// pipeline in-process with no external services.
pub struct Backends {
    pub llm: Arc<dyn Generator>,
    pub sandbox: Arc<dyn Sandbox>,
    pub bisection: Arc<dyn BisectionClient>,
}

impl Default for Backends {
    fn default() -> Self {
        Self {
            llm: Arc::new(UnconfiguredGenerator),
            sandbox: Arc::new(UnconfiguredSandbox),
            bisection: Arc::new(UnconfiguredBisection),
        }
    }
}

/// Stand-in backends that always fail. Processors treat those failures as
/// transient, so a deployment that later plugs in real backends picks up
/// exactly where the log left off.
struct UnconfiguredGenerator;

#[async_trait]
impl Generator for UnconfiguredGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _schema: Option<&serde_json::Value>,
    ) -> AiResult<String> {
        Err(oscar_ai::AiError::Backend {
            source: "no LLM backend configured".into(),
        })
    }
}

struct UnconfiguredSandbox;

#[async_trait]
impl Sandbox for UnconfiguredSandbox {
    async fn output(
        &self,
        _path: &str,
        _args: &[String],
        _stdin: &[u8],
    ) -> Result<Vec<u8>, BoxedError> {
        Err("no sandbox configured".into())
    }
}

struct UnconfiguredBisection;

#[async_trait]
impl BisectionClient for UnconfiguredBisection {
    async fn start(&self, _action: &BisectAction) -> Result<String, BoxedError> {
        Err("no bisection backend configured".into())
    }
}

pub struct App {
    pub db: Arc<Database>,
    pub actions: Arc<ActionLog>,
    pub source: Arc<GithubSource>,
    pub secrets: Secrets,
    issues: IssuesIngestor,
    discussions: DiscussionsIngestor,
    docs_sync: DocsSync,
    vector_sync: VectorSync,
    embedder: HashEmbedder,
    vector_db: Arc<MemoryVectorDb>,
    llm: Arc<dyn Generator>,
    labeler: labels::Labeler,
    overview: overview::Overview,
    related: related::Related,
    rules: rules::Rules,
    repro: repro::Repro,
}

impl App {
    pub async fn build(config: AppConfig, backends: Backends) -> BotResult<Self> {
        if config.projects.is_empty() {
            return NoProjectsSnafu.fail();
        }

        let db = Arc::new(match &config.data_dir {
            Some(data_dir) => Database::open(data_dir.join("oscar.redb"))
                .await
                .context(DatabaseSnafu)?,
            None => Database::new_in_memory().await.context(DatabaseSnafu)?,
        });
        oscar_github::store::init_tables(&db)
            .await
            .context(DatabaseSnafu)?;
        oscar_ai::docs::init_tables(&db)
            .await
            .context(DatabaseSnafu)?;

        let client = Client::new(config.github_token.clone());
        let source = Arc::new(GithubSource::new(client.clone(), config.divert));
        let shared_client = Arc::new(client);

        let mut issues = IssuesIngestor::new(shared_client.clone());
        let mut discussions = DiscussionsIngestor::new(shared_client);
        for project in &config.projects {
            issues.add(project.clone());
            discussions.add(project.clone());
        }

        let actions = Arc::new(ActionLog::new(db.clone()).await.context(DatabaseSnafu)?);
        actions.register(
            labels::ACTION_KIND,
            Arc::new(labels::LabelerActioner::new(source.clone())),
        );
        actions.register(
            overview::ACTION_KIND,
            Arc::new(overview::OverviewActioner::new(
                db.clone(),
                source.clone(),
                config.bot_name.clone(),
                "overview",
            )),
        );
        actions.register(
            related::ACTION_KIND,
            Arc::new(related::RelatedActioner::new(source.clone())),
        );
        actions.register(
            rules::ACTION_KIND,
            Arc::new(rules::RulesActioner::new(source.clone())),
        );
        actions.register(
            repro::ACTION_KIND,
            Arc::new(repro::BisectActioner::new(backends.bisection)),
        );

        let processor_config = |name: &str, enabled: bool| {
            let mut processor_config = ProcessorConfig::new(name).enabled(enabled);
            processor_config.projects = config.projects.iter().cloned().collect();
            processor_config.require_approval = config.require_approval;
            processor_config.skip_authors = config.skip_authors.clone();
            processor_config
        };

        let labeler = labels::Labeler::new(&db, processor_config("labels", config.enable_labels))
            .await
            .context(ProcessorSnafu)?;
        let overview = overview::Overview::new(
            &db,
            processor_config("overview", config.enable_overview),
            config.bot_name.clone(),
        )
        .await
        .context(ProcessorSnafu)?;
        let related =
            related::Related::new(&db, processor_config("related", config.enable_related))
                .await
                .context(ProcessorSnafu)?;
        let rules = rules::Rules::new(&db, processor_config("rules", config.enable_rules))
            .await
            .context(ProcessorSnafu)?;
        let repro = repro::Repro::new(
            &db,
            processor_config("repro", config.enable_repro),
            backends.sandbox,
        )
        .await
        .context(ProcessorSnafu)?;

        let docs_sync = DocsSync::new(&db).await.context(DatabaseSnafu)?;
        let vector_sync = VectorSync::new(&db).await.context(DatabaseSnafu)?;

        Ok(Self {
            db,
            actions,
            source,
            secrets: Secrets::new(),
            issues,
            discussions,
            docs_sync,
            vector_sync,
            embedder: HashEmbedder::default(),
            vector_db: Arc::new(MemoryVectorDb::new()),
            llm: backends.llm,
            labeler,
            overview,
            related,
            rules,
            repro,
        })
    }

    /// Mirror upstream activity into the local store.
    pub async fn sync(&mut self) {
        if let Err(err) = self.issues.sync(&self.db).await {
            error!(target: LOG_TARGET, err = %err.fmt_compact(), "Issue sync failed");
        }
        if let Err(err) = self.discussions.sync(&self.db).await {
            error!(target: LOG_TARGET, err = %err.fmt_compact(), "Discussion sync failed");
        }
    }

    /// One full batch cycle: ingest, derive, propose, execute. Stage
    /// failures are logged and the cycle moves on; everything here resumes
    /// from durable cursors next time.
    pub async fn cycle(&mut self) {
        info!(target: LOG_TARGET, "Starting cycle");
        self.sync().await;

        match self.docs_sync.sync(&self.db).await {
            Ok(written) => info!(target: LOG_TARGET, written, "Corpus synced"),
            Err(err) => error!(target: LOG_TARGET, err = %err.fmt_compact(), "Corpus sync failed"),
        }
        match self
            .vector_sync
            .sync(&self.db, &self.embedder, self.vector_db.as_ref())
            .await
        {
            Ok(written) => info!(target: LOG_TARGET, written, "Vector index synced"),
            Err(err) => error!(target: LOG_TARGET, err = %err.fmt_compact(), "Vector sync failed"),
        }

        match self
            .labeler
            .run(&self.db, &self.actions, self.llm.as_ref())
            .await
        {
            Ok(registered) => info!(target: LOG_TARGET, registered, "Labeler ran"),
            Err(err) => error!(target: LOG_TARGET, err = %err.fmt_compact(), "Labeler failed"),
        }
        match self
            .overview
            .run(&self.db, &self.actions, self.llm.as_ref())
            .await
        {
            Ok(registered) => info!(target: LOG_TARGET, registered, "Overview ran"),
            Err(err) => error!(target: LOG_TARGET, err = %err.fmt_compact(), "Overview failed"),
        }
        match self
            .related
            .run(
                &self.db,
                &self.actions,
                &self.embedder,
                self.vector_db.as_ref(),
            )
            .await
        {
            Ok(registered) => info!(target: LOG_TARGET, registered, "Related ran"),
            Err(err) => error!(target: LOG_TARGET, err = %err.fmt_compact(), "Related failed"),
        }
        match self
            .rules
            .run(&self.db, &self.actions, self.llm.as_ref())
            .await
        {
            Ok(registered) => info!(target: LOG_TARGET, registered, "Rules ran"),
            Err(err) => error!(target: LOG_TARGET, err = %err.fmt_compact(), "Rules failed"),
        }
        match self
            .repro
            .run(&self.db, &self.actions, self.llm.as_ref())
            .await
        {
            Ok(registered) => info!(target: LOG_TARGET, registered, "Repro ran"),
            Err(err) => error!(target: LOG_TARGET, err = %err.fmt_compact(), "Repro failed"),
        }

        match self.actions.run().await {
            Ok(executed) => info!(target: LOG_TARGET, executed, "Actions executed"),
            Err(err) => error!(target: LOG_TARGET, err = %err.fmt_compact(), "Action execution failed"),
        }
        info!(target: LOG_TARGET, "Cycle complete");
    }

    /// Webhook ingress: validate the delivery and, when it names tracker
    /// activity, synchronously re-sync that project.
    pub async fn handle_webhook(
        &mut self,
        request: &WebhookRequest<'_>,
        project: &Project,
    ) -> BotResult<WebhookEvent> {
        let event = validate_webhook(request, project, &self.secrets).context(WebhookSnafu)?;
        match &event {
            WebhookEvent::Issues(_) | WebhookEvent::IssueComment(_) => {
                if let Err(err) = self.issues.sync_project(&self.db, project).await {
                    warn!(target: LOG_TARGET, %project, err = %err.fmt_compact(), "Webhook-triggered sync failed");
                }
            }
            WebhookEvent::Discussion(_) => {
                if let Err(err) = self.discussions.sync_project(&self.db, project).await {
                    warn!(target: LOG_TARGET, %project, err = %err.fmt_compact(), "Webhook-triggered sync failed");
                }
            }
            WebhookEvent::Other { event_type, .. } => {
                info!(target: LOG_TARGET, %project, event_type, "Ignoring webhook event type");
            }
        }
        Ok(event)
    }
}
