//! Sync orchestrator - main workflow coordinator.

pub mod constraints;
pub mod pool;

pub use pool::WorkerPool;

use crate::config::{Config, ResolveOptions, SyncOptions};
use crate::data_source::{resolve_url, DataSource};
use crate::error::{Result, SyncError};
use crate::resolver::{display_name, ResolverContext, TaskResolver};
use crate::task::{Task, TaskResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Oldest server supporting `INSERT ... ON CONFLICT`.
const MIN_UPSERT_VERSION: i32 = 90500;

/// Sync orchestrator.
pub struct Orchestrator {
    config: Config,
    resolve: ResolveOptions,
    opts: SyncOptions,
    from: Option<String>,
    to: Option<String>,
}

/// Result of a sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    /// Unique run identifier.
    pub run_id: String,

    /// `completed`, `failed` or `cancelled`.
    pub status: String,

    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    pub tables_total: usize,
    pub tables_success: usize,
    pub tables_failed: usize,

    /// Display names of failed tables, in task order.
    pub failed_tables: Vec<String>,

    pub results: Vec<TaskResult>,

    /// Server notices from every task.
    pub notices: Vec<String>,
}

impl SyncSummary {
    /// The run outcome as an error when any table failed or the run was cancelled.
    pub fn check(&self) -> Result<()> {
        if !self.failed_tables.is_empty() {
            return Err(SyncError::SyncFailed(self.failed_tables.clone()));
        }
        if self.status == "cancelled" {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

impl Orchestrator {
    pub fn new(config: Config, mut resolve: ResolveOptions, opts: SyncOptions) -> Self {
        resolve.merge_config(&config);
        Self {
            config,
            resolve,
            opts,
            from: None,
            to: None,
        }
    }

    /// Source URL from the command line; takes precedence over the config file.
    pub fn with_from(mut self, url: Option<String>) -> Self {
        self.from = url;
        self
    }

    /// Destination URL from the command line.
    pub fn with_to(mut self, url: Option<String>) -> Self {
        self.to = url;
        self
    }

    pub fn options(&self) -> &SyncOptions {
        &self.opts
    }

    /// Command-line URLs are used as given; config URLs may run `$(...)` commands.
    fn url(&self, explicit: &Option<String>, configured: &Option<String>) -> Result<Option<String>> {
        match (explicit, configured) {
            (Some(url), _) => Ok(Some(url.clone())),
            (None, Some(url)) => resolve_url(url).map(Some),
            (None, None) => Ok(None),
        }
    }

    /// Build both data sources and refuse unsafe destinations.
    pub fn data_sources(&self) -> Result<(DataSource, DataSource)> {
        let from = self
            .url(&self.from, &self.config.from)?
            .ok_or_else(|| SyncError::Config("No source".into()))?;
        let to = self
            .url(&self.to, &self.config.to)?
            .ok_or_else(|| SyncError::Config("No destination".into()))?;

        let source = DataSource::new("source", &from)?;
        let destination = DataSource::new("destination", &to)?;

        if !self.config.to_safe && !destination.endpoint().is_local() {
            return Err(SyncError::Config(
                "Danger! Add `to_safe: true` to `.pgsync.yml` if the destination is not localhost or 127.0.0.1"
                    .into(),
            ));
        }
        Ok((source, destination))
    }

    /// Checks that need no database.
    fn check_options(&self) -> Result<()> {
        self.opts.validate()?;
        if !self.opts.no_rules {
            let unknown = self.config.data_rules.unknown();
            if !unknown.is_empty() {
                return Err(SyncError::Config(format!(
                    "Unknown data rules: {}",
                    unknown.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Connect, check the server and resolve the tables to sync.
    async fn plan(&self, source: &mut DataSource, destination: &mut DataSource) -> Result<Vec<Task>> {
        source.connect().await?;
        destination.connect().await?;
        info!("From: {}", source.endpoint().describe());
        info!("To: {}", destination.endpoint().describe());

        if (self.opts.preserve || self.opts.overwrite)
            && destination.server_version_num().await? < MIN_UPSERT_VERSION
        {
            return Err(SyncError::Config(
                "Postgres 9.5+ is required for --preserve and --overwrite".into(),
            ));
        }

        let ctx = ResolverContext {
            source_tables: source.tables().await?,
            search_path: source.search_path().await?,
            destination_tables: Some(destination.tables().await?),
        };
        let resolution = TaskResolver::new(&self.resolve, &self.config.groups, &ctx).resolve()?;
        for note in &resolution.notes {
            warn!("{}", note);
        }

        if self.opts.in_batches && resolution.tasks.len() > 1 {
            return Err(SyncError::Config(
                "Cannot use --in-batches with multiple tables".into(),
            ));
        }

        for (data_source, description) in [(&mut *source, "source"), (&mut *destination, "destination")] {
            for task in &resolution.tasks {
                if !data_source.table_exists(&task.table).await? {
                    return Err(SyncError::Config(format!(
                        "Table not found in {}: {}",
                        description, task.table
                    )));
                }
            }
        }

        let first_schema = source.first_schema().await?;
        let opts = Arc::new(self.opts.clone());
        let rules = Arc::new(self.config.data_rules.clone());
        Ok(resolution
            .tasks
            .into_iter()
            .map(|resolved| {
                let name = display_name(&resolved.table, first_schema.as_deref());
                Task::new(resolved.table, name, resolved.sql, Arc::clone(&opts), Arc::clone(&rules))
            })
            .collect())
    }

    /// Display names of the tables a run would sync.
    pub async fn list(&self) -> Result<Vec<String>> {
        let (mut source, mut destination) = self.data_sources()?;
        let tasks = self.plan(&mut source, &mut destination).await?;
        Ok(tasks.into_iter().map(|task| task.display_name).collect())
    }

    /// Run the sync and fail if any table failed.
    pub async fn run(self, cancel: CancellationToken) -> Result<SyncSummary> {
        let summary = self.execute(cancel).await?;
        summary.check()?;
        Ok(summary)
    }

    /// Run the sync. Table failures are reported in the summary, not as an error.
    pub async fn execute(self, cancel: CancellationToken) -> Result<SyncSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        self.check_options()?;
        let (mut source, mut destination) = self.data_sources()?;
        let mut tasks = self.plan(&mut source, &mut destination).await?;

        for task in &mut tasks {
            task.prepare(&mut source, &mut destination).await?;
            for note in task.notes() {
                warn!("{}: {}", task.display_name, note);
            }
        }
        tasks.retain(|task| !task.shared_fields().is_empty());

        let tables: Vec<_> = tasks.iter().map(|task| task.table.clone()).collect();
        let pool = WorkerPool::new(&self.opts, cancel.child_token());

        let scope = constraints::open(
            self.opts.constraint_mode(),
            &mut source,
            &mut destination,
            &tables,
        )
        .await?;
        let outcome = pool.run(tasks, &mut source, &mut destination).await;
        let complete = outcome
            .as_ref()
            .is_ok_and(|results| all_synced(results, tables.len()));
        let results =
            constraints::close(&mut source, &mut destination, scope, outcome, complete).await?;

        source.close();
        destination.close();

        let summary = summarize(run_id, started_at, &tables, results, cancel.is_cancelled());
        for notice in &summary.notices {
            warn!("{}", notice);
        }
        info!(
            "Completed in {:.1}s ({} succeeded, {} failed)",
            started.elapsed().as_secs_f64(),
            summary.tables_success,
            summary.tables_failed
        );
        Ok(summary)
    }
}

/// Every table has a result and none failed.
fn all_synced(results: &[TaskResult], total: usize) -> bool {
    results.len() == total && results.iter().all(TaskResult::is_success)
}

fn summarize(
    run_id: String,
    started_at: DateTime<Utc>,
    tables: &[crate::core::Table],
    results: Vec<TaskResult>,
    cancelled: bool,
) -> SyncSummary {
    let completed_at = Utc::now();
    let failed_tables: Vec<String> = results
        .iter()
        .filter(|result| !result.is_success())
        .map(|result| result.table.clone())
        .collect();
    let notices = results
        .iter()
        .flat_map(|result| result.notices.iter().cloned())
        .collect();

    let status = if !failed_tables.is_empty() {
        "failed"
    } else if cancelled {
        "cancelled"
    } else {
        "completed"
    };

    SyncSummary {
        run_id,
        status: status.to_string(),
        started_at,
        completed_at,
        duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
        tables_total: tables.len(),
        tables_success: results.len() - failed_tables.len(),
        tables_failed: failed_tables.len(),
        failed_tables,
        results,
        notices,
    }
}
