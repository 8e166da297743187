//! # pgsync
//!
//! Sync data from one PostgreSQL database to another.
//!
//! This library provides:
//!
//! - **Table resolution** from groups, wildcards and SQL templates
//! - **Streaming transfers** using the PostgreSQL COPY protocol
//! - **Strategies** for full replace, reconcile (upsert or preserve) and
//!   batched, resumable copies
//! - **Data rules** to anonymize columns while they are copied
//! - **Parallel runs** with a worker pool, fail-fast and constraint deferral
//!
//! ## Example
//!
//! ```rust,no_run
//! use pgsync::{Config, Orchestrator, ResolveOptions, SyncOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> pgsync::Result<()> {
//!     let config = Config::load(".pgsync.yml")?;
//!     let sync = Orchestrator::new(config, ResolveOptions::default(), SyncOptions::default());
//!     let summary = sync.run(CancellationToken::new()).await?;
//!     println!("Synced {} tables", summary.tables_success);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod data_source;
pub mod error;
pub mod orchestrator;
pub mod resolver;
pub mod rules;
pub mod task;

// Re-exports for convenient access
pub use config::{Config, ConstraintMode, GroupEntry, ResolveOptions, SyncOptions};
pub use crate::core::{Column, Sequence, Table};
pub use data_source::{DataSource, Endpoint, SslMode};
pub use error::{ErrorCategory, Result, SyncError};
pub use orchestrator::{Orchestrator, SyncSummary, WorkerPool};
pub use resolver::{Resolution, ResolvedTask, ResolverContext, TaskResolver};
pub use rules::{DataRule, DataRules};
pub use task::{Strategy, Task, TaskResult, TaskStatus};
