//! pgsync CLI - sync data from one PostgreSQL database to another.

use clap::Parser;
use pgsync::config::split_list;
use pgsync::{Config, Orchestrator, ResolveOptions, SyncError, SyncOptions};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "pgsync")]
#[command(about = "Sync data from one PostgreSQL database to another")]
#[command(version)]
struct Cli {
    /// Tables or groups to sync (comma separated), then an optional SQL filter
    #[arg(value_name = "TABLES_OR_GROUPS")]
    args: Vec<String>,

    /// Source database URL
    #[arg(long)]
    from: Option<String>,

    /// Destination database URL
    #[arg(long)]
    to: Option<String>,

    /// Path to YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use .pgsync-<DB>.yml
    #[arg(short, long)]
    db: Option<String>,

    /// Tables to sync
    #[arg(short, long)]
    tables: Option<String>,

    /// Groups to sync
    #[arg(short, long)]
    groups: Option<String>,

    /// Tables to exclude
    #[arg(long)]
    exclude: Option<String>,

    /// Schemas to sync
    #[arg(long)]
    schemas: Option<String>,

    /// Sync tables in all schemas
    #[arg(long)]
    all_schemas: bool,

    /// Accept a destination that is not localhost
    #[arg(long)]
    to_safe: bool,

    /// List tables (or `groups`) instead of syncing
    #[arg(long)]
    list: bool,

    /// Overwrite existing rows
    #[arg(long)]
    overwrite: bool,

    /// Preserve existing rows
    #[arg(long)]
    preserve: bool,

    /// Truncate existing rows
    #[arg(long)]
    truncate: bool,

    /// Delete rows instead of truncating, in a transaction
    #[arg(long)]
    delete: bool,

    /// Sync in batches, resuming after the destination's highest key
    #[arg(long)]
    in_batches: bool,

    /// Rows per batch
    #[arg(long, default_value = "10000")]
    batch_size: u64,

    /// Seconds to sleep between batches
    #[arg(long, default_value = "0")]
    sleep: f64,

    /// Limit transfer rate in bytes per second
    #[arg(long, value_name = "BYTES")]
    throttle: Option<u64>,

    /// Do not apply data rules
    #[arg(long)]
    no_rules: bool,

    /// Do not sync sequences
    #[arg(long)]
    no_sequences: bool,

    /// Stage rows in a regular table instead of a temporary one
    #[arg(long)]
    no_temp_table: bool,

    /// Only sync rows updated in the last N seconds
    #[arg(long, value_name = "SECONDS")]
    incremental: Option<u64>,

    /// Disable foreign key triggers
    #[arg(long)]
    disable_integrity: bool,

    /// Disable foreign key triggers using replication role
    #[arg(long)]
    disable_integrity_v2: bool,

    /// Disable user triggers
    #[arg(long)]
    disable_user_triggers: bool,

    /// Defer constraints
    #[arg(long)]
    defer_constraints: bool,

    /// Defer constraints, making non-deferrable foreign keys deferrable for the run
    #[arg(long)]
    defer_constraints_v2: bool,

    /// Template variable for group SQL, as name=value
    #[arg(long = "var", value_name = "NAME=VALUE")]
    variables: Vec<String>,

    /// Number of tables to sync at a time
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Stop on the first failed table
    #[arg(long)]
    fail_fast: bool,

    /// Show SQL statements
    #[arg(long)]
    debug: bool,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,
}

impl Cli {
    fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            overwrite: self.overwrite,
            preserve: self.preserve,
            truncate: self.truncate,
            delete: self.delete,
            in_batches: self.in_batches,
            batch_size: self.batch_size,
            sleep: self.sleep,
            throttle_bytes_per_second: self.throttle,
            no_rules: self.no_rules,
            no_sequences: self.no_sequences,
            no_temp_table: self.no_temp_table,
            incremental: self.incremental,
            disable_integrity: self.disable_integrity,
            disable_integrity_v2: self.disable_integrity_v2,
            disable_user_triggers: self.disable_user_triggers,
            defer_constraints: self.defer_constraints,
            defer_constraints_v2: self.defer_constraints_v2,
            jobs: self.jobs,
            fail_fast: self.fail_fast,
            debug: self.debug,
        }
    }

    fn resolve_options(&self) -> Result<ResolveOptions, SyncError> {
        let list = |value: &Option<String>| value.as_deref().map(split_list).unwrap_or_default();
        Ok(ResolveOptions {
            args: self.args.clone(),
            tables: list(&self.tables),
            groups: list(&self.groups),
            exclude: list(&self.exclude),
            schemas: self.schemas.as_deref().map(split_list),
            all_schemas: self.all_schemas,
            variables: parse_variables(&self.variables)?,
        })
    }

    fn lists_groups(&self) -> bool {
        self.list && self.args.first().map(String::as_str) == Some("groups")
    }
}

fn parse_variables(values: &[String]) -> Result<BTreeMap<String, String>, SyncError> {
    values
        .iter()
        .map(|value| match value.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
            _ => Err(SyncError::Config(format!(
                "Invalid variable: {} (expected name=value)",
                value
            ))),
        })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), SyncError> {
    let cli = Cli::parse();

    let verbosity = if cli.debug { "debug" } else { cli.verbosity.as_str() };
    setup_logging(verbosity, &cli.log_format);

    let cwd = std::env::current_dir()?;
    let (path, mut config) = Config::discover(cli.config.as_deref(), cli.db.as_deref(), &cwd)?;
    match &path {
        Some(path) => debug!("Loaded configuration from {}", path.display()),
        None => debug!("No config file found"),
    }
    config.to_safe |= cli.to_safe;

    if cli.lists_groups() {
        for name in config.group_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let orchestrator = Orchestrator::new(config, cli.resolve_options()?, cli.sync_options())
        .with_from(cli.from.clone())
        .with_to(cli.to.clone());

    if cli.list {
        for name in orchestrator.list().await? {
            println!("{}", name);
        }
        return Ok(());
    }

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler();

    let summary = orchestrator.execute(cancel_token).await?;
    if cli.output_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    summary.check()
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.without_time().init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM. Tasks already running
/// finish; no new ones start.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [(SignalKind::interrupt(), "SIGINT"), (SignalKind::terminate(), "SIGTERM")] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("\nReceived {}. Finishing running tables...", name);
                    token.cancel();
                });
            }
            Err(e) => warn!("Could not install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing running tables...");
            token.cancel();
        }
    });

    cancel_token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variables() {
        let vars = parse_variables(&["id=1".into(), "name=a=b".into()]).unwrap();
        assert_eq!(vars["id"], "1");
        assert_eq!(vars["name"], "a=b");
        assert!(parse_variables(&["nope".into()]).is_err());
        assert!(parse_variables(&["=1".into()]).is_err());
    }

    #[test]
    fn test_options_from_flags() {
        let cli = Cli::parse_from([
            "pgsync",
            "users,posts",
            "WHERE id > 1",
            "--exclude",
            "logs",
            "--preserve",
            "--jobs",
            "2",
        ]);
        let resolve = cli.resolve_options().unwrap();
        assert_eq!(resolve.args, ["users,posts", "WHERE id > 1"]);
        assert_eq!(resolve.exclude, ["logs"]);
        assert!(resolve.schemas.is_none());

        let opts = cli.sync_options();
        assert!(opts.preserve);
        assert_eq!(opts.jobs, Some(2));
        assert_eq!(opts.batch_size, 10_000);
    }

    #[test]
    fn test_list_groups() {
        assert!(Cli::parse_from(["pgsync", "groups", "--list"]).lists_groups());
        assert!(!Cli::parse_from(["pgsync", "--list"]).lists_groups());
    }
}
