//! Run-wide transactions for the constraint-safety modes.

use crate::config::ConstraintMode;
use crate::core::{NonDeferrableConstraint, Table};
use crate::data_source::{DataSource, TransactionScope};
use crate::error::{Result, SyncError};
use tracing::{info, warn};

/// Consistent read-only snapshot of the source for the whole run.
const SNAPSHOT: &str = "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY";

/// Transactions and altered constraints held open for the run.
#[derive(Debug, Default)]
pub struct RunScope {
    source: Option<TransactionScope>,
    destination: Option<TransactionScope>,
    altered: Vec<NonDeferrableConstraint>,
}

/// Non-deferrable foreign keys on the given tables.
async fn blocking_constraints(
    destination: &mut DataSource,
    tables: &[Table],
) -> Result<Vec<NonDeferrableConstraint>> {
    let mut grouped = destination.non_deferrable_constraints().await?;
    Ok(tables
        .iter()
        .filter_map(|table| grouped.remove(table))
        .flatten()
        .collect())
}

/// Open whatever the mode needs before the first task runs.
pub async fn open(
    mode: ConstraintMode,
    source: &mut DataSource,
    destination: &mut DataSource,
    tables: &[Table],
) -> Result<RunScope> {
    let mut scope = RunScope::default();

    match mode {
        ConstraintMode::None => return Ok(scope),
        ConstraintMode::DisableIntegrity => {}
        ConstraintMode::Defer => {
            let constraints = blocking_constraints(destination, tables).await?;
            if !constraints.is_empty() {
                let names: Vec<String> = constraints.iter().map(|c| c.to_string()).collect();
                return Err(SyncError::Precondition(format!(
                    "Non-deferrable constraints: {}",
                    names.join(", ")
                )));
            }
        }
        ConstraintMode::DeferV2 => {
            for constraint in blocking_constraints(destination, tables).await? {
                info!("Making {} deferrable for this run", constraint);
                if let Err(e) = destination.set_deferrable(&constraint, true).await {
                    restore(destination, &scope.altered).await;
                    return Err(e);
                }
                scope.altered.push(constraint);
            }
        }
    }

    if matches!(mode, ConstraintMode::Defer | ConstraintMode::DeferV2) {
        let result: Result<TransactionScope> = async {
            let opened = destination.begin().await?;
            destination.execute("SET CONSTRAINTS ALL DEFERRED").await?;
            Ok(opened)
        }
        .await;
        match result {
            Ok(opened) => scope.destination = Some(opened),
            Err(e) => {
                // dropping the connection discards a half-open transaction
                destination.close();
                restore(destination, &scope.altered).await;
                return Err(e);
            }
        }
    }

    match source.begin_with(SNAPSHOT).await {
        Ok(opened) => scope.source = Some(opened),
        Err(e) => return close(source, destination, scope, Err(e), false).await,
    }
    Ok(scope)
}

/// End the run and always restore altered constraints.
///
/// The destination transaction commits only when `result` is `Ok` and
/// `complete` is set. A run where any table failed or was never attempted
/// rolls back as a whole, while `result` still passes through.
pub async fn close<T>(
    source: &mut DataSource,
    destination: &mut DataSource,
    scope: RunScope,
    result: Result<T>,
    complete: bool,
) -> Result<T> {
    let RunScope {
        source: source_scope,
        destination: destination_scope,
        altered,
    } = scope;

    if let Some(opened) = source_scope {
        // read-only; its outcome never decides the run
        if let Err(e) = source.commit(opened).await {
            warn!("{}: closing snapshot failed: {}", source.label(), e);
        }
    }

    let result = match destination_scope {
        Some(opened) if result.is_ok() && !complete => {
            warn!("Not every table synced. Rolling back all tables");
            destination.rollback(opened).await.and(result)
        }
        Some(opened) => destination.finish(opened, result).await,
        None => result,
    };

    restore(destination, &altered).await;
    result
}

async fn restore(destination: &mut DataSource, altered: &[NonDeferrableConstraint]) {
    for constraint in altered {
        if let Err(e) = destination.set_deferrable(constraint, false).await {
            warn!("Could not restore NOT DEFERRABLE on {}: {}", constraint, e);
        }
    }
}
