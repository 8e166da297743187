//! Trigger management around a table's transfer.
//!
//! Runs inside a destination transaction so that anything disabled here is
//! restored by commit or undone by rollback.

use crate::config::SyncOptions;
use crate::core::identifier::{quote_ident, quote_table};
use crate::core::{Table, Trigger};
use crate::data_source::{DataSource, TransactionScope};
use crate::error::Result;
use tracing::debug;

/// What to change before the transfer and what to restore after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerPlan {
    /// `SET LOCAL session_replication_role = replica`.
    pub replica_role: bool,
    /// Integrity triggers disabled one by one.
    pub disable: Vec<String>,
    /// `DISABLE TRIGGER USER`.
    pub disable_user: bool,
    /// Triggers that were enabled and get re-enabled afterwards.
    pub restore: Vec<String>,
}

impl TriggerPlan {
    /// Plan from the current triggers. `replica_role` selects the
    /// session-level approach for integrity disabling.
    pub fn new(triggers: &[Trigger], opts: &SyncOptions, replica_role: bool) -> Self {
        let enabled: Vec<&Trigger> = triggers.iter().filter(|t| t.enabled).collect();
        let (internal, user): (Vec<&Trigger>, Vec<&Trigger>) =
            enabled.into_iter().partition(|t| t.internal);
        let integrity: Vec<String> = internal
            .iter()
            .filter(|t| t.integrity)
            .map(|t| t.name.clone())
            .collect();

        let mut plan = TriggerPlan::default();
        if opts.disable_integrity || opts.disable_integrity_v2 {
            if replica_role {
                plan.replica_role = true;
            } else {
                plan.disable = integrity.clone();
                plan.restore.extend(integrity);
            }
        }
        if opts.disable_user_triggers {
            plan.disable_user = true;
            plan.restore.extend(user.iter().map(|t| t.name.clone()));
        }
        plan
    }
}

/// An open trigger scope. Pass it to [`restore`] when the transfer ends.
#[derive(Debug)]
pub struct TriggerGuard {
    scope: TransactionScope,
    restore: Vec<String>,
}

/// Open the destination transaction and disable triggers per the options.
pub async fn disable(
    destination: &mut DataSource,
    table: &Table,
    opts: &SyncOptions,
) -> Result<TriggerGuard> {
    let scope = destination.begin().await?;
    match apply(destination, table, opts).await {
        Ok(restore) => Ok(TriggerGuard { scope, restore }),
        Err(e) => destination.finish(scope, Err(e)).await,
    }
}

async fn apply(destination: &mut DataSource, table: &Table, opts: &SyncOptions) -> Result<Vec<String>> {
    let triggers = destination.triggers(table).await?;

    // only v2 works on managed platforms without superuser
    let replica_role = opts.disable_integrity_v2
        || (opts.disable_integrity && destination.is_rds().await?);
    let plan = TriggerPlan::new(&triggers, opts, replica_role);
    let quoted = quote_table(table);

    if plan.replica_role {
        destination
            .execute("SET LOCAL session_replication_role = replica")
            .await?;
    }
    for name in &plan.disable {
        destination
            .execute(&format!("ALTER TABLE {} DISABLE TRIGGER {}", quoted, quote_ident(name)))
            .await?;
    }
    if plan.disable_user {
        destination
            .execute(&format!("ALTER TABLE {} DISABLE TRIGGER USER", quoted))
            .await?;
    }

    debug!("{}: restoring {} triggers after transfer", table, plan.restore.len());
    Ok(plan.restore)
}

/// Re-enable what was disabled, then commit; roll back on failure.
pub async fn restore<T>(
    destination: &mut DataSource,
    table: &Table,
    guard: TriggerGuard,
    result: Result<T>,
) -> Result<T> {
    let TriggerGuard { scope, restore } = guard;
    let result = match result {
        Ok(value) => enable(destination, table, &restore).await.map(|_| value),
        Err(e) => Err(e),
    };
    destination.finish(scope, result).await
}

async fn enable(destination: &mut DataSource, table: &Table, triggers: &[String]) -> Result<()> {
    let quoted = quote_table(table);
    for name in triggers {
        destination
            .execute(&format!("ALTER TABLE {} ENABLE TRIGGER {}", quoted, quote_ident(name)))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(name: &str, internal: bool, enabled: bool, integrity: bool) -> Trigger {
        Trigger {
            name: name.into(),
            internal,
            enabled,
            integrity,
        }
    }

    fn triggers() -> Vec<Trigger> {
        vec![
            trigger("RI_ConstraintTrigger_c_1", true, true, true),
            trigger("RI_ConstraintTrigger_c_2", true, false, true),
            trigger("audit", false, true, false),
            trigger("disabled_user", false, false, false),
        ]
    }

    #[test]
    fn test_disable_integrity_restores_only_enabled() {
        let opts = SyncOptions {
            disable_integrity: true,
            ..Default::default()
        };
        let plan = TriggerPlan::new(&triggers(), &opts, false);
        assert!(!plan.replica_role);
        assert_eq!(plan.disable, ["RI_ConstraintTrigger_c_1"]);
        assert_eq!(plan.restore, ["RI_ConstraintTrigger_c_1"]);
        assert!(!plan.disable_user);
    }

    #[test]
    fn test_replica_role_disables_nothing_individually() {
        let opts = SyncOptions {
            disable_integrity_v2: true,
            ..Default::default()
        };
        let plan = TriggerPlan::new(&triggers(), &opts, true);
        assert!(plan.replica_role);
        assert!(plan.disable.is_empty());
        assert!(plan.restore.is_empty());
    }

    #[test]
    fn test_user_triggers_combine_with_integrity() {
        let opts = SyncOptions {
            disable_integrity: true,
            disable_user_triggers: true,
            ..Default::default()
        };
        let plan = TriggerPlan::new(&triggers(), &opts, false);
        assert!(plan.disable_user);
        assert_eq!(plan.restore, ["RI_ConstraintTrigger_c_1", "audit"]);
    }

    #[test]
    fn test_no_options_no_changes() {
        let plan = TriggerPlan::new(&triggers(), &SyncOptions::default(), false);
        assert_eq!(plan, TriggerPlan::default());
    }
}
