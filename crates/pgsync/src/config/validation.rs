//! Configuration validation.

use super::{Config, SyncOptions};
use crate::error::{Result, SyncError};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Cannot sync a database onto itself
    if let (Some(from), Some(to)) = (&config.from, &config.to) {
        if !from.is_empty() && from == to {
            return Err(SyncError::Config(
                "from and to cannot be the same database".into(),
            ));
        }
    }

    for (name, entries) in &config.groups {
        if name.is_empty() {
            return Err(SyncError::Config("group name cannot be empty".into()));
        }
        if entries.iter().any(|entry| entry.table().trim().is_empty()) {
            return Err(SyncError::Config(format!(
                "group {} has an empty table name",
                name
            )));
        }
    }

    if config.data_rules.patterns().any(|pattern| pattern.trim().is_empty()) {
        return Err(SyncError::Config("data rule pattern cannot be empty".into()));
    }

    Ok(())
}

/// Validate per-run options.
pub fn validate_options(opts: &SyncOptions) -> Result<()> {
    if opts.in_batches && opts.overwrite {
        return Err(SyncError::Config(
            "Cannot use --overwrite with --in-batches".into(),
        ));
    }
    if opts.in_batches && opts.preserve {
        return Err(SyncError::Config(
            "Cannot use --preserve with --in-batches".into(),
        ));
    }
    if opts.overwrite && opts.preserve {
        return Err(SyncError::Config(
            "Cannot use --overwrite with --preserve".into(),
        ));
    }
    if opts.defer_constraints && opts.defer_constraints_v2 {
        return Err(SyncError::Config(
            "Cannot use --defer-constraints with --defer-constraints-v2".into(),
        ));
    }
    if (opts.defer_constraints || opts.defer_constraints_v2)
        && (opts.disable_integrity || opts.disable_integrity_v2)
    {
        return Err(SyncError::Config(
            "Cannot use --defer-constraints with --disable-integrity".into(),
        ));
    }

    if opts.batch_size == 0 {
        return Err(SyncError::Config("batch_size must be at least 1".into()));
    }
    if let Some(0) = opts.jobs {
        return Err(SyncError::Config("jobs must be at least 1".into()));
    }
    if !opts.sleep.is_finite() || opts.sleep < 0.0 {
        return Err(SyncError::Config("sleep must be a non-negative number".into()));
    }
    if let Some(0) = opts.throttle_bytes_per_second {
        return Err(SyncError::Config(
            "throttle_bytes_per_second must be at least 1".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupEntry;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_same_database_rejected() {
        let config = Config {
            from: Some("postgres://localhost/app".into()),
            to: Some("postgres://localhost/app".into()),
            ..Default::default()
        };
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_empty_group_table_rejected() {
        let mut config = Config::default();
        config
            .groups
            .insert("broken".into(), vec![GroupEntry::Table(" ".into())]);
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_default_options_valid() {
        assert!(validate_options(&SyncOptions::default()).is_ok());
    }

    #[test]
    fn test_batches_conflicts() {
        let opts = SyncOptions {
            in_batches: true,
            overwrite: true,
            ..Default::default()
        };
        let err = validate_options(&opts).unwrap_err();
        assert_eq!(err.to_string(), "Cannot use --overwrite with --in-batches");

        let opts = SyncOptions {
            in_batches: true,
            preserve: true,
            ..Default::default()
        };
        assert!(validate_options(&opts).is_err());
    }

    #[test]
    fn test_constraint_modes_exclusive() {
        let opts = SyncOptions {
            defer_constraints: true,
            disable_integrity: true,
            ..Default::default()
        };
        assert!(validate_options(&opts).is_err());

        // both integrity variants may be given together
        let opts = SyncOptions {
            disable_integrity: true,
            disable_integrity_v2: true,
            disable_user_triggers: true,
            ..Default::default()
        };
        assert!(validate_options(&opts).is_ok());
    }

    #[test]
    fn test_numeric_ranges() {
        let opts = SyncOptions {
            batch_size: 0,
            ..Default::default()
        };
        assert!(validate_options(&opts).is_err());

        let opts = SyncOptions {
            jobs: Some(0),
            ..Default::default()
        };
        assert!(validate_options(&opts).is_err());

        let opts = SyncOptions {
            sleep: -1.0,
            ..Default::default()
        };
        assert!(validate_options(&opts).is_err());
    }
}
