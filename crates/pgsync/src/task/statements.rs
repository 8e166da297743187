//! SQL builders for a table transfer.
//!
//! Every builder takes only shared columns, so nothing unique to one side
//! is ever read or written.

use crate::core::identifier::{quote_column, quote_ident, quote_list, quote_table};
use crate::core::Table;
use crate::error::Result;
use crate::rules::DataRules;

/// Select list for the copy, with anonymized columns replaced by their rule.
pub fn select_list(
    table: &Table,
    shared: &[String],
    rules: Option<&DataRules>,
    primary_key: &[String],
) -> Result<String> {
    let columns = shared
        .iter()
        .map(|column| match rules.and_then(|rules| rules.find(table, column)) {
            Some(rule) => Ok(format!(
                "{} AS {}",
                rule.render(table, column, primary_key)?,
                quote_ident(column)
            )),
            None => Ok(quote_column(table, column)),
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(columns.join(", "))
}

/// Filter clause from the task SQL plus the incremental window.
///
/// Returns an empty string or a fragment with a leading space.
pub fn filter_clause(table: &Table, sql: Option<&str>, incremental: Option<u64>) -> String {
    let mut clause = match sql.map(str::trim) {
        Some(sql) if !sql.is_empty() => format!(" {}", sql),
        _ => String::new(),
    };
    if let Some(seconds) = incremental {
        let condition = format!(
            "{} > NOW() - INTERVAL '{} second'",
            quote_column(table, "updated_at"),
            seconds
        );
        clause = with_condition(&clause, &condition);
    }
    clause
}

/// Append a condition to a clause, starting a WHERE when there is none.
pub fn with_condition(clause: &str, condition: &str) -> String {
    if clause.is_empty() {
        format!(" WHERE {}", condition)
    } else {
        format!("{} AND {}", clause, condition)
    }
}

pub fn copy_out(table: &Table, select_list: &str, clause: &str) -> String {
    format!(
        "COPY (SELECT {} FROM {}{}) TO STDOUT",
        select_list,
        quote_table(table),
        clause
    )
}

pub fn copy_in(table: &Table, shared: &[String]) -> String {
    format!("COPY {} ({}) FROM STDIN", quote_table(table), quote_list(shared))
}

pub fn count_rows(table: &Table, clause: &str) -> String {
    format!("SELECT COUNT(*) FROM {}{}", quote_table(table), clause)
}

pub fn delete_all(table: &Table) -> String {
    format!("DELETE FROM {}", quote_table(table))
}

/// Window condition for an integer key, bounds inclusive.
pub fn integer_window(primary_key: &str, first: i64, last: i64) -> String {
    let pk = quote_ident(primary_key);
    format!("{pk} >= {first} AND {pk} <= {last}")
}

/// Partition condition for a UUID key: the leading 64 bits of the key as a
/// signed integer, modulo the partition count.
pub fn uuid_partition(primary_key: &str, partitions: u64, index: u64) -> String {
    format!(
        "abs(('x' || left(replace({}::text, '-', ''), 16))::bit(64)::bigint % {}) = {}",
        quote_ident(primary_key),
        partitions,
        index
    )
}

/// Temporary staging table, dropped at commit.
pub fn create_temp_staging(staging: &str, table: &Table) -> String {
    format!(
        "CREATE TEMPORARY TABLE {} ON COMMIT DROP AS TABLE {} WITH NO DATA",
        quote_ident(staging),
        quote_table(table)
    )
}

/// Persistent staging table, reused across runs.
pub fn create_persistent_staging(staging: &Table, table: &Table) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL)",
        quote_table(staging),
        quote_table(table)
    )
}

/// Staging table for `--no-temp-table`: `pgsync_<name>` next to the table.
pub fn persistent_staging_table(table: &Table) -> Table {
    Table::new(table.schema(), format!("pgsync_{}", table.name()))
}

/// NULL-safe equality of a column and its incoming value.
/// JSON columns are compared as `jsonb` so formatting differences do not count.
pub fn field_equality(table: &Table, column: &str, json: bool) -> String {
    let current = quote_column(table, column);
    let incoming = format!("EXCLUDED.{}", quote_ident(column));
    let null_cond = format!("({} IS NULL AND {} IS NULL)", current, incoming);
    if json {
        format!(
            "(COALESCE({}::jsonb = {}::jsonb, false) OR {})",
            current, incoming, null_cond
        )
    } else {
        format!("(COALESCE({} = {}, false) OR {})", current, incoming, null_cond)
    }
}

/// Move staged rows into the table.
///
/// `preserve` keeps existing rows; otherwise conflicting rows are updated,
/// skipping updates that would not change anything.
pub fn upsert(
    table: &Table,
    staging: &str,
    shared: &[String],
    primary_key: &[String],
    json_columns: &[String],
    preserve: bool,
) -> String {
    let fields = quote_list(shared);
    let non_key: Vec<&String> = shared
        .iter()
        .filter(|column| !primary_key.contains(column))
        .collect();

    let action = if preserve || non_key.is_empty() {
        "NOTHING".to_string()
    } else {
        let setter = non_key
            .iter()
            .map(|column| format!("{} = EXCLUDED.{}", quote_ident(column), quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let unchanged = non_key
            .iter()
            .map(|column| field_equality(table, column, json_columns.contains(column)))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!("UPDATE SET {} WHERE NOT ({})", setter, unchanged)
    };

    format!(
        "INSERT INTO {} ({}) (SELECT {} FROM {}) ON CONFLICT ({}) DO {}",
        quote_table(table),
        fields,
        fields,
        staging,
        quote_list(primary_key),
        action
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posts() -> Table {
        Table::new("public", "posts")
    }

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_list_only_shared_columns() {
        let list = select_list(&posts(), &cols(&["id", "title"]), None, &[]).unwrap();
        assert_eq!(list, "\"public\".\"posts\".\"id\", \"public\".\"posts\".\"title\"");
    }

    #[test]
    fn test_select_list_applies_rules() {
        let rules: DataRules = serde_yaml::from_str("title: unique_secret").unwrap();
        let list = select_list(&posts(), &cols(&["id", "title"]), Some(&rules), &cols(&["id"]))
            .unwrap();
        assert_eq!(
            list,
            "\"public\".\"posts\".\"id\", 'secret' || \"public\".\"posts\".\"id\"::text AS \"title\""
        );
    }

    #[test]
    fn test_select_list_unknown_rule_fails() {
        let rules: DataRules = serde_yaml::from_str("title: shuffle").unwrap();
        assert!(select_list(&posts(), &cols(&["title"]), Some(&rules), &[]).is_err());
    }

    #[test]
    fn test_filter_clause() {
        assert_eq!(filter_clause(&posts(), None, None), "");
        assert_eq!(filter_clause(&posts(), Some("  "), None), "");
        assert_eq!(
            filter_clause(&posts(), Some("WHERE id > 5"), None),
            " WHERE id > 5"
        );
        assert_eq!(
            filter_clause(&posts(), None, Some(3600)),
            " WHERE \"public\".\"posts\".\"updated_at\" > NOW() - INTERVAL '3600 second'"
        );
        assert_eq!(
            filter_clause(&posts(), Some("WHERE id > 5"), Some(60)),
            " WHERE id > 5 AND \"public\".\"posts\".\"updated_at\" > NOW() - INTERVAL '60 second'"
        );
    }

    #[test]
    fn test_copy_statements() {
        let out = copy_out(&posts(), "\"public\".\"posts\".\"id\"", " WHERE id > 1");
        assert_eq!(
            out,
            "COPY (SELECT \"public\".\"posts\".\"id\" FROM \"public\".\"posts\" WHERE id > 1) TO STDOUT"
        );
        assert_eq!(
            copy_in(&posts(), &cols(&["id", "title"])),
            "COPY \"public\".\"posts\" (\"id\", \"title\") FROM STDIN"
        );
    }

    #[test]
    fn test_batch_conditions() {
        assert_eq!(integer_window("id", 1, 10), "\"id\" >= 1 AND \"id\" <= 10");
        assert_eq!(with_condition("", "x"), " WHERE x");
        assert_eq!(with_condition(" WHERE a", "x"), " WHERE a AND x");
        assert_eq!(
            uuid_partition("id", 4, 2),
            "abs(('x' || left(replace(\"id\"::text, '-', ''), 16))::bit(64)::bigint % 4) = 2"
        );
    }

    #[test]
    fn test_staging_tables() {
        assert_eq!(
            create_temp_staging("pgsync_abc", &posts()),
            "CREATE TEMPORARY TABLE \"pgsync_abc\" ON COMMIT DROP AS TABLE \"public\".\"posts\" WITH NO DATA"
        );
        let staging = persistent_staging_table(&posts());
        assert_eq!(staging.full_name(), "public.pgsync_posts");
        assert_eq!(
            create_persistent_staging(&staging, &posts()),
            "CREATE TABLE IF NOT EXISTS \"public\".\"pgsync_posts\" (LIKE \"public\".\"posts\" INCLUDING ALL)"
        );
    }

    #[test]
    fn test_field_equality_json() {
        let eq = field_equality(&posts(), "meta", true);
        assert!(eq.contains("\"public\".\"posts\".\"meta\"::jsonb = EXCLUDED.\"meta\"::jsonb"));
        assert!(eq.contains("IS NULL AND EXCLUDED.\"meta\" IS NULL"));
    }

    #[test]
    fn test_upsert_overwrite_skips_unchanged() {
        let sql = upsert(
            &posts(),
            "\"pgsync_1\"",
            &cols(&["id", "title"]),
            &cols(&["id"]),
            &[],
            false,
        );
        assert_eq!(
            sql,
            "INSERT INTO \"public\".\"posts\" (\"id\", \"title\") (SELECT \"id\", \"title\" FROM \"pgsync_1\") \
             ON CONFLICT (\"id\") DO UPDATE SET \"title\" = EXCLUDED.\"title\" \
             WHERE NOT ((COALESCE(\"public\".\"posts\".\"title\" = EXCLUDED.\"title\", false) \
             OR (\"public\".\"posts\".\"title\" IS NULL AND EXCLUDED.\"title\" IS NULL)))"
        );
    }

    #[test]
    fn test_upsert_preserve_and_key_only() {
        let sql = upsert(&posts(), "s", &cols(&["id", "title"]), &cols(&["id"]), &[], true);
        assert!(sql.ends_with("ON CONFLICT (\"id\") DO NOTHING"));

        let sql = upsert(&posts(), "s", &cols(&["id"]), &cols(&["id"]), &[], false);
        assert!(sql.ends_with("DO NOTHING"));
    }
}
