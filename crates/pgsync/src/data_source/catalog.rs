//! Catalog introspection queries.

use super::DataSource;
use crate::core::identifier::{quote_ident, quote_table};
use crate::core::{Column, NonDeferrableConstraint, Sequence, Table, Trigger};
use crate::error::{Result, SyncError};
use std::collections::BTreeMap;

const TABLES_QUERY: &str = r#"
SELECT table_schema::text, table_name::text
FROM information_schema.tables
WHERE table_type = 'BASE TABLE'
  AND table_schema NOT IN ('information_schema', 'pg_catalog')
ORDER BY 1, 2
"#;

const COLUMNS_QUERY: &str = r#"
SELECT column_name::text, data_type::text
FROM information_schema.columns
WHERE table_schema = $1 AND table_name = $2
ORDER BY ordinal_position
"#;

const PRIMARY_KEY_QUERY: &str = r#"
SELECT pg_attribute.attname::text
FROM pg_index
JOIN pg_class ON pg_class.oid = pg_index.indrelid
JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace
JOIN pg_attribute ON pg_attribute.attrelid = pg_class.oid
    AND pg_attribute.attnum = ANY(pg_index.indkey)
WHERE pg_namespace.nspname = $1
  AND pg_class.relname = $2
  AND pg_index.indisprimary
ORDER BY array_position(pg_index.indkey::int2[], pg_attribute.attnum)
"#;

const SEQUENCES_QUERY: &str = r#"
SELECT c, pg_get_serial_sequence($1, c)
FROM unnest($2::text[]) AS c
"#;

const TRIGGERS_QUERY: &str = r#"
SELECT
    tgname::text AS name,
    tgisinternal AS internal,
    tgenabled != 'D' AS enabled,
    tgconstraint != 0 AS integrity
FROM pg_trigger
WHERE tgrelid = $1::text::regclass
"#;

const NON_DEFERRABLE_QUERY: &str = r#"
SELECT table_schema::text, table_name::text, constraint_name::text
FROM information_schema.table_constraints
WHERE constraint_type = 'FOREIGN KEY'
  AND is_deferrable = 'NO'
ORDER BY 1, 2, 3
"#;

impl DataSource {
    /// Schemas in the effective search path, `pg_catalog` included.
    pub async fn search_path(&mut self) -> Result<Vec<String>> {
        if let Some(path) = &self.cache.search_path {
            return Ok(path.clone());
        }
        let row = self.query_one("SELECT current_schemas(true)", &[]).await?;
        let path: Vec<String> = row.try_get(0)?;
        self.cache.search_path = Some(path.clone());
        Ok(path)
    }

    /// First search path schema that is not `pg_catalog`.
    pub async fn first_schema(&mut self) -> Result<Option<String>> {
        Ok(self
            .search_path()
            .await?
            .into_iter()
            .find(|schema| schema != "pg_catalog"))
    }

    /// All user tables, sorted by schema and name.
    pub async fn tables(&mut self) -> Result<Vec<Table>> {
        if let Some(tables) = &self.cache.tables {
            return Ok(tables.clone());
        }
        let rows = self.query(TABLES_QUERY, &[]).await?;
        let tables = rows
            .iter()
            .map(|row| Ok(Table::new(row.try_get::<_, String>(0)?, row.try_get::<_, String>(1)?)))
            .collect::<Result<Vec<_>>>()?;
        self.cache.tables = Some(tables.clone());
        Ok(tables)
    }

    pub async fn table_exists(&mut self, table: &Table) -> Result<bool> {
        Ok(self.tables().await?.contains(table))
    }

    /// Columns in ordinal order.
    pub async fn columns(&mut self, table: &Table) -> Result<Vec<Column>> {
        let rows = self
            .query(COLUMNS_QUERY, &[&table.schema(), &table.name()])
            .await?;
        rows.iter()
            .map(|row| Ok(Column::new(row.try_get::<_, String>(0)?, row.try_get::<_, String>(1)?)))
            .collect()
    }

    /// Primary key columns in index order. Empty when there is none.
    pub async fn primary_key(&mut self, table: &Table) -> Result<Vec<String>> {
        let rows = self
            .query(PRIMARY_KEY_QUERY, &[&table.schema(), &table.name()])
            .await?;
        rows.iter()
            .map(|row| Ok(row.try_get::<_, String>(0)?))
            .collect()
    }

    /// Sequences backing any of the given columns.
    pub async fn sequences(&mut self, table: &Table, columns: &[String]) -> Result<Vec<Sequence>> {
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let regclass = quote_table(table);
        let rows = self.query(SEQUENCES_QUERY, &[&regclass, &columns]).await?;

        let mut sequences = Vec::new();
        for row in rows {
            let column: String = row.try_get(0)?;
            let name: Option<String> = row.try_get(1)?;
            if let Some(seq) = name.as_deref().and_then(|n| Sequence::from_regclass(n, column)) {
                sequences.push(seq);
            }
        }
        Ok(sequences)
    }

    pub async fn last_value(&mut self, sequence: &Sequence) -> Result<i64> {
        let sql = format!(
            "SELECT last_value FROM {}.{}",
            quote_ident(sequence.schema()),
            quote_ident(sequence.name())
        );
        let row = self.query_one(&sql, &[]).await?;
        Ok(row.try_get(0)?)
    }

    pub async fn set_sequence(&mut self, sequence: &Sequence, value: i64) -> Result<()> {
        let regclass = format!("{}.{}", quote_ident(sequence.schema()), quote_ident(sequence.name()));
        self.query_one("SELECT setval($1::text::regclass, $2)", &[&regclass, &value])
            .await?;
        Ok(())
    }

    /// `MAX` and `MIN` of an integer column, `None` on an empty table.
    pub async fn id_range(&mut self, table: &Table, column: &str) -> Result<(Option<i64>, Option<i64>)> {
        let sql = format!(
            "SELECT MIN({col})::bigint, MAX({col})::bigint FROM {}",
            quote_table(table),
            col = quote_ident(column)
        );
        let row = self.query_one(&sql, &[]).await?;
        Ok((row.try_get(0)?, row.try_get(1)?))
    }

    pub async fn truncate(&mut self, table: &Table) -> Result<()> {
        self.execute(&format!("TRUNCATE {} CASCADE", quote_table(table)))
            .await?;
        Ok(())
    }

    pub async fn triggers(&mut self, table: &Table) -> Result<Vec<Trigger>> {
        let regclass = quote_table(table);
        let rows = self.query(TRIGGERS_QUERY, &[&regclass]).await?;
        rows.iter()
            .map(|row| {
                Ok(Trigger {
                    name: row.try_get(0)?,
                    internal: row.try_get(1)?,
                    enabled: row.try_get(2)?,
                    integrity: row.try_get(3)?,
                })
            })
            .collect()
    }

    /// `server_version_num`, e.g. 150004.
    pub async fn server_version_num(&mut self) -> Result<i32> {
        if let Some(version) = self.cache.server_version {
            return Ok(version);
        }
        let row = self
            .query_one("SELECT current_setting('server_version_num')", &[])
            .await?;
        let text: String = row.try_get(0)?;
        let version = text.trim().parse::<i32>().map_err(|_| {
            SyncError::Precondition(format!("Unexpected server_version_num: {}", text))
        })?;
        self.cache.server_version = Some(version);
        Ok(version)
    }

    /// Amazon RDS exposes `rds.*` settings.
    pub async fn is_rds(&mut self) -> Result<bool> {
        let rows = self
            .query("SELECT 1 FROM pg_settings WHERE name LIKE 'rds.%' LIMIT 1", &[])
            .await?;
        Ok(!rows.is_empty())
    }

    /// Non-deferrable foreign keys, grouped by table.
    pub async fn non_deferrable_constraints(
        &mut self,
    ) -> Result<BTreeMap<Table, Vec<NonDeferrableConstraint>>> {
        let rows = self.query(NON_DEFERRABLE_QUERY, &[]).await?;
        let mut grouped: BTreeMap<Table, Vec<NonDeferrableConstraint>> = BTreeMap::new();
        for row in rows {
            let table = Table::new(row.try_get::<_, String>(0)?, row.try_get::<_, String>(1)?);
            let name: String = row.try_get(2)?;
            grouped
                .entry(table.clone())
                .or_default()
                .push(NonDeferrableConstraint { table, name });
        }
        Ok(grouped)
    }

    pub async fn set_deferrable(
        &mut self,
        constraint: &NonDeferrableConstraint,
        deferrable: bool,
    ) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {} ALTER CONSTRAINT {} {}",
            quote_table(&constraint.table),
            quote_ident(&constraint.name),
            if deferrable { "DEFERRABLE" } else { "NOT DEFERRABLE" }
        );
        self.execute(&sql).await?;
        Ok(())
    }
}
