//! Synchronization of one table.
//!
//! A task diffs both sides, picks a [`Strategy`], streams rows, updates
//! sequences and restores triggers, strictly in that order. Failures become
//! an error [`TaskResult`] so one bad table never stops the others.

pub mod copy;
pub mod statements;
pub mod strategy;
pub mod triggers;

pub use strategy::{IntegerWindows, KeyKind, Strategy};

use crate::config::SyncOptions;
use crate::core::identifier::{quote_ident, quote_list, quote_table};
use crate::core::{Column, Sequence, Table};
use crate::data_source::DataSource;
use crate::error::{ErrorCategory, Result, SyncError};
use crate::rules::DataRules;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Error,
}

/// Per-task result record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub table: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    /// Seconds, one decimal.
    pub elapsed_time: f64,
    pub notices: Vec<String>,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

/// One resolved table and everything needed to sync it.
#[derive(Debug, Clone)]
pub struct Task {
    pub table: Table,
    /// User-facing name.
    pub display_name: String,
    pub sql: Option<String>,
    opts: Arc<SyncOptions>,
    rules: Arc<DataRules>,
    from_columns: Vec<Column>,
    to_columns: Vec<Column>,
    from_sequences: Vec<Sequence>,
    to_sequences: Vec<Sequence>,
    to_primary_key: Vec<String>,
}

impl Task {
    pub fn new(
        table: Table,
        display_name: String,
        sql: Option<String>,
        opts: Arc<SyncOptions>,
        rules: Arc<DataRules>,
    ) -> Self {
        Self {
            table,
            display_name,
            sql,
            opts,
            rules,
            from_columns: Vec::new(),
            to_columns: Vec::new(),
            from_sequences: Vec::new(),
            to_sequences: Vec::new(),
            to_primary_key: Vec::new(),
        }
    }

    /// Fetch columns, sequences and the destination primary key.
    pub async fn prepare(&mut self, source: &mut DataSource, destination: &mut DataSource) -> Result<()> {
        self.from_columns = source.columns(&self.table).await?;
        self.to_columns = destination.columns(&self.table).await?;
        self.to_primary_key = destination.primary_key(&self.table).await?;

        if !self.opts.no_sequences {
            let shared = self.shared_fields();
            self.from_sequences = source.sequences(&self.table, &shared).await?;
            self.to_sequences = destination.sequences(&self.table, &shared).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn with_columns(mut self, from: Vec<Column>, to: Vec<Column>, primary_key: Vec<String>) -> Self {
        self.from_columns = from;
        self.to_columns = to;
        self.to_primary_key = primary_key;
        self
    }

    #[cfg(test)]
    fn with_sequences(mut self, from: Vec<Sequence>, to: Vec<Sequence>) -> Self {
        self.from_sequences = from;
        self.to_sequences = to;
        self
    }

    /// Destination columns also present in the source, in destination order.
    pub fn shared_fields(&self) -> Vec<String> {
        self.to_columns
            .iter()
            .filter(|to| self.from_columns.iter().any(|from| from.name == to.name))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Sequences on both sides.
    pub fn shared_sequences(&self) -> Vec<Sequence> {
        self.to_sequences
            .iter()
            .filter(|seq| self.from_sequences.contains(seq))
            .cloned()
            .collect()
    }

    fn from_types(&self) -> HashMap<&str, &str> {
        types(&self.from_columns)
    }

    fn to_types(&self) -> HashMap<&str, &str> {
        types(&self.to_columns)
    }

    /// Schema drift between the two sides. Never fatal.
    pub fn notes(&self) -> Vec<String> {
        let shared = self.shared_fields();
        if shared.is_empty() {
            return vec!["No fields to copy".to_string()];
        }

        let mut notes = Vec::new();
        let from_names: Vec<&str> = self.from_columns.iter().map(|c| c.name.as_str()).collect();
        let to_names: Vec<&str> = self.to_columns.iter().map(|c| c.name.as_str()).collect();

        let extra: Vec<&str> = to_names.iter().filter(|n| !from_names.contains(n)).copied().collect();
        if !extra.is_empty() {
            notes.push(format!("Extra columns: {}", extra.join(", ")));
        }
        let missing: Vec<&str> = from_names.iter().filter(|n| !to_names.contains(n)).copied().collect();
        if !missing.is_empty() {
            notes.push(format!("Missing columns: {}", missing.join(", ")));
        }

        let extra_sequences: Vec<String> = self
            .to_sequences
            .iter()
            .filter(|s| !self.from_sequences.contains(s))
            .map(|s| s.to_string())
            .collect();
        if !extra_sequences.is_empty() {
            notes.push(format!("Extra sequences: {}", extra_sequences.join(", ")));
        }
        let missing_sequences: Vec<String> = self
            .from_sequences
            .iter()
            .filter(|s| !self.to_sequences.contains(s))
            .map(|s| s.to_string())
            .collect();
        if !missing_sequences.is_empty() {
            notes.push(format!("Missing sequences: {}", missing_sequences.join(", ")));
        }

        let from_types = self.from_types();
        let to_types = self.to_types();
        let different: Vec<String> = shared
            .iter()
            .filter_map(|field| {
                let from = from_types.get(field.as_str())?;
                let to = to_types.get(field.as_str())?;
                (from != to).then(|| format!("{} ({} -> {})", field, from, to))
            })
            .collect();
        if !different.is_empty() {
            notes.push(format!("Different column types: {}", different.join(", ")));
        }

        notes
    }

    /// Run the task, converting any failure into an error result.
    pub async fn perform(&self, source: &mut DataSource, destination: &mut DataSource) -> TaskResult {
        let started = Instant::now();
        source.clear_notices();
        destination.clear_notices();

        let outcome = self.run(source, destination).await;

        let mut notices = source.take_notices();
        notices.extend(destination.take_notices());
        let elapsed_time = round_secs(started.elapsed());

        match outcome {
            Ok(message) => TaskResult {
                table: self.display_name.clone(),
                status: TaskStatus::Success,
                message,
                category: None,
                elapsed_time,
                notices,
            },
            Err(e) => {
                debug!("{}: {}", self.display_name, e.format_detailed());
                TaskResult {
                    table: self.display_name.clone(),
                    status: TaskStatus::Error,
                    message: Some(e.task_message()),
                    category: Some(e.category()),
                    elapsed_time,
                    notices,
                }
            }
        }
    }

    async fn run(&self, source: &mut DataSource, destination: &mut DataSource) -> Result<Option<String>> {
        if self.shared_fields().is_empty() {
            return Ok(Some("No fields to copy".to_string()));
        }

        if self.opts.manages_triggers() {
            let guard = triggers::disable(destination, &self.table, &self.opts).await?;
            let result = self.sync_data(source, destination).await;
            triggers::restore(destination, &self.table, guard, result).await?;
        } else {
            self.sync_data(source, destination).await?;
        }
        Ok(None)
    }

    /// Data phase followed by the sequence phase.
    async fn sync_data(&self, source: &mut DataSource, destination: &mut DataSource) -> Result<()> {
        let shared = self.shared_fields();
        let from_types = self.from_types();

        let incremental = self.opts.incremental.filter(|_| {
            from_types
                .get("updated_at")
                .map_or(false, |t| t.starts_with("timestamp"))
        });
        let clause = statements::filter_clause(&self.table, self.sql.as_deref(), incremental);

        let rules = (!self.opts.no_rules).then(|| self.rules.as_ref());
        let select = statements::select_list(&self.table, &shared, rules, &self.to_primary_key)?;

        let strategy = Strategy::select(&self.opts, !clause.is_empty());
        if strategy.needs_primary_key() && self.to_primary_key.is_empty() {
            return Err(SyncError::NoPrimaryKey(self.display_name.clone()));
        }

        match strategy {
            Strategy::Batched => self.copy_batched(source, destination, &shared, &select, &clause).await?,
            Strategy::Reconcile { preserve } => {
                self.reconcile(source, destination, &shared, &select, &clause, preserve)
                    .await?
            }
            Strategy::FullReplace => self.replace(source, destination, &shared, &select, &clause).await?,
        }

        for sequence in self.shared_sequences() {
            let value = source.last_value(&sequence).await?;
            destination.set_sequence(&sequence, value).await?;
        }
        Ok(())
    }

    async fn pipe(
        &self,
        source: &mut DataSource,
        destination: &mut DataSource,
        shared: &[String],
        select: &str,
        clause: &str,
    ) -> Result<u64> {
        let copy_out = statements::copy_out(&self.table, select, clause);
        let copy_in = statements::copy_in(&self.table, shared);
        copy::copy(
            source,
            destination,
            &copy_out,
            &copy_in,
            self.opts.throttle_bytes_per_second,
            &self.display_name,
        )
        .await
    }

    async fn replace(
        &self,
        source: &mut DataSource,
        destination: &mut DataSource,
        shared: &[String],
        select: &str,
        clause: &str,
    ) -> Result<()> {
        if self.opts.delete {
            let scope = destination.begin().await?;
            let result = async {
                destination.execute(&statements::delete_all(&self.table)).await?;
                self.pipe(source, destination, shared, select, clause).await
            }
            .await;
            destination.finish(scope, result).await?;
        } else if self.opts.defer_constraints || self.opts.defer_constraints_v2 {
            // TRUNCATE cannot be deferred
            destination.execute(&statements::delete_all(&self.table)).await?;
            self.pipe(source, destination, shared, select, clause).await?;
        } else {
            destination.truncate(&self.table).await?;
            self.pipe(source, destination, shared, select, clause).await?;
        }
        Ok(())
    }

    async fn reconcile(
        &self,
        source: &mut DataSource,
        destination: &mut DataSource,
        shared: &[String],
        select: &str,
        clause: &str,
        preserve: bool,
    ) -> Result<()> {
        let scope = destination.begin().await?;
        let result = self
            .stage_and_merge(source, destination, shared, select, clause, preserve)
            .await;
        destination.finish(scope, result).await
    }

    async fn stage_and_merge(
        &self,
        source: &mut DataSource,
        destination: &mut DataSource,
        shared: &[String],
        select: &str,
        clause: &str,
        preserve: bool,
    ) -> Result<()> {
        let persistent = self.opts.no_temp_table.then(|| statements::persistent_staging_table(&self.table));
        let staging_sql = match &persistent {
            Some(staging) => {
                destination
                    .execute(&statements::create_persistent_staging(staging, &self.table))
                    .await?;
                quote_table(staging)
            }
            None => {
                let name = format!("pgsync_{}", uuid::Uuid::new_v4().simple());
                destination
                    .execute(&statements::create_temp_staging(&name, &self.table))
                    .await?;
                quote_ident(&name)
            }
        };

        let copy_out = statements::copy_out(&self.table, select, clause);
        let copy_in = format!("COPY {} ({}) FROM STDIN", staging_sql, quote_list(shared));
        copy::copy(
            source,
            destination,
            &copy_out,
            &copy_in,
            self.opts.throttle_bytes_per_second,
            &self.display_name,
        )
        .await?;

        let json_columns: Vec<String> = self
            .to_columns
            .iter()
            .filter(|c| c.data_type == "json")
            .map(|c| c.name.clone())
            .collect();
        let upsert = statements::upsert(
            &self.table,
            &staging_sql,
            shared,
            &self.to_primary_key,
            &json_columns,
            preserve,
        );
        let affected = destination.execute(&upsert).await?;

        if let Some(staging) = &persistent {
            destination.execute(&statements::delete_all(staging)).await?;
        }
        info!(table = %self.display_name, updated_rows = affected, "Reconciled rows");
        Ok(())
    }

    async fn copy_batched(
        &self,
        source: &mut DataSource,
        destination: &mut DataSource,
        shared: &[String],
        select: &str,
        clause: &str,
    ) -> Result<()> {
        let primary_key = match self.to_primary_key.as_slice() {
            [single] => single.clone(),
            _ => {
                return Err(SyncError::Precondition(format!(
                    "Single column primary key required for --in-batches: {}",
                    self.display_name
                )))
            }
        };
        let data_type = self
            .to_types()
            .get(primary_key.as_str())
            .map(|t| t.to_string())
            .unwrap_or_default();
        let kind = KeyKind::from_data_type(&self.display_name, &data_type)?;

        if self.opts.truncate {
            destination.truncate(&self.table).await?;
        }

        match kind {
            KeyKind::Integer => {
                let (source_min, source_max) = source.id_range(&self.table, &primary_key).await?;
                let (_, destination_max) = destination.id_range(&self.table, &primary_key).await?;
                let (Some(start), Some(max)) =
                    (strategy::resume_point(source_min, destination_max), source_max)
                else {
                    return Ok(());
                };

                let windows = IntegerWindows::new(start, max, self.opts.batch_size);
                let total = windows.window_count();
                for (i, (first, last)) in windows.enumerate() {
                    let condition = statements::integer_window(&primary_key, first, last);
                    info!("{} {}/{}: {}", self.display_name, i + 1, total, condition);
                    let batch_clause = statements::with_condition(clause, &condition);
                    self.pipe(source, destination, shared, select, &batch_clause)
                        .await?;
                    if (i as u64) + 1 < total {
                        self.pause().await;
                    }
                }
            }
            KeyKind::Uuid => {
                let row = source
                    .query_one(&statements::count_rows(&self.table, clause), &[])
                    .await?;
                let rows: i64 = row.try_get(0)?;
                let partitions = strategy::uuid_partitions(rows, self.opts.batch_size);

                for i in 0..partitions {
                    let condition = statements::uuid_partition(&primary_key, partitions, i);
                    info!("{} {}/{}: {}", self.display_name, i + 1, partitions, condition);
                    let batch_clause = statements::with_condition(clause, &condition);
                    self.pipe(source, destination, shared, select, &batch_clause)
                        .await?;
                    if i + 1 < partitions {
                        self.pause().await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn pause(&self) {
        if self.opts.sleep > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(self.opts.sleep)).await;
        }
    }
}

fn types(columns: &[Column]) -> HashMap<&str, &str> {
    columns
        .iter()
        .map(|c| (c.name.as_str(), c.data_type.as_str()))
        .collect()
}

fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            Table::new("public", "posts"),
            "posts".into(),
            None,
            Arc::new(SyncOptions::default()),
            Arc::new(DataRules::default()),
        )
    }

    fn col(name: &str, data_type: &str) -> Column {
        Column::new(name, data_type)
    }

    #[test]
    fn test_shared_fields_follow_destination_order() {
        let task = task().with_columns(
            vec![col("id", "integer"), col("title", "text"), col("body", "text")],
            vec![col("title", "text"), col("id", "integer"), col("slug", "text")],
            vec!["id".into()],
        );
        assert_eq!(task.shared_fields(), ["title", "id"]);
    }

    #[test]
    fn test_notes_report_drift() {
        let task = task().with_columns(
            vec![col("id", "integer"), col("title", "text"), col("body", "text")],
            vec![col("id", "bigint"), col("title", "text"), col("slug", "text")],
            vec!["id".into()],
        );
        assert_eq!(
            task.notes(),
            [
                "Extra columns: slug",
                "Missing columns: body",
                "Different column types: id (integer -> bigint)",
            ]
        );
    }

    #[test]
    fn test_notes_no_fields() {
        let task = task().with_columns(vec![col("a", "text")], vec![col("b", "text")], vec![]);
        assert_eq!(task.notes(), ["No fields to copy"]);
        assert!(task.shared_fields().is_empty());
    }

    #[test]
    fn test_sequence_notes_and_shared() {
        let seq = |name: &str| Sequence::new("public", name, "id");
        let task = task()
            .with_columns(vec![col("id", "integer")], vec![col("id", "integer")], vec!["id".into()])
            .with_sequences(
                vec![seq("posts_id_seq"), seq("legacy_seq")],
                vec![seq("posts_id_seq"), seq("new_seq")],
            );
        assert_eq!(task.shared_sequences(), [seq("posts_id_seq")]);
        assert_eq!(
            task.notes(),
            [
                "Extra sequences: public.new_seq",
                "Missing sequences: public.legacy_seq",
            ]
        );
    }

    #[tokio::test]
    async fn test_no_fields_short_circuits_without_connecting() {
        let task = task().with_columns(vec![col("a", "text")], vec![col("b", "text")], vec![]);
        let mut source = DataSource::new("source", "postgres://localhost/none").unwrap();
        let mut destination = DataSource::new("destination", "postgres://localhost/none").unwrap();

        let result = task.perform(&mut source, &mut destination).await;
        assert!(result.is_success());
        assert_eq!(result.message.as_deref(), Some("No fields to copy"));
        assert!(!source.is_connected());
    }

    #[test]
    fn test_round_secs() {
        assert_eq!(round_secs(Duration::from_millis(1260)), 1.3);
        assert_eq!(round_secs(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_result_serializes_status() {
        let result = TaskResult {
            table: "posts".into(),
            status: TaskStatus::Error,
            message: Some("No primary key on posts".into()),
            category: Some(ErrorCategory::Precondition),
            elapsed_time: 0.1,
            notices: vec![],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["category"], "precondition");
    }
}
