//! Worker pool that runs tasks.
//!
//! Each worker owns its own source and destination connections and pulls
//! tasks from a shared queue. A single worker runs in place on the
//! coordinator's data sources, inside any run-wide transactions.

use crate::config::SyncOptions;
use crate::data_source::{DataSource, WorkerContext};
use crate::error::{ErrorCategory, Result, SyncError};
use crate::task::{Task, TaskResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const TASK_SAVEPOINT: &str = "pgsync_task";

/// Schedules tasks across workers and stops early when asked to.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    fail_fast: bool,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Size the pool from the options. `cancel` stops scheduling new tasks.
    pub fn new(opts: &SyncOptions, cancel: CancellationToken) -> Self {
        let workers = if opts.requires_sequential() {
            if opts.jobs.is_some() {
                warn!("--jobs ignored");
            }
            1
        } else {
            opts.worker_count()
        };
        Self {
            workers,
            fail_fast: opts.fail_fast,
            cancel,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every task, or until a failure under fail-fast or cancellation.
    /// Results come back in task order; abandoned tasks have none.
    pub async fn run(
        &self,
        tasks: Vec<Task>,
        source: &mut DataSource,
        destination: &mut DataSource,
    ) -> Result<Vec<TaskResult>> {
        if self.workers <= 1 || tasks.len() <= 1 {
            Ok(self.run_in_place(tasks, source, destination).await)
        } else {
            self.run_workers(tasks, source, destination).await
        }
    }

    async fn run_in_place(
        &self,
        tasks: Vec<Task>,
        source: &mut DataSource,
        destination: &mut DataSource,
    ) -> Vec<TaskResult> {
        let ctx = WorkerContext::main();
        source.reconnect_if_needed(ctx);
        destination.reconnect_if_needed(ctx);

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            if self.cancel.is_cancelled() {
                break;
            }
            log_start(&task);
            let result = isolated(&task, source, destination).await;
            log_finish(&result);
            let failed = !result.is_success();
            results.push(result);
            if failed && self.fail_fast {
                self.cancel.cancel();
            }
        }
        results
    }

    async fn run_workers(
        &self,
        tasks: Vec<Task>,
        source: &DataSource,
        destination: &DataSource,
    ) -> Result<Vec<TaskResult>> {
        let workers = self.workers.min(tasks.len());
        info!("Syncing {} tables with {} workers", tasks.len(), workers);

        let queue: Arc<Mutex<VecDeque<(usize, Task)>>> =
            Arc::new(Mutex::new(tasks.into_iter().enumerate().collect()));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, TaskResult)>();
        let mut handles = JoinSet::new();

        for slot in 1..=workers {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let cancel = self.cancel.clone();
            let fail_fast = self.fail_fast;
            let mut source = source.detached();
            let mut destination = destination.detached();

            handles.spawn(async move {
                let ctx = WorkerContext::new(slot);
                source.reconnect_if_needed(ctx);
                destination.reconnect_if_needed(ctx);

                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = queue.lock().ok().and_then(|mut queue| queue.pop_front());
                    let Some((index, task)) = next else {
                        break;
                    };
                    log_start(&task);
                    let result = task.perform(&mut source, &mut destination).await;
                    // stop other workers before they pick up another task
                    if fail_fast && !result.is_success() {
                        cancel.cancel();
                    }
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }

                source.close();
                destination.close();
            });
        }
        drop(tx);

        let mut results = Vec::new();
        while let Some((index, result)) = rx.recv().await {
            log_finish(&result);
            results.push((index, result));
        }

        let mut panicked = 0;
        while let Some(joined) = handles.join_next().await {
            if let Err(e) = joined {
                error!("Worker stopped unexpectedly: {}", e);
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(SyncError::unexpected(
                ErrorCategory::Unexpected,
                format!("{} worker(s) stopped unexpectedly", panicked),
            ));
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }
}

/// Run a task so its failure cannot poison a transaction shared with later tasks.
async fn isolated(task: &Task, source: &mut DataSource, destination: &mut DataSource) -> TaskResult {
    let source_savepoint = set_savepoint(source).await;
    let destination_savepoint = set_savepoint(destination).await;

    let result = task.perform(source, destination).await;

    let failed = !result.is_success();
    if source_savepoint {
        release(source, failed).await;
    }
    if destination_savepoint {
        release(destination, failed).await;
    }
    result
}

async fn set_savepoint(data_source: &mut DataSource) -> bool {
    match data_source.savepoint(TASK_SAVEPOINT).await {
        Ok(set) => set,
        Err(e) => {
            warn!("{}: could not set savepoint: {}", data_source.label(), e);
            false
        }
    }
}

async fn release(data_source: &mut DataSource, rollback: bool) {
    if let Err(e) = data_source.release_savepoint(TASK_SAVEPOINT, rollback).await {
        warn!("{}: could not release savepoint: {}", data_source.label(), e);
    }
}

fn log_start(task: &Task) {
    match &task.sql {
        Some(sql) => info!("Syncing {} {}", task.display_name, sql),
        None => info!("Syncing {}", task.display_name),
    }
}

fn log_finish(result: &TaskResult) {
    let line = finish_line(result);
    if result.is_success() {
        info!("{}", line);
    } else {
        error!("{}", line);
    }
}

/// `✔ posts - 1.2s`, or the first line of the message in parentheses.
pub fn finish_line(result: &TaskResult) -> String {
    let status = if result.is_success() { "✔" } else { "✖" };
    let detail = match &result.message {
        Some(message) => format!("({})", message.lines().next().unwrap_or_default().trim()),
        None => format!("- {:.1}s", result.elapsed_time),
    };
    format!("{} {} {}", status, result.table, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    fn result(status: TaskStatus, message: Option<&str>) -> TaskResult {
        TaskResult {
            table: "posts".into(),
            status,
            message: message.map(String::from),
            category: None,
            elapsed_time: 1.2,
            notices: vec![],
        }
    }

    #[test]
    fn test_finish_line() {
        assert_eq!(finish_line(&result(TaskStatus::Success, None)), "✔ posts - 1.2s");
        assert_eq!(
            finish_line(&result(TaskStatus::Error, Some("No primary key on posts\nmore"))),
            "✖ posts (No primary key on posts)"
        );
        assert_eq!(
            finish_line(&result(TaskStatus::Success, Some("No fields to copy"))),
            "✔ posts (No fields to copy)"
        );
    }

    #[test]
    fn test_sequential_modes_use_one_worker() {
        let opts = SyncOptions {
            in_batches: true,
            jobs: Some(8),
            ..Default::default()
        };
        assert_eq!(WorkerPool::new(&opts, CancellationToken::new()).workers(), 1);

        let opts = SyncOptions {
            defer_constraints: true,
            ..Default::default()
        };
        assert_eq!(WorkerPool::new(&opts, CancellationToken::new()).workers(), 1);

        let opts = SyncOptions {
            jobs: Some(3),
            ..Default::default()
        };
        assert_eq!(WorkerPool::new(&opts, CancellationToken::new()).workers(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_pool_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pool = WorkerPool::new(&SyncOptions::default(), cancel);
        let mut source = DataSource::new("source", "postgres://localhost/a").unwrap();
        let mut destination = DataSource::new("destination", "postgres://localhost/b").unwrap();

        let task = Task::new(
            crate::core::Table::new("public", "posts"),
            "posts".into(),
            None,
            Arc::new(SyncOptions::default()),
            Arc::new(Default::default()),
        );
        let results = pool
            .run(vec![task.clone(), task], &mut source, &mut destination)
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
