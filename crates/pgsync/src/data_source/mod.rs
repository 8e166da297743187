//! One database endpoint and its connection.
//!
//! A [`DataSource`] connects lazily on first use and remembers which worker
//! it was opened for. Handing it to another worker forces a reconnect, so a
//! live client is never driven from two workers at once. Catalog lookups
//! live in [`catalog`].

pub mod catalog;
pub mod tls;
pub mod url;

pub use tls::{SslMode, TlsBuilder};
pub use url::{resolve_url, Endpoint};

use crate::error::{Result, SyncError};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_postgres::types::ToSql;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Row, Socket};
use tracing::{debug, warn};

/// Identifies the worker a connection belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerContext {
    pub process: u32,
    pub slot: usize,
}

impl WorkerContext {
    pub fn new(slot: usize) -> Self {
        Self {
            process: std::process::id(),
            slot,
        }
    }

    /// Context of the coordinating task.
    pub fn main() -> Self {
        Self::new(0)
    }
}

/// Marks who opened a transaction. Only the opener commits or rolls back.
#[must_use]
#[derive(Debug)]
pub struct TransactionScope {
    owned: bool,
}

/// Metadata cached per data source for the length of a run.
#[derive(Debug, Clone, Default)]
pub(crate) struct Cache {
    pub search_path: Option<Vec<String>>,
    pub tables: Option<Vec<crate::core::Table>>,
    pub server_version: Option<i32>,
}

/// A database endpoint with at most one live connection.
pub struct DataSource {
    label: &'static str,
    endpoint: Endpoint,
    client: Option<Client>,
    owner: Option<WorkerContext>,
    in_transaction: bool,
    notices: Arc<Mutex<Vec<String>>>,
    pub(crate) cache: Cache,
}

impl std::fmt::Debug for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSource")
            .field("label", &self.label)
            .field("endpoint", &self.endpoint.describe())
            .field("connected", &self.client.is_some())
            .field("owner", &self.owner)
            .finish()
    }
}

impl DataSource {
    /// Parse an already resolved URL. Does not connect.
    pub fn new(label: &'static str, url: &str) -> Result<Self> {
        Ok(Self::from_endpoint(label, Endpoint::parse(url)?))
    }

    pub fn from_endpoint(label: &'static str, endpoint: Endpoint) -> Self {
        Self {
            label,
            endpoint,
            client: None,
            owner: None,
            in_transaction: false,
            notices: Arc::new(Mutex::new(Vec::new())),
            cache: Cache::default(),
        }
    }

    /// A disconnected copy for another worker, sharing cached metadata.
    pub fn detached(&self) -> Self {
        let mut copy = Self::from_endpoint(self.label, self.endpoint.clone());
        copy.cache = self.cache.clone();
        copy
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Claim the data source for a worker, dropping a connection opened by another.
    pub fn reconnect_if_needed(&mut self, ctx: WorkerContext) {
        if self.owner != Some(ctx) {
            if self.client.is_some() {
                debug!("{}: reconnecting for worker {}", self.label, ctx.slot);
                self.close();
            }
            self.owner = Some(ctx);
        }
    }

    /// Connect if not connected yet.
    pub async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }

        let config = self.endpoint.config().clone();
        let notices = Arc::clone(&self.notices);
        let client = match TlsBuilder::new(self.endpoint.ssl_mode()).build()? {
            None => {
                let (client, connection) = config.connect(NoTls).await.map_err(SyncError::Connection)?;
                drive(connection, notices, self.label);
                client
            }
            Some(tls) => {
                let (client, connection) = config.connect(tls).await.map_err(SyncError::Connection)?;
                drive(connection, notices, self.label);
                client
            }
        };

        debug!("{}: connected to {}", self.label, self.endpoint.describe());
        self.client = Some(client);
        self.in_transaction = false;
        if self.owner.is_none() {
            self.owner = Some(WorkerContext::main());
        }
        Ok(())
    }

    /// The live client, connecting first if needed.
    pub async fn client(&mut self) -> Result<&Client> {
        self.connect().await?;
        self.client
            .as_ref()
            .ok_or_else(|| SyncError::unexpected(crate::error::ErrorCategory::Connectivity, "not connected"))
    }

    /// Drop the connection. An open transaction is rolled back by the server.
    pub fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("{}: closed connection", self.label);
        }
        self.in_transaction = false;
    }

    /// Run a statement without parameters, returning affected rows.
    pub async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.execute_params(sql, &[]).await
    }

    pub async fn execute_params(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        debug!("{}: {}", self.label, sql);
        let client = self.client().await?;
        Ok(client.execute(sql, params).await?)
    }

    pub async fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        debug!("{}: {}", self.label, sql);
        let client = self.client().await?;
        Ok(client.query(sql, params).await?)
    }

    pub async fn query_one(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Row> {
        debug!("{}: {}", self.label, sql);
        let client = self.client().await?;
        Ok(client.query_one(sql, params).await?)
    }

    /// Open a transaction unless one is already open.
    pub async fn begin(&mut self) -> Result<TransactionScope> {
        self.begin_with("BEGIN").await
    }

    /// As [`begin`](Self::begin) with a custom statement, e.g. an isolation level.
    pub async fn begin_with(&mut self, statement: &str) -> Result<TransactionScope> {
        if self.in_transaction {
            return Ok(TransactionScope { owned: false });
        }
        self.execute(statement).await?;
        self.in_transaction = true;
        Ok(TransactionScope { owned: true })
    }

    pub async fn commit(&mut self, scope: TransactionScope) -> Result<()> {
        if scope.owned {
            self.in_transaction = false;
            self.execute("COMMIT").await?;
        }
        Ok(())
    }

    pub async fn rollback(&mut self, scope: TransactionScope) -> Result<()> {
        if scope.owned {
            self.in_transaction = false;
            if self.client.is_some() {
                self.execute("ROLLBACK").await?;
            }
        }
        Ok(())
    }

    /// Commit on success, roll back on failure, and pass the result through.
    pub async fn finish<T>(&mut self, scope: TransactionScope, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit(scope).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.rollback(scope).await {
                    warn!("{}: rollback failed: {}", self.label, rollback);
                }
                Err(e)
            }
        }
    }

    /// Set a savepoint in the open transaction. Returns false, doing nothing,
    /// when no transaction is open.
    pub async fn savepoint(&mut self, name: &str) -> Result<bool> {
        if !self.in_transaction {
            return Ok(false);
        }
        self.execute(&format!("SAVEPOINT {}", name)).await?;
        Ok(true)
    }

    /// Release a savepoint, first undoing its work when `rollback` is set.
    pub async fn release_savepoint(&mut self, name: &str, rollback: bool) -> Result<()> {
        if rollback {
            self.execute(&format!("ROLLBACK TO SAVEPOINT {}", name)).await?;
        }
        self.execute(&format!("RELEASE SAVEPOINT {}", name)).await?;
        Ok(())
    }

    /// Forget notices received so far.
    pub fn clear_notices(&self) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.clear();
        }
    }

    /// Notices received since the last call.
    pub fn take_notices(&self) -> Vec<String> {
        match self.notices.lock() {
            Ok(mut notices) => std::mem::take(&mut *notices),
            Err(_) => Vec::new(),
        }
    }
}

/// Run the connection on its own task, collecting server notices.
fn drive<T>(mut connection: Connection<Socket, T>, notices: Arc<Mutex<Vec<String>>>, label: &'static str)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notice(notice)) => {
                    if let Ok(mut notices) = notices.lock() {
                        notices.push(notice.message().trim().to_string());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("{}: connection error: {}", label, e);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_does_not_connect() {
        let ds = DataSource::new("source", "postgres://localhost/pgsync_test").unwrap();
        assert!(!ds.is_connected());
        assert!(!ds.in_transaction());
    }

    #[test]
    fn test_reconnect_if_needed_claims_owner() {
        let mut ds = DataSource::new("source", "postgres://localhost/pgsync_test").unwrap();
        let worker = WorkerContext::new(3);
        ds.reconnect_if_needed(worker);
        assert_eq!(ds.owner, Some(worker));

        // same context keeps ownership
        ds.reconnect_if_needed(worker);
        assert_eq!(ds.owner, Some(worker));

        ds.reconnect_if_needed(WorkerContext::new(4));
        assert_eq!(ds.owner.map(|o| o.slot), Some(4));
    }

    #[test]
    fn test_detached_shares_cache() {
        let mut ds = DataSource::new("destination", "pgsync_test").unwrap();
        ds.cache.search_path = Some(vec!["public".into()]);
        let copy = ds.detached();
        assert_eq!(copy.cache.search_path, Some(vec!["public".to_string()]));
        assert!(copy.owner.is_none());
    }

    #[test]
    fn test_notices_drain() {
        let ds = DataSource::new("source", "pgsync_test").unwrap();
        ds.notices.lock().unwrap().push("truncate cascades to table \"comments\"".into());
        assert_eq!(ds.take_notices().len(), 1);
        assert!(ds.take_notices().is_empty());
    }

    #[tokio::test]
    async fn test_unowned_scope_is_noop() {
        let mut ds = DataSource::new("source", "pgsync_test").unwrap();
        ds.in_transaction = true;
        let scope = ds.begin().await.unwrap();
        assert!(!scope.owned);
        ds.commit(scope).await.unwrap();
        // the outer transaction stays open
        assert!(ds.in_transaction());
    }
}
