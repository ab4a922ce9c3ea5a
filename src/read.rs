//! Read fetcher.
//!
//! A fetch selects the declared columns of the table, filtered by the SQL
//! compiled from the query, and converts rows back to records. The compiled
//! filter may let extra rows through, so the query is evaluated again on the
//! converted records before they are delivered.
//!
//! Fetches wait in a FIFO queue while no connection is selected. A fetch
//! interrupted by a connection error is run again; any other failure delivers
//! an empty result.

use crate::binding::TableBinding;
use crate::connection::ActiveConnection;
use crate::driver::StorageError;
use crate::error::{Result, SyncError};
use crate::where_clause::where_clause;
use std::sync::Arc;
use sync_core::{Query, Record};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Rows delivered for one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    pub rows: Vec<Record>,
    /// Always true: a fetch is delivered in one piece
    pub complete: bool,
}

impl FetchResult {
    fn complete(rows: Vec<Record>) -> Self {
        Self {
            rows,
            complete: true,
        }
    }
}

struct FetchRequest {
    query: Option<Query>,
    reply: oneshot::Sender<FetchResult>,
}

/// `SELECT` of `query` against `binding`, or `None` when nothing can match.
pub fn select_sql(binding: &TableBinding, query: Option<&Query>) -> Option<String> {
    let filter = match query {
        Some(query) if query.is_empty() => return None,
        Some(query) => where_clause(query, binding),
        None => String::new(),
    };

    Some(format!(
        "  SELECT {}\n\n  FROM {}{}",
        binding.select_list(),
        binding.table(),
        filter
    ))
}

/// Handle to a read worker.
#[derive(Clone)]
pub struct Reader {
    requests: mpsc::Sender<FetchRequest>,
}

impl Reader {
    pub fn spawn(
        binding: Arc<TableBinding>,
        connection: watch::Receiver<Option<ActiveConnection>>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (requests, queue) = mpsc::channel(capacity.max(1));
        let worker = Worker {
            binding,
            connection,
            queue,
        };
        (Self { requests }, tokio::spawn(worker.run()))
    }

    /// Queue a fetch of the rows matching `query`, or of every row.
    ///
    /// The result is delivered on the returned receiver.
    pub async fn fetch(&self, query: Option<Query>) -> Result<oneshot::Receiver<FetchResult>> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(FetchRequest { query, reply })
            .await
            .map_err(|_| SyncError::WorkerStopped("read"))?;
        Ok(result)
    }

    /// Fetch and wait for the rows.
    pub async fn fetch_all(&self, query: Option<Query>) -> Result<Vec<Record>> {
        let result = self.fetch(query).await?;
        result
            .await
            .map(|r| r.rows)
            .map_err(|_| SyncError::WorkerStopped("read"))
    }
}

struct Worker {
    binding: Arc<TableBinding>,
    connection: watch::Receiver<Option<ActiveConnection>>,
    queue: mpsc::Receiver<FetchRequest>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(request) = self.queue.recv().await {
            let Some(sql) = select_sql(&self.binding, request.query.as_ref()) else {
                let _ = request.reply.send(FetchResult::complete(Vec::new()));
                continue;
            };

            let rows = loop {
                let Some(connection) = self.connection().await else {
                    warn!(
                        "Connection manager for table {} is gone, dropping queued fetches",
                        self.binding.name()
                    );
                    return;
                };

                match self.select(&connection, &sql).await {
                    Ok(rows) => break rows,
                    Err(e) if e.is_transient() => {
                        warn!(
                            "Fetch on {} interrupted ({}), retrying when a connection is available",
                            self.binding.name(),
                            e
                        );
                        connection.report_error(e);
                    }
                    Err(e) => {
                        error!("Unable to SELECT from {}: {}", self.binding.name(), e);
                        break Vec::new();
                    }
                }
            };

            let rows = match &request.query {
                Some(query) => query.filter(rows),
                None => rows,
            };
            debug!("Fetched {} rows from {}", rows.len(), self.binding.name());

            let _ = request.reply.send(FetchResult::complete(rows));
        }
        debug!("Reader for table {} stopped", self.binding.name());
    }

    async fn connection(&mut self) -> Option<ActiveConnection> {
        match self.connection.wait_for(Option::is_some).await {
            Ok(selected) => selected.clone(),
            Err(_) => None,
        }
    }

    async fn select(
        &self,
        connection: &ActiveConnection,
        sql: &str,
    ) -> std::result::Result<Vec<Record>, StorageError> {
        debug!("{} sql:\n\n{}\n", self.binding.name(), sql);
        let result = connection.session().query(sql).await?;

        match self.binding.records(result) {
            Ok(rows) => Ok(rows),
            Err(e) => {
                error!("Unable to convert rows of {}: {}", self.binding.name(), e);
                Ok(Vec::new())
            }
        }
    }
}
