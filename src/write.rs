//! Write synchronizer.
//!
//! [`Writer`] turns add, remove and update batches into SQL against the
//! selected connection. Batches go through a bounded FIFO queue drained by a
//! single worker task, so statements reach the database in submission order,
//! across reconnections included.
//!
//! Outcomes are reported on an [`Emission`] channel:
//!
//! - a confirmation once the statement succeeded
//! - an [`ErrorRecord`] when the batch was rejected or the database refused it
//!
//! Connection-class failures are never reported. The worker hands the error
//! to the connection manager and resubmits the same work once a connection is
//! selected again.

pub mod statements;

use crate::binding::TableBinding;
use crate::connection::ActiveConnection;
use crate::driver::StorageError;
use crate::error::{ErrorRecord, Result, SyncError};
use serde_json::Value;
use statements::{Rejection, RowUpdate};
use std::collections::VecDeque;
use std::sync::Arc;
use sync_core::{Operation, Options, Record, Update};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Outcome of a batch, as seen downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Values as stored: declared attributes only, missing ones `null`
    Added { values: Vec<Record>, options: Options },
    Removed { values: Vec<Record>, options: Options },
    /// Updates that were applied, no-ops included
    Updated { updates: Vec<Update>, options: Options },
    Error { error: ErrorRecord, options: Options },
}

impl Emission {
    pub fn options(&self) -> &Options {
        match self {
            Emission::Added { options, .. }
            | Emission::Removed { options, .. }
            | Emission::Updated { options, .. }
            | Emission::Error { options, .. } => options,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Emission::Error { .. })
    }
}

// ============================================================================
// Jobs
// ============================================================================

enum Work {
    /// Outcome known without touching the database
    Emit(Emission),
    Insert {
        sql: String,
        values: Vec<Record>,
        emit_values: Vec<Record>,
    },
    Delete {
        sql: String,
        values: Vec<Record>,
    },
    Update {
        updates: Vec<Update>,
        remaining: VecDeque<RowUpdate>,
        /// Positions of applied updates
        applied: Vec<usize>,
        failed: usize,
    },
    Flush(oneshot::Sender<()>),
}

struct Job {
    options: Options,
    work: Work,
}

impl Job {
    fn add(binding: &TableBinding, values: Vec<Record>, options: Options) -> Self {
        let work = if values.is_empty() {
            Work::Emit(Emission::Added {
                values,
                options: options.clone(),
            })
        } else {
            match statements::insert(binding, &values) {
                Ok((sql, emit_values)) => Work::Insert {
                    sql,
                    values,
                    emit_values,
                },
                Err(rejection) => rejected(binding, Operation::Add, rejection, &values, &options),
            }
        };
        Self { options, work }
    }

    fn remove(binding: &TableBinding, values: Vec<Record>, options: Options) -> Self {
        let work = if values.is_empty() {
            Work::Emit(Emission::Removed {
                values,
                options: options.clone(),
            })
        } else {
            match statements::delete(binding, &values) {
                Ok(sql) => Work::Delete { sql, values },
                Err(rejection) => {
                    rejected(binding, Operation::Remove, rejection, &values, &options)
                }
            }
        };
        Self { options, work }
    }

    fn update(binding: &TableBinding, updates: Vec<Update>, options: Options) -> Self {
        let work = match statements::update(binding, &updates) {
            // nothing changed
            Ok(rows) if rows.is_empty() => Work::Emit(Emission::Updated {
                updates,
                options: options.clone(),
            }),
            Ok(rows) => {
                let pending: Vec<usize> = rows.iter().map(|r| r.position).collect();
                Work::Update {
                    applied: (0..updates.len()).filter(|p| !pending.contains(p)).collect(),
                    remaining: rows.into(),
                    updates,
                    failed: 0,
                }
            }
            Err(rejection) => {
                let values = update_values(&updates);
                let pairs: Vec<Record> = values
                    .iter()
                    .filter_map(|v| v.as_object().cloned())
                    .collect();
                let record = rejection_record(binding, Operation::Update, &rejection, &pairs)
                    .with_batch(values, &options);
                Work::Emit(Emission::Error {
                    error: record,
                    options: options.clone(),
                })
            }
        };
        Self { options, work }
    }

    fn needs_connection(&self) -> bool {
        !matches!(self.work, Work::Emit(_) | Work::Flush(_))
    }
}

fn rejected(
    binding: &TableBinding,
    operation: Operation,
    rejection: Rejection,
    values: &[Record],
    options: &Options,
) -> Work {
    let record = rejection_record(binding, operation, &rejection, values)
        .with_batch(values.iter().cloned().map(Value::Object).collect(), options);
    Work::Emit(Emission::Error {
        error: record,
        options: options.clone(),
    })
}

fn rejection_record(
    binding: &TableBinding,
    operation: Operation,
    rejection: &Rejection,
    values: &[Record],
) -> ErrorRecord {
    let empty = Record::new();
    let value = values.get(rejection.position()).unwrap_or(&empty);

    match rejection {
        Rejection::NullKey {
            position,
            attribute,
        } => ErrorRecord::null_key(binding.name(), operation, *position, attribute, value),
        Rejection::InvalidValue {
            position,
            attribute,
            message,
        } => ErrorRecord::invalid_value(
            binding.name(),
            operation,
            *position,
            attribute,
            value,
            message,
        ),
    }
}

fn update_values(updates: &[Update]) -> Vec<Value> {
    updates
        .iter()
        .map(|u| serde_json::to_value(u).unwrap_or(Value::Null))
        .collect()
}

// ============================================================================
// Writer
// ============================================================================

/// Handle to a write worker. Dropping every handle stops the worker once
/// its queue is drained.
#[derive(Clone)]
pub struct Writer {
    binding: Arc<TableBinding>,
    jobs: mpsc::Sender<Job>,
}

impl Writer {
    /// Spawn the worker for `binding`.
    ///
    /// `connection` is the selection published by the connection manager.
    /// At most `capacity` batches wait in the queue; submitting more waits
    /// for room.
    pub fn spawn(
        binding: Arc<TableBinding>,
        connection: watch::Receiver<Option<ActiveConnection>>,
        emissions: mpsc::UnboundedSender<Emission>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (jobs, queue) = mpsc::channel(capacity.max(1));
        let worker = Worker {
            binding: binding.clone(),
            connection,
            queue,
            emissions,
        };
        let handle = tokio::spawn(worker.run());
        (Self { binding, jobs }, handle)
    }

    pub fn binding(&self) -> &Arc<TableBinding> {
        &self.binding
    }

    /// Insert `values`.
    pub async fn add(&self, values: Vec<Record>, options: Options) -> Result<()> {
        self.submit(Job::add(&self.binding, values, options)).await
    }

    /// Delete the rows keyed like `values`.
    pub async fn remove(&self, values: Vec<Record>, options: Options) -> Result<()> {
        self.submit(Job::remove(&self.binding, values, options)).await
    }

    /// Apply `updates`, each matched on its old key.
    pub async fn update(&self, updates: Vec<Update>, options: Options) -> Result<()> {
        self.submit(Job::update(&self.binding, updates, options)).await
    }

    /// Wait until every batch submitted before has been processed.
    pub async fn flush(&self) -> Result<()> {
        let (done, flushed) = oneshot::channel();
        self.submit(Job {
            options: Options::default(),
            work: Work::Flush(done),
        })
        .await?;
        flushed.await.map_err(|_| SyncError::WorkerStopped("write"))
    }

    async fn submit(&self, job: Job) -> Result<()> {
        self.jobs
            .send(job)
            .await
            .map_err(|_| SyncError::WorkerStopped("write"))
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    binding: Arc<TableBinding>,
    connection: watch::Receiver<Option<ActiveConnection>>,
    queue: mpsc::Receiver<Job>,
    emissions: mpsc::UnboundedSender<Emission>,
}

impl Worker {
    async fn run(mut self) {
        while let Some(mut job) = self.queue.recv().await {
            if !job.needs_connection() {
                self.finish(job.work);
                continue;
            }

            loop {
                let Some(connection) = self.connection().await else {
                    warn!(
                        "Connection manager for table {} is gone, dropping queued writes",
                        self.binding.name()
                    );
                    return;
                };

                match self.execute(&connection, &mut job).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            "Write on {} interrupted ({}), retrying when a connection is available",
                            self.binding.name(),
                            e
                        );
                        connection.report_error(e);
                    }
                }
            }
        }
        debug!("Writer for table {} stopped", self.binding.name());
    }

    /// The selected connection, waiting for one if needed.
    async fn connection(&mut self) -> Option<ActiveConnection> {
        match self.connection.wait_for(Option::is_some).await {
            Ok(selected) => selected.clone(),
            Err(_) => None,
        }
    }

    /// Run the statements of `job`. A transient error leaves `job` holding
    /// what is still to be done.
    async fn execute(
        &mut self,
        connection: &ActiveConnection,
        job: &mut Job,
    ) -> std::result::Result<(), StorageError> {
        let _transaction = job
            .options
            .transaction_id()
            .map(|id| connection.transactions().begin(id));
        let options = &job.options;
        let table = self.binding.name();

        match &mut job.work {
            Work::Insert {
                sql,
                values,
                emit_values,
            } => {
                debug!("{} sql:\n\n  {}\n", table, sql);
                let emission = match connection.session().execute(sql).await {
                    Ok(affected) => {
                        debug!("Inserted {} rows into {}", affected, table);
                        Emission::Added {
                            values: std::mem::take(emit_values),
                            options: options.clone(),
                        }
                    }
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => self.storage_error(Operation::Add, &e, sql, records(values), options),
                };
                self.emit(emission);
            }

            Work::Delete { sql, values } => {
                debug!("{} sql:\n\n  {}\n", table, sql);
                let emission = match connection.session().execute(sql).await {
                    Ok(affected) => {
                        debug!("Deleted {} rows from {}", affected, table);
                        Emission::Removed {
                            values: std::mem::take(values),
                            options: options.clone(),
                        }
                    }
                    Err(e) if e.is_transient() => return Err(e),
                    Err(e) => {
                        self.storage_error(Operation::Remove, &e, sql, records(values), options)
                    }
                };
                self.emit(emission);
            }

            Work::Update {
                updates,
                remaining,
                applied,
                failed,
            } => {
                while let Some(row) = remaining.front() {
                    debug!("{} sql:\n\n  {}\n", table, row.sql);
                    match connection.session().execute(&row.sql).await {
                        Ok(affected) => {
                            debug!("Updated {} rows in {}", affected, table);
                            applied.push(row.position);
                        }
                        Err(e) if e.is_transient() => return Err(e),
                        Err(e) => {
                            let value = update_values(&updates[row.position..=row.position]);
                            let emission =
                                self.storage_error(Operation::Update, &e, &row.sql, value, options);
                            self.emit(emission);
                            *failed += 1;
                        }
                    }
                    remaining.pop_front();
                }

                if !applied.is_empty() || *failed == 0 {
                    applied.sort_unstable();
                    self.emit(Emission::Updated {
                        updates: applied.iter().map(|&p| updates[p].clone()).collect(),
                        options: options.clone(),
                    });
                }
            }

            Work::Emit(_) | Work::Flush(_) => {}
        }

        Ok(())
    }

    fn storage_error(
        &self,
        operation: Operation,
        error: &StorageError,
        sql: &str,
        values: Vec<Value>,
        options: &Options,
    ) -> Emission {
        error!(
            "Unable to {} {}, code: {}, number: {:?}, sqlState: {:?}, message: {}",
            operation,
            self.binding.name(),
            error.code,
            error.errno,
            error.sql_state,
            error.message
        );
        Emission::Error {
            error: ErrorRecord::storage(self.binding.name(), operation, error, sql)
                .with_batch(values, options),
            options: options.clone(),
        }
    }

    fn finish(&self, work: Work) {
        match work {
            Work::Emit(emission) => self.emit(emission),
            Work::Flush(done) => {
                let _ = done.send(());
            }
            _ => {}
        }
    }

    fn emit(&self, emission: Emission) {
        if emission.is_error() {
            debug!("Emitting error record for table {}", self.binding.name());
        }
        let _ = self.emissions.send(emission);
    }
}

fn records(values: &[Record]) -> Vec<Value> {
    values.iter().cloned().map(Value::Object).collect()
}
