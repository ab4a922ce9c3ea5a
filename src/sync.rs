//! Table synchronizer.
//!
//! [`TableSync`] wires one [`TableBinding`] to a [`ConnectionManager`], a
//! [`Writer`] and a [`Reader`]. It is the entry point most applications use:
//!
//! ```rust,no_run
//! use mysql_table_sync::{MySqlDriver, SyncConfig, TableSync};
//! use mysql_types::ConverterRegistry;
//! use std::sync::Arc;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = SyncConfig::from_file("sync.toml")?;
//! let (sync, mut emissions) = TableSync::from_config(
//!     &config,
//!     "users",
//!     Arc::new(MySqlDriver::default()),
//!     &ConverterRegistry::default(),
//! )
//! .await?;
//!
//! let record = serde_json::json!({ "id": 1, "name": "Ann" });
//! sync.add(vec![record.as_object().cloned().unwrap_or_default()], Default::default())
//!     .await?;
//! let confirmation = emissions.recv().await;
//! # Ok(())
//! # }
//! ```

use crate::binding::TableBinding;
use crate::config::SyncConfig;
use crate::connection::ConnectionManager;
use crate::driver::Driver;
use crate::error::{Result, SyncError};
use crate::read::{FetchResult, Reader};
use crate::write::{Emission, Writer};
use anyhow::Context;
use mysql_types::ConverterRegistry;
use std::sync::Arc;
use sync_core::{Options, Query, Record, Update};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// Keeps one MySQL table in sync with add, remove and update batches.
pub struct TableSync {
    binding: Arc<TableBinding>,
    manager: ConnectionManager,
    writer: Writer,
    reader: Reader,
    tasks: Vec<JoinHandle<()>>,
}

impl TableSync {
    /// Synchronizer for `binding` over the connections of `manager`.
    ///
    /// Confirmations and error records arrive on the returned receiver.
    pub fn new(
        binding: TableBinding,
        manager: ConnectionManager,
        capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Emission>) {
        let binding = Arc::new(binding);
        let (emissions, receiver) = mpsc::unbounded_channel();

        let (writer, write_task) =
            Writer::spawn(binding.clone(), manager.subscribe(), emissions, capacity);
        let (reader, read_task) = Reader::spawn(binding.clone(), manager.subscribe(), capacity);

        let sync = Self {
            binding,
            manager,
            writer,
            reader,
            tasks: vec![write_task, read_task],
        };
        (sync, receiver)
    }

    /// Synchronizer for table `table` of `config`, connecting every
    /// configured connection entry in order.
    pub async fn from_config(
        config: &SyncConfig,
        table: &str,
        driver: Arc<dyn Driver>,
        registry: &ConverterRegistry,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<Emission>)> {
        let table_config = config
            .table(table)
            .ok_or_else(|| SyncError::TableNotFound(table.to_string()))?;
        let binding = TableBinding::from_config(table_config, registry)
            .map_err(SyncError::from)
            .with_context(|| format!("Invalid binding for table '{table}'"))?;

        let manager =
            ConnectionManager::new(driver, config.defaults.clone(), config.reconnect.clone());
        for entry in &config.connections {
            manager.add(entry.name.clone(), entry.options.clone()).await;
        }

        info!(
            "Synchronizing table '{}' over {} connection(s)",
            table,
            config.connections.len()
        );
        Ok(Self::new(binding, manager, config.queue_capacity))
    }

    pub fn binding(&self) -> &TableBinding {
        &self.binding
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub async fn add(&self, values: Vec<Record>, options: Options) -> Result<()> {
        self.writer.add(values, options).await
    }

    pub async fn remove(&self, values: Vec<Record>, options: Options) -> Result<()> {
        self.writer.remove(values, options).await
    }

    pub async fn update(&self, updates: Vec<Update>, options: Options) -> Result<()> {
        self.writer.update(updates, options).await
    }

    /// Wait until every write submitted so far has been processed.
    pub async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }

    pub async fn fetch(&self, query: Option<Query>) -> Result<oneshot::Receiver<FetchResult>> {
        self.reader.fetch(query).await
    }

    pub async fn fetch_all(&self, query: Option<Query>) -> Result<Vec<Record>> {
        self.reader.fetch_all(query).await
    }

    /// Close every connection and stop the workers. Queued work is dropped.
    pub async fn shutdown(self) {
        self.manager.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
        info!("Stopped synchronizing table '{}'", self.binding.name());
    }
}
