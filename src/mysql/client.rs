//! MySQL client
//!
//! [`MySqlDriver`] opens one `mysql_async::Conn` per session. Statements on a
//! session are serialized by a mutex around the connection, so they complete
//! in submission order. A connection-class failure marks the session broken,
//! which resolves [`Session::closed`] for the connection supervisor. While
//! someone waits on `closed`, the session is pinged periodically so a
//! connection dropped while idle is noticed before the next statement.

use crate::config::ConnectionOptions;
use crate::driver::{ColumnMeta, Driver, ErrorClass, ResultSet, Session, StorageError};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, DriverError, IoError, Opts, OptsBuilder, Row, ServerError, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// [`Driver`] backed by `mysql_async`.
#[derive(Debug, Clone)]
pub struct MySqlDriver {
    connect_timeout: Duration,
    ping_interval: Duration,
}

impl Default for MySqlDriver {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl MySqlDriver {
    /// Driver using `connect_timeout` unless the options set their own.
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }

    /// How often idle sessions are checked for a dropped connection.
    pub fn with_ping_interval(mut self, ping_interval: Duration) -> Self {
        self.ping_interval = ping_interval;
        self
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Arc<dyn Session>, StorageError> {
        let opts = mysql_opts(options)?;
        let timeout = options.connect_timeout.unwrap_or(self.connect_timeout);

        let conn = tokio::time::timeout(timeout, Conn::new(opts))
            .await
            .map_err(|_| {
                StorageError::new(
                    "ETIMEDOUT",
                    format!("Connection handshake timed out after {}ms", timeout.as_millis()),
                )
            })?
            .map_err(storage_error)?;

        tracing::debug!("MySQL connection id {}", conn.id());
        Ok(Arc::new(MySqlSession::new(conn, self.ping_interval)))
    }
}

/// Build `mysql_async` options: URL first, then discrete fields on top.
pub fn mysql_opts(options: &ConnectionOptions) -> Result<Opts, StorageError> {
    let mut builder = match &options.url {
        Some(url) => OptsBuilder::from_opts(
            Opts::from_url(url).map_err(|e| StorageError::new("ER_INVALID_URL", e.to_string()))?,
        ),
        None => OptsBuilder::default(),
    };

    if let Some(host) = &options.host {
        builder = builder.ip_or_hostname(host.clone());
    }
    if let Some(port) = options.port {
        builder = builder.tcp_port(port);
    }
    if options.user.is_some() {
        builder = builder.user(options.user.clone());
    }
    if options.password.is_some() {
        builder = builder.pass(options.password.clone());
    }
    if options.database.is_some() {
        builder = builder.db_name(options.database.clone());
    }

    Ok(Opts::from(builder))
}

// ============================================================================
// Session
// ============================================================================

/// One MySQL connection.
pub struct MySqlSession {
    conn: Mutex<Option<Conn>>,
    broken: watch::Sender<Option<StorageError>>,
    ping_interval: Duration,
}

impl MySqlSession {
    pub fn new(conn: Conn, ping_interval: Duration) -> Self {
        let (broken, _) = watch::channel(None);
        Self {
            conn: Mutex::new(Some(conn)),
            broken,
            ping_interval,
        }
    }

    /// Ping the server, marking the session broken if the connection is gone.
    async fn ping(&self) -> Result<(), StorageError> {
        let mut guard = self.conn.lock().await;
        match guard.as_mut() {
            Some(conn) => conn.ping().await.map_err(|e| self.fail(storage_error(e))),
            None => Ok(()),
        }
    }

    /// Record `error`, marking the session broken if it is a connection error.
    fn fail(&self, error: StorageError) -> StorageError {
        if error.class() != ErrorClass::Fatal {
            self.broken.send_replace(Some(error.clone()));
        }
        error
    }

    fn disconnected() -> StorageError {
        StorageError::new(
            "PROTOCOL_ENQUEUE_AFTER_FATAL_ERROR",
            "Cannot enqueue a statement on a closed session",
        )
    }
}

#[async_trait]
impl Session for MySqlSession {
    async fn execute(&self, sql: &str) -> Result<u64, StorageError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::disconnected)?;

        match conn.query_drop(sql).await {
            Ok(()) => Ok(conn.affected_rows()),
            Err(e) => Err(self.fail(storage_error(e))),
        }
    }

    async fn query(&self, sql: &str) -> Result<ResultSet, StorageError> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(Self::disconnected)?;

        let rows: Vec<Row> = conn
            .query(sql)
            .await
            .map_err(|e| self.fail(storage_error(e)))?;

        Ok(result_set(rows))
    }

    async fn closed(&self) -> StorageError {
        let mut broken = self.broken.subscribe();
        let mut ticks = interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let error = loop {
            tokio::select! {
                error = async { broken.wait_for(|e| e.is_some()).await.ok().and_then(|e| e.clone()) } => {
                    break error;
                }
                _ = ticks.tick() => {
                    // a connection-class failure marks the session broken
                    if let Err(e) = self.ping().await {
                        tracing::debug!("Ping failed: {}", e);
                    }
                }
            }
        };
        match error {
            Some(error) => error,
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().await.take();
        match conn {
            Some(conn) => conn.disconnect().await.map_err(storage_error),
            None => Ok(()),
        }
    }
}

fn result_set(rows: Vec<Row>) -> ResultSet {
    let columns = rows
        .first()
        .map(|row| {
            row.columns_ref()
                .iter()
                .map(|c| {
                    ColumnMeta::new(c.name_str().into_owned(), c.column_type())
                        .with_flags(c.flags())
                })
                .collect()
        })
        .unwrap_or_default();

    let rows = rows
        .into_iter()
        .map(|mut row| {
            (0..row.len())
                .map(|i| row.take::<Value, usize>(i).unwrap_or(Value::NULL))
                .collect()
        })
        .collect();

    ResultSet { columns, rows }
}

// ============================================================================
// Errors
// ============================================================================

/// Translate a `mysql_async` error into a classifiable [`StorageError`].
pub fn storage_error(error: mysql_async::Error) -> StorageError {
    match &error {
        mysql_async::Error::Io(IoError::Io(io)) => StorageError::new(io_error_code(io), io.to_string()),
        mysql_async::Error::Driver(DriverError::ConnectionClosed) => {
            StorageError::new("PROTOCOL_CONNECTION_LOST", error.to_string())
        }
        mysql_async::Error::Server(ServerError {
            code,
            message,
            state,
        }) => StorageError::new(server_error_code(*code), message.clone())
            .with_errno(*code)
            .with_sql_state(state.clone()),
        mysql_async::Error::Url(e) => StorageError::new("ER_INVALID_URL", e.to_string()),
        _ => StorageError::new("ER_DRIVER", error.to_string()),
    }
}

fn io_error_code(error: &std::io::Error) -> &'static str {
    use std::io::ErrorKind;

    match error.kind() {
        ErrorKind::ConnectionRefused => "ECONNREFUSED",
        ErrorKind::ConnectionReset => "ECONNRESET",
        ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof | ErrorKind::NotConnected => {
            "PROTOCOL_CONNECTION_LOST"
        }
        ErrorKind::BrokenPipe => "EPIPE",
        ErrorKind::TimedOut => "ETIMEDOUT",
        ErrorKind::HostUnreachable => "EHOSTUNREACH",
        ErrorKind::NetworkUnreachable => "ENETUNREACH",
        _ if error.to_string().contains("failed to lookup address") => "ENOTFOUND",
        _ => "EIO",
    }
}

/// Symbolic name of a server or client error number.
fn server_error_code(code: u16) -> String {
    let name = match code {
        1040 => "ER_CON_COUNT_ERROR",
        1045 => "ER_ACCESS_DENIED_ERROR",
        1048 => "ER_BAD_NULL_ERROR",
        1049 => "ER_BAD_DB_ERROR",
        1054 => "ER_BAD_FIELD_ERROR",
        1062 => "ER_DUP_ENTRY",
        1064 => "ER_PARSE_ERROR",
        1146 => "ER_NO_SUCH_TABLE",
        1205 => "ER_LOCK_WAIT_TIMEOUT",
        1213 => "ER_LOCK_DEADLOCK",
        1264 => "ER_WARN_DATA_OUT_OF_RANGE",
        1292 => "ER_TRUNCATED_WRONG_VALUE",
        1366 => "ER_TRUNCATED_WRONG_VALUE_FOR_FIELD",
        1406 => "ER_DATA_TOO_LONG",
        1451 => "ER_ROW_IS_REFERENCED_2",
        1452 => "ER_NO_REFERENCED_ROW_2",
        2006 => "CR_SERVER_GONE_ERROR",
        2013 => "CR_SERVER_LOST",
        4031 => "ER_CLIENT_INTERACTION_TIMEOUT",
        other => return format!("ER_{other}"),
    };
    name.to_string()
}
