//! In-memory driver for tests.
//!
//! [`FakeDriver`] records every statement it receives and replays scripted
//! outcomes: failed handshakes, failed statements, query results and broken
//! sessions. Clones share the same script and log.

use crate::config::ConnectionOptions;
use crate::driver::{Driver, ResultSet, Session, StorageError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

#[derive(Default)]
struct FakeState {
    connect_failures: VecDeque<StorageError>,
    statement_failures: VecDeque<StorageError>,
    results: VecDeque<ResultSet>,
    executed: Vec<String>,
    connects: usize,
    sessions: Vec<watch::Sender<Option<StorageError>>>,
}

/// Scriptable in-memory [`Driver`].
#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next handshakes fail with `errors`, in order; later ones succeed.
    pub fn fail_connects(&self, errors: impl IntoIterator<Item = StorageError>) {
        self.lock().connect_failures.extend(errors);
    }

    /// The next statements fail with `errors`, in order.
    pub fn fail_statements(&self, errors: impl IntoIterator<Item = StorageError>) {
        self.lock().statement_failures.extend(errors);
    }

    /// Result of the next query; queries without a scripted result return no rows.
    pub fn push_result(&self, result: ResultSet) {
        self.lock().results.push_back(result);
    }

    /// Break every open session with `error`.
    pub fn break_sessions(&self, error: StorageError) {
        let sessions = std::mem::take(&mut self.lock().sessions);
        for session in sessions {
            let _ = session.send(Some(error.clone()));
        }
    }

    /// Statements received so far, failed ones included.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    pub fn clear_executed(&self) {
        self.lock().executed.clear();
    }

    /// Number of handshakes attempted.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Driver for FakeDriver {
    async fn connect(&self, _options: &ConnectionOptions) -> Result<Arc<dyn Session>, StorageError> {
        let mut state = self.lock();
        state.connects += 1;
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }

        let (broken, closed) = watch::channel(None);
        state.sessions.push(broken);
        Ok(Arc::new(FakeSession {
            driver: self.clone(),
            closed,
        }))
    }
}

struct FakeSession {
    driver: FakeDriver,
    closed: watch::Receiver<Option<StorageError>>,
}

impl FakeSession {
    /// Log the statement and return its scripted failure, if any.
    fn record(&self, sql: &str) -> Result<(), StorageError> {
        let mut state = self.driver.lock();
        state.executed.push(sql.to_string());

        if let Some(error) = self.closed.borrow().clone() {
            return Err(error);
        }
        match state.statement_failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn execute(&self, sql: &str) -> Result<u64, StorageError> {
        self.record(sql)?;
        Ok(1)
    }

    async fn query(&self, sql: &str) -> Result<ResultSet, StorageError> {
        self.record(sql)?;
        Ok(self.driver.lock().results.pop_front().unwrap_or_default())
    }

    async fn closed(&self) -> StorageError {
        let mut closed = self.closed.clone();
        let error = match closed.wait_for(|e| e.is_some()).await {
            Ok(error) => error.clone(),
            Err(_) => None,
        };
        match error {
            Some(error) => error,
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_outcomes() {
        let driver = FakeDriver::new();
        driver.fail_connects([StorageError::new("ECONNREFUSED", "refused")]);
        driver.fail_statements([StorageError::new("ER_DUP_ENTRY", "dup").with_errno(1062)]);

        let options = ConnectionOptions::default();
        assert_eq!(
            driver.connect(&options).await.err().map(|e| e.code),
            Some("ECONNREFUSED".to_string())
        );

        let session = driver.connect(&options).await.unwrap();
        assert_eq!(
            session.execute("INSERT 1").await.unwrap_err().errno,
            Some(1062)
        );
        assert_eq!(session.execute("INSERT 2").await.unwrap(), 1);
        assert!(session.query("SELECT 1").await.unwrap().rows.is_empty());

        assert_eq!(driver.executed(), vec!["INSERT 1", "INSERT 2", "SELECT 1"]);
        assert_eq!(driver.connects(), 2);
    }

    #[tokio::test]
    async fn test_break_sessions() {
        let driver = FakeDriver::new();
        let session = driver.connect(&ConnectionOptions::default()).await.unwrap();

        driver.break_sessions(StorageError::new("PROTOCOL_CONNECTION_LOST", "gone"));

        assert_eq!(session.closed().await.code, "PROTOCOL_CONNECTION_LOST");
        assert_eq!(
            session.execute("DELETE").await.unwrap_err().code,
            "PROTOCOL_CONNECTION_LOST"
        );
    }
}
