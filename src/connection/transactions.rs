//! Per-connection table of upstream transactions with statements in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Counts in-flight statements per upstream transaction id.
///
/// Shared by every clone of the connection handle; survives reconnects.
#[derive(Debug, Clone, Default)]
pub struct TransactionTable {
    inner: Arc<Mutex<HashMap<String, usize>>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a statement for transaction `id`; it stays open until the
    /// guard is dropped.
    pub fn begin(&self, id: &str) -> TransactionGuard {
        *self.lock().entry(id.to_string()).or_insert(0) += 1;
        tracing::trace!("Transaction '{}' has a statement in flight", id);

        TransactionGuard {
            table: self.clone(),
            id: id.to_string(),
        }
    }

    /// Number of statements in flight for `id`.
    pub fn in_flight(&self, id: &str) -> usize {
        self.lock().get(id).copied().unwrap_or(0)
    }

    /// Ids of transactions with statements in flight, sorted.
    pub fn open(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn end(&self, id: &str) {
        let mut table = self.lock();
        if let Some(count) = table.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                table.remove(id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Open statement of a transaction; closes it on drop.
#[derive(Debug)]
pub struct TransactionGuard {
    table: TransactionTable,
    id: String,
}

impl TransactionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        self.table.end(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_track_open_transactions() {
        let table = TransactionTable::new();
        assert!(table.is_empty());

        let a1 = table.begin("a");
        let a2 = table.begin("a");
        let b = table.begin("b");
        assert_eq!(table.in_flight("a"), 2);
        assert_eq!(table.open(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(b.id(), "b");

        drop(a1);
        assert_eq!(table.in_flight("a"), 1);
        drop(a2);
        drop(b);
        assert!(table.is_empty());
        assert_eq!(table.in_flight("a"), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let table = TransactionTable::new();
        let clone = table.clone();
        let _guard = clone.begin("t1");
        assert_eq!(table.open(), vec!["t1".to_string()]);
    }
}
