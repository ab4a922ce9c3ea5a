//! Connection manager.
//!
//! The manager owns named connection entries. Each entry is driven by a
//! supervisor task running the state machine of [`state`]; the task opens
//! sessions through the [`Driver`], waits out backoff delays and watches the
//! live session for errors.
//!
//! Consumers never see entries directly. They subscribe to the *selected*
//! connection: the most recently added entry that is currently connected,
//! or `None` when no entry is. Writers and readers queue their work while the
//! selection is `None`.
//!
//! Observers can also follow [`ConnectionEvent`]s, emitted when an entry
//! becomes visible downstream and when it stops being visible.

pub mod state;
pub mod transactions;

pub use state::{ConnectionState, Effect, Input, Transition};
pub use transactions::{TransactionGuard, TransactionTable};

use crate::config::{ConnectionOptions, ReconnectPolicy};
use crate::driver::{Driver, Session, StorageError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 64;

// ============================================================================
// Public types
// ============================================================================

/// Identity of a connection entry. Secrets are redacted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub name: String,
    pub options: ConnectionOptions,
}

/// Visibility changes of connection entries.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The entry connected and is visible downstream
    Added(Arc<ConnectionInfo>),
    /// The entry stopped being visible downstream
    Removed(Arc<ConnectionInfo>),
}

/// Handle to the live session of a connected entry.
#[derive(Clone)]
pub struct ActiveConnection {
    info: Arc<ConnectionInfo>,
    session: Arc<dyn Session>,
    epoch: u64,
    transactions: TransactionTable,
    reports: mpsc::UnboundedSender<(u64, StorageError)>,
    manager: Weak<Inner>,
}

impl ActiveConnection {
    pub fn info(&self) -> &Arc<ConnectionInfo> {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn transactions(&self) -> &TransactionTable {
        &self.transactions
    }

    /// Whether both handles refer to the same session of the same entry.
    pub fn same_session(&self, other: &ActiveConnection) -> bool {
        self.epoch == other.epoch && self.info.name == other.info.name
    }

    /// Report that a statement hit a connection error.
    ///
    /// The connection is withdrawn from consumers before this returns; the
    /// supervisor then reconnects according to the error class.
    pub fn report_error(&self, error: StorageError) {
        let Some(inner) = self.manager.upgrade() else {
            return;
        };

        warn!(
            "Connection '{}' reported a {} error: {}",
            self.info.name,
            error.class(),
            error
        );

        inner.revoke(&self.info.name, self.epoch);
        let _ = self.reports.send((self.epoch, error));
    }
}

impl fmt::Debug for ActiveConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveConnection")
            .field("name", &self.info.name)
            .field("epoch", &self.epoch)
            .finish()
    }
}

// ============================================================================
// Manager
// ============================================================================

struct Entry {
    info: Arc<ConnectionInfo>,
    /// Insertion order, for the selection rule
    order: u64,
    state: ConnectionState,
    active: Option<ActiveConnection>,
    transactions: TransactionTable,
    reports: mpsc::UnboundedSender<(u64, StorageError)>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    entries: HashMap<String, Entry>,
    next_order: u64,
    next_epoch: u64,
}

struct Inner {
    driver: Arc<dyn Driver>,
    defaults: ConnectionOptions,
    policy: ReconnectPolicy,
    shared: Mutex<Shared>,
    selected: watch::Sender<Option<ActiveConnection>>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Owns named connections and publishes the selected one.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        driver: Arc<dyn Driver>,
        defaults: ConnectionOptions,
        policy: ReconnectPolicy,
    ) -> Self {
        let (selected, _) = watch::channel(None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                driver,
                defaults,
                policy,
                shared: Mutex::new(Shared::default()),
                selected,
                events,
            }),
        }
    }

    /// Add a connection entry and start connecting.
    ///
    /// `options` are merged over the manager defaults. An entry with the same
    /// name is removed first. The entry becomes visible only once connected.
    pub async fn add(&self, name: impl Into<String>, options: ConnectionOptions) {
        let name = name.into();
        if self.remove(&name).await {
            debug!("Replaced connection '{}'", name);
        }

        let options = options.merged_over(&self.inner.defaults);
        let info = Arc::new(ConnectionInfo {
            name: name.clone(),
            options: options.redacted(),
        });
        info!("Adding connection '{}': {:?}", name, info.options);

        let (reports, reports_rx) = mpsc::unbounded_channel();
        {
            let mut shared = self.inner.lock();
            let order = shared.next_order;
            shared.next_order += 1;
            shared.entries.insert(
                name.clone(),
                Entry {
                    info,
                    order,
                    state: ConnectionState::Disconnected,
                    active: None,
                    transactions: TransactionTable::new(),
                    reports,
                    task: None,
                },
            );
        }

        let supervisor = Supervisor {
            manager: Arc::downgrade(&self.inner),
            driver: Arc::clone(&self.inner.driver),
            name: name.clone(),
            options,
            reports: reports_rx,
            session: None,
            epoch: 0,
        };
        let task = tokio::spawn(supervisor.run());

        match self.inner.lock().entries.get_mut(&name) {
            Some(entry) => entry.task = Some(task),
            None => task.abort(),
        }
    }

    /// Remove a connection entry, tearing down its session and cancelling
    /// any pending reconnection.
    ///
    /// A [`ConnectionEvent::Removed`] is emitted only if the entry was
    /// visible. Returns whether the entry existed.
    pub async fn remove(&self, name: &str) -> bool {
        let (entry, transition) = {
            let mut shared = self.inner.lock();
            let Some(mut entry) = shared.entries.remove(name) else {
                return false;
            };
            let transition = state::step(&entry.state, Input::Remove, &self.inner.policy);
            entry.state = transition.next.clone();
            if let Some(task) = entry.task.take() {
                task.abort();
            }
            self.inner.reselect(&shared);
            (entry, transition)
        };

        if !entry.transactions.is_empty() {
            warn!(
                "Removing connection '{}' with open transactions: {:?}",
                name,
                entry.transactions.open()
            );
        }

        for effect in transition.effects {
            match effect {
                Effect::Revoke if entry.active.is_some() => {
                    let _ = self
                        .inner
                        .events
                        .send(ConnectionEvent::Removed(Arc::clone(&entry.info)));
                }
                Effect::Disconnect => {
                    if let Some(active) = &entry.active {
                        if let Err(e) = active.session.disconnect().await {
                            debug!("Error disconnecting '{}': {}", name, e);
                        }
                    }
                }
                _ => {}
            }
        }

        info!("Removed connection '{}'", name);
        true
    }

    /// Remove every entry.
    pub async fn shutdown(&self) {
        for name in self.names() {
            self.remove(&name).await;
        }
    }

    /// The selected connection, if any.
    pub fn selected(&self) -> Option<ActiveConnection> {
        self.inner.selected.borrow().clone()
    }

    /// Follow the selected connection.
    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveConnection>> {
        self.inner.selected.subscribe()
    }

    /// Follow visibility changes.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self, name: &str) -> Option<ConnectionState> {
        self.inner.lock().entries.get(name).map(|e| e.state.clone())
    }

    /// Entry names in insertion order.
    pub fn names(&self) -> Vec<String> {
        let shared = self.inner.lock();
        let mut entries: Vec<&Entry> = shared.entries.values().collect();
        entries.sort_by_key(|e| e.order);
        entries.iter().map(|e| e.info.name.clone()).collect()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.inner.policy
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply `input` to entry `name`, performing the effects that only touch
    /// shared state. Returns the transition, or `None` if the entry is gone.
    fn transition(
        self: &Arc<Self>,
        name: &str,
        input: Input,
        session: Option<&Arc<dyn Session>>,
        epoch: &mut u64,
    ) -> Option<Transition> {
        let mut guard = self.lock();
        let Shared {
            entries,
            next_epoch,
            ..
        } = &mut *guard;
        let entry = entries.get_mut(name)?;

        let transition = state::step(&entry.state, input, &self.policy);
        if transition.next != entry.state {
            debug!(
                "Connection '{}': {} -> {}",
                name,
                entry.state.name(),
                transition.next.name()
            );
        }
        entry.state = transition.next.clone();

        for effect in &transition.effects {
            match effect {
                Effect::Publish => {
                    let Some(session) = session else { continue };
                    *next_epoch += 1;
                    *epoch = *next_epoch;
                    entry.active = Some(ActiveConnection {
                        info: Arc::clone(&entry.info),
                        session: Arc::clone(session),
                        epoch: *epoch,
                        transactions: entry.transactions.clone(),
                        reports: entry.reports.clone(),
                        manager: Arc::downgrade(self),
                    });
                    info!("Connection '{}' is connected", name);
                    let _ = self
                        .events
                        .send(ConnectionEvent::Added(Arc::clone(&entry.info)));
                }
                Effect::Revoke => {
                    if entry.active.take().is_some() {
                        let _ = self
                            .events
                            .send(ConnectionEvent::Removed(Arc::clone(&entry.info)));
                    }
                }
                _ => {}
            }
        }

        self.reselect(&guard);
        Some(transition)
    }

    /// Withdraw the session `epoch` of entry `name`, if still visible.
    fn revoke(&self, name: &str, epoch: u64) {
        let mut shared = self.lock();
        let Some(entry) = shared.entries.get_mut(name) else {
            return;
        };
        if entry.active.as_ref().is_some_and(|a| a.epoch == epoch) {
            entry.active = None;
            let _ = self
                .events
                .send(ConnectionEvent::Removed(Arc::clone(&entry.info)));
            self.reselect(&shared);
        }
    }

    /// Publish the most recently added connected entry.
    fn reselect(&self, shared: &Shared) {
        let mut connected: Vec<&Entry> = shared
            .entries
            .values()
            .filter(|e| e.active.is_some())
            .collect();
        connected.sort_by_key(|e| e.order);

        let selected = connected.last().and_then(|e| e.active.clone());

        self.selected.send_if_modified(|current| {
            let unchanged = match (current.as_ref(), selected.as_ref()) {
                (Some(a), Some(b)) => a.same_session(b),
                (None, None) => true,
                _ => false,
            };
            if unchanged {
                return false;
            }
            match &selected {
                Some(active) => {
                    if connected.len() > 1 {
                        debug!(
                            "Selected connection '{}', ignoring {} other connected entries",
                            active.info.name,
                            connected.len() - 1
                        );
                    } else {
                        debug!("Selected connection '{}'", active.info.name);
                    }
                }
                None => debug!("No connection available"),
            }
            *current = selected;
            true
        });
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// Task driving one entry through its state machine.
struct Supervisor {
    manager: Weak<Inner>,
    driver: Arc<dyn Driver>,
    name: String,
    options: ConnectionOptions,
    reports: mpsc::UnboundedReceiver<(u64, StorageError)>,
    session: Option<Arc<dyn Session>>,
    epoch: u64,
}

impl Supervisor {
    async fn run(mut self) {
        let mut input = Input::Start;

        loop {
            let Some(inner) = self.manager.upgrade() else {
                return;
            };
            let Some(transition) =
                inner.transition(&self.name, input, self.session.as_ref(), &mut self.epoch)
            else {
                return;
            };
            drop(inner);

            let mut next = None;
            for effect in transition.effects {
                match effect {
                    Effect::Connect => next = Some(self.connect().await),
                    Effect::Schedule(delay) => {
                        info!(
                            "Reconnecting '{}' in {}ms",
                            self.name,
                            delay.as_millis()
                        );
                        tokio::time::sleep(delay).await;
                        next = Some(Input::BackoffElapsed);
                    }
                    Effect::Disconnect => {
                        if let Some(session) = self.session.take() {
                            tokio::spawn(async move {
                                let _ = session.disconnect().await;
                            });
                        }
                    }
                    Effect::Fail(e) => {
                        error!(
                            "Connection '{}' failed permanently, not retrying: {}",
                            self.name, e
                        );
                        self.session = None;
                    }
                    Effect::Publish | Effect::Revoke => {}
                }
            }

            input = match next {
                Some(input) => input,
                None if transition.next.is_connected() => self.watch_session().await,
                None => return,
            };
        }
    }

    async fn connect(&mut self) -> Input {
        debug!("Connecting '{}'", self.name);
        match self.driver.connect(&self.options).await {
            Ok(session) => {
                self.session = Some(session);
                Input::ConnectSucceeded
            }
            Err(e) => {
                warn!(
                    "Error connecting '{}' ({} error): {}",
                    self.name,
                    e.class(),
                    e
                );
                Input::ConnectFailed(e)
            }
        }
    }

    /// Wait until the live session breaks or a consumer reports an error on it.
    async fn watch_session(&mut self) -> Input {
        let Some(session) = self.session.clone() else {
            return Input::SessionError(StorageError::new(
                "PROTOCOL_CONNECTION_LOST",
                "Session missing",
            ));
        };
        let epoch = self.epoch;
        let reports = &mut self.reports;

        let reported = async move {
            loop {
                match reports.recv().await {
                    Some((reported_epoch, error)) if reported_epoch == epoch => return error,
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        };

        let error = tokio::select! {
            error = session.closed() => error,
            error = reported => error,
        };
        warn!("Connection '{}' lost: {}", self.name, error);
        Input::SessionError(error)
    }
}
