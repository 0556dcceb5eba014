//! Health of the data source connection and of the data store.
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use chrono::{DateTime, Utc};

use crate::Error;

/// Connection state of a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not yet successfully synchronized. Errors while initializing leave the state unchanged.
    Initializing,
    /// Data is up to date.
    Valid,
    /// A previously valid connection failed. The data source keeps retrying and the store keeps
    /// serving the last known data.
    Interrupted,
    /// The data source stopped permanently, either closed or after an unrecoverable error.
    Off,
}

/// Classification of data source errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport-level failure. No HTTP status.
    NetworkError,
    /// The remote service returned a non-2xx status.
    ErrorResponse,
    /// A payload could not be decoded.
    InvalidData,
    /// The data store failed to apply an update.
    StoreError,
    #[allow(missing_docs)]
    Unknown,
}

/// Description of the most recent error.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    #[allow(missing_docs)]
    pub kind: ErrorKind,
    /// HTTP status, for [`ErrorKind::ErrorResponse`].
    pub status_code: Option<u16>,
    #[allow(missing_docs)]
    pub message: String,
    #[allow(missing_docs)]
    pub time: DateTime<Utc>,
}

impl ErrorInfo {
    #[allow(missing_docs)]
    pub fn from_error(error: &Error) -> ErrorInfo {
        ErrorInfo {
            kind: error.kind(),
            status_code: error.status_code(),
            message: error.to_string(),
            time: Utc::now(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "{:?}({}): {}", self.kind, status, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Snapshot of the data source status.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    #[allow(missing_docs)]
    pub state: State,
    /// When `state` was entered. Unchanged by reports that don't change the state.
    pub state_since: DateTime<Utc>,
    #[allow(missing_docs)]
    pub last_error: Option<ErrorInfo>,
}

/// Availability of the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStatus {
    /// Whether the store is currently operational.
    pub available: bool,
    /// Set when the store recovers from an outage and may have lost updates written during it.
    /// The data source should then resynchronize all data.
    pub refresh_needed: bool,
}

/// Handle returned when registering a listener, used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

type StatusListener = Arc<dyn Fn(&Status) + Send + Sync>;
type StoreStatusListener = Arc<dyn Fn(&StoreStatus) + Send + Sync>;

struct Inner {
    status: Status,
    store_status: StoreStatus,
    status_listeners: BTreeMap<ListenerId, StatusListener>,
    store_status_listeners: BTreeMap<ListenerId, StoreStatusListener>,
}

/// Tracks the data source status and store availability, and notifies listeners of changes.
///
/// Listeners are called synchronously on the reporting thread, one report at a time and in the
/// order reports were made. A listener may add or remove listeners, but must not report a status
/// itself.
pub struct StatusTracker {
    inner: Mutex<Inner>,
    // Serializes broadcasts so that listeners observe reports in order.
    dispatch: Mutex<()>,
    next_listener_id: AtomicU64,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    /// Create a tracker in the [`State::Initializing`] state with an available store.
    pub fn new() -> StatusTracker {
        StatusTracker {
            inner: Mutex::new(Inner {
                status: Status {
                    state: State::Initializing,
                    state_since: Utc::now(),
                    last_error: None,
                },
                store_status: StoreStatus {
                    available: true,
                    refresh_needed: false,
                },
                status_listeners: BTreeMap::new(),
                store_status_listeners: BTreeMap::new(),
            }),
            dispatch: Mutex::new(()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("thread holding status lock should not panic")
    }

    fn lock_dispatch(&self) -> std::sync::MutexGuard<'_, ()> {
        self.dispatch
            .lock()
            .expect("thread holding dispatch lock should not panic")
    }

    /// Current data source status.
    pub fn status(&self) -> Status {
        self.lock().status.clone()
    }

    /// Current data store status.
    pub fn store_status(&self) -> StoreStatus {
        self.lock().store_status
    }

    /// Report a new data source state and, optionally, the error that caused it.
    ///
    /// - [`State::Off`] is terminal: later reports are ignored.
    /// - [`State::Interrupted`] while still [`State::Initializing`] keeps the state at
    ///   `Initializing`.
    /// - An error is recorded and listeners notified even if the state doesn't change.
    pub fn update_status(&self, new_state: State, error: Option<ErrorInfo>) {
        let _dispatch = self.lock_dispatch();

        let (status, listeners) = {
            let mut inner = self.lock();
            let old = &inner.status;
            if old.state == State::Off {
                return;
            }

            let new_state = match (old.state, new_state) {
                (State::Initializing, State::Interrupted) => State::Initializing,
                (_, state) => state,
            };

            if new_state == old.state && error.is_none() {
                return;
            }

            let state_since = if new_state == old.state {
                old.state_since
            } else {
                Utc::now()
            };
            let last_error = error.or_else(|| old.last_error.clone());

            inner.status = Status {
                state: new_state,
                state_since,
                last_error,
            };

            (
                inner.status.clone(),
                inner.status_listeners.values().cloned().collect::<Vec<_>>(),
            )
        };

        log::debug!(target: "flagsync",
                    state:debug = status.state;
                    "data source status changed");

        for listener in listeners {
            listener(&status);
        }
    }

    /// Report that the data source received valid data.
    pub fn report_valid(&self) {
        self.update_status(State::Valid, None);
    }

    /// Report a data source error. Recoverable errors interrupt the connection, unrecoverable ones
    /// turn it off.
    pub fn report_error(&self, error: &Error) {
        let state = if error.is_recoverable() {
            State::Interrupted
        } else {
            State::Off
        };
        self.update_status(state, Some(ErrorInfo::from_error(error)));
    }

    /// Report data store availability. Listeners are notified only if the status changed.
    pub fn update_store_status(&self, new_status: StoreStatus) {
        let _dispatch = self.lock_dispatch();

        let listeners = {
            let mut inner = self.lock();
            if inner.store_status == new_status {
                return;
            }
            inner.store_status = new_status;
            inner
                .store_status_listeners
                .values()
                .cloned()
                .collect::<Vec<_>>()
        };

        for listener in listeners {
            listener(&new_status);
        }
    }

    /// Register a listener for data source status changes.
    pub fn add_status_listener(
        &self,
        listener: impl Fn(&Status) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.lock().status_listeners.insert(id, Arc::new(listener));
        id
    }

    /// Register a listener for data store status changes.
    pub fn add_store_status_listener(
        &self,
        listener: impl Fn(&StoreStatus) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = self.next_id();
        self.lock()
            .store_status_listeners
            .insert(id, Arc::new(listener));
        id
    }

    /// Remove a listener of either kind. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        inner.status_listeners.remove(&id).is_some()
            || inner.store_status_listeners.remove(&id).is_some()
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }
}
