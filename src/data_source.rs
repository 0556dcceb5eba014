//! Common plumbing for the streaming and polling data sources.
use std::{
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    status::StatusTracker,
    store::{DataKind, DataStore, FullDataSet, ItemDescriptor},
    Error, Result,
};

/// A component that keeps a [`DataStore`] up to date from a remote source.
pub trait DataSource: Send + Sync {
    /// Whether the data source has completed its first successful synchronization.
    fn initialized(&self) -> bool;

    /// The startup signal. Resolves once, on the first successful synchronization or on an
    /// unrecoverable error.
    fn startup(&self) -> &StartupSignal;

    /// Stop the data source and wait for its background thread to exit.
    ///
    /// Safe to call more than once and before startup completes.
    fn close(&self) -> Result<()>;
}

/// A one-shot signal reporting the outcome of data source startup.
///
/// Waiting on the signal (with or without a timeout) doesn't affect the data source, which keeps
/// running after a wait times out.
#[derive(Debug, Clone, Default)]
pub struct StartupSignal {
    /// Holds `None` until startup resolves. Holds `Some(Ok(()))` after the first successful
    /// synchronization and `Some(Err(...))` after an unrecoverable error.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl StartupSignal {
    #[allow(missing_docs)]
    pub fn new() -> StartupSignal {
        StartupSignal::default()
    }

    /// Resolve the signal. Only the first call has an effect; returns whether it was this one.
    pub(crate) fn resolve(&self, value: Result<()>) -> bool {
        let (lock, condvar) = &*self.result;
        let mut result = lock
            .lock()
            .expect("thread holding startup lock should not panic");
        if result.is_some() {
            return false;
        }
        *result = Some(value);
        condvar.notify_all();
        true
    }

    /// The outcome, if startup has resolved.
    pub fn try_result(&self) -> Option<Result<()>> {
        self.result.0.lock().ok()?.clone()
    }

    /// Block waiting for startup to resolve.
    pub fn wait(&self) -> Result<()> {
        let (lock, condvar) = &*self.result;
        let mut result = lock.lock().map_err(|_| Error::ThreadPanicked)?;
        loop {
            match &*result {
                Some(result) => return result.clone(),
                None => {
                    result = condvar.wait(result).map_err(|_| Error::ThreadPanicked)?;
                }
            }
        }
    }

    /// Block waiting for startup to resolve for at most `timeout`. Returns `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let (lock, condvar) = &*self.result;
        let result = lock.lock().ok()?;
        let (result, _) = condvar
            .wait_timeout_while(result, timeout, |result| result.is_none())
            .ok()?;
        result.clone()
    }
}

/// The write side of a [`DataStore`] as seen by a data source.
///
/// Store failures are reported to the [`StatusTracker`] as store errors before being returned to
/// the data source. Successful synchronizations are reported as valid by the data source itself,
/// so that it can decide how an event sequence maps onto status changes.
#[derive(Clone)]
pub struct DataStoreUpdates {
    store: Arc<dyn DataStore>,
    status: Arc<StatusTracker>,
}

impl DataStoreUpdates {
    #[allow(missing_docs)]
    pub fn new(store: Arc<dyn DataStore>, status: Arc<StatusTracker>) -> DataStoreUpdates {
        DataStoreUpdates { store, status }
    }

    /// Replace all data.
    pub fn init(&self, data: FullDataSet) -> Result<()> {
        self.store.init(data).map_err(|err| self.store_error(err))
    }

    /// Apply a single versioned update.
    pub fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        self.store
            .upsert(kind, key, item)
            .map_err(|err| self.store_error(err))
    }

    /// Whether the store reports its own availability.
    pub fn is_status_monitoring_enabled(&self) -> bool {
        self.store.is_status_monitoring_enabled()
    }

    #[allow(missing_docs)]
    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    fn store_error(&self, err: Error) -> Error {
        let err = match err {
            Error::Store(_) => err,
            other => Error::Store(other.to_string()),
        };
        self.status.report_error(&err);
        err
    }
}

/// Apply a random jitter to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}
