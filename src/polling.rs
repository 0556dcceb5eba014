//! Polling data source: periodically fetches the full flag dataset.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{sync_channel, RecvTimeoutError, SyncSender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{
    data_source::{jitter, DataSource, DataStoreUpdates, StartupSignal},
    requestor::FeatureRequestor,
    status::State,
    Error, Result,
};

/// A data source that periodically fetches the full dataset.
///
/// Use [`Client`](crate::Client) with streaming disabled to get one, or start it directly with
/// [`PollingDataSource::start`].
pub struct PollingDataSource {
    join_handle: Mutex<Option<JoinHandle<()>>>,

    /// Used to send a stop command to the poller thread.
    stop_sender: SyncSender<()>,

    startup: StartupSignal,
    initialized: Arc<AtomicBool>,
    updates: DataStoreUpdates,
}

enum PollOutcome {
    Continue,
    Stop,
}

impl PollingDataSource {
    /// Start the poller thread. The first request is made immediately.
    pub fn start(
        requestor: Arc<dyn FeatureRequestor>,
        updates: DataStoreUpdates,
        interval: Duration,
    ) -> Result<PollingDataSource> {
        let (stop_sender, stop_receiver) = sync_channel::<()>(1);

        let startup = StartupSignal::new();
        let initialized = Arc::new(AtomicBool::new(false));

        let join_handle = {
            let startup = startup.clone();
            let initialized = initialized.clone();
            let updates = updates.clone();
            let poll_jitter = interval / 10;

            std::thread::Builder::new()
                .name("flagsync-poller".to_owned())
                .spawn(move || loop {
                    if let PollOutcome::Stop =
                        poll(&*requestor, &updates, &startup, &initialized)
                    {
                        return;
                    }

                    let timeout = jitter(interval, poll_jitter);
                    match stop_receiver.recv_timeout(timeout) {
                        Err(RecvTimeoutError::Timeout) => {
                            // Timed out. Loop to fetch new data.
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "flagsync", "poller thread received stop command");
                            return;
                        }
                    }
                })?
        };

        log::info!(target: "flagsync",
                   interval:debug = interval;
                   "started polling for flag data");

        Ok(PollingDataSource {
            join_handle: Mutex::new(Some(join_handle)),
            stop_sender,
            startup,
            initialized,
            updates,
        })
    }
}

fn poll(
    requestor: &dyn FeatureRequestor,
    updates: &DataStoreUpdates,
    startup: &StartupSignal,
    initialized: &AtomicBool,
) -> PollOutcome {
    log::debug!(target: "flagsync", "fetching flag data");

    match requestor.get_all_data() {
        Ok(data) => {
            // Store failures are reported by `updates`. Try again on the next poll.
            if updates.init(data.into()).is_ok() {
                updates.status().report_valid();
                if !initialized.swap(true, Ordering::AcqRel) {
                    log::info!(target: "flagsync", "initialized flag data from polling");
                }
                startup.resolve(Ok(()));
            }
            PollOutcome::Continue
        }
        Err(err) if !err.is_recoverable() => {
            log::error!(target: "flagsync",
                        error:display = err;
                        "unrecoverable error while polling for flag data, giving up");
            updates.status().report_error(&err);
            startup.resolve(Err(err));
            PollOutcome::Stop
        }
        Err(err) => {
            log::warn!(target: "flagsync",
                       error:display = err;
                       "error while polling for flag data, will retry");
            updates.status().report_error(&err);
            PollOutcome::Continue
        }
    }
}

impl DataSource for PollingDataSource {
    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn startup(&self) -> &StartupSignal {
        &self.startup
    }

    fn close(&self) -> Result<()> {
        // Full channel means a stop command is already pending. Disconnected means the thread has
        // exited. Either way there's nothing to do.
        let _ = self.stop_sender.try_send(());

        let join_handle = self
            .join_handle
            .lock()
            .expect("thread holding join handle lock should not panic")
            .take();

        if let Some(join_handle) = join_handle {
            self.updates.status().update_status(State::Off, None);
            join_handle.join().map_err(|_| Error::ThreadPanicked)?;
        }

        Ok(())
    }
}

impl Drop for PollingDataSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
