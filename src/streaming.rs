//! Streaming data source: keeps the store up to date from a persistent event stream.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use rand::{thread_rng, Rng};
use serde::Deserialize;

use crate::{
    data_source::{DataSource, DataStoreUpdates, StartupSignal},
    eventsource::{Event, EventReader, EventSource, Message, DEAD_CONNECTION_INTERVAL},
    requestor::FeatureRequestor,
    status::{ListenerId, State, StoreStatus},
    store::{AllData, DataKind, ItemDescriptor},
    Error, Result,
};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// A connection that stays up this long resets the reconnect backoff.
const BACKOFF_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// A decoded stream event.
#[derive(Debug, PartialEq)]
enum StreamEvent {
    Put(AllData),
    Patch {
        kind: DataKind,
        key: String,
        item: ItemDescriptor,
    },
    Delete {
        kind: DataKind,
        key: String,
        version: u64,
    },
    IndirectPut,
    IndirectPatch {
        kind: DataKind,
        key: String,
    },
}

#[derive(Deserialize)]
struct PutData {
    data: AllData,
}

#[derive(Deserialize)]
struct PatchData {
    path: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DeleteData {
    path: String,
    version: u64,
}

impl StreamEvent {
    /// Decode a raw event. Returns `Ok(None)` for events that should be ignored: unknown event
    /// names and item paths of unknown kinds.
    fn parse(event: &Event) -> Result<Option<StreamEvent>> {
        let parsed = match event.event.as_str() {
            "put" => {
                let put: PutData = serde_json::from_str(&event.data)?;
                Some(StreamEvent::Put(put.data))
            }
            "patch" => {
                let patch: PatchData = serde_json::from_str(&event.data)?;
                match DataKind::parse_path(&patch.path) {
                    Some((kind, key)) => Some(StreamEvent::Patch {
                        kind,
                        key: key.to_owned(),
                        item: decode_item(kind, patch.data)?,
                    }),
                    None => ignore_path(&patch.path),
                }
            }
            "delete" => {
                let delete: DeleteData = serde_json::from_str(&event.data)?;
                match DataKind::parse_path(&delete.path) {
                    Some((kind, key)) => Some(StreamEvent::Delete {
                        kind,
                        key: key.to_owned(),
                        version: delete.version,
                    }),
                    None => ignore_path(&delete.path),
                }
            }
            "indirect/put" => Some(StreamEvent::IndirectPut),
            "indirect/patch" => {
                let path = event.data.trim();
                match DataKind::parse_path(path) {
                    Some((kind, key)) => Some(StreamEvent::IndirectPatch {
                        kind,
                        key: key.to_owned(),
                    }),
                    None => ignore_path(path),
                }
            }
            name => {
                log::warn!(target: "flagsync", event:display = name; "unexpected stream event");
                None
            }
        };
        Ok(parsed)
    }
}

fn ignore_path(path: &str) -> Option<StreamEvent> {
    log::debug!(target: "flagsync", path:display = path; "ignoring update for unknown item path");
    None
}

fn decode_item(kind: DataKind, data: serde_json::Value) -> Result<ItemDescriptor> {
    Ok(match kind {
        DataKind::Flags => serde_json::from_value::<crate::flag::Flag>(data)?.into(),
        DataKind::Segments => serde_json::from_value::<crate::segment::Segment>(data)?.into(),
    })
}

/// Messages received by the connector thread.
enum StreamMessage {
    /// An event read from connection `generation`.
    Event { generation: u64, event: Event },
    /// A comment read from connection `generation`.
    Heartbeat { generation: u64 },
    /// Connection `generation` ended, cleanly or with an error.
    Closed { generation: u64, result: Result<()> },
    StoreStatus(StoreStatus),
    Stop,
}

/// What the connector does after handling a message.
enum Next {
    Continue,
    /// Drop the connection and open a new one after the backoff delay.
    Reconnect,
    /// Drop the connection and open a new one right away.
    Refresh,
    Stop,
}

/// Exponential reconnect backoff with jitter.
struct Backoff {
    initial: Duration,
    attempts: u32,
}

impl Backoff {
    fn new(initial: Duration) -> Backoff {
        Backoff {
            initial,
            attempts: 0,
        }
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay before the next attempt: `initial * 2^attempts` capped at the maximum, of which
    /// a random half is kept.
    fn next_delay(&mut self) -> Duration {
        let delay = self
            .initial
            .saturating_mul(2u32.saturating_pow(self.attempts))
            .min(MAX_RECONNECT_DELAY);
        self.attempts = self.attempts.saturating_add(1);

        let half = delay / 2;
        if half.is_zero() {
            return delay;
        }
        half + thread_rng().gen_range(Duration::ZERO..=half)
    }
}

/// A data source that receives flag updates over a persistent event stream.
///
/// Full datasets arrive as `put` events, single item updates as `patch` and `delete`. For
/// `indirect/*` events the data is fetched with a [`FeatureRequestor`].
pub struct StreamingDataSource {
    join_handle: Mutex<Option<JoinHandle<()>>>,
    sender: Mutex<Sender<StreamMessage>>,
    startup: StartupSignal,
    initialized: Arc<AtomicBool>,
    updates: DataStoreUpdates,
    store_status_listener: Option<ListenerId>,
}

struct Connector {
    event_source: Arc<dyn EventSource>,
    requestor: Arc<dyn FeatureRequestor>,
    updates: DataStoreUpdates,
    startup: StartupSignal,
    initialized: Arc<AtomicBool>,
    sender: Sender<StreamMessage>,
    receiver: Receiver<StreamMessage>,
    backoff: Backoff,
    /// Longest silence tolerated on a connection before it's dropped.
    dead_connection_interval: Duration,
    generation: u64,
    /// Set while the store is failing, so that the outage is logged once.
    store_error_logged: bool,
}

impl StreamingDataSource {
    /// Start the connector thread. The first connection is opened immediately.
    pub fn start(
        event_source: Arc<dyn EventSource>,
        requestor: Arc<dyn FeatureRequestor>,
        updates: DataStoreUpdates,
        initial_reconnect_delay: Duration,
    ) -> Result<StreamingDataSource> {
        StreamingDataSource::spawn(
            event_source,
            requestor,
            updates,
            initial_reconnect_delay,
            DEAD_CONNECTION_INTERVAL,
        )
    }

    fn spawn(
        event_source: Arc<dyn EventSource>,
        requestor: Arc<dyn FeatureRequestor>,
        updates: DataStoreUpdates,
        initial_reconnect_delay: Duration,
        dead_connection_interval: Duration,
    ) -> Result<StreamingDataSource> {
        let (sender, receiver) = mpsc::channel();
        let startup = StartupSignal::new();
        let initialized = Arc::new(AtomicBool::new(false));

        // Without status monitoring, store errors restart the stream right away.
        let store_status_listener = updates.is_status_monitoring_enabled().then(|| {
            let sender = Mutex::new(sender.clone());
            updates.status().add_store_status_listener(move |status| {
                let _ = sender
                    .lock()
                    .expect("thread holding sender lock should not panic")
                    .send(StreamMessage::StoreStatus(*status));
            })
        });

        let connector = Connector {
            event_source,
            requestor,
            updates: updates.clone(),
            startup: startup.clone(),
            initialized: initialized.clone(),
            sender: sender.clone(),
            receiver,
            backoff: Backoff::new(initial_reconnect_delay),
            dead_connection_interval,
            generation: 0,
            store_error_logged: false,
        };

        let join_handle = std::thread::Builder::new()
            .name("flagsync-stream".to_owned())
            .spawn(move || connector.run())?;

        log::info!(target: "flagsync", "started streaming flag data");

        Ok(StreamingDataSource {
            join_handle: Mutex::new(Some(join_handle)),
            sender: Mutex::new(sender),
            startup,
            initialized,
            updates,
            store_status_listener,
        })
    }
}

impl Connector {
    fn run(mut self) {
        loop {
            self.generation += 1;
            let next = match self.event_source.connect() {
                Ok(reader) => self.process_connection(reader),
                Err(err) => self.connection_error(err),
            };

            match next {
                Next::Continue | Next::Refresh => {}
                Next::Reconnect => {
                    let delay = self.backoff.next_delay();
                    log::debug!(target: "flagsync",
                                delay:debug = delay;
                                "waiting before reconnecting to stream");
                    if self.sleep(delay) {
                        return;
                    }
                }
                Next::Stop => return,
            }
        }
    }

    /// Read events from one connection until it has to be dropped.
    ///
    /// The reader thread owns the connection. It's told to drop it through `cancelled`, which it
    /// checks after every event and heartbeat.
    fn process_connection(&mut self, reader: Box<dyn EventReader>) -> Next {
        let connected_at = Instant::now();
        let mut last_activity = connected_at;
        let cancelled = Arc::new(AtomicBool::new(false));
        spawn_reader(reader, self.generation, self.sender.clone(), cancelled.clone());

        let next = loop {
            let idle_deadline = last_activity + self.dead_connection_interval;
            let timeout = idle_deadline.saturating_duration_since(Instant::now());
            let message = match self.receiver.recv_timeout(timeout) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    let err = std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no data received on stream",
                    );
                    break self.connection_error(err.into());
                }
                Err(RecvTimeoutError::Disconnected) => break Next::Stop,
            };

            let next = match message {
                StreamMessage::Stop => Next::Stop,
                StreamMessage::Event { generation, event } if generation == self.generation => {
                    last_activity = Instant::now();
                    self.handle_event(event)
                }
                StreamMessage::Heartbeat { generation } if generation == self.generation => {
                    log::debug!(target: "flagsync", "received a heartbeat");
                    last_activity = Instant::now();
                    Next::Continue
                }
                StreamMessage::Closed { generation, result } if generation == self.generation => {
                    let err = result.err().unwrap_or_else(|| {
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "stream closed by server",
                        )
                        .into()
                    });
                    self.connection_error(err)
                }
                StreamMessage::Event { .. }
                | StreamMessage::Heartbeat { .. }
                | StreamMessage::Closed { .. } => {
                    // Leftovers of a previous connection.
                    Next::Continue
                }
                StreamMessage::StoreStatus(status) => {
                    if status.available && status.refresh_needed {
                        log::warn!(target: "flagsync",
                                   "data store is available again and needs a refresh, restarting stream");
                        Next::Refresh
                    } else {
                        Next::Continue
                    }
                }
            };

            if !matches!(next, Next::Continue) {
                break next;
            }
        };

        cancelled.store(true, Ordering::Release);
        if connected_at.elapsed() >= BACKOFF_RESET_INTERVAL {
            self.backoff.reset();
        }
        next
    }

    fn connection_error(&mut self, err: Error) -> Next {
        if err.is_recoverable() {
            log::warn!(target: "flagsync",
                       error:display = err;
                       "stream connection failed, will retry");
            self.updates.status().report_error(&err);
            Next::Reconnect
        } else {
            log::error!(target: "flagsync",
                        error:display = err;
                        "unrecoverable stream connection error, giving up");
            self.updates.status().report_error(&err);
            self.startup.resolve(Err(err));
            Next::Stop
        }
    }

    fn handle_event(&mut self, event: Event) -> Next {
        log::debug!(target: "flagsync", event:display = event.event; "received stream event");

        let parsed = match StreamEvent::parse(&event) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Next::Continue,
            Err(err) => {
                log::error!(target: "flagsync",
                            event:display = event.event,
                            error:display = err;
                            "malformed stream event, restarting stream");
                self.updates.status().report_error(&err);
                return Next::Reconnect;
            }
        };

        let applied = match parsed {
            StreamEvent::Put(data) => return self.apply_put(data),
            StreamEvent::Patch { kind, key, item } => self.updates.upsert(kind, &key, item),
            StreamEvent::Delete { kind, key, version } => {
                self.updates
                    .upsert(kind, &key, ItemDescriptor::tombstone(version))
            }
            StreamEvent::IndirectPut => {
                return match self.requestor.get_all_data() {
                    Ok(data) => self.apply_put(data),
                    Err(err) => self.fetch_error(err),
                }
            }
            StreamEvent::IndirectPatch { kind, key } => {
                let fetched = match kind {
                    DataKind::Flags => self.requestor.get_flag(&key).map(ItemDescriptor::from),
                    DataKind::Segments => {
                        self.requestor.get_segment(&key).map(ItemDescriptor::from)
                    }
                };
                match fetched {
                    Ok(item) => self.updates.upsert(kind, &key, item),
                    Err(err) => return self.fetch_error(err),
                }
            }
        };

        match applied {
            Ok(_) => {
                self.store_recovered();
                if self.initialized.load(Ordering::Acquire) {
                    self.updates.status().report_valid();
                }
                Next::Continue
            }
            Err(err) => self.store_error(err),
        }
    }

    fn apply_put(&mut self, data: AllData) -> Next {
        if let Err(err) = self.updates.init(data.into()) {
            return self.store_error(err);
        }

        self.store_recovered();
        self.updates.status().report_valid();
        if !self.initialized.swap(true, Ordering::AcqRel) {
            log::info!(target: "flagsync", "initialized flag data from stream");
        }
        self.startup.resolve(Ok(()));
        Next::Continue
    }

    fn fetch_error(&mut self, err: Error) -> Next {
        log::warn!(target: "flagsync",
                   error:display = err;
                   "failed to fetch data for indirect stream event");
        self.connection_error(err)
    }

    /// The error has already been reported to the status tracker by `updates`.
    fn store_error(&mut self, err: Error) -> Next {
        if !self.store_error_logged {
            log::error!(target: "flagsync",
                        error:display = err;
                        "failed to store flag data from stream");
            self.store_error_logged = true;
        }

        if self.updates.is_status_monitoring_enabled() {
            // Wait for the store to report it needs a refresh.
            Next::Continue
        } else {
            Next::Reconnect
        }
    }

    fn store_recovered(&mut self) {
        if self.store_error_logged {
            log::info!(target: "flagsync", "data store is accepting updates again");
            self.store_error_logged = false;
        }
    }

    /// Sleep for `delay`, returning `true` if the data source was stopped meanwhile.
    fn sleep(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.receiver.recv_timeout(timeout) {
                Ok(StreamMessage::Stop) | Err(RecvTimeoutError::Disconnected) => return true,
                Ok(_) => {
                    // Events of dropped connections and store status changes don't matter while
                    // disconnected.
                }
                Err(RecvTimeoutError::Timeout) => return false,
            }
        }
    }
}

fn spawn_reader(
    mut reader: Box<dyn EventReader>,
    generation: u64,
    sender: Sender<StreamMessage>,
    cancelled: Arc<AtomicBool>,
) {
    let spawned = std::thread::Builder::new()
        .name("flagsync-stream-reader".to_owned())
        .spawn({
            let sender = sender.clone();
            // Returning drops `reader`, which closes the connection.
            move || loop {
                let result = reader.next_message();
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                let message = match result {
                    Ok(Some(Message::Event(event))) => StreamMessage::Event { generation, event },
                    Ok(Some(Message::Comment(_))) => StreamMessage::Heartbeat { generation },
                    Ok(None) => StreamMessage::Closed {
                        generation,
                        result: Ok(()),
                    },
                    Err(err) => StreamMessage::Closed {
                        generation,
                        result: Err(err),
                    },
                };
                let closed = matches!(message, StreamMessage::Closed { .. });
                if sender.send(message).is_err() || closed {
                    return;
                }
            }
        });

    if let Err(err) = spawned {
        let _ = sender.send(StreamMessage::Closed {
            generation,
            result: Err(err.into()),
        });
    }
}

impl DataSource for StreamingDataSource {
    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn startup(&self) -> &StartupSignal {
        &self.startup
    }

    fn close(&self) -> Result<()> {
        let join_handle = self
            .join_handle
            .lock()
            .expect("thread holding join handle lock should not panic")
            .take();

        let Some(join_handle) = join_handle else {
            return Ok(());
        };

        if let Some(id) = self.store_status_listener {
            self.updates.status().remove_listener(id);
        }
        // Error means that the connector thread has already exited.
        let _ = self
            .sender
            .lock()
            .expect("thread holding sender lock should not panic")
            .send(StreamMessage::Stop);

        self.updates.status().update_status(State::Off, None);
        join_handle.join().map_err(|_| Error::ThreadPanicked)
    }
}

impl Drop for StreamingDataSource {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
