#![cfg(test)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use crate::{
    flag::Flag,
    requestor::FeatureRequestor,
    segment::Segment,
    status::{Status, StatusTracker, StoreStatus},
    store::{AllData, DataKind, DataStore, FullDataSet, InMemoryDataStore, ItemDescriptor, StoreItem},
    Error, Result,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn flag(json: serde_json::Value) -> Flag {
    serde_json::from_value(json).unwrap()
}

pub fn basic_flag(key: &str, version: u64) -> Flag {
    flag(serde_json::json!({
        "key": key,
        "version": version,
        "on": true,
        "fallthrough": {"variation": 1},
        "offVariation": 0,
        "variations": [false, true]
    }))
}

pub fn all_data(flags: Vec<Flag>, segments: Vec<Segment>) -> AllData {
    AllData {
        flags: flags
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect(),
        segments: segments
            .into_iter()
            .map(|segment| (segment.key.clone(), segment))
            .collect(),
    }
}

pub fn flag_version(store: &dyn DataStore, key: &str) -> Option<u64> {
    store
        .get(DataKind::Flags, key)
        .unwrap()
        .and_then(|item| item.as_flag().map(|flag| flag.version))
}

/// A requestor whose responses are fed one by one by the test.
///
/// Every call blocks until the test sends a response. Calls are announced on `calls`, so tests can
/// tell when the data source asked for data. Once the response sender is dropped, calls fail with
/// a network error.
pub struct ChannelRequestor {
    responses: Mutex<mpsc::Receiver<Result<AllData>>>,
    items: Mutex<HashMap<(DataKind, String), Result<FetchedItem>>>,
    calls: Mutex<mpsc::Sender<String>>,
}

/// Item returned by [`ChannelRequestor::get_flag`] or [`ChannelRequestor::get_segment`].
#[derive(Clone)]
pub enum FetchedItem {
    Flag(Flag),
    Segment(Segment),
}

impl ChannelRequestor {
    pub fn new() -> (
        Arc<ChannelRequestor>,
        mpsc::Sender<Result<AllData>>,
        mpsc::Receiver<String>,
    ) {
        let (response_sender, responses) = mpsc::channel();
        let (calls_sender, calls) = mpsc::channel();
        let requestor = ChannelRequestor {
            responses: Mutex::new(responses),
            items: Mutex::new(HashMap::new()),
            calls: Mutex::new(calls_sender),
        };
        (Arc::new(requestor), response_sender, calls)
    }

    pub fn set_item(&self, kind: DataKind, key: &str, item: Result<FetchedItem>) {
        self.items
            .lock()
            .unwrap()
            .insert((kind, key.to_owned()), item);
    }

    fn announce(&self, call: String) {
        let _ = self.calls.lock().unwrap().send(call);
    }

    fn item(&self, kind: DataKind, key: &str) -> Result<FetchedItem> {
        self.announce(format!("{kind}/{key}"));
        self.items
            .lock()
            .unwrap()
            .get(&(kind, key.to_owned()))
            .cloned()
            .unwrap_or(Err(Error::HttpStatus(404)))
    }
}

impl FeatureRequestor for ChannelRequestor {
    fn get_all_data(&self) -> Result<AllData> {
        self.announce("all".to_owned());
        self.responses
            .lock()
            .unwrap()
            .recv()
            .unwrap_or_else(|_| Err(std::io::Error::other("requestor closed").into()))
    }

    fn get_flag(&self, key: &str) -> Result<Flag> {
        match self.item(DataKind::Flags, key)? {
            FetchedItem::Flag(flag) => Ok(flag),
            FetchedItem::Segment(_) => Err(Error::InvalidData("not a flag".to_owned())),
        }
    }

    fn get_segment(&self, key: &str) -> Result<Segment> {
        match self.item(DataKind::Segments, key)? {
            FetchedItem::Segment(segment) => Ok(segment),
            FetchedItem::Flag(_) => Err(Error::InvalidData("not a segment".to_owned())),
        }
    }
}

/// A store that fails writes while `failing` is set.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryDataStore,
    pub failing: AtomicBool,
    pub monitoring: bool,
}

impl FlakyStore {
    pub fn with_monitoring() -> FlakyStore {
        FlakyStore {
            monitoring: true,
            ..FlakyStore::default()
        }
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Store("store is down".to_owned()))
        } else {
            Ok(())
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl DataStore for FlakyStore {
    fn init(&self, data: FullDataSet) -> Result<()> {
        self.check()?;
        self.inner.init(data)
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        self.check()?;
        self.inner.upsert(kind, key, item)
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        self.inner.get(kind, key)
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        self.inner.all(kind)
    }

    fn initialized(&self) -> bool {
        self.inner.initialized()
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        self.monitoring
    }
}

/// Forward every status broadcast into a channel.
pub fn status_receiver(tracker: &StatusTracker) -> mpsc::Receiver<Status> {
    let (sender, receiver) = mpsc::channel();
    let sender = Mutex::new(sender);
    tracker.add_status_listener(move |status| {
        let _ = sender.lock().unwrap().send(status.clone());
    });
    receiver
}

pub fn store_down() -> StoreStatus {
    StoreStatus {
        available: false,
        refresh_needed: false,
    }
}

pub fn store_recovered() -> StoreStatus {
    StoreStatus {
        available: true,
        refresh_needed: true,
    }
}
