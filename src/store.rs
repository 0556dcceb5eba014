//! A thread-safe, versioned in-memory store for flags and segments.
//!
//! The store is written by a single data source (streaming or polling) and read concurrently by
//! any number of evaluating threads. Readers take a [`snapshot`](InMemoryDataStore::snapshot)
//! that is not affected by further writes, so one evaluation always sees a consistent dataset.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use serde::Deserialize;

use crate::{flag::Flag, segment::Segment, Result};

/// A namespace of stored items. Keys are unique only within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    #[allow(missing_docs)]
    Flags,
    #[allow(missing_docs)]
    Segments,
}

impl DataKind {
    /// Namespace name, also used in stream item paths.
    pub fn name(&self) -> &'static str {
        match self {
            DataKind::Flags => "flags",
            DataKind::Segments => "segments",
        }
    }

    /// Parse an item path of the form `/flags/<key>` or `/segments/<key>`.
    pub fn parse_path(path: &str) -> Option<(DataKind, &str)> {
        [DataKind::Flags, DataKind::Segments]
            .into_iter()
            .find_map(|kind| {
                let key = path
                    .strip_prefix('/')?
                    .strip_prefix(kind.name())?
                    .strip_prefix('/')?;
                Some((kind, key))
            })
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stored flag or segment.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreItem {
    #[allow(missing_docs)]
    Flag(Arc<Flag>),
    #[allow(missing_docs)]
    Segment(Arc<Segment>),
}

impl StoreItem {
    #[allow(missing_docs)]
    pub fn as_flag(&self) -> Option<&Arc<Flag>> {
        match self {
            StoreItem::Flag(flag) => Some(flag),
            StoreItem::Segment(_) => None,
        }
    }

    #[allow(missing_docs)]
    pub fn as_segment(&self) -> Option<&Arc<Segment>> {
        match self {
            StoreItem::Segment(segment) => Some(segment),
            StoreItem::Flag(_) => None,
        }
    }
}

/// A versioned item, or a tombstone (`item: None`) marking that the item was deleted at
/// `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemDescriptor {
    #[allow(missing_docs)]
    pub version: u64,
    #[allow(missing_docs)]
    pub item: Option<StoreItem>,
}

impl ItemDescriptor {
    /// A deletion marker at `version`.
    pub fn tombstone(version: u64) -> ItemDescriptor {
        ItemDescriptor {
            version,
            item: None,
        }
    }
}

impl From<Flag> for ItemDescriptor {
    fn from(flag: Flag) -> Self {
        let version = flag.version;
        if flag.deleted {
            ItemDescriptor::tombstone(version)
        } else {
            ItemDescriptor {
                version,
                item: Some(StoreItem::Flag(Arc::new(flag))),
            }
        }
    }
}

impl From<Segment> for ItemDescriptor {
    fn from(segment: Segment) -> Self {
        let version = segment.version;
        if segment.deleted {
            ItemDescriptor::tombstone(version)
        } else {
            ItemDescriptor {
                version,
                item: Some(StoreItem::Segment(Arc::new(segment))),
            }
        }
    }
}

/// The full dataset in its wire format, as returned by the polling endpoint and carried by
/// stream `put` events.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[allow(missing_docs)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, Flag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

#[allow(missing_docs)]
pub type KeyedItems = HashMap<String, ItemDescriptor>;

/// Every item of every kind, including tombstones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FullDataSet {
    #[allow(missing_docs)]
    pub flags: KeyedItems,
    #[allow(missing_docs)]
    pub segments: KeyedItems,
}

impl FullDataSet {
    /// Items of the given kind.
    pub fn items(&self, kind: DataKind) -> &KeyedItems {
        match kind {
            DataKind::Flags => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }

    fn items_mut(&mut self, kind: DataKind) -> &mut KeyedItems {
        match kind {
            DataKind::Flags => &mut self.flags,
            DataKind::Segments => &mut self.segments,
        }
    }

    fn live_item(&self, kind: DataKind, key: &str) -> Option<&StoreItem> {
        self.items(kind).get(key)?.item.as_ref()
    }
}

impl From<AllData> for FullDataSet {
    fn from(data: AllData) -> Self {
        FullDataSet {
            flags: data
                .flags
                .into_iter()
                .map(|(key, flag)| (key, flag.into()))
                .collect(),
            segments: data
                .segments
                .into_iter()
                .map(|(key, segment)| (key, segment.into()))
                .collect(),
        }
    }
}

/// Read-only view used by evaluation.
pub trait Store {
    /// Retrieve the live flag with key `key`.
    fn flag(&self, key: &str) -> Option<Arc<Flag>>;

    /// Retrieve the live segment with key `key`.
    fn segment(&self, key: &str) -> Option<Arc<Segment>>;
}

impl Store for FullDataSet {
    fn flag(&self, key: &str) -> Option<Arc<Flag>> {
        self.live_item(DataKind::Flags, key)?.as_flag().cloned()
    }

    fn segment(&self, key: &str) -> Option<Arc<Segment>> {
        self.live_item(DataKind::Segments, key)?
            .as_segment()
            .cloned()
    }
}

/// A versioned store of flags and segments, written by a data source.
///
/// Implementations must permit concurrent access. Writes are version-gated: an update is applied
/// only if its version is strictly greater than the stored version of the same key, tombstones
/// included. Stale updates are ignored, not errors.
///
/// Methods return `Err` only if the backing storage fails.
pub trait DataStore: Send + Sync {
    /// Replace all data atomically. After the first success, [`DataStore::initialized`] returns
    /// `true` for the lifetime of the store.
    fn init(&self, data: FullDataSet) -> Result<()>;

    /// Insert, update or tombstone a single item. Returns `true` if the write was applied and
    /// `false` if it was ignored as stale.
    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool>;

    /// Retrieve a live item. Missing and deleted items are both `None`.
    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>>;

    /// Retrieve all live items of a kind.
    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>>;

    /// Whether [`DataStore::init`] has succeeded at least once.
    fn initialized(&self) -> bool;

    /// Whether this store reports its availability to the
    /// [`StatusTracker`](crate::status::StatusTracker).
    ///
    /// A store returning `true` promises to call
    /// [`update_store_status`](crate::status::StatusTracker::update_store_status) when it becomes
    /// unavailable and again when it recovers, indicating whether a full refresh is needed.
    fn is_status_monitoring_enabled(&self) -> bool {
        false
    }
}

/// The default [`DataStore`]: all data lives in memory behind a copy-on-write snapshot.
#[derive(Default)]
pub struct InMemoryDataStore {
    data: RwLock<Arc<FullDataSet>>,
    initialized: AtomicBool,
}

impl InMemoryDataStore {
    /// Create a new empty, uninitialized store.
    pub fn new() -> Self {
        InMemoryDataStore::default()
    }

    /// Get the current dataset. The snapshot is immutable and not affected by further writes.
    pub fn snapshot(&self) -> Arc<FullDataSet> {
        // self.data.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        let data = self
            .data
            .read()
            .expect("thread holding data lock should not panic");

        data.clone()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: FullDataSet) -> Result<()> {
        // Constructing new value before requesting the lock to minimize lock span.
        let new_value = Arc::new(data);

        let mut slot = self
            .data
            .write()
            .expect("thread holding data lock should not panic");
        *slot = new_value;
        self.initialized.store(true, Ordering::Release);

        Ok(())
    }

    fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> Result<bool> {
        let mut slot = self
            .data
            .write()
            .expect("thread holding data lock should not panic");

        if let Some(existing) = slot.items(kind).get(key) {
            if existing.version >= item.version {
                return Ok(false);
            }
        }

        // Clones the dataset only if a reader still holds the current snapshot.
        Arc::make_mut(&mut slot)
            .items_mut(kind)
            .insert(key.to_owned(), item);

        Ok(true)
    }

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<StoreItem>> {
        Ok(self.snapshot().live_item(kind, key).cloned())
    }

    fn all(&self, kind: DataKind) -> Result<HashMap<String, StoreItem>> {
        Ok(self
            .snapshot()
            .items(kind)
            .iter()
            .filter_map(|(key, descriptor)| {
                descriptor
                    .item
                    .as_ref()
                    .map(|item| (key.clone(), item.clone()))
            })
            .collect())
    }

    fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}
