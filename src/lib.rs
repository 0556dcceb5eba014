//! A feature flag evaluation client.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that evaluates feature flag values for [`Subject`]s,
//! where each subject has a unique key and attributes associated with it. Flag data is kept up to
//! date in the background by a streaming connection or by polling, and every evaluation is
//! served from the latest consistent snapshot of that data.
//!
//! Evaluation results come as a [`Detail`], carrying the served value, the variation index and
//! the [`Reason`] for the result. An [`EventRecorder`] may be provided to receive a
//! [`FeatureRequestEvent`] for every evaluation.
//!
//! The health of the data source and of the data store is reported by a [`StatusTracker`], which
//! also accepts listeners for status changes.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum. Evaluation never fails: on any failure the
//! caller-supplied default is served and the failure is described by [`Reason::Error`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages,
//! under the `flagsync` target. Consider integrating a `log`-compatible logger implementation for
//! better visibility into data source operations.
//!
//! # Examples
//!
//! ```no_run
//! # use std::time::Duration;
//! # use flagsync::{Client, Config, Subject};
//! let mut client = Config::from_sdk_key("sdk-key").to_client();
//! client.start()?;
//! client.wait_for_initialization(Duration::from_secs(5));
//!
//! let subject = Subject::new("alice").with_attribute("country", "US");
//! let enabled = client.bool_variation("show-banner", &subject, false);
//! # Ok::<(), flagsync::Error>(())
//! ```

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod bucketing;
mod client;
mod config;
mod data_source;
mod error;
mod eval;
mod events;
mod eventsource;
mod flag;
mod flags_state;
mod polling;
mod requestor;
mod rules;
mod segment;
mod status;
mod store;
mod streaming;
mod subject;

#[cfg(test)]
mod test_common;

pub use bucketing::{Bucketer, Murmur3Bucketer};
pub use client::Client;
pub use config::Config;
pub use data_source::{DataSource, DataStoreUpdates, StartupSignal};
pub use error::{Error, Result};
pub use eval::{evaluate, evaluate_with_events, Detail, EvalError, PrerequisiteEvaluation, Reason};
pub use events::{EventRecorder, FeatureRequestEvent};
pub use eventsource::{Event, EventParser, EventReader, EventSource, HttpEventSource, Message};
pub use flag::{
    Flag, FlagRule, FlagValue, Prerequisite, Rollout, Target, VariationIndex, VariationOrRollout,
    WeightedVariation,
};
pub use flags_state::{AllFlagsState, FlagMetadata, FlagsStateOptions};
pub use polling::PollingDataSource;
pub use requestor::{FeatureRequestor, HttpFeatureRequestor};
pub use rules::{Clause, Operator};
pub use segment::{Segment, SegmentRule};
pub use status::{ErrorInfo, ErrorKind, ListenerId, State, Status, StatusTracker, StoreStatus};
pub use store::{
    AllData, DataKind, DataStore, FullDataSet, InMemoryDataStore, ItemDescriptor, KeyedItems,
    Store, StoreItem,
};
pub use streaming::StreamingDataSource;
pub use subject::{AttributeValue, Subject};
