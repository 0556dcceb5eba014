use std::{sync::Arc, time::Duration};

use crate::{
    bucketing::Murmur3Bucketer,
    data_source::{DataSource, DataStoreUpdates},
    eval::{evaluate, evaluate_with_events, Detail, EvalError, Reason},
    events::FeatureRequestEvent,
    eventsource::HttpEventSource,
    flag::FlagValue,
    flags_state::{AllFlagsState, FlagsStateOptions},
    polling::PollingDataSource,
    requestor::HttpFeatureRequestor,
    status::StatusTracker,
    store::{DataStore, InMemoryDataStore, Store},
    streaming::StreamingDataSource,
    Config, Result, Subject,
};

/// A client evaluating feature flags against data kept up to date in the background.
///
/// In order to create a client instance, first create [`Config`].
///
/// # Examples
/// ```
/// # use flagsync::{Client, Config};
/// Client::new(Config::from_sdk_key("sdk-key"));
/// ```
pub struct Client<'a> {
    store: Arc<InMemoryDataStore>,
    status: Arc<StatusTracker>,
    data_source: Option<Box<dyn DataSource>>,
    config: Config<'a>,
}

impl<'a> Client<'a> {
    /// Create a new `Client` using the specified configuration.
    ///
    /// The client doesn't fetch any data until [`Client::start`] is called.
    ///
    /// ```
    /// # use flagsync::{Client, Config};
    /// let client = Client::new(Config::from_sdk_key("sdk-key"));
    /// ```
    pub fn new(config: Config<'a>) -> Self {
        Client {
            store: Arc::new(InMemoryDataStore::new()),
            status: Arc::new(StatusTracker::new()),
            data_source: None,
            config,
        }
    }

    /// Start the streaming or polling data source, as configured. Does nothing if already
    /// started.
    ///
    /// Returns immediately. Use [`Client::wait_for_initialization`] to wait for the first data.
    pub fn start(&mut self) -> Result<()> {
        if self.data_source.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let updates = DataStoreUpdates::new(self.store.clone(), self.status.clone());
        let config = &self.config;

        let data_source: Box<dyn DataSource> = if config.stream {
            let requestor = HttpFeatureRequestor::new(&config.base_uri, &config.sdk_key, false)?;
            let event_source = HttpEventSource::new(&config.stream_uri, &config.sdk_key)?;
            Box::new(StreamingDataSource::start(
                Arc::new(event_source),
                Arc::new(requestor),
                updates,
                config.initial_reconnect_delay,
            )?)
        } else {
            let requestor = HttpFeatureRequestor::new(&config.base_uri, &config.sdk_key, true)?;
            Box::new(PollingDataSource::start(
                Arc::new(requestor),
                updates,
                config.polling_interval,
            )?)
        };

        self.data_source = Some(data_source);
        Ok(())
    }

    /// Block until the data source resolves startup or `timeout` elapses. Returns `None` on
    /// timeout or if the client was not started. The data source keeps running either way.
    pub fn wait_for_initialization(&self, timeout: Duration) -> Option<Result<()>> {
        self.data_source.as_ref()?.startup().wait_timeout(timeout)
    }

    /// Whether flag data has been received.
    pub fn initialized(&self) -> bool {
        self.store.initialized()
    }

    /// Data source and data store status, and registration of status listeners.
    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Evaluate a flag, returning `default` on any failure, along with the reason of the result.
    pub fn variation_detail(
        &self,
        flag_key: &str,
        subject: &Subject,
        default: FlagValue,
    ) -> Detail<FlagValue> {
        if !self.store.initialized() {
            log::warn!(target: "flagsync",
                       flag_key = flag_key,
                       subject_key = subject.key();
                       "evaluating a flag before flag data has been received");
            let reason = Reason::Error {
                error: EvalError::ClientNotReady,
            };
            self.record(FeatureRequestEvent::new_unknown_flag(
                flag_key,
                subject,
                default.clone(),
                reason,
            ));
            return Detail::err_default(EvalError::ClientNotReady, default);
        }

        // One snapshot for the whole evaluation, including prerequisites and segments.
        let snapshot = self.store.snapshot();

        let Some(flag) = snapshot.flag(flag_key) else {
            log::warn!(target: "flagsync",
                       flag_key = flag_key,
                       subject_key = subject.key();
                       "unknown flag");
            let reason = Reason::Error {
                error: EvalError::FlagNotFound,
            };
            self.record(FeatureRequestEvent::new_unknown_flag(
                flag_key,
                subject,
                default.clone(),
                reason,
            ));
            return Detail::err_default(EvalError::FlagNotFound, default);
        };

        let (detail, prerequisites) =
            evaluate_with_events(&*snapshot, &flag, subject, &Murmur3Bucketer);

        for prerequisite in prerequisites {
            self.record(FeatureRequestEvent::new_prerequisite(prerequisite, subject));
        }
        self.record(FeatureRequestEvent::new_evaluation(
            &flag,
            subject,
            &detail,
            default.clone(),
        ));

        log::trace!(target: "flagsync",
                    flag_key = flag_key,
                    subject_key = subject.key(),
                    value:serde = detail.value,
                    reason:debug = detail.reason;
                    "evaluated a flag");

        detail.or(default)
    }

    /// Evaluate a flag, returning `default` on any failure.
    pub fn variation(&self, flag_key: &str, subject: &Subject, default: FlagValue) -> FlagValue {
        self.variation_detail(flag_key, subject, default.clone())
            .value
            .unwrap_or(default)
    }

    /// Evaluate a boolean flag. Returns `default` if the flag serves a non-boolean value.
    pub fn bool_variation(&self, flag_key: &str, subject: &Subject, default: bool) -> bool {
        self.variation_detail(flag_key, subject, default.into())
            .try_map(|value| value.as_bool(), default, EvalError::WrongType)
            .value
            .unwrap_or(default)
    }

    /// Evaluate a string flag. Returns `default` if the flag serves a non-string value.
    pub fn str_variation(&self, flag_key: &str, subject: &Subject, default: &str) -> String {
        self.variation_detail(flag_key, subject, default.into())
            .try_map(
                |value| match value {
                    FlagValue::String(s) => Some(s),
                    _ => None,
                },
                default.to_owned(),
                EvalError::WrongType,
            )
            .value
            .unwrap_or_else(|| default.to_owned())
    }

    /// Evaluate a numeric flag. Returns `default` if the flag serves a non-numeric value.
    pub fn float_variation(&self, flag_key: &str, subject: &Subject, default: f64) -> f64 {
        self.variation_detail(flag_key, subject, default.into())
            .try_map(|value| value.as_f64(), default, EvalError::WrongType)
            .value
            .unwrap_or(default)
    }

    /// Evaluate an integer flag. Returns `default` if the flag serves a non-integer value.
    pub fn int_variation(&self, flag_key: &str, subject: &Subject, default: i64) -> i64 {
        self.variation_detail(flag_key, subject, default.into())
            .try_map(|value| value.as_i64(), default, EvalError::WrongType)
            .value
            .unwrap_or(default)
    }

    /// Evaluate every flag for `subject`, without recording events.
    pub fn all_flags_state(&self, subject: &Subject, options: FlagsStateOptions) -> AllFlagsState {
        if !self.store.initialized() {
            log::warn!(target: "flagsync",
                       subject_key = subject.key();
                       "all_flags_state called before flag data has been received");
            return AllFlagsState::new(false);
        }

        let snapshot = self.store.snapshot();
        let mut state = AllFlagsState::new(true);
        for descriptor in snapshot.flags.values() {
            let Some(flag) = descriptor.item.as_ref().and_then(|item| item.as_flag()) else {
                continue;
            };
            let detail = evaluate(&*snapshot, flag, subject, &Murmur3Bucketer);
            state.add(flag, detail, options.with_reasons);
        }
        state
    }

    /// Stop the data source. The client keeps serving the last received data.
    pub fn close(&mut self) -> Result<()> {
        match self.data_source.take() {
            Some(data_source) => data_source.close(),
            None => Ok(()),
        }
    }

    fn record(&self, event: FeatureRequestEvent) {
        log::trace!(target: "flagsync",
                    event:serde = event;
                    "recording feature request");
        self.config.event_recorder.record_feature_request(event);
    }
}

impl Drop for Client<'_> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::{
        status::State,
        store::{AllData, FullDataSet},
        test_common::{all_data, basic_flag, ChannelRequestor, TIMEOUT},
    };

    fn fixture() -> FullDataSet {
        let file = std::fs::File::open("tests/data/all-data.json").unwrap();
        let data: AllData = serde_json::from_reader(file).unwrap();
        data.into()
    }

    fn initialized_client<'a>(config: Config<'a>) -> Client<'a> {
        let client = Client::new(config);
        client.store.init(fixture()).unwrap();
        client
    }

    fn recording_config() -> (Config<'static>, Arc<Mutex<Vec<FeatureRequestEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut config = Config::from_sdk_key("sdk-key");
        {
            let events = events.clone();
            config.event_recorder(move |event| events.lock().unwrap().push(event));
        }
        (config, events)
    }

    fn us() -> Subject {
        Subject::new("carol").with_attribute("country", "US")
    }

    #[test]
    fn returns_default_while_not_initialized() {
        let (config, events) = recording_config();
        let client = Client::new(config);

        let detail = client.variation_detail("show-banner", &us(), json!(false));
        assert_eq!(detail, Detail::err_default(EvalError::ClientNotReady, json!(false)));
        assert!(!client.bool_variation("show-banner", &us(), false));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].reason,
            Reason::Error {
                error: EvalError::ClientNotReady
            }
        );
    }

    #[test]
    fn unknown_and_deleted_flags_return_default() {
        let client = initialized_client(Config::from_sdk_key("sdk-key"));

        for key in ["no-such-flag", "retired"] {
            let detail = client.variation_detail(key, &us(), json!("default"));
            assert_eq!(
                detail,
                Detail::err_default(EvalError::FlagNotFound, json!("default"))
            );
        }
    }

    #[test]
    fn evaluates_rules_targets_and_fallthrough() {
        let client = initialized_client(Config::from_sdk_key("sdk-key"));

        assert!(client.bool_variation("show-banner", &us(), false));
        assert!(client.bool_variation("show-banner", &Subject::new("vip"), false));
        assert!(!client.bool_variation(
            "show-banner",
            &Subject::new("dan").with_attribute("country", "CA"),
            true
        ));
        assert_eq!(client.int_variation("max-items", &us(), 0), 25);
        assert_eq!(client.float_variation("max-items", &us(), 0.0), 25.0);
        assert_eq!(
            client.variation("theme", &us(), json!(null)),
            json!({"color": "blue", "dense": false})
        );
    }

    #[test]
    fn evaluates_segments() {
        let client = initialized_client(Config::from_sdk_key("sdk-key"));

        assert!(client.bool_variation("beta-features", &Subject::new("alice"), false));
        assert!(client.bool_variation(
            "beta-features",
            &Subject::new("erin").with_attribute("email", "erin@example.com"),
            false
        ));
        assert!(!client.bool_variation(
            "beta-features",
            &Subject::new("mallory").with_attribute("email", "mallory@example.com"),
            false
        ));
    }

    #[test]
    fn prerequisites_and_rollouts() {
        let (config, events) = recording_config();
        let client = initialized_client(config);

        // alice buckets to ~0.780, vip to ~0.267
        let alice = Subject::new("alice").with_attribute("country", "US");
        assert_eq!(client.str_variation("checkout-flow", &alice, "none"), "redesign");
        assert_eq!(
            client.str_variation("checkout-flow", &Subject::new("vip"), "none"),
            "legacy"
        );

        let detail = client.variation_detail(
            "checkout-flow",
            &Subject::new("bob").with_attribute("country", "CA"),
            json!("none"),
        );
        assert_eq!(detail.value, Some(json!("legacy")));
        assert_eq!(
            detail.reason,
            Reason::PrerequisiteFailed {
                prerequisite_key: "show-banner".to_owned()
            }
        );

        let events = events.lock().unwrap();
        // one prerequisite event and one evaluation event per call
        assert_eq!(events.len(), 6);
        assert_eq!(events[0].key, "show-banner");
        assert_eq!(events[0].prereq_of.as_deref(), Some("checkout-flow"));
        assert_eq!(events[1].key, "checkout-flow");
        assert!(events[1].track_events);
        assert_eq!(events[1].version, Some(7));
    }

    #[test]
    fn wrong_type_returns_default() {
        let client = initialized_client(Config::from_sdk_key("sdk-key"));

        assert_eq!(client.str_variation("show-banner", &us(), "default"), "default");
        assert_eq!(client.int_variation("theme", &us(), 7), 7);
    }

    #[test]
    fn all_flags_state() {
        let client = initialized_client(Config::from_sdk_key("sdk-key"));

        let state = client.all_flags_state(&us(), FlagsStateOptions { with_reasons: true });
        assert!(state.valid());
        assert_eq!(state.value("show-banner"), Some(&json!(true)));
        assert_eq!(state.value("max-items"), Some(&json!(25)));
        assert_eq!(state.value("retired"), None);
        assert_eq!(
            state.metadata("max-items").and_then(|m| m.reason.clone()),
            Some(Reason::Off)
        );

        let uninitialized = Client::new(Config::from_sdk_key("sdk-key"));
        assert!(!uninitialized
            .all_flags_state(&us(), FlagsStateOptions::default())
            .valid());
    }

    #[test]
    fn serves_data_from_data_source() {
        let mut client = Client::new(Config::from_sdk_key("sdk-key"));
        let (requestor, responses, calls) = ChannelRequestor::new();
        let updates = DataStoreUpdates::new(client.store.clone(), client.status.clone());
        client.data_source = Some(Box::new(
            PollingDataSource::start(requestor, updates, Duration::from_millis(10)).unwrap(),
        ));

        calls.recv_timeout(TIMEOUT).unwrap();
        responses
            .send(Ok(all_data(vec![basic_flag("flag", 1)], vec![])))
            .unwrap();

        assert!(matches!(
            client.wait_for_initialization(TIMEOUT),
            Some(Ok(()))
        ));
        assert!(client.initialized());
        assert_eq!(client.status().status().state, State::Valid);
        assert!(client.bool_variation("flag", &Subject::new("alice"), false));

        drop(responses);
        client.close().unwrap();
        assert_eq!(client.status().status().state, State::Off);
        // last known data is still served
        assert!(client.bool_variation("flag", &Subject::new("alice"), false));
    }

    #[test]
    fn not_started_client_does_not_wait() {
        let client = Client::new(Config::from_sdk_key("sdk-key"));
        assert!(client.wait_for_initialization(Duration::from_millis(1)).is_none());
    }
}
