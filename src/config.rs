use std::time::Duration;

use url::Url;

use crate::{events::NoopEventRecorder, Client, Error, EventRecorder, Result};

/// Configuration for [`Client`].
pub struct Config<'a> {
    pub(crate) sdk_key: String,
    pub(crate) base_uri: String,
    pub(crate) stream_uri: String,
    pub(crate) stream: bool,
    pub(crate) polling_interval: Duration,
    pub(crate) initial_reconnect_delay: Duration,
    pub(crate) event_recorder: Box<dyn EventRecorder + Send + Sync + 'a>,
}

impl<'a> Config<'a> {
    /// Create a default configuration using the specified SDK key.
    ///
    /// ```
    /// # use flagsync::Config;
    /// Config::from_sdk_key("sdk-key");
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>) -> Self {
        Config {
            sdk_key: sdk_key.into(),
            base_uri: Config::DEFAULT_BASE_URI.to_owned(),
            stream_uri: Config::DEFAULT_STREAM_URI.to_owned(),
            stream: true,
            polling_interval: Config::DEFAULT_POLLING_INTERVAL,
            initial_reconnect_delay: Config::DEFAULT_INITIAL_RECONNECT_DELAY,
            event_recorder: Box::new(NoopEventRecorder),
        }
    }

    /// Default base URI for flag data requests.
    pub const DEFAULT_BASE_URI: &'static str = "https://sdk.flagsync.dev";

    /// Default URI of the event stream.
    pub const DEFAULT_STREAM_URI: &'static str = "https://stream.flagsync.dev";

    /// Default interval between polls when streaming is disabled.
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);

    /// Shortest allowed polling interval.
    pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(30);

    /// Default delay before the first stream reconnection attempt.
    pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

    /// Override the base URI for flag data requests. Used by polling and for `indirect` stream
    /// events.
    pub fn base_uri(&mut self, base_uri: impl Into<String>) -> &mut Self {
        self.base_uri = base_uri.into();
        self
    }

    /// Override the event stream URI.
    pub fn stream_uri(&mut self, stream_uri: impl Into<String>) -> &mut Self {
        self.stream_uri = stream_uri.into();
        self
    }

    /// Choose between streaming (the default) and polling.
    pub fn stream(&mut self, stream: bool) -> &mut Self {
        self.stream = stream;
        self
    }

    /// Set the polling interval. Values below [`Config::MIN_POLLING_INTERVAL`] are raised to it.
    pub fn polling_interval(&mut self, interval: Duration) -> &mut Self {
        if interval < Config::MIN_POLLING_INTERVAL {
            log::warn!(target: "flagsync",
                       interval:debug = interval;
                       "polling interval is too short, using the minimum of {:?}",
                       Config::MIN_POLLING_INTERVAL);
            self.polling_interval = Config::MIN_POLLING_INTERVAL;
        } else {
            self.polling_interval = interval;
        }
        self
    }

    /// Set the delay before the first stream reconnection attempt. Later attempts back off
    /// exponentially.
    pub fn initial_reconnect_delay(&mut self, delay: Duration) -> &mut Self {
        self.initial_reconnect_delay = delay;
        self
    }

    /// Set an event recorder to pass evaluation records to your analytics pipeline.
    ///
    /// ```
    /// # use flagsync::Config;
    /// let mut config = Config::from_sdk_key("sdk-key");
    /// config.event_recorder(|event| {
    ///   println!("{:?}", event);
    /// });
    /// ```
    pub fn event_recorder(
        &mut self,
        event_recorder: impl EventRecorder + Send + Sync + 'a,
    ) -> &mut Self {
        self.event_recorder = Box::new(event_recorder);
        self
    }

    /// Check that the configured URIs are valid.
    pub fn validate(&self) -> Result<()> {
        for uri in [&self.base_uri, &self.stream_uri] {
            Url::parse(uri).map_err(Error::InvalidUri)?;
        }
        Ok(())
    }

    /// Create a new [`Client`] using the specified configuration.
    ///
    /// ```
    /// # use flagsync::{Config, Client};
    /// let client: Client = Config::from_sdk_key("sdk-key").to_client();
    /// ```
    pub fn to_client(self) -> Client<'a> {
        Client::new(self)
    }
}
