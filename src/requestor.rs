//! Fetching flag data over HTTP.
use std::{sync::Mutex, time::Duration};

use reqwest::{
    blocking::Client,
    header::{self, HeaderMap, HeaderValue},
    StatusCode,
};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{flag::Flag, segment::Segment, store::AllData, Error, Result};

const LATEST_ALL_PATH: &str = "/sdk/latest-all";
const LATEST_FLAGS_PATH: &str = "/sdk/latest-flags";
const LATEST_SEGMENTS_PATH: &str = "/sdk/latest-segments";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Fetches the full dataset or single items from the flag delivery service.
///
/// Failures are returned as [`Error::HttpStatus`] for non-2xx responses,
/// [`Error::Network`] for transport errors and [`Error::InvalidData`] for undecodable payloads.
pub trait FeatureRequestor: Send + Sync {
    /// Fetch all flags and segments.
    fn get_all_data(&self) -> Result<AllData>;

    /// Fetch a single flag.
    fn get_flag(&self, key: &str) -> Result<Flag>;

    /// Fetch a single segment.
    fn get_segment(&self, key: &str) -> Result<Segment>;
}

/// [`FeatureRequestor`] backed by a blocking `reqwest` client.
pub struct HttpFeatureRequestor {
    client: Client,
    base_url: Url,
    /// Last `ETag` and payload of the "latest-all" endpoint, if caching is enabled.
    cache: Option<Mutex<Option<(HeaderValue, AllData)>>>,
}

impl HttpFeatureRequestor {
    /// Create a requestor for the service at `base_url`, authenticating with `sdk_key`.
    ///
    /// With `use_cache`, full dataset requests are conditional on the last received `ETag` and
    /// a `304 Not Modified` response serves the previous payload. Polling benefits from this,
    /// while streaming needs fresh data on every fetch.
    pub fn new(base_url: &str, sdk_key: &str, use_cache: bool) -> Result<HttpFeatureRequestor> {
        let base_url = Url::parse(base_url).map_err(Error::InvalidUri)?;

        let client = Client::builder()
            .default_headers(default_headers(sdk_key)?)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(HttpFeatureRequestor {
            client,
            base_url,
            cache: use_cache.then(|| Mutex::new(None)),
        })
    }

    fn url(&self, path: &str, key: Option<&str>) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}{path}")).map_err(Error::InvalidUri)?;
        if let Some(key) = key {
            url.path_segments_mut()
                .map_err(|()| Error::InvalidUri(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
                .push(key);
        }
        Ok(url)
    }

    fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        log::debug!(target: "flagsync", url:display = url; "making request");

        let response = self.client.get(url).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        let body = response.bytes()?;
        Ok(serde_json::from_slice(&body)?)
    }
}

impl FeatureRequestor for HttpFeatureRequestor {
    fn get_all_data(&self) -> Result<AllData> {
        let url = self.url(LATEST_ALL_PATH, None)?;

        let Some(cache) = &self.cache else {
            return self.get(url);
        };

        let etag = cache
            .lock()
            .expect("thread holding cache lock should not panic")
            .as_ref()
            .map(|(etag, _)| etag.clone());

        log::debug!(target: "flagsync", url:display = url; "making request");
        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        let response = request.send()?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            let cached = cache
                .lock()
                .expect("thread holding cache lock should not panic")
                .as_ref()
                .map(|(_, data)| data.clone());
            if let Some(data) = cached {
                log::debug!(target: "flagsync", "flag data not modified");
                return Ok(data);
            }
        }
        if !status.is_success() {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        let etag = response.headers().get(header::ETAG).cloned();
        let body = response.bytes()?;
        let data: AllData = serde_json::from_slice(&body)?;

        *cache
            .lock()
            .expect("thread holding cache lock should not panic") =
            etag.map(|etag| (etag, data.clone()));

        Ok(data)
    }

    fn get_flag(&self, key: &str) -> Result<Flag> {
        self.get(self.url(LATEST_FLAGS_PATH, Some(key))?)
    }

    fn get_segment(&self, key: &str) -> Result<Segment> {
        self.get(self.url(LATEST_SEGMENTS_PATH, Some(key))?)
    }
}

/// Headers sent with every request, to both the polling and the streaming endpoints.
pub(crate) fn default_headers(sdk_key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(sdk_key)
            .map_err(|_| Error::InvalidData("SDK key is not a valid header value".to_owned()))?,
    );
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static(concat!("flagsync/", env!("CARGO_PKG_VERSION"))),
    );
    Ok(headers)
}
