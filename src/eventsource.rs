//! Server-Sent Events transport for the streaming data source.
use std::{
    io::{BufRead, BufReader, Read},
    time::Duration,
};

use reqwest::{
    blocking::Client,
    header::{self, HeaderValue},
};
use url::Url;

use crate::{requestor::default_headers, Error, Result};

const STREAM_PATH: &str = "/all";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// A connection that delivers nothing, not even a heartbeat, for this long is considered dead.
pub(crate) const DEAD_CONNECTION_INTERVAL: Duration = Duration::from_secs(300);

/// A single server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event name. `"message"` if the server didn't name it.
    pub event: String,
    /// Payload. Multiple `data` lines are joined with `\n`.
    pub data: String,
    /// Last event id seen on the stream.
    pub id: Option<String>,
}

impl Event {
    #[allow(missing_docs)]
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Event {
        Event {
            event: event.into(),
            data: data.into(),
            id: None,
        }
    }
}

/// Something read from an event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    #[allow(missing_docs)]
    Event(Event),
    /// A comment line. Servers send these as heartbeats.
    Comment(String),
}

/// Opens connections to an event stream.
pub trait EventSource: Send + Sync {
    /// Open a new connection. Fails with [`Error::HttpStatus`] if the server rejects it.
    fn connect(&self) -> Result<Box<dyn EventReader>>;
}

/// An open event stream connection. Dropping the reader closes the connection.
pub trait EventReader: Send {
    /// Block until the next event or comment. Returns `Ok(None)` once the server closes the
    /// stream.
    fn next_message(&mut self) -> Result<Option<Message>>;
}

/// [`EventSource`] connecting to the flag delivery stream with a blocking `reqwest` client.
pub struct HttpEventSource {
    client: Client,
    url: Url,
}

impl HttpEventSource {
    /// Create an event source for the stream service at `stream_url`, authenticating with
    /// `sdk_key`.
    pub fn new(stream_url: &str, sdk_key: &str) -> Result<HttpEventSource> {
        let base = stream_url.trim_end_matches('/');
        let url = Url::parse(&format!("{base}{STREAM_PATH}")).map_err(Error::InvalidUri)?;

        let mut headers = default_headers(sdk_key)?;
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));

        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            // The blocking client applies this to every read of the body, not to the whole
            // stream.
            .timeout(DEAD_CONNECTION_INTERVAL)
            .build()?;

        Ok(HttpEventSource { client, url })
    }
}

impl EventSource for HttpEventSource {
    fn connect(&self) -> Result<Box<dyn EventReader>> {
        log::debug!(target: "flagsync", url:display = self.url; "connecting to stream");

        let response = self.client.get(self.url.clone()).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        Ok(Box::new(EventParser::new(BufReader::new(response))))
    }
}

/// Incremental parser of the `text/event-stream` format.
pub struct EventParser<R> {
    reader: R,
    last_event_id: Option<String>,
    line: String,
}

impl<R: BufRead> EventParser<R> {
    #[allow(missing_docs)]
    pub fn new(reader: R) -> EventParser<R> {
        EventParser {
            reader,
            last_event_id: None,
            line: String::new(),
        }
    }

    /// Read until the next complete event, skipping comments. Returns `Ok(None)` at the end of
    /// the input.
    pub fn next_event(&mut self) -> Result<Option<Event>> {
        loop {
            match self.next_message()? {
                Some(Message::Event(event)) => return Ok(Some(event)),
                Some(Message::Comment(_)) => {}
                None => return Ok(None),
            }
        }
    }

    /// Read lines until a complete event is dispatched, a comment is read or the input ends.
    pub fn next_message(&mut self) -> Result<Option<Message>> {
        let mut event_name: Option<String> = None;
        let mut data: Option<String> = None;

        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                // An incomplete event at the end of the stream is discarded.
                return Ok(None);
            }
            let line = self.line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                match data.take() {
                    Some(data) => {
                        return Ok(Some(Message::Event(Event {
                            event: event_name.take().unwrap_or_else(|| "message".to_owned()),
                            data,
                            id: self.last_event_id.clone(),
                        })))
                    }
                    None => {
                        event_name = None;
                        continue;
                    }
                }
            }

            if let Some(comment) = line.strip_prefix(':') {
                // Pending fields live on this call's stack, so comments inside an event are
                // skipped rather than returned.
                if data.is_none() && event_name.is_none() {
                    return Ok(Some(Message::Comment(comment.trim_start().to_owned())));
                }
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match field {
                "event" => event_name = Some(value.to_owned()),
                "data" => match &mut data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => data = Some(value.to_owned()),
                },
                "id" if !value.contains('\0') => self.last_event_id = Some(value.to_owned()),
                _ => {
                    // `retry` and unknown fields are ignored.
                }
            }
        }
    }
}

impl<R: Read + Send> EventReader for EventParser<BufReader<R>> {
    fn next_message(&mut self) -> Result<Option<Message>> {
        EventParser::next_message(self)
    }
}
