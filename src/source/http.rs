//! HTTP list+watch client for Kubernetes-style REST collections
//!
//! `GET {endpoint}/{path}` returns the collection; adding
//! `?watch=true&resourceVersion=V` turns it into a stream of
//! newline-delimited JSON change events. Watches ask the server to end the
//! stream after `timeoutSeconds` and carry a client-side deadline slightly
//! past that, so a silently dead connection still ends in a relist.

use std::io;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{RemoteSource, WatchStream};
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::models::{ObjectList, WatchEvent};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: String,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "K: DeserializeOwned"))]
struct ListResponse<K> {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default = "Vec::new")]
    items: Vec<K>,
}

#[derive(Debug, Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: serde_json::Value,
}

/// Status object carried by `ERROR` watch events
#[derive(Debug, Default, Deserialize)]
struct Status {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

/// Longest watch line accepted before the stream is abandoned
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Time the client waits past the server-side watch timeout
const WATCH_DEADLINE_GRACE: Duration = Duration::from_secs(30);

/// List+watch client over HTTP
pub struct HttpSource<K> {
    client: Client,
    collection_url: String,
    token: Option<String>,
    request_timeout: Duration,
    watch_timeout: Duration,
    max_line_bytes: usize,
    _marker: PhantomData<fn() -> K>,
}

impl<K> HttpSource<K> {
    /// Create a source from configuration, loading the bearer token if one is configured
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SourceError::Network(format!("Failed to create HTTP client: {}", e)))?;

        let mut source = Self::with_client(client, &config.endpoint, &config.path);
        source.request_timeout = Duration::from_secs(config.request_timeout_secs);
        source.watch_timeout = Duration::from_secs(config.watch_timeout_secs);

        if let Some(path) = &config.token_file {
            source.token = Some(read_token(path)?);
        }

        Ok(source)
    }

    /// Create a source with a custom reqwest Client
    pub fn with_client(client: Client, endpoint: &str, path: &str) -> Self {
        Self {
            client,
            collection_url: format!(
                "{}/{}",
                endpoint.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            token: None,
            request_timeout: Duration::from_secs(30),
            watch_timeout: Duration::from_secs(300),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            _marker: PhantomData,
        }
    }

    /// Minimum server-side duration of one watch; each watch picks 1-2x this
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout;
        self
    }

    /// Reject watch lines longer than `max` bytes
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Authenticate every request with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// URL of the watched collection
    pub fn collection_url(&self) -> &str {
        &self.collection_url
    }

    /// Randomized so that many watchers do not reconnect in lockstep
    fn watch_timeout_secs(&self) -> u64 {
        let min = self.watch_timeout.as_secs().max(1);
        min.saturating_add(rand::thread_rng().gen_range(0..min))
    }

    fn request(&self, query: &[(&str, &str)]) -> RequestBuilder {
        let request = self.client.get(&self.collection_url).query(query);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SourceError> {
        let response = request.send().await.map_err(map_transport_error)?;

        match response.status() {
            StatusCode::OK => Ok(response),
            StatusCode::GONE => Err(SourceError::Gone(format!(
                "HTTP 410 from {}",
                self.collection_url
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!(url = %self.collection_url, status = %response.status(), "Request rejected");
                Err(SourceError::Unauthorized)
            }
            status => {
                warn!(url = %self.collection_url, status = %status, "Unexpected status");
                Err(SourceError::ServerError(status.as_u16()))
            }
        }
    }
}

#[async_trait]
impl<K> RemoteSource<K> for HttpSource<K>
where
    K: DeserializeOwned + Send + 'static,
{
    async fn list(&self) -> Result<ObjectList<K>, SourceError> {
        debug!(url = %self.collection_url, "Listing collection");

        let response = self
            .send(self.request(&[]).timeout(self.request_timeout))
            .await?;
        let body = response.bytes().await.map_err(map_transport_error)?;
        let list: ListResponse<K> = serde_json::from_slice(&body)
            .map_err(|e| SourceError::Malformed(format!("Failed to parse list: {}", e)))?;

        debug!(
            url = %self.collection_url,
            resource_version = %list.metadata.resource_version,
            items = list.items.len(),
            "Listed collection"
        );

        Ok(ObjectList {
            resource_version: list.metadata.resource_version,
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, SourceError> {
        let timeout_secs = self.watch_timeout_secs();
        debug!(
            url = %self.collection_url,
            resource_version,
            timeout_secs,
            "Opening watch"
        );

        let timeout_param = timeout_secs.to_string();
        let request = self
            .request(&[
                ("watch", "true"),
                ("resourceVersion", resource_version),
                ("timeoutSeconds", timeout_param.as_str()),
            ])
            .timeout(Duration::from_secs(timeout_secs).saturating_add(WATCH_DEADLINE_GRACE));
        let response = self.send(request).await?;

        Ok(decode_watch_stream(
            response.bytes_stream().boxed(),
            self.max_line_bytes,
        ))
    }
}

fn read_token(path: &str) -> Result<String, SourceError> {
    let token = std::fs::read_to_string(path)
        .map_err(|e| SourceError::Credentials(format!("Failed to read {}: {}", path, e)))?;
    let token = token.trim();
    if token.is_empty() {
        return Err(SourceError::Credentials(format!("Token file {} is empty", path)));
    }
    Ok(token.to_string())
}

fn map_transport_error(e: reqwest::Error) -> SourceError {
    if e.is_timeout() {
        SourceError::NetworkTimeout
    } else {
        SourceError::Network(e.to_string())
    }
}

fn map_line_error(e: LinesCodecError) -> SourceError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            SourceError::Malformed("Watch line exceeds maximum length".to_string())
        }
        LinesCodecError::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
            SourceError::Malformed(e.to_string())
        }
        LinesCodecError::Io(e) => {
            let message = e.to_string();
            match e.into_inner().map(|inner| inner.downcast::<reqwest::Error>()) {
                Some(Ok(transport)) => map_transport_error(*transport),
                _ => SourceError::Network(message),
            }
        }
    }
}

/// Turn a newline-delimited JSON body into watch events
///
/// A line longer than `max_line_bytes` yields one `Malformed` error and
/// ends the stream.
fn decode_watch_stream<K>(
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    max_line_bytes: usize,
) -> WatchStream<K>
where
    K: DeserializeOwned + Send + 'static,
{
    let reader = StreamReader::new(
        body.map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e))),
    );

    FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_bytes))
        .filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                Ok(line) => decode_watch_line::<K>(line.as_bytes()),
                Err(e) => Some(Err(map_line_error(e))),
            }
        })
        .boxed()
}

/// Decode one watch line; `None` for events that carry no change
fn decode_watch_line<K: DeserializeOwned>(line: &[u8]) -> Option<Result<WatchEvent<K>, SourceError>> {
    let raw: RawWatchEvent = match serde_json::from_slice(line) {
        Ok(raw) => raw,
        Err(e) => return Some(Err(SourceError::Malformed(e.to_string()))),
    };

    let decode = |object: serde_json::Value| {
        serde_json::from_value::<K>(object).map_err(|e| SourceError::Malformed(e.to_string()))
    };

    let event = match raw.event_type.as_str() {
        "ADDED" => decode(raw.object).map(WatchEvent::Added),
        "MODIFIED" => decode(raw.object).map(WatchEvent::Modified),
        "DELETED" => decode(raw.object).map(WatchEvent::Deleted),
        "BOOKMARK" => return None,
        "ERROR" => {
            let status: Status = serde_json::from_value(raw.object).unwrap_or_default();
            Err(match status.code {
                410 => SourceError::Gone(status.message),
                0 => SourceError::Malformed("ERROR event without status code".to_string()),
                code => SourceError::ServerError(code),
            })
        }
        other => Err(SourceError::Malformed(format!("Unknown event type: {}", other))),
    };

    Some(event)
}
