//! # HTTP Transport
//!
//! Talks to the sync service: the long-lived replication stream and the
//! write checkpoint lookup.
//!
//! ## Requests
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POST {endpoint}/sync/stream                                            │
//! │    Authorization: Token <token>                                         │
//! │    Accept: application/x-ndjson                                        │
//! │    {"buckets":[{"name":"b1","after":"10"}],"include_checksum":true}     │
//! │                                                                         │
//! │  ◄── chunked body, one JSON object per line:                            │
//! │      {"checkpoint":{...}}\n{"data":{...}}\n{"checkpoint_complete":..}\n │
//! │      chunk boundaries fall anywhere, lines are re-assembled             │
//! │                                                                         │
//! │  GET {endpoint}/write-checkpoint2.json?client_id=<id>                   │
//! │  ◄── {"data":{"write_checkpoint":"123"}}                                │
//! │                                                                         │
//! │  401 ──► SyncError::Unauthorized     other non-2xx ──► Network          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use basin_core::{Credentials, StreamingSyncRequest};

use crate::error::{SyncError, SyncResult};

/// Raw stream lines, one JSON document each.
pub type LineStream = BoxStream<'static, SyncResult<String>>;

/// Network side of the sync client.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Opens the replication stream.
    async fn open_stream(
        &self,
        credentials: &Credentials,
        request: &StreamingSyncRequest,
    ) -> SyncResult<LineStream>;

    /// Asks the service for a write checkpoint covering everything this
    /// client uploaded so far.
    async fn write_checkpoint(&self, credentials: &Credentials, client_id: &str)
        -> SyncResult<String>;
}

// =============================================================================
// reqwest implementation
// =============================================================================

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> SyncResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("basin-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpTransport { client })
    }

    /// Uses an existing client, e.g. one with custom TLS roots.
    pub fn with_client(client: Client) -> Self {
        HttpTransport { client }
    }

    fn url(credentials: &Credentials, path: &str) -> SyncResult<Url> {
        Ok(Url::parse(&format!("{}{}", credentials.endpoint_url(), path))?)
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn open_stream(
        &self,
        credentials: &Credentials,
        request: &StreamingSyncRequest,
    ) -> SyncResult<LineStream> {
        let url = Self::url(credentials, "/sync/stream")?;
        debug!(%url, buckets = request.buckets.len(), "Opening sync stream");

        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Token {}", credentials.token))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/x-ndjson")
            .json(request)
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(split_lines(Box::pin(response.bytes_stream())).boxed())
    }

    async fn write_checkpoint(
        &self,
        credentials: &Credentials,
        client_id: &str,
    ) -> SyncResult<String> {
        let mut url = Self::url(credentials, "/write-checkpoint2.json")?;
        url.query_pairs_mut().append_pair("client_id", client_id);

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Token {}", credentials.token))
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;

        match body.pointer("/data/write_checkpoint") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(SyncError::Protocol(format!(
                "write checkpoint response without data.write_checkpoint: {body}"
            ))),
        }
    }
}

/// Maps error statuses, keeping a snippet of the body for the log.
async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status == StatusCode::UNAUTHORIZED {
        warn!(%status, "Sync service rejected the token");
        return Err(SyncError::Unauthorized(detail));
    }
    Err(SyncError::Network(detail))
}

// =============================================================================
// Line splitting
// =============================================================================

/// Longest line accepted from the sync stream.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

struct LineState<S> {
    chunks: S,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no newline.
    scanned: usize,
    max_line: usize,
    done: bool,
}

impl<S> LineState<S> {
    fn fail(&mut self, error: SyncError) -> SyncError {
        self.done = true;
        self.buffer.clear();
        self.scanned = 0;
        error
    }

    fn too_long(&mut self) -> SyncError {
        let error = SyncError::Protocol(format!(
            "stream line exceeds {} bytes",
            self.max_line
        ));
        self.fail(error)
    }
}

/// Re-assembles newline-delimited text from arbitrary chunks.
///
/// Blank lines are skipped. A trailing line without `\n` is emitted when
/// the body ends. The stream ends after the first chunk error or the first
/// line longer than [`MAX_LINE_BYTES`].
pub fn split_lines<S, B, E>(chunks: S) -> impl Stream<Item = SyncResult<String>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<SyncError>,
{
    split_lines_with_limit(chunks, MAX_LINE_BYTES)
}

/// [`split_lines`] with an explicit line size limit.
pub fn split_lines_with_limit<S, B, E>(
    chunks: S,
    max_line: usize,
) -> impl Stream<Item = SyncResult<String>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Into<SyncError>,
{
    let state = LineState {
        chunks,
        buffer: Vec::new(),
        scanned: 0,
        max_line,
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(offset) = st.buffer[st.scanned..].iter().position(|b| *b == b'\n') {
                let pos = st.scanned + offset;
                st.scanned = 0;
                if pos > st.max_line {
                    let error = st.too_long();
                    return Some((Err(error), st));
                }
                let line: Vec<u8> = st.buffer.drain(..=pos).collect();
                match decode_line(line) {
                    Ok(Some(text)) => return Some((Ok(text), st)),
                    Ok(None) => continue,
                    Err(e) => return Some((Err(e), st)),
                }
            }
            st.scanned = st.buffer.len();

            if st.buffer.len() > st.max_line {
                let error = st.too_long();
                return Some((Err(error), st));
            }

            if st.done {
                let rest = std::mem::take(&mut st.buffer);
                st.scanned = 0;
                return match decode_line(rest) {
                    Ok(Some(text)) => Some((Ok(text), st)),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), st)),
                };
            }

            match st.chunks.next().await {
                Some(Ok(chunk)) => st.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    let error = st.fail(e.into());
                    return Some((Err(error), st));
                }
                None => st.done = true,
            }
        }
    })
}

fn decode_line(bytes: Vec<u8>) -> SyncResult<Option<String>> {
    let text = String::from_utf8(bytes)
        .map_err(|e| SyncError::Protocol(format!("stream line is not UTF-8: {e}")))?;
    let trimmed = text.trim();
    Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
}

// =============================================================================
// Scripted transport for tests
// =============================================================================


#[cfg(test)]
mod tests {
    use futures_util::stream;

    use super::*;

    async fn collect(chunks: Vec<Result<&'static str, SyncError>>) -> Vec<SyncResult<String>> {
        split_lines(stream::iter(chunks)).collect().await
    }

    #[tokio::test]
    async fn lines_are_reassembled_across_chunks() {
        let lines = collect(vec![
            Ok("{\"token_expires_in\":"),
            Ok("30}\n\n{\"checkpoint_complete\""),
            Ok(":{}}\n{\"data\":1}"),
        ])
        .await;

        let lines: Vec<String> = lines.into_iter().map(Result::unwrap).collect();
        assert_eq!(
            lines,
            [
                "{\"token_expires_in\":30}",
                "{\"checkpoint_complete\":{}}",
                "{\"data\":1}"
            ]
        );
    }

    #[tokio::test]
    async fn chunk_error_ends_the_stream() {
        let lines = collect(vec![
            Ok("{\"a\":1}\n{\"partial"),
            Err(SyncError::Network("reset".into())),
            Ok("ignored\n"),
        ])
        .await;

        assert_eq!(lines.len(), 2);
        assert!(lines[0].is_ok());
        assert!(matches!(lines[1], Err(SyncError::Network(_))));
    }

    #[tokio::test]
    async fn oversized_line_ends_the_stream() {
        let chunks = stream::iter(vec![
            Ok::<_, SyncError>("{\"a\":1}\n{\"long\":\""),
            Ok("xxxxxxxxxxxxxxxxxxxxxxxx"),
            Ok("\"}\n{\"b\":2}\n"),
        ]);
        let lines: Vec<_> = split_lines_with_limit(chunks, 16).collect().await;

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].as_ref().unwrap(), "{\"a\":1}");
        assert!(matches!(&lines[1], Err(SyncError::Protocol(m)) if m.contains("16 bytes")));
    }

    #[tokio::test]
    async fn oversized_line_within_one_chunk_is_rejected() {
        let chunks = stream::iter(vec![Ok::<_, SyncError>("{\"long\":\"xxxxxxxxxxxxxxxxxxxx\"}\n")]);
        let lines: Vec<_> = split_lines_with_limit(chunks, 16).collect().await;

        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], Err(SyncError::Protocol(_))));
    }

    #[tokio::test]
    async fn lines_split_over_many_small_chunks() {
        let text = "{\"token_expires_in\":30}\n{\"checkpoint_complete\":{}}\n";
        let chunks: Vec<Result<String, SyncError>> =
            text.chars().map(|c| Ok(c.to_string())).collect();
        let lines: Vec<String> = split_lines_with_limit(stream::iter(chunks), 32)
            .map(Result::unwrap)
            .collect()
            .await;

        assert_eq!(lines, ["{\"token_expires_in\":30}", "{\"checkpoint_complete\":{}}"]);
    }

    #[test]
    fn endpoint_is_joined_without_double_slash() {
        let creds = Credentials::new("https://sync.example.com/", "t");
        let url = HttpTransport::url(&creds, "/sync/stream").unwrap();
        assert_eq!(url.as_str(), "https://sync.example.com/sync/stream");
    }
}
