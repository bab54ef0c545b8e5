//! Client Connection
//!
//! Unix socket connection to the daemon plus typed helpers for each request.

use std::path::Path;

use log::debug;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::processing::ProcessOutcome;
use crate::search::SearchQuery;

use super::protocol::{
    decode_message, encode_message, DaemonStatus, EncodedSnapshot, Request, Response,
    MAX_MESSAGE_SIZE,
};

/// Errors that can occur when communicating with the daemon
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Daemon is not running. Start it with: rekal daemon")]
    DaemonNotRunning,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Unexpected response from daemon")]
    UnexpectedResponse,

    #[error("Daemon error: {0}")]
    DaemonError(String),
}

/// Client connection to the daemon
pub struct DaemonClient {
    stream: UnixStream,
}

impl DaemonClient {
    pub async fn connect_to(socket_path: &Path) -> Result<Self, ClientError> {
        debug!("Connecting to daemon at: {}", socket_path.display());

        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound
                || e.kind() == std::io::ErrorKind::ConnectionRefused
            {
                ClientError::DaemonNotRunning
            } else {
                ClientError::ConnectionFailed(e.to_string())
            }
        })?;

        Ok(Self { stream })
    }

    /// Send a request and receive its response. Error responses are returned
    /// as `Ok(Response::Error { .. })`.
    pub async fn send(&mut self, request: Request) -> Result<Response, ClientError> {
        let encoded = encode_message(&request)
            .map_err(|e| ClientError::RequestFailed(format!("Failed to encode request: {e}")))?;

        self.stream
            .write_all(&encoded)
            .await
            .map_err(|e| ClientError::RequestFailed(format!("Failed to send request: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| ClientError::RequestFailed(format!("Failed to flush: {e}")))?;

        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await.map_err(|e| {
            ClientError::RequestFailed(format!("Failed to read response length: {e}"))
        })?;

        let msg_len = u32::from_le_bytes(len_buf) as usize;
        if msg_len > MAX_MESSAGE_SIZE {
            return Err(ClientError::RequestFailed(format!(
                "Response too large: {msg_len} bytes"
            )));
        }

        let mut payload = vec![0u8; msg_len];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| ClientError::RequestFailed(format!("Failed to read response: {e}")))?;

        decode_message(&payload)
            .map_err(|e| ClientError::RequestFailed(format!("Failed to decode response: {e}")))
    }

    async fn request<T>(
        &mut self,
        request: Request,
        extract: impl FnOnce(Response) -> Option<T>,
    ) -> Result<T, ClientError> {
        match self.send(request).await? {
            Response::Error { code, message } => {
                Err(ClientError::DaemonError(format!("{code:?}: {message}")))
            }
            response => extract(response).ok_or(ClientError::UnexpectedResponse),
        }
    }

    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.request(Request::Ping, |r| matches!(r, Response::Pong).then_some(()))
            .await
    }

    pub async fn status(&mut self) -> Result<DaemonStatus, ClientError> {
        self.request(Request::Status, |r| match r {
            Response::Status(status) => Some(status),
            _ => None,
        })
        .await
    }

    pub async fn set_recording(&mut self, recording: bool) -> Result<bool, ClientError> {
        self.request(Request::SetRecording { recording }, recording_status)
            .await
    }

    pub async fn recording_status(&mut self) -> Result<bool, ClientError> {
        self.request(Request::GetRecordingStatus, recording_status)
            .await
    }

    pub async fn queued_count(&mut self) -> Result<usize, ClientError> {
        self.request(Request::GetQueuedCount, |r| match r {
            Response::QueuedCount { count } => Some(count),
            _ => None,
        })
        .await
    }

    pub async fn process_now(&mut self) -> Result<ProcessOutcome, ClientError> {
        self.request(Request::ProcessNow, |r| match r {
            Response::Processed { outcome } => Some(outcome),
            _ => None,
        })
        .await
    }

    pub async fn parse_query(
        &mut self,
        text: &str,
        full_text: bool,
    ) -> Result<SearchQuery, ClientError> {
        let request = Request::ParseQuery {
            text: text.to_string(),
            full_text,
        };
        self.request(request, |r| match r {
            Response::Query { query } => Some(query),
            _ => None,
        })
        .await
    }

    pub async fn search(&mut self, text: &str, full_text: bool) -> Result<Vec<i64>, ClientError> {
        let request = Request::Search {
            text: text.to_string(),
            full_text,
        };
        self.request(request, timestamps).await
    }

    pub async fn fetch_timestamps(&mut self, query: SearchQuery) -> Result<Vec<i64>, ClientError> {
        self.request(Request::FetchTimestamps { query }, timestamps)
            .await
    }

    /// Fetch every requested snapshot that exists, following the daemon's
    /// pages until nothing is left. Ascending by timestamp.
    pub async fn fetch_snapshots(
        &mut self,
        timestamps: Vec<i64>,
    ) -> Result<Vec<EncodedSnapshot>, ClientError> {
        let mut fetched = Vec::new();
        let mut pending = timestamps;
        loop {
            let (page, remaining) = self
                .request(Request::FetchSnapshots { timestamps: pending }, snapshots)
                .await?;
            if remaining.is_empty() {
                fetched.extend(page);
                break;
            }
            if page.is_empty() {
                return Err(ClientError::UnexpectedResponse);
            }
            fetched.extend(page);
            pending = remaining;
        }
        fetched.sort_by_key(|snapshot| snapshot.timestamp);
        Ok(fetched)
    }

    /// Metadata of everything still buffered; images come from
    /// [`fetch_snapshots`](Self::fetch_snapshots).
    pub async fn fetch_buffered_snapshots(&mut self) -> Result<Vec<EncodedSnapshot>, ClientError> {
        let (snapshots, _) = self
            .request(Request::FetchBufferedSnapshots, snapshots)
            .await?;
        Ok(snapshots)
    }
}

fn recording_status(response: Response) -> Option<bool> {
    match response {
        Response::RecordingStatus { recording } => Some(recording),
        _ => None,
    }
}

fn timestamps(response: Response) -> Option<Vec<i64>> {
    match response {
        Response::Timestamps { timestamps } => Some(timestamps),
        _ => None,
    }
}

fn snapshots(response: Response) -> Option<(Vec<EncodedSnapshot>, Vec<i64>)> {
    match response {
        Response::Snapshots {
            snapshots,
            remaining,
        } => Some((snapshots, remaining)),
        _ => None,
    }
}
