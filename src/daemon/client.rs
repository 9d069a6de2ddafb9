//! Client side of the daemon's Unix socket
//!
//! [`DaemonClient`] wraps the newline-delimited JSON protocol with typed
//! methods, one per request. The CLI uses it for every command but `serve`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tracing::{debug, trace};

use super::protocol::{DaemonRequest, DaemonResponse};
use crate::error::ErrorKind;
use crate::index::Record;
use crate::registry::FriendInfo;
use crate::router::QueryOutcome;
use crate::transfer::{TransferId, TransferInfo};

/// Default timeout for daemon operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors that can occur when communicating with the daemon
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(std::io::Error),

    #[error("Daemon is not running")]
    DaemonNotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("{message}")]
    Daemon { kind: ErrorKind, message: String },

    #[error("Unexpected response from daemon")]
    UnexpectedResponse,

    #[error("Connection closed by daemon")]
    ConnectionClosed,
}

impl ClientError {
    /// Error kind reported by the daemon, if the daemon answered
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            ClientError::Daemon { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Turn any response the caller did not ask for into an error
fn unexpected(response: DaemonResponse) -> ClientError {
    match response {
        DaemonResponse::Error { kind, message } => ClientError::Daemon { kind, message },
        _ => ClientError::UnexpectedResponse,
    }
}

/// Typed connection to a running smewtd
pub struct DaemonClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    /// Connect to the daemon listening on `socket_path`
    ///
    /// A missing socket file and a refused connection both mean
    /// [`ClientError::DaemonNotRunning`].
    pub async fn connect_to(socket_path: PathBuf) -> Result<Self, ClientError> {
        debug!(socket = %socket_path.display(), "Connecting to daemon");

        let stream = match UnixStream::connect(&socket_path).await {
            Ok(stream) => stream,
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused) => {
                return Err(ClientError::DaemonNotRunning)
            }
            Err(e) => return Err(ClientError::ConnectionFailed(e)),
        };
        let (read_half, writer) = stream.into_split();

        Ok(Self {
            lines: BufReader::new(read_half).lines(),
            writer,
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Override the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn send_request(&mut self, request: DaemonRequest) -> Result<DaemonResponse, ClientError> {
        let limit = self.timeout;
        tokio::time::timeout(limit, self.exchange(&request))
            .await
            .map_err(|_| ClientError::Timeout)?
    }

    async fn exchange(&mut self, request: &DaemonRequest) -> Result<DaemonResponse, ClientError> {
        let mut frame = serde_json::to_vec(request)?;
        frame.push(b'\n');
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;

        let line = self
            .lines
            .next_line()
            .await?
            .ok_or(ClientError::ConnectionClosed)?;
        trace!(response = %line, "Daemon answered");
        Ok(serde_json::from_str(&line)?)
    }

    async fn records(&mut self, request: DaemonRequest) -> Result<Vec<Record>, ClientError> {
        match self.send_request(request).await? {
            DaemonResponse::Records(records) => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&mut self) -> Result<bool, ClientError> {
        match self.send_request(DaemonRequest::Ping).await? {
            DaemonResponse::Pong => Ok(true),
            other => Err(unexpected(other)),
        }
    }

    pub async fn query(&mut self, text: &str) -> Result<Vec<Record>, ClientError> {
        self.records(DaemonRequest::Query {
            text: text.to_string(),
        })
        .await
    }

    pub async fn query_lucene(&mut self, text: &str) -> Result<Vec<Record>, ClientError> {
        self.records(DaemonRequest::QueryLucene {
            text: text.to_string(),
        })
        .await
    }

    pub async fn query_movies(&mut self) -> Result<Vec<Record>, ClientError> {
        self.records(DaemonRequest::QueryMovies).await
    }

    pub async fn distant_query(&mut self, host: &str, text: &str) -> Result<Vec<Record>, ClientError> {
        self.records(DaemonRequest::DistantQuery {
            host: host.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn broadcast(&mut self, text: &str) -> Result<QueryOutcome, ClientError> {
        let request = DaemonRequest::Broadcast {
            text: text.to_string(),
        };
        match self.send_request(request).await? {
            DaemonResponse::BroadcastRecords(outcome) => Ok(outcome),
            other => Err(unexpected(other)),
        }
    }

    pub async fn start_download(
        &mut self,
        friend: &str,
        filename: &str,
    ) -> Result<TransferInfo, ClientError> {
        let request = DaemonRequest::StartDownload {
            friend: friend.to_string(),
            filename: filename.to_string(),
        };
        match self.send_request(request).await? {
            DaemonResponse::TransferStarted(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_transfers(&mut self) -> Result<Vec<TransferInfo>, ClientError> {
        match self.send_request(DaemonRequest::ListTransfers).await? {
            DaemonResponse::TransferList(transfers) => Ok(transfers),
            other => Err(unexpected(other)),
        }
    }

    pub async fn get_transfer(&mut self, id: TransferId) -> Result<TransferInfo, ClientError> {
        match self.send_request(DaemonRequest::GetTransfer { id }).await? {
            DaemonResponse::Transfer(info) => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    pub async fn acknowledge_transfer(&mut self, id: TransferId) -> Result<(), ClientError> {
        match self.send_request(DaemonRequest::AcknowledgeTransfer { id }).await? {
            DaemonResponse::Acknowledged { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_friends(&mut self) -> Result<Vec<FriendInfo>, ClientError> {
        match self.send_request(DaemonRequest::ListFriends).await? {
            DaemonResponse::Friends(friends) => Ok(friends),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the daemon to shut down; returns once it acknowledged
    pub async fn quit(&mut self) -> Result<(), ClientError> {
        match self.send_request(DaemonRequest::Quit).await? {
            DaemonResponse::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
