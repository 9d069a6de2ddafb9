//! Unix socket server for local clients
//!
//! One JSON request per line, one JSON response per line, answered by the
//! [`Smewtd`] facade. `Quit` or SIGTERM/SIGINT stops the accept loop; the
//! server then drains transfers for the grace period and removes its socket
//! and PID file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::facade::Smewtd;
use super::protocol::{DaemonRequest, DaemonResponse};
use crate::error::ErrorKind;
use crate::index::Record;
use crate::router::QueryError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Daemon already running on {0}")]
    SocketExists(PathBuf),
}

pub struct DaemonServer {
    facade: Arc<Smewtd>,
    socket_path: PathBuf,
    pid_path: PathBuf,
    /// How long shutdown waits for transfers before cancelling them
    grace: Duration,
}

/// A running server; dropping it does not stop the daemon
pub struct DaemonHandle {
    facade: Arc<Smewtd>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    /// Same as a `Quit` request
    pub fn shutdown(&self) {
        self.facade.quit();
    }

    /// Wait until the daemon has drained and cleaned up
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("Daemon task failed: {}", e);
        }
    }
}

impl DaemonServer {
    pub fn new(facade: Arc<Smewtd>, socket_path: PathBuf, pid_path: PathBuf, grace: Duration) -> Self {
        Self {
            facade,
            socket_path,
            pid_path,
            grace,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Bind the socket, write the PID file and start accepting clients.
    ///
    /// Fails with [`ServerError::SocketExists`] when another daemon answers
    /// on the socket. A socket file nobody listens on is replaced.
    pub async fn run(self) -> Result<DaemonHandle, ServerError> {
        let listener = self.bind().await?;
        write_pid_file(&self.pid_path)?;
        info!(socket = %self.socket_path.display(), "Daemon listening");

        let facade = Arc::clone(&self.facade);
        let task = tokio::spawn(serve(listener, self));

        Ok(DaemonHandle { facade, task })
    }

    async fn bind(&self) -> Result<UnixListener, ServerError> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if self.socket_path.exists() {
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(ServerError::SocketExists(self.socket_path.clone()));
            }
            debug!(socket = %self.socket_path.display(), "Removing stale socket");
            std::fs::remove_file(&self.socket_path)?;
        }

        Ok(UnixListener::bind(&self.socket_path)?)
    }
}

fn write_pid_file(pid_path: &Path) -> Result<(), ServerError> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let pid = std::process::id();
    std::fs::write(pid_path, pid.to_string())?;
    debug!(pid_file = %pid_path.display(), pid, "Wrote PID file");
    Ok(())
}

async fn serve(listener: UnixListener, server: DaemonServer) {
    let facade = server.facade;
    let mut shutdown = facade.subscribe_shutdown();
    let signal = os_signal();
    tokio::pin!(signal);

    let reason = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(stream, Arc::clone(&facade)));
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            _ = shutdown.recv() => break "quit requested",
            _ = &mut signal => {
                facade.quit();
                break "signal received";
            }
        }
    };

    info!(reason, "Stopping daemon");
    drop(listener);

    let cancelled = facade.drain(server.grace).await;
    if cancelled > 0 {
        warn!(cancelled, "Cancelled transfers still running at shutdown");
    }

    for path in [&server.socket_path, &server.pid_path] {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = %path.display(), error = %e, "Failed to remove daemon file"),
        }
    }
    info!("Daemon stopped");
}

/// Answer one client until it hangs up, quits, or the daemon shuts down
async fn serve_connection(stream: UnixStream, facade: Arc<Smewtd>) {
    let mut shutdown = facade.subscribe_shutdown();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.recv() => return,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("Client disconnected");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Client read failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => {
                debug!(?request, "Received request");
                handle_request(request, &facade).await
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse request");
                DaemonResponse::error(ErrorKind::InvalidRequest, format!("Invalid request: {}", e))
            }
        };

        let closing = matches!(response, DaemonResponse::ShuttingDown);
        if let Err(e) = write_frame(&mut write_half, &response).await {
            debug!(error = %e, "Failed to write response");
            return;
        }
        if closing {
            return;
        }
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, response: &DaemonResponse) -> Result<(), ServerError> {
    let mut frame = serde_json::to_vec(response)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Map one request onto the facade.
///
/// Everything except `Ping` and `Quit` is refused once shutdown started.
pub async fn handle_request(request: DaemonRequest, facade: &Smewtd) -> DaemonResponse {
    match request {
        DaemonRequest::Ping => DaemonResponse::Pong,

        DaemonRequest::Quit => {
            info!("Quit requested over IPC");
            facade.quit();
            DaemonResponse::ShuttingDown
        }

        _ if facade.is_shutting_down() => {
            DaemonResponse::error(ErrorKind::ShuttingDown, "Daemon is shutting down")
        }

        DaemonRequest::Query { text } => records(facade.query(&text).await),

        DaemonRequest::QueryLucene { text } => records(facade.query_lucene(&text).await),

        DaemonRequest::QueryMovies => records(facade.query_movies().await),

        DaemonRequest::DistantQuery { host, text } => {
            records(facade.distant_query(&host, &text).await)
        }

        DaemonRequest::Broadcast { text } => {
            DaemonResponse::BroadcastRecords(facade.broadcast_query(&text).await)
        }

        DaemonRequest::StartDownload { friend, filename } => {
            match facade.start_download(&friend, &filename) {
                Ok(info) => DaemonResponse::TransferStarted(info),
                Err(e) => DaemonResponse::error(e.kind(), e.to_string()),
            }
        }

        DaemonRequest::ListTransfers => DaemonResponse::TransferList(facade.transfers()),

        DaemonRequest::GetTransfer { id } => match facade.transfer(id) {
            Ok(info) => DaemonResponse::Transfer(info),
            Err(e) => DaemonResponse::error(e.kind(), e.to_string()),
        },

        DaemonRequest::AcknowledgeTransfer { id } => match facade.acknowledge_transfer(id) {
            Ok(_) => DaemonResponse::Acknowledged { id },
            Err(e) => DaemonResponse::error(e.kind(), e.to_string()),
        },

        DaemonRequest::ListFriends => DaemonResponse::Friends(facade.friends()),
    }
}

fn records(result: Result<Vec<Record>, QueryError>) -> DaemonResponse {
    match result {
        Ok(records) => DaemonResponse::Records(records),
        Err(e) => DaemonResponse::error(e.kind(), e.to_string()),
    }
}

/// Resolves on SIGINT or SIGTERM
async fn os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// PID recorded by a running daemon, if any
pub fn read_daemon_pid(pid_path: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}
