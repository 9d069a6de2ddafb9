//! Download manager: pulls files from friends into the incoming folder.
//!
//! Each transfer streams into its own `.smewt-<id>.part` file at the root of
//! the incoming folder and is renamed over the destination only once every
//! byte is on disk, so a destination is never partially visible. The table
//! of transfers sits behind a `std::sync::Mutex` that is never held across
//! an `.await`.

pub mod store;

pub use store::{DatabaseError, TransferStore};

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::registry::{Friend, PeerRegistry, RegistryError};
use crate::remote::{FileFetcher, PeerError};
use crate::router::peer_error_kind;

/// Prefix of in-progress download files; reserved in the incoming folder root
pub const TEMP_PREFIX: &str = ".smewt-";

/// Cause recorded for transfers found unfinished at startup
pub const RESTART_CAUSE: &str = "interrupted by daemon restart";

/// Unique identifier for a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Transferring,
    Complete,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Complete | TransferState::Failed)
    }
}

/// Snapshot of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub id: TransferId,
    pub friend: String,
    pub filename: String,
    pub destination: PathBuf,
    pub state: TransferState,
    pub bytes_received: u64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub cause: Option<String>,
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Unknown friend: {0}")]
    UnknownFriend(String),

    #[error("Invalid filename '{filename}': {reason}")]
    InvalidFilename { filename: String, reason: String },

    #[error("'{filename}' is already being downloaded from {friend}")]
    AlreadyInProgress { friend: String, filename: String },

    #[error("Transfer not found: {0}")]
    NotFound(TransferId),

    #[error("Transfer {0} is still running")]
    StillRunning(TransferId),

    #[error("Daemon is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No data received for {0:?}")]
    Stalled(Duration),

    #[error("Cancelled by shutdown")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<RegistryError> for TransferError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownFriend(name) | RegistryError::DuplicateFriend(name) => {
                TransferError::UnknownFriend(name)
            }
        }
    }
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::UnknownFriend(_) => ErrorKind::UnknownFriend,
            TransferError::InvalidFilename { .. } => ErrorKind::InvalidFilename,
            TransferError::AlreadyInProgress { .. } => ErrorKind::TransferAlreadyInProgress,
            TransferError::NotFound(_) => ErrorKind::TransferNotFound,
            TransferError::StillRunning(_) => ErrorKind::InvalidRequest,
            TransferError::ShuttingDown => ErrorKind::ShuttingDown,
            TransferError::Peer(e) => peer_error_kind(e),
            TransferError::Io(_) | TransferError::Stalled(_) | TransferError::Cancelled => {
                ErrorKind::TransferFailed
            }
            TransferError::Database(_) => ErrorKind::Internal,
        }
    }
}

/// Check a requested filename and return it as a clean relative path.
///
/// Rejects anything that could land outside the incoming folder or collide
/// with an in-progress download file. Runs before any file I/O.
pub fn validate_filename(filename: &str) -> Result<PathBuf, TransferError> {
    let invalid = |reason: &str| TransferError::InvalidFilename {
        filename: filename.to_string(),
        reason: reason.to_string(),
    };

    if filename.trim().is_empty() {
        return Err(invalid("empty filename"));
    }
    if filename.contains('\0') {
        return Err(invalid("contains a NUL byte"));
    }
    if filename.contains('\\') {
        return Err(invalid("contains a backslash"));
    }

    let mut clean = PathBuf::new();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => {
                if clean.as_os_str().is_empty() && part.to_string_lossy().starts_with(TEMP_PREFIX) {
                    return Err(invalid("reserved name"));
                }
                clean.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(invalid("parent directory reference")),
            Component::RootDir | Component::Prefix(_) => return Err(invalid("absolute path")),
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(invalid("names no file"));
    }
    Ok(clean)
}

/// Path of the in-progress file for a transfer
pub fn temp_path(incoming: &Path, id: TransferId) -> PathBuf {
    incoming.join(format!("{}{}.part", TEMP_PREFIX, id))
}

#[derive(Default)]
struct Table {
    transfers: HashMap<TransferId, TransferInfo>,
    /// (friend, filename) of non-terminal transfers
    in_flight: HashMap<(String, String), TransferId>,
}

struct Inner {
    registry: Arc<PeerRegistry>,
    fetcher: Arc<dyn FileFetcher>,
    incoming: PathBuf,
    idle_timeout: Duration,
    store: Mutex<TransferStore>,
    table: Mutex<Table>,
    /// Number of transfers not yet terminal
    active: watch::Sender<usize>,
    cancel: watch::Sender<bool>,
    accepting: AtomicBool,
}

/// Owns every transfer and the tasks moving their bytes
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    pub fn new(
        registry: Arc<PeerRegistry>,
        fetcher: Arc<dyn FileFetcher>,
        incoming: PathBuf,
        idle_timeout: Duration,
        store: TransferStore,
    ) -> Self {
        let (active, _) = watch::channel(0);
        let (cancel, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                registry,
                fetcher,
                incoming,
                idle_timeout,
                store: Mutex::new(store),
                table: Mutex::new(Table::default()),
                active,
                cancel,
                accepting: AtomicBool::new(true),
            }),
        }
    }

    pub fn incoming_folder(&self) -> &Path {
        &self.inner.incoming
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn store(&self) -> MutexGuard<'_, TransferStore> {
        self.inner.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist_insert(&self, info: &TransferInfo) {
        if let Err(e) = self.store().insert_transfer(info) {
            warn!(transfer_id = %info.id, error = %e, "Failed to record transfer");
        }
    }

    fn persist_update(&self, info: &TransferInfo) {
        if let Err(e) = self.store().update_transfer(info) {
            warn!(transfer_id = %info.id, error = %e, "Failed to update transfer record");
        }
    }

    /// Start pulling `filename` from `friend`.
    ///
    /// Validation happens here, synchronously; the bytes move on a spawned
    /// task. The returned snapshot is PENDING.
    pub fn start_download(&self, friend: &str, filename: &str) -> Result<TransferInfo, TransferError> {
        if !self.is_accepting() {
            return Err(TransferError::ShuttingDown);
        }

        let friend = self.inner.registry.lookup(friend)?.clone();
        let relative = validate_filename(filename)?;
        let filename = relative.to_string_lossy().into_owned();
        let destination = self.inner.incoming.join(&relative);

        let info = {
            let mut table = self.table();
            // Re-checked under the lock that `stop_accepting` takes, so a
            // transfer is either refused or counted by `shutdown`.
            if !self.is_accepting() {
                return Err(TransferError::ShuttingDown);
            }
            let key = (friend.name.clone(), filename.clone());
            if table.in_flight.contains_key(&key) {
                return Err(TransferError::AlreadyInProgress {
                    friend: friend.name,
                    filename,
                });
            }

            let info = TransferInfo {
                id: TransferId::new(),
                friend: friend.name.clone(),
                filename: filename.clone(),
                destination: destination.clone(),
                state: TransferState::Pending,
                bytes_received: 0,
                started_at: chrono::Utc::now(),
                finished_at: None,
                cause: None,
            };
            table.in_flight.insert(key, info.id);
            table.transfers.insert(info.id, info.clone());
            self.inner.active.send_modify(|n| *n += 1);
            info
        };

        self.persist_insert(&info);
        info!(
            transfer_id = %info.id,
            friend = %friend.name,
            filename = %filename,
            "Download queued"
        );

        let manager = self.clone();
        let id = info.id;
        tokio::spawn(async move {
            manager.run(id, friend, filename, destination).await;
        });

        Ok(info)
    }

    async fn run(self, id: TransferId, friend: Friend, filename: String, destination: PathBuf) {
        let temp = temp_path(&self.inner.incoming, id);
        let mut cancel = self.inner.cancel.subscribe();

        match self.receive(id, &friend, &filename, &temp, &destination, &mut cancel).await {
            Ok(bytes) => {
                info!(transfer_id = %id, friend = %friend.name, bytes, "Download complete");
                self.finish(id, TransferState::Complete, None);
            }
            Err(e) => {
                if let Err(rm) = tokio::fs::remove_file(&temp).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        error!(transfer_id = %id, error = %rm, "Failed to remove partial file");
                    }
                }
                warn!(transfer_id = %id, friend = %friend.name, error = %e, "Download failed");
                self.finish(id, TransferState::Failed, Some(e.to_string()));
            }
        }
    }

    async fn receive(
        &self,
        id: TransferId,
        friend: &Friend,
        filename: &str,
        temp: &Path,
        destination: &Path,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<u64, TransferError> {
        let idle = self.inner.idle_timeout;

        let mut stream = tokio::select! {
            result = self.inner.fetcher.fetch(friend, filename) => result?,
            _ = cancelled(cancel) => return Err(TransferError::Cancelled),
        };

        let incoming = tokio::fs::metadata(&self.inner.incoming).await?;
        if !incoming.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", self.inner.incoming.display()),
            )
            .into());
        }
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        self.update(id, |t| t.state = TransferState::Transferring, true);
        debug!(transfer_id = %id, temp = %temp.display(), "Receiving");

        let mut file = tokio::fs::File::create(temp).await?;
        let mut received: u64 = 0;

        loop {
            let next = tokio::select! {
                next = tokio::time::timeout(idle, stream.next()) => {
                    next.map_err(|_| TransferError::Stalled(idle))?
                }
                _ = cancelled(cancel) => return Err(TransferError::Cancelled),
            };

            let Some(chunk) = next else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            self.update(id, |t| t.bytes_received = received, false);
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(temp, destination).await?;
        Ok(received)
    }

    fn update(&self, id: TransferId, apply: impl FnOnce(&mut TransferInfo), persist: bool) {
        let snapshot = {
            let mut table = self.table();
            let Some(info) = table.transfers.get_mut(&id) else {
                return;
            };
            apply(info);
            info.clone()
        };
        if persist {
            self.persist_update(&snapshot);
        }
    }

    fn finish(&self, id: TransferId, state: TransferState, cause: Option<String>) {
        let snapshot = {
            let mut table = self.table();
            let Some(info) = table.transfers.get_mut(&id) else {
                return;
            };
            info.state = state;
            info.finished_at = Some(chrono::Utc::now());
            info.cause = cause;
            let snapshot = info.clone();
            table
                .in_flight
                .remove(&(snapshot.friend.clone(), snapshot.filename.clone()));
            snapshot
        };

        self.persist_update(&snapshot);
        self.inner.active.send_modify(|n| *n = n.saturating_sub(1));
    }

    pub fn get(&self, id: TransferId) -> Result<TransferInfo, TransferError> {
        self.table()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(TransferError::NotFound(id))
    }

    /// All known transfers, oldest first
    pub fn list(&self) -> Vec<TransferInfo> {
        let mut transfers: Vec<TransferInfo> = self.table().transfers.values().cloned().collect();
        transfers.sort_by_key(|t| t.started_at);
        transfers
    }

    /// Forget a terminal transfer
    pub fn acknowledge(&self, id: TransferId) -> Result<TransferInfo, TransferError> {
        let removed = {
            let mut table = self.table();
            let info = table.transfers.get(&id).ok_or(TransferError::NotFound(id))?;
            if !info.state.is_terminal() {
                return Err(TransferError::StillRunning(id));
            }
            table.transfers.remove(&id)
        };

        self.store().delete_transfer(id)?;
        debug!(transfer_id = %id, "Transfer acknowledged");
        removed.ok_or(TransferError::NotFound(id))
    }

    /// Load persisted transfers, failing the ones a previous run left unfinished.
    ///
    /// Also sweeps leftover in-progress files from the incoming folder. Call
    /// before the first download starts.
    pub fn restore_on_startup(&self) -> Result<usize, TransferError> {
        info!("Restoring transfer state on daemon startup");

        let transfers = self.store().list_transfers()?;
        let mut interrupted = 0;
        let mut table = self.table();

        for mut transfer in transfers {
            if !transfer.state.is_terminal() {
                warn!(
                    transfer_id = %transfer.id,
                    friend = %transfer.friend,
                    filename = %transfer.filename,
                    "Transfer was running when the daemon stopped, marking as failed"
                );
                transfer.state = TransferState::Failed;
                transfer.finished_at = Some(chrono::Utc::now());
                transfer.cause = Some(RESTART_CAUSE.to_string());
                self.store().update_transfer(&transfer)?;
                interrupted += 1;
            }
            table.transfers.insert(transfer.id, transfer);
        }
        drop(table);

        self.sweep_partial_files();
        Ok(interrupted)
    }

    fn sweep_partial_files(&self) {
        let entries = match std::fs::read_dir(&self.inner.incoming) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(folder = %self.inner.incoming.display(), error = %e, "Cannot read incoming folder");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TEMP_PREFIX) && name.ends_with(".part") {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => debug!(file = %name, "Removed partial download"),
                    Err(e) => warn!(file = %name, error = %e, "Failed to remove partial download"),
                }
            }
        }
    }

    /// Drop terminal transfers that started more than `max_age_hours` ago
    pub fn cleanup_old_transfers(&self, max_age_hours: u64) -> Result<usize, TransferError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::hours(max_age_hours as i64);

        let expired: Vec<TransferId> = {
            let mut table = self.table();
            let expired: Vec<TransferId> = table
                .transfers
                .values()
                .filter(|t| t.state.is_terminal() && t.started_at < cutoff)
                .map(|t| t.id)
                .collect();
            for id in &expired {
                table.transfers.remove(id);
            }
            expired
        };

        let store = self.store();
        for id in &expired {
            store.delete_transfer(*id)?;
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Cleaned up old transfers");
        }
        Ok(expired.len())
    }

    /// Number of transfers not yet COMPLETE or FAILED
    pub fn in_flight(&self) -> usize {
        *self.inner.active.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Refuse new downloads from now on
    pub fn stop_accepting(&self) {
        let _table = self.table();
        self.inner.accepting.store(false, Ordering::SeqCst);
    }

    /// Resolve once no transfer is in flight
    pub async fn wait_idle(&self) {
        let mut active = self.inner.active.subscribe();
        let _ = active.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting, give running transfers `grace` to finish, then cancel
    /// the rest. Returns how many had to be cancelled.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.stop_accepting();

        let running = self.in_flight();
        if running == 0 {
            return 0;
        }

        info!(running, grace = ?grace, "Waiting for transfers to finish");
        if tokio::time::timeout(grace, self.wait_idle()).await.is_ok() {
            return 0;
        }

        let remaining = self.in_flight();
        warn!(remaining, "Grace period over, cancelling transfers");
        self.inner.cancel.send_replace(true);
        self.wait_idle().await;
        remaining
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        futures::future::pending::<()>().await;
    }
}
