//! The daemon's public operations.
//!
//! [`Smewtd`] only validates and delegates: queries go to the
//! [`QueryRouter`], downloads to the [`DownloadManager`]. Both transports
//! (the Unix socket and the peer API) call through it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::index::scanner::scan_folder;
use crate::index::{IndexError, MediaIndex, Record, StorageIndex};
use crate::peer_api::PeerState;
use crate::registry::{FriendInfo, PeerRegistry, RegistryError};
use crate::remote::{FileFetcher, HttpPeerClient, RemoteQueryClient};
use crate::router::{Query, QueryError, QueryOutcome, QueryRouter};
use crate::transfer::{
    DatabaseError, DownloadManager, TransferError, TransferId, TransferInfo, TransferStore,
};

/// Terminal transfers older than this are pruned at startup
const TRANSFER_RETENTION_HOURS: u64 = 24 * 7;

/// Errors that can occur while assembling the daemon
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid friend list: {0}")]
    Registry(#[from] RegistryError),

    #[error("Cannot open media index: {0}")]
    Index(#[from] IndexError),

    #[error("Cannot open transfer database: {0}")]
    Database(#[from] DatabaseError),

    #[error("Cannot restore transfers: {0}")]
    Transfer(#[from] TransferError),

    #[error("Cannot build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Composes the registry, the router and the download manager
pub struct Smewtd {
    registry: Arc<PeerRegistry>,
    index: Arc<dyn StorageIndex>,
    router: QueryRouter,
    downloads: DownloadManager,
    shutdown_tx: broadcast::Sender<()>,
}

impl Smewtd {
    pub fn new(
        registry: Arc<PeerRegistry>,
        index: Arc<dyn StorageIndex>,
        remote: Arc<dyn RemoteQueryClient>,
        downloads: DownloadManager,
        broadcast_deadline: Duration,
    ) -> Self {
        let router = QueryRouter::new(
            Arc::clone(&registry),
            Arc::clone(&index),
            remote,
            broadcast_deadline,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            registry,
            index,
            router,
            downloads,
            shutdown_tx,
        }
    }

    /// Build the daemon from configuration.
    ///
    /// Opens the media index for the configured storage domain, imports the
    /// shared folder, and restores transfer state from the previous run.
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        config.validate()?;
        config.check_incoming_folder()?;

        let registry = Arc::new(PeerRegistry::from_config(&config.friends)?);
        info!(friends = registry.len(), domain = %config.storage_domain, "Loaded friends");

        let index = MediaIndex::open(&config.index_db_path())?;
        if let Some(ref shared) = config.shared_folder {
            match scan_folder(&index, shared) {
                Ok(summary) => info!(
                    movies = summary.movies,
                    episodes = summary.episodes,
                    skipped = summary.skipped,
                    "Shared folder imported"
                ),
                Err(e) => warn!(folder = %shared.display(), error = %e, "Shared folder import failed"),
            }
        }

        let client = Arc::new(HttpPeerClient::new(config.peer_timeout())?);
        let store = TransferStore::open(&config.state_db_path())?;
        let downloads = DownloadManager::new(
            Arc::clone(&registry),
            Arc::clone(&client) as Arc<dyn FileFetcher>,
            config.incoming_folder.clone(),
            config.transfer_idle_timeout(),
            store,
        );
        downloads.restore_on_startup()?;
        downloads.cleanup_old_transfers(TRANSFER_RETENTION_HOURS)?;

        Ok(Self::new(
            registry,
            Arc::new(index),
            client,
            downloads,
            config.broadcast_deadline(),
        ))
    }

    /// State for the peer API, sharing this daemon's index and downloads
    pub fn peer_state(&self, shared_folder: Option<PathBuf>, token: Option<String>) -> Arc<PeerState> {
        Arc::new(PeerState {
            index: Arc::clone(&self.index),
            downloads: self.downloads.clone(),
            registry: Arc::clone(&self.registry),
            shared_folder,
            token,
        })
    }

    pub fn ping(&self) -> bool {
        true
    }

    pub async fn query(&self, text: &str) -> Result<Vec<Record>, QueryError> {
        self.router.query_local(text).await
    }

    pub async fn query_lucene(&self, text: &str) -> Result<Vec<Record>, QueryError> {
        self.query(text).await
    }

    pub async fn query_movies(&self) -> Result<Vec<Record>, QueryError> {
        self.router.query_movies().await
    }

    pub async fn distant_query(&self, host: &str, text: &str) -> Result<Vec<Record>, QueryError> {
        let outcome = self.router.route(&Query::remote(host, text)).await?;
        Ok(outcome.records)
    }

    pub async fn broadcast_query(&self, text: &str) -> QueryOutcome {
        self.router.broadcast(text).await
    }

    pub fn start_download(&self, friend: &str, filename: &str) -> Result<TransferInfo, TransferError> {
        self.downloads.start_download(friend, filename)
    }

    pub fn transfers(&self) -> Vec<TransferInfo> {
        self.downloads.list()
    }

    pub fn transfer(&self, id: TransferId) -> Result<TransferInfo, TransferError> {
        self.downloads.get(id)
    }

    pub fn acknowledge_transfer(&self, id: TransferId) -> Result<TransferInfo, TransferError> {
        self.downloads.acknowledge(id)
    }

    pub fn friends(&self) -> Vec<FriendInfo> {
        self.registry.all().iter().map(|f| f.info()).collect()
    }

    /// Stop taking new work and signal every transport to wind down.
    ///
    /// Returns at once; [`Smewtd::drain`] does the waiting.
    pub fn quit(&self) {
        if self.downloads.is_accepting() {
            info!("Quit requested");
        }
        self.downloads.stop_accepting();
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_shutting_down(&self) -> bool {
        !self.downloads.is_accepting()
    }

    /// Wait up to `grace` for transfers, then cancel what is left
    pub async fn drain(&self, grace: Duration) -> usize {
        self.downloads.shutdown(grace).await
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Future resolving once [`Smewtd::quit`] is called
    pub fn shutdown_signal(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.subscribe_shutdown();
        async move {
            let _ = rx.recv().await;
        }
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::index::MediaRecord;
    use crate::registry::Friend;
    use crate::remote::mock::{MockFile, MockPeer, MockPeerClient};
    use crate::transfer::TransferState;
    use tempfile::TempDir;

    fn create_test_daemon(temp: &TempDir) -> Smewtd {
        let index = MediaIndex::open_in_memory().unwrap();
        index
            .upsert(&MediaRecord::movie("Alien", Some(1979), "alien.avi"))
            .unwrap();
        index
            .upsert(&MediaRecord::episode("Lost", 1, 2, "Pilot", "lost.avi"))
            .unwrap();

        let registry = Arc::new(
            PeerRegistry::new(vec![
                Friend::new("alice", "10.0.0.2"),
                Friend::new("bob", "10.0.0.3"),
            ])
            .unwrap(),
        );
        let client = Arc::new(
            MockPeerClient::new()
                .with_peer(
                    "alice",
                    MockPeer::with_records(["The Matrix (1999)\tmatrix.avi"])
                        .with_file("matrix.avi", MockFile::new([&b"neo"[..]])),
                )
                .with_peer("bob", MockPeer::with_records(["Brazil (1985)"])),
        );
        let downloads = DownloadManager::new(
            Arc::clone(&registry),
            client.clone(),
            temp.path().to_path_buf(),
            Duration::from_secs(5),
            TransferStore::open_in_memory().unwrap(),
        );

        Smewtd::new(registry, Arc::new(index), client, downloads, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_local_queries() {
        let temp = TempDir::new().unwrap();
        let daemon = create_test_daemon(&temp);

        assert!(daemon.ping());
        assert_eq!(daemon.query("alien").await.unwrap(), vec!["Alien (1979)\talien.avi"]);
        assert_eq!(
            daemon.query_lucene("alien").await.unwrap(),
            daemon.query("alien").await.unwrap()
        );
        assert_eq!(daemon.query_movies().await.unwrap(), vec!["Alien (1979)\talien.avi"]);
    }

    #[tokio::test]
    async fn test_distant_query() {
        let temp = TempDir::new().unwrap();
        let daemon = create_test_daemon(&temp);

        assert_eq!(
            daemon.distant_query("alice", "title:matrix").await.unwrap(),
            vec!["The Matrix (1999)\tmatrix.avi"]
        );
        let err = daemon.distant_query("carol", "title:matrix").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownFriend);
    }

    #[tokio::test]
    async fn test_broadcast_query() {
        let temp = TempDir::new().unwrap();
        let daemon = create_test_daemon(&temp);

        let outcome = daemon.broadcast_query("alien").await;
        assert!(outcome.failed.is_empty());
        assert_eq!(
            outcome.records,
            vec![
                "Alien (1979)\talien.avi",
                "The Matrix (1999)\tmatrix.avi",
                "Brazil (1985)"
            ]
        );
    }

    #[tokio::test]
    async fn test_quit_stops_downloads() {
        let temp = TempDir::new().unwrap();
        let daemon = create_test_daemon(&temp);
        let mut shutdown = daemon.subscribe_shutdown();

        daemon.quit();
        assert!(daemon.is_shutting_down());
        assert!(shutdown.recv().await.is_ok());

        let err = daemon.start_download("alice", "matrix.avi").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShuttingDown);
        assert_eq!(daemon.drain(Duration::from_millis(10)).await, 0);
    }

    #[tokio::test]
    async fn test_download_through_facade() {
        let temp = TempDir::new().unwrap();
        let daemon = create_test_daemon(&temp);

        let info = daemon.start_download("alice", "matrix.avi").unwrap();
        daemon.downloads().wait_idle().await;
        let done = daemon.transfer(info.id).unwrap();
        assert_eq!(done.state, TransferState::Complete);
        assert_eq!(daemon.transfers().len(), 1);
        daemon.acknowledge_transfer(info.id).unwrap();
        assert!(daemon.transfers().is_empty());
    }

    #[test]
    fn test_friends_listing() {
        let temp = TempDir::new().unwrap();
        let daemon = create_test_daemon(&temp);
        let names: Vec<String> = daemon.friends().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn test_from_config_requires_incoming_folder() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::new(temp.path().join("missing"));
        config.data_dir = Some(temp.path().join("data"));
        assert!(matches!(
            Smewtd::from_config(&config),
            Err(StartupError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_imports_shared_folder() {
        let temp = TempDir::new().unwrap();
        let incoming = temp.path().join("incoming");
        let shared = temp.path().join("shared");
        std::fs::create_dir_all(&incoming).unwrap();
        std::fs::create_dir_all(&shared).unwrap();
        std::fs::write(shared.join("Brazil.1985.avi"), b"x").unwrap();

        let mut config = Config::new(&incoming);
        config.data_dir = Some(temp.path().join("data"));
        config.shared_folder = Some(shared);

        let daemon = Smewtd::from_config(&config).unwrap();
        assert_eq!(
            daemon.query_movies().await.unwrap(),
            vec!["Brazil (1985)\tBrazil.1985.avi"]
        );
    }
}
