//! Query routing: local index, one friend, or everyone.
//!
//! `Local` goes straight to the index. `Remote` resolves the friend first, so
//! an unknown name never reaches the network, and retries exactly once on a
//! timeout. `Broadcast` fans out to the index and every friend at once under
//! a single deadline; a friend that fails only loses its own contribution and
//! is listed in [`QueryOutcome::failed`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::index::{IndexError, Record, StorageIndex, MOVIES_QUERY};
use crate::registry::{PeerRegistry, RegistryError};
use crate::remote::{PeerError, RemoteQueryClient};

/// Source name used for the local index in failure reports
pub const LOCAL_SOURCE: &str = "local";

/// Where a query is answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "friend", rename_all = "snake_case")]
pub enum Scope {
    Local,
    Remote(String),
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub scope: Scope,
}

impl Query {
    pub fn local(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            scope: Scope::Local,
        }
    }

    pub fn remote(friend: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            scope: Scope::Remote(friend.into()),
        }
    }

    pub fn broadcast(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            scope: Scope::Broadcast,
        }
    }
}

/// A source that did not contribute to a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    /// `"local"` or the friend's name
    pub source: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Records plus the sources that failed to provide theirs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutcome {
    pub records: Vec<Record>,
    #[serde(default)]
    pub failed: Vec<SourceFailure>,
}

impl QueryOutcome {
    fn complete(records: Vec<Record>) -> Self {
        Self {
            records,
            failed: Vec::new(),
        }
    }

    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Errors from single-target queries
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Unknown friend: {0}")]
    UnknownFriend(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Peer(#[from] PeerError),
}

impl From<RegistryError> for QueryError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownFriend(name) | RegistryError::DuplicateFriend(name) => {
                QueryError::UnknownFriend(name)
            }
        }
    }
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::UnknownFriend(_) => ErrorKind::UnknownFriend,
            QueryError::Index(e) => index_error_kind(e),
            QueryError::Peer(e) => peer_error_kind(e),
        }
    }
}

pub fn index_error_kind(e: &IndexError) -> ErrorKind {
    match e {
        IndexError::Unavailable(_) => ErrorKind::IndexUnavailable,
        IndexError::MalformedQuery(_) => ErrorKind::MalformedQuery,
    }
}

pub fn peer_error_kind(e: &PeerError) -> ErrorKind {
    match e {
        PeerError::Unreachable { .. } => ErrorKind::PeerUnreachable,
        PeerError::AuthFailed { .. } => ErrorKind::PeerAuthFailed,
        PeerError::Timeout { .. } => ErrorKind::PeerTimeout,
        PeerError::Rejected { .. } => ErrorKind::PeerRejected,
        PeerError::Protocol { .. } => ErrorKind::PeerProtocol,
    }
}

/// Dispatches queries according to their scope
pub struct QueryRouter {
    registry: Arc<PeerRegistry>,
    index: Arc<dyn StorageIndex>,
    remote: Arc<dyn RemoteQueryClient>,
    broadcast_deadline: Duration,
}

impl QueryRouter {
    pub fn new(
        registry: Arc<PeerRegistry>,
        index: Arc<dyn StorageIndex>,
        remote: Arc<dyn RemoteQueryClient>,
        broadcast_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            index,
            remote,
            broadcast_deadline,
        }
    }

    /// Route a query by scope.
    ///
    /// Only `Local` and `Remote` can fail as a whole; a broadcast always
    /// yields an outcome, with failures listed inside it.
    pub async fn route(&self, query: &Query) -> Result<QueryOutcome, QueryError> {
        match query.scope {
            Scope::Local => self.query_local(&query.text).await.map(QueryOutcome::complete),
            Scope::Remote(ref friend) => self
                .query_friend(friend, &query.text)
                .await
                .map(QueryOutcome::complete),
            Scope::Broadcast => Ok(self.broadcast(&query.text).await),
        }
    }

    /// Answer from the local index; result and error pass through unchanged
    pub async fn query_local(&self, text: &str) -> Result<Vec<Record>, QueryError> {
        debug!(query = %text, "Routing local query");
        Ok(self.index.query(text).await?)
    }

    pub async fn query_movies(&self) -> Result<Vec<Record>, QueryError> {
        self.query_local(MOVIES_QUERY).await
    }

    /// Ask one friend, retrying once if the first attempt timed out
    pub async fn query_friend(&self, name: &str, text: &str) -> Result<Vec<Record>, QueryError> {
        let friend = self.registry.lookup(name)?;
        debug!(friend = %friend.name, query = %text, "Routing remote query");

        match self.remote.query_remote(friend, text).await {
            Ok(records) => Ok(records),
            Err(e) if e.is_timeout() => {
                warn!(friend = %friend.name, "Remote query timed out, retrying once");
                Ok(self.remote.query_remote(friend, text).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Query the local index and every friend concurrently.
    ///
    /// Output order is local first, then friends in registry order, however
    /// the calls happen to finish. Nothing is retried.
    pub async fn broadcast(&self, text: &str) -> QueryOutcome {
        let deadline = Instant::now() + self.broadcast_deadline;
        let friends = self.registry.all();
        info!(query = %text, friends = friends.len(), "Broadcasting query");

        let local = async {
            match timeout_at(deadline, self.index.query(text)).await {
                Ok(result) => result.map_err(|e| (index_error_kind(&e), e.to_string())),
                Err(_) => Err((
                    ErrorKind::IndexUnavailable,
                    format!("local index did not answer within {:?}", self.broadcast_deadline),
                )),
            }
        };

        let remotes = join_all(friends.iter().map(|friend| async move {
            let result = match timeout_at(deadline, self.remote.query_remote(friend, text)).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout {
                    friend: friend.name.clone(),
                    timeout: self.broadcast_deadline,
                }),
            };
            (friend, result)
        }));

        let (local_result, remote_results) = tokio::join!(local, remotes);

        let mut outcome = QueryOutcome::default();

        match local_result {
            Ok(records) => outcome.records.extend(records),
            Err((kind, message)) => {
                warn!(error = %message, "Local index failed during broadcast");
                outcome.failed.push(SourceFailure {
                    source: LOCAL_SOURCE.to_string(),
                    kind,
                    message,
                });
            }
        }

        for (friend, result) in remote_results {
            match result {
                Ok(records) => {
                    debug!(friend = %friend.name, records = records.len(), "Friend answered broadcast");
                    outcome.records.extend(records);
                }
                Err(e) => {
                    warn!(friend = %friend.name, error = %e, "Friend failed during broadcast");
                    outcome.failed.push(SourceFailure {
                        source: friend.name.clone(),
                        kind: peer_error_kind(&e),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            records = outcome.records.len(),
            failed = outcome.failed.len(),
            "Broadcast complete"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Friend;
    use crate::remote::mock::{MockError, MockPeer, MockPeerClient};
    use async_trait::async_trait;

    struct FixedIndex(Result<Vec<Record>, IndexError>);

    #[async_trait]
    impl StorageIndex for FixedIndex {
        async fn query(&self, _text: &str) -> Result<Vec<Record>, IndexError> {
            self.0.clone()
        }
    }

    fn registry() -> Arc<PeerRegistry> {
        Arc::new(
            PeerRegistry::new(vec![
                Friend::new("alice", "10.0.0.2"),
                Friend::new("bob", "10.0.0.3"),
            ])
            .unwrap(),
        )
    }

    fn router(index: FixedIndex, remote: Arc<MockPeerClient>) -> QueryRouter {
        QueryRouter::new(registry(), Arc::new(index), remote, Duration::from_secs(2))
    }

    fn local_records() -> FixedIndex {
        FixedIndex(Ok(vec!["Local Movie".to_string()]))
    }

    #[tokio::test]
    async fn test_local_passthrough() {
        let remote = Arc::new(MockPeerClient::new());
        let router = router(local_records(), remote.clone());
        let outcome = router.route(&Query::local("title:x")).await.unwrap();
        assert_eq!(outcome.records, vec!["Local Movie"]);
        assert!(!outcome.is_partial());
        assert_eq!(remote.total_queries(), 0);
    }

    #[tokio::test]
    async fn test_local_error_passthrough() {
        let router = router(
            FixedIndex(Err(IndexError::malformed("bad"))),
            Arc::new(MockPeerClient::new()),
        );
        let err = router.route(&Query::local("??")).await.unwrap_err();
        assert_eq!(err, QueryError::Index(IndexError::malformed("bad")));
        assert_eq!(err.kind(), ErrorKind::MalformedQuery);
    }

    #[tokio::test]
    async fn test_remote_unknown_friend_never_calls_network() {
        let remote = Arc::new(MockPeerClient::new());
        let router = router(local_records(), remote.clone());
        let err = router.route(&Query::remote("carol", "x")).await.unwrap_err();
        assert_eq!(err, QueryError::UnknownFriend("carol".to_string()));
        assert_eq!(remote.total_queries(), 0);
    }

    #[tokio::test]
    async fn test_remote_timeout_retried_once() {
        let remote = Arc::new(MockPeerClient::new().with_peer(
            "alice",
            MockPeer::with_records(["Alice Movie"]).failing_first(MockError::Timeout, 1),
        ));
        let router = router(local_records(), remote.clone());
        let records = router.query_friend("alice", "x").await.unwrap();
        assert_eq!(records, vec!["Alice Movie"]);
        assert_eq!(remote.query_count("alice"), 2);
    }

    #[tokio::test]
    async fn test_remote_timeout_twice_surfaces() {
        let remote = Arc::new(
            MockPeerClient::new().with_peer("alice", MockPeer::failing(MockError::Timeout)),
        );
        let router = router(local_records(), remote.clone());
        let err = router.query_friend("alice", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerTimeout);
        assert_eq!(remote.query_count("alice"), 2);
    }

    #[tokio::test]
    async fn test_remote_auth_failure_not_retried() {
        let remote = Arc::new(
            MockPeerClient::new().with_peer("alice", MockPeer::failing(MockError::AuthFailed)),
        );
        let router = router(local_records(), remote.clone());
        let err = router.query_friend("alice", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PeerAuthFailed);
        assert_eq!(remote.query_count("alice"), 1);
    }

    #[tokio::test]
    async fn test_broadcast_merges_in_registry_order() {
        // bob answers first, alice's records must still come first
        let remote = Arc::new(
            MockPeerClient::new()
                .with_peer(
                    "alice",
                    MockPeer::with_records(["A1", "A2"]).delayed(Duration::from_millis(100)),
                )
                .with_peer("bob", MockPeer::with_records(["B1"])),
        );
        let router = router(local_records(), remote);
        let outcome = router.route(&Query::broadcast("x")).await.unwrap();
        assert_eq!(outcome.records, vec!["Local Movie", "A1", "A2", "B1"]);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reports_failures() {
        let remote = Arc::new(
            MockPeerClient::new()
                .with_peer("alice", MockPeer::failing(MockError::Unreachable))
                .with_peer("bob", MockPeer::with_records(["B1"])),
        );
        let router = router(local_records(), remote.clone());
        let outcome = router.broadcast("x").await;
        assert_eq!(outcome.records, vec!["Local Movie", "B1"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].source, "alice");
        assert_eq!(outcome.failed[0].kind, ErrorKind::PeerUnreachable);
        // no retry inside a broadcast
        assert_eq!(remote.query_count("alice"), 1);
    }

    #[tokio::test]
    async fn test_broadcast_local_failure_reported() {
        let remote = Arc::new(
            MockPeerClient::new()
                .with_peer("alice", MockPeer::with_records(["A1"]))
                .with_peer("bob", MockPeer::with_records(["B1"])),
        );
        let router = router(FixedIndex(Err(IndexError::unavailable("gone"))), remote);
        let outcome = router.broadcast("x").await;
        assert_eq!(outcome.records, vec!["A1", "B1"]);
        assert_eq!(outcome.failed[0].source, LOCAL_SOURCE);
        assert_eq!(outcome.failed[0].kind, ErrorKind::IndexUnavailable);
    }

    #[tokio::test]
    async fn test_broadcast_deadline_cuts_slow_friend() {
        let remote = Arc::new(
            MockPeerClient::new()
                .with_timeout(Duration::from_secs(60))
                .with_peer("alice", MockPeer::with_records(["A1"]))
                .with_peer("bob", MockPeer::with_records(["B1"]).delayed(Duration::from_secs(30))),
        );
        let router = QueryRouter::new(
            registry(),
            Arc::new(local_records()),
            remote,
            Duration::from_millis(200),
        );

        let started = std::time::Instant::now();
        let outcome = router.broadcast("x").await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome.records, vec!["Local Movie", "A1"]);
        assert_eq!(outcome.failed[0].source, "bob");
        assert_eq!(outcome.failed[0].kind, ErrorKind::PeerTimeout);
    }

    #[tokio::test]
    async fn test_query_movies_is_local() {
        let remote = Arc::new(MockPeerClient::new());
        let router = router(local_records(), remote.clone());
        assert_eq!(router.query_movies().await.unwrap(), vec!["Local Movie"]);
        assert_eq!(remote.total_queries(), 0);
    }

    #[test]
    fn test_scope_serialization() {
        let json = serde_json::to_string(&Scope::Remote("alice".into())).unwrap();
        assert_eq!(json, r#"{"kind":"remote","friend":"alice"}"#);
        let json = serde_json::to_string(&Scope::Local).unwrap();
        assert_eq!(json, r#"{"kind":"local"}"#);
    }
}
