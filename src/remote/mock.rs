//! Mock peer client for testing.
//!
//! Implements [`RemoteQueryClient`] and [`FileFetcher`] without touching the
//! network. Each friend gets a [`MockPeer`] script: records to answer with,
//! a simulated response delay, errors for the first N calls, and files
//! served as chunk sequences that can stall or abort midway.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::{ByteStream, FileFetcher, PeerError, RemoteQueryClient};
use crate::index::Record;
use crate::registry::Friend;

/// Type of error to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    Unreachable,
    AuthFailed,
    Timeout,
    Rejected,
}

impl MockError {
    fn into_peer_error(self, friend: &str, timeout: Duration) -> PeerError {
        let friend = friend.to_string();
        match self {
            MockError::Unreachable => PeerError::Unreachable {
                friend,
                reason: "connection refused".to_string(),
            },
            MockError::AuthFailed => PeerError::AuthFailed { friend },
            MockError::Timeout => PeerError::Timeout { friend, timeout },
            MockError::Rejected => PeerError::Rejected {
                friend,
                status: 400,
                message: "Malformed query".to_string(),
            },
        }
    }
}

/// A file served by a mock peer.
#[derive(Debug, Clone, Default)]
pub struct MockFile {
    pub chunks: Vec<Bytes>,
    /// Delay before each chunk.
    pub chunk_delay: Option<Duration>,
    /// Emit an error instead of the chunk at this index.
    pub abort_at: Option<usize>,
    /// Never produce the chunk at this index.
    pub stall_at: Option<usize>,
}

impl MockFile {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }

    pub fn aborting_at(mut self, index: usize) -> Self {
        self.abort_at = Some(index);
        self
    }

    pub fn stalling_at(mut self, index: usize) -> Self {
        self.stall_at = Some(index);
        self
    }

    /// Concatenated file content.
    pub fn content(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

/// Script for one friend.
#[derive(Debug, Clone, Default)]
pub struct MockPeer {
    pub records: Vec<Record>,
    /// Simulated response time for queries.
    pub delay: Option<Duration>,
    /// Error returned instead of records.
    pub error: Option<MockError>,
    /// Only fail the first N calls (0 means every call fails).
    pub fail_first: usize,
    pub files: HashMap<String, MockFile>,
}

impl MockPeer {
    pub fn with_records<I, R>(records: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Record>,
    {
        Self {
            records: records.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn failing(error: MockError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_first(mut self, error: MockError, calls: usize) -> Self {
        self.error = Some(error);
        self.fail_first = calls;
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, file: MockFile) -> Self {
        self.files.insert(name.into(), file);
        self
    }
}

/// Scriptable stand-in for [`super::HttpPeerClient`].
///
/// Queries slower than `timeout` report [`PeerError::Timeout`] after
/// `timeout`, like the real client does.
#[derive(Debug)]
pub struct MockPeerClient {
    peers: HashMap<String, MockPeer>,
    timeout: Duration,
    query_calls: Mutex<HashMap<String, usize>>,
    fetch_calls: Mutex<HashMap<String, usize>>,
}

impl Default for MockPeerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeerClient {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            timeout: Duration::from_secs(5),
            query_calls: Mutex::new(HashMap::new()),
            fetch_calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_peer(mut self, name: impl Into<String>, peer: MockPeer) -> Self {
        self.peers.insert(name.into(), peer);
        self
    }

    /// Number of queries sent to `friend` so far.
    pub fn query_count(&self, friend: &str) -> usize {
        self.query_calls
            .lock()
            .map(|calls| calls.get(friend).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Total queries sent to any friend.
    pub fn total_queries(&self) -> usize {
        self.query_calls
            .lock()
            .map(|calls| calls.values().sum())
            .unwrap_or(0)
    }

    /// Number of downloads opened from `friend` so far.
    pub fn fetch_count(&self, friend: &str) -> usize {
        self.fetch_calls
            .lock()
            .map(|calls| calls.get(friend).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    fn bump(counter: &Mutex<HashMap<String, usize>>, friend: &str) -> usize {
        let mut calls = counter.lock().unwrap_or_else(|e| e.into_inner());
        let count = calls.entry(friend.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    fn unreachable(friend: &Friend) -> PeerError {
        PeerError::Unreachable {
            friend: friend.name.clone(),
            reason: "no mock peer configured".to_string(),
        }
    }
}

#[async_trait]
impl RemoteQueryClient for MockPeerClient {
    async fn query_remote(&self, friend: &Friend, _text: &str) -> Result<Vec<Record>, PeerError> {
        let call = Self::bump(&self.query_calls, &friend.name);
        let peer = self.peers.get(&friend.name).ok_or_else(|| Self::unreachable(friend))?;

        if let Some(delay) = peer.delay {
            if delay > self.timeout {
                tokio::time::sleep(self.timeout).await;
                return Err(PeerError::Timeout {
                    friend: friend.name.clone(),
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = peer.error {
            if peer.fail_first == 0 || call <= peer.fail_first {
                return Err(error.into_peer_error(&friend.name, self.timeout));
            }
        }

        Ok(peer.records.clone())
    }
}

#[async_trait]
impl FileFetcher for MockPeerClient {
    async fn fetch(&self, friend: &Friend, filename: &str) -> Result<ByteStream, PeerError> {
        Self::bump(&self.fetch_calls, &friend.name);
        let peer = self.peers.get(&friend.name).ok_or_else(|| Self::unreachable(friend))?;

        let file = peer.files.get(filename).cloned().ok_or_else(|| PeerError::Rejected {
            friend: friend.name.clone(),
            status: 404,
            message: format!("no such file: {}", filename),
        })?;

        let name = friend.name.clone();
        let stream = futures::stream::unfold(Some(0usize), move |state| {
            let file = file.clone();
            let name = name.clone();
            async move {
                let idx = state?;
                if let Some(delay) = file.chunk_delay {
                    tokio::time::sleep(delay).await;
                }
                if file.stall_at == Some(idx) {
                    futures::future::pending::<()>().await;
                }
                if file.abort_at == Some(idx) {
                    let err = PeerError::Unreachable {
                        friend: name,
                        reason: "connection reset by peer".to_string(),
                    };
                    return Some((Err(err), None));
                }
                let chunk = file.chunks.get(idx)?.clone();
                Some((Ok(chunk), Some(idx + 1)))
            }
        });

        Ok(stream.boxed())
    }
}
