//! Calls into friends' daemons.
//!
//! Two seams: [`RemoteQueryClient`] forwards a query, [`FileFetcher`] opens a
//! byte stream for a file a friend shares. Both take an already resolved
//! [`Friend`] so callers must go through the registry first.
//! [`HttpPeerClient`] implements both over the peer HTTP API; [`mock`]
//! provides a scriptable stand-in for tests.

mod http;
pub mod mock;

pub use http::HttpPeerClient;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::index::Record;
use crate::registry::Friend;

/// Stream of file chunks coming from a friend
pub type ByteStream = BoxStream<'static, Result<Bytes, PeerError>>;

/// Failures talking to a friend.
///
/// Kept distinct because the router treats them differently: only
/// [`PeerError::Timeout`] is ever retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("Friend '{friend}' is unreachable: {reason}")]
    Unreachable { friend: String, reason: String },

    #[error("Friend '{friend}' rejected our credential")]
    AuthFailed { friend: String },

    #[error("Friend '{friend}' did not answer within {timeout:?}")]
    Timeout { friend: String, timeout: Duration },

    #[error("Friend '{friend}' refused the request ({status}): {message}")]
    Rejected {
        friend: String,
        status: u16,
        message: String,
    },

    #[error("Friend '{friend}' sent an invalid response: {reason}")]
    Protocol { friend: String, reason: String },
}

impl PeerError {
    pub fn friend(&self) -> &str {
        match self {
            PeerError::Unreachable { friend, .. }
            | PeerError::AuthFailed { friend }
            | PeerError::Timeout { friend, .. }
            | PeerError::Rejected { friend, .. }
            | PeerError::Protocol { friend, .. } => friend,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerError::Timeout { .. })
    }
}

/// Forwards a query to a friend's daemon
#[async_trait]
pub trait RemoteQueryClient: Send + Sync {
    /// Ask `friend` to run `text` against its local index.
    ///
    /// Implementations bound the call by their own timeout and report it as
    /// [`PeerError::Timeout`].
    async fn query_remote(&self, friend: &Friend, text: &str) -> Result<Vec<Record>, PeerError>;
}

/// Opens file downloads from a friend
#[async_trait]
pub trait FileFetcher: Send + Sync {
    /// Start downloading `filename` from `friend`'s shared folder.
    ///
    /// The returned stream yields an error item if the transfer breaks.
    async fn fetch(&self, friend: &Friend, filename: &str) -> Result<ByteStream, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_is_timeout() {
        let timeout = PeerError::Timeout {
            friend: "alice".into(),
            timeout: Duration::from_secs(5),
        };
        let auth = PeerError::AuthFailed {
            friend: "alice".into(),
        };
        assert!(timeout.is_timeout());
        assert!(!auth.is_timeout());
        assert_eq!(auth.friend(), "alice");
    }

    #[test]
    fn test_error_display() {
        let err = PeerError::Rejected {
            friend: "bob".into(),
            status: 400,
            message: "Malformed query: empty query".into(),
        };
        assert_eq!(
            err.to_string(),
            "Friend 'bob' refused the request (400): Malformed query: empty query"
        );
    }
}
