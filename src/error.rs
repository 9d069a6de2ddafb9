//! Error kinds shared across the daemon's transports.
//!
//! Each module keeps its own `thiserror` enum; [`ErrorKind`] is the flat
//! taxonomy those enums map onto when an error leaves the process, over IPC
//! or the peer API, or when a broadcast reports which sources failed.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownFriend,
    InvalidFilename,
    IndexUnavailable,
    MalformedQuery,
    PeerUnreachable,
    PeerAuthFailed,
    PeerTimeout,
    PeerRejected,
    PeerProtocol,
    TransferAlreadyInProgress,
    TransferFailed,
    TransferNotFound,
    ShuttingDown,
    InvalidRequest,
    Internal,
}

impl ErrorKind {
    /// Whether the caller got something wrong, as opposed to a runtime failure
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            ErrorKind::UnknownFriend
                | ErrorKind::InvalidFilename
                | ErrorKind::MalformedQuery
                | ErrorKind::TransferNotFound
                | ErrorKind::InvalidRequest
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ErrorKind::UnknownFriend).unwrap(),
            "\"unknown_friend\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::TransferAlreadyInProgress).unwrap(),
            "\"transfer_already_in_progress\""
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::PeerTimeout.to_string(), "peer_timeout");
    }

    #[test]
    fn test_caller_errors() {
        assert!(ErrorKind::UnknownFriend.is_caller_error());
        assert!(ErrorKind::InvalidFilename.is_caller_error());
        assert!(!ErrorKind::PeerTimeout.is_caller_error());
        assert!(!ErrorKind::IndexUnavailable.is_caller_error());
    }
}
