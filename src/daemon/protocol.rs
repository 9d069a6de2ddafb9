//! IPC protocol types for CLI-daemon communication
//!
//! Messages are sent as newline-delimited JSON over Unix sockets.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::index::Record;
use crate::registry::FriendInfo;
use crate::router::QueryOutcome;
use crate::transfer::{TransferId, TransferInfo};

/// Requests sent from a client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum DaemonRequest {
    /// Check if daemon is alive
    Ping,
    /// Query the local index
    Query { text: String },
    /// Same as `Query`; kept for clients that use the older name
    QueryLucene { text: String },
    /// List local movies
    QueryMovies,
    /// Query a single friend
    DistantQuery { host: String, text: String },
    /// Query the local index and every friend
    Broadcast { text: String },
    StartDownload { friend: String, filename: String },
    ListTransfers,
    GetTransfer { id: TransferId },
    /// Forget a finished transfer
    AcknowledgeTransfer { id: TransferId },
    ListFriends,
    /// Request graceful shutdown
    Quit,
}

/// Responses sent from the daemon to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data")]
pub enum DaemonResponse {
    Pong,
    Records(Vec<Record>),
    /// Broadcast result, with the sources that failed
    BroadcastRecords(QueryOutcome),
    TransferStarted(TransferInfo),
    Transfer(TransferInfo),
    TransferList(Vec<TransferInfo>),
    Acknowledged { id: TransferId },
    Friends(Vec<FriendInfo>),
    /// Shutdown acknowledged
    ShuttingDown,
    Error { kind: ErrorKind, message: String },
}

impl DaemonResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        DaemonResponse::Error {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferState;
    use std::path::PathBuf;

    #[test]
    fn request_wire_format() {
        let req = DaemonRequest::DistantQuery {
            host: "alice".to_string(),
            text: "title:matrix".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(
            json,
            r#"{"method":"DistantQuery","params":{"host":"alice","text":"title:matrix"}}"#
        );

        let ping: DaemonRequest = serde_json::from_str(r#"{"method":"Ping"}"#).unwrap();
        assert_eq!(ping, DaemonRequest::Ping);
    }

    #[test]
    fn transfer_response_serialization() {
        let info = TransferInfo {
            id: TransferId::new(),
            friend: "alice".to_string(),
            filename: "a.avi".to_string(),
            destination: PathBuf::from("/incoming/a.avi"),
            state: TransferState::Pending,
            bytes_received: 0,
            started_at: chrono::Utc::now(),
            finished_at: None,
            cause: None,
        };
        let resp = DaemonResponse::TransferStarted(info.clone());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("TransferStarted"));
        assert!(json.contains(r#""state":"pending""#));

        let parsed: DaemonResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, DaemonResponse::TransferStarted(info));
    }

    #[test]
    fn error_response_serialization() {
        let resp = DaemonResponse::error(ErrorKind::UnknownFriend, "Unknown friend: carol");
        let json = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            json,
            r#"{"status":"Error","data":{"kind":"unknown_friend","message":"Unknown friend: carol"}}"#
        );
    }
}
