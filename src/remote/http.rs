//! HTTP client for the peer API.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use tracing::debug;

use super::{ByteStream, FileFetcher, PeerError, RemoteQueryClient};
use crate::index::Record;
use crate::peer_api::wire::{ErrorBody, QueryRequest, QueryResponse};
use crate::registry::Friend;

/// Talks to friends' `/api` endpoints.
///
/// Queries are bounded by `query_timeout` end to end. File downloads only get
/// the connect timeout here; stalls mid-body are caught by the download
/// manager's idle timeout since a whole file can take arbitrarily long.
#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    client: reqwest::Client,
    query_timeout: Duration,
}

impl HttpPeerClient {
    pub fn new(query_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(query_timeout)
            .user_agent(concat!("smewtd/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            query_timeout,
        })
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    fn endpoint(friend: &Friend, segments: &[&str]) -> Result<Url, PeerError> {
        let mut url = Url::parse(&friend.base_url()).map_err(|e| PeerError::Unreachable {
            friend: friend.name.clone(),
            reason: format!("invalid address '{}': {}", friend.address, e),
        })?;

        url.path_segments_mut()
            .map_err(|_| PeerError::Unreachable {
                friend: friend.name.clone(),
                reason: format!("address '{}' cannot be a base URL", friend.address),
            })?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    fn authorize(request: RequestBuilder, friend: &Friend) -> RequestBuilder {
        match friend.credential {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn send_error(&self, friend: &Friend, e: reqwest::Error) -> PeerError {
        if e.is_timeout() {
            PeerError::Timeout {
                friend: friend.name.clone(),
                timeout: self.query_timeout,
            }
        } else if e.is_decode() {
            PeerError::Protocol {
                friend: friend.name.clone(),
                reason: e.to_string(),
            }
        } else {
            PeerError::Unreachable {
                friend: friend.name.clone(),
                reason: e.to_string(),
            }
        }
    }

    async fn check_status(friend: &Friend, response: Response) -> Result<Response, PeerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PeerError::AuthFailed {
                friend: friend.name.clone(),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);

        Err(PeerError::Rejected {
            friend: friend.name.clone(),
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteQueryClient for HttpPeerClient {
    async fn query_remote(&self, friend: &Friend, text: &str) -> Result<Vec<Record>, PeerError> {
        let url = Self::endpoint(friend, &["api", "query"])?;
        debug!(friend = %friend.name, %url, "Forwarding query");

        let request = self
            .client
            .post(url)
            .timeout(self.query_timeout)
            .json(&QueryRequest {
                query: text.to_string(),
            });

        let response = Self::authorize(request, friend)
            .send()
            .await
            .map_err(|e| self.send_error(friend, e))?;
        let response = Self::check_status(friend, response).await?;

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| self.send_error(friend, e))?;

        debug!(friend = %friend.name, records = body.records.len(), "Remote query answered");
        Ok(body.records)
    }
}

#[async_trait]
impl FileFetcher for HttpPeerClient {
    async fn fetch(&self, friend: &Friend, filename: &str) -> Result<ByteStream, PeerError> {
        let mut segments = vec!["api", "files"];
        segments.extend(filename.split('/'));
        let url = Self::endpoint(friend, &segments)?;
        debug!(friend = %friend.name, %url, "Opening file download");

        let request = self.client.get(url);
        let response = tokio::time::timeout(self.query_timeout, Self::authorize(request, friend).send())
            .await
            .map_err(|_| PeerError::Timeout {
                friend: friend.name.clone(),
                timeout: self.query_timeout,
            })?
            .map_err(|e| self.send_error(friend, e))?;
        let response = Self::check_status(friend, response).await?;

        let name = friend.name.clone();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| PeerError::Unreachable {
                friend: name.clone(),
                reason: format!("transfer aborted: {}", e),
            })
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_host_port() {
        let friend = Friend::new("alice", "10.0.0.2:6777");
        let url = HttpPeerClient::endpoint(&friend, &["api", "query"]).unwrap();
        assert_eq!(url.as_str(), "http://10.0.0.2:6777/api/query");
    }

    #[test]
    fn test_endpoint_escapes_file_segments() {
        let friend = Friend::new("alice", "https://alice.example.org/");
        let url =
            HttpPeerClient::endpoint(&friend, &["api", "files", "Movies", "The Matrix.avi"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://alice.example.org/api/files/Movies/The%20Matrix.avi"
        );
    }

    #[test]
    fn test_endpoint_invalid_address() {
        let friend = Friend::new("alice", "not a host:::");
        let err = HttpPeerClient::endpoint(&friend, &["api"]).unwrap_err();
        assert!(matches!(err, PeerError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        // Port 9 on localhost is the discard port; nothing listens in CI.
        let client = HttpPeerClient::new(Duration::from_secs(2)).unwrap();
        let friend = Friend::new("ghost", "127.0.0.1:9");
        let err = client.query_remote(&friend, "title:x").await.unwrap_err();
        assert!(matches!(
            err,
            PeerError::Unreachable { .. } | PeerError::Timeout { .. }
        ));
        assert_eq!(err.friend(), "ghost");
    }
}
