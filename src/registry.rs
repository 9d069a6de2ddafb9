//! Registry of trusted peers ("friends").
//!
//! Built once from configuration and read-only afterwards, so it is shared
//! behind an `Arc` without locking. Every outbound call resolves its target
//! through [`PeerRegistry::lookup`]; nothing in the daemon accepts a bare
//! address, which keeps unknown endpoints unreachable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::FriendConfig;

/// Errors raised while building or querying the registry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown friend: {0}")]
    UnknownFriend(String),

    #[error("Duplicate friend name: {0}")]
    DuplicateFriend(String),
}

/// A trusted peer daemon.
#[derive(Clone, PartialEq, Eq)]
pub struct Friend {
    pub name: String,
    pub address: String,
    pub credential: Option<String>,
}

impl Friend {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Base URL of the friend's peer API
    pub fn base_url(&self) -> String {
        let address = self.address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }

    /// Public view without the credential
    pub fn info(&self) -> FriendInfo {
        FriendInfo {
            name: self.name.clone(),
            address: self.address.clone(),
            has_credential: self.credential.is_some(),
        }
    }
}

impl std::fmt::Debug for Friend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Friend")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("credential", &self.credential.as_ref().map(|_| "********"))
            .finish()
    }
}

impl From<&FriendConfig> for Friend {
    fn from(config: &FriendConfig) -> Self {
        Self {
            name: config.name.clone(),
            address: config.address.clone(),
            credential: config.credential.clone(),
        }
    }
}

/// Friend details safe to hand to IPC clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendInfo {
    pub name: String,
    pub address: String,
    pub has_credential: bool,
}

/// Immutable set of friends, iterable in configuration order.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    friends: Vec<Friend>,
    by_name: HashMap<String, usize>,
}

impl PeerRegistry {
    /// Build a registry, rejecting duplicate names
    pub fn new(friends: Vec<Friend>) -> Result<Self, RegistryError> {
        let mut by_name = HashMap::with_capacity(friends.len());
        for (idx, friend) in friends.iter().enumerate() {
            if by_name.insert(friend.name.clone(), idx).is_some() {
                return Err(RegistryError::DuplicateFriend(friend.name.clone()));
            }
        }
        Ok(Self { friends, by_name })
    }

    pub fn from_config(friends: &[FriendConfig]) -> Result<Self, RegistryError> {
        Self::new(friends.iter().map(Friend::from).collect())
    }

    /// Resolve a friend by name
    pub fn lookup(&self, name: &str) -> Result<&Friend, RegistryError> {
        self.by_name
            .get(name)
            .map(|&idx| &self.friends[idx])
            .ok_or_else(|| RegistryError::UnknownFriend(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// All friends in insertion order
    pub fn all(&self) -> &[Friend] {
        &self.friends
    }

    pub fn len(&self) -> usize {
        self.friends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.friends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PeerRegistry {
        PeerRegistry::new(vec![
            Friend::new("alice", "10.0.0.2").with_credential("a-secret"),
            Friend::new("bob", "10.0.0.3"),
            Friend::new("carol", "https://carol.example.org:6777/"),
        ])
        .unwrap()
    }

    #[test]
    fn test_lookup_known_friend() {
        let registry = sample();
        let alice = registry.lookup("alice").unwrap();
        assert_eq!(alice.address, "10.0.0.2");
        assert_eq!(alice.credential.as_deref(), Some("a-secret"));
    }

    #[test]
    fn test_lookup_unknown_friend() {
        let registry = sample();
        assert_eq!(
            registry.lookup("dave").unwrap_err(),
            RegistryError::UnknownFriend("dave".to_string())
        );
        assert!(!registry.contains("dave"));
    }

    #[test]
    fn test_all_preserves_order() {
        let registry = sample();
        let names: Vec<&str> = registry.all().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = PeerRegistry::new(vec![Friend::new("alice", "a"), Friend::new("alice", "b")]);
        assert_eq!(
            result.unwrap_err(),
            RegistryError::DuplicateFriend("alice".to_string())
        );
    }

    #[test]
    fn test_from_config() {
        let configs = vec![FriendConfig {
            name: "alice".to_string(),
            address: "10.0.0.2:6777".to_string(),
            credential: None,
        }];
        let registry = PeerRegistry::from_config(&configs).unwrap();
        assert!(registry.contains("alice"));
    }

    #[test]
    fn test_base_url() {
        let registry = sample();
        assert_eq!(registry.lookup("alice").unwrap().base_url(), "http://10.0.0.2");
        assert_eq!(
            registry.lookup("carol").unwrap().base_url(),
            "https://carol.example.org:6777"
        );
    }

    #[test]
    fn test_info_hides_credential() {
        let registry = sample();
        let info = registry.lookup("alice").unwrap().info();
        assert!(info.has_credential);
        assert!(!format!("{:?}", registry).contains("a-secret"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = PeerRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.all().is_empty());
    }
}
