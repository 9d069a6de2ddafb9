//! smewtd: a peer-to-peer media query and transfer daemon.
//!
//! Answers queries from its local media index, forwards them to trusted
//! friends, and pulls files from friends into an incoming folder.

pub mod config;
pub mod daemon;
pub mod error;
pub mod index;
pub mod logging;
pub mod peer_api;
pub mod registry;
pub mod remote;
pub mod router;
pub mod transfer;
