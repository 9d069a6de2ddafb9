//! The daemon: facade plus its local IPC transport.
//!
//! [`Smewtd`] holds the operations; [`server`] exposes them on a Unix socket
//! and [`client`] is the other end of that socket.

pub mod client;
pub mod facade;
pub mod protocol;
pub mod server;

pub use client::{ClientError, DaemonClient};
pub use facade::{Smewtd, StartupError};
pub use protocol::{DaemonRequest, DaemonResponse};
pub use server::{DaemonHandle, DaemonServer, ServerError};
