//! Peer HTTP API: what friends' daemons call.

pub mod routes;
pub mod wire;

pub use routes::{build_router, PeerState};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Handle to a running peer API server
pub struct PeerServerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl PeerServerHandle {
    /// Address the server actually bound to
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the server to finish its graceful shutdown
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("Peer API task failed: {}", e);
        }
    }
}

/// Bind `listen` and serve the peer API until `shutdown` resolves.
pub async fn start_peer_server<F>(
    listen: &str,
    state: Arc<PeerState>,
    shutdown: F,
) -> std::io::Result<PeerServerHandle>
where
    F: Future<Output = ()> + Send + 'static,
{
    if state.token.is_none() {
        warn!("No peer_token configured, the peer API accepts unauthenticated requests");
    }

    let listener = TcpListener::bind(listen).await?;
    let addr = listener.local_addr()?;
    let app = build_router(state);

    info!(%addr, "Peer API listening");
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("Peer API server error: {}", e);
        }
        info!("Peer API stopped");
    });

    Ok(PeerServerHandle { addr, task })
}
