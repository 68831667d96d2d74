//! Acceptor loop binding the router endpoint.

use std::sync::Arc;
use std::time::Duration;

use fv_types::config::RouterConfig;
use peer_net::{accept_handshake, IdentityKeyPair};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::directory::Directory;
use crate::error::RouterResult;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(15);

/// Accept peers forever. Each connection runs on its own task; a failing
/// connection never takes the acceptor down.
pub async fn run_router_server(config: RouterConfig, directory: Directory, identity: IdentityKeyPair) -> RouterResult<()> {
    let listener = TcpListener::bind(&config.listen_endpoint).await?;
    info!(endpoint = %config.listen_endpoint, "router listening");

    let broker = Broker::new(config, directory);
    let identity = Arc::new(identity);

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(peer = %addr, "peer connected");
        let broker = broker.clone();
        let identity = identity.clone();
        tokio::spawn(async move {
            match accept_handshake(stream, &identity, HANDSHAKE_DEADLINE).await {
                Ok(channel) => broker.handle_connection(channel, Some(addr)).await,
                Err(e) => debug!(peer = %addr, error = %e, "handshake failed"),
            }
        });
    }
}
