//! In-memory registry of the hosts that are online right now.
//!
//! The persistent row in the directory survives disconnects; this map does
//! not. Eviction happens under the same lock as lookup, so a host that has
//! disconnected can never be handed out again.

use std::collections::HashMap;
use std::sync::Arc;

use fv_types::HostId;
use peer_net::{KeyHash, PeerSender};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Clone)]
pub struct RegisteredHost {
    pub key_hash: KeyHash,
    pub sender: PeerSender,
}

#[derive(Clone, Default)]
pub struct HostRegistry {
    hosts: Arc<RwLock<HashMap<HostId, RegisteredHost>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter (or refresh) a live host. A reconnect replaces the stale
    /// channel of the previous registration.
    pub async fn register(&self, host_id: HostId, key_hash: KeyHash, sender: PeerSender) {
        let mut hosts = self.hosts.write().await;
        if hosts.insert(host_id, RegisteredHost { key_hash, sender }).is_some() {
            warn!(host_id = %host_id, "replacing existing registration");
        } else {
            info!(host_id = %host_id, "host online");
        }
    }

    /// Evict a host. Subsequent lookups observe the eviction.
    pub async fn unregister(&self, host_id: HostId) {
        if self.hosts.write().await.remove(&host_id).is_some() {
            info!(host_id = %host_id, "host offline");
        }
    }

    pub async fn get(&self, host_id: HostId) -> Option<RegisteredHost> {
        self.hosts.read().await.get(&host_id).cloned()
    }

    pub async fn contains(&self, host_id: HostId) -> bool {
        self.hosts.read().await.contains_key(&host_id)
    }

    pub async fn count(&self) -> usize {
        self.hosts.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_net::keys::hash_public_key;

    fn dummy_sender() -> PeerSender {
        PeerSender::detached()
    }

    #[tokio::test]
    async fn eviction_is_visible_to_later_lookups() {
        let registry = HostRegistry::new();
        let key = hash_public_key(b"some-key");

        registry.register(HostId(42), key, dummy_sender()).await;
        assert!(registry.contains(HostId(42)).await);

        registry.unregister(HostId(42)).await;
        assert!(registry.get(HostId(42)).await.is_none());
        assert_eq!(registry.count().await, 0);
    }
}
