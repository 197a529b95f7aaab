//! Durable store boundary: where pools and relationship records live between restarts.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::curve::{Curve, PoolKind};
use crate::identity::PeerId;

/// One pool as persisted: opaque blob plus the immutable curve/capacity metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPool {
    pub blob: Vec<u8>,
    pub curve: Curve,
    pub capacity: u32,
}

/// Relationship record for one remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    /// Last advertised name, if the peer was ever seen through discovery.
    pub label: Option<String>,
    pub created_at_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
}

/// Persistence used by [`crate::keypool::KeyPoolStore`].
///
/// Implementations must make every single call atomic. `save_pools` and `delete_pools` cover both
/// kinds of one peer and must not leave one kind written and the other not.
pub trait DurableStore: Send + Sync {
    fn load_pool(&self, peer: &PeerId, kind: PoolKind) -> Result<Option<StoredPool>, StoreError>;
    fn save_pool(&self, peer: &PeerId, kind: PoolKind, pool: &StoredPool) -> Result<(), StoreError>;
    fn save_pools(
        &self,
        peer: &PeerId,
        public: &StoredPool,
        private: &StoredPool,
    ) -> Result<(), StoreError>;
    fn delete_pools(&self, peer: &PeerId) -> Result<(), StoreError>;

    fn load_peer(&self, peer: &PeerId) -> Result<Option<PeerRecord>, StoreError>;
    fn save_peer(&self, record: &PeerRecord) -> Result<(), StoreError>;
    fn delete_peer(&self, peer: &PeerId) -> Result<(), StoreError>;
    fn list_peers(&self) -> Result<Vec<PeerRecord>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    pools: HashMap<(PeerId, PoolKind), StoredPool>,
    peers: HashMap<PeerId, PeerRecord>,
}

/// In-process store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

impl DurableStore for MemoryStore {
    fn load_pool(&self, peer: &PeerId, kind: PoolKind) -> Result<Option<StoredPool>, StoreError> {
        Ok(self.lock()?.pools.get(&(*peer, kind)).cloned())
    }

    fn save_pool(&self, peer: &PeerId, kind: PoolKind, pool: &StoredPool) -> Result<(), StoreError> {
        self.lock()?.pools.insert((*peer, kind), pool.clone());
        Ok(())
    }

    fn save_pools(
        &self,
        peer: &PeerId,
        public: &StoredPool,
        private: &StoredPool,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.pools.insert((*peer, PoolKind::Public), public.clone());
        inner.pools.insert((*peer, PoolKind::Private), private.clone());
        Ok(())
    }

    fn delete_pools(&self, peer: &PeerId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.pools.remove(&(*peer, PoolKind::Public));
        inner.pools.remove(&(*peer, PoolKind::Private));
        Ok(())
    }

    fn load_peer(&self, peer: &PeerId) -> Result<Option<PeerRecord>, StoreError> {
        Ok(self.lock()?.peers.get(peer).cloned())
    }

    fn save_peer(&self, record: &PeerRecord) -> Result<(), StoreError> {
        self.lock()?.peers.insert(record.id, record.clone());
        Ok(())
    }

    fn delete_peer(&self, peer: &PeerId) -> Result<(), StoreError> {
        self.lock()?.peers.remove(peer);
        Ok(())
    }

    fn list_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let mut peers: Vec<PeerRecord> = self.lock()?.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        Ok(peers)
    }
}
