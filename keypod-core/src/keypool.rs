//! Key pool store: two curve-typed, capacity-bounded pools per relationship.
//!
//! Pools are persisted as opaque blobs next to their curve/capacity metadata. Counts are never
//! cached; every read decodes the blob, so a count can't drift from what is on disk. Every write
//! decodes and validates the incoming blob against the pool's metadata before touching the
//! backend, so a rejected write leaves the previous blob in place.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::curve::{Curve, KeyFormatError, PoolKind};
use crate::identity::PeerId;
use crate::store::{DurableStore, PeerRecord, StoreError, StoredPool};

/// Blob format version.
pub const BLOB_VERSION: u8 = 1;

/// Largest pool a relationship may negotiate.
pub const MAX_CAPACITY: u32 = 1024;

#[derive(Serialize, Deserialize)]
struct KeyBlob {
    version: u8,
    curve: Curve,
    kind: PoolKind,
    keys: Vec<Vec<u8>>,
}

/// Serialize `keys` into a pool blob. Keys are validated for `curve` and `kind`.
pub fn encode_blob(curve: Curve, kind: PoolKind, keys: &[Vec<u8>]) -> Result<Vec<u8>, KeyStoreError> {
    for key in keys {
        validate_key(curve, kind, key)?;
    }
    let blob = KeyBlob {
        version: BLOB_VERSION,
        curve,
        kind,
        keys: keys.to_vec(),
    };
    bincode::serialize(&blob).map_err(|e| KeyStoreError::Malformed(e.to_string()))
}

/// Decode a blob and check it against the pool it is meant for.
pub fn decode_blob(
    bytes: &[u8],
    curve: Curve,
    kind: PoolKind,
    capacity: u32,
) -> Result<Vec<Vec<u8>>, KeyStoreError> {
    let blob: KeyBlob =
        bincode::deserialize(bytes).map_err(|e| KeyStoreError::Malformed(e.to_string()))?;
    if blob.version != BLOB_VERSION {
        return Err(KeyStoreError::Malformed(format!(
            "unsupported blob version {}",
            blob.version
        )));
    }
    if blob.curve != curve {
        return Err(KeyStoreError::WrongCurve {
            expected: curve,
            found: blob.curve,
        });
    }
    if blob.kind != kind {
        return Err(KeyStoreError::WrongKind {
            expected: kind,
            found: blob.kind,
        });
    }
    if blob.keys.len() > capacity as usize {
        return Err(KeyStoreError::OverCapacity {
            count: blob.keys.len(),
            capacity,
        });
    }
    for key in &blob.keys {
        validate_key(curve, kind, key)?;
    }
    Ok(blob.keys)
}

fn validate_key(curve: Curve, kind: PoolKind, key: &[u8]) -> Result<(), KeyStoreError> {
    match kind {
        PoolKind::Public => curve.validate_public(key),
        PoolKind::Private => curve.validate_secret(key),
    }
    .map_err(KeyStoreError::Key)
}

/// Opaque handle to a created pool pair. Curve and capacity can be read but never changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolHandle {
    peer: PeerId,
    curve: Curve,
    capacity: u32,
}

impl PoolHandle {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("no relationship record for peer {0}")]
    UnknownPeer(PeerId),
    #[error("no {kind} pool for peer {peer}")]
    NoPool { peer: PeerId, kind: PoolKind },
    #[error("pool exists as {existing_curve}/{existing_capacity}, requested {curve}/{capacity}")]
    Conflict {
        existing_curve: Curve,
        existing_capacity: u32,
        curve: Curve,
        capacity: u32,
    },
    #[error("capacity {0} outside 1..=1024")]
    InvalidCapacity(u32),
    #[error("blob is for curve {found}, pool is {expected}")]
    WrongCurve { expected: Curve, found: Curve },
    #[error("blob holds {found} keys, pool is {expected}")]
    WrongKind { expected: PoolKind, found: PoolKind },
    #[error("blob holds {count} keys, capacity is {capacity}")]
    OverCapacity { count: usize, capacity: u32 },
    #[error("malformed blob: {0}")]
    Malformed(String),
    #[error("invalid key: {0}")]
    Key(#[from] KeyFormatError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Key pools and relationship records on top of a [`DurableStore`].
pub struct KeyPoolStore<S> {
    store: S,
}

impl<S: DurableStore> KeyPoolStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn backend(&self) -> &S {
        &self.store
    }

    /// Load the relationship record for `peer`, creating it if absent. A known `label` replaces a
    /// stale one.
    pub fn ensure_peer(&self, peer: &PeerId, label: Option<&str>) -> Result<PeerRecord, KeyStoreError> {
        match self.store.load_peer(peer)? {
            Some(mut record) => {
                if label.is_some() && record.label.as_deref() != label {
                    record.label = label.map(str::to_string);
                    self.store.save_peer(&record)?;
                }
                Ok(record)
            }
            None => {
                let record = PeerRecord {
                    id: *peer,
                    label: label.map(str::to_string),
                    created_at_ms: now_ms(),
                };
                self.store.save_peer(&record)?;
                debug!(peer = %peer, "relationship record created");
                Ok(record)
            }
        }
    }

    pub fn peer_record(&self, peer: &PeerId) -> Result<Option<PeerRecord>, KeyStoreError> {
        Ok(self.store.load_peer(peer)?)
    }

    pub fn peer_records(&self) -> Result<Vec<PeerRecord>, KeyStoreError> {
        Ok(self.store.list_peers()?)
    }

    /// Create the pool pair for `peer`. Calling again with the same curve and capacity returns
    /// the existing handle; different values are a [`KeyStoreError::Conflict`].
    pub fn create_pool(
        &self,
        peer: &PeerId,
        curve: Curve,
        capacity: u32,
    ) -> Result<PoolHandle, KeyStoreError> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(KeyStoreError::InvalidCapacity(capacity));
        }
        if self.store.load_peer(peer)?.is_none() {
            return Err(KeyStoreError::UnknownPeer(*peer));
        }
        let public = self.store.load_pool(peer, PoolKind::Public)?;
        let private = self.store.load_pool(peer, PoolKind::Private)?;
        for existing in public.iter().chain(private.iter()) {
            if existing.curve != curve || existing.capacity != capacity {
                return Err(KeyStoreError::Conflict {
                    existing_curve: existing.curve,
                    existing_capacity: existing.capacity,
                    curve,
                    capacity,
                });
            }
        }
        let handle = PoolHandle {
            peer: *peer,
            curve,
            capacity,
        };
        if public.is_some() && private.is_some() {
            return Ok(handle);
        }
        let empty = |kind| -> Result<StoredPool, KeyStoreError> {
            Ok(StoredPool {
                blob: encode_blob(curve, kind, &[])?,
                curve,
                capacity,
            })
        };
        let public = match public {
            Some(p) => p,
            None => empty(PoolKind::Public)?,
        };
        let private = match private {
            Some(p) => p,
            None => empty(PoolKind::Private)?,
        };
        self.store.save_pools(peer, &public, &private)?;
        debug!(peer = %peer, curve = %curve, capacity, "pool pair created");
        Ok(handle)
    }

    /// Handle for an existing pool pair, if any.
    pub fn pool(&self, peer: &PeerId) -> Result<Option<PoolHandle>, KeyStoreError> {
        Ok(self
            .store
            .load_pool(peer, PoolKind::Public)?
            .map(|p| PoolHandle {
                peer: *peer,
                curve: p.curve,
                capacity: p.capacity,
            }))
    }

    pub fn has_relationship(&self, peer: &PeerId) -> Result<bool, KeyStoreError> {
        Ok(self.store.load_pool(peer, PoolKind::Public)?.is_some()
            || self.store.load_pool(peer, PoolKind::Private)?.is_some())
    }

    /// Replace one pool's blob. Returns the decoded key count.
    pub fn write(&self, peer: &PeerId, kind: PoolKind, blob: &[u8]) -> Result<usize, KeyStoreError> {
        let existing = self
            .store
            .load_pool(peer, kind)?
            .ok_or(KeyStoreError::NoPool { peer: *peer, kind })?;
        let count = decode_blob(blob, existing.curve, kind, existing.capacity)?.len();
        self.store.save_pool(
            peer,
            kind,
            &StoredPool {
                blob: blob.to_vec(),
                curve: existing.curve,
                capacity: existing.capacity,
            },
        )?;
        Ok(count)
    }

    /// Write both pools of a relationship in one backend call. Both blobs are validated before
    /// anything is stored. Returns `(public_count, private_count)` read back from the store.
    pub fn install(
        &self,
        handle: &PoolHandle,
        public_blob: Vec<u8>,
        private_blob: Vec<u8>,
    ) -> Result<(usize, usize), KeyStoreError> {
        decode_blob(&public_blob, handle.curve, PoolKind::Public, handle.capacity)?;
        decode_blob(&private_blob, handle.curve, PoolKind::Private, handle.capacity)?;
        let stored = |blob| StoredPool {
            blob,
            curve: handle.curve,
            capacity: handle.capacity,
        };
        self.store
            .save_pools(&handle.peer, &stored(public_blob), &stored(private_blob))?;
        let counts = (
            self.count(&handle.peer, PoolKind::Public)?,
            self.count(&handle.peer, PoolKind::Private)?,
        );
        info!(
            peer = %handle.peer,
            public = counts.0,
            private = counts.1,
            "key pools installed"
        );
        Ok(counts)
    }

    /// Number of keys in a pool, decoded from the stored blob.
    pub fn count(&self, peer: &PeerId, kind: PoolKind) -> Result<usize, KeyStoreError> {
        let pool = self
            .store
            .load_pool(peer, kind)?
            .ok_or(KeyStoreError::NoPool { peer: *peer, kind })?;
        Ok(decode_blob(&pool.blob, pool.curve, kind, pool.capacity)?.len())
    }

    /// Keys of a pool, decoded from the stored blob.
    pub fn keys(&self, peer: &PeerId, kind: PoolKind) -> Result<Vec<Vec<u8>>, KeyStoreError> {
        let pool = self
            .store
            .load_pool(peer, kind)?
            .ok_or(KeyStoreError::NoPool { peer: *peer, kind })?;
        decode_blob(&pool.blob, pool.curve, kind, pool.capacity)
    }

    /// Drop both pools. The relationship record stays. Clearing absent pools is a no-op.
    pub fn clear(&self, peer: &PeerId) -> Result<(), KeyStoreError> {
        self.store.delete_pools(peer)?;
        debug!(peer = %peer, "key pools cleared");
        Ok(())
    }

    /// Drop both pools, then the relationship record. Deleting an absent peer is a no-op.
    pub fn delete(&self, peer: &PeerId) -> Result<(), KeyStoreError> {
        self.clear(peer)?;
        self.store.delete_peer(peer)?;
        debug!(peer = %peer, "relationship deleted");
        Ok(())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
