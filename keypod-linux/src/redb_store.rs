//! Durable store on redb: pools, relationship records and the node identity in one file.

use std::path::Path;

use keypod_core::store::{DurableStore, PeerRecord, StoreError, StoredPool};
use keypod_core::{Identity, PeerId, PoolKind};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::info;

const POOLS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");
const PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");
const IDENTITY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("identity");

const IDENTITY_SECRET: &str = "identity_secret";

fn db_err<E: Into<redb::Error>>(e: E) -> StoreError {
    StoreError::Backend(e.into().to_string())
}

fn pool_key(peer: &PeerId, kind: PoolKind) -> String {
    format!("{}/{}", peer.to_hex(), kind.name())
}

pub struct RedbStore {
    db: Database,
}

impl RedbStore {
    /// Open or create the database at `path`, creating parent directories and tables.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("{}: {e}", parent.display())))?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let write_txn = db.begin_write().map_err(db_err)?;
        {
            let _ = write_txn.open_table(POOLS_TABLE).map_err(db_err)?;
            let _ = write_txn.open_table(PEERS_TABLE).map_err(db_err)?;
            let _ = write_txn.open_table(IDENTITY_TABLE).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(Self { db })
    }

    /// The node identity, generated and saved on first use.
    pub fn load_or_create_identity(&self) -> Result<Identity, StoreError> {
        let existing = {
            let read_txn = self.db.begin_read().map_err(db_err)?;
            let table = read_txn.open_table(IDENTITY_TABLE).map_err(db_err)?;
            let value = table.get(IDENTITY_SECRET).map_err(db_err)?;
            value.map(|v| v.value().to_vec())
        };
        if let Some(bytes) = existing {
            let secret: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupt(format!("identity secret is {} bytes", bytes.len())))?;
            return Ok(Identity::from_secret_bytes(secret));
        }
        let identity = Identity::generate();
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE).map_err(db_err)?;
            table
                .insert(IDENTITY_SECRET, identity.secret_bytes().as_slice())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        info!(peer = %identity.peer_id(), "generated node identity");
        Ok(identity)
    }
}

impl DurableStore for RedbStore {
    fn load_pool(&self, peer: &PeerId, kind: PoolKind) -> Result<Option<StoredPool>, StoreError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(POOLS_TABLE).map_err(db_err)?;
        let key = pool_key(peer, kind);
        let Some(value) = table.get(key.as_str()).map_err(db_err)? else {
            return Ok(None);
        };
        let pool = bincode::deserialize(value.value())
            .map_err(|e| StoreError::Corrupt(format!("{key}: {e}")))?;
        Ok(Some(pool))
    }

    fn save_pool(&self, peer: &PeerId, kind: PoolKind, pool: &StoredPool) -> Result<(), StoreError> {
        let data = bincode::serialize(pool).map_err(|e| StoreError::Backend(e.to_string()))?;
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(POOLS_TABLE).map_err(db_err)?;
            table
                .insert(pool_key(peer, kind).as_str(), data.as_slice())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn save_pools(&self, peer: &PeerId, public: &StoredPool, private: &StoredPool) -> Result<(), StoreError> {
        let public_data = bincode::serialize(public).map_err(|e| StoreError::Backend(e.to_string()))?;
        let private_data = bincode::serialize(private).map_err(|e| StoreError::Backend(e.to_string()))?;
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(POOLS_TABLE).map_err(db_err)?;
            table
                .insert(pool_key(peer, PoolKind::Public).as_str(), public_data.as_slice())
                .map_err(db_err)?;
            table
                .insert(pool_key(peer, PoolKind::Private).as_str(), private_data.as_slice())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn delete_pools(&self, peer: &PeerId) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(POOLS_TABLE).map_err(db_err)?;
            table
                .remove(pool_key(peer, PoolKind::Public).as_str())
                .map_err(db_err)?;
            table
                .remove(pool_key(peer, PoolKind::Private).as_str())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn load_peer(&self, peer: &PeerId) -> Result<Option<PeerRecord>, StoreError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(PEERS_TABLE).map_err(db_err)?;
        let key = peer.to_hex();
        let Some(value) = table.get(key.as_str()).map_err(db_err)? else {
            return Ok(None);
        };
        let record = bincode::deserialize(value.value())
            .map_err(|e| StoreError::Corrupt(format!("peer {key}: {e}")))?;
        Ok(Some(record))
    }

    fn save_peer(&self, record: &PeerRecord) -> Result<(), StoreError> {
        let data = bincode::serialize(record).map_err(|e| StoreError::Backend(e.to_string()))?;
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(PEERS_TABLE).map_err(db_err)?;
            table
                .insert(record.id.to_hex().as_str(), data.as_slice())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn delete_peer(&self, peer: &PeerId) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = write_txn.open_table(PEERS_TABLE).map_err(db_err)?;
            table.remove(peer.to_hex().as_str()).map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn list_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let read_txn = self.db.begin_read().map_err(db_err)?;
        let table = read_txn.open_table(PEERS_TABLE).map_err(db_err)?;
        let mut peers = Vec::new();
        for entry in table.iter().map_err(db_err)? {
            let (key, value) = entry.map_err(db_err)?;
            let record: PeerRecord = bincode::deserialize(value.value())
                .map_err(|e| StoreError::Corrupt(format!("peer {}: {e}", key.value())))?;
            peers.push(record);
        }
        // Keys are hex ids, so table order is id order.
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use keypod_core::keypool::KeyPoolStore;
    use keypod_core::Curve;
    use tempfile::TempDir;

    use super::*;

    fn create_test_store() -> (RedbStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RedbStore::open(temp_dir.path().join("nested/keypod.redb")).unwrap();
        (store, temp_dir)
    }

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 16])
    }

    #[test]
    fn identity_persists_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keypod.redb");
        let first = RedbStore::open(&path).unwrap().load_or_create_identity().unwrap();
        let second = RedbStore::open(&path).unwrap().load_or_create_identity().unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn peers_are_listed_in_id_order() {
        let (store, _dir) = create_test_store();
        for n in [3u8, 1, 2] {
            store
                .save_peer(&PeerRecord {
                    id: peer(n),
                    label: None,
                    created_at_ms: 0,
                })
                .unwrap();
        }
        let ids: Vec<_> = store.list_peers().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, [peer(1), peer(2), peer(3)]);
        store.delete_peer(&peer(2)).unwrap();
        assert_eq!(store.list_peers().unwrap().len(), 2);
        assert!(store.load_peer(&peer(2)).unwrap().is_none());
    }

    #[test]
    fn counts_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keypod.redb");
        let keys = Curve::X25519.generate(4);
        {
            let pools = KeyPoolStore::new(RedbStore::open(&path).unwrap());
            pools.ensure_peer(&peer(7), Some("Mac-Studio")).unwrap();
            let handle = pools.create_pool(&peer(7), Curve::X25519, 8).unwrap();
            let public = keypod_core::keypool::encode_blob(Curve::X25519, PoolKind::Public, &keys.publics).unwrap();
            let private = keypod_core::keypool::encode_blob(Curve::X25519, PoolKind::Private, &keys.secrets).unwrap();
            pools.install(&handle, public, private).unwrap();
        }
        let pools = KeyPoolStore::new(RedbStore::open(&path).unwrap());
        assert_eq!(pools.count(&peer(7), PoolKind::Public).unwrap(), 4);
        assert_eq!(pools.count(&peer(7), PoolKind::Private).unwrap(), 4);
        assert_eq!(
            pools.peer_record(&peer(7)).unwrap().unwrap().label.as_deref(),
            Some("Mac-Studio")
        );
    }

    #[test]
    fn delete_pools_removes_both_kinds_and_is_idempotent() {
        let (store, _dir) = create_test_store();
        let pool = StoredPool {
            blob: vec![1, 2, 3],
            curve: Curve::Ed25519,
            capacity: 2,
        };
        store.save_pools(&peer(1), &pool, &pool).unwrap();
        assert!(store.load_pool(&peer(1), PoolKind::Private).unwrap().is_some());
        store.delete_pools(&peer(1)).unwrap();
        store.delete_pools(&peer(1)).unwrap();
        assert!(store.load_pool(&peer(1), PoolKind::Public).unwrap().is_none());
        assert!(store.load_pool(&peer(1), PoolKind::Private).unwrap().is_none());
    }
}
