//! Device identity and link crypto: identity keys, peer IDs, link session keys, frame sealing.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Long-lived identity public key (32 bytes, X25519). Sent in the transport hello.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IdentityKey([u8; 32]);

impl IdentityKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        IdentityKey(bytes)
    }

    /// Stable peer identity for this key.
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_identity_key(&self.0)
    }
}

/// Stable public identifier of a peer: first 16 bytes of SHA-256 over its identity key.
///
/// Unlike a discovered endpoint, a `PeerId` survives address and name changes and is the key
/// for sessions, pools and relationship records.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn from_identity_key(key: &[u8; 32]) -> Self {
        let digest = Sha256::new()
            .chain_update(b"keypod-peer-id-v1")
            .chain_update(key)
            .finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", &self.to_hex()[..8])
    }
}

/// Fresh randomness each side contributes to one link, so no two links share keys.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LinkNonce([u8; 16]);

impl LinkNonce {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        LinkNonce(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        LinkNonce(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// This device's identity keypair. The secret never leaves the process except through
/// [`Identity::secret_bytes`] for persistence.
pub struct Identity {
    secret: StaticSecret,
    public: IdentityKey,
    peer_id: PeerId,
}

impl Identity {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore a persisted identity.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = IdentityKey(X25519PublicKey::from(&secret).to_bytes());
        let peer_id = public.peer_id();
        Self {
            secret,
            public,
            peer_id,
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> &IdentityKey {
        &self.public
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Derive the pair of link keys shared with `remote` for one link. Both nonces come from
    /// the hello exchange of that link.
    pub fn link_keys(&self, remote: &IdentityKey, local_nonce: &LinkNonce, remote_nonce: &LinkNonce) -> LinkKeys {
        let shared = self
            .secret
            .diffie_hellman(&X25519PublicKey::from(remote.0))
            .to_bytes();
        LinkKeys::derive(&shared, (&self.public, local_nonce), (remote, remote_nonce))
    }
}

/// Direction-separated link keys. Each side seals with `send` and opens with `recv`, so the two
/// directions never share a (key, nonce) pair even though both counters start at zero. The hello
/// nonces make every link's keys fresh, so counters may restart per link.
#[derive(Clone)]
pub struct LinkKeys {
    pub send: [u8; 32],
    pub recv: [u8; 32],
}

impl LinkKeys {
    fn derive(shared: &[u8; 32], local: (&IdentityKey, &LinkNonce), remote: (&IdentityKey, &LinkNonce)) -> Self {
        let key_for = |from: (&IdentityKey, &LinkNonce), to: (&IdentityKey, &LinkNonce)| -> [u8; 32] {
            Sha256::new()
                .chain_update(b"keypod-link-v2")
                .chain_update(shared)
                .chain_update(from.0.as_bytes())
                .chain_update(from.1.as_bytes())
                .chain_update(to.0.as_bytes())
                .chain_update(to.1.as_bytes())
                .finalize()
                .into()
        };
        Self {
            send: key_for(local, remote),
            recv: key_for(remote, local),
        }
    }
}

fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Seal one frame with ChaCha20-Poly1305. `counter` must never repeat for a key.
pub fn seal(key: &[u8; 32], counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, LinkCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| LinkCryptoError::Key)?;
    let nonce = nonce_bytes(counter);
    cipher
        .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| LinkCryptoError::Seal)
}

pub fn open(key: &[u8; 32], counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, LinkCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| LinkCryptoError::Key)?;
    let nonce = nonce_bytes(counter);
    cipher
        .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| LinkCryptoError::Open)
}

#[derive(Debug, thiserror::Error)]
pub enum LinkCryptoError {
    #[error("invalid key")]
    Key,
    #[error("seal failed")]
    Seal,
    #[error("open failed")]
    Open,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_follows_identity_key() {
        let identity = Identity::generate();
        assert_eq!(identity.peer_id(), identity.public_key().peer_id());
        let restored = Identity::from_secret_bytes(identity.secret_bytes());
        assert_eq!(restored.peer_id(), identity.peer_id());
    }

    #[test]
    fn peer_id_hex_is_32_chars() {
        let id = Identity::generate().peer_id();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(format!("{id}"), hex);
    }

    #[test]
    fn link_keys_mirror_each_other() {
        let a = Identity::generate();
        let b = Identity::generate();
        let (na, nb) = (LinkNonce::random(), LinkNonce::random());
        let ab = a.link_keys(b.public_key(), &na, &nb);
        let ba = b.link_keys(a.public_key(), &nb, &na);
        assert_eq!(ab.send, ba.recv);
        assert_eq!(ab.recv, ba.send);
        assert_ne!(ab.send, ab.recv);
    }

    #[test]
    fn every_link_between_a_pair_gets_fresh_keys() {
        let a = Identity::generate();
        let b = Identity::generate();
        let first = a.link_keys(b.public_key(), &LinkNonce::random(), &LinkNonce::random());
        let second = a.link_keys(b.public_key(), &LinkNonce::random(), &LinkNonce::random());
        assert_ne!(first.send, second.send);
        assert_ne!(first.recv, second.recv);

        // A frame sealed on one link does not open on the next, even at the same counter.
        let sealed = seal(&first.send, 0, b"pool offer").unwrap();
        assert!(open(&second.send, 0, &sealed).is_err());

        // Changing only the remote nonce is enough.
        let nonce = LinkNonce::from_bytes([7; 16]);
        let x = a.link_keys(b.public_key(), &nonce, &LinkNonce::from_bytes([1; 16]));
        let y = a.link_keys(b.public_key(), &nonce, &LinkNonce::from_bytes([2; 16]));
        assert_ne!(x.send, y.send);
    }

    #[test]
    fn sealed_frame_opens_only_with_matching_counter() {
        let a = Identity::generate();
        let b = Identity::generate();
        let (na, nb) = (LinkNonce::random(), LinkNonce::random());
        let ab = a.link_keys(b.public_key(), &na, &nb);
        let ba = b.link_keys(a.public_key(), &nb, &na);
        let sealed = seal(&ab.send, 7, b"pool offer").unwrap();
        assert_eq!(open(&ba.recv, 7, &sealed).unwrap(), b"pool offer");
        assert!(open(&ba.recv, 8, &sealed).is_err());
        assert!(open(&ba.send, 7, &sealed).is_err());
    }
}
