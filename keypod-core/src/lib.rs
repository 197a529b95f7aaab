//! KeyPod core: discovery merge, per-peer key pools and the pairing handshake.
//! Host-driven: no sockets or timers; the host passes events and `now`, and performs the returned
//! actions. Persistence goes through the [`store::DurableStore`] trait.

pub mod curve;
pub mod discovery;
pub mod identity;
pub mod keypool;
pub mod protocol;
pub mod session;
pub mod store;
pub mod wire;

pub use curve::{Curve, KeyFormatError, KeySet, PoolKind};
pub use discovery::{DiscoveredPeer, DiscoveryEvent, Mechanism, PeerMap};
pub use identity::{Identity, IdentityKey, LinkNonce, PeerId};
pub use keypool::{KeyPoolStore, KeyStoreError, PoolHandle};
pub use protocol::{DiscoveryMessage, Envelope, HandshakeBody, PROTOCOL_VERSION};
pub use session::{HandshakeError, HandshakeState, Outbound, PoolParams, Role, Session};
pub use store::{DurableStore, MemoryStore, PeerRecord, StoreError, StoredPool};
pub use wire::{decode_frame, encode_frame, FrameError};
