//! Node: the daemon's public surface. Owns one session actor per peer, routes transport events to
//! them, and exposes peer listing, pairing, rotation, revocation and discovery queries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use keypod_core::discovery::DiscoveredPeer;
use keypod_core::keypool::KeyStoreError;
use keypod_core::session::{HandshakeError, HandshakeState, PoolParams};
use keypod_core::store::DurableStore;
use keypod_core::wire::{decode_frame, FrameError};
use keypod_core::{Envelope, KeyPoolStore, PeerId, PoolKind};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::actor::{ActorError, SessionHandle};
use crate::merger::DiscoveryMerger;
use crate::transport::{Transport, TransportError, TransportEvent};

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub step_timeout: Duration,
    /// Curve and capacity for new relationships.
    pub pool_params: PoolParams,
    /// Pair automatically with newly connected peers that have no relationship yet.
    pub auto_pair: bool,
    /// Default for [`Node::wait_for_discovery`].
    pub wait_timeout: Duration,
}

/// One row of [`Node::list_peers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: PeerId,
    pub label: Option<String>,
    pub online: bool,
    pub state: HandshakeState,
    /// `None` when no pool exists.
    pub public_keys: Option<usize>,
    pub private_keys: Option<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer {0} is not connected")]
    Offline(PeerId),
    #[error("session actor for {0} has stopped")]
    SessionStopped(PeerId),
    #[error("discovery is not running")]
    NoDiscovery,
}

impl From<ActorError> for NodeError {
    fn from(e: ActorError) -> Self {
        match e {
            ActorError::Stopped(peer) => NodeError::SessionStopped(peer),
            ActorError::Handshake(e) => NodeError::Handshake(e),
            ActorError::KeyStore(e) => NodeError::KeyStore(e),
        }
    }
}

pub struct Node<S: DurableStore + 'static> {
    local: PeerId,
    pools: Arc<KeyPoolStore<S>>,
    transport: Arc<dyn Transport>,
    discovery: Option<Arc<DiscoveryMerger>>,
    options: NodeOptions,
    sessions: Mutex<HashMap<PeerId, Arc<SessionHandle>>>,
    online: Mutex<HashSet<PeerId>>,
    /// Discovery dedup key -> identity proven on connect.
    endpoints: Mutex<HashMap<String, PeerId>>,
}

impl<S: DurableStore + 'static> Node<S> {
    pub fn new(
        local: PeerId,
        pools: Arc<KeyPoolStore<S>>,
        transport: Arc<dyn Transport>,
        discovery: Option<Arc<DiscoveryMerger>>,
        options: NodeOptions,
    ) -> Self {
        Self {
            local,
            pools,
            transport,
            discovery,
            options,
            sessions: Mutex::new(HashMap::new()),
            online: Mutex::new(HashSet::new()),
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn pools(&self) -> &KeyPoolStore<S> {
        &self.pools
    }

    /// The session for `peer`, created (with its relationship record) on first use.
    async fn session(&self, peer: &PeerId) -> Result<Arc<SessionHandle>, NodeError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get(peer) {
            return Ok(handle.clone());
        }
        self.pools.ensure_peer(peer, None)?;
        let handle = Arc::new(SessionHandle::spawn(
            *peer,
            self.options.step_timeout,
            self.pools.clone(),
            self.transport.clone(),
        ));
        sessions.insert(*peer, handle.clone());
        debug!(peer = %peer, "session created");
        Ok(handle)
    }

    /// Every known peer: relationship records plus any live session, sorted by id.
    pub async fn list_peers(&self) -> Result<Vec<PeerSummary>, NodeError> {
        let records = self.pools.peer_records()?;
        let sessions = self.sessions.lock().await;
        let online = self.online.lock().await;
        let mut ids: Vec<PeerId> = records.iter().map(|r| r.id).collect();
        ids.extend(sessions.keys().copied());
        ids.sort();
        ids.dedup();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let count = |kind| match self.pools.count(&id, kind) {
                Ok(n) => Some(n),
                Err(KeyStoreError::NoPool { .. }) => None,
                Err(e) => {
                    warn!(peer = %id, %kind, error = %e, "pool unreadable");
                    None
                }
            };
            out.push(PeerSummary {
                id,
                label: records.iter().find(|r| r.id == id).and_then(|r| r.label.clone()),
                online: online.contains(&id),
                state: sessions
                    .get(&id)
                    .map(|s| s.state())
                    .unwrap_or(HandshakeState::Idle),
                public_keys: count(PoolKind::Public),
                private_keys: count(PoolKind::Private),
            });
        }
        Ok(out)
    }

    pub async fn handshake_state(&self, peer: &PeerId) -> Option<HandshakeState> {
        self.sessions.lock().await.get(peer).map(|s| s.state())
    }

    /// Start pairing with a connected peer using the configured pool parameters.
    pub async fn initiate_handshake(&self, peer: &PeerId) -> Result<HandshakeState, NodeError> {
        self.start(peer, self.options.pool_params).await
    }

    /// Start over after a failed negotiation. Same guard as [`Self::initiate_handshake`].
    pub async fn retry_handshake(&self, peer: &PeerId) -> Result<HandshakeState, NodeError> {
        debug!(peer = %peer, "retrying handshake");
        self.start(peer, self.options.pool_params).await
    }

    /// Replace the keys of an existing relationship, keeping its curve and capacity.
    pub async fn rotate_keys(&self, peer: &PeerId) -> Result<HandshakeState, NodeError> {
        let handle = self
            .pools
            .pool(peer)?
            .ok_or(NodeError::Handshake(HandshakeError::NoRelationship))?;
        info!(peer = %peer, curve = %handle.curve(), capacity = handle.capacity(), "rotating keys");
        self.start(
            peer,
            PoolParams {
                curve: handle.curve(),
                capacity: handle.capacity(),
            },
        )
        .await
    }

    async fn start(&self, peer: &PeerId, params: PoolParams) -> Result<HandshakeState, NodeError> {
        if !self.online.lock().await.contains(peer) {
            return Err(NodeError::Offline(*peer));
        }
        let session = self.session(peer).await?;
        Ok(session.initiate(params).await?)
    }

    /// Clear both pools and reset the session. The relationship record stays.
    pub async fn revoke_relationship(&self, peer: &PeerId) -> Result<(), NodeError> {
        let session = self.session(peer).await?;
        session.revoke().await?;
        Ok(())
    }

    /// Forget `peer` entirely: pools first, then the record, then the session and link.
    pub async fn remove_peer(&self, peer: &PeerId) -> Result<(), NodeError> {
        let session = self.sessions.lock().await.remove(peer);
        if let Some(session) = session {
            session.revoke().await?;
        }
        self.pools.delete(peer)?;
        self.endpoints.lock().await.retain(|_, id| id != peer);
        self.transport.disconnect(peer).await;
        info!(peer = %peer, "peer removed");
        Ok(())
    }

    pub fn discovery_snapshot(&self) -> Vec<DiscoveredPeer> {
        self.discovery
            .as_ref()
            .map(|d| d.results())
            .unwrap_or_default()
    }

    /// See [`DiscoveryMerger::wait_for`]. `timeout` defaults to the configured wait timeout.
    pub async fn wait_for_discovery(
        &self,
        cached: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Option<DiscoveredPeer>, NodeError> {
        let discovery = self.discovery.as_ref().ok_or(NodeError::NoDiscovery)?;
        Ok(discovery
            .wait_for(cached, timeout.unwrap_or(self.options.wait_timeout))
            .await)
    }

    /// Open a link to a discovered endpoint unless one to the same identity is already up.
    pub async fn connect_discovered(&self, endpoint: &DiscoveredPeer) -> Result<PeerId, NodeError> {
        if let Some(peer) = self.endpoints.lock().await.get(&endpoint.dedup_key).copied() {
            if self.transport.is_connected(&peer) {
                return Ok(peer);
            }
        }
        let peer = self.transport.connect(&endpoint.host, endpoint.port).await?;
        self.pools.ensure_peer(&peer, Some(&endpoint.name))?;
        self.endpoints
            .lock()
            .await
            .insert(endpoint.dedup_key.clone(), peer);
        Ok(peer)
    }

    /// Drain transport events until the transport closes its channel.
    pub async fn run(&self, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_transport_event(event).await {
                warn!(error = %e, "transport event not handled");
            }
        }
        debug!("transport event stream closed");
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) -> Result<(), NodeError> {
        match event {
            TransportEvent::Received { peer, bytes } => {
                let session = self.session(&peer).await?;
                match decode_envelope(&bytes) {
                    Ok(envelope) => session.deliver(envelope).await?,
                    Err(e) => session.malformed(e.to_string()).await?,
                }
            }
            TransportEvent::Connectivity { peer, online: true } => {
                self.online.lock().await.insert(peer);
                let session = self.session(&peer).await?;
                if self.options.auto_pair
                    && self.local < peer
                    && !self.pools.has_relationship(&peer)?
                    && session.state().can_initiate()
                {
                    match self.start(&peer, self.options.pool_params).await {
                        Ok(state) => info!(peer = %peer, %state, "auto-pairing"),
                        Err(NodeError::Handshake(HandshakeError::Busy(_))) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            TransportEvent::Connectivity { peer, online: false } => {
                self.online.lock().await.remove(&peer);
                let session = self.sessions.lock().await.get(&peer).cloned();
                if let Some(session) = session {
                    session.link_lost().await?;
                }
            }
        }
        Ok(())
    }
}

/// One envelope filling the whole payload.
fn decode_envelope(bytes: &[u8]) -> Result<Envelope, FrameError> {
    let (envelope, used) = decode_frame::<Envelope>(bytes)?;
    if used != bytes.len() {
        return Err(FrameError::TooLarge(bytes.len()));
    }
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use keypod_core::wire::encode_frame;
    use keypod_core::{Curve, HandshakeBody, Identity, MemoryStore};

    use super::*;

    /// Delivers sends straight into the remote node's event channel, or records them when the
    /// remote is unreachable.
    struct Wire {
        local: PeerId,
        routes: StdMutex<HashMap<PeerId, mpsc::Sender<TransportEvent>>>,
        sent: StdMutex<Vec<(PeerId, Vec<u8>)>>,
    }

    impl Wire {
        fn new(local: PeerId) -> Arc<Self> {
            Arc::new(Self {
                local,
                routes: StdMutex::new(HashMap::new()),
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn route(&self, peer: PeerId, tx: mpsc::Sender<TransportEvent>) {
            self.routes.lock().unwrap().insert(peer, tx);
        }

        fn sent_kinds(&self) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(_, b)| decode_envelope(b).unwrap().body.kind())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for Wire {
        async fn connect(&self, _host: &str, _port: u16) -> Result<PeerId, TransportError> {
            Err(TransportError::SelfConnect)
        }

        async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((*peer, bytes.clone()));
            let route = self.routes.lock().unwrap().get(peer).cloned();
            if let Some(tx) = route {
                let _ = tx
                    .send(TransportEvent::Received {
                        peer: self.local,
                        bytes,
                    })
                    .await;
            }
            Ok(())
        }

        async fn disconnect(&self, _peer: &PeerId) {}

        fn is_connected(&self, peer: &PeerId) -> bool {
            self.routes.lock().unwrap().contains_key(peer)
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn options(auto_pair: bool) -> NodeOptions {
        NodeOptions {
            step_timeout: TIMEOUT,
            pool_params: PoolParams {
                curve: Curve::X25519,
                capacity: 16,
            },
            auto_pair,
            wait_timeout: Duration::from_secs(1),
        }
    }

    struct Harness {
        node: Arc<Node<MemoryStore>>,
        wire: Arc<Wire>,
        events: mpsc::Sender<TransportEvent>,
    }

    fn harness(auto_pair: bool) -> (Harness, mpsc::Receiver<TransportEvent>) {
        let local = Identity::generate().peer_id();
        let wire = Wire::new(local);
        let node = Arc::new(Node::new(
            local,
            Arc::new(KeyPoolStore::new(MemoryStore::new())),
            wire.clone(),
            None,
            options(auto_pair),
        ));
        let (events, rx) = mpsc::channel(64);
        (Harness { node, wire, events }, rx)
    }

    /// Two nodes wired to each other, both running and both told the link is up.
    async fn linked(auto_pair: bool) -> (Harness, Harness) {
        let (a, a_rx) = harness(auto_pair);
        let (b, b_rx) = harness(auto_pair);
        a.wire.route(b.node.local_peer(), b.events.clone());
        b.wire.route(a.node.local_peer(), a.events.clone());
        for (h, rx) in [(&a, a_rx), (&b, b_rx)] {
            let node = h.node.clone();
            tokio::spawn(async move { node.run(rx).await });
        }
        a.events
            .send(TransportEvent::Connectivity {
                peer: b.node.local_peer(),
                online: true,
            })
            .await
            .unwrap();
        b.events
            .send(TransportEvent::Connectivity {
                peer: a.node.local_peer(),
                online: true,
            })
            .await
            .unwrap();
        settle().await;
        (a, b)
    }

    /// Let spawned tasks drain their queues.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn summary(h: &Harness, peer: PeerId) -> PeerSummary {
        h.node
            .list_peers()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.id == peer)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_completes_with_persisted_counts() {
        let (a, b) = linked(false).await;
        let b_id = b.node.local_peer();
        let a_id = a.node.local_peer();

        let state = a.node.initiate_handshake(&b_id).await.unwrap();
        assert_eq!(state, HandshakeState::RequestSent);
        settle().await;

        let a_view = summary(&a, b_id).await;
        assert_eq!(a_view.state, HandshakeState::Completed);
        assert!(a_view.online);
        assert_eq!(a_view.public_keys, Some(16));
        assert_eq!(a_view.private_keys, Some(16));

        let b_view = summary(&b, a_id).await;
        assert_eq!(b_view.state, HandshakeState::Completed);
        assert_eq!(b_view.public_keys, Some(16));
        assert_eq!(b_view.private_keys, Some(16));
        assert_eq!(a.wire.sent_kinds(), ["request", "ack", "commit"]);
        assert_eq!(b.wire.sent_kinds(), ["offer", "commit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn lower_identity_auto_pairs() {
        let (a, b) = linked(true).await;
        settle().await;
        let (low, high) = if a.node.local_peer() < b.node.local_peer() {
            (&a, &b)
        } else {
            (&b, &a)
        };
        assert_eq!(low.wire.sent_kinds().first(), Some(&"request"));
        assert_eq!(high.wire.sent_kinds().first(), Some(&"offer"));
        let view = summary(low, high.node.local_peer()).await;
        assert_eq!(view.state, HandshakeState::Completed);
    }

    /// A node whose peer never answers.
    async fn lonely() -> (Harness, PeerId) {
        let (h, rx) = harness(false);
        let node = h.node.clone();
        tokio::spawn(async move { node.run(rx).await });
        let silent = Identity::generate().peer_id();
        h.events
            .send(TransportEvent::Connectivity {
                peer: silent,
                online: true,
            })
            .await
            .unwrap();
        settle().await;
        (h, silent)
    }

    #[tokio::test(start_paused = true)]
    async fn second_initiate_is_rejected_and_state_stays_request_sent() {
        let (h, silent) = lonely().await;
        h.node.initiate_handshake(&silent).await.unwrap();
        let err = h.node.initiate_handshake(&silent).await.unwrap_err();
        assert!(matches!(err, NodeError::Handshake(HandshakeError::Busy(_))));
        assert_eq!(
            h.node.handshake_state(&silent).await,
            Some(HandshakeState::RequestSent)
        );
        assert_eq!(h.wire.sent_kinds(), ["request"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_and_retry_restarts() {
        let (h, silent) = lonely().await;
        h.node.initiate_handshake(&silent).await.unwrap();
        tokio::time::sleep(TIMEOUT + Duration::from_millis(1)).await;
        assert_eq!(
            h.node.handshake_state(&silent).await,
            Some(HandshakeState::Failed {
                reason: "timeout".into()
            })
        );
        assert_eq!(h.wire.sent_kinds(), ["request", "reject"]);

        let state = h.node.retry_handshake(&silent).await.unwrap();
        assert_eq!(state, HandshakeState::RequestSent);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_peer_cannot_be_paired() {
        let (h, _rx) = harness(false);
        let stranger = Identity::generate().peer_id();
        assert!(matches!(
            h.node.initiate_handshake(&stranger).await,
            Err(NodeError::Offline(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn link_loss_mid_negotiation_fails_first_pairing() {
        let (h, silent) = lonely().await;
        h.node.initiate_handshake(&silent).await.unwrap();
        h.events
            .send(TransportEvent::Connectivity {
                peer: silent,
                online: false,
            })
            .await
            .unwrap();
        settle().await;
        assert_eq!(
            h.node.handshake_state(&silent).await,
            Some(HandshakeState::Failed {
                reason: "disconnected".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_frame_fails_the_negotiation() {
        let (h, silent) = lonely().await;
        h.node.initiate_handshake(&silent).await.unwrap();
        h.events
            .send(TransportEvent::Received {
                peer: silent,
                bytes: vec![0xde, 0xad],
            })
            .await
            .unwrap();
        settle().await;
        assert!(matches!(
            h.node.handshake_state(&silent).await,
            Some(HandshakeState::Failed { reason }) if reason.starts_with("malformed message")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn revoke_and_remove() {
        let (a, b) = linked(false).await;
        let b_id = b.node.local_peer();
        a.node.initiate_handshake(&b_id).await.unwrap();
        settle().await;

        a.node.revoke_relationship(&b_id).await.unwrap();
        let view = summary(&a, b_id).await;
        assert_eq!(view.state, HandshakeState::Idle);
        assert_eq!(view.public_keys, None);
        assert!(a.node.pools().peer_record(&b_id).unwrap().is_some());

        a.node.remove_peer(&b_id).await.unwrap();
        assert!(a.node.pools().peer_record(&b_id).unwrap().is_none());
        assert!(!a.node.pools().has_relationship(&b_id).unwrap());
        assert!(a.node.handshake_state(&b_id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_requires_and_replaces_a_relationship() {
        let (a, b) = linked(false).await;
        let b_id = b.node.local_peer();
        assert!(matches!(
            a.node.rotate_keys(&b_id).await,
            Err(NodeError::Handshake(HandshakeError::NoRelationship))
        ));

        a.node.initiate_handshake(&b_id).await.unwrap();
        settle().await;
        let before = a.node.pools().keys(&b_id, PoolKind::Public).unwrap();

        assert_eq!(
            a.node.rotate_keys(&b_id).await.unwrap_err().to_string(),
            "handshake already in progress (completed)"
        );
        // A dropped link resets a paired session to idle, from where rotation is allowed.
        for online in [false, true] {
            a.events
                .send(TransportEvent::Connectivity { peer: b_id, online })
                .await
                .unwrap();
            settle().await;
        }
        assert_eq!(a.node.handshake_state(&b_id).await, Some(HandshakeState::Idle));
        a.node.rotate_keys(&b_id).await.unwrap();
        settle().await;
        assert_eq!(
            a.node.handshake_state(&b_id).await,
            Some(HandshakeState::Completed)
        );
        assert_ne!(a.node.pools().keys(&b_id, PoolKind::Public).unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn envelope_with_trailing_bytes_is_malformed() {
        let mut bytes = encode_frame(&Envelope::new(
            [0; 16],
            HandshakeBody::Reject {
                reason: "x".into(),
            },
        ))
        .unwrap();
        assert!(decode_envelope(&bytes).is_ok());
        bytes.push(0);
        assert!(decode_envelope(&bytes).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_queries_need_a_merger() {
        let (h, _rx) = harness(false);
        assert!(h.node.discovery_snapshot().is_empty());
        assert!(matches!(
            h.node.wait_for_discovery(None, None).await,
            Err(NodeError::NoDiscovery)
        ));
    }
}
