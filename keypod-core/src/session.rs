//! Host-driven pairing session: one per remote peer identity.
//!
//! The host feeds the session local commands, decoded envelopes, timer expiry and link events,
//! each stamped with `now`, and performs the returned [`Outbound`] actions. The session never does
//! I/O itself except through the [`KeyPoolStore`] it is handed when a message may complete it.
//!
//! ```text
//! initiator                                   responder
//! idle ── Request ──────────────────────────▶ requestReceived
//! requestSent                                 offerSent
//! offerReceived ◀────────────────── Offer ──
//! ackSent ── Ack ───────────────────────────▶ ackReceived
//!                                             commitSent
//! ◀──────────────────────────────── Commit ──
//! commitSent  (pools written)
//! completed ── Commit ──────────────────────▶ commitReceivedWaitingForKeys
//!                                             completed (pools written)
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::curve::{Curve, KeySet, PoolKind};
use crate::identity::PeerId;
use crate::keypool::{encode_blob, KeyPoolStore, KeyStoreError, MAX_CAPACITY};
use crate::protocol::{Envelope, HandshakeBody, PROTOCOL_VERSION};
use crate::store::DurableStore;

/// Default wait for the next expected message.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub const TIMEOUT_REASON: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    RequestSent,
    RequestReceived,
    OfferSent,
    OfferReceived,
    AckSent,
    AckReceived,
    CommitSent,
    CommitReceivedWaitingForKeys,
    Completed,
    Failed { reason: String },
}

impl HandshakeState {
    pub fn label(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "idle",
            HandshakeState::RequestSent => "requestSent",
            HandshakeState::RequestReceived => "requestReceived",
            HandshakeState::OfferSent => "offerSent",
            HandshakeState::OfferReceived => "offerReceived",
            HandshakeState::AckSent => "ackSent",
            HandshakeState::AckReceived => "ackReceived",
            HandshakeState::CommitSent => "commitSent",
            HandshakeState::CommitReceivedWaitingForKeys => "commitReceivedWaitingForKeys",
            HandshakeState::Completed => "completed",
            HandshakeState::Failed { .. } => "failed",
        }
    }

    /// `idle` and `completed`.
    pub fn is_resting(&self) -> bool {
        matches!(self, HandshakeState::Idle | HandshakeState::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, HandshakeState::Failed { .. })
    }

    pub fn is_in_progress(&self) -> bool {
        !self.is_resting() && !self.is_failed()
    }

    /// `initiate` (and rotation) are only legal from here.
    pub fn can_initiate(&self) -> bool {
        matches!(self, HandshakeState::Idle | HandshakeState::Failed { .. })
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::Failed { reason } => write!(f, "failed({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParams {
    pub curve: Curve,
    pub capacity: u32,
}

impl PoolParams {
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(HandshakeError::InvalidParams(format!(
                "capacity {} outside 1..={MAX_CAPACITY}",
                self.capacity
            )));
        }
        Ok(())
    }
}

/// When the session entered a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepStamp {
    pub state: &'static str,
    pub at: Instant,
}

/// What the host must do after feeding the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Send(Envelope),
    Completed {
        public_keys: usize,
        private_keys: usize,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake already in progress ({0})")]
    Busy(&'static str),
    #[error("no relationship to rotate")]
    NoRelationship,
    #[error("invalid pool parameters: {0}")]
    InvalidParams(String),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

struct Exchange {
    id: [u8; 16],
    role: Role,
    params: PoolParams,
    /// Secrets generated for this exchange. Dropped once written or abandoned.
    local: Option<KeySet>,
    remote_keys: Vec<Vec<u8>>,
    digest: Option<[u8; 32]>,
}

impl Exchange {
    fn local_publics(&self) -> &[Vec<u8>] {
        self.local.as_ref().map(|l| l.publics.as_slice()).unwrap_or(&[])
    }

    fn transcript_digest(&self) -> [u8; 32] {
        let (responder, initiator) = match self.role {
            Role::Initiator => (self.remote_keys.as_slice(), self.local_publics()),
            Role::Responder => (self.local_publics(), self.remote_keys.as_slice()),
        };
        let mut hasher = Sha256::new();
        hasher.update(b"keypod-commit-v1");
        hasher.update(self.id);
        hasher.update([self.params.curve.tag()]);
        hasher.update(self.params.capacity.to_le_bytes());
        for key in responder.iter().chain(initiator) {
            hasher.update(key);
        }
        hasher.finalize().into()
    }
}

pub struct Session {
    peer: PeerId,
    state: HandshakeState,
    exchange: Option<Exchange>,
    step_timeout: Duration,
    deadline: Option<Instant>,
    steps: Vec<StepStamp>,
}

impl Session {
    pub fn new(peer: PeerId, step_timeout: Duration) -> Self {
        Self {
            peer,
            state: HandshakeState::Idle,
            exchange: None,
            step_timeout,
            deadline: None,
            steps: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn role(&self) -> Option<Role> {
        self.exchange.as_ref().map(|e| e.role)
    }

    /// When the current wait expires, if the session is waiting for a message.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// States entered during the current (or last) exchange.
    pub fn steps(&self) -> &[StepStamp] {
        &self.steps
    }

    /// Start a negotiation. Rejected without any change unless the session is idle or failed.
    pub fn initiate(&mut self, params: PoolParams, now: Instant) -> Result<Vec<Outbound>, HandshakeError> {
        if !self.state.can_initiate() {
            debug!(peer = %self.peer, state = %self.state, "initiate rejected");
            return Err(HandshakeError::Busy(self.state.label()));
        }
        params.validate()?;
        let id = uuid::Uuid::new_v4().into_bytes();
        self.exchange = Some(Exchange {
            id,
            role: Role::Initiator,
            params,
            local: None,
            remote_keys: Vec::new(),
            digest: None,
        });
        self.steps.clear();
        self.enter(HandshakeState::RequestSent, now, true);
        Ok(vec![Outbound::Send(Envelope::new(
            id,
            HandshakeBody::Request {
                curve: params.curve,
                capacity: params.capacity,
            },
        ))])
    }

    /// Feed one inbound envelope.
    pub fn on_envelope<S: DurableStore>(
        &mut self,
        env: Envelope,
        pools: &KeyPoolStore<S>,
        now: Instant,
    ) -> Vec<Outbound> {
        if env.version != PROTOCOL_VERSION {
            let reason = format!("unsupported envelope version {}", env.version);
            if self.state.is_in_progress() {
                return self.fail(reason, now, true);
            }
            return vec![Outbound::Send(Envelope::new(
                env.exchange_id,
                HandshakeBody::Reject { reason },
            ))];
        }
        let id = env.exchange_id;
        match env.body {
            HandshakeBody::Request { curve, capacity } => {
                self.on_request(id, PoolParams { curve, capacity }, pools, now)
            }
            HandshakeBody::Reject { reason } => self.on_reject(id, reason, pools, now),
            body => {
                if self.exchange.as_ref().map(|e| e.id) != Some(id) {
                    debug!(peer = %self.peer, kind = body.kind(), "message for another exchange ignored");
                    return Vec::new();
                }
                let role = self.role();
                match (body, self.state.clone()) {
                    (
                        HandshakeBody::Offer {
                            curve,
                            capacity,
                            keys,
                        },
                        HandshakeState::RequestSent,
                    ) => self.on_offer(PoolParams { curve, capacity }, keys, now),
                    (HandshakeBody::Ack { keys }, HandshakeState::OfferSent) => self.on_ack(keys, now),
                    (HandshakeBody::Commit { digest }, HandshakeState::AckSent) => {
                        self.on_commit_as_initiator(digest, pools, now)
                    }
                    (HandshakeBody::Commit { digest }, HandshakeState::CommitSent)
                        if role == Some(Role::Responder) =>
                    {
                        self.on_commit_as_responder(digest, pools, now)
                    }
                    (body, state) => {
                        let reason = format!("unexpected {} in {}", body.kind(), state.label());
                        self.fail(reason, now, true)
                    }
                }
            }
        }
    }

    /// A frame from this peer could not be decoded.
    pub fn on_malformed(&mut self, reason: &str, now: Instant) -> Vec<Outbound> {
        if !self.state.is_in_progress() {
            warn!(peer = %self.peer, reason, "malformed frame outside a negotiation ignored");
            return Vec::new();
        }
        self.fail(format!("malformed message: {reason}"), now, true)
    }

    /// Timer tick. Fails the session if the current wait has expired.
    pub fn on_timeout(&mut self, now: Instant) -> Vec<Outbound> {
        match self.deadline {
            Some(deadline) if now >= deadline && self.state.is_in_progress() => {
                self.fail(TIMEOUT_REASON.to_string(), now, true)
            }
            _ => Vec::new(),
        }
    }

    /// Authoritative link loss. An unfinished negotiation fails, or drops back to idle when a
    /// relationship already exists (its pools stay valid). A completed session returns to idle.
    pub fn on_disconnect(&mut self, relationship_exists: bool, now: Instant) -> Vec<Outbound> {
        if self.state == HandshakeState::Completed {
            self.enter(HandshakeState::Idle, now, false);
            return Vec::new();
        }
        if !self.state.is_in_progress() {
            return Vec::new();
        }
        if relationship_exists {
            self.exchange = None;
            self.enter(HandshakeState::Idle, now, false);
            Vec::new()
        } else {
            self.fail("disconnected".to_string(), now, false)
        }
    }

    /// Clear both pools and reset to idle, whatever the current state.
    pub fn revoke<S: DurableStore>(
        &mut self,
        pools: &KeyPoolStore<S>,
        now: Instant,
    ) -> Result<Vec<Outbound>, KeyStoreError> {
        pools.clear(&self.peer)?;
        let mut out = Vec::new();
        if let (true, Some(ex)) = (self.state.is_in_progress(), &self.exchange) {
            out.push(Outbound::Send(Envelope::new(
                ex.id,
                HandshakeBody::Reject {
                    reason: "revoked".into(),
                },
            )));
        }
        self.exchange = None;
        self.steps.clear();
        self.enter(HandshakeState::Idle, now, false);
        info!(peer = %self.peer, "relationship revoked");
        Ok(out)
    }

    fn on_request<S: DurableStore>(
        &mut self,
        id: [u8; 16],
        params: PoolParams,
        pools: &KeyPoolStore<S>,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.state.is_in_progress() {
            if self.exchange.as_ref().map(|e| e.id) == Some(id) {
                debug!(peer = %self.peer, "duplicate request ignored");
                return Vec::new();
            }
            let reason = format!("unexpected request in {}", self.state.label());
            return self.fail(reason, now, true);
        }
        self.exchange = Some(Exchange {
            id,
            role: Role::Responder,
            params,
            local: None,
            remote_keys: Vec::new(),
            digest: None,
        });
        self.steps.clear();
        self.enter(HandshakeState::RequestReceived, now, false);

        if let Err(e) = params.validate() {
            return self.fail(e.to_string(), now, true);
        }
        match pools.pool(&self.peer) {
            Ok(Some(existing))
                if existing.curve() != params.curve || existing.capacity() != params.capacity =>
            {
                let reason = format!(
                    "pool is {}/{}, request wants {}/{}",
                    existing.curve(),
                    existing.capacity(),
                    params.curve,
                    params.capacity
                );
                return self.fail(reason, now, true);
            }
            Ok(_) => {}
            Err(e) => return self.fail(format!("key store: {e}"), now, true),
        }

        // Only generate once the requested capacity is known to be bounded.
        let local = params.curve.generate(params.capacity as usize);
        let keys = local.publics.clone();
        if let Some(ex) = self.exchange.as_mut() {
            ex.local = Some(local);
        }
        self.enter(HandshakeState::OfferSent, now, true);
        vec![Outbound::Send(Envelope::new(
            id,
            HandshakeBody::Offer {
                curve: params.curve,
                capacity: params.capacity,
                keys,
            },
        ))]
    }

    fn on_offer(&mut self, offered: PoolParams, keys: Vec<Vec<u8>>, now: Instant) -> Vec<Outbound> {
        let Some(ex) = self.exchange.as_mut() else {
            return Vec::new();
        };
        if offered != ex.params {
            return self.fail("offer changed pool parameters".into(), now, true);
        }
        if let Err(reason) = check_peer_keys(ex.params, &keys) {
            return self.fail(format!("offer: {reason}"), now, true);
        }
        let local = ex.params.curve.generate(ex.params.capacity as usize);
        let ack_keys = local.publics.clone();
        let id = ex.id;
        ex.remote_keys = keys;
        ex.local = Some(local);
        self.enter(HandshakeState::OfferReceived, now, false);
        self.enter(HandshakeState::AckSent, now, true);
        vec![Outbound::Send(Envelope::new(id, HandshakeBody::Ack { keys: ack_keys }))]
    }

    fn on_ack(&mut self, keys: Vec<Vec<u8>>, now: Instant) -> Vec<Outbound> {
        let Some(ex) = self.exchange.as_mut() else {
            return Vec::new();
        };
        if let Err(reason) = check_peer_keys(ex.params, &keys) {
            return self.fail(format!("ack: {reason}"), now, true);
        }
        ex.remote_keys = keys;
        let digest = ex.transcript_digest();
        ex.digest = Some(digest);
        let id = ex.id;
        self.enter(HandshakeState::AckReceived, now, false);
        self.enter(HandshakeState::CommitSent, now, true);
        vec![Outbound::Send(Envelope::new(id, HandshakeBody::Commit { digest }))]
    }

    fn on_commit_as_initiator<S: DurableStore>(
        &mut self,
        digest: [u8; 32],
        pools: &KeyPoolStore<S>,
        now: Instant,
    ) -> Vec<Outbound> {
        let Some(ex) = self.exchange.as_ref() else {
            return Vec::new();
        };
        if ex.transcript_digest() != digest {
            return self.fail("commit digest mismatch".into(), now, true);
        }
        let id = ex.id;
        self.enter(HandshakeState::CommitSent, now, false);
        match self.persist(pools) {
            Ok((public_keys, private_keys)) => {
                self.enter(HandshakeState::Completed, now, false);
                info!(peer = %self.peer, public_keys, private_keys, "pairing completed");
                vec![
                    Outbound::Send(Envelope::new(id, HandshakeBody::Commit { digest })),
                    Outbound::Completed {
                        public_keys,
                        private_keys,
                    },
                ]
            }
            Err(reason) => self.fail(reason, now, true),
        }
    }

    fn on_commit_as_responder<S: DurableStore>(
        &mut self,
        digest: [u8; 32],
        pools: &KeyPoolStore<S>,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.exchange.as_ref().and_then(|e| e.digest) != Some(digest) {
            return self.fail("commit digest mismatch".into(), now, true);
        }
        self.enter(HandshakeState::CommitReceivedWaitingForKeys, now, false);
        match self.persist(pools) {
            Ok((public_keys, private_keys)) => {
                self.enter(HandshakeState::Completed, now, false);
                info!(peer = %self.peer, public_keys, private_keys, "pairing completed");
                vec![Outbound::Completed {
                    public_keys,
                    private_keys,
                }]
            }
            Err(reason) => self.fail(reason, now, true),
        }
    }

    fn on_reject<S: DurableStore>(
        &mut self,
        id: [u8; 16],
        reason: String,
        pools: &KeyPoolStore<S>,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.exchange.as_ref().map(|e| e.id) != Some(id) {
            debug!(peer = %self.peer, "reject for another exchange ignored");
            return Vec::new();
        }
        match self.state {
            HandshakeState::Completed => {
                // The peer could not write its side; our pools have no counterpart.
                if let Err(e) = pools.clear(&self.peer) {
                    warn!(peer = %self.peer, error = %e, "could not roll back pools after reject");
                }
                self.fail(format!("rejected by peer: {reason}"), now, false)
            }
            _ if self.state.is_in_progress() => {
                self.fail(format!("rejected by peer: {reason}"), now, false)
            }
            _ => Vec::new(),
        }
    }

    /// Write both pools. Only a successful, non-empty write may lead to `completed`.
    fn persist<S: DurableStore>(&mut self, pools: &KeyPoolStore<S>) -> Result<(usize, usize), String> {
        let ex = self
            .exchange
            .as_mut()
            .ok_or_else(|| "no exchange to persist".to_string())?;
        let local = ex
            .local
            .take()
            .ok_or_else(|| "no local keys to persist".to_string())?;
        match write_pools(pools, &self.peer, ex.params, &ex.remote_keys, &local.secrets) {
            Ok((0, _)) | Ok((_, 0)) => Err("key store: pool written empty".into()),
            Ok(counts) => {
                ex.remote_keys.clear();
                Ok(counts)
            }
            Err(e) => Err(format!("key store: {e}")),
        }
    }

    fn fail(&mut self, reason: String, now: Instant, notify_peer: bool) -> Vec<Outbound> {
        let mut out = Vec::new();
        if let (true, Some(ex)) = (notify_peer, &self.exchange) {
            out.push(Outbound::Send(Envelope::new(
                ex.id,
                HandshakeBody::Reject {
                    reason: reason.clone(),
                },
            )));
        }
        warn!(peer = %self.peer, state = %self.state, reason = %reason, "pairing failed");
        self.exchange = None;
        self.enter(
            HandshakeState::Failed {
                reason: reason.clone(),
            },
            now,
            false,
        );
        out.push(Outbound::Failed { reason });
        out
    }

    fn enter(&mut self, state: HandshakeState, now: Instant, wait: bool) {
        debug!(peer = %self.peer, from = self.state.label(), to = state.label(), "transition");
        self.steps.push(StepStamp {
            state: state.label(),
            at: now,
        });
        self.state = state;
        self.deadline = wait.then(|| now + self.step_timeout);
    }
}

fn write_pools<S: DurableStore>(
    pools: &KeyPoolStore<S>,
    peer: &PeerId,
    params: PoolParams,
    public_keys: &[Vec<u8>],
    secrets: &[Vec<u8>],
) -> Result<(usize, usize), KeyStoreError> {
    let fresh = pools.pool(peer)?.is_none();
    let handle = pools.create_pool(peer, params.curve, params.capacity)?;
    let installed = encode_blob(params.curve, PoolKind::Public, public_keys)
        .and_then(|public| Ok((public, encode_blob(params.curve, PoolKind::Private, secrets)?)))
        .and_then(|(public, private)| pools.install(&handle, public, private));
    if installed.is_err() && fresh {
        // Do not leave an empty pair behind as if a relationship existed.
        if let Err(e) = pools.clear(peer) {
            warn!(peer = %peer, error = %e, "could not drop empty pools after failed write");
        }
    }
    installed
}

fn check_peer_keys(params: PoolParams, keys: &[Vec<u8>]) -> Result<(), String> {
    if keys.len() != params.capacity as usize {
        return Err(format!(
            "expected {} keys, got {}",
            params.capacity,
            keys.len()
        ));
    }
    for key in keys {
        params.curve.validate_public(key).map_err(|e| e.to_string())?;
    }
    Ok(())
}
