//! Per-peer session actor. One task owns one [`Session`] and serializes every transition for that
//! peer; callers talk to it through [`SessionHandle`].

use std::sync::Arc;
use std::time::Duration;

use keypod_core::keypool::KeyStoreError;
use keypod_core::session::{HandshakeError, HandshakeState, Outbound, PoolParams, Session};
use keypod_core::store::DurableStore;
use keypod_core::wire::encode_frame;
use keypod_core::{Envelope, KeyPoolStore, PeerId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::Transport;

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("session actor for {0} has stopped")]
    Stopped(PeerId),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
}

enum Command {
    Initiate {
        params: PoolParams,
        reply: oneshot::Sender<Result<HandshakeState, HandshakeError>>,
    },
    Deliver(Envelope),
    Malformed(String),
    LinkLost,
    Revoke {
        reply: oneshot::Sender<Result<(), KeyStoreError>>,
    },
}

pub struct SessionHandle {
    peer: PeerId,
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<HandshakeState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn spawn<S: DurableStore + 'static>(
        peer: PeerId,
        step_timeout: Duration,
        pools: Arc<KeyPoolStore<S>>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (state_tx, state) = watch::channel(HandshakeState::Idle);
        let actor = SessionActor {
            session: Session::new(peer, step_timeout),
            pools,
            transport,
            state: state_tx,
        };
        let task = tokio::spawn(actor.run(rx));
        Self {
            peer,
            tx,
            state,
            task,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state.borrow().clone()
    }

    /// Start a negotiation. Returns the state the session moved to.
    pub async fn initiate(&self, params: PoolParams) -> Result<HandshakeState, ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Initiate { params, reply }).await?;
        Ok(rx.await.map_err(|_| ActorError::Stopped(self.peer))??)
    }

    pub async fn deliver(&self, envelope: Envelope) -> Result<(), ActorError> {
        self.send(Command::Deliver(envelope)).await
    }

    pub async fn malformed(&self, reason: String) -> Result<(), ActorError> {
        self.send(Command::Malformed(reason)).await
    }

    pub async fn link_lost(&self) -> Result<(), ActorError> {
        self.send(Command::LinkLost).await
    }

    /// Clear both pools and reset to idle.
    pub async fn revoke(&self) -> Result<(), ActorError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Revoke { reply }).await?;
        Ok(rx.await.map_err(|_| ActorError::Stopped(self.peer))??)
    }

    async fn send(&self, command: Command) -> Result<(), ActorError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ActorError::Stopped(self.peer))
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct SessionActor<S> {
    session: Session,
    pools: Arc<KeyPoolStore<S>>,
    transport: Arc<dyn Transport>,
    state: watch::Sender<HandshakeState>,
}

impl<S: DurableStore + 'static> SessionActor<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let peer = self.session.peer();
        loop {
            let deadline = self.session.deadline();
            let expired = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = expired => {
                    let out = self.session.on_timeout(now());
                    self.perform(out).await;
                    self.publish();
                }
            }
        }
        debug!(peer = %peer, "session actor stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Initiate { params, reply } => {
                let result = match self.session.initiate(params, now()) {
                    Ok(out) => {
                        self.perform(out).await;
                        Ok(self.session.state().clone())
                    }
                    Err(e) => Err(e),
                };
                self.publish();
                let _ = reply.send(result);
            }
            Command::Deliver(envelope) => {
                let out = self.session.on_envelope(envelope, &self.pools, now());
                self.perform(out).await;
                self.publish();
            }
            Command::Malformed(reason) => {
                let out = self.session.on_malformed(&reason, now());
                self.perform(out).await;
                self.publish();
            }
            Command::LinkLost => {
                let peer = self.session.peer();
                let relationship = match self.pools.has_relationship(&peer) {
                    Ok(exists) => exists,
                    Err(e) => {
                        warn!(peer = %peer, error = %e, "could not read pools on disconnect");
                        false
                    }
                };
                let out = self.session.on_disconnect(relationship, now());
                self.perform(out).await;
                self.publish();
            }
            Command::Revoke { reply } => {
                let result = match self.session.revoke(&self.pools, now()) {
                    Ok(out) => {
                        self.perform(out).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                self.publish();
                let _ = reply.send(result);
            }
        }
    }

    async fn perform(&self, out: Vec<Outbound>) {
        let peer = self.session.peer();
        for action in out {
            match action {
                Outbound::Send(envelope) => {
                    let kind = envelope.body.kind();
                    let frame = match encode_frame(&envelope) {
                        Ok(f) => f,
                        Err(e) => {
                            warn!(peer = %peer, kind, error = %e, "could not encode envelope");
                            continue;
                        }
                    };
                    if let Err(e) = self.transport.send(&peer, frame).await {
                        warn!(peer = %peer, kind, error = %e, "send failed");
                    }
                }
                Outbound::Completed {
                    public_keys,
                    private_keys,
                } => {
                    debug!(peer = %peer, public_keys, private_keys, "relationship ready");
                }
                Outbound::Failed { reason } => {
                    debug!(peer = %peer, reason = %reason, "negotiation ended");
                }
            }
        }
    }

    fn publish(&self) {
        self.state.send_if_modified(|current| {
            let next = self.session.state();
            if current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
    }
}

/// Session clock. Follows tokio's clock so paused-time tests drive deadlines.
fn now() -> std::time::Instant {
    Instant::now().into_std()
}
