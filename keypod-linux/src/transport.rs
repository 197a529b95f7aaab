//! Local transport: TCP server (incoming), TCP client (outbound to discovered peers), hello +
//! encrypted frames. Payloads are opaque to the transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use keypod_core::identity::{open, seal, LinkCryptoError, LinkKeys};
use keypod_core::wire::{frame_len, hello_bytes, parse_hello, FrameError, HELLO_LEN, LEN_SIZE};
use keypod_core::{Identity, LinkNonce, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Poly1305 tag added to every sealed frame.
const TAG_LEN: usize = 16;
const EVENT_QUEUE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Received { peer: PeerId, bytes: Vec<u8> },
    /// Link to `peer` came up or went away. Authoritative for session handling.
    Connectivity { peer: PeerId, online: bool },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("link crypto: {0}")]
    Crypto(#[from] LinkCryptoError),
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error("refusing to connect to ourselves")]
    SelfConnect,
}

/// What the node needs from a link layer.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a link to `host:port`. Returns the identity the remote proved in its hello.
    async fn connect(&self, host: &str, port: u16) -> Result<PeerId, TransportError>;
    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError>;
    async fn disconnect(&self, peer: &PeerId);
    fn is_connected(&self, peer: &PeerId) -> bool;
}

struct Link {
    id: u64,
    /// Who dialed: decides which of two simultaneous links survives.
    initiator: PeerId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

type Links = Arc<std::sync::Mutex<HashMap<PeerId, Link>>>;

pub struct TcpTransport {
    me: Weak<TcpTransport>,
    identity: Arc<Identity>,
    links: Links,
    events: mpsc::Sender<TransportEvent>,
    next_link: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Listen on `port` (0 for any). Returns the transport, its event stream and the bound address.
    pub async fn bind(
        identity: Arc<Identity>,
        port: u16,
    ) -> std::io::Result<(Arc<Self>, mpsc::Receiver<TransportEvent>, SocketAddr)> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local = listener.local_addr()?;
        let (events, rx) = mpsc::channel(EVENT_QUEUE);
        let transport = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            identity,
            links: Arc::new(std::sync::Mutex::new(HashMap::new())),
            events,
            next_link: AtomicU64::new(0),
            accept_task: Mutex::new(None),
        });
        let accepting = transport.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let transport = accepting.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.establish(stream, false).await {
                                debug!(%addr, error = %e, "inbound link rejected");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        break;
                    }
                }
            }
        });
        *transport.accept_task.lock().await = Some(task);
        info!(%local, peer = %transport.identity.peer_id(), "transport listening");
        Ok((transport, rx, local))
    }

    pub fn local_peer(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Hello exchange, then register the link and start its reader and writer.
    async fn establish(self: &Arc<Self>, mut stream: TcpStream, outbound: bool) -> Result<PeerId, TransportError> {
        let nonce = LinkNonce::random();
        let ours = hello_bytes(self.identity.public_key(), &nonce);
        let mut theirs = [0u8; HELLO_LEN];
        if outbound {
            stream.write_all(&ours).await?;
            stream.flush().await?;
            stream.read_exact(&mut theirs).await?;
        } else {
            stream.read_exact(&mut theirs).await?;
            stream.write_all(&ours).await?;
            stream.flush().await?;
        }
        let (remote_key, remote_nonce) = parse_hello(&theirs)?;
        let local = self.identity.peer_id();
        let peer = remote_key.peer_id();
        if peer == local {
            return Err(TransportError::SelfConnect);
        }
        let keys = self.identity.link_keys(&remote_key, &nonce, &remote_nonce);
        let initiator = if outbound { local } else { peer };
        let (reader, writer) = stream.into_split();
        self.register(peer, initiator, keys, reader, writer).await?;
        Ok(peer)
    }

    async fn register(
        self: &Arc<Self>,
        peer: PeerId,
        initiator: PeerId,
        keys: LinkKeys,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
    ) -> Result<(), TransportError> {
        let LinkKeys { send: send_key, recv: recv_key } = keys;
        let id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let preferred_initiator = self.identity.peer_id().min(peer);
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let was_online = {
            let mut links = self.lock_links();
            if let Some(existing) = links.get(&peer) {
                // Both sides dialed at once: keep the link the lower identity dialed.
                if existing.initiator == preferred_initiator {
                    debug!(peer = %peer, "duplicate link dropped");
                    return Ok(());
                }
            }
            let transport = self.clone();
            let reader = tokio::spawn(async move {
                transport.read_loop(peer, id, recv_key, reader).await;
            });
            let replaced = links.insert(
                peer,
                Link {
                    id,
                    initiator,
                    tx,
                    reader,
                },
            );
            if let Some(old) = &replaced {
                old.reader.abort();
            }
            replaced.is_some()
        };
        tokio::spawn(write_loop(peer, send_key, rx, writer));
        if !was_online {
            info!(peer = %peer, "link up");
            let _ = self
                .events
                .send(TransportEvent::Connectivity { peer, online: true })
                .await;
        }
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, peer: PeerId, id: u64, key: [u8; 32], mut reader: OwnedReadHalf) {
        let mut counter: u64 = 0;
        let reason = loop {
            let mut len_buf = [0u8; LEN_SIZE];
            if let Err(e) = reader.read_exact(&mut len_buf).await {
                break e.to_string();
            }
            let len = match frame_len(&len_buf) {
                Ok(len) => len + TAG_LEN,
                Err(e) => break e.to_string(),
            };
            let mut sealed = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut sealed).await {
                break e.to_string();
            }
            let bytes = match open(&key, counter, &sealed) {
                Ok(p) => p,
                Err(e) => break e.to_string(),
            };
            counter = counter.saturating_add(1);
            if self
                .events
                .send(TransportEvent::Received { peer, bytes })
                .await
                .is_err()
            {
                break "event receiver closed".to_string();
            }
        };
        debug!(peer = %peer, reason = %reason, "link reader stopped");
        let removed = {
            let mut links = self.lock_links();
            match links.get(&peer) {
                Some(link) if link.id == id => links.remove(&peer).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(peer = %peer, "link down");
            let _ = self
                .events
                .send(TransportEvent::Connectivity { peer, online: false })
                .await;
        }
    }

    fn lock_links(&self) -> std::sync::MutexGuard<'_, HashMap<PeerId, Link>> {
        // A poisoned map is still structurally valid.
        self.links.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        let links: Vec<Link> = self.lock_links().drain().map(|(_, l)| l).collect();
        for link in links {
            link.reader.abort();
        }
    }
}

async fn write_loop(peer: PeerId, key: [u8; 32], mut rx: mpsc::UnboundedReceiver<Vec<u8>>, mut writer: OwnedWriteHalf) {
    let mut counter: u64 = 0;
    while let Some(plain) = rx.recv().await {
        let sealed = match seal(&key, counter, &plain) {
            Ok(c) => c,
            Err(e) => {
                warn!(peer = %peer, error = %e, "seal failed, dropping link");
                break;
            }
        };
        counter = counter.saturating_add(1);
        // The prefix announces the plaintext length; the tag follows implicitly.
        let len = (sealed.len() - TAG_LEN) as u32;
        if writer.write_all(&len.to_le_bytes()).await.is_err()
            || writer.write_all(&sealed).await.is_err()
            || writer.flush().await.is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> Result<PeerId, TransportError> {
        let this = self
            .me
            .upgrade()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "transport shut down"))?;
        let stream = TcpStream::connect((host, port)).await?;
        this.establish(stream, true).await
    }

    async fn send(&self, peer: &PeerId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let links = self.lock_links();
        let link = links.get(peer).ok_or(TransportError::NotConnected(*peer))?;
        link.tx
            .send(bytes)
            .map_err(|_| TransportError::NotConnected(*peer))
    }

    async fn disconnect(&self, peer: &PeerId) {
        let link = self.lock_links().remove(peer);
        if let Some(link) = link {
            link.reader.abort();
            info!(peer = %peer, "link closed");
            let _ = self
                .events
                .send(TransportEvent::Connectivity {
                    peer: *peer,
                    online: false,
                })
                .await;
        }
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.lock_links().contains_key(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn transport() -> (Arc<TcpTransport>, mpsc::Receiver<TransportEvent>, u16) {
        let (t, rx, addr) = TcpTransport::bind(Arc::new(Identity::generate()), 0).await.unwrap();
        (t, rx, addr.port())
    }

    #[tokio::test]
    async fn linked_transports_exchange_sealed_frames() {
        let (a, mut a_rx, _) = transport().await;
        let (b, mut b_rx, b_port) = transport().await;

        let peer_b = a.connect("127.0.0.1", b_port).await.unwrap();
        assert_eq!(peer_b, b.local_peer());
        let peer_a = a.local_peer();
        assert_eq!(
            a_rx.recv().await,
            Some(TransportEvent::Connectivity { peer: peer_b, online: true })
        );
        assert_eq!(
            b_rx.recv().await,
            Some(TransportEvent::Connectivity { peer: peer_a, online: true })
        );

        a.send(&peer_b, b"first".to_vec()).await.unwrap();
        a.send(&peer_b, b"second".to_vec()).await.unwrap();
        b.send(&peer_a, b"back".to_vec()).await.unwrap();
        assert_eq!(
            b_rx.recv().await,
            Some(TransportEvent::Received { peer: peer_a, bytes: b"first".to_vec() })
        );
        assert_eq!(
            b_rx.recv().await,
            Some(TransportEvent::Received { peer: peer_a, bytes: b"second".to_vec() })
        );
        assert_eq!(
            a_rx.recv().await,
            Some(TransportEvent::Received { peer: peer_b, bytes: b"back".to_vec() })
        );

        a.disconnect(&peer_b).await;
        assert!(!a.is_connected(&peer_b));
        assert_eq!(
            a_rx.recv().await,
            Some(TransportEvent::Connectivity { peer: peer_b, online: false })
        );
        assert_eq!(
            b_rx.recv().await,
            Some(TransportEvent::Connectivity { peer: peer_a, online: false })
        );
    }

    #[tokio::test]
    async fn send_without_link_fails() {
        let (a, _rx, _) = transport().await;
        let stranger = Identity::generate().peer_id();
        assert!(matches!(
            a.send(&stranger, vec![1]).await,
            Err(TransportError::NotConnected(p)) if p == stranger
        ));
    }

    #[tokio::test]
    async fn connecting_to_ourselves_is_refused() {
        let (a, _rx, port) = transport().await;
        assert!(matches!(
            a.connect("127.0.0.1", port).await,
            Err(TransportError::SelfConnect)
        ));
    }
}
