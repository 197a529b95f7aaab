//! LAN advertisement over UDP multicast: periodic adverts (mechanism A) and active browsing with
//! unicast query responses (mechanism B). Both report into the discovery merger.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use keypod_core::discovery::{DiscoveryEvent, Mechanism};
use keypod_core::protocol::{Advert, DiscoveryMessage, PROTOCOL_VERSION};
use keypod_core::wire::{decode_frame, encode_frame};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::merger::{DiscoverySource, SourceSink};

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const MAX_DATAGRAM: usize = 65536;
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

/// What this node advertises.
#[derive(Debug, Clone)]
pub struct Presence {
    pub service: String,
    /// Random per process; lets us drop our own datagrams.
    pub instance: [u8; 16],
    pub name: String,
    pub host: Option<String>,
    /// Transport port.
    pub port: u16,
}

impl Presence {
    pub fn new(service: impl Into<String>, name: impl Into<String>, host: Option<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            instance: uuid::Uuid::new_v4().into_bytes(),
            name: name.into(),
            host,
            port,
        }
    }

    fn advert(&self) -> Advert {
        Advert {
            service: self.service.clone(),
            instance: self.instance,
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    fn goodbye(&self) -> DiscoveryMessage {
        DiscoveryMessage::Goodbye {
            protocol_version: PROTOCOL_VERSION,
            service: self.service.clone(),
            instance: self.instance,
            name: self.name.clone(),
        }
    }

    /// A datagram worth looking at: our version, our service, not from ourselves.
    fn accepts(&self, msg: &DiscoveryMessage) -> bool {
        if msg.protocol_version() != PROTOCOL_VERSION {
            return false;
        }
        match msg {
            DiscoveryMessage::Advert { advert, .. } | DiscoveryMessage::QueryResponse { advert, .. } => {
                advert.service == self.service && advert.instance != self.instance
            }
            DiscoveryMessage::Query { service, .. } => *service == self.service,
            DiscoveryMessage::Goodbye {
                service, instance, ..
            } => *service == self.service && *instance != self.instance,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BeaconOptions {
    pub discovery_port: u16,
    /// Advert and query period.
    pub interval: Duration,
    /// Advertisers not heard from within this window are removed.
    pub expiry: Duration,
}

struct Sighting {
    name: String,
    host: String,
    port: u16,
    last_seen: Instant,
}

/// Last sighting per advertiser instance, for change detection and expiry.
#[derive(Default)]
struct Sightings {
    seen: HashMap<[u8; 16], Sighting>,
}

impl Sightings {
    /// Refresh an unchanged sighting. False if it is new or changed.
    fn touch(&mut self, instance: &[u8; 16], name: &str, host: &str, port: u16, now: Instant) -> bool {
        match self.seen.get_mut(instance) {
            Some(s) if s.name == name && s.host == host && s.port == port => {
                s.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Record a sighting. Unchanged sightings re-announce themselves so an entry dropped by a
    /// removal elsewhere comes back on the next refresh.
    fn observe(&mut self, instance: [u8; 16], name: &str, host: &str, port: u16, now: Instant) -> Vec<DiscoveryEvent> {
        let resolved = DiscoveryEvent::Resolved {
            name: name.to_string(),
            host: host.to_string(),
            port,
        };
        if self.touch(&instance, name, host, port, now) {
            return vec![resolved];
        }
        let previous = self.seen.insert(
            instance,
            Sighting {
                name: name.to_string(),
                host: host.to_string(),
                port,
                last_seen: now,
            },
        );
        let mut out = match previous.filter(|p| p.name != name) {
            Some(previous) => self.withdraw(previous.name),
            None => Vec::new(),
        };
        out.push(resolved);
        out
    }

    fn forget(&mut self, instance: &[u8; 16]) -> Vec<DiscoveryEvent> {
        match self.seen.remove(instance) {
            Some(s) => self.withdraw(s.name),
            None => Vec::new(),
        }
    }

    /// `Removed` for a name that lost a sighting. Removal is by name, so other live instances
    /// under the same name are announced again right after it.
    fn withdraw(&self, name: String) -> Vec<DiscoveryEvent> {
        let survivors = self.seen.values().filter(|s| s.name == name).map(|s| DiscoveryEvent::Resolved {
            name: s.name.clone(),
            host: s.host.clone(),
            port: s.port,
        });
        let mut out = vec![DiscoveryEvent::Removed { name: name.clone() }];
        out.extend(survivors);
        out
    }

    fn expire(&mut self, now: Instant, expiry: Duration) -> Vec<DiscoveryEvent> {
        let stale: Vec<[u8; 16]> = self
            .seen
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) >= expiry)
            .map(|(id, _)| *id)
            .collect();
        stale.iter().flat_map(|id| self.forget(id)).collect()
    }
}

fn io_invalid(e: impl std::error::Error + Send + Sync + 'static) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, e)
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn group_addr(discovery_port: u16) -> SocketAddr {
    SocketAddr::from((MULTICAST_GROUP, discovery_port))
}

/// What to do with one datagram on the group socket.
#[derive(Debug, Default, PartialEq, Eq)]
struct Reaction {
    events: Vec<DiscoveryEvent>,
    answer_query: bool,
}

/// Mechanism A: announces this node on the group and listens for others' adverts. Also answers
/// queries from browsers with a unicast response.
pub struct AdvertSource {
    presence: Presence,
    options: BeaconOptions,
    queriers: Mutex<HashMap<SocketAddr, Instant>>,
}

impl AdvertSource {
    pub fn new(presence: Presence, options: BeaconOptions) -> Self {
        Self {
            presence,
            options,
            queriers: Mutex::new(HashMap::new()),
        }
    }

    fn on_datagram(&self, bytes: &[u8], from: SocketAddr, sightings: &mut Sightings, now: Instant) -> Reaction {
        let msg = match decode_frame::<DiscoveryMessage>(bytes) {
            Ok((msg, _)) => msg,
            Err(e) => {
                trace!(%from, error = %e, "undecodable datagram");
                return Reaction::default();
            }
        };
        if !self.presence.accepts(&msg) {
            return Reaction::default();
        }
        match msg {
            DiscoveryMessage::Advert { advert, .. } => Reaction {
                events: sightings.observe(advert.instance, &advert.name, &from.ip().to_string(), advert.port, now),
                answer_query: false,
            },
            DiscoveryMessage::Query { .. } => {
                if let Ok(mut q) = self.queriers.lock() {
                    q.insert(from, now);
                }
                Reaction {
                    events: Vec::new(),
                    answer_query: true,
                }
            }
            DiscoveryMessage::Goodbye { instance, .. } => Reaction {
                events: sightings.forget(&instance),
                answer_query: false,
            },
            DiscoveryMessage::QueryResponse { .. } => Reaction::default(),
        }
    }

    fn prune_queriers(&self, now: Instant) {
        if let Ok(mut q) = self.queriers.lock() {
            q.retain(|_, seen| now.duration_since(*seen) < self.options.expiry);
        }
    }

    /// Withdraw our advert: multicast to the group and unicast to recent browsers.
    pub async fn send_goodbye(&self) -> std::io::Result<()> {
        let frame = encode_frame(&self.presence.goodbye()).map_err(io_invalid)?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(1)?;
        socket.send_to(&frame, group_addr(self.options.discovery_port)).await?;
        let queriers: Vec<SocketAddr> = match self.queriers.lock() {
            Ok(q) => q.keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        for addr in queriers {
            if let Err(e) = socket.send_to(&frame, addr).await {
                debug!(%addr, error = %e, "goodbye not delivered");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoverySource for AdvertSource {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Advertisements
    }

    async fn run(&self, sink: SourceSink) -> std::io::Result<()> {
        let socket = make_multicast_socket(self.options.discovery_port)?;
        let group = group_addr(self.options.discovery_port);
        let advert = encode_frame(&DiscoveryMessage::Advert {
            protocol_version: PROTOCOL_VERSION,
            advert: self.presence.advert(),
        })
        .map_err(io_invalid)?;
        let response = encode_frame(&DiscoveryMessage::QueryResponse {
            protocol_version: PROTOCOL_VERSION,
            advert: self.presence.advert(),
        })
        .map_err(io_invalid)?;

        let mut sightings = Sightings::default();
        let mut beacon = tokio::time::interval(self.options.interval);
        beacon.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = beacon.tick() => {
                    if let Err(e) = socket.send_to(&advert, group).await {
                        debug!(error = %e, "advert send failed");
                    }
                    let now = Instant::now();
                    for event in sightings.expire(now, self.options.expiry) {
                        sink.emit(event).await;
                    }
                    self.prune_queriers(now);
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = received?;
                    let reaction = self.on_datagram(&buf[..n], from, &mut sightings, Instant::now());
                    if reaction.answer_query {
                        if let Err(e) = socket.send_to(&response, from).await {
                            debug!(%from, error = %e, "query response send failed");
                        }
                    }
                    for event in reaction.events {
                        sink.emit(event).await;
                    }
                }
            }
        }
    }
}

/// Mechanism B: queries the group and resolves the host names in the unicast responses.
pub struct BrowseSource {
    presence: Presence,
    options: BeaconOptions,
}

/// A responder whose host still has to be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Lookup {
    instance: [u8; 16],
    name: String,
    host: String,
    port: u16,
}

#[derive(Debug, PartialEq, Eq)]
enum Response {
    /// Known responder: refresh its entry.
    Known(DiscoveryEvent),
    /// New or changed responder: resolve it off the receive loop.
    Resolve(Lookup),
    /// A lookup for this instance is already running.
    InFlight,
}

impl BrowseSource {
    pub fn new(presence: Presence, options: BeaconOptions) -> Self {
        Self { presence, options }
    }

    fn on_response(
        &self,
        advert: Advert,
        from: SocketAddr,
        sightings: &mut Sightings,
        resolving: &HashSet<[u8; 16]>,
        now: Instant,
    ) -> Response {
        let host = advert.host.unwrap_or_else(|| from.ip().to_string());
        if sightings.touch(&advert.instance, &advert.name, &host, advert.port, now) {
            return Response::Known(DiscoveryEvent::Resolved {
                name: advert.name,
                host,
                port: advert.port,
            });
        }
        if resolving.contains(&advert.instance) {
            return Response::InFlight;
        }
        Response::Resolve(Lookup {
            instance: advert.instance,
            name: advert.name,
            host,
            port: advert.port,
        })
    }
}

#[async_trait]
impl DiscoverySource for BrowseSource {
    fn mechanism(&self) -> Mechanism {
        Mechanism::Browse
    }

    async fn run(&self, sink: SourceSink) -> std::io::Result<()> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_multicast_ttl_v4(1)?;
        let group = group_addr(self.options.discovery_port);
        let query = encode_frame(&DiscoveryMessage::Query {
            protocol_version: PROTOCOL_VERSION,
            service: self.presence.service.clone(),
        })
        .map_err(io_invalid)?;

        let mut sightings = Sightings::default();
        let mut lookups: JoinSet<(Lookup, Result<(), String>)> = JoinSet::new();
        let mut resolving: HashSet<[u8; 16]> = HashSet::new();
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    socket.send_to(&query, group).await?;
                    for event in sightings.expire(Instant::now(), self.options.expiry) {
                        sink.emit(event).await;
                    }
                }
                Some(done) = lookups.join_next(), if !lookups.is_empty() => {
                    let (lookup, result) = match done {
                        Ok(done) => done,
                        Err(e) => {
                            warn!(error = %e, "lookup task failed");
                            resolving.clear();
                            continue;
                        }
                    };
                    resolving.remove(&lookup.instance);
                    let events = match result {
                        Ok(()) => sightings.observe(lookup.instance, &lookup.name, &lookup.host, lookup.port, Instant::now()),
                        Err(reason) => vec![DiscoveryEvent::ResolveFailed { name: lookup.name, reason }],
                    };
                    for event in events {
                        sink.emit(event).await;
                    }
                }
                received = socket.recv_from(&mut buf) => {
                    let (n, from) = received?;
                    let msg = match decode_frame::<DiscoveryMessage>(&buf[..n]) {
                        Ok((msg, _)) => msg,
                        Err(e) => {
                            trace!(%from, error = %e, "undecodable response");
                            continue;
                        }
                    };
                    if !self.presence.accepts(&msg) {
                        continue;
                    }
                    match msg {
                        DiscoveryMessage::QueryResponse { advert, .. } => {
                            match self.on_response(advert, from, &mut sightings, &resolving, Instant::now()) {
                                Response::Known(event) => sink.emit(event).await,
                                Response::Resolve(lookup) => {
                                    sink.emit(DiscoveryEvent::Found { name: lookup.name.clone() }).await;
                                    resolving.insert(lookup.instance);
                                    lookups.spawn(async move {
                                        let result = resolve(&lookup.host, lookup.port).await;
                                        (lookup, result)
                                    });
                                }
                                Response::InFlight => {}
                            }
                        }
                        DiscoveryMessage::Goodbye { instance, .. } => {
                            for event in sightings.forget(&instance) {
                                sink.emit(event).await;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Check that `host` resolves. IP literals pass without a lookup.
async fn resolve(host: &str, port: u16) -> Result<(), String> {
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    match tokio::time::timeout(RESOLVE_TIMEOUT, tokio::net::lookup_host((host, port))).await {
        Ok(Ok(mut addrs)) => match addrs.next() {
            Some(_) => Ok(()),
            None => Err(format!("{host} has no addresses")),
        },
        Ok(Err(e)) => {
            warn!(host, error = %e, "lookup failed");
            Err(e.to_string())
        }
        Err(_) => Err(format!("lookup of {host} timed out")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> BeaconOptions {
        BeaconOptions {
            discovery_port: 45878,
            interval: Duration::from_secs(4),
            expiry: Duration::from_secs(16),
        }
    }

    fn other(name: &str) -> Presence {
        Presence::new("_keypod._tcp", name, Some(format!("{}.local", name.to_lowercase())), 5757)
    }

    fn frame(msg: &DiscoveryMessage) -> Vec<u8> {
        encode_frame(msg).unwrap()
    }

    fn from() -> SocketAddr {
        "10.0.0.5:45878".parse().unwrap()
    }

    #[tokio::test]
    async fn advert_resolves_to_sender_ip() {
        let source = AdvertSource::new(other("Local"), options());
        let mut sightings = Sightings::default();
        let peer = other("Mac-Studio");
        let msg = DiscoveryMessage::Advert {
            protocol_version: PROTOCOL_VERSION,
            advert: peer.advert(),
        };
        let now = Instant::now();
        let reaction = source.on_datagram(&frame(&msg), from(), &mut sightings, now);
        assert_eq!(
            reaction.events,
            vec![DiscoveryEvent::Resolved {
                name: "Mac-Studio".into(),
                host: "10.0.0.5".into(),
                port: 5757,
            }]
        );
        // A repeat announces the same endpoint again.
        let again = source.on_datagram(&frame(&msg), from(), &mut sightings, now);
        assert_eq!(again.events, reaction.events);
    }

    #[tokio::test]
    async fn own_and_foreign_datagrams_are_ignored() {
        let me = other("Local");
        let source = AdvertSource::new(me.clone(), options());
        let mut sightings = Sightings::default();
        let now = Instant::now();

        let own = DiscoveryMessage::Advert {
            protocol_version: PROTOCOL_VERSION,
            advert: me.advert(),
        };
        assert_eq!(source.on_datagram(&frame(&own), from(), &mut sightings, now), Reaction::default());

        let mut foreign = other("Printer").advert();
        foreign.service = "_ipp._tcp".into();
        let msg = DiscoveryMessage::Advert {
            protocol_version: PROTOCOL_VERSION,
            advert: foreign,
        };
        assert_eq!(source.on_datagram(&frame(&msg), from(), &mut sightings, now), Reaction::default());

        let future = DiscoveryMessage::Advert {
            protocol_version: PROTOCOL_VERSION + 1,
            advert: other("Mac-Studio").advert(),
        };
        assert_eq!(source.on_datagram(&frame(&future), from(), &mut sightings, now), Reaction::default());
        assert_eq!(source.on_datagram(b"junk", from(), &mut sightings, now), Reaction::default());
    }

    #[tokio::test]
    async fn query_is_answered_and_goodbye_removes() {
        let source = AdvertSource::new(other("Local"), options());
        let mut sightings = Sightings::default();
        let now = Instant::now();
        let query = DiscoveryMessage::Query {
            protocol_version: PROTOCOL_VERSION,
            service: "_keypod._tcp".into(),
        };
        assert!(source.on_datagram(&frame(&query), from(), &mut sightings, now).answer_query);
        assert_eq!(source.queriers.lock().unwrap().len(), 1);

        let peer = other("Mac-Studio");
        let advert = DiscoveryMessage::Advert {
            protocol_version: PROTOCOL_VERSION,
            advert: peer.advert(),
        };
        source.on_datagram(&frame(&advert), from(), &mut sightings, now);
        let reaction = source.on_datagram(&frame(&peer.goodbye()), from(), &mut sightings, now);
        assert_eq!(
            reaction.events,
            vec![DiscoveryEvent::Removed {
                name: "Mac-Studio".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_advertisers_expire() {
        let mut sightings = Sightings::default();
        let start = Instant::now();
        sightings.observe([1; 16], "a", "10.0.0.1", 1, start);
        sightings.observe([2; 16], "b", "10.0.0.2", 1, start + Duration::from_secs(10));
        let removed = sightings.expire(start + Duration::from_secs(16), Duration::from_secs(16));
        assert_eq!(removed, vec![DiscoveryEvent::Removed { name: "a".into() }]);
        assert_eq!(sightings.seen.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn renamed_instance_removes_old_name() {
        let mut sightings = Sightings::default();
        let now = Instant::now();
        sightings.observe([1; 16], "old", "10.0.0.1", 1, now);
        let events = sightings.observe([1; 16], "new", "10.0.0.1", 1, now);
        assert_eq!(events[0], DiscoveryEvent::Removed { name: "old".into() });
        assert!(matches!(&events[1], DiscoveryEvent::Resolved { name, .. } if name == "new"));
    }

    #[tokio::test(start_paused = true)]
    async fn restart_without_goodbye_keeps_live_instance() {
        use keypod_core::discovery::PeerMap;

        let mut sightings = Sightings::default();
        let mut view = PeerMap::default();
        let t0 = Instant::now();
        let apply = |events: Vec<DiscoveryEvent>, view: &mut PeerMap| {
            for event in events {
                view.apply(Mechanism::Advertisements, event);
            }
        };
        // The old process stops without a goodbye; the new one starts under the same name.
        apply(sightings.observe([1; 16], "Mac-Studio", "10.0.0.5", 5757, t0), &mut view);
        apply(
            sightings.observe([2; 16], "Mac-Studio", "10.0.0.5", 5757, t0 + Duration::from_secs(8)),
            &mut view,
        );

        let expired = sightings.expire(t0 + Duration::from_secs(16), Duration::from_secs(16));
        assert_eq!(
            expired,
            vec![
                DiscoveryEvent::Removed {
                    name: "Mac-Studio".into()
                },
                DiscoveryEvent::Resolved {
                    name: "Mac-Studio".into(),
                    host: "10.0.0.5".into(),
                    port: 5757,
                },
            ]
        );
        apply(expired, &mut view);
        assert_eq!(view.snapshot().len(), 1);

        let refresh = sightings.observe([2; 16], "Mac-Studio", "10.0.0.5", 5757, t0 + Duration::from_secs(20));
        assert!(matches!(&refresh[..], [DiscoveryEvent::Resolved { name, .. }] if name == "Mac-Studio"));
        apply(refresh, &mut view);
        assert_eq!(view.snapshot().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn browse_refreshes_known_and_resolves_new() {
        let source = BrowseSource::new(other("Local"), options());
        let mut sightings = Sightings::default();
        let mut resolving = HashSet::new();
        let now = Instant::now();
        let advert = other("Mac-Studio").advert();

        let lookup = match source.on_response(advert.clone(), from(), &mut sightings, &resolving, now) {
            Response::Resolve(lookup) => lookup,
            other => panic!("expected a lookup, got {other:?}"),
        };
        assert_eq!(lookup.host, "mac-studio.local");

        // A second response while the lookup runs starts nothing new.
        resolving.insert(lookup.instance);
        assert_eq!(
            source.on_response(advert.clone(), from(), &mut sightings, &resolving, now),
            Response::InFlight
        );

        resolving.remove(&lookup.instance);
        sightings.observe(lookup.instance, &lookup.name, &lookup.host, lookup.port, now);
        assert_eq!(
            source.on_response(advert, from(), &mut sightings, &resolving, now + Duration::from_secs(4)),
            Response::Known(DiscoveryEvent::Resolved {
                name: "Mac-Studio".into(),
                host: "mac-studio.local".into(),
                port: 5757,
            })
        );
    }

    #[tokio::test]
    async fn ip_literals_resolve_without_lookup() {
        assert!(resolve("10.0.0.5", 5757).await.is_ok());
        assert!(resolve("fe80::1", 5757).await.is_ok());
    }
}
