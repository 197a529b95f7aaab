//! KeyPod wire protocol: discovery datagrams and the versioned pairing envelope.

use serde::{Deserialize, Serialize};

use crate::curve::Curve;

/// Current protocol version. Carried in every discovery datagram, transport hello and envelope.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service type advertised on the local segment.
pub const DEFAULT_SERVICE: &str = "_keypod._tcp";

/// Multicast-DNS domain suffix that marks a resolvable local host name.
pub const LOCAL_DOMAIN_SUFFIX: &str = ".local";

/// Advertisement payload shared by periodic adverts and query responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advert {
    pub service: String,
    /// Random per-process instance id, used to drop our own datagrams.
    pub instance: [u8; 16],
    /// Advertised instance name, e.g. "Mac-Studio".
    pub name: String,
    /// Host name to resolve, when the advertiser has one (e.g. "mac-studio.local").
    pub host: Option<String>,
    /// Transport port.
    pub port: u16,
}

/// Datagrams exchanged by the two discovery mechanisms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMessage {
    /// Periodic multicast presence announcement.
    Advert { protocol_version: u8, advert: Advert },
    /// Multicast browse: "who offers `service`?"
    Query { protocol_version: u8, service: String },
    /// Unicast answer to a query.
    QueryResponse { protocol_version: u8, advert: Advert },
    /// Advertisement withdrawn.
    Goodbye {
        protocol_version: u8,
        service: String,
        instance: [u8; 16],
        name: String,
    },
}

impl DiscoveryMessage {
    pub fn protocol_version(&self) -> u8 {
        match self {
            DiscoveryMessage::Advert {
                protocol_version, ..
            }
            | DiscoveryMessage::Query {
                protocol_version, ..
            }
            | DiscoveryMessage::QueryResponse {
                protocol_version, ..
            }
            | DiscoveryMessage::Goodbye {
                protocol_version, ..
            } => *protocol_version,
        }
    }
}

/// Pairing message envelope. `exchange_id` is chosen by the initiator and echoed by the
/// responder; it ties every message to one negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub exchange_id: [u8; 16],
    pub body: HandshakeBody,
}

impl Envelope {
    pub fn new(exchange_id: [u8; 16], body: HandshakeBody) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            exchange_id,
            body,
        }
    }
}

/// Pairing messages, in protocol order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeBody {
    /// Initiator proposes pool parameters.
    Request { curve: Curve, capacity: u32 },
    /// Responder accepts the parameters and publishes its public keys.
    Offer {
        curve: Curve,
        capacity: u32,
        keys: Vec<Vec<u8>>,
    },
    /// Initiator publishes its public keys.
    Ack { keys: Vec<Vec<u8>> },
    /// Transcript digest. Sent by the responder first, echoed by the initiator once its pools are
    /// written.
    Commit { digest: [u8; 32] },
    /// Negotiation aborted.
    Reject { reason: String },
}

impl HandshakeBody {
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeBody::Request { .. } => "request",
            HandshakeBody::Offer { .. } => "offer",
            HandshakeBody::Ack { .. } => "ack",
            HandshakeBody::Commit { .. } => "commit",
            HandshakeBody::Reject { .. } => "reject",
        }
    }
}
