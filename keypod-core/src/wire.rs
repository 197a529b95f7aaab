//! Framing: length-prefix (4 bytes LE) + bincode payload, plus the fixed-size transport hello.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::identity::{IdentityKey, LinkNonce};
use crate::protocol::PROTOCOL_VERSION;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 1024 * 1024; // 1 MiB

/// Transport hello: version byte, identity public key, per-link nonce.
pub const HELLO_LEN: usize = 1 + 32 + 16;

/// Encode a value into one frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let payload = bincode::serialize(msg)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one frame from the front of `bytes`. Returns the value and the number of bytes consumed.
/// [`FrameError::NeedMore`] means the buffer holds a partial frame; retry with more data.
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameError::NeedMore);
    }
    let msg = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Payload length announced by the prefix at the front of `bytes`.
pub fn frame_len(bytes: &[u8]) -> Result<usize, FrameError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

pub fn hello_bytes(key: &IdentityKey, nonce: &LinkNonce) -> [u8; HELLO_LEN] {
    let mut out = [0u8; HELLO_LEN];
    out[0] = PROTOCOL_VERSION;
    out[1..33].copy_from_slice(key.as_bytes());
    out[33..].copy_from_slice(nonce.as_bytes());
    out
}

pub fn parse_hello(buf: &[u8; HELLO_LEN]) -> Result<(IdentityKey, LinkNonce), FrameError> {
    if buf[0] != PROTOCOL_VERSION {
        return Err(FrameError::Version(buf[0]));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&buf[1..33]);
    let mut nonce = [0u8; 16];
    nonce.copy_from_slice(&buf[33..]);
    Ok((IdentityKey::from_bytes(key), LinkNonce::from_bytes(nonce)))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::Curve;
    use crate::identity::Identity;
    use crate::protocol::{Advert, DiscoveryMessage, Envelope, HandshakeBody};

    fn sample_advert() -> DiscoveryMessage {
        DiscoveryMessage::Advert {
            protocol_version: PROTOCOL_VERSION,
            advert: Advert {
                service: "_keypod._tcp".into(),
                instance: [7u8; 16],
                name: "Mac-Studio".into(),
                host: Some("mac-studio.local".into()),
                port: 5757,
            },
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_advert()).unwrap();
        assert!(matches!(
            decode_frame::<DiscoveryMessage>(&frame[..2]),
            Err(FrameError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<DiscoveryMessage>(&frame[..frame.len() - 1]),
            Err(FrameError::NeedMore)
        ));
    }

    #[test]
    fn back_to_back_frames() {
        let a = sample_advert();
        let b = Envelope::new(
            [1u8; 16],
            HandshakeBody::Request {
                curve: Curve::X25519,
                capacity: 16,
            },
        );
        let mut buf = encode_frame(&a).unwrap();
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(&b).unwrap());

        let (m1, n1) = decode_frame::<DiscoveryMessage>(&buf).unwrap();
        assert_eq!(n1, first_len);
        assert_eq!(m1, a);
        let (m2, n2) = decode_frame::<Envelope>(&buf[n1..]).unwrap();
        assert_eq!(n1 + n2, buf.len());
        assert_eq!(m2, b);
    }

    #[test]
    fn oversized_prefix_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame::<Envelope>(&buf),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn garbage_payload_is_codec_error() {
        let mut buf = 3u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_frame::<Envelope>(&buf),
            Err(FrameError::Codec(_))
        ));
    }

    #[test]
    fn hello_carries_identity_nonce_and_version() {
        let identity = Identity::generate();
        let nonce = LinkNonce::random();
        let hello = hello_bytes(identity.public_key(), &nonce);
        let (key, parsed) = parse_hello(&hello).unwrap();
        assert_eq!(key, *identity.public_key());
        assert_eq!(parsed, nonce);

        let mut stale = hello;
        stale[0] = PROTOCOL_VERSION + 1;
        assert!(matches!(parse_hello(&stale), Err(FrameError::Version(_))));
    }
}
