//! Curves a key pool can be typed with, and per-curve key generation and validation.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Raw key length for every supported curve.
pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Curve {
    X25519,
    Ed25519,
}

impl Curve {
    pub fn name(&self) -> &'static str {
        match self {
            Curve::X25519 => "x25519",
            Curve::Ed25519 => "ed25519",
        }
    }

    /// One-byte tag used in handshake transcripts.
    pub fn tag(&self) -> u8 {
        match self {
            Curve::X25519 => 1,
            Curve::Ed25519 => 2,
        }
    }

    /// Generate `count` fresh keypairs on this curve.
    pub fn generate(&self, count: usize) -> KeySet {
        let mut set = KeySet {
            curve: *self,
            secrets: Vec::with_capacity(count),
            publics: Vec::with_capacity(count),
        };
        for _ in 0..count {
            let (secret, public) = match self {
                Curve::X25519 => {
                    let secret = StaticSecret::random_from_rng(OsRng);
                    let public = X25519PublicKey::from(&secret).to_bytes();
                    (secret.to_bytes(), public)
                }
                Curve::Ed25519 => {
                    let signing = SigningKey::generate(&mut OsRng);
                    (signing.to_bytes(), signing.verifying_key().to_bytes())
                }
            };
            set.secrets.push(secret.to_vec());
            set.publics.push(public.to_vec());
        }
        set
    }

    /// Check that `key` is a well-formed public key on this curve.
    pub fn validate_public(&self, key: &[u8]) -> Result<(), KeyFormatError> {
        let bytes: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| KeyFormatError::Length(key.len()))?;
        match self {
            Curve::X25519 => {
                if bytes == [0u8; KEY_LEN] {
                    return Err(KeyFormatError::NotOnCurve(*self));
                }
                Ok(())
            }
            Curve::Ed25519 => VerifyingKey::from_bytes(&bytes)
                .map(|_| ())
                .map_err(|_| KeyFormatError::NotOnCurve(*self)),
        }
    }

    /// Check that `key` is a usable secret for this curve. Both curves take any 32-byte seed.
    pub fn validate_secret(&self, key: &[u8]) -> Result<(), KeyFormatError> {
        if key.len() != KEY_LEN {
            return Err(KeyFormatError::Length(key.len()));
        }
        Ok(())
    }
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Curve {
    type Err = KeyFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "x25519" => Ok(Curve::X25519),
            "ed25519" => Ok(Curve::Ed25519),
            other => Err(KeyFormatError::UnknownCurve(other.to_string())),
        }
    }
}

/// Which side of a relationship a pool holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Keys the peer published to us.
    Public,
    /// Keys this device generated for the relationship.
    Private,
}

impl PoolKind {
    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::Public => "public",
            PoolKind::Private => "private",
        }
    }
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Freshly generated keys, index-aligned: `publics[i]` belongs to `secrets[i]`.
pub struct KeySet {
    pub curve: Curve,
    pub secrets: Vec<Vec<u8>>,
    pub publics: Vec<Vec<u8>>,
}

impl KeySet {
    fn len(&self) -> usize {
        self.publics.len()
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("curve", &self.curve)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyFormatError {
    #[error("expected 32-byte key, got {0} bytes")]
    Length(usize),
    #[error("key is not a valid {0} point")]
    NotOnCurve(Curve),
    #[error("unknown curve {0:?}")]
    UnknownCurve(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_validate_on_their_curve() {
        for curve in [Curve::X25519, Curve::Ed25519] {
            let set = curve.generate(4);
            assert_eq!(set.len(), 4);
            for (secret, public) in set.secrets.iter().zip(&set.publics) {
                curve.validate_secret(secret).unwrap();
                curve.validate_public(public).unwrap();
            }
        }
    }

    #[test]
    fn short_key_rejected() {
        assert_eq!(
            Curve::X25519.validate_public(&[1u8; 31]),
            Err(KeyFormatError::Length(31))
        );
        assert_eq!(
            Curve::Ed25519.validate_secret(&[1u8; 33]),
            Err(KeyFormatError::Length(33))
        );
    }

    #[test]
    fn zero_x25519_point_rejected() {
        assert_eq!(
            Curve::X25519.validate_public(&[0u8; 32]),
            Err(KeyFormatError::NotOnCurve(Curve::X25519))
        );
    }

    #[test]
    fn curve_names_parse() {
        assert_eq!("X25519".parse::<Curve>().unwrap(), Curve::X25519);
        assert_eq!("ed25519".parse::<Curve>().unwrap(), Curve::Ed25519);
        assert!("p256".parse::<Curve>().is_err());
    }
}
