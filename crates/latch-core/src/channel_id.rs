//! Channel identifiers.
//!
//! Every message after the handshake has to name its channel so the server
//! can find the matching cipher states. The identifier comes from one of
//! four schemes:
//!
//! | Scheme      | Source                                   | Wire bytes        |
//! |-------------|------------------------------------------|-------------------|
//! | `Random16`  | server-assigned, sent in handshake reply | 2, big-endian     |
//! | `Random32`  | server-assigned, sent in handshake reply | 4, big-endian     |
//! | `Binding`   | handshake hash, derived by both sides    | 32 (never sent in the handshake) |
//! | `Transport` | request token or peer routing identity   | 1-255, opaque     |

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a transport-native identifier.
pub const MAX_TRANSPORT_ID_LEN: usize = 255;

const BINDING_LEN: usize = 32;

/// How channel identifiers are derived and exchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdScheme {
    #[default]
    Random16,
    Random32,
    Binding,
    Transport,
}

impl IdScheme {
    /// Bytes the server prepends to the handshake reply payload.
    pub fn assigned_len(self) -> Option<usize> {
        match self {
            IdScheme::Random16 => Some(2),
            IdScheme::Random32 => Some(4),
            IdScheme::Binding | IdScheme::Transport => None,
        }
    }

    /// Number of distinct ids this scheme can assign, if bounded.
    pub fn capacity(self) -> Option<u64> {
        match self {
            IdScheme::Random16 => Some(u16::MAX as u64),
            IdScheme::Random32 => Some(u32::MAX as u64),
            IdScheme::Binding | IdScheme::Transport => None,
        }
    }
}

impl std::str::FromStr for IdScheme {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random16" => Ok(IdScheme::Random16),
            "random32" => Ok(IdScheme::Random32),
            "binding" => Ok(IdScheme::Binding),
            "transport" => Ok(IdScheme::Transport),
            other => Err(IdError::UnknownScheme(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("unknown identifier scheme: {0}")]
    UnknownScheme(String),

    #[error("expected {expected} identifier bytes, got {got}")]
    Length { expected: usize, got: usize },

    #[error("identifier 0 is reserved")]
    Reserved,

    #[error("transport identifier must be 1-255 bytes, got {0}")]
    TransportLength(usize),

    #[error("{0:?} identifiers are not assigned by the server")]
    NotAssignable(IdScheme),
}

/// Identifier of one established channel.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Short(u16),
    Long(u32),
    Binding([u8; BINDING_LEN]),
    Transport(Vec<u8>),
}

impl ChannelId {
    pub fn scheme(&self) -> IdScheme {
        match self {
            ChannelId::Short(_) => IdScheme::Random16,
            ChannelId::Long(_) => IdScheme::Random32,
            ChannelId::Binding(_) => IdScheme::Binding,
            ChannelId::Transport(_) => IdScheme::Transport,
        }
    }

    /// Wire encoding: big-endian integers, raw bytes otherwise.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ChannelId::Short(v) => v.to_be_bytes().to_vec(),
            ChannelId::Long(v) => v.to_be_bytes().to_vec(),
            ChannelId::Binding(h) => h.to_vec(),
            ChannelId::Transport(t) => t.clone(),
        }
    }

    /// Parse an identifier carried on the wire under `scheme`.
    pub fn decode(scheme: IdScheme, bytes: &[u8]) -> Result<Self, IdError> {
        let exact = |expected: usize| {
            if bytes.len() == expected {
                Ok(())
            } else {
                Err(IdError::Length {
                    expected,
                    got: bytes.len(),
                })
            }
        };

        let id = match scheme {
            IdScheme::Random16 => {
                exact(2)?;
                ChannelId::Short(u16::from_be_bytes([bytes[0], bytes[1]]))
            }
            IdScheme::Random32 => {
                exact(4)?;
                ChannelId::Long(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            IdScheme::Binding => {
                exact(BINDING_LEN)?;
                let mut h = [0u8; BINDING_LEN];
                h.copy_from_slice(bytes);
                ChannelId::Binding(h)
            }
            IdScheme::Transport => {
                if bytes.is_empty() || bytes.len() > MAX_TRANSPORT_ID_LEN {
                    return Err(IdError::TransportLength(bytes.len()));
                }
                ChannelId::Transport(bytes.to_vec())
            }
        };

        if id.is_reserved() {
            return Err(IdError::Reserved);
        }
        Ok(id)
    }

    /// Split a handshake reply payload into the assigned id and the rest.
    pub fn split_assigned(scheme: IdScheme, payload: &[u8]) -> Result<(Self, &[u8]), IdError> {
        let len = scheme.assigned_len().ok_or(IdError::NotAssignable(scheme))?;
        if payload.len() < len {
            return Err(IdError::Length {
                expected: len,
                got: payload.len(),
            });
        }
        let (id, rest) = payload.split_at(len);
        Ok((Self::decode(scheme, id)?, rest))
    }

    /// Draw a random non-reserved id for an assigning scheme.
    pub fn random(scheme: IdScheme, rng: &mut impl Rng) -> Result<Self, IdError> {
        match scheme {
            IdScheme::Random16 => Ok(ChannelId::Short(rng.gen_range(1..=u16::MAX))),
            IdScheme::Random32 => Ok(ChannelId::Long(rng.gen_range(1..=u32::MAX))),
            other => Err(IdError::NotAssignable(other)),
        }
    }

    /// Zero marks "no channel yet" for integer ids.
    pub fn is_reserved(&self) -> bool {
        matches!(self, ChannelId::Short(0) | ChannelId::Long(0))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Short(v) => write!(f, "{v}"),
            ChannelId::Long(v) => write!(f, "{v}"),
            ChannelId::Binding(h) => write!(f, "cb:{}", hex::encode(&h[..8])),
            ChannelId::Transport(t) => write!(f, "tx:{}", hex::encode(t)),
        }
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({self})")
    }
}
