//! One-round-trip Noise handshakes.
//!
//! Two patterns are supported, both completing in a single request/reply:
//!
//! ```text
//! NN (no static keys)                  NK (responder static pinned)
//!   -> e                                 <- s
//!   <- e, ee                             ...
//!                                        -> e, es
//!                                        <- e, ee
//! ```
//!
//! The initiator's first message may carry an application payload; under NK
//! that payload is already encrypted to the responder's static key. The
//! responder's reply payload is encrypted under the completed handshake and
//! is where a server-assigned channel identifier travels.
//!
//! After the second message both sides split the symmetric state into two
//! directional keys, which seed the [`CipherStatePair`] used for all later
//! traffic on the channel.

use serde::{Deserialize, Serialize};
use snow::params::NoiseParams;
use snow::{Builder, HandshakeState};
use thiserror::Error;
use zeroize::Zeroize;

use crate::cipher::{CipherStatePair, NonceMode};

/// NN pattern (X25519, ChaCha20-Poly1305, BLAKE2s)
pub const NN_PATTERN: &str = "Noise_NN_25519_ChaChaPoly_BLAKE2s";

/// NK pattern (X25519, ChaCha20-Poly1305, BLAKE2s)
pub const NK_PATTERN: &str = "Noise_NK_25519_ChaChaPoly_BLAKE2s";

/// Maximum message size for Noise handshake
const MAX_HANDSHAKE_MSG_SIZE: usize = 65535;

/// Length of the BLAKE2s handshake hash.
pub const HANDSHAKE_HASH_LEN: usize = 32;

/// Handshake pattern negotiated out of band between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakePattern {
    /// Mutual anonymity; confidentiality without peer authentication.
    #[default]
    Nn,
    /// Client pins the server's static key; server authentication.
    Nk,
}

impl HandshakePattern {
    pub fn noise_params(self) -> &'static str {
        match self {
            HandshakePattern::Nn => NN_PATTERN,
            HandshakePattern::Nk => NK_PATTERN,
        }
    }

    /// Whether the responder needs a static keypair (and the initiator its public half).
    pub fn uses_responder_static(self) -> bool {
        matches!(self, HandshakePattern::Nk)
    }
}

impl std::str::FromStr for HandshakePattern {
    type Err = NoiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nn" => Ok(HandshakePattern::Nn),
            "nk" => Ok(HandshakePattern::Nk),
            other => Err(NoiseError::UnsupportedPattern(other.to_string())),
        }
    }
}

/// Noise handshake errors
#[derive(Debug, Error)]
pub enum NoiseError {
    #[error("unsupported handshake pattern: {0}")]
    UnsupportedPattern(String),

    #[error("pattern {0:?} requires the responder's static public key")]
    MissingRemoteStatic(HandshakePattern),

    #[error("pattern {0:?} requires a local static keypair")]
    MissingLocalStatic(HandshakePattern),

    #[error("handshake did not complete after the final message")]
    HandshakeNotComplete,

    #[error("invalid handshake message")]
    InvalidMessage,

    #[error("snow error: {0}")]
    Snow(#[from] snow::Error),
}

/// Keys and transcript data produced by a completed handshake.
pub struct HandshakeResult {
    /// Cross-wired directional cipher states.
    pub pair: CipherStatePair,
    /// Final handshake hash, usable as a channel binding.
    pub handshake_hash: [u8; HANDSHAKE_HASH_LEN],
    /// Responder's static key as seen by the initiator (NK only).
    pub remote_static: Option<[u8; 32]>,
}

impl std::fmt::Debug for HandshakeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeResult")
            .field("handshake_hash", &hex::encode(self.handshake_hash))
            .finish_non_exhaustive()
    }
}

fn params(pattern: HandshakePattern) -> Result<NoiseParams, NoiseError> {
    Ok(pattern.noise_params().parse()?)
}

/// Split a finished handshake into directional cipher states.
///
/// Noise's split yields (initiator -> responder, responder -> initiator).
fn finish(
    mut state: HandshakeState,
    nonce_mode: NonceMode,
) -> Result<HandshakeResult, NoiseError> {
    if !state.is_handshake_finished() {
        return Err(NoiseError::HandshakeNotComplete);
    }

    // Capture handshake hash before split
    let handshake_hash: [u8; HANDSHAKE_HASH_LEN] = state
        .get_handshake_hash()
        .try_into()
        .map_err(|_| NoiseError::InvalidMessage)?;

    let remote_static: Option<[u8; 32]> =
        state.get_remote_static().and_then(|s| s.try_into().ok());

    let (mut i2r, mut r2i) = state.dangerously_get_raw_split();
    let pair = if state.is_initiator() {
        CipherStatePair::new(&i2r, &r2i, nonce_mode)
    } else {
        CipherStatePair::new(&r2i, &i2r, nonce_mode)
    };
    i2r.zeroize();
    r2i.zeroize();

    Ok(HandshakeResult {
        pair,
        handshake_hash,
        remote_static,
    })
}

/// Noise handshake initiator (client side).
pub struct NoiseInitiator {
    state: Box<HandshakeState>,
    nonce_mode: NonceMode,
}

impl NoiseInitiator {
    /// Create a new initiator.
    ///
    /// # Arguments
    /// * `remote_static` - responder's pinned X25519 public key (required for NK)
    pub fn new(
        pattern: HandshakePattern,
        remote_static: Option<&[u8; 32]>,
        nonce_mode: NonceMode,
    ) -> Result<Self, NoiseError> {
        let mut builder = Builder::new(params(pattern)?);

        if pattern.uses_responder_static() {
            let key = remote_static.ok_or(NoiseError::MissingRemoteStatic(pattern))?;
            builder = builder.remote_public_key(key);
        }

        let state = builder.build_initiator()?;

        Ok(Self {
            state: Box::new(state),
            nonce_mode,
        })
    }

    /// Generate the first handshake message, optionally carrying `payload`.
    pub fn write_request(&mut self, payload: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.write_message(payload, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Consume the responder's reply, completing the handshake.
    ///
    /// Returns the reply payload together with the established keys.
    pub fn read_response(
        mut self,
        message: &[u8],
    ) -> Result<(Vec<u8>, HandshakeResult), NoiseError> {
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.read_message(message, &mut buf)?;
        buf.truncate(len);

        let result = finish(*self.state, self.nonce_mode)?;
        Ok((buf, result))
    }
}

/// Noise handshake responder (server side).
pub struct NoiseResponder {
    state: Box<HandshakeState>,
    nonce_mode: NonceMode,
}

impl NoiseResponder {
    /// Create a new responder.
    ///
    /// # Arguments
    /// * `local_private_key` - 32-byte X25519 private key (required for NK)
    pub fn new(
        pattern: HandshakePattern,
        local_private_key: Option<&[u8; 32]>,
        nonce_mode: NonceMode,
    ) -> Result<Self, NoiseError> {
        let mut builder = Builder::new(params(pattern)?);

        if pattern.uses_responder_static() {
            let key = local_private_key.ok_or(NoiseError::MissingLocalStatic(pattern))?;
            builder = builder.local_private_key(key);
        }

        let state = builder.build_responder()?;

        Ok(Self {
            state: Box::new(state),
            nonce_mode,
        })
    }

    /// Process the initiator's first message.
    ///
    /// Returns the payload the initiator piggybacked on the handshake.
    pub fn read_request(&mut self, message: &[u8]) -> Result<Vec<u8>, NoiseError> {
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.read_message(message, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Write the final handshake message carrying `payload`.
    ///
    /// Returns the message to send back together with the established keys.
    pub fn write_response(
        mut self,
        payload: &[u8],
    ) -> Result<(Vec<u8>, HandshakeResult), NoiseError> {
        let mut buf = vec![0u8; MAX_HANDSHAKE_MSG_SIZE];
        let len = self.state.write_message(payload, &mut buf)?;
        buf.truncate(len);

        let result = finish(*self.state, self.nonce_mode)?;
        Ok((buf, result))
    }
}
