//! Error types for secure channels.

use std::time::Duration;

use latch_common::Outcome;
use latch_crypto::{CipherError, NoiseError};
use thiserror::Error;

use crate::channel_id::{ChannelId, IdError};
use crate::codec::CodecError;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of the underlying transport (send, receive, exchange).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer answered with a non-success status.
    #[error("peer replied with {0}")]
    Rejected(Outcome),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Secure channel errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Malformed or cryptographically invalid handshake; terminal for this attempt.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("authentication failure")]
    AuthenticationFailure,

    #[error("replay detected: nonce {0}")]
    Replay(u64),

    #[error("nonce space exhausted, a new handshake is required")]
    NonceExhausted,

    #[error("channel {0} is already registered")]
    ChannelCollision(ChannelId),

    #[error("session registry is full ({0} channels)")]
    RegistryFull(usize),

    #[error("no free channel identifier after {0} attempts")]
    AllocationExhausted(usize),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("invalid channel identifier: {0}")]
    Identifier(#[from] IdError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn handshake(msg: impl std::fmt::Display) -> Self {
        Self::Handshake(msg.to_string())
    }

    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Transport-neutral status to report back to the peer.
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::Codec(_) | Error::Identifier(_) => Outcome::BadRequest,
            Error::UnknownChannel(_)
            | Error::AuthenticationFailure
            | Error::Replay(_)
            | Error::Handshake(_) => Outcome::Unauthorized,
            Error::Transport(_)
            | Error::NonceExhausted
            | Error::ChannelCollision(_)
            | Error::RegistryFull(_)
            | Error::AllocationExhausted(_)
            | Error::Config(_)
            | Error::Internal(_) => Outcome::InternalError,
        }
    }
}

impl From<CipherError> for Error {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::AuthenticationFailure => Error::AuthenticationFailure,
            CipherError::Replay(n) => Error::Replay(n),
            CipherError::NonceExhausted => Error::NonceExhausted,
            CipherError::EncryptionFailed => Error::internal("encryption failed"),
        }
    }
}

impl From<NoiseError> for Error {
    fn from(err: NoiseError) -> Self {
        match err {
            NoiseError::MissingLocalStatic(_)
            | NoiseError::MissingRemoteStatic(_)
            | NoiseError::UnsupportedPattern(_) => Error::config(err),
            other => Error::handshake(other),
        }
    }
}
