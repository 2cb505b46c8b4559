use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::helpers::{base64_bytes, base64_opt};

/// Transport-neutral result of handling one inbound message.
///
/// Bindings map these onto their own status codes (CoAP 2.04/4.00/4.01/5.00,
/// HTTP, or a field in a datagram frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Malformed envelope, identifier, or frame.
    BadRequest,
    /// Unknown channel, authentication failure, or rejected handshake.
    Unauthorized,
    /// Unexpected failure on the server side.
    InternalError,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::BadRequest => "bad request",
            Outcome::Unauthorized => "unauthorized",
            Outcome::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

/// Datagram frame used by the UDP binding.
///
/// `token` plays the role of a CoAP request token: the client picks it for the
/// handshake and reuses it on later messages so the reply can be matched and,
/// under token-reuse multiplexing, so the server can find the channel.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Ask the server for its static public key (NK pinning bootstrap).
    KeyRequest,

    /// Server static public key.
    Key {
        #[serde(with = "base64_bytes")]
        public_key: Vec<u8>,
    },

    /// First handshake message (initiator -> responder).
    Handshake {
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        token: Option<Vec<u8>>,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },

    /// Encrypted application message on an established channel.
    Message {
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        token: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },

    /// Authenticated teardown of an established channel.
    Close {
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        token: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },

    /// Reply to any request frame.
    Reply {
        #[serde(default, with = "base64_opt", skip_serializing_if = "Option::is_none")]
        token: Option<Vec<u8>>,
        outcome: Outcome,
        #[serde(with = "base64_bytes")]
        body: Vec<u8>,
    },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Request token carried by the frame, if any.
    pub fn token(&self) -> Option<&[u8]> {
        match self {
            Frame::Handshake { token, .. }
            | Frame::Message { token, .. }
            | Frame::Close { token, .. }
            | Frame::Reply { token, .. } => token.as_deref(),
            Frame::KeyRequest | Frame::Key { .. } => None,
        }
    }
}
