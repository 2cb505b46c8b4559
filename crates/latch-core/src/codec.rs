//! Message codecs: how a post-handshake message names its channel.
//!
//! The handshake engine and registry never see a codec. A transport binding
//! runs [`Codec::encode`] on the way out and [`Codec::decode`] on the way in
//! and hands the raw ciphertext to the channel.

use latch_common::helpers::{b64url_decode, b64url_encode, base64_bytes};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel_id::{ChannelId, IdError, IdScheme};

/// Query parameter carrying the ciphertext under [`Codec::Query`].
pub const QUERY_PARAM: &str = "c";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message has no transport tag")]
    MissingTag,

    #[error("message has no `c` query parameter")]
    MissingQuery,

    #[error(transparent)]
    Identifier(#[from] IdError),
}

/// Multiplexing policy for established channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// The request token of the handshake is reused on every message.
    TokenReuse,
    /// Ciphertext rides in the query string; one channel per connection.
    Query,
    /// JSON envelope `{"id", "payload"}`; many channels per connection.
    #[default]
    Envelope,
    /// The transport's per-peer routing identity names the channel.
    Routing,
}

impl Codec {
    /// Codecs whose id comes from the transport rather than the body.
    pub fn requires_transport_id(self) -> bool {
        !matches!(self, Codec::Envelope)
    }

    pub fn encode(self, id: &ChannelId, ciphertext: &[u8]) -> Result<Outbound, CodecError> {
        let outbound = match self {
            Codec::TokenReuse | Codec::Routing => Outbound {
                tag: Some(id.to_bytes()),
                query: None,
                body: ciphertext.to_vec(),
            },
            Codec::Query => Outbound {
                tag: Some(id.to_bytes()),
                query: Some(format!("{QUERY_PARAM}={}", b64url_encode(ciphertext))),
                body: Vec::new(),
            },
            Codec::Envelope => {
                let envelope = Envelope {
                    id: id.to_bytes(),
                    payload: ciphertext.to_vec(),
                };
                Outbound {
                    tag: None,
                    query: None,
                    body: serde_json::to_vec(&envelope)
                        .map_err(|e| CodecError::Malformed(e.to_string()))?,
                }
            }
        };
        Ok(outbound)
    }

    /// Recover the channel id and ciphertext from an inbound message.
    pub fn decode(
        self,
        scheme: IdScheme,
        inbound: &Inbound<'_>,
    ) -> Result<(ChannelId, Vec<u8>), CodecError> {
        match self {
            Codec::TokenReuse | Codec::Routing => {
                let id = ChannelId::decode(scheme, inbound.tag.ok_or(CodecError::MissingTag)?)?;
                Ok((id, inbound.body.to_vec()))
            }
            Codec::Query => {
                let id = ChannelId::decode(scheme, inbound.tag.ok_or(CodecError::MissingTag)?)?;
                let query = inbound.query.ok_or(CodecError::MissingQuery)?;
                Ok((id, query_ciphertext(query)?))
            }
            Codec::Envelope => {
                let envelope: Envelope = serde_json::from_slice(inbound.body)
                    .map_err(|e| CodecError::Malformed(e.to_string()))?;
                Ok((ChannelId::decode(scheme, &envelope.id)?, envelope.payload))
            }
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_reuse" | "token-reuse" => Ok(Codec::TokenReuse),
            "query" => Ok(Codec::Query),
            "envelope" => Ok(Codec::Envelope),
            "routing" => Ok(Codec::Routing),
            other => Err(CodecError::Malformed(format!("unknown codec: {other}"))),
        }
    }
}

/// A message as received from a transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inbound<'a> {
    /// Transport-native tag (request token, routing id, peer address).
    pub tag: Option<&'a [u8]>,
    pub query: Option<&'a str>,
    pub body: &'a [u8],
}

/// A message ready to hand to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub tag: Option<Vec<u8>>,
    pub query: Option<String>,
    pub body: Vec<u8>,
}

impl Outbound {
    pub fn inbound(&self) -> Inbound<'_> {
        Inbound {
            tag: self.tag.as_deref(),
            query: self.query.as_deref(),
            body: &self.body,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(with = "base64_bytes")]
    id: Vec<u8>,
    #[serde(with = "base64_bytes")]
    payload: Vec<u8>,
}

fn query_ciphertext(query: &str) -> Result<Vec<u8>, CodecError> {
    let value = query
        .trim_start_matches('?')
        .split('&')
        .find_map(|pair| pair.strip_prefix(QUERY_PARAM)?.strip_prefix('='))
        .ok_or(CodecError::MissingQuery)?;
    b64url_decode(value).map_err(|e| CodecError::Malformed(e.to_string()))
}
