//! Latch secure channels.
//!
//! Establishes a Noise NN or NK channel in a single request/reply over any
//! transport, then lets a server find the right cipher states for each
//! later, stateless message.
//!
//! - [`handshake`]: client and server halves of the one-round-trip handshake
//! - [`registry`]: live channels keyed by [`ChannelId`]
//! - [`codec`]: how a message names its channel on the wire
//! - [`transport`]: the traits a transport binding implements
//! - [`udp`]: a datagram binding over tokio sockets
//!
//! Nothing outside the UDP binding spawns tasks. Idle expiry runs when the
//! caller asks for it (see [`udp::UdpServer::run`]).

#![forbid(unsafe_code)]

pub mod channel_id;
pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod registry;
pub mod service;
pub mod transport;
pub mod udp;

pub use channel_id::{ChannelId, IdError, IdScheme};
pub use codec::{Codec, CodecError, Inbound, Outbound};
pub use config::ChannelConfig;
pub use error::{Error, Result, TransportError};
pub use handshake::{accept, client_handshake, server_handshake, ClientChannel, PendingHandshake};
pub use registry::{Channel, RegistryLimits, SessionRegistry};
pub use service::{ChannelService, Handler};
pub use transport::{ClientTransport, ReplyBuffer, ServerTransport};

pub use latch_crypto::{HandshakePattern, NonceMode, PublicKey, StaticKeypair};
