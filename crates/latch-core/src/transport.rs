//! Transport adapter traits.
//!
//! A transport only moves bytes. The handshake engine drives it through one
//! of these traits and never learns whether the bytes travel as CoAP
//! requests, message-queue frames or datagrams.

use async_trait::async_trait;

use crate::error::TransportError;

/// Client side of a request/response transport.
#[async_trait]
pub trait ClientTransport: Send {
    /// Send one request and wait for its reply.
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Transport-native identifier for the channel being set up, if the
    /// transport has one (request token, routing identity).
    fn channel_tag(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Server side of one inbound request.
#[async_trait]
pub trait ServerTransport: Send {
    /// Deliver the reply for the request being handled.
    async fn send(&mut self, reply: &[u8]) -> Result<(), TransportError>;

    /// Transport-native identifier of the requesting peer, if any.
    fn peer_tag(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Server transport that just keeps the reply, for callers that write it
/// out themselves (e.g. as the body of an HTTP or CoAP response).
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    tag: Option<Vec<u8>>,
    reply: Option<Vec<u8>>,
}

impl ReplyBuffer {
    pub fn new(tag: Option<Vec<u8>>) -> Self {
        Self { tag, reply: None }
    }

    pub fn take(&mut self) -> Option<Vec<u8>> {
        self.reply.take()
    }
}

#[async_trait]
impl ServerTransport for ReplyBuffer {
    async fn send(&mut self, reply: &[u8]) -> Result<(), TransportError> {
        self.reply = Some(reply.to_vec());
        Ok(())
    }

    fn peer_tag(&self) -> Option<Vec<u8>> {
        self.tag.clone()
    }
}
