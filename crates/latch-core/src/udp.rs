//! Datagram binding: secure channels over raw UDP sockets.
//!
//! Every datagram is one JSON [`Frame`]. Requests carry a client-chosen
//! token that the matching reply echoes back; under the token-reuse codec
//! the handshake token also names the channel. Each datagram is served on
//! its own task so a slow peer never stalls the receive loop.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use latch_common::{Frame, Outcome};
use latch_crypto::PublicKey;
use rand::RngCore;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::codec::{Codec, Inbound};
use crate::config::ChannelConfig;
use crate::error::{Error, Result, TransportError};
use crate::handshake::ClientChannel;
use crate::service::{ChannelService, Handler};
use crate::transport::{ClientTransport, ServerTransport};

/// Largest datagram either side will read.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Request token length, as for CoAP tokens.
pub const TOKEN_LEN: usize = 8;

/// Transport tag for a peer under `codec`.
///
/// Token reuse names the channel by the request token scoped to the peer's
/// socket address, as CoAP scopes tokens to an endpoint. Routing and query
/// codecs use the address alone. Envelopes carry their own id.
fn transport_tag(codec: Codec, token: Option<&[u8]>, peer: SocketAddr) -> Option<Vec<u8>> {
    match codec {
        Codec::TokenReuse => token.map(|token| {
            let mut tag = peer.to_string().into_bytes();
            tag.extend_from_slice(token);
            tag
        }),
        Codec::Routing | Codec::Query => Some(peer.to_string().into_bytes()),
        Codec::Envelope => None,
    }
}

fn new_token() -> Vec<u8> {
    let mut token = vec![0u8; TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut token);
    token
}

/// Client side of the datagram binding.
pub struct UdpClient {
    socket: UdpSocket,
    codec: Codec,
    timeout: Duration,
    /// Token of the last handshake.
    token: Option<Vec<u8>>,
}

impl UdpClient {
    pub async fn connect(server: SocketAddr, config: &ChannelConfig) -> Result<Self> {
        let local: SocketAddr = if server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await.map_err(TransportError::from)?;
        socket.connect(server).await.map_err(TransportError::from)?;
        debug!("udp client {:?} -> {}", socket.local_addr().ok(), server);

        Ok(Self {
            socket,
            codec: config.codec,
            timeout: config.handshake_timeout(),
            token: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr().map_err(TransportError::from)?)
    }

    /// Ask the server for its static key (trust on first use).
    pub async fn fetch_server_key(&mut self) -> Result<PublicKey> {
        match self.roundtrip(&Frame::KeyRequest, None).await? {
            Frame::Key { public_key } => PublicKey::from_slice(&public_key).map_err(Error::handshake),
            Frame::Reply { outcome, .. } => Err(TransportError::Rejected(outcome).into()),
            other => Err(unexpected(&other).into()),
        }
    }

    /// Send one message on `channel` and return the decrypted response.
    pub async fn send_message(&mut self, channel: &mut ClientChannel, plaintext: &[u8]) -> Result<Vec<u8>> {
        let ciphertext = channel.seal(&[], plaintext)?;
        let outbound = self.codec.encode(channel.id(), &ciphertext)?;
        let token = self.request_token(outbound.tag);
        let frame = Frame::Message {
            token: Some(token.clone()),
            query: outbound.query,
            body: outbound.body,
        };

        let body = self.expect_success(&frame, &token).await?;
        channel.open(&[], &body)
    }

    /// Tear the channel down on the server.
    pub async fn close(&mut self, mut channel: ClientChannel) -> Result<()> {
        let ciphertext = channel.seal_close()?;
        let outbound = self.codec.encode(channel.id(), &ciphertext)?;
        let token = self.request_token(outbound.tag);
        let frame = Frame::Close {
            token: Some(token.clone()),
            query: outbound.query,
            body: outbound.body,
        };

        self.expect_success(&frame, &token).await?;
        debug!("channel {} closed", channel.id());
        Ok(())
    }

    /// Under token reuse the channel's tag ends with its handshake token.
    fn request_token(&self, tag: Option<Vec<u8>>) -> Vec<u8> {
        match (self.codec, tag) {
            (Codec::TokenReuse, Some(tag)) if tag.len() >= TOKEN_LEN => {
                tag[tag.len() - TOKEN_LEN..].to_vec()
            }
            _ => new_token(),
        }
    }

    async fn expect_success(&mut self, frame: &Frame, token: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        match self.roundtrip(frame, Some(token)).await? {
            Frame::Reply { outcome, body, .. } if outcome.is_success() => Ok(body),
            Frame::Reply { outcome, .. } => Err(TransportError::Rejected(outcome)),
            other => Err(unexpected(&other)),
        }
    }

    /// Send `frame` and wait for the reply carrying `token`.
    ///
    /// Datagrams with other tokens (late replies to earlier requests) are skipped.
    async fn roundtrip(
        &mut self,
        frame: &Frame,
        token: Option<&[u8]>,
    ) -> std::result::Result<Frame, TransportError> {
        let datagram = frame
            .encode()
            .map_err(|e| TransportError::UnexpectedReply(e.to_string()))?;
        self.socket.send(&datagram).await?;

        let timeout = self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        tokio::time::timeout(timeout, async {
            loop {
                let len = self.socket.recv(&mut buf).await?;
                let reply = match Frame::decode(&buf[..len]) {
                    Ok(reply) => reply,
                    Err(e) => {
                        debug!("ignoring malformed datagram: {}", e);
                        continue;
                    }
                };
                if token.is_none() || reply.token() == token {
                    return Ok::<_, TransportError>(reply);
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout(timeout))?
    }
}

fn unexpected(frame: &Frame) -> TransportError {
    TransportError::UnexpectedReply(format!("{frame:?}"))
}

#[async_trait]
impl ClientTransport for UdpClient {
    async fn exchange(&mut self, request: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
        let token = new_token();
        self.token = Some(token.clone());
        let frame = Frame::Handshake {
            token: Some(token.clone()),
            payload: request.to_vec(),
        };
        self.expect_success(&frame, &token).await
    }

    fn channel_tag(&self) -> Option<Vec<u8>> {
        let local = self.socket.local_addr().ok()?;
        transport_tag(self.codec, self.token.as_deref(), local)
    }
}

/// Reply path for one inbound handshake datagram.
pub struct UdpResponder<'a> {
    socket: &'a UdpSocket,
    peer: SocketAddr,
    token: Option<Vec<u8>>,
    codec: Codec,
}

#[async_trait]
impl ServerTransport for UdpResponder<'_> {
    async fn send(&mut self, reply: &[u8]) -> std::result::Result<(), TransportError> {
        let frame = Frame::Reply {
            token: self.token.clone(),
            outcome: Outcome::Success,
            body: reply.to_vec(),
        };
        send_frame(self.socket, self.peer, &frame).await
    }

    fn peer_tag(&self) -> Option<Vec<u8>> {
        transport_tag(self.codec, self.token.as_deref(), self.peer)
    }
}

async fn send_frame(
    socket: &UdpSocket,
    peer: SocketAddr,
    frame: &Frame,
) -> std::result::Result<(), TransportError> {
    let datagram = frame
        .encode()
        .map_err(|e| TransportError::UnexpectedReply(e.to_string()))?;
    socket.send_to(&datagram, peer).await?;
    Ok(())
}

/// Server side of the datagram binding.
pub struct UdpServer<H> {
    socket: Arc<UdpSocket>,
    service: Arc<ChannelService<H>>,
}

impl<H: Handler> UdpServer<H> {
    pub async fn bind(addr: SocketAddr, service: ChannelService<H>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(TransportError::from)?;
        Ok(Self {
            socket: Arc::new(socket),
            service: Arc::new(service),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr().map_err(TransportError::from)?)
    }

    pub fn service(&self) -> &Arc<ChannelService<H>> {
        &self.service
    }

    /// Receive loop. Expires idle channels every `cleanup_every`.
    pub async fn run(&self, cleanup_every: Duration) -> Result<()> {
        info!("listening on {}", self.local_addr()?);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut cleanup = tokio::time::interval(cleanup_every);

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("recv error: {}", e);
                            continue;
                        }
                    };

                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    let socket = self.socket.clone();
                    let service = self.service.clone();
                    tokio::spawn(async move {
                        handle_datagram(&socket, &service, peer, &datagram).await;
                    });
                }
                _ = cleanup.tick() => {
                    match self.service.expire_idle() {
                        Ok(0) => {}
                        Ok(n) => debug!("cleanup removed {} channels, {} live", n, self.service.registry().len()),
                        Err(e) => warn!("cleanup failed: {}", e),
                    }
                }
            }
        }
    }
}

/// Serve one datagram, replying to `peer` on `socket`.
///
/// Failures become a reply frame carrying the matching [`Outcome`].
pub async fn handle_datagram<H: Handler>(
    socket: &UdpSocket,
    service: &ChannelService<H>,
    peer: SocketAddr,
    datagram: &[u8],
) {
    let frame = match Frame::decode(datagram) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("dropping malformed datagram from {}: {}", peer, e);
            return;
        }
    };
    let token = frame.token().map(<[u8]>::to_vec);

    let reply = match dispatch(socket, service, peer, frame).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return,
        Err(e) => {
            debug!("request from {} failed: {}", peer, e);
            Frame::Reply {
                token,
                outcome: e.outcome(),
                body: Vec::new(),
            }
        }
    };

    if let Err(e) = send_frame(socket, peer, &reply).await {
        warn!("failed to reply to {}: {}", peer, e);
    }
}

async fn dispatch<H: Handler>(
    socket: &UdpSocket,
    service: &ChannelService<H>,
    peer: SocketAddr,
    frame: Frame,
) -> Result<Option<Frame>> {
    let codec = service.config().codec;

    match frame {
        Frame::KeyRequest => Ok(Some(match service.public_key() {
            Some(key) => Frame::Key {
                public_key: key.as_bytes().to_vec(),
            },
            None => Frame::Reply {
                token: None,
                outcome: Outcome::BadRequest,
                body: Vec::new(),
            },
        })),
        Frame::Handshake { token, payload } => {
            let mut responder = UdpResponder {
                socket,
                peer,
                token,
                codec,
            };
            service.handle_handshake(&mut responder, &payload).await?;
            Ok(None)
        }
        Frame::Message { token, query, body } => {
            let tag = transport_tag(codec, token.as_deref(), peer);
            let inbound = Inbound {
                tag: tag.as_deref(),
                query: query.as_deref(),
                body: &body,
            };
            let reply = service.handle_message(&inbound)?;
            Ok(Some(Frame::Reply {
                token,
                outcome: Outcome::Success,
                body: reply,
            }))
        }
        Frame::Close { token, query, body } => {
            let tag = transport_tag(codec, token.as_deref(), peer);
            let inbound = Inbound {
                tag: tag.as_deref(),
                query: query.as_deref(),
                body: &body,
            };
            service.handle_close(&inbound)?;
            Ok(Some(Frame::Reply {
                token,
                outcome: Outcome::Success,
                body: Vec::new(),
            }))
        }
        Frame::Key { .. } | Frame::Reply { .. } => {
            debug!("ignoring reply frame from {}", peer);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_tag_per_codec() {
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
        let token: &[u8] = &[1, 2, 3];

        assert_eq!(
            transport_tag(Codec::TokenReuse, Some(token), peer),
            Some(b"127.0.0.1:5683\x01\x02\x03".to_vec())
        );
        let other: SocketAddr = "127.0.0.1:5684".parse().unwrap();
        assert_ne!(
            transport_tag(Codec::TokenReuse, Some(token), peer),
            transport_tag(Codec::TokenReuse, Some(token), other)
        );
        assert_eq!(
            transport_tag(Codec::Routing, Some(token), peer),
            Some(b"127.0.0.1:5683".to_vec())
        );
        assert_eq!(transport_tag(Codec::Envelope, Some(token), peer), None);
        assert_eq!(transport_tag(Codec::TokenReuse, None, peer), None);
    }

    #[test]
    fn test_tokens_are_random() {
        assert_eq!(new_token().len(), TOKEN_LEN);
        assert_ne!(new_token(), new_token());
    }
}
