//! One-round-trip handshake over any transport.
//!
//! The client writes Noise message 1 (optionally carrying an application
//! payload), exchanges it over a [`ClientTransport`], and reads message 2.
//! The server side runs in two phases so the application can look at the
//! piggybacked payload before the reply is written:
//!
//! ```text
//! accept(config, keypair, msg1) -> PendingHandshake
//!     .payload()                     // initiator's payload
//!     .complete(transport, registry, reply).await -> Arc<Channel>
//! ```
//!
//! How the channel id is learned depends on the [`IdScheme`]: random ids
//! are prepended to the reply payload, binding ids are the handshake hash,
//! and transport ids come from the transport itself.

use std::sync::Arc;
use std::time::Duration;

use latch_common::Outcome;
use latch_crypto::{
    CipherStatePair, HandshakePattern, NoiseInitiator, NoiseResponder, PublicKey, StaticKeypair,
};
use tracing::debug;
use zeroize::Zeroizing;

use crate::channel_id::{ChannelId, IdError, IdScheme};
use crate::config::ChannelConfig;
use crate::error::{Error, Result, TransportError};
use crate::registry::{Channel, Reservation, SessionRegistry};
use crate::transport::{ClientTransport, ServerTransport};

/// Associated data bound into an explicit close message.
pub const CLOSE_AD: &[u8] = b"latch-close";

/// Client end of an established channel.
pub struct ClientChannel {
    id: ChannelId,
    pair: CipherStatePair,
    reply: Vec<u8>,
    remote_static: Option<PublicKey>,
}

impl ClientChannel {
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Application payload the server sent back with the handshake.
    pub fn reply(&self) -> &[u8] {
        &self.reply
    }

    /// Server static key proven by the handshake (NK only).
    pub fn remote_static(&self) -> Option<&PublicKey> {
        self.remote_static.as_ref()
    }

    pub fn seal(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.pair.encrypter.encrypt(ad, plaintext)?)
    }

    pub fn open(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(self.pair.decrypter.decrypt(ad, ciphertext)?)
    }

    /// Authenticated teardown request for the server.
    pub fn seal_close(&mut self) -> Result<Vec<u8>> {
        self.seal(CLOSE_AD, &[])
    }
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("id", &self.id)
            .field("remote_static", &self.remote_static)
            .finish_non_exhaustive()
    }
}

/// Run the initiator side of a handshake.
///
/// `server_key` is the pinned responder key and is required for NK.
pub async fn client_handshake<T: ClientTransport + ?Sized>(
    transport: &mut T,
    config: &ChannelConfig,
    server_key: Option<&PublicKey>,
    payload: &[u8],
) -> Result<ClientChannel> {
    let mut initiator =
        NoiseInitiator::new(config.pattern, server_key.map(PublicKey::as_bytes), config.nonce_mode)?;
    let request = initiator.write_request(payload)?;

    let timeout = config.handshake_timeout();
    let response = match tokio::time::timeout(timeout, transport.exchange(&request)).await {
        Err(_) => return Err(TransportError::Timeout(timeout).into()),
        // The peer refused the handshake bytes themselves
        Ok(Err(TransportError::Rejected(
            outcome @ (Outcome::BadRequest | Outcome::Unauthorized),
        ))) => {
            return Err(Error::handshake(format!("server rejected handshake: {outcome}")));
        }
        Ok(result) => result?,
    };

    let (reply, result) = initiator.read_response(&response)?;

    let (id, reply) = match config.id_scheme {
        scheme @ (IdScheme::Random16 | IdScheme::Random32) => {
            let (id, rest) = ChannelId::split_assigned(scheme, &reply)
                .map_err(|e| Error::handshake(format!("invalid assigned channel id: {e}")))?;
            (id, rest.to_vec())
        }
        IdScheme::Binding => (ChannelId::Binding(result.handshake_hash), reply),
        IdScheme::Transport => {
            let tag = transport
                .channel_tag()
                .ok_or_else(|| Error::handshake("transport provides no channel tag"))?;
            let id = ChannelId::decode(IdScheme::Transport, &tag).map_err(Error::handshake)?;
            (id, reply)
        }
    };

    debug!("client channel {} established ({:?})", id, config.pattern);

    Ok(ClientChannel {
        id,
        pair: result.pair,
        reply,
        remote_static: result.remote_static.map(PublicKey),
    })
}

/// Server handshake that has read message 1 but not yet replied.
pub struct PendingHandshake<'c> {
    config: &'c ChannelConfig,
    responder: NoiseResponder,
    payload: Vec<u8>,
}

/// Read the initiator's first message.
///
/// `keypair` is the server static keypair and is required for NK.
pub fn accept<'c>(
    config: &'c ChannelConfig,
    keypair: Option<&StaticKeypair>,
    request: &[u8],
) -> Result<PendingHandshake<'c>> {
    let private = keypair.map(|k| Zeroizing::new(k.private_key_bytes()));
    let mut responder = NoiseResponder::new(config.pattern, private.as_deref(), config.nonce_mode)?;
    let payload = responder.read_request(request)?;

    Ok(PendingHandshake {
        config,
        responder,
        payload,
    })
}

impl PendingHandshake<'_> {
    /// Payload the initiator piggybacked on message 1.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn pattern(&self) -> HandshakePattern {
        self.config.pattern
    }

    /// Write message 2 with `reply`, send it, then register the channel.
    ///
    /// Nothing is registered unless the send succeeds.
    pub async fn complete<T: ServerTransport + ?Sized>(
        self,
        transport: &mut T,
        registry: &SessionRegistry,
        reply: &[u8],
    ) -> Result<Arc<Channel>> {
        let timeout = self.config.handshake_timeout();

        match self.config.id_scheme {
            scheme @ (IdScheme::Random16 | IdScheme::Random32) => {
                let reservation = registry.allocate(scheme)?;
                self.reply_assigned(transport, reservation, reply).await
            }
            IdScheme::Binding => {
                let (message, result) = self.responder.write_response(reply)?;
                let reservation = registry.reserve(ChannelId::Binding(result.handshake_hash))?;
                send_reply(transport, &message, timeout).await?;
                reservation.commit(result.pair)
            }
            IdScheme::Transport => {
                let tag = transport
                    .peer_tag()
                    .ok_or_else(|| Error::handshake("transport provides no peer tag"))?;
                let id = ChannelId::decode(IdScheme::Transport, &tag)?;

                let (message, result) = self.responder.write_response(reply)?;
                send_reply(transport, &message, timeout).await?;
                registry.rekey(id, result.pair)
            }
        }
    }

    /// Like [`complete`](Self::complete), but under an id the caller picked.
    ///
    /// Only valid for assigning schemes; fails with `ChannelCollision` if the
    /// id is taken.
    pub async fn complete_with_id<T: ServerTransport + ?Sized>(
        self,
        transport: &mut T,
        registry: &SessionRegistry,
        id: ChannelId,
        reply: &[u8],
    ) -> Result<Arc<Channel>> {
        if id.scheme() != self.config.id_scheme || id.scheme().assigned_len().is_none() {
            return Err(Error::config(format!(
                "cannot assign {} under the {:?} scheme",
                id, self.config.id_scheme
            )));
        }
        if id.is_reserved() {
            return Err(IdError::Reserved.into());
        }

        let reservation = registry.reserve(id)?;
        self.reply_assigned(transport, reservation, reply).await
    }

    async fn reply_assigned<T: ServerTransport + ?Sized>(
        self,
        transport: &mut T,
        reservation: Reservation<'_>,
        reply: &[u8],
    ) -> Result<Arc<Channel>> {
        let mut body = reservation.id().to_bytes();
        body.extend_from_slice(reply);

        let (message, result) = self.responder.write_response(&body)?;
        send_reply(transport, &message, self.config.handshake_timeout()).await?;
        reservation.commit(result.pair)
    }
}

/// Accept and complete a handshake with an empty reply payload.
pub async fn server_handshake<T: ServerTransport + ?Sized>(
    transport: &mut T,
    config: &ChannelConfig,
    keypair: Option<&StaticKeypair>,
    registry: &SessionRegistry,
    request: &[u8],
) -> Result<Arc<Channel>> {
    accept(config, keypair, request)?
        .complete(transport, registry, &[])
        .await
}

async fn send_reply<T: ServerTransport + ?Sized>(
    transport: &mut T,
    message: &[u8],
    timeout: Duration,
) -> Result<()> {
    tokio::time::timeout(timeout, transport.send(message))
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ReplyBuffer;
    use async_trait::async_trait;

    /// Runs the server half inline on every exchange.
    struct Inline<'a> {
        config: &'a ChannelConfig,
        keypair: Option<&'a StaticKeypair>,
        registry: &'a SessionRegistry,
        tag: Option<Vec<u8>>,
    }

    #[async_trait]
    impl ClientTransport for Inline<'_> {
        async fn exchange(&mut self, request: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
            let mut buffer = ReplyBuffer::new(self.tag.clone());
            let pending = accept(self.config, self.keypair, request)
                .map_err(|_| TransportError::Rejected(Outcome::Unauthorized))?;
            let mut reply = pending.payload().to_vec();
            reply.reverse();
            pending
                .complete(&mut buffer, self.registry, &reply)
                .await
                .map_err(|_| TransportError::Rejected(Outcome::InternalError))?;
            buffer
                .take()
                .ok_or_else(|| TransportError::UnexpectedReply("no reply".into()))
        }

        fn channel_tag(&self) -> Option<Vec<u8>> {
            self.tag.clone()
        }
    }

    struct Silent;

    #[async_trait]
    impl ClientTransport for Silent {
        async fn exchange(&mut self, _request: &[u8]) -> std::result::Result<Vec<u8>, TransportError> {
            std::future::pending().await
        }
    }

    /// Server transport whose reply never gets out.
    struct Broken {
        tag: Option<Vec<u8>>,
        stall: bool,
    }

    #[async_trait]
    impl ServerTransport for Broken {
        async fn send(&mut self, _reply: &[u8]) -> std::result::Result<(), TransportError> {
            if self.stall {
                std::future::pending::<()>().await;
            }
            Err(TransportError::UnexpectedReply("send failed".into()))
        }

        fn peer_tag(&self) -> Option<Vec<u8>> {
            self.tag.clone()
        }
    }

    fn first_message(config: &ChannelConfig) -> Vec<u8> {
        NoiseInitiator::new(config.pattern, None, config.nonce_mode)
            .unwrap()
            .write_request(b"")
            .unwrap()
    }

    async fn handshake_over<T: ServerTransport>(
        transport: &mut T,
        config: &ChannelConfig,
        registry: &SessionRegistry,
    ) -> Result<Arc<Channel>> {
        server_handshake(transport, config, None, registry, &first_message(config)).await
    }

    fn single_slot(id_scheme: IdScheme) -> ChannelConfig {
        let codec = match id_scheme {
            IdScheme::Transport => crate::codec::Codec::Routing,
            _ => crate::codec::Codec::Envelope,
        };
        ChannelConfig {
            id_scheme,
            codec,
            max_sessions: 1,
            ..Default::default()
        }
    }

    async fn establish(config: &ChannelConfig, tag: Option<Vec<u8>>) -> (ClientChannel, Arc<Channel>) {
        let registry = SessionRegistry::new(config.into());
        let mut transport = Inline {
            config,
            keypair: None,
            registry: &registry,
            tag,
        };
        let mut client = client_handshake(&mut transport, config, None, b"abc")
            .await
            .unwrap();
        assert_eq!(client.reply(), b"cba");

        let server = registry.lookup(client.id()).unwrap();
        let ct = client.seal(&[], b"ping").unwrap();
        assert_eq!(server.open(&[], &ct).unwrap(), b"ping");
        let ct = server.seal(&[], b"pong").unwrap();
        assert_eq!(client.open(&[], &ct).unwrap(), b"pong");
        (client, server)
    }

    #[tokio::test]
    async fn test_every_id_scheme() {
        for scheme in [IdScheme::Random16, IdScheme::Random32, IdScheme::Binding] {
            let config = ChannelConfig {
                id_scheme: scheme,
                ..Default::default()
            };
            let (client, server) = establish(&config, None).await;
            assert_eq!(client.id(), server.id());
            assert_eq!(client.id().scheme(), scheme);
        }

        let config = ChannelConfig {
            id_scheme: IdScheme::Transport,
            codec: crate::codec::Codec::TokenReuse,
            ..Default::default()
        };
        let (client, _) = establish(&config, Some(b"tok".to_vec())).await;
        assert_eq!(client.id(), &ChannelId::Transport(b"tok".to_vec()));
    }

    #[tokio::test]
    async fn test_failed_send_leaves_registry_untouched() {
        for scheme in [
            IdScheme::Random16,
            IdScheme::Random32,
            IdScheme::Binding,
            IdScheme::Transport,
        ] {
            let config = single_slot(scheme);
            let registry = SessionRegistry::new((&config).into());
            let tag = Some(b"10.0.0.1:5683".to_vec());
            let mut broken = Broken {
                tag: tag.clone(),
                stall: false,
            };

            let err = handshake_over(&mut broken, &config, &registry)
                .await
                .unwrap_err();
            assert!(
                matches!(err, Error::Transport(TransportError::UnexpectedReply(_))),
                "{scheme:?}: got {err:?}"
            );
            assert!(registry.is_empty(), "{scheme:?}");

            // The only slot was released again
            let mut buffer = ReplyBuffer::new(tag);
            handshake_over(&mut buffer, &config, &registry)
                .await
                .unwrap();
            assert_eq!(registry.len(), 1, "{scheme:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_times_out_without_registering() {
        for scheme in [IdScheme::Random16, IdScheme::Binding, IdScheme::Transport] {
            let config = single_slot(scheme);
            let registry = SessionRegistry::new((&config).into());
            let mut broken = Broken {
                tag: Some(b"peer".to_vec()),
                stall: true,
            };

            let err = handshake_over(&mut broken, &config, &registry)
                .await
                .unwrap_err();
            assert!(
                matches!(err, Error::Transport(TransportError::Timeout(_))),
                "{scheme:?}: got {err:?}"
            );
            assert!(registry.is_empty(), "{scheme:?}");
        }
    }

    #[tokio::test]
    async fn test_failed_rekey_keeps_previous_channel() {
        let config = single_slot(IdScheme::Transport);
        let registry = SessionRegistry::new((&config).into());
        let tag = b"10.0.0.2:5683".to_vec();

        let mut buffer = ReplyBuffer::new(Some(tag.clone()));
        let previous = handshake_over(&mut buffer, &config, &registry)
            .await
            .unwrap();

        let mut broken = Broken {
            tag: Some(tag),
            stall: false,
        };
        assert!(
            handshake_over(&mut broken, &config, &registry)
                .await
                .is_err()
        );
        assert!(Arc::ptr_eq(&registry.lookup(previous.id()).unwrap(), &previous));
    }

    #[tokio::test]
    async fn test_missing_transport_tag() {
        let config = ChannelConfig {
            id_scheme: IdScheme::Transport,
            codec: crate::codec::Codec::Routing,
            ..Default::default()
        };
        let registry = SessionRegistry::new((&config).into());
        let mut transport = Inline {
            config: &config,
            keypair: None,
            registry: &registry,
            tag: None,
        };
        let err = client_handshake(&mut transport, &config, None, b"")
            .await
            .unwrap_err();
        // Server refuses first, so the client sees a rejected transport call
        assert!(matches!(err, Error::Transport(TransportError::Rejected(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_nk_requires_keys() {
        let config = ChannelConfig {
            pattern: HandshakePattern::Nk,
            ..Default::default()
        };
        let err = client_handshake(&mut Silent, &config, None, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = accept(&config, None, &[0u8; 48]).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let config = ChannelConfig::default();
        let err = client_handshake(&mut Silent, &config, None, b"")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::Timeout(d)) if d == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn test_garbage_request_is_handshake_error() {
        let config = ChannelConfig::default();
        let err = accept(&config, None, b"definitely not noise").err().unwrap();
        assert!(matches!(err, Error::Handshake(_)));
    }

    #[tokio::test]
    async fn test_close_is_bound_to_marker() {
        let config = ChannelConfig::default();
        let (mut client, server) = establish(&config, None).await;

        let close = client.seal_close().unwrap();
        assert!(matches!(
            server.open(&[], &close),
            Err(Error::AuthenticationFailure)
        ));
        assert!(server.open(CLOSE_AD, &close).unwrap().is_empty());
    }
}
