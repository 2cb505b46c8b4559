//! Request dispatch for a secure channel server.
//!
//! [`ChannelService`] glues the pieces together for a transport binding:
//! handshakes go through the handshake engine into the registry, and
//! messages are decoded by the codec, decrypted, handed to the
//! application [`Handler`], and the response sealed on the same channel.

use std::sync::Arc;

use latch_crypto::{PublicKey, StaticKeypair};
use tracing::{debug, info};

use crate::codec::Inbound;
use crate::config::ChannelConfig;
use crate::error::{Error, Result};
use crate::handshake::{self, CLOSE_AD};
use crate::registry::{Channel, SessionRegistry};
use crate::transport::{ReplyBuffer, ServerTransport};

/// Application logic behind the channel: plaintext in, plaintext out.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: &[u8]) -> Vec<u8>;
}

impl<F> Handler for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    fn handle(&self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}

pub struct ChannelService<H> {
    config: ChannelConfig,
    keypair: Option<Arc<StaticKeypair>>,
    registry: Arc<SessionRegistry>,
    handler: H,
}

impl<H: Handler> ChannelService<H> {
    pub fn new(config: ChannelConfig, keypair: Option<StaticKeypair>, handler: H) -> Result<Self> {
        config.validate()?;
        if config.pattern.uses_responder_static() && keypair.is_none() {
            return Err(Error::config(format!(
                "pattern {:?} requires a server static keypair",
                config.pattern
            )));
        }

        let registry = Arc::new(SessionRegistry::new((&config).into()));
        Ok(Self {
            config,
            keypair: keypair.map(Arc::new),
            registry,
            handler,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Static key clients should pin, if the server has one.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.keypair.as_ref().map(|k| k.public_key())
    }

    /// Serve one handshake request, replying over `transport`.
    ///
    /// A non-empty initiator payload is passed to the handler and the result
    /// rides back in the handshake reply.
    pub async fn handle_handshake<T: ServerTransport + ?Sized>(
        &self,
        transport: &mut T,
        request: &[u8],
    ) -> Result<Arc<Channel>> {
        let pending = handshake::accept(&self.config, self.keypair.as_deref(), request)?;
        let reply = if pending.payload().is_empty() {
            Vec::new()
        } else {
            self.handler.handle(pending.payload())
        };

        let channel = pending.complete(transport, &self.registry, &reply).await?;
        info!(
            "channel {} established ({:?}, {} live)",
            channel.id(),
            self.config.pattern,
            self.registry.len()
        );
        Ok(channel)
    }

    /// Serve one handshake and return the reply bytes instead of sending them.
    pub async fn handshake_reply(&self, request: &[u8], peer_tag: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let mut buffer = ReplyBuffer::new(peer_tag);
        self.handle_handshake(&mut buffer, request).await?;
        buffer
            .take()
            .ok_or_else(|| Error::internal("handshake produced no reply"))
    }

    /// Decrypt one message, run the handler, and return the sealed response.
    pub fn handle_message(&self, inbound: &Inbound<'_>) -> Result<Vec<u8>> {
        let (id, ciphertext) = self.config.codec.decode(self.config.id_scheme, inbound)?;
        let channel = self.registry.lookup(&id)?;

        let request = self.open(&channel, &[], &ciphertext)?;
        let response = self.handler.handle(&request);
        channel.seal(&[], &response)
    }

    /// Authenticate a close request and tear the channel down.
    pub fn handle_close(&self, inbound: &Inbound<'_>) -> Result<()> {
        let (id, ciphertext) = self.config.codec.decode(self.config.id_scheme, inbound)?;
        let channel = self.registry.lookup(&id)?;

        self.open(&channel, CLOSE_AD, &ciphertext)?;
        if !self.registry.remove_channel(&channel)? {
            // Re-keyed by the same peer since the lookup
            return Err(Error::UnknownChannel(id));
        }
        info!("channel {} closed by peer ({} live)", id, self.registry.len());
        Ok(())
    }

    pub fn expire_idle(&self) -> Result<usize> {
        self.registry.expire_idle()
    }

    fn open(&self, channel: &Arc<Channel>, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        match channel.open(ad, ciphertext) {
            Err(err @ (Error::AuthenticationFailure | Error::Replay(_))) => {
                debug!("channel {}: {}", channel.id(), err);
                self.registry.record_auth_failure(channel)?;
                Err(err)
            }
            other => other,
        }
    }
}
