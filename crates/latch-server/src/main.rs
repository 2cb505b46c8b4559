#![forbid(unsafe_code)]

//! Latch server - reverse-echo service over UDP secure channels.
//!
//! The server:
//! 1. Answers Noise NN/NK handshakes, optionally piggybacking a reply
//! 2. Decrypts each message, reverses it, and sends it back sealed
//! 3. Drops channels that go idle, fail authentication, or are closed

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use latch_core::udp::UdpServer;
use latch_core::{ChannelConfig, ChannelService, Codec, HandshakePattern, IdScheme, NonceMode};
use latch_crypto::StaticKeypair;
use tracing::{info, warn};

const CLEANUP_INTERVAL_SECS: u64 = 10;

#[derive(Parser, Debug)]
#[command(name = "latch-server")]
#[command(about = "Latch reverse-echo server over UDP secure channels")]
struct Args {
    /// UDP listen address
    #[arg(long, env = "LATCH_LISTEN_ADDR", default_value = "127.0.0.1:5684")]
    listen: SocketAddr,

    /// JSON channel config; flags below override its fields
    #[arg(long, env = "LATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Handshake pattern (nn, nk)
    #[arg(long, env = "LATCH_PATTERN")]
    pattern: Option<HandshakePattern>,

    /// Channel id scheme (random16, random32, binding, transport)
    #[arg(long, env = "LATCH_ID_SCHEME")]
    id_scheme: Option<IdScheme>,

    /// Message codec (envelope, token-reuse, routing, query)
    #[arg(long, env = "LATCH_CODEC")]
    codec: Option<Codec>,

    /// Use explicit nonces with a replay window of this many messages
    #[arg(long, env = "LATCH_REPLAY_WINDOW")]
    window: Option<u64>,

    /// Static private key file (hex); created if missing
    #[arg(long, env = "LATCH_SERVER_KEY")]
    key: Option<PathBuf>,

    /// Maximum concurrent channels
    #[arg(long, env = "LATCH_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Channel idle timeout in seconds (0 disables)
    #[arg(long, env = "LATCH_IDLE_TIMEOUT")]
    idle_timeout: Option<u64>,

    /// Decrypt failures before a channel is dropped (0 disables)
    #[arg(long, env = "LATCH_MAX_AUTH_FAILURES")]
    max_auth_failures: Option<u32>,

    /// Log level
    #[arg(long, env = "LATCH_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn channel_config(&self) -> Result<ChannelConfig> {
        let mut config = match &self.config {
            Some(path) => ChannelConfig::from_json_file(path)?,
            None => ChannelConfig::default(),
        };

        if let Some(pattern) = self.pattern {
            config.pattern = pattern;
        }
        if let Some(id_scheme) = self.id_scheme {
            config.id_scheme = id_scheme;
        }
        if let Some(codec) = self.codec {
            config.codec = codec;
        }
        if let Some(window) = self.window {
            config.nonce_mode = NonceMode::Explicit { window };
        }
        if let Some(max_sessions) = self.max_sessions {
            config.max_sessions = max_sessions;
        }
        if let Some(idle_timeout) = self.idle_timeout {
            config.idle_timeout_secs = idle_timeout;
        }
        if let Some(max_auth_failures) = self.max_auth_failures {
            config.max_auth_failures = max_auth_failures;
        }

        config.validate()?;
        Ok(config)
    }
}

fn load_or_create_key(path: &Path) -> Result<StaticKeypair> {
    if path.exists() {
        return StaticKeypair::load(path);
    }

    let keypair = StaticKeypair::generate();
    let public_path = path.with_extension("pub");
    keypair
        .save(path, &public_path)
        .with_context(|| format!("failed to create key {}", path.display()))?;
    info!("Generated static key {}", path.display());
    Ok(keypair)
}

fn reverse(request: &[u8]) -> Vec<u8> {
    request.iter().rev().copied().collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    latch_common::init_tracing_with_default(&args.log_level);

    info!("Starting latch-server v{}", env!("CARGO_PKG_VERSION"));

    let config = args.channel_config()?;
    let keypair = match (&args.key, config.pattern) {
        (Some(path), _) => Some(load_or_create_key(path)?),
        (None, HandshakePattern::Nk) => {
            warn!("No --key given; using an ephemeral static key");
            Some(StaticKeypair::generate())
        }
        (None, HandshakePattern::Nn) => None,
    };
    if let Some(keypair) = &keypair {
        info!("Server public key: {}", keypair.public_key());
    }

    info!(
        "Channel config: pattern={:?} id_scheme={:?} codec={:?} nonce_mode={:?}",
        config.pattern, config.id_scheme, config.codec, config.nonce_mode
    );

    let service = ChannelService::new(config, keypair, reverse)?;
    let server = UdpServer::bind(args.listen, service).await?;

    tokio::select! {
        result = server.run(Duration::from_secs(CLEANUP_INTERVAL_SECS)) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!(
                "Shutting down ({} live channels)",
                server.service().registry().len()
            );
        }
    }

    Ok(())
}
