//! Latch CLI tools: key generation, key export, interactive client.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use latch_core::udp::UdpClient;
use latch_core::{
    client_handshake, ChannelConfig, ClientChannel, Codec, HandshakePattern, IdScheme, NonceMode,
};
use latch_crypto::{PublicKey, StaticKeypair};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "latch")]
#[command(about = "Latch CLI tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new X25519 static keypair for NK servers
    Keygen {
        /// Output file path (without extension)
        #[arg(short, long, default_value = "latch")]
        output: String,
    },

    /// Print the public key from a key file
    ShowKey {
        /// Public (.pub) or private (.key) key file
        #[arg(short, long)]
        key: PathBuf,
    },

    /// Open a secure channel and send messages
    Connect(ConnectOptions),

    /// Show version information
    Version,
}

#[derive(clap::Args, Debug)]
struct ConnectOptions {
    /// Server address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:5684")]
    server: SocketAddr,

    /// Handshake pattern (nn, nk)
    #[arg(long, default_value = "nn")]
    pattern: HandshakePattern,

    /// Channel id scheme (random16, random32, binding, transport)
    #[arg(long, default_value = "random16")]
    id_scheme: IdScheme,

    /// Message codec (envelope, token-reuse, routing, query)
    #[arg(long, default_value = "envelope")]
    codec: Codec,

    /// Use explicit nonces with a replay window of this many messages
    #[arg(long)]
    window: Option<u64>,

    /// Pinned server key: hex string or path to a .pub file
    #[arg(long, env = "LATCH_SERVER_PUBLIC_KEY")]
    server_key: Option<String>,

    /// Ask the server for its key instead of pinning one
    #[arg(long, default_value_t = false)]
    fetch_key: bool,

    /// Payload to carry inside the handshake
    #[arg(long)]
    early: Option<String>,

    /// Messages to send; reads lines from stdin until "q" when empty
    messages: Vec<String>,
}

impl ConnectOptions {
    fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            pattern: self.pattern,
            id_scheme: self.id_scheme,
            codec: self.codec,
            nonce_mode: self
                .window
                .map_or(NonceMode::Implicit, |window| NonceMode::Explicit { window }),
            ..Default::default()
        }
    }
}

fn parse_server_key(value: &str) -> Result<PublicKey> {
    match value.parse() {
        Ok(key) => Ok(key),
        Err(_) => PublicKey::load(value).context("server key is neither hex nor a readable key file"),
    }
}

fn show_key(path: &Path) -> Result<PublicKey> {
    // Both files are 32 bytes of hex; only the extension tells them apart
    if path.extension().is_some_and(|ext| ext == "key") {
        return Ok(StaticKeypair::load(path)?.public_key());
    }
    PublicKey::load(path)
}

async fn exchange(client: &mut UdpClient, channel: &mut ClientChannel, message: &str) -> Result<()> {
    let reply = client.send_message(channel, message.as_bytes()).await?;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

async fn connect(options: ConnectOptions) -> Result<()> {
    let config = options.channel_config();
    config.validate()?;
    let server = options.server;

    let mut client = UdpClient::connect(server, &config).await?;

    let server_key = match (&options.server_key, options.fetch_key) {
        (Some(value), _) => Some(parse_server_key(value)?),
        (None, true) => {
            let key = client.fetch_server_key().await?;
            println!("Server key: {}", key);
            Some(key)
        }
        (None, false) => None,
    };

    let early = options.early.unwrap_or_default();
    let mut channel = client_handshake(&mut client, &config, server_key.as_ref(), early.as_bytes())
        .await
        .context("handshake failed")?;
    println!("Connected to {} on channel {}", server, channel.id());
    if !channel.reply().is_empty() {
        println!("{}", String::from_utf8_lossy(channel.reply()));
    }

    if options.messages.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line == "q" {
                break;
            }
            if line.is_empty() {
                continue;
            }
            exchange(&mut client, &mut channel, line).await?;
        }
    } else {
        for message in &options.messages {
            exchange(&mut client, &mut channel, message).await?;
        }
    }

    debug!("closing channel {}", channel.id());
    client.close(channel).await?;
    Ok(())
}

fn main() -> Result<()> {
    latch_common::init_tracing_with_default("warn");

    let args = Args::parse();

    match args.command {
        Command::Keygen { output } => {
            println!("Generating X25519 static keypair...");

            let keypair = StaticKeypair::generate();
            let private_path = format!("{}.key", output);
            let public_path = format!("{}.pub", output);

            keypair.save(&private_path, &public_path)?;

            println!("Private key: {}", private_path);
            println!("Public key:  {}", public_path);
            println!("Key:         {}", keypair.public_key());
        }
        Command::ShowKey { key } => {
            println!("{}", show_key(&key)?);
        }
        Command::Connect(options) => {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;

            rt.block_on(connect(options))?;
        }
        Command::Version => {
            println!("latch {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
