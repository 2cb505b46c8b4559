//! Integration tests for secure channels over UDP sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use latch_common::{Frame, Outcome};
use latch_core::udp::{UdpClient, UdpServer, MAX_DATAGRAM_SIZE, TOKEN_LEN};
use latch_core::{
    client_handshake, ChannelConfig, ChannelService, Codec, Error, HandshakePattern, IdScheme,
    NonceMode, StaticKeypair, TransportError,
};
use latch_crypto::NoiseInitiator;
use tokio::time::timeout;

type Reverse = fn(&[u8]) -> Vec<u8>;

fn reverse(request: &[u8]) -> Vec<u8> {
    request.iter().rev().copied().collect()
}

/// Start a server on an ephemeral port and return its address and service.
async fn start(
    config: ChannelConfig,
    keypair: Option<StaticKeypair>,
) -> (SocketAddr, Arc<ChannelService<Reverse>>) {
    let service = ChannelService::new(config, keypair, reverse as Reverse).unwrap();
    let server = UdpServer::bind("127.0.0.1:0".parse().unwrap(), service)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let service = server.service().clone();

    tokio::spawn(async move {
        let _ = server.run(Duration::from_secs(60)).await;
    });
    (addr, service)
}

/// Handshake, message, and close over real sockets
#[tokio::test]
async fn test_handshake_message_close_over_udp() {
    let config = ChannelConfig::default();
    let (addr, service) = start(config.clone(), None).await;

    let mut client = UdpClient::connect(addr, &config).await.unwrap();
    let mut channel = timeout(
        Duration::from_secs(5),
        client_handshake(&mut client, &config, None, b""),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(service.registry().len(), 1);

    let reply = client.send_message(&mut channel, b"hello").await.unwrap();
    assert_eq!(reply, b"olleh");
    let reply = client.send_message(&mut channel, b"again").await.unwrap();
    assert_eq!(reply, b"niaga");

    let id = channel.id().clone();
    client.close(channel).await.unwrap();
    assert!(service.registry().is_empty());
    assert!(service.registry().lookup(&id).is_err());
}

#[tokio::test]
async fn test_close_leaves_other_channels() {
    let config = ChannelConfig::default();
    let (addr, service) = start(config.clone(), None).await;

    let mut client = UdpClient::connect(addr, &config).await.unwrap();
    let first = client_handshake(&mut client, &config, None, b"")
        .await
        .unwrap();
    let mut second = client_handshake(&mut client, &config, None, b"")
        .await
        .unwrap();
    assert_eq!(service.registry().len(), 2);

    let closed = first.id().clone();
    client.close(first).await.unwrap();
    assert!(service.registry().lookup(&closed).is_err());

    // Many channels share one socket under the envelope codec
    assert_eq!(client.send_message(&mut second, b"ok").await.unwrap(), b"ko");
    assert_eq!(service.registry().len(), 1);
}

#[tokio::test]
async fn test_nk_with_fetched_key_and_token_reuse() {
    let keypair = StaticKeypair::generate();
    let expected = keypair.public_key();
    let config = ChannelConfig {
        pattern: HandshakePattern::Nk,
        id_scheme: IdScheme::Transport,
        codec: Codec::TokenReuse,
        ..Default::default()
    };
    let (addr, _service) = start(config.clone(), Some(keypair)).await;

    let mut client = UdpClient::connect(addr, &config).await.unwrap();
    let server_key = client.fetch_server_key().await.unwrap();
    assert_eq!(server_key, expected);

    let mut channel = client_handshake(&mut client, &config, Some(&server_key), b"early data")
        .await
        .unwrap();
    assert_eq!(channel.reply(), b"atad ylrae");
    // Token scoped to this client's address
    let id = channel.id().to_bytes();
    let local = client.local_addr().unwrap().to_string().into_bytes();
    assert_eq!(id.len(), local.len() + TOKEN_LEN);
    assert!(id.starts_with(&local));

    let reply = client.send_message(&mut channel, b"secure").await.unwrap();
    assert_eq!(reply, b"eruces");
}

#[tokio::test]
async fn test_nk_wrong_key_over_udp() {
    let config = ChannelConfig {
        pattern: HandshakePattern::Nk,
        ..Default::default()
    };
    let (addr, service) = start(config.clone(), Some(StaticKeypair::generate())).await;

    let mut client = UdpClient::connect(addr, &config).await.unwrap();
    let wrong = StaticKeypair::generate().public_key();
    let err = client_handshake(&mut client, &config, Some(&wrong), b"")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Handshake(_)), "got {err:?}");
    assert!(service.registry().is_empty());
}

#[tokio::test]
async fn test_token_reuse_cannot_take_over_another_peers_channel() {
    let config = ChannelConfig {
        id_scheme: IdScheme::Transport,
        codec: Codec::TokenReuse,
        ..Default::default()
    };
    let (addr, service) = start(config.clone(), None).await;

    let mut victim = UdpClient::connect(addr, &config).await.unwrap();
    let mut channel = client_handshake(&mut victim, &config, None, b"")
        .await
        .unwrap();
    assert_eq!(victim.send_message(&mut channel, b"hi").await.unwrap(), b"ih");

    // Another socket replays the victim's token with a fresh handshake
    let id = channel.id().to_bytes();
    let token = id[id.len() - TOKEN_LEN..].to_vec();
    let request = NoiseInitiator::new(HandshakePattern::Nn, None, NonceMode::Implicit)
        .unwrap()
        .write_request(b"")
        .unwrap();
    let frame = Frame::Handshake {
        token: Some(token),
        payload: request,
    };
    let attacker = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    attacker.send_to(&frame.encode().unwrap(), addr).await.unwrap();

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let (len, _) = timeout(Duration::from_secs(5), attacker.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        Frame::decode(&buf[..len]).unwrap(),
        Frame::Reply {
            outcome: Outcome::Success,
            ..
        }
    ));

    // Both channels live side by side; the victim's keys are untouched
    assert_eq!(service.registry().len(), 2);
    assert_eq!(victim.send_message(&mut channel, b"still mine").await.unwrap(), b"enim llits");
}

#[tokio::test]
async fn test_routing_codec_uses_peer_address() {
    let config = ChannelConfig {
        id_scheme: IdScheme::Transport,
        codec: Codec::Routing,
        ..Default::default()
    };
    let (addr, service) = start(config.clone(), None).await;

    let mut client = UdpClient::connect(addr, &config).await.unwrap();
    let mut channel = client_handshake(&mut client, &config, None, b"")
        .await
        .unwrap();
    let local = client.local_addr().unwrap();
    assert_eq!(channel.id().to_bytes(), local.to_string().into_bytes());

    assert_eq!(client.send_message(&mut channel, b"route").await.unwrap(), b"etuor");
    assert_eq!(service.registry().len(), 1);
}

#[tokio::test]
async fn test_query_codec() {
    let config = ChannelConfig {
        id_scheme: IdScheme::Transport,
        codec: Codec::Query,
        ..Default::default()
    };
    let (addr, _service) = start(config.clone(), None).await;

    let mut client = UdpClient::connect(addr, &config).await.unwrap();
    let mut channel = client_handshake(&mut client, &config, None, b"")
        .await
        .unwrap();
    assert_eq!(client.send_message(&mut channel, b"query").await.unwrap(), b"yreuq");
}

#[tokio::test]
async fn test_key_request_without_static_key() {
    let config = ChannelConfig::default();
    let (addr, _service) = start(config.clone(), None).await;

    let mut client = UdpClient::connect(addr, &config).await.unwrap();
    let err = client.fetch_server_key().await.unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Rejected(_))));
}

#[tokio::test]
async fn test_silent_server_times_out() {
    // Bound but never read from
    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = ChannelConfig {
        handshake_timeout_ms: 200,
        ..Default::default()
    };

    let mut client = UdpClient::connect(socket.local_addr().unwrap(), &config)
        .await
        .unwrap();
    let err = client_handshake(&mut client, &config, None, b"")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transport(TransportError::Timeout(_))));
}
