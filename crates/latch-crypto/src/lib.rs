//! Cryptographic primitives for Latch.
//!
//! This crate provides:
//! - One-round-trip Noise handshakes (NN and NK)
//! - Directional cipher states split from a completed handshake
//! - Sliding-window replay protection for explicit-nonce channels
//! - X25519 static keys for pinning a server under NK
//!
//! # Design
//!
//! A single request/reply completes the handshake, so it can ride inside one
//! transport operation (a CoAP POST, a datagram exchange, a message pair).
//! The split keys seed ChaCha20-Poly1305 states with Noise's nonce layout,
//! which lets each direction be locked and advanced independently.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod keys;
pub mod noise;
pub mod seq_window;

pub use cipher::{CipherError, CipherState, CipherStatePair, NonceMode};
pub use keys::{PublicKey, StaticKeypair};
pub use noise::{HandshakePattern, HandshakeResult, NoiseError, NoiseInitiator, NoiseResponder};
pub use seq_window::SequenceWindow;
