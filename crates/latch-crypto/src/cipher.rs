//! Directional cipher states.
//!
//! Each direction of a channel owns one [`CipherState`]: a ChaCha20-Poly1305
//! key and a nonce counter. The nonce layout follows Noise's ChaChaPoly
//! convention (4 zero bytes, then the 64-bit counter little-endian), so a
//! state seeded from the handshake split is wire-compatible with a Noise
//! transport session.
//!
//! # Nonce modes
//!
//! - [`NonceMode::Implicit`]: sender and receiver advance their counters in
//!   lock-step. Ciphertexts carry no nonce, and anything delivered out of
//!   order fails authentication.
//! - [`NonceMode::Explicit`]: the sender prefixes each ciphertext with its
//!   8-byte counter. The receiver accepts reordering within a sliding
//!   [`SequenceWindow`] and rejects duplicates.
//!
//! ```text
//! implicit: [ciphertext][16 bytes: tag]
//! explicit: [8 bytes: nonce LE][ciphertext][16 bytes: tag]
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::seq_window::SequenceWindow;

/// AEAD authentication tag length.
pub const TAG_LEN: usize = 16;

/// Length of the explicit nonce prefix.
pub const NONCE_PREFIX_LEN: usize = 8;

/// Cipher state errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    /// Ciphertext, tag, or associated data failed verification.
    #[error("authentication failure")]
    AuthenticationFailure,

    #[error("replay detected: nonce {0}")]
    Replay(u64),

    /// The counter reached the reserved maximum; a new handshake is required.
    #[error("nonce space exhausted")]
    NonceExhausted,

    #[error("encryption failed")]
    EncryptionFailed,
}

/// How nonces are conveyed between the two ends of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NonceMode {
    #[default]
    Implicit,
    Explicit {
        /// Replay window size in messages (1-128)
        window: u64,
    },
}

/// One direction of a channel.
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    /// Next nonce to use (encrypter) or expect (implicit decrypter)
    nonce: u64,
    /// Replay tracking, present only for explicit-nonce decryption
    window: Option<SequenceWindow>,
    explicit: bool,
}

impl CipherState {
    pub fn new(key: &[u8; 32], mode: NonceMode) -> Self {
        let (window, explicit) = match mode {
            NonceMode::Implicit => (None, false),
            NonceMode::Explicit { window } => (Some(SequenceWindow::with_size(window)), true),
        };

        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            nonce: 0,
            window,
            explicit,
        }
    }

    /// Next counter value this state will use.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Encrypt `plaintext`, binding `ad` into the tag.
    ///
    /// Advances the nonce counter on every call.
    pub fn encrypt(&mut self, ad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        // 2^64-1 is reserved by Noise
        if self.nonce == u64::MAX {
            return Err(CipherError::NonceExhausted);
        }
        let n = self.nonce;

        let ciphertext = self
            .cipher
            .encrypt(
                &counter_to_nonce(n),
                Payload {
                    msg: plaintext,
                    aad: ad,
                },
            )
            .map_err(|_| CipherError::EncryptionFailed)?;
        self.nonce += 1;

        if !self.explicit {
            return Ok(ciphertext);
        }

        let mut out = Vec::with_capacity(NONCE_PREFIX_LEN + ciphertext.len());
        out.extend_from_slice(&n.to_le_bytes());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt `ciphertext` and verify it against `ad`.
    ///
    /// Fails closed: no plaintext is returned unless the tag verifies. State
    /// only advances after a successful decryption.
    pub fn decrypt(&mut self, ad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        match self.window.as_mut() {
            None => {
                if ciphertext.len() < TAG_LEN {
                    return Err(CipherError::AuthenticationFailure);
                }
                if self.nonce == u64::MAX {
                    return Err(CipherError::NonceExhausted);
                }
                let plaintext = open(&self.cipher, self.nonce, ad, ciphertext)?;
                self.nonce += 1;
                Ok(plaintext)
            }
            Some(window) => {
                if ciphertext.len() < NONCE_PREFIX_LEN + TAG_LEN {
                    return Err(CipherError::AuthenticationFailure);
                }
                let (prefix, body) = ciphertext.split_at(NONCE_PREFIX_LEN);
                let mut n_bytes = [0u8; NONCE_PREFIX_LEN];
                n_bytes.copy_from_slice(prefix);
                let n = u64::from_le_bytes(n_bytes);

                // Check replay window BEFORE decryption (fail fast)
                if n == u64::MAX || !window.check(n) {
                    return Err(CipherError::Replay(n));
                }

                let plaintext = open(&self.cipher, n, ad, body)?;

                // Only update window after successful decryption
                window.check_and_update(n);
                Ok(plaintext)
            }
        }
    }
}

impl std::fmt::Debug for CipherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherState")
            .field("nonce", &self.nonce)
            .field("explicit", &self.explicit)
            .finish_non_exhaustive()
    }
}

/// Cross-wired pair of cipher states for one end of a channel.
///
/// The initiator's encrypter shares a key with the responder's decrypter and
/// vice versa.
#[derive(Debug)]
pub struct CipherStatePair {
    pub encrypter: CipherState,
    pub decrypter: CipherState,
}

impl CipherStatePair {
    pub fn new(send_key: &[u8; 32], recv_key: &[u8; 32], mode: NonceMode) -> Self {
        Self {
            encrypter: CipherState::new(send_key, mode),
            decrypter: CipherState::new(recv_key, mode),
        }
    }
}

fn open(cipher: &ChaCha20Poly1305, n: u64, ad: &[u8], body: &[u8]) -> Result<Vec<u8>, CipherError> {
    cipher
        .decrypt(&counter_to_nonce(n), Payload { msg: body, aad: ad })
        .map_err(|_| CipherError::AuthenticationFailure)
}

/// Convert a counter to a 12-byte nonce for ChaCha20-Poly1305.
fn counter_to_nonce(n: u64) -> Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&n.to_le_bytes());
    Nonce::from(nonce_bytes)
}
