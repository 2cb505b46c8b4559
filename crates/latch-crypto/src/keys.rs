//! X25519 static keys for NK handshakes.
//!
//! The server holds a [`StaticKeypair`]; clients pin its [`PublicKey`] out of
//! band. Keys are stored on disk as hex text, one key per file.
//!
//! # Example
//!
//! ```
//! use latch_crypto::keys::{PublicKey, StaticKeypair};
//!
//! let keypair = StaticKeypair::generate();
//! let public = keypair.public_key();
//!
//! let parsed: PublicKey = public.to_string().parse().unwrap();
//! assert_eq!(parsed, public);
//! ```

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::StaticSecret;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Server static keypair. The private half is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct StaticKeypair {
    private: [u8; 32],
    #[zeroize(skip)]
    public: [u8; 32],
}

impl StaticKeypair {
    /// Generate a new random keypair using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);
        let keypair = Self::from_bytes(&private);
        private.zeroize();
        keypair
    }

    /// Create from raw private key bytes.
    pub fn from_bytes(private: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*private);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self {
            private: *private,
            public: *public.as_bytes(),
        }
    }

    /// Get the private key bytes.
    ///
    /// # Security
    /// Handle with care! These bytes can recreate the keypair.
    pub fn private_key_bytes(&self) -> [u8; 32] {
        self.private
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public)
    }

    /// Save keypair to files as hex.
    ///
    /// Private key is saved with restricted permissions (0600 on Unix).
    pub fn save(
        &self,
        private_path: impl AsRef<Path>,
        public_path: impl AsRef<Path>,
    ) -> Result<()> {
        let private_path = private_path.as_ref();
        let mut encoded = hex::encode(self.private);
        fs::write(private_path, &encoded)
            .with_context(|| format!("failed to write {}", private_path.display()))?;
        encoded.zeroize();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(private_path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(private_path, perms)?;
        }

        self.public_key().save(public_path)
    }

    /// Load keypair from a private key file.
    pub fn load(private_path: impl AsRef<Path>) -> Result<Self> {
        let private_path = private_path.as_ref();
        let mut text = fs::read_to_string(private_path)
            .with_context(|| format!("failed to read {}", private_path.display()))?;
        let mut bytes = decode_key(text.trim()).context("invalid private key")?;
        text.zeroize();

        let keypair = Self::from_bytes(&bytes);
        bytes.zeroize();
        Ok(keypair)
    }
}

impl fmt::Debug for StaticKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticKeypair({})", self.public_key())
    }
}

/// X25519 public key, displayed as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            anyhow::anyhow!(
                "invalid public key length: expected 32 bytes, got {}",
                bytes.len()
            )
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_string())
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        text.trim().parse()
    }
}

impl std::str::FromStr for PublicKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self(decode_key(s).context("invalid public key")?))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

fn decode_key(s: &str) -> Result<[u8; 32]> {
    let mut bytes = hex::decode(s).context("expected hex")?;
    let key: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected 32 bytes, got {}", bytes.len()))?;
    bytes.zeroize();
    Ok(key)
}
